use crate::{
    genotype::{open_matrix, GenotypeError},
    io::OutputWriter,
};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum PartitionError {
    #[error("The job count has to be at least 1")]
    NoJobs,
    #[error("Cannot split {individuals} individuals into {jobs} non-empty partitions")]
    TooManyJobs { jobs: usize, individuals: usize },
    #[error("Failed to read genotype matrix")]
    Input(#[from] GenotypeError),
    #[error("Failed to write partition {path:?}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Sequential, disjoint slice of the matrix's individuals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenotypePartition {
    /// 1-based, also the file name
    pub id: usize,
    pub path: PathBuf,
    pub individuals: usize,
}

/// sizes of `jobs` sequential groups over `total` rows, the first `total % jobs` get one more
pub fn partition_sizes(total: usize, jobs: usize) -> Vec<usize> {
    let base = total / jobs;
    let remainder = total % jobs;

    (0..jobs)
        .map(|index| base + usize::from(index < remainder))
        .collect()
}

/// Split `input` into exactly `jobs` partition files below `output_dir`
///
/// Every partition repeats the header line so it can be read on its own. The caller owns the
/// files.
#[instrument(level = "info")]
pub fn partition(
    input: &Path,
    jobs: usize,
    output_dir: &Path,
) -> Result<Vec<GenotypePartition>, PartitionError> {
    if jobs == 0 {
        return Err(PartitionError::NoJobs);
    }

    // first pass only counts, the matrix can be much larger than memory
    let (_, rows) = open_matrix(input)?;
    let mut individuals = 0;
    for row in rows {
        let row = row.map_err(|source| GenotypeError::Io {
            path: input.to_path_buf(),
            source,
        })?;

        if !row.trim().is_empty() {
            individuals += 1;
        }
    }

    if jobs > individuals {
        return Err(PartitionError::TooManyJobs { jobs, individuals });
    }

    fs::create_dir_all(output_dir).map_err(|source| PartitionError::Output {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let (header, rows) = open_matrix(input)?;
    let mut rows = rows.filter(|row| !matches!(row, Ok(line) if line.trim().is_empty()));
    let mut partitions = Vec::with_capacity(jobs);

    for (index, size) in partition_sizes(individuals, jobs).into_iter().enumerate() {
        let id = index + 1;
        let path = output_dir.join(id.to_string());
        let output_error = |source| PartitionError::Output {
            path: path.clone(),
            source,
        };

        let mut writer = OutputWriter::create(&path, false).map_err(output_error)?;
        writeln!(writer, "{}", header.line).map_err(output_error)?;

        for row in rows.by_ref().take(size) {
            let row = row.map_err(|source| GenotypeError::Io {
                path: input.to_path_buf(),
                source,
            })?;
            writeln!(writer, "{row}").map_err(output_error)?;
        }

        writer.finish().map_err(output_error)?;
        debug!(path = ?path, individuals = size, "Wrote partition");

        partitions.push(GenotypePartition {
            id,
            path,
            individuals: size,
        });
    }

    info!(
        "Split {individuals} individuals into {} partitions",
        partitions.len()
    );

    Ok(partitions)
}
