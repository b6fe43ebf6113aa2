use crate::{
    config::ConfigError,
    filter::FilterSpec,
    genotype::{heterozygous_sites, GenotypeError, IndividualSites},
    intervals::{write_intervals, Interval, IntervalError, IntervalSet},
    marker::{CompletionMarker, MarkerError},
};
use rayon::{prelude::*, ThreadPoolBuildError, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

pub const OUTPUT_SUFFIX: &str = "_snps.bed";

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("{0:?} already exists and overwriting is disabled")]
    Exists(PathBuf),
    #[error("Failed to write {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load worker config {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to (de)serialize worker config: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error(transparent)]
    Intervals(#[from] IntervalError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error(transparent)]
    Filter(#[from] ConfigError),
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Marker(#[from] MarkerError),
    #[error("Failed to start worker threads: {0}")]
    ThreadPool(#[from] ThreadPoolBuildError),
}

/// Everything one extraction run needs, always fully populated
///
/// Remote workers receive it as a YAML file next to their partition.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub partition: PathBuf,
    // exonic SNP intervals
    pub intervals: PathBuf,
    pub output_dir: PathBuf,
    pub marker: PathBuf,
    pub gzip: bool,
    pub overwrite: bool,
    pub filter: FilterSpec,
    pub threads: usize,
    pub log_filter: Option<String>,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, WorkerError> {
        let content = fs::read_to_string(path).map_err(|source| WorkerError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), WorkerError> {
        fs::write(path, serde_yaml::to_string(self)?).map_err(|source| WorkerError::Load {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// A per-individual output file, never touched again once written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndividualResult {
    pub name: String,
    pub path: PathBuf,
}

/// `<output_dir>/<name>_snps.bed[.gz]`, path separators in ids are replaced
pub fn output_path(output_dir: &Path, name: &str, gzip: bool) -> PathBuf {
    let mut file_name = name.replace(&['/', '\\'][..], "_");
    file_name.push_str(OUTPUT_SUFFIX);
    if gzip {
        file_name.push_str(".gz");
    }

    output_dir.join(file_name)
}

/// maps every matrix column to the exonic intervals carrying that site's name
fn site_index(sites: &[String], intervals: &IntervalSet) -> Vec<Vec<usize>> {
    let mut by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (index, interval) in intervals.iter().enumerate() {
        if let Some(name) = interval.name.as_deref() {
            by_name.entry(name).or_default().push(index);
        }
    }

    sites
        .iter()
        .map(|site| by_name.get(site.as_str()).cloned().unwrap_or_default())
        .collect()
}

fn write_individual(
    individual: &IndividualSites,
    index: &[Vec<usize>],
    intervals: &[Interval],
    config: &WorkerConfig,
) -> Result<IndividualResult, WriteError> {
    let path = output_path(&config.output_dir, &individual.name, config.gzip);

    if !config.overwrite && path.exists() {
        return Err(WriteError::Exists(path));
    }

    let mut selected: Vec<usize> = individual
        .sites
        .iter()
        .flat_map(|&site| index[site].iter().copied())
        .collect();
    selected.sort_unstable();
    selected.dedup();

    write_intervals(
        selected.iter().map(|&position| &intervals[position]),
        &path,
        config.gzip,
    )
    .map_err(|source| WriteError::Io {
        path: path.clone(),
        source,
    })?;

    trace!(individual = %individual.name, intervals = selected.len(), "Wrote individual");

    Ok(IndividualResult {
        name: individual.name.clone(),
        path,
    })
}

/// Extract the exonic heterozygous sites of every kept individual in one partition
///
/// The completion marker is written only after every individual file is flushed; any error
/// leaves no marker behind.
#[instrument(skip_all, fields(partition = ?config.partition), level = "info")]
pub fn run(config: &WorkerConfig) -> Result<CompletionMarker, WorkerError> {
    let intervals = IntervalSet::read(&config.intervals)?;
    let stream = heterozygous_sites(&config.partition)?;
    let index = site_index(&stream.header().sites, &intervals);

    fs::create_dir_all(&config.output_dir).map_err(|source| WriteError::Io {
        path: config.output_dir.clone(),
        source,
    })?;

    debug!(
        threads = config.threads,
        intervals = intervals.len(),
        "Starting extraction"
    );
    let pool = ThreadPoolBuilder::new()
        .num_threads(config.threads.max(1))
        .build()?;

    let filter = &config.filter;
    let processed = pool.install(|| {
        stream
            .filter_map(|individual| match individual {
                Ok(individual) => match filter.includes(&individual.name) {
                    Ok(true) => Some(Ok(individual)),
                    Ok(false) => None,
                    Err(error) => Some(Err(WorkerError::from(error))),
                },
                Err(error) => Some(Err(WorkerError::from(error))),
            })
            .par_bridge()
            .map(|individual| {
                write_individual(&individual?, &index, intervals.as_slice(), config)?;

                Ok::<usize, WorkerError>(1)
            })
            .try_reduce(|| 0, |left, right| Ok(left + right))
    })?;

    let marker = CompletionMarker::new(&config.partition, processed);
    marker.write(&config.marker)?;

    info!(individuals = processed, "Completed partition");

    Ok(marker)
}
