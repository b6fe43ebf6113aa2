use crate::io::open_reader;
use itertools::Itertools;
use std::{
    ffi::OsStr,
    io::{self, BufRead, Lines},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument};

/// FID IID PAT MAT SEX PHENOTYPE precede the genotype columns of an additive-coded matrix
pub const META_COLUMNS: usize = 6;

/// position of the individual id (IID) in a matrix row
const IID_COLUMN: usize = 1;

/// additive coding of a heterozygous call
const HETEROZYGOUS: &str = "1";

#[derive(Error, Debug)]
pub enum GenotypeError {
    #[error("Failed to access genotype matrix {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Genotype matrix {0:?} has no header line")]
    MissingHeader(PathBuf),
    #[error("{path:?}:{line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum DeriveError {
    #[error("Unsupported genotype format for {0:?}, expected .raw, .bed/.bim/.fam, .ped/.map or .vcf[.gz]")]
    UnsupportedFormat(PathBuf),
    #[error("Failed to run plink")]
    Spawn(#[from] io::Error),
    #[error("plink exited with {status}: {stderr}")]
    Plink { status: i32, stderr: String },
    #[error("plink finished but {0:?} was not created")]
    MissingOutput(PathBuf),
}

/// strip `_<allele>` from a matrix column and cut the identifier at the first `:`
pub fn site_name(column: &str) -> &str {
    let without_allele = column
        .rsplit_once('_')
        .map_or(column, |(site, _allele)| site);

    without_allele
        .split(':')
        .next()
        .unwrap_or(without_allele)
}

/// Inputs accepted by `derive` and how plink has to be pointed at them
fn plink_input(raw: &Path) -> Option<(&'static str, PathBuf, PathBuf)> {
    let file_name = raw.file_name()?.to_str()?;

    if let Some(prefix) = file_name
        .strip_suffix(".vcf.gz")
        .or_else(|| file_name.strip_suffix(".vcf"))
    {
        return Some(("--vcf", raw.to_path_buf(), raw.with_file_name(prefix)));
    }

    let prefix = raw.with_extension("");
    match raw.extension().and_then(OsStr::to_str) {
        Some("bed" | "bim" | "fam") => Some(("--bfile", prefix.clone(), prefix)),
        Some("ped" | "map") => Some(("--file", prefix.clone(), prefix)),
        _ => None,
    }
}

/// Return the additive-coded matrix for `raw`, running `plink --recode A` unless it exists already
#[instrument(level = "info")]
pub fn derive(raw: &Path, plink: &Path) -> Result<PathBuf, DeriveError> {
    let file_name = raw.file_name().and_then(OsStr::to_str).unwrap_or("");
    if file_name.ends_with(".raw") || file_name.ends_with(".raw.gz") {
        return Ok(raw.to_path_buf());
    }

    let (flag, input, prefix) =
        plink_input(raw).ok_or_else(|| DeriveError::UnsupportedFormat(raw.to_path_buf()))?;
    let mut derived = prefix.clone().into_os_string();
    derived.push(".raw");
    let derived = PathBuf::from(derived);

    if derived.is_file() {
        info!(path = ?derived, "Reusing existing additive-coded matrix");

        return Ok(derived);
    }

    info!(input = ?input, "Recoding genotypes with plink");
    let output = Command::new(plink)
        .arg(flag)
        .arg(&input)
        .args(["--recode", "A", "--out"])
        .arg(&prefix)
        .stdin(Stdio::null())
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        error!(stderr = %stderr, "plink failed to recode {input:?}");

        return Err(DeriveError::Plink {
            status: output.status.code().unwrap_or(-1),
            stderr,
        });
    }

    if derived.is_file() {
        Ok(derived)
    } else {
        Err(DeriveError::MissingOutput(derived))
    }
}

/// Header of an additive-coded matrix
#[derive(Debug, Clone)]
pub struct Header {
    pub line: String,
    pub sites: Vec<String>,
}

impl Header {
    pub fn parse(line: &str) -> Self {
        Self {
            line: line.trim_end().to_owned(),
            sites: line
                .split_whitespace()
                .skip(META_COLUMNS)
                .map(|column| site_name(column).to_owned())
                .collect(),
        }
    }
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> GenotypeError + '_ {
    move |source| GenotypeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// read the header and hand back the remaining lines
pub fn open_matrix(path: &Path) -> Result<(Header, Lines<Box<dyn BufRead + Send>>), GenotypeError> {
    let mut lines = open_reader(path).map_err(io_error(path))?.lines();

    match lines.next() {
        Some(line) => Ok((Header::parse(&line.map_err(io_error(path))?), lines)),
        None => Err(GenotypeError::MissingHeader(path.to_path_buf())),
    }
}

/// individual ids (IID column) in matrix order
pub fn individuals(path: &Path) -> Result<Vec<String>, GenotypeError> {
    let (_, lines) = open_matrix(path)?;

    lines
        .enumerate()
        .filter_map(|(number, line)| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                line.split_whitespace()
                    .nth(IID_COLUMN)
                    .map(str::to_owned)
                    .ok_or_else(|| GenotypeError::Malformed {
                        path: path.to_path_buf(),
                        line: number + 2,
                        reason: "missing individual id".to_owned(),
                    }),
            ),
            Err(source) => Some(Err(io_error(path)(source))),
        })
        .collect()
}

/// One individual's heterozygous sites, as indices into `Header::sites`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndividualSites {
    pub name: String,
    pub sites: Vec<usize>,
}

/// Lazy stream over the individuals of a matrix
///
/// Every call to `heterozygous_sites` opens the file again, so partitions can be re-read
/// independently.
pub struct HeterozygousSites {
    path: PathBuf,
    header: Header,
    lines: Lines<Box<dyn BufRead + Send>>,
    line: usize,
}

#[instrument(level = "debug")]
pub fn heterozygous_sites(path: &Path) -> Result<HeterozygousSites, GenotypeError> {
    let (header, lines) = open_matrix(path)?;
    debug!(sites = header.sites.len(), "Opened genotype matrix");

    Ok(HeterozygousSites {
        path: path.to_path_buf(),
        header,
        lines,
        line: 1,
    })
}

impl HeterozygousSites {
    pub fn header(&self) -> &Header {
        &self.header
    }

    fn parse_row(&self, row: &str) -> Result<IndividualSites, GenotypeError> {
        let fields = row.split_whitespace().collect_vec();
        let expected = META_COLUMNS + self.header.sites.len();

        if fields.len() != expected {
            return Err(GenotypeError::Malformed {
                path: self.path.clone(),
                line: self.line,
                reason: format!("expected {expected} columns, found {}", fields.len()),
            });
        }

        Ok(IndividualSites {
            name: fields[IID_COLUMN].to_owned(),
            sites: fields[META_COLUMNS..]
                .iter()
                .positions(|value| *value == HETEROZYGOUS)
                .collect(),
        })
    }
}

impl Iterator for HeterozygousSites {
    type Item = Result<IndividualSites, GenotypeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.line += 1;

            match self.lines.next()? {
                Ok(row) if row.trim().is_empty() => continue,
                Ok(row) => return Some(self.parse_row(&row)),
                Err(source) => return Some(Err(io_error(&self.path)(source))),
            }
        }
    }
}
