use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration is invalid, see the errors above")]
    Preflight,
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Failed to read individual list {path:?}: {source}")]
    NameList {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("A split index requires a split character")]
    SplitIndexWithoutSeparator,
    #[error("A split character requires a split index")]
    SeparatorWithoutSplitIndex,
    #[error("Splitting individual ids requires a keep list")]
    SplitWithoutKeepList,
    #[error("Individual '{name}' has no field {index} when split on '{separator}'")]
    SplitField {
        name: String,
        separator: char,
        index: usize,
    },
    #[error("Walltime '{0}' is not of the form HH:MM:SS")]
    Walltime(String),
    #[error("Backend '{0}' is not supported, use local, torque or slurm")]
    UnsupportedBackend(String),
    #[error("Failed to determine the worker executable: {0}")]
    Executable(#[source] io::Error),
    #[error("Failed to determine the current directory: {0}")]
    WorkingDirectory(#[source] io::Error),
}

/// Raw individual selection flags, validated by `FilterSpec::build`
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    // comma separated names or a path to a newline separated file
    pub keep: Option<String>,
    pub exclude: Option<String>,
    pub split_char: Option<char>,
    pub split_index: Option<usize>,
}

/// Wall-clock limit, written as `HH:MM:SS` for the schedulers
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Walltime(Duration);

impl Walltime {
    pub fn duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for Walltime {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split(':')
            .map(str::parse::<u64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ConfigError::Walltime(value.to_owned()))?;

        match parts[..] {
            [hours, minutes, seconds] if minutes < 60 && seconds < 60 => Ok(Self(
                Duration::from_secs(hours * 3600 + minutes * 60 + seconds),
            )),
            _ => Err(ConfigError::Walltime(value.to_owned())),
        }
    }
}

impl TryFrom<String> for Walltime {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Walltime> for String {
    fn from(value: Walltime) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Walltime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.0.as_secs();

        write!(
            f,
            "{:02}:{:02}:{:02}",
            seconds / 3600,
            (seconds / 60) % 60,
            seconds % 60
        )
    }
}

/// Scheduler profile applied to every submitted partition
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    // target queue/ partition, the scheduler default when absent
    pub queue: Option<String>,
    #[serde(default = "default_walltime")]
    pub walltime: Walltime,
    #[serde(default = "default_memory_mb", alias = "memory")]
    pub memory_mb: u64,
    #[serde(default = "default_cores")]
    pub cores: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            queue: None,
            walltime: default_walltime(),
            memory_mb: default_memory_mb(),
            cores: default_cores(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    Torque,
    Slurm,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "torque" | "pbs" => Ok(Self::Torque),
            "slurm" => Ok(Self::Slurm),
            _ => Err(ConfigError::UnsupportedBackend(value.to_owned())),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    #[serde(default)]
    pub backend: BackendKind,
    // number of partitions, anything above 1 distributes the run
    #[serde(default = "default_jobs")]
    pub jobs: usize,
    #[serde(default)]
    pub resources: ResourceSpec,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    // give up on partitions without a marker after this many seconds, wait forever when absent
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_submit_delay")]
    pub submit_delay_ms: u64,
    // override for the qsub/ sbatch executable
    pub submit_exec: Option<PathBuf>,
    // extra scheduler arguments, e.g. an account
    #[serde(default)]
    pub submit_args: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            jobs: default_jobs(),
            resources: ResourceSpec::default(),
            poll_interval_secs: default_poll_interval(),
            timeout_secs: None,
            submit_delay_ms: default_submit_delay(),
            submit_exec: None,
            submit_args: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_millis(self.submit_delay_ms)
    }
}

/// Where the exonic SNP intervals come from
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct IntervalConfig {
    // precomputed exonic SNP BED, takes precedence over snps/ exons
    pub exonic_snps: Option<PathBuf>,
    // haplotype file with one variant per line
    pub snps: Option<PathBuf>,
    pub exons: Option<PathBuf>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    // additive-coded matrix (.raw) or plink/ vcf input to recode
    pub genotype: PathBuf,
    #[serde(default)]
    pub intervals: IntervalConfig,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    // transient artifacts, defaults to output_dir
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub gzip: bool,
    #[serde(default = "default_overwrite")]
    pub overwrite: bool,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default = "default_plink")]
    pub plink: PathBuf,
    // binary re-invoked as `<executable> worker <config>`, the current executable when absent
    pub executable: Option<PathBuf>,
    // forwarded to workers so remote logs match the coordinator's verbosity
    pub log_filter: Option<String>,
}

impl RunConfig {
    /// configuration with every optional setting at its default
    pub fn new(genotype: PathBuf) -> Self {
        Self {
            genotype,
            intervals: IntervalConfig::default(),
            output_dir: default_output_dir(),
            work_dir: None,
            gzip: false,
            overwrite: default_overwrite(),
            filter: FilterConfig::default(),
            cluster: ClusterConfig::default(),
            plink: default_plink(),
            executable: None,
            log_filter: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.as_deref().unwrap_or(&self.output_dir)
    }

    pub fn executable(&self) -> Result<PathBuf, ConfigError> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().map_err(ConfigError::Executable),
        }
    }

    /// anchor every path a worker uses at the current directory
    ///
    /// Jobs start inside the work directory, so relative paths would resolve somewhere else.
    /// A bare executable name is left alone for the `PATH` lookup.
    pub fn absolutize(&mut self) -> Result<(), ConfigError> {
        let current = std::env::current_dir().map_err(ConfigError::WorkingDirectory)?;
        let anchor = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = current.join(&*path);
            }
        };

        anchor(&mut self.genotype);
        anchor(&mut self.output_dir);
        for path in [
            &mut self.intervals.exonic_snps,
            &mut self.intervals.snps,
            &mut self.intervals.exons,
            &mut self.work_dir,
        ]
        .into_iter()
        .flatten()
        {
            anchor(path);
        }

        if let Some(executable) = self.executable.as_mut() {
            if executable.components().count() > 1 {
                anchor(executable);
            }
        }

        Ok(())
    }

    /// check the whole configuration, logging every problem instead of stopping at the first
    pub fn preflight_checks(&mut self) -> Result<(), ConfigError> {
        let mut contains_error = false;

        if !self.genotype.exists() {
            error!(
                "Genotype input {} does not exist",
                self.genotype.to_string_lossy()
            );
            contains_error = true;
        }

        match (
            &self.intervals.exonic_snps,
            &self.intervals.snps,
            &self.intervals.exons,
        ) {
            (Some(exonic), snps, exons) => {
                if !exonic.is_file() {
                    error!(
                        "Exonic SNP file {} does not exist",
                        exonic.to_string_lossy()
                    );
                    contains_error = true;
                }

                if snps.is_some() || exons.is_some() {
                    warn!("Both precomputed exonic SNPs and a SNP/ exon pair were given, using the precomputed file");
                    self.intervals.snps = None;
                    self.intervals.exons = None;
                }
            }
            (None, Some(snps), Some(exons)) => {
                for (name, path) in [("SNP", snps), ("exon", exons)] {
                    if !path.is_file() {
                        error!("{name} file {} does not exist", path.to_string_lossy());
                        contains_error = true;
                    }
                }
            }
            (None, _, _) => {
                error!("Either an exonic SNP file or both a SNP and an exon file are required");
                contains_error = true;
            }
        }

        if self.cluster.jobs == 0 {
            error!("cluster.jobs must be at least 1");
            contains_error = true;
        }

        if self.cluster.resources.cores == 0 {
            error!("cluster.resources.cores must be at least 1");
            contains_error = true;
        }

        if self.cluster.poll_interval_secs == 0 {
            warn!("cluster.poll_interval_secs is 0, markers will be checked in a tight loop");
        }

        if self.cluster.jobs == 1 && self.cluster.backend != BackendKind::Local {
            warn!("A single job runs in-process, cluster.backend is ignored");
        }

        if let Some(ref filter) = self.filter.keep {
            if filter.trim().is_empty() {
                error!("filter.keep is empty, pass names or a file");
                contains_error = true;
            }
        }

        if contains_error {
            Err(ConfigError::Preflight)
        } else {
            Ok(())
        }
    }
}

fn default_walltime() -> Walltime {
    Walltime(Duration::from_secs(24 * 3600))
}

fn default_memory_mb() -> u64 {
    4000
}

fn default_cores() -> u32 {
    1
}

fn default_jobs() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    30
}

fn default_submit_delay() -> u64 {
    500
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_overwrite() -> bool {
    true
}

fn default_plink() -> PathBuf {
    PathBuf::from("plink")
}
