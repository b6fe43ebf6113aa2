use clap::{Args, CommandFactory, Parser, Subcommand};
use hetsites_runner::{
    config::{BackendKind, ConfigError, RunConfig, Walltime},
    coordinator::Coordinator,
    worker::{self, WorkerConfig},
};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Extract exonic heterozygous sites per individual, optionally spread over a cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "hetsites")]
struct Cli {
    #[command(flatten)]
    logging: LogArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct LogArgs {
    /// More output, repeat for trace level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// tracing filter directive, overrides -v and RUST_LOG
    #[arg(long, global = true)]
    log_filter: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the whole cohort, locally or distributed
    Run(Box<RunArgs>),
    /// Process one partition described by a worker config
    Worker {
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// YAML run configuration, flags given as well take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additive-coded matrix (.raw) or plink/ vcf input
    #[arg(short, long, required_unless_present = "config", help_heading = "input data")]
    genotype: Option<PathBuf>,
    /// Precomputed exonic SNP intervals (BED)
    #[arg(long, help_heading = "input data")]
    exonic_snps: Option<PathBuf>,
    /// Haplotype file with one SNP per line
    #[arg(long, requires = "exons", help_heading = "input data")]
    snps: Option<PathBuf>,
    /// Exon intervals (BED)
    #[arg(long, requires = "snps", help_heading = "input data")]
    exons: Option<PathBuf>,
    /// plink executable used to recode non-.raw input
    #[arg(long, help_heading = "input data")]
    plink: Option<PathBuf>,

    #[arg(short, long, help_heading = "output")]
    output_dir: Option<PathBuf>,
    /// Transient files, defaults to the output directory
    #[arg(long, help_heading = "output")]
    work_dir: Option<PathBuf>,
    /// Compress per-individual files
    #[arg(long, help_heading = "output")]
    gzip: bool,
    /// Fail instead of replacing existing per-individual files
    #[arg(long, help_heading = "output")]
    no_overwrite: bool,

    /// Individuals to keep, comma separated or a file with one name per line
    #[arg(long, help_heading = "individuals")]
    keep: Option<String>,
    /// Individuals to skip, comma separated or a file with one name per line
    #[arg(long, help_heading = "individuals")]
    exclude: Option<String>,
    /// Split matrix ids on this character before matching the keep list
    #[arg(long, help_heading = "individuals")]
    split_char: Option<char>,
    /// Field of the split id to match
    #[arg(long, help_heading = "individuals")]
    split_index: Option<usize>,

    /// Number of partitions, more than one distributes the run
    #[arg(short, long, help_heading = "cluster")]
    jobs: Option<usize>,
    /// local, torque or slurm
    #[arg(short, long, help_heading = "cluster")]
    backend: Option<String>,
    #[arg(short, long, help_heading = "cluster")]
    queue: Option<String>,
    /// HH:MM:SS
    #[arg(long, help_heading = "cluster")]
    walltime: Option<String>,
    /// Memory per job in MB
    #[arg(long, help_heading = "cluster")]
    memory: Option<u64>,
    /// Cores per job, also the worker thread count
    #[arg(long, help_heading = "cluster")]
    cores: Option<u32>,
    /// Seconds between completion marker checks
    #[arg(long, help_heading = "cluster")]
    poll_interval: Option<u64>,
    /// Seconds after which unfinished partitions count as lost
    #[arg(long, help_heading = "cluster")]
    timeout: Option<u64>,
}

impl RunArgs {
    /// the YAML configuration (if any) with every given flag applied on top
    fn into_config(self) -> Result<RunConfig, ConfigError> {
        let mut config = match (&self.config, self.genotype.clone()) {
            (Some(path), _) => RunConfig::load(path)?,
            (None, Some(genotype)) => RunConfig::new(genotype),
            // clap enforces one of the two
            (None, None) => return Err(ConfigError::Preflight),
        };

        if let Some(genotype) = self.genotype {
            config.genotype = genotype;
        }
        if self.exonic_snps.is_some() {
            config.intervals.exonic_snps = self.exonic_snps;
        }
        if self.snps.is_some() {
            config.intervals.snps = self.snps;
            config.intervals.exons = self.exons;
        }
        if let Some(plink) = self.plink {
            config.plink = plink;
        }
        if let Some(output_dir) = self.output_dir {
            config.output_dir = output_dir;
        }
        if self.work_dir.is_some() {
            config.work_dir = self.work_dir;
        }
        config.gzip |= self.gzip;
        config.overwrite &= !self.no_overwrite;

        if self.keep.is_some() {
            config.filter.keep = self.keep;
        }
        if self.exclude.is_some() {
            config.filter.exclude = self.exclude;
        }
        if self.split_char.is_some() {
            config.filter.split_char = self.split_char;
        }
        if self.split_index.is_some() {
            config.filter.split_index = self.split_index;
        }

        let cluster = &mut config.cluster;
        if let Some(jobs) = self.jobs {
            cluster.jobs = jobs;
        }
        if let Some(backend) = self.backend {
            cluster.backend = backend.parse::<BackendKind>()?;
        }
        if self.queue.is_some() {
            cluster.resources.queue = self.queue;
        }
        if let Some(walltime) = self.walltime {
            cluster.resources.walltime = walltime.parse::<Walltime>()?;
        }
        if let Some(memory) = self.memory {
            cluster.resources.memory_mb = memory;
        }
        if let Some(cores) = self.cores {
            cluster.resources.cores = cores;
        }
        if let Some(poll_interval) = self.poll_interval {
            cluster.poll_interval_secs = poll_interval;
        }
        if self.timeout.is_some() {
            cluster.timeout_secs = self.timeout;
        }

        Ok(config)
    }
}

/// the first of: --log-filter, the configured filter, RUST_LOG, the -v level
fn log_directive(logging: &LogArgs, configured: Option<&str>) -> String {
    logging
        .log_filter
        .as_deref()
        .or(configured)
        .map(str::to_owned)
        .or_else(|| std::env::var(EnvFilter::DEFAULT_ENV).ok())
        .unwrap_or_else(|| {
            match logging.verbose {
                0 => "info",
                1 => "debug",
                _ => "trace",
            }
            .to_owned()
        })
}

fn init_logging(directive: &str) -> Result<(), String> {
    let filter = EnvFilter::try_new(directive)
        .map_err(|error| format!("Invalid log filter '{directive}': {error}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn config_failure(error: &dyn std::fmt::Display) -> ExitCode {
    eprintln!("{}", Cli::command().render_usage());
    eprintln!("error: {error}");

    ExitCode::from(2)
}

fn run(logging: &LogArgs, args: RunArgs) -> ExitCode {
    let mut config = match args.into_config() {
        Ok(config) => config,
        Err(error) => return config_failure(&error),
    };

    let directive = log_directive(logging, config.log_filter.as_deref());
    if let Err(error) = init_logging(&directive) {
        return config_failure(&error);
    }
    config.log_filter = Some(directive);

    let mut coordinator = Coordinator::load(config);
    match coordinator.run() {
        Ok(report) => {
            if !report.not_found.is_empty() {
                warn!(
                    count = report.not_found.len(),
                    "Requested individuals not found in the genotype matrix: {}",
                    report.not_found.iter().cloned().collect::<Vec<_>>().join(", ")
                );
            }
            println!(
                "Processed {} individuals ({} requested but not found)",
                report.individuals_processed,
                report.not_found.len()
            );

            ExitCode::SUCCESS
        }
        Err(error) if error.is_config() => {
            error!(error = %error, "Configuration rejected");
            config_failure(&error)
        }
        Err(error) => {
            error!(error = %error, state = %coordinator.state(), "Run failed");

            ExitCode::FAILURE
        }
    }
}

fn work(logging: &LogArgs, path: &Path) -> ExitCode {
    let loaded = WorkerConfig::load(path);

    let configured = loaded.as_ref().ok().and_then(|config| config.log_filter.as_deref());
    if let Err(error) = init_logging(&log_directive(logging, configured)) {
        return config_failure(&error);
    }

    let config = match loaded {
        Ok(config) => config,
        Err(error) => {
            error!(error = %error, "Failed to load worker config");

            return ExitCode::from(2);
        }
    };

    match worker::run(&config) {
        Ok(marker) => {
            info!(individuals = marker.individuals, marker = ?config.marker, "Worker finished");

            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = %error, partition = ?config.partition, "Worker failed");

            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    let Cli { logging, command } = Cli::parse();

    match command {
        Commands::Run(args) => run(&logging, *args),
        Commands::Worker { config } => work(&logging, &config),
    }
}
