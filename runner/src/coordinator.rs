use crate::{
    backends::{Backend, Backends, JobRequest, SubmissionError, WorkerCommand},
    config::{ConfigError, RunConfig},
    filter::FilterSpec,
    genotype::{self, DeriveError, GenotypeError},
    intervals::{derive_exonic_snps, IntervalError},
    ledger::{Ledger, LedgerError, PartitionStatus, LEDGER_FILE},
    marker::marker_path,
    partition::{partition, PartitionError},
    poller::{PendingJob, PollError, Poller},
    worker::{self, WorkerConfig, WorkerError},
};
use std::{
    collections::BTreeSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    thread,
    time::UNIX_EPOCH,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const SPLIT_DIR: &str = "split_files";
pub const LOG_DIR: &str = "logs";
pub const EXONIC_SNPS_FILE: &str = "exonic_snps.bed";

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Derive(#[from] DeriveError),
    #[error(transparent)]
    Intervals(#[from] IntervalError),
    #[error(transparent)]
    Genotype(#[from] GenotypeError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("Submission of partition {partition} failed: {source}")]
    Submission {
        partition: usize,
        #[source]
        source: SubmissionError,
    },
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Failed to prepare directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CoordinatorError {
    /// errors raised before any work was started
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Configuring,
    Distributing,
    RunningLocal,
    Aggregating,
    Done,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Configuring => "configuring",
            Self::Distributing => "distributing",
            Self::RunningLocal => "running locally",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
        })
    }
}

/// Cohort-level outcome of a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub individuals_processed: usize,
    pub not_found: BTreeSet<String>,
}

/// Inputs settled during configuration
#[derive(Debug)]
struct Prepared {
    matrix: PathBuf,
    intervals: PathBuf,
    filter: FilterSpec,
    not_found: BTreeSet<String>,
}

/// Drives a run from configuration to report
#[derive(Debug)]
pub struct Coordinator<B: Backend> {
    config: RunConfig,
    backend: B,
    state: State,
}

impl Coordinator<Backends> {
    /// coordinator using the backend named in the configuration
    pub fn load(config: RunConfig) -> Self {
        let backend = Backends::load(&config.cluster);

        Self::new(config, backend)
    }
}

/// path, size and modification time, enough to notice an input rewritten in place
fn input_stamp(path: &Path) -> String {
    match fs::metadata(path) {
        Ok(metadata) => {
            let modified = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |since| since.as_nanos());

            format!("{path:?}:{}:{modified}", metadata.len())
        }
        Err(_) => format!("{path:?}:missing"),
    }
}

fn create_dir(path: &Path) -> Result<(), CoordinatorError> {
    fs::create_dir_all(path).map_err(|source| CoordinatorError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

impl<B: Backend> Coordinator<B> {
    pub fn new(config: RunConfig, backend: B) -> Self {
        Self {
            config,
            backend,
            state: State::Configuring,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn transition(&mut self, state: State) {
        info!("Coordinator {} -> {}", self.state, state);
        self.state = state;
    }

    #[instrument(skip(self), level = "info")]
    pub fn run(&mut self) -> Result<Report, CoordinatorError> {
        let prepared = self.configure()?;

        let individuals_processed = if self.config.cluster.jobs > 1 {
            self.transition(State::Distributing);
            self.distribute(&prepared)?
        } else {
            self.transition(State::RunningLocal);
            self.run_local(&prepared)?
        };

        self.transition(State::Aggregating);
        let report = Report {
            individuals_processed,
            not_found: prepared.not_found,
        };

        self.transition(State::Done);

        Ok(report)
    }

    /// validate inputs and settle the matrix, the interval file and the filter
    fn configure(&mut self) -> Result<Prepared, CoordinatorError> {
        self.config.preflight_checks()?;
        self.config.absolutize()?;
        let filter = FilterSpec::build(&self.config.filter)?;

        create_dir(&self.config.output_dir)?;
        create_dir(self.config.work_dir())?;

        let intervals = match (
            &self.config.intervals.exonic_snps,
            &self.config.intervals.snps,
            &self.config.intervals.exons,
        ) {
            (Some(exonic), _, _) => exonic.clone(),
            (None, Some(snps), Some(exons)) => {
                let output = self.config.work_dir().join(EXONIC_SNPS_FILE);
                derive_exonic_snps(snps, exons, &output)?;

                output
            }
            // preflight_checks rejects every other combination
            _ => return Err(ConfigError::Preflight.into()),
        };

        let matrix = genotype::derive(&self.config.genotype, &self.config.plink)?;
        let observed = genotype::individuals(&matrix)?;
        let resolution = filter.resolve(&observed)?;

        info!(
            individuals = observed.len(),
            kept = resolution.kept.len(),
            "Resolved individuals"
        );

        Ok(Prepared {
            matrix,
            intervals,
            filter,
            not_found: resolution.not_found,
        })
    }

    fn worker_config(&self, prepared: &Prepared, partition: &Path) -> WorkerConfig {
        WorkerConfig {
            partition: partition.to_path_buf(),
            intervals: prepared.intervals.clone(),
            output_dir: self.config.output_dir.clone(),
            marker: marker_path(self.config.work_dir(), partition),
            gzip: self.config.gzip,
            overwrite: self.config.overwrite,
            filter: prepared.filter.clone(),
            threads: self.config.cluster.resources.cores as usize,
            log_filter: self.config.log_filter.clone(),
        }
    }

    /// the whole matrix as a single in-process partition
    fn run_local(&mut self, prepared: &Prepared) -> Result<usize, CoordinatorError> {
        let config = self.worker_config(prepared, &prepared.matrix);
        let marker = worker::run(&config)?;

        if let Err(error) = fs::remove_file(&config.marker) {
            warn!(error = ?error, path = ?config.marker, "Failed to remove completion marker");
        }

        Ok(marker.individuals)
    }

    /// identifies a run in the ledger, a changed input means the old ledger is useless
    ///
    /// Derived files are rewritten on every run, so the configured sources are stamped instead.
    fn fingerprint(&self, prepared: &Prepared) -> String {
        let intervals = &self.config.intervals;
        let sources = [&intervals.exonic_snps, &intervals.snps, &intervals.exons]
            .into_iter()
            .flatten()
            .map(|path| input_stamp(path))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "genotype={};intervals={};jobs={};output={:?};gzip={};filter={:?}",
            input_stamp(&self.config.genotype),
            sources,
            self.config.cluster.jobs,
            self.config.output_dir,
            self.config.gzip,
            prepared.filter
        )
    }

    fn distribute(&mut self, prepared: &Prepared) -> Result<usize, CoordinatorError> {
        let work_dir = self.config.work_dir().to_path_buf();
        let log_dir = work_dir.join(LOG_DIR);
        create_dir(&log_dir)?;

        let executable = self.config.executable()?;
        let partitions = partition(
            &prepared.matrix,
            self.config.cluster.jobs,
            &work_dir.join(SPLIT_DIR),
        )?;

        let mut ledger = Ledger::open(&work_dir.join(LEDGER_FILE))?;
        let resumed = ledger.begin(&self.fingerprint(prepared))?;
        let previous = if resumed {
            ledger.partitions()?
        } else {
            Default::default()
        };

        let mut carried = 0;
        let mut pending = Vec::with_capacity(partitions.len());

        for (position, partition) in partitions.iter().enumerate() {
            let members = genotype::individuals(&partition.path)?.join("\n");
            let finished = previous
                .get(&partition.id)
                .filter(|record| record.status == PartitionStatus::Done)
                .filter(|record| {
                    let same = record.members.as_deref() == Some(members.as_str());
                    if !same {
                        warn!(
                            partition = partition.id,
                            "Partition finished earlier with other individuals, resubmitting"
                        );
                    }

                    same
                });

            if let Some(record) = finished {
                let individuals = record.individuals.unwrap_or(partition.individuals);
                info!(
                    partition = partition.id,
                    individuals, "Partition finished in an earlier attempt, skipping"
                );
                carried += individuals;

                if let Err(error) = fs::remove_file(&partition.path) {
                    warn!(error = ?error, path = ?partition.path, "Failed to remove partition");
                }

                continue;
            }

            let config = self.worker_config(prepared, &partition.path);
            let config_path = partition.path.with_extension("yaml");
            config.save(&config_path)?;

            // a marker left over from an earlier attempt would be counted twice
            if config.marker.exists() {
                debug!(path = ?config.marker, "Removing stale completion marker");
                if let Err(error) = fs::remove_file(&config.marker) {
                    warn!(error = ?error, path = ?config.marker, "Failed to remove stale marker");
                }
            }

            ledger.assign(partition.id, &members)?;

            let request = JobRequest {
                name: format!("hetsites_{}", partition.id),
                command: WorkerCommand {
                    program: executable.clone(),
                    args: vec![
                        "worker".to_owned(),
                        config_path.to_string_lossy().into_owned(),
                    ],
                },
                resources: self.config.cluster.resources.clone(),
                log_dir: log_dir.clone(),
                work_dir: work_dir.clone(),
            };

            let handle = match self.backend.submit(&request) {
                Ok(handle) => handle,
                Err(source) => {
                    error!(partition = partition.id, error = %source, "Submission failed, aborting run");
                    ledger.set_status(partition.id, PartitionStatus::Failed)?;

                    return Err(CoordinatorError::Submission {
                        partition: partition.id,
                        source,
                    });
                }
            };
            ledger.submitted(partition.id, &handle.0)?;

            pending.push(PendingJob {
                id: partition.id,
                handle,
                marker: config.marker,
                artifacts: vec![partition.path.clone(), config_path],
            });

            if position + 1 < partitions.len() {
                thread::sleep(self.config.cluster.submit_delay());
            }
        }

        info!(
            submitted = pending.len(),
            skipped = partitions.len() - pending.len(),
            "Waiting for partitions"
        );

        let poller = Poller::new(
            self.config.cluster.poll_interval(),
            self.config.cluster.timeout(),
        );
        let aggregate = poller.await_all(pending, &ledger)? + carried;

        ledger.remove()?;
        if let Err(error) = fs::remove_dir(work_dir.join(SPLIT_DIR)) {
            debug!(error = ?error, "Partition directory not removed");
        }

        Ok(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::JobHandle;

    const MATRIX: &str = "FID IID PAT MAT SEX PHENOTYPE rs1:100:A:G_A rs2_C\n\
                          f1 s1 0 0 1 -9 1 0\n\
                          f2 s2 0 0 2 -9 1 1\n\
                          f3 s3 0 0 1 -9 0 1\n\
                          f4 s4 0 0 2 -9 2 2\n";

    const EXONIC: &str = "1\t99\t100\trs1\tA|G\n1\t199\t200\trs2\tC|T\n";

    /// runs the worker in-process, optionally dropping partitions on the floor
    #[derive(Debug, Default)]
    struct InProcess {
        submitted: Vec<String>,
        lose: Vec<String>,
    }

    impl Backend for InProcess {
        fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
            self.submitted.push(request.name.clone());

            if !self.lose.contains(&request.name) {
                let config = WorkerConfig::load(Path::new(&request.command.args[1])).unwrap();
                worker::run(&config).unwrap();
            }

            Ok(JobHandle(request.name.clone()))
        }
    }

    #[derive(Debug)]
    struct Rejecting;

    impl Backend for Rejecting {
        fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
            Err(SubmissionError::Rejected {
                job: request.name.clone(),
                status: 1,
                stderr: "queue closed".to_owned(),
            })
        }
    }

    fn config(dir: &Path, jobs: usize) -> RunConfig {
        let genotype = dir.join("cohort.raw");
        let exonic = dir.join("exonic.bed");
        // a rerun must see the inputs untouched
        if !genotype.exists() {
            fs::write(&genotype, MATRIX).unwrap();
        }
        if !exonic.exists() {
            fs::write(&exonic, EXONIC).unwrap();
        }

        serde_yaml::from_str(&format!(
            "genotype: {}
intervals:
  exonic_snps: {}
output_dir: {}
work_dir: {}
filter:
  keep: s1,s2,s3,s4,s9
cluster:
  jobs: {jobs}
  poll_interval_secs: 0
  timeout_secs: 0
  submit_delay_ms: 0
executable: hetsites
",
            genotype.display(),
            exonic.display(),
            dir.join("out").display(),
            dir.join("work").display(),
        ))
        .unwrap()
    }

    fn outputs(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.join("out"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        names
    }

    #[test]
    fn single_job_runs_in_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut coordinator = Coordinator::new(config(dir.path(), 1), Rejecting);

        let report = coordinator.run().unwrap();

        assert_eq!(report.individuals_processed, 4);
        assert_eq!(report.not_found, BTreeSet::from(["s9".to_owned()]));
        assert_eq!(coordinator.state(), State::Done);
        assert_eq!(
            outputs(dir.path()),
            vec!["s1_snps.bed", "s2_snps.bed", "s3_snps.bed", "s4_snps.bed"]
        );
        assert!(!dir.path().join("work/cohort.raw_done").exists());
    }

    #[test]
    fn distributed_run_matches_local_run() {
        let local = tempfile::tempdir().unwrap();
        let distributed = tempfile::tempdir().unwrap();

        let local_report = Coordinator::new(config(local.path(), 1), Rejecting)
            .run()
            .unwrap();
        let mut coordinator =
            Coordinator::new(config(distributed.path(), 2), InProcess::default());
        let distributed_report = coordinator.run().unwrap();

        assert_eq!(distributed_report, local_report);
        assert_eq!(coordinator.backend.submitted, vec!["hetsites_1", "hetsites_2"]);
        for name in outputs(local.path()) {
            assert_eq!(
                fs::read(local.path().join("out").join(&name)).unwrap(),
                fs::read(distributed.path().join("out").join(&name)).unwrap()
            );
        }

        let work = distributed.path().join("work");
        assert!(!work.join(LEDGER_FILE).exists());
        assert!(!work.join(SPLIT_DIR).exists());
        assert!(!work.join("1_done").exists());
    }

    #[test]
    fn lost_partitions_are_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InProcess {
            lose: vec!["hetsites_2".to_owned()],
            ..InProcess::default()
        };
        let mut coordinator = Coordinator::new(config(dir.path(), 2), backend);

        match coordinator.run() {
            Err(CoordinatorError::Poll(PollError::WorkerLost { incomplete })) => {
                assert_eq!(incomplete, vec![dir.path().join("work/2_done")]);
            }
            other => panic!("expected a lost partition, got {other:?}"),
        }

        let work = dir.path().join("work");
        let records = Ledger::open(&work.join(LEDGER_FILE))
            .unwrap()
            .partitions()
            .unwrap();
        assert_eq!(records[&1].status, PartitionStatus::Done);
        assert_eq!(records[&1].individuals, Some(2));
        assert_eq!(records[&2].status, PartitionStatus::Lost);
        assert!(work.join(SPLIT_DIR).join("2").exists());

        let mut coordinator = Coordinator::new(config(dir.path(), 2), InProcess::default());
        let report = coordinator.run().unwrap();

        assert_eq!(report.individuals_processed, 4);
        assert_eq!(coordinator.backend.submitted, vec!["hetsites_2"]);
        assert!(!work.join(LEDGER_FILE).exists());
    }

    fn unfiltered(dir: &Path) -> RunConfig {
        let mut config = config(dir, 2);
        config.filter.keep = None;

        config
    }

    /// runs two partitions and loses the second one
    fn interrupted(config: RunConfig) {
        let backend = InProcess {
            lose: vec!["hetsites_2".to_owned()],
            ..InProcess::default()
        };

        let result = Coordinator::new(config, backend).run();
        assert!(matches!(
            result,
            Err(CoordinatorError::Poll(PollError::WorkerLost { .. }))
        ));
    }

    #[test]
    fn matrix_rewritten_between_attempts_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        interrupted(unfiltered(dir.path()));

        let mut grown = MATRIX.to_owned();
        grown.push_str("f5 s5 0 0 1 -9 1 1\nf6 s6 0 0 2 -9 0 1\n");
        fs::write(dir.path().join("cohort.raw"), grown).unwrap();

        let mut coordinator = Coordinator::new(unfiltered(dir.path()), InProcess::default());
        let report = coordinator.run().unwrap();

        assert_eq!(report.individuals_processed, 6);
        assert_eq!(coordinator.backend.submitted, vec!["hetsites_1", "hetsites_2"]);
        assert_eq!(
            outputs(dir.path()),
            vec![
                "s1_snps.bed",
                "s2_snps.bed",
                "s3_snps.bed",
                "s4_snps.bed",
                "s5_snps.bed",
                "s6_snps.bed"
            ]
        );
    }

    #[test]
    fn finished_partition_with_other_members_is_resubmitted() {
        let dir = tempfile::tempdir().unwrap();
        interrupted(config(dir.path(), 2));

        {
            let ledger = Ledger::open(&dir.path().join("work").join(LEDGER_FILE)).unwrap();
            ledger.assign(1, "someone_else").unwrap();
            ledger.done(1, 1).unwrap();
        }

        let mut coordinator = Coordinator::new(config(dir.path(), 2), InProcess::default());
        let report = coordinator.run().unwrap();

        assert_eq!(report.individuals_processed, 4);
        assert_eq!(coordinator.backend.submitted, vec!["hetsites_1", "hetsites_2"]);
    }

    #[test]
    fn rejected_submission_aborts_the_run() {
        let dir = tempfile::tempdir().unwrap();

        let result = Coordinator::new(config(dir.path(), 2), Rejecting).run();

        assert!(matches!(
            result,
            Err(CoordinatorError::Submission { partition: 1, .. })
        ));
        let records = Ledger::open(&dir.path().join("work").join(LEDGER_FILE))
            .unwrap()
            .partitions()
            .unwrap();
        assert_eq!(records[&1].status, PartitionStatus::Failed);
        assert!(!records.contains_key(&2));
    }

    #[test]
    fn missing_inputs_are_configuration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), 2);
        config.genotype = dir.path().join("absent.raw");

        let error = Coordinator::new(config, Rejecting).run().unwrap_err();

        assert!(error.is_config());
        assert!(!dir.path().join("out").exists());
    }
}
