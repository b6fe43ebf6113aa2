mod local;
mod slurm;
mod torque;


pub use local::LocalBackend;
pub use slurm::SlurmBackend;
pub use torque::TorqueBackend;

use crate::config::{BackendKind, ClusterConfig, ResourceSpec};
use std::{
    fmt,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread::{self, JoinHandle},
};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error("Failed to start {exec:?}: {source}")]
    Spawn {
        exec: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to open job log {path:?}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Scheduler rejected job {job} (status {status}): {stderr}")]
    Rejected {
        job: String,
        status: i32,
        stderr: String,
    },
    #[error("Scheduler accepted job {job} but did not report a job id")]
    MissingJobId { job: String },
}

/// Opaque scheduler id, only used for logging and the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Self-contained command line run by a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// render as a single line for a batch script
    pub fn shell_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .map(|arg| shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);

        command
    }
}

/// quote `arg` for POSIX shells unless it only contains safe characters
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-=:,+@%".contains(c));

    if safe {
        arg.to_owned()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Everything a backend needs to run one partition
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub name: String,
    pub command: WorkerCommand,
    pub resources: ResourceSpec,
    // scheduler stdout/ stderr land here
    pub log_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl JobRequest {
    pub fn stdout_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.out", self.name))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.err", self.name))
    }
}

/// Submits work without waiting for it, completion is only ever observed through markers
pub trait Backend {
    fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError>;
}

/// All supported schedulers
/// (deliberately an enum instead of a trait object, the set is closed)
#[derive(Debug)]
pub enum Backends {
    Local(LocalBackend),
    Torque(TorqueBackend),
    Slurm(SlurmBackend),
}

impl Backends {
    pub fn load(config: &ClusterConfig) -> Self {
        let exec = config.submit_exec.clone();
        let args = config.submit_args.clone();

        match config.backend {
            BackendKind::Local => Self::Local(LocalBackend::new()),
            BackendKind::Torque => Self::Torque(TorqueBackend::new(
                exec.unwrap_or_else(|| PathBuf::from("qsub")),
                args,
            )),
            BackendKind::Slurm => Self::Slurm(SlurmBackend::new(
                exec.unwrap_or_else(|| PathBuf::from("sbatch")),
                args,
            )),
        }
    }
}

impl Backend for Backends {
    fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        match self {
            Self::Local(backend) => backend.submit(request),
            Self::Torque(backend) => backend.submit(request),
            Self::Slurm(backend) => backend.submit(request),
        }
    }
}

/// pipe `script` into a submission command and return its stdout
pub(crate) fn submit_script(
    exec: &Path,
    args: &[String],
    job: &str,
    script: &str,
) -> Result<String, SubmissionError> {
    let spawn_error = |source| SubmissionError::Spawn {
        exec: exec.to_path_buf(),
        source,
    };

    let mut child = Command::new(exec)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;

    // the scheduler may fill its output pipes before it reads the whole script
    let writer = child.stdin.take().map(|mut stdin| {
        let script = script.to_owned();
        // dropping stdin closes the pipe so the scheduler sees the end of the script
        thread::spawn(move || stdin.write_all(script.as_bytes()))
    });

    let output = child.wait_with_output().map_err(spawn_error)?;
    let written = match writer.map(JoinHandle::join) {
        Some(Ok(result)) => result,
        Some(Err(_)) => Err(io::Error::new(
            io::ErrorKind::Other,
            "script writer panicked",
        )),
        None => Ok(()),
    };
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if output.status.success() {
        written.map_err(spawn_error)?;
        debug!(job = job, stdout = %stdout.trim(), "Scheduler accepted job");

        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        error!(job = job, stderr = %stderr, "Scheduler rejected job");

        Err(SubmissionError::Rejected {
            job: job.to_owned(),
            status: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}
