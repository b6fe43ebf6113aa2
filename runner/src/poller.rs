use crate::{
    backends::JobHandle,
    ledger::{Ledger, LedgerError, PartitionStatus},
    marker::{CompletionMarker, MarkerError},
};
use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PollError {
    #[error("{} partition(s) produced no completion marker before the deadline: {}", .incomplete.len(), display_paths(.incomplete))]
    WorkerLost { incomplete: Vec<PathBuf> },
    #[error("Failed to read completion marker")]
    Marker(#[from] MarkerError),
    #[error("Failed to update partition ledger")]
    Ledger(#[from] LedgerError),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths.iter().map(|path| path.to_string_lossy()).join(", ")
}

/// A submitted partition whose marker has not been seen yet
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub id: usize,
    pub handle: JobHandle,
    pub marker: PathBuf,
    /// transient inputs removed once the marker is read
    pub artifacts: Vec<PathBuf>,
}

/// Watches the filesystem for completion markers
#[derive(Debug, Clone)]
pub struct Poller {
    interval: Duration,
    deadline: Option<Duration>,
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

impl Poller {
    /// `deadline` bounds the whole wait, `None` waits until every marker shows up
    pub fn new(interval: Duration, deadline: Option<Duration>) -> Self {
        Self { interval, deadline }
    }

    /// block until every job left its marker and return the sum of their counts
    ///
    /// Each observed marker is recorded as done in the ledger, then the marker and the job's
    /// artifacts are deleted, so calling this again after an interruption is harmless.
    #[instrument(skip_all, fields(jobs = jobs.len()), level = "info")]
    pub fn await_all(&self, jobs: Vec<PendingJob>, ledger: &Ledger) -> Result<usize, PollError> {
        let start = Instant::now();
        let total = jobs.len();
        let mut pending = jobs;
        let mut aggregate = 0;
        let mut completed = 0;

        loop {
            let mut still_pending = Vec::with_capacity(pending.len());

            for job in pending {
                if !job.marker.is_file() {
                    still_pending.push(job);
                    continue;
                }

                let marker = CompletionMarker::read(&job.marker)?;
                aggregate += marker.individuals;
                completed += 1;
                ledger.done(job.id, marker.individuals)?;

                for path in job.artifacts.iter().chain(std::iter::once(&job.marker)) {
                    if let Err(error) = remove_if_present(path) {
                        warn!(error = ?error, path = ?path, "Failed to clean up partition artifact");
                    }
                }

                info!(
                    handle = %job.handle,
                    individuals = marker.individuals,
                    host = marker.host.as_deref().unwrap_or("unknown"),
                    "Done with {completed}/{total}"
                );
            }

            pending = still_pending;

            if pending.is_empty() {
                info!("All {total} partitions completed with {aggregate} individuals");

                return Ok(aggregate);
            }

            if let Some(deadline) = self.deadline {
                if start.elapsed() >= deadline {
                    for job in &pending {
                        error!(handle = %job.handle, marker = ?job.marker, "Partition is lost");
                        ledger.set_status(job.id, PartitionStatus::Lost)?;
                    }

                    return Err(PollError::WorkerLost {
                        incomplete: pending.into_iter().map(|job| job.marker).collect(),
                    });
                }
            }

            debug!(
                pending = pending.len(),
                "Waiting {:?} for completion markers", self.interval
            );
            thread::sleep(self.interval);
        }
    }
}
