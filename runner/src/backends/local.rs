use super::{Backend, JobHandle, JobRequest, SubmissionError};
use std::{fs::File, process::Stdio};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Runs each job as a child process and waits for it before returning
///
/// The walltime is enforced by killing the child. A failing job is not a submission error, its
/// missing marker is what the poller reports.
#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LocalBackend {
    #[instrument(skip_all, fields(job = %request.name), level = "info")]
    fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let open_log = |path: std::path::PathBuf| {
            File::create(&path).map_err(|source| SubmissionError::Log { path, source })
        };
        let stdout = open_log(request.stdout_path())?;
        let stderr = open_log(request.stderr_path())?;

        let mut child = request
            .command
            .command()
            .current_dir(&request.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| SubmissionError::Spawn {
                exec: request.command.program.clone(),
                source,
            })?;

        let handle = JobHandle(format!("local-{}", child.id()));
        debug!(handle = %handle, "Started local job");

        match child.wait_timeout(request.resources.walltime.duration()) {
            Ok(Some(status)) if status.success() => {
                info!(handle = %handle, "Local job finished");
            }
            Ok(Some(status)) => {
                warn!(handle = %handle, status = ?status.code(), "Local job failed, see {:?}", request.stderr_path());
            }
            Ok(None) => {
                warn!(handle = %handle, walltime = %request.resources.walltime, "Local job exceeded its walltime, killing it");

                if let Err(error) = child.kill().and_then(|_| child.wait()) {
                    error!(error = ?error, "Failed to kill local job");
                }
            }
            Err(error) => {
                error!(error = ?error, handle = %handle, "Failed to wait for local job");
            }
        }

        Ok(handle)
    }
}
