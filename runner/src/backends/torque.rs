use super::{submit_script, Backend, JobHandle, JobRequest, SubmissionError};
use std::{fmt::Write, path::PathBuf};
use tracing::info;

/// Submits batch scripts with `#PBS` directives through `qsub`
#[derive(Debug, Clone)]
pub struct TorqueBackend {
    exec: PathBuf,
    args: Vec<String>,
}

impl TorqueBackend {
    pub fn new(exec: PathBuf, args: Vec<String>) -> Self {
        Self { exec, args }
    }

    pub fn render_script(request: &JobRequest) -> String {
        let resources = &request.resources;
        let mut script = String::from("#!/bin/bash\n");

        // writing into a String cannot fail
        let _ = writeln!(script, "#PBS -N {}", request.name);
        if let Some(ref queue) = resources.queue {
            let _ = writeln!(script, "#PBS -q {queue}");
        }
        let _ = writeln!(script, "#PBS -l walltime={}", resources.walltime);
        let _ = writeln!(script, "#PBS -l mem={}mb", resources.memory_mb);
        let _ = writeln!(script, "#PBS -l nodes=1:ppn={}", resources.cores);
        let _ = writeln!(script, "#PBS -o {}", request.stdout_path().display());
        let _ = writeln!(script, "#PBS -e {}", request.stderr_path().display());
        let _ = writeln!(
            script,
            "cd {}",
            super::shell_quote(&request.work_dir.to_string_lossy())
        );
        let _ = writeln!(script, "{}", request.command.shell_line());

        script
    }

    /// qsub prints the job id (e.g. `1234.headnode`) on its first line
    pub fn parse_job_id(stdout: &str) -> Option<JobHandle> {
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| JobHandle(line.to_owned()))
    }
}

impl Backend for TorqueBackend {
    fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let script = Self::render_script(request);
        let stdout = submit_script(&self.exec, &self.args, &request.name, &script)?;
        let handle = Self::parse_job_id(&stdout).ok_or_else(|| SubmissionError::MissingJobId {
            job: request.name.clone(),
        })?;

        info!(job = %request.name, handle = %handle, "Submitted to torque");

        Ok(handle)
    }
}
