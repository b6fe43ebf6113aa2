use super::{submit_script, Backend, JobHandle, JobRequest, SubmissionError};
use std::{fmt::Write, path::PathBuf};
use tracing::info;

/// Submits batch scripts with `#SBATCH` directives through `sbatch --parsable`
#[derive(Debug, Clone)]
pub struct SlurmBackend {
    exec: PathBuf,
    args: Vec<String>,
}

impl SlurmBackend {
    pub fn new(exec: PathBuf, mut args: Vec<String>) -> Self {
        args.push("--parsable".to_owned());

        Self { exec, args }
    }

    pub fn render_script(request: &JobRequest) -> String {
        let resources = &request.resources;
        let mut script = String::from("#!/bin/bash\n");

        let _ = writeln!(script, "#SBATCH --job-name={}", request.name);
        if let Some(ref queue) = resources.queue {
            let _ = writeln!(script, "#SBATCH --partition={queue}");
        }
        let _ = writeln!(script, "#SBATCH --time={}", resources.walltime);
        let _ = writeln!(script, "#SBATCH --mem={}M", resources.memory_mb);
        let _ = writeln!(script, "#SBATCH --ntasks=1");
        let _ = writeln!(script, "#SBATCH --cpus-per-task={}", resources.cores);
        let _ = writeln!(script, "#SBATCH --output={}", request.stdout_path().display());
        let _ = writeln!(script, "#SBATCH --error={}", request.stderr_path().display());
        let _ = writeln!(
            script,
            "cd {}",
            super::shell_quote(&request.work_dir.to_string_lossy())
        );
        let _ = writeln!(script, "{}", request.command.shell_line());

        script
    }

    /// `--parsable` prints `<job id>` or `<job id>;<cluster>`
    pub fn parse_job_id(stdout: &str) -> Option<JobHandle> {
        stdout
            .trim()
            .split(';')
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| JobHandle(id.to_owned()))
    }
}

impl Backend for SlurmBackend {
    fn submit(&mut self, request: &JobRequest) -> Result<JobHandle, SubmissionError> {
        let script = Self::render_script(request);
        let stdout = submit_script(&self.exec, &self.args, &request.name, &script)?;
        let handle = Self::parse_job_id(&stdout).ok_or_else(|| SubmissionError::MissingJobId {
            job: request.name.clone(),
        })?;

        info!(job = %request.name, handle = %handle, "Submitted to slurm");

        Ok(handle)
    }
}
