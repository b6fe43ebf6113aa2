use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const MARKER_VERSION: u32 = 1;

/// suffix appended to a partition's file name to get its marker
pub const DONE_SUFFIX: &str = "_done";

const LEGACY_PREFIX: &str = "Completed ";
const LEGACY_SUFFIX: &str = " individuals.";

#[derive(Error, Debug)]
pub enum MarkerError {
    #[error("Failed to access completion marker {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Completion marker {path:?} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("Completion marker {path:?} has version {version}, this build understands up to {MARKER_VERSION}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
}

/// Record left behind by a worker once every individual file of its partition is flushed
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CompletionMarker {
    pub version: u32,
    pub partition: PathBuf,
    pub individuals: usize,
    pub host: Option<String>,
}

/// `<dir>/<partition file name>_done`
pub fn marker_path(dir: &Path, partition: &Path) -> PathBuf {
    let mut name = partition
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(DONE_SUFFIX);

    dir.join(name)
}

fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
}

impl CompletionMarker {
    pub fn new(partition: &Path, individuals: usize) -> Self {
        Self {
            version: MARKER_VERSION,
            partition: partition.to_path_buf(),
            individuals,
            host: hostname(),
        }
    }

    /// write to a temporary sibling first and rename it into place
    ///
    /// rename is atomic within a filesystem, so an existing marker is always complete.
    pub fn write(&self, path: &Path) -> Result<(), MarkerError> {
        let io_error = |source| MarkerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut staging = path.as_os_str().to_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let content = serde_yaml::to_string(self).map_err(|error| MarkerError::Malformed {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;

        let mut file = fs::File::create(&staging).map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);

        fs::rename(&staging, path).map_err(io_error)?;
        debug!(path = ?path, individuals = self.individuals, "Wrote completion marker");

        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, MarkerError> {
        let content = fs::read_to_string(path).map_err(|source| MarkerError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }

    /// parse either the structured format or the legacy `Completed <N> individuals.` line
    pub fn parse(content: &str, path: &Path) -> Result<Self, MarkerError> {
        let first_line = content.lines().next().unwrap_or("").trim();

        if let Some(count) = first_line
            .strip_prefix(LEGACY_PREFIX)
            .and_then(|rest| rest.strip_suffix(LEGACY_SUFFIX))
        {
            let individuals = count.parse().map_err(|_| MarkerError::Malformed {
                path: path.to_path_buf(),
                reason: format!("'{count}' is not a count"),
            })?;

            return Ok(Self {
                version: 0,
                partition: PathBuf::new(),
                individuals,
                host: None,
            });
        }

        let marker: Self =
            serde_yaml::from_str(content).map_err(|error| MarkerError::Malformed {
                path: path.to_path_buf(),
                reason: error.to_string(),
            })?;

        if marker.version > MARKER_VERSION {
            return Err(MarkerError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: marker.version,
            });
        }

        Ok(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_marker_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let partition = dir.path().join("split_files").join("3");
        let path = marker_path(dir.path(), &partition);

        assert_eq!(path, dir.path().join("3_done"));

        let marker = CompletionMarker::new(&partition, 42);
        marker.write(&path).unwrap();

        assert_eq!(CompletionMarker::read(&path).unwrap(), marker);
        assert!(!dir.path().join("3_done.tmp").exists());
    }

    #[test]
    fn legacy_line_is_understood() {
        let marker =
            CompletionMarker::parse("Completed 17 individuals.\n", Path::new("1_done")).unwrap();

        assert_eq!(marker.individuals, 17);
        assert_eq!(marker.version, 0);
        assert!(CompletionMarker::parse("Completed many individuals.", Path::new("x")).is_err());
    }

    #[test]
    fn newer_versions_are_refused() {
        let result = CompletionMarker::parse(
            "version: 9\npartition: split_files/1\nindividuals: 2\nhost: null\n",
            Path::new("1_done"),
        );

        assert!(matches!(
            result,
            Err(MarkerError::UnsupportedVersion { version: 9, .. })
        ));
        assert!(CompletionMarker::parse("", Path::new("1_done")).is_err());
    }
}
