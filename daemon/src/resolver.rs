use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A directory that was verified to contain the companion service's entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationPath {
    dir: PathBuf,
    entry_point: PathBuf,
}

impl InstallationPath {
    /// Installation directory; used as the child's working directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path to the entry-point file.
    pub fn entry_point(&self) -> &Path {
        &self.entry_point
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot inspect {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Searches an ordered candidate list for an installation.
#[derive(Debug, Clone)]
pub struct PathResolver {
    candidates: Vec<PathBuf>,
    entry_point: String,
}

impl PathResolver {
    pub fn new(candidates: Vec<PathBuf>, entry_point: impl Into<String>) -> Self {
        Self {
            candidates,
            entry_point: entry_point.into(),
        }
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Returns the first candidate containing the entry point, `Ok(None)` if none does.
    ///
    /// A genuine I/O failure on one candidate does not stop the search; it is
    /// returned only when no later candidate matches, so a broken download
    /// folder never hides a valid install in the home folder.
    pub fn resolve(&self) -> Result<Option<InstallationPath>, ResolveError> {
        let mut first_error = None;

        for dir in &self.candidates {
            let entry_point = dir.join(&self.entry_point);
            match std::fs::metadata(&entry_point) {
                Ok(meta) if meta.is_file() => {
                    tracing::debug!("Found companion service at {}", dir.display());
                    return Ok(Some(InstallationPath {
                        dir: dir.clone(),
                        entry_point,
                    }));
                }
                Ok(_) => {
                    tracing::debug!("{} exists but is not a file", entry_point.display());
                }
                Err(e) if is_absent(&e) => {
                    tracing::trace!("No entry point at {}", entry_point.display());
                }
                Err(e) => {
                    tracing::warn!("Cannot inspect {}: {e}", entry_point.display());
                    if first_error.is_none() {
                        first_error = Some(ResolveError::Io {
                            path: entry_point,
                            source: e,
                        });
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(None),
        }
    }
}

/// Missing files and missing parent directories both mean "not installed here".
fn is_absent(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::NotFound {
        return true;
    }
    // ENOTDIR: a path component is a regular file.
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOTDIR) {
            return true;
        }
    }
    false
}
