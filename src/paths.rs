//! Bundled file discovery
//!
//! Executables, installer tooling and the vendor adapter library ship next to
//! the application in one of several layouts. Each lookup probes an ordered
//! list of directories relative to the application directory and returns the
//! first existing match.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::PathSettings;

/// Directory holding the running executable, or `.` when it cannot be determined
pub fn current_app_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Probes candidate directories for bundled files
#[derive(Debug, Clone)]
pub struct BundleLocator {
    app_dir: PathBuf,
    search_working_dir: bool,
}

impl BundleLocator {
    pub fn new(app_dir: PathBuf, search_working_dir: bool) -> Self {
        Self {
            app_dir,
            search_working_dir,
        }
    }

    pub fn from_settings(settings: &PathSettings) -> Self {
        Self::new(settings.resolved_app_dir(), settings.search_working_dir)
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    /// All candidate locations for `file_name`, in probe order
    pub fn candidates(&self, dirs: &[PathBuf], file_name: &str) -> Vec<PathBuf> {
        let mut roots = vec![self.app_dir.clone()];
        if self.search_working_dir {
            if let Ok(cwd) = std::env::current_dir() {
                if cwd != self.app_dir {
                    roots.push(cwd);
                }
            }
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        for root in &roots {
            for dir in dirs {
                let path = if dir.is_absolute() {
                    dir.join(file_name)
                } else {
                    root.join(dir).join(file_name)
                };
                if !candidates.contains(&path) {
                    candidates.push(path);
                }
            }
        }
        candidates
    }

    /// First existing candidate for `file_name`
    pub fn find(&self, dirs: &[PathBuf], file_name: &str) -> Option<PathBuf> {
        for candidate in self.candidates(dirs, file_name) {
            if candidate.is_file() {
                debug!("Found {} at {:?}", file_name, candidate);
                return Some(candidate);
            }
        }
        debug!("{} not found in {} candidate directories", file_name, dirs.len());
        None
    }
}
