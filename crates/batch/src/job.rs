use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use crate::config::{Mode, RunConfig};

/// One file to run through the per-file operation
#[derive(Debug, Clone)]
pub struct Job {
    pub path: PathBuf,
    pub mode: Mode,
    /// Options shared by every job of the same run
    pub options: Arc<RunConfig>,
}

impl Job {
    pub fn new(path: impl Into<PathBuf>, options: Arc<RunConfig>) -> Self {
        Self {
            path: path.into(),
            mode: options.mode,
            options,
        }
    }

    pub fn file_name(&self) -> String {
        base_name(&self.path)
    }
}

/// Build jobs for every path using the same options
pub fn jobs_for(paths: Vec<PathBuf>, options: Arc<RunConfig>) -> Vec<Job> {
    paths
        .into_iter()
        .map(|path| Job::new(path, Arc::clone(&options)))
        .collect()
}

/// Filename-based identity used for resume matching.
///
/// The name is kept verbatim and the hash is computed from the lower-cased
/// name, so two entries match when either representation matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    pub name: String,
    pub hash: String,
}

impl JobIdentity {
    pub fn from_path(path: &Path) -> Self {
        let name = base_name(path);
        let hash = fingerprint(&name);
        Self { name, hash }
    }

    pub fn matches(&self, other: &JobIdentity) -> bool {
        self.name == other.name || self.hash == other.hash
    }
}

/// 16 hex chars of SHA-256 over the lower-cased base filename
pub fn fingerprint(file_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_name.to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
