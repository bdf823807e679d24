//! Durable record of which files of a batch reached a terminal outcome.
//!
//! One hidden JSON document per batch root. Saves go through a temp file in
//! the same directory followed by a rename, so readers only ever observe a
//! complete document.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use crate::config::{Mode, RunConfig};
use crate::error::{BatchError, BatchResult};
use crate::job::{Job, JobIdentity};
use crate::outcome::Outcome;

/// Checkpoint filename inside the batch root
pub const CHECKPOINT_FILE: &str = ".mkvbatch_checkpoint.json";

pub const CHECKPOINT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFile {
    #[serde(flatten)]
    pub identity: JobIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    #[serde(flatten)]
    pub identity: JobIdentity,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    #[serde(flatten)]
    pub identity: JobIdentity,
    pub reason: String,
}

/// Outcome lists in completion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFiles {
    #[serde(default)]
    pub successful: Vec<ProcessedFile>,
    #[serde(default)]
    pub failed: Vec<FailedFile>,
    #[serde(default)]
    pub skipped: Vec<SkippedFile>,
}

/// Persisted state of one checkpointed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub mode: Mode,
    pub languages: Vec<String>,
    pub directory: PathBuf,
    pub recursive: bool,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    pub total_files: usize,
    pub processed: ProcessedFiles,
    pub checkpoint_version: String,
}

/// Counts shown to the operator before resuming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeStats {
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub processed: usize,
    /// `total - processed`; negative when the file set shrank between runs
    pub remaining: i64,
    pub total: usize,
}

impl ResumeStats {
    pub fn remaining_clamped(&self) -> usize {
        self.remaining.max(0) as usize
    }
}

impl Checkpoint {
    pub fn new(cfg: &RunConfig, total_files: usize) -> Self {
        let now = Utc::now();
        Self {
            mode: cfg.mode,
            languages: cfg.languages.clone(),
            directory: cfg.dir.clone(),
            recursive: cfg.recursive,
            started_at: now,
            last_checkpoint: now,
            total_files,
            processed: ProcessedFiles::default(),
            checkpoint_version: CHECKPOINT_VERSION.to_string(),
        }
    }

    /// Why this checkpoint cannot be resumed under `cfg`, if it can't
    pub fn mismatch(&self, cfg: &RunConfig) -> Option<String> {
        if self.mode != cfg.mode {
            return Some(format!("mode {} != {}", self.mode, cfg.mode));
        }
        if self.recursive != cfg.recursive {
            return Some(format!("recursive {} != {}", self.recursive, cfg.recursive));
        }
        if !same_language_set(&self.languages, &cfg.languages) {
            return Some(format!("languages {:?} != {:?}", self.languages, cfg.languages));
        }
        None
    }

    pub fn can_resume(&self, cfg: &RunConfig) -> bool {
        self.mismatch(cfg).is_none()
    }

    fn identities(&self) -> impl Iterator<Item = &JobIdentity> {
        let p = &self.processed;
        p.successful
            .iter()
            .map(|f| &f.identity)
            .chain(p.failed.iter().map(|f| &f.identity))
            .chain(p.skipped.iter().map(|f| &f.identity))
    }

    fn contains(&self, identity: &JobIdentity) -> bool {
        self.identities().any(|recorded| recorded.matches(identity))
    }

    /// True when the file's fingerprint or literal base name is in any list
    pub fn is_processed(&self, path: &Path) -> bool {
        self.contains(&JobIdentity::from_path(path))
    }

    pub fn processed_count(&self) -> usize {
        self.processed.successful.len() + self.processed.failed.len() + self.processed.skipped.len()
    }

    pub fn stats(&self) -> ResumeStats {
        let processed = self.processed_count();
        ResumeStats {
            successful: self.processed.successful.len(),
            failed: self.processed.failed.len(),
            skipped: self.processed.skipped.len(),
            processed,
            remaining: self.total_files as i64 - processed as i64,
            total: self.total_files,
        }
    }
}

/// Order-insensitive comparison of two language lists
pub fn same_language_set(a: &[String], b: &[String]) -> bool {
    let a: BTreeSet<&str> = a.iter().map(String::as_str).collect();
    let b: BTreeSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

/// Owns the checkpoint file of one batch root and its in-memory copy
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    checkpoint: Option<Checkpoint>,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CHECKPOINT_FILE),
            checkpoint: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Read the checkpoint file. A missing file is `Ok(None)`, not an error.
    pub fn load(&mut self) -> BatchResult<Option<&Checkpoint>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BatchError::Persistence {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let checkpoint: Checkpoint =
            serde_json::from_slice(&data).map_err(|source| BatchError::Decode {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            "Loaded checkpoint {} ({} of {} recorded)",
            self.path.display(),
            checkpoint.processed_count(),
            checkpoint.total_files
        );
        self.checkpoint = Some(checkpoint);
        Ok(self.checkpoint.as_ref())
    }

    /// Start a fresh checkpoint and persist it right away
    pub fn create(&mut self, cfg: &RunConfig, total_files: usize) -> BatchResult<()> {
        self.checkpoint = Some(Checkpoint::new(cfg, total_files));
        self.save()
    }

    /// Atomically persist the in-memory checkpoint
    pub fn save(&mut self) -> BatchResult<()> {
        let checkpoint = self
            .checkpoint
            .as_mut()
            .ok_or(BatchError::NoActiveCheckpoint)?;
        checkpoint.last_checkpoint = Utc::now();

        let data = serde_json::to_vec_pretty(checkpoint).map_err(BatchError::Encode)?;
        write_atomic(&self.path, &data)
    }

    pub fn add_success(&mut self, path: &Path) -> BatchResult<()> {
        let identity = self.unrecorded(path)?;
        self.active_mut()?
            .processed
            .successful
            .push(ProcessedFile { identity });
        Ok(())
    }

    pub fn add_failed(&mut self, path: &Path, error: &str) -> BatchResult<()> {
        let identity = self.unrecorded(path)?;
        self.active_mut()?.processed.failed.push(FailedFile {
            identity,
            error: error.to_string(),
        });
        Ok(())
    }

    pub fn add_skipped(&mut self, path: &Path, reason: &str) -> BatchResult<()> {
        let identity = self.unrecorded(path)?;
        self.active_mut()?.processed.skipped.push(SkippedFile {
            identity,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Append the outcome to the matching list
    pub fn record(&mut self, path: &Path, outcome: &Outcome) -> BatchResult<()> {
        match outcome {
            Outcome::Success => self.add_success(path),
            Outcome::Skipped(reason) => self.add_skipped(path, reason),
            Outcome::Failed(error) => self.add_failed(path, error),
        }
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        self.checkpoint
            .as_ref()
            .map(|cp| cp.is_processed(path))
            .unwrap_or(false)
    }

    pub fn can_resume(&self, cfg: &RunConfig) -> bool {
        self.checkpoint
            .as_ref()
            .map(|cp| cp.can_resume(cfg))
            .unwrap_or(false)
    }

    pub fn processed_count(&self) -> usize {
        self.checkpoint
            .as_ref()
            .map(Checkpoint::processed_count)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> ResumeStats {
        self.checkpoint
            .as_ref()
            .map(Checkpoint::stats)
            .unwrap_or_default()
    }

    /// Drop jobs whose identity already has a recorded outcome
    pub fn filter_processed(&self, jobs: Vec<Job>) -> Vec<Job> {
        match &self.checkpoint {
            Some(cp) => jobs.into_iter().filter(|j| !cp.is_processed(&j.path)).collect(),
            None => jobs,
        }
    }

    /// Delete the checkpoint file; a missing file is fine
    pub fn clear(&mut self) -> BatchResult<()> {
        self.checkpoint = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BatchError::Persistence {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn active_mut(&mut self) -> BatchResult<&mut Checkpoint> {
        self.checkpoint.as_mut().ok_or(BatchError::NoActiveCheckpoint)
    }

    fn unrecorded(&self, path: &Path) -> BatchResult<JobIdentity> {
        let checkpoint = self.checkpoint.as_ref().ok_or(BatchError::NoActiveCheckpoint)?;
        let identity = JobIdentity::from_path(path);
        if checkpoint.contains(&identity) {
            return Err(BatchError::AlreadyRecorded(identity.name));
        }
        Ok(identity)
    }
}

/// Load the checkpoint in `cfg.dir` and report whether it matches `cfg`
pub fn can_resume(cfg: &RunConfig) -> BatchResult<bool> {
    let mut store = CheckpointStore::new(&cfg.dir);
    Ok(store.load()?.map(|cp| cp.can_resume(cfg)).unwrap_or(false))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from(CHECKPOINT_FILE));
    name.push(".tmp");
    path.with_file_name(name)
}

fn persistence(path: &Path) -> impl FnOnce(std::io::Error) -> BatchError {
    let path = path.to_path_buf();
    move |source| BatchError::Persistence { path, source }
}

fn write_atomic(path: &Path, data: &[u8]) -> BatchResult<()> {
    let tmp = temp_path(path);

    {
        let mut file = fs::File::create(&tmp).map_err(persistence(&tmp))?;
        file.write_all(data).map_err(persistence(&tmp))?;
        file.sync_all().map_err(persistence(&tmp))?;
    }

    fs::rename(&tmp, path).map_err(persistence(path))
}
