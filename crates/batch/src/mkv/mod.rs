//! MKVToolNix-backed per-file operation: subtitle extraction and remux-merge.

pub mod episode;
pub mod extract;
pub mod merge;
pub mod metadata;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use tokio::process::Command;
use crate::config::{Mode, RunConfig};
use crate::error::OperationError;
use crate::job::Job;
use crate::outcome::Operation;

pub use episode::{episode_number, UNKNOWN_EPISODE};
pub use metadata::{Attachment, MkvInfo, Track, TrackProperties};

const INSTALL_HINTS: &str = "These tools are part of the MKVToolNix suite. Install with:

  macOS:  brew install mkvtoolnix
  Ubuntu: sudo apt install mkvtoolnix
  Fedora: sudo dnf install mkvtoolnix
  Arch:   sudo pacman -S mkvtoolnix-cli

Ensure they are in your PATH and try again.";

/// Runs the MKVToolNix binaries for one job at a time
#[derive(Debug, Clone)]
pub struct MkvToolkit {
    pub mkvmerge_bin: PathBuf,
    pub mkvextract_bin: PathBuf,
}

impl MkvToolkit {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            mkvmerge_bin: config.mkvmerge_bin.clone(),
            mkvextract_bin: config.mkvextract_bin.clone(),
        }
    }

    /// Check that every binary answers `--version`; the error lists the missing ones
    pub async fn validate_dependencies(&self) -> Result<()> {
        let mut missing = Vec::new();
        for bin in [&self.mkvmerge_bin, &self.mkvextract_bin] {
            match Self::detect_version(bin).await {
                Ok(version) => info!("🎬 Found {}", version),
                Err(e) => {
                    debug!("{} unavailable: {:#}", bin.display(), e);
                    missing.push(bin.display().to_string());
                }
            }
        }

        if !missing.is_empty() {
            bail!(
                "❌ Missing required MKV tools: {}\n\n{}",
                missing.join(", "),
                INSTALL_HINTS
            );
        }
        Ok(())
    }

    async fn detect_version(bin: &Path) -> Result<String> {
        let output = Command::new(bin)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", bin.display()))?;

        if !output.status.success() {
            return Err(anyhow!("{} version check failed", bin.display()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .ok_or_else(|| anyhow!("Empty output from {} --version", bin.display()))
    }

    pub async fn probe(&self, file_path: &Path) -> Result<MkvInfo> {
        metadata::probe(&self.mkvmerge_bin, file_path).await
    }

    /// Run a command, or only log it in dry-run mode.
    ///
    /// MKVToolNix exits with 1 when it finished with warnings; that still counts
    /// as success.
    pub async fn execute(&self, dry_run: bool, program: &Path, args: &[OsString]) -> Result<()> {
        let rendered = render_command(program, args);
        if dry_run {
            debug!("[dry-run] {}", rendered);
            return Ok(());
        }

        debug!("Running: {}", rendered);
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", program.display()))?;

        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                warn!("{} finished with warnings: {}", tool_name(program), stdout.trim());
                Ok(())
            }
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                Err(anyhow!(
                    "{} command failed (exit code {}): {}",
                    tool_name(program),
                    code.unwrap_or(-1),
                    detail.trim()
                ))
            }
        }
    }
}

impl Operation for MkvToolkit {
    async fn process(&self, job: &Job) -> Result<(), OperationError> {
        match job.mode {
            Mode::Extract => extract::run(self, job).await,
            Mode::Merge => merge::run(self, job).await,
        }
    }
}

fn tool_name(program: &Path) -> String {
    program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string())
}

/// Shell-like rendering for logs; arguments containing spaces are quoted
pub fn render_command(program: &Path, args: &[OsString]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        let arg = arg.to_string_lossy();
        line.push(' ');
        if arg.contains(' ') {
            line.push('"');
            line.push_str(&arg);
            line.push('"');
        } else {
            line.push_str(&arg);
        }
    }
    line
}
