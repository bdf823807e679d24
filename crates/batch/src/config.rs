use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::{CpuRefreshKind, RefreshKind, System};

/// Language used when none is configured
pub const DEFAULT_LANGUAGE: &str = "ita";

/// Per-file operation a batch runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Pull subtitle tracks out of each container
    Extract,
    /// Remux external subtitles (and fonts) back into each container
    Merge,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Extract => "extract",
            Mode::Merge => "merge",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extract" | "e" => Ok(Mode::Extract),
            "merge" | "m" => Ok(Mode::Merge),
            other => bail!("Unknown mode '{}' (expected extract or merge)", other),
        }
    }
}

/// Debounce timings for watch mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// How often the pending buffer is swept, in milliseconds
    pub tick_ms: u64,
    /// Quiet window measured from first detection, in milliseconds
    pub quiet_ms: u64,
    /// A path is not resubmitted within this many seconds of its last submission
    pub cooldown_secs: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            tick_ms: 500,
            quiet_ms: 1000,
            cooldown_secs: 30,
        }
    }
}

impl WatchSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Configuration for one batch run (or one watch session)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Batch root; the checkpoint file lives here
    pub dir: PathBuf,
    pub mode: Mode,
    /// Requested subtitle languages, in the order given by the user
    pub languages: Vec<String>,
    /// Descend into subdirectories
    pub recursive: bool,
    /// Custom output root for merged files
    pub out_dir: Option<PathBuf>,
    /// Custom directory holding external subtitles (merge only)
    pub subs_dir: Option<PathBuf>,
    /// Keep only audio tracks in this language (merge only)
    pub keep_audio: Option<String>,
    /// Log commands instead of running them
    pub dry_run: bool,
    /// Concurrent operations; 0 picks a value from the CPU count
    pub max_procs: usize,
    /// Flush the checkpoint every N completions; 0 disables checkpointing
    pub checkpoint_interval: usize,
    pub mkvmerge_bin: PathBuf,
    pub mkvextract_bin: PathBuf,
    pub watch: WatchSettings,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl RunConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            dir: PathBuf::from("."),
            mode: Mode::Extract,
            languages: vec![DEFAULT_LANGUAGE.to_string()],
            recursive: false,
            out_dir: None,
            subs_dir: None,
            keep_audio: None,
            dry_run: false,
            max_procs: 0,
            checkpoint_interval: 10,
            mkvmerge_bin: PathBuf::from("mkvmerge"),
            mkvextract_bin: PathBuf::from("mkvextract"),
            watch: WatchSettings::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// First requested language; merge mode works on this one only
    pub fn primary_language(&self) -> &str {
        self.languages
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_LANGUAGE)
    }

    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpoint_interval > 0
    }

    /// Explicit `max_procs`, or the CPU-derived default
    pub fn worker_count(&self) -> usize {
        if self.max_procs > 0 {
            self.max_procs
        } else {
            optimal_workers()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.languages.is_empty() {
            bail!("At least one language is required");
        }
        if !self.dir.is_dir() {
            bail!("Directory not found: {}", self.dir.display());
        }
        Ok(())
    }
}

/// Split a comma separated language flag such as "ita, eng,jpn"
pub fn parse_languages(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Half the logical CPUs, kept between 2 and 8
pub fn optimal_workers() -> usize {
    let system = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new()),
    );
    clamp_workers(system.cpus().len())
}

pub fn clamp_workers(cpus: usize) -> usize {
    (cpus / 2).clamp(2, 8)
}
