use log::{info, warn};
use crate::checkpoint::ResumeStats;
use crate::job::Job;
use crate::outcome::Outcome;

/// Where a run currently is
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunPhase {
    #[default]
    Idle,
    ResumeCheck,
    FilterProcessed,
    Running,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ProgressCounters {
    /// Completed share in percent, 0 when there is nothing to do
    pub fn percent(&self) -> u16 {
        if self.total == 0 {
            return 0;
        }
        ((self.processed.min(self.total) * 100) / self.total) as u16
    }
}

/// Counters plus the human-readable result log of one run
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    counters: ProgressCounters,
    logs: Vec<String>,
}

impl ProgressState {
    pub fn new(total: usize) -> Self {
        Self {
            counters: ProgressCounters {
                total,
                ..Default::default()
            },
            logs: Vec::new(),
        }
    }

    /// Count one completion and append its log line; returns the line
    pub fn record(&mut self, job: &Job, outcome: &Outcome) -> &str {
        let name = job.file_name();
        let line = match outcome {
            Outcome::Success => {
                self.counters.success += 1;
                format!("✅ SUCCESS: {}", name)
            }
            Outcome::Skipped(reason) => {
                self.counters.skipped += 1;
                format!("⏭️  SKIPPED: {} ({})", name, reason)
            }
            Outcome::Failed(err) => {
                self.counters.failed += 1;
                format!("❌ FAILED: {} - {}", name, err)
            }
        };
        self.counters.processed += 1;
        self.logs.push(line);
        self.logs.last().map(String::as_str).unwrap_or_default()
    }

    pub fn counters(&self) -> ProgressCounters {
        self.counters
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }
}

/// Final tallies of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Jobs never started because the run was cancelled
    pub abandoned: usize,
    pub checkpoint_flushes: usize,
    pub interrupted: bool,
    /// Every job was already recorded by a resumed checkpoint
    pub already_processed: bool,
}

impl Summary {
    pub fn completed(&self) -> usize {
        self.success + self.skipped + self.failed
    }
}

/// Receives progress after every completion. Must not touch engine state.
pub trait ProgressReporter: Send + Sync {
    fn run_started(&self, _counters: &ProgressCounters) {}

    fn job_finished(&self, counters: &ProgressCounters, line: &str);

    fn run_finished(&self, _summary: &Summary) {}
}

/// Announces progress through the `log` facade
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn run_started(&self, counters: &ProgressCounters) {
        info!("🚀 Processing {} file(s)", counters.total);
    }

    fn job_finished(&self, counters: &ProgressCounters, line: &str) {
        if line.starts_with('❌') {
            warn!("[{}/{}] {}", counters.processed, counters.total, line);
        } else {
            info!("[{}/{}] {}", counters.processed, counters.total, line);
        }
    }

    fn run_finished(&self, summary: &Summary) {
        info!(
            "Run finished: {} success, {} skipped, {} failed",
            summary.success, summary.skipped, summary.failed
        );
    }
}

/// Asks the operator whether an existing checkpoint should be resumed
pub trait ResumePrompt: Send + Sync {
    fn confirm_resume(&self, stats: &ResumeStats) -> bool;
}

/// Non-interactive answer, for `--yes` and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl ResumePrompt for FixedAnswer {
    fn confirm_resume(&self, _stats: &ResumeStats) -> bool {
        self.0
    }
}
