//! Resumable batch runs: checkpoint resume check, worker pool, final tally.
//!
//! All cross-task mutation goes through [`RunState`] behind one mutex. The
//! lock is taken once per completed job for its bookkeeping and is never held
//! while an operation runs.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use crate::checkpoint::CheckpointStore;
use crate::config::RunConfig;
use crate::error::BatchError;
use crate::job::{jobs_for, Job};
use crate::outcome::{Operation, Outcome};
use crate::pool::WorkerPool;
use crate::progress::{
    FixedAnswer, LogReporter, ProgressCounters, ProgressReporter, ProgressState, ResumePrompt,
    RunPhase, Summary,
};

struct RunState {
    phase: RunPhase,
    progress: ProgressState,
    checkpoint: Option<CheckpointStore>,
    interval: usize,
    since_flush: usize,
    flushes: usize,
}

impl RunState {
    fn new(total: usize, checkpoint: Option<CheckpointStore>, interval: usize) -> Self {
        Self {
            phase: RunPhase::Idle,
            progress: ProgressState::new(total),
            checkpoint,
            interval,
            since_flush: 0,
            flushes: 0,
        }
    }

    /// Counters, log line, checkpoint entry and periodic flush for one completion
    fn record(&mut self, job: &Job, outcome: &Outcome) -> String {
        let line = self.progress.record(job, outcome).to_string();

        if let Some(store) = self.checkpoint.as_mut() {
            match store.record(&job.path, outcome) {
                Ok(()) => {}
                Err(BatchError::AlreadyRecorded(name)) => warn!(
                    "⚠️  {} has the same name as an already recorded file, outcome ({}) dropped from checkpoint",
                    name, outcome
                ),
                Err(e) => warn!("Checkpoint not updated for {}: {}", job.file_name(), e),
            }
            self.since_flush += 1;
            if self.since_flush >= self.interval {
                self.flush();
                self.since_flush = 0;
            }
        }

        line
    }

    fn flush(&mut self) {
        let Some(store) = self.checkpoint.as_mut() else {
            return;
        };
        match store.save() {
            Ok(()) => {
                self.flushes += 1;
                debug!(
                    "💾 Checkpoint saved: {} recorded ({})",
                    store.processed_count(),
                    store.path().display()
                );
            }
            Err(e) => warn!("💾 Checkpoint save failed: {}", e),
        }
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only view of a run for renderers polling at arbitrary times
#[derive(Clone)]
pub struct ProgressHandle {
    state: Arc<Mutex<RunState>>,
}

impl ProgressHandle {
    pub fn counters(&self) -> ProgressCounters {
        lock(&self.state).progress.counters()
    }

    pub fn logs(&self) -> Vec<String> {
        lock(&self.state).progress.logs().to_vec()
    }

    pub fn phase(&self) -> RunPhase {
        lock(&self.state).phase
    }
}

/// Drives one list of files through an [`Operation`], with optional checkpointing
pub struct BatchEngine<O: Operation> {
    config: Arc<RunConfig>,
    operation: Arc<O>,
    reporter: Arc<dyn ProgressReporter>,
    prompt: Arc<dyn ResumePrompt>,
    cancel: CancellationToken,
    state: Arc<Mutex<RunState>>,
}

impl<O: Operation> BatchEngine<O> {
    pub fn new(config: RunConfig, operation: Arc<O>) -> Self {
        Self {
            config: Arc::new(config),
            operation,
            reporter: Arc::new(LogReporter),
            prompt: Arc::new(FixedAnswer(true)),
            cancel: CancellationToken::new(),
            state: Arc::new(Mutex::new(RunState::new(0, None, 0))),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ResumePrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn progress(&self) -> ProgressHandle {
        ProgressHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn set_phase(&self, phase: RunPhase) {
        debug!("Run phase: {:?}", phase);
        lock(&self.state).phase = phase;
    }

    /// Run every path through the operation and return the final tallies.
    ///
    /// Only setup failures are errors; per-file failures end up in the summary.
    pub async fn run(&self, paths: Vec<PathBuf>) -> Result<Summary> {
        let jobs = jobs_for(paths, Arc::clone(&self.config));
        if jobs.is_empty() {
            info!("No files to process in {}", self.config.dir.display());
            self.set_phase(RunPhase::Done);
            return Ok(Summary::default());
        }

        let (checkpoint, jobs) = if self.config.checkpointing_enabled() {
            self.set_phase(RunPhase::ResumeCheck);
            self.prepare_checkpoint(jobs)?
        } else {
            (None, jobs)
        };

        if jobs.is_empty() {
            info!("✅ All files have been processed!");
            self.set_phase(RunPhase::Done);
            return Ok(Summary {
                already_processed: true,
                ..Default::default()
            });
        }

        let counters = {
            let mut state = lock(&self.state);
            *state = RunState::new(jobs.len(), checkpoint, self.config.checkpoint_interval);
            state.phase = RunPhase::Running;
            state.progress.counters()
        };
        self.reporter.run_started(&counters);

        let pool = WorkerPool::new(self.config.worker_count()).with_cancellation(self.cancel.clone());
        info!(
            "🔄 Starting {} of {} file(s) with {} worker(s)",
            self.config.mode,
            jobs.len(),
            pool.capacity()
        );

        let operation = Arc::clone(&self.operation);
        let state = Arc::clone(&self.state);
        let reporter = Arc::clone(&self.reporter);
        let cancel = self.cancel.clone();
        let report = pool
            .run(
                jobs,
                move |job: Job| run_operation(Arc::clone(&operation), job),
                move |job: Job, outcome: Outcome| {
                    let mut state = lock(&state);
                    let line = state.record(&job, &outcome);
                    if !cancel.is_cancelled() {
                        reporter.job_finished(&state.progress.counters(), &line);
                    }
                },
            )
            .await;

        let summary = {
            let mut state = lock(&self.state);
            state.phase = RunPhase::Finalizing;
            state.flush();
            let counters = state.progress.counters();
            state.phase = RunPhase::Done;
            Summary {
                total: counters.total,
                success: counters.success,
                skipped: counters.skipped,
                failed: counters.failed,
                abandoned: report.abandoned,
                checkpoint_flushes: state.flushes,
                interrupted: self.cancel.is_cancelled(),
                already_processed: false,
            }
        };

        if summary.interrupted {
            warn!(
                "Run interrupted: {} file(s) were not started",
                summary.abandoned
            );
        }
        self.reporter.run_finished(&summary);
        Ok(summary)
    }

    /// Resume a matching checkpoint or start a fresh one.
    ///
    /// A checkpoint that cannot be decoded is fatal. Any other persistence
    /// problem degrades to running without a checkpoint.
    fn prepare_checkpoint(&self, jobs: Vec<Job>) -> Result<(Option<CheckpointStore>, Vec<Job>)> {
        let mut store = CheckpointStore::new(&self.config.dir);

        let resumable = match store.load() {
            Ok(Some(cp)) => match cp.mismatch(&self.config) {
                None => Some(cp.stats()),
                Some(reason) => {
                    info!("🔄 {}; starting fresh", BatchError::ConfigMismatch(reason));
                    None
                }
            },
            Ok(None) => None,
            Err(e @ BatchError::Decode { .. }) => {
                return Err(e).context("Checkpoint is corrupt; clear it to start over");
            }
            Err(e) => {
                warn!("Ignoring unreadable checkpoint: {}", e);
                None
            }
        };

        if let Some(stats) = resumable {
            info!(
                "📋 Checkpoint found: {}/{} files already processed",
                stats.processed, stats.total
            );
            if self.prompt.confirm_resume(&stats) {
                self.set_phase(RunPhase::FilterProcessed);
                let remaining = store.filter_processed(jobs);
                info!("📥 Resuming with {} remaining file(s)", remaining.len());
                return Ok((Some(store), remaining));
            }

            if let Err(e) = store.clear() {
                warn!("Could not clear checkpoint: {}", e);
            }
            info!("🔄 Starting fresh (checkpoint cleared)");
        }

        match store.create(&self.config, jobs.len()) {
            Ok(()) => Ok((Some(store), jobs)),
            Err(e) => {
                warn!("💾 Could not create checkpoint, continuing without: {}", e);
                Ok((None, jobs))
            }
        }
    }
}

/// Run the operation on its own task so a panic becomes a failed outcome
async fn run_operation<O: Operation>(operation: Arc<O>, job: Job) -> Outcome {
    let name = job.file_name();
    match tokio::spawn(async move { operation.process(&job).await }).await {
        Ok(result) => Outcome::from_result(result),
        Err(e) => {
            error!("Operation for {} did not complete: {}", name, e);
            Outcome::Failed(format!("operation panicked: {}", e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, CHECKPOINT_FILE};
    use crate::checkpoint::ResumeStats;
    use crate::error::OperationError;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Outcome decided by the file name: "fail" fails, "skip" has nothing to do
    #[derive(Default)]
    struct StubOperation {
        calls: Mutex<HashMap<String, usize>>,
    }

    impl StubOperation {
        fn calls(&self, name: &str) -> usize {
            self.calls.lock().unwrap().get(name).copied().unwrap_or(0)
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().values().sum()
        }
    }

    impl Operation for StubOperation {
        async fn process(&self, job: &Job) -> Result<(), OperationError> {
            let name = job.file_name();
            *self.calls.lock().unwrap().entry(name.clone()).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(2)).await;
            if name.contains("fail") {
                Err(anyhow!("mkvextract command failed").into())
            } else if name.contains("skip") {
                Err(OperationError::no_work("no subtitles"))
            } else if name.contains("panic") {
                panic!("stub panic");
            } else {
                Ok(())
            }
        }
    }

    /// Fails the test if the engine asks for a resume decision
    struct NoPrompt;

    impl ResumePrompt for NoPrompt {
        fn confirm_resume(&self, _stats: &ResumeStats) -> bool {
            panic!("resume prompt should not be shown");
        }
    }

    #[derive(Default)]
    struct CountingReporter {
        lines: Mutex<Vec<String>>,
        finished: AtomicUsize,
    }

    impl ProgressReporter for CountingReporter {
        fn job_finished(&self, _counters: &ProgressCounters, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn run_finished(&self, _summary: &Summary) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(dir: &Path, interval: usize) -> RunConfig {
        RunConfig {
            dir: dir.to_path_buf(),
            languages: vec!["eng".to_string()],
            max_procs: 2,
            checkpoint_interval: interval,
            ..Default::default()
        }
    }

    /// 10 files: 2 failing, 3 skipped, 5 successful
    fn ten_files(dir: &Path) -> Vec<PathBuf> {
        [
            "ep01.mkv", "ep02_fail.mkv", "ep03.mkv", "ep04_skip.mkv", "ep05.mkv",
            "ep06_skip.mkv", "ep07.mkv", "ep08_fail.mkv", "ep09_skip.mkv", "ep10.mkv",
        ]
        .iter()
        .map(|n| dir.join(n))
        .collect()
    }

    fn load(dir: &Path) -> crate::checkpoint::Checkpoint {
        let mut store = CheckpointStore::new(dir);
        let checkpoint = store.load().unwrap().cloned();
        checkpoint.expect("checkpoint should exist")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_end_to_end_with_periodic_flushes() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(StubOperation::default());
        let reporter = Arc::new(CountingReporter::default());
        let engine = BatchEngine::new(config(dir.path(), 3), Arc::clone(&op))
            .with_reporter(reporter.clone())
            .with_prompt(Arc::new(NoPrompt));

        let summary = engine.run(ten_files(dir.path())).await.unwrap();

        assert_eq!(summary.total, 10);
        assert_eq!((summary.success, summary.skipped, summary.failed), (5, 3, 2));
        assert_eq!(summary.completed(), 10);
        // Flushes after completions 3, 6 and 9, plus the final one.
        assert_eq!(summary.checkpoint_flushes, 4);
        assert!(!summary.interrupted);

        let cp = load(dir.path());
        assert_eq!(cp.total_files, 10);
        assert_eq!(cp.processed.successful.len(), 5);
        assert_eq!(cp.processed.skipped.len(), 3);
        assert_eq!(cp.processed.failed.len(), 2);
        assert!(cp.processed.failed.iter().all(|f| f.error == "mkvextract command failed"));
        assert!(cp.processed.skipped.iter().all(|f| f.reason == "no subtitles"));
        assert!(cp.last_checkpoint > cp.started_at);

        assert_eq!(reporter.lines.lock().unwrap().len(), 10);
        assert_eq!(reporter.finished.load(Ordering::SeqCst), 1);
        assert_eq!(op.total_calls(), 10);

        let progress = engine.progress();
        assert_eq!(progress.phase(), RunPhase::Done);
        assert_eq!(progress.logs().len(), 10);
        assert_eq!(progress.counters().processed, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resume_never_reruns_recorded_jobs() {
        let dir = TempDir::new().unwrap();
        let files = ten_files(dir.path());
        let cfg = config(dir.path(), 3);

        // A killed run that recorded the first four files.
        let mut store = CheckpointStore::new(dir.path());
        store.create(&cfg, files.len()).unwrap();
        store.add_success(&files[0]).unwrap();
        store.add_failed(&files[1], "mkvextract command failed").unwrap();
        store.add_success(&files[2]).unwrap();
        store.add_skipped(&files[3], "no subtitles").unwrap();
        store.save().unwrap();

        let op = Arc::new(StubOperation::default());
        let engine = BatchEngine::new(cfg.clone(), Arc::clone(&op));
        let summary = engine.run(files.clone()).await.unwrap();

        assert_eq!(summary.total, 6);
        assert_eq!(op.total_calls(), 6);
        for recorded in &files[..4] {
            let name = recorded.file_name().unwrap().to_str().unwrap();
            assert_eq!(op.calls(name), 0, "{} was re-run", name);
        }
        assert_eq!(load(dir.path()).processed_count(), 10);

        // Second resume: nothing left to do, the pool never starts.
        let summary = BatchEngine::new(cfg, Arc::clone(&op)).run(files).await.unwrap();
        assert!(summary.already_processed);
        assert_eq!(summary.completed(), 0);
        assert_eq!(op.total_calls(), 6);
    }

    #[tokio::test]
    async fn test_declined_resume_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let files = ten_files(dir.path());
        let cfg = config(dir.path(), 5);

        let op = Arc::new(StubOperation::default());
        BatchEngine::new(cfg.clone(), Arc::clone(&op)).run(files.clone()).await.unwrap();

        let summary = BatchEngine::new(cfg, Arc::clone(&op))
            .with_prompt(Arc::new(FixedAnswer(false)))
            .run(files)
            .await
            .unwrap();

        assert_eq!(summary.completed(), 10);
        assert_eq!(op.calls("ep01.mkv"), 2);
        assert_eq!(load(dir.path()).processed_count(), 10);
    }

    #[tokio::test]
    async fn test_mismatched_checkpoint_is_not_offered() {
        let dir = TempDir::new().unwrap();
        let files = ten_files(dir.path());

        let other = RunConfig {
            languages: vec!["eng".to_string(), "ita".to_string()],
            ..config(dir.path(), 3)
        };
        let mut store = CheckpointStore::new(dir.path());
        store.create(&other, 10).unwrap();
        store.add_success(&files[0]).unwrap();
        store.save().unwrap();

        let op = Arc::new(StubOperation::default());
        let summary = BatchEngine::new(config(dir.path(), 3), Arc::clone(&op))
            .with_prompt(Arc::new(NoPrompt))
            .run(files)
            .await
            .unwrap();

        assert_eq!(summary.completed(), 10);
        assert_eq!(op.calls("ep01.mkv"), 1);
        assert_eq!(load(dir.path()).languages, vec!["eng"]);
    }

    #[tokio::test]
    async fn test_same_name_in_two_directories_is_recorded_once() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(StubOperation::default());
        let paths = vec![
            dir.path().join("season1").join("ep01.mkv"),
            dir.path().join("season2").join("ep01.mkv"),
        ];
        let summary = BatchEngine::new(config(dir.path(), 1), Arc::clone(&op))
            .with_prompt(Arc::new(NoPrompt))
            .run(paths)
            .await
            .unwrap();

        assert_eq!(summary.success, 2);
        assert_eq!(op.calls("ep01.mkv"), 2);
        let cp = load(dir.path());
        assert_eq!(cp.processed_count(), 1);
        assert_eq!(cp.processed.successful[0].identity.name, "ep01.mkv");
    }

    #[tokio::test]
    async fn test_disabled_checkpointing_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(StubOperation::default());
        let summary = BatchEngine::new(config(dir.path(), 0), op)
            .with_prompt(Arc::new(NoPrompt))
            .run(ten_files(dir.path()))
            .await
            .unwrap();

        assert_eq!(summary.completed(), 10);
        assert_eq!(summary.checkpoint_flushes, 0);
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_fatal() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILE), "garbage").unwrap();
        let op = Arc::new(StubOperation::default());
        let result = BatchEngine::new(config(dir.path(), 3), Arc::clone(&op))
            .run(ten_files(dir.path()))
            .await;

        assert!(result.is_err());
        assert_eq!(op.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_panicking_operation_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(StubOperation::default());
        let summary = BatchEngine::new(config(dir.path(), 1), op)
            .run(vec![dir.path().join("ep01_panic.mkv"), dir.path().join("ep02.mkv")])
            .await
            .unwrap();

        assert_eq!((summary.success, summary.failed), (1, 1));
        let cp = load(dir.path());
        assert!(cp.processed.failed[0].error.starts_with("operation panicked"));
    }

    #[tokio::test]
    async fn test_cancelled_run_still_flushes_and_reports() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let op = Arc::new(StubOperation::default());
        let summary = BatchEngine::new(config(dir.path(), 3), Arc::clone(&op))
            .with_cancellation(cancel)
            .run(ten_files(dir.path()))
            .await
            .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.abandoned, 10);
        assert_eq!(summary.completed(), 0);
        assert_eq!(op.total_calls(), 0);
        assert_eq!(load(dir.path()).processed_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_file_list() {
        let dir = TempDir::new().unwrap();
        let summary = BatchEngine::new(config(dir.path(), 3), Arc::new(StubOperation::default()))
            .run(Vec::new())
            .await
            .unwrap();
        assert_eq!(summary, Summary::default());
        assert!(!dir.path().join(CHECKPOINT_FILE).exists());
    }
}
