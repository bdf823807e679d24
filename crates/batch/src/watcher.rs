//! Debounced ingestion of new container files.
//!
//! Raw notifications land in a [`WatchBuffer`] keyed by path with the time the
//! path was first seen. A periodic sweep promotes entries that stayed in the
//! buffer longer than the quiet period, a [`Cooldown`] map drops repeats, and
//! every surviving path runs through its own single-file [`BatchEngine`] run.
//! Runs are sequential; the event loop waits for each one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info, warn};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use crate::config::RunConfig;
use crate::engine::BatchEngine;
use crate::error::{BatchError, BatchResult};
use crate::outcome::Operation;
use crate::progress::{LogReporter, ProgressReporter, Summary};
use crate::scan::is_container;

/// Paths with pending writes, keyed to the instant they were first seen
#[derive(Debug, Default)]
pub struct WatchBuffer {
    entries: HashMap<PathBuf, Instant>,
}

impl WatchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register activity on `path`. Later events keep the first timestamp.
    pub fn touch(&mut self, path: PathBuf, now: Instant) {
        self.entries.entry(path).or_insert(now);
    }

    /// Remove every entry older than `quiet` and return the container files among them
    pub fn sweep(&mut self, now: Instant, quiet: Duration) -> Vec<PathBuf> {
        let mut ready = Vec::new();
        self.entries.retain(|path, first_seen| {
            if now.saturating_duration_since(*first_seen) <= quiet {
                return true;
            }
            if is_container(path) {
                ready.push(path.clone());
            }
            false
        });
        ready.sort();
        ready
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Last submission time per path
#[derive(Debug)]
pub struct Cooldown {
    window: Duration,
    last_run: HashMap<PathBuf, Instant>,
}

impl Cooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_run: HashMap::new(),
        }
    }

    /// True when `path` was not submitted within the window; records the submission.
    /// Entries whose window has elapsed are dropped first.
    pub fn admit(&mut self, path: &Path, now: Instant) -> bool {
        let window = self.window;
        self.last_run
            .retain(|_, last| now.saturating_duration_since(*last) < window);
        if self.last_run.contains_key(path) {
            return false;
        }
        self.last_run.insert(path.to_path_buf(), now);
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_run.len()
    }
}

/// Totals over every single-file run started by the watcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub submitted: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Runs that could not start at all
    pub errors: usize,
}

impl WatchStats {
    fn add(&mut self, summary: &Summary) {
        self.success += summary.success;
        self.skipped += summary.skipped;
        self.failed += summary.failed;
    }
}

pub struct DirectoryWatcher<O: Operation> {
    config: RunConfig,
    operation: Arc<O>,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl<O: Operation> DirectoryWatcher<O> {
    pub fn new(config: RunConfig, operation: Arc<O>) -> Self {
        Self {
            config,
            operation,
            reporter: Arc::new(LogReporter),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Cancelling the token stops the event loop and drops the notify handle
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Watch until cancelled. Failing to set up the watch is the only error.
    pub async fn run(&self) -> BatchResult<WatchStats> {
        let root = std::fs::canonicalize(&self.config.dir).map_err(|e| BatchError::WatchSetup {
            path: self.config.dir.clone(),
            source: notify::Error::io(e),
        })?;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<notify::Error>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Sends only fail once the loop has exited.
            let _ = match res {
                Ok(event) => event_tx.send(event).map_err(drop),
                Err(e) => error_tx.send(e).map_err(drop),
            };
        })
        .map_err(|source| BatchError::WatchSetup {
            path: root.clone(),
            source,
        })?;

        watcher
            .watch(&root, RecursiveMode::NonRecursive)
            .map_err(|source| BatchError::WatchSetup {
                path: root.clone(),
                source,
            })?;

        let mut buffer = WatchBuffer::new();
        if self.config.recursive {
            // Existing files are left alone; only later writes are picked up.
            for dir in subdirectories(&root) {
                watch_directory(&mut watcher, &dir);
            }
        }

        info!("🔍 Watching directory: {}", root.display());
        if self.config.recursive {
            info!("📁 Recursive mode enabled");
        }
        info!(
            "🎬 Mode: {} | 🗣️  Languages: {}",
            self.config.mode,
            self.config.languages.join(", ")
        );
        info!("⏰ Waiting for new container files (Ctrl+C to stop)");

        let settings = self.config.watch.clone();
        let mut cooldown = Cooldown::new(settings.cooldown());
        let mut stats = WatchStats::default();
        let mut tick = tokio::time::interval(settings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(event) = event_rx.recv() => {
                    self.ingest(event, &mut watcher, &mut buffer);
                }
                Some(err) = error_rx.recv() => {
                    error!("❌ Watcher error: {}", err);
                }
                _ = tick.tick() => {
                    for path in buffer.sweep(Instant::now(), settings.quiet_period()) {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        if !path.is_file() {
                            debug!("Ignoring vanished path {}", path.display());
                            continue;
                        }
                        if !cooldown.admit(&path, Instant::now()) {
                            debug!("Recently processed, skipping {}", path.display());
                            continue;
                        }
                        self.process_file(path, &mut stats).await;
                    }
                }
            }
        }

        drop(watcher);
        info!(
            "Watcher stopped: {} file(s) submitted, {} pending event(s) dropped",
            stats.submitted,
            buffer.len()
        );
        Ok(stats)
    }

    fn ingest(&self, event: Event, watcher: &mut RecommendedWatcher, buffer: &mut WatchBuffer) {
        let created = matches!(event.kind, EventKind::Create(_));
        if !created && !matches!(event.kind, EventKind::Modify(_)) {
            return;
        }

        let now = Instant::now();
        for path in event.paths {
            if created && self.config.recursive && path.is_dir() {
                add_new_directory(watcher, &path, buffer);
                for nested in subdirectories(&path) {
                    add_new_directory(watcher, &nested, buffer);
                }
            }
            buffer.touch(path, now);
        }
    }

    async fn process_file(&self, path: PathBuf, stats: &mut WatchStats) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!("📥 New file detected: {} ({})", name, format_size(size, DECIMAL));

        let mut config = self.config.clone();
        if let Some(parent) = path.parent() {
            config.dir = parent.to_path_buf();
        }
        config.checkpoint_interval = 0;

        let engine = BatchEngine::new(config, Arc::clone(&self.operation))
            .with_reporter(Arc::clone(&self.reporter))
            .with_cancellation(self.cancel.clone());

        stats.submitted += 1;
        match engine.run(vec![path]).await {
            Ok(summary) => {
                stats.add(&summary);
                if summary.failed > 0 {
                    warn!("❌ Processing failed: {}", name);
                } else {
                    info!("✅ Completed: {}", name);
                }
            }
            Err(e) => {
                stats.errors += 1;
                error!("❌ Processing error for {}: {:#}", name, e);
            }
        }
        info!("⏰ Waiting for new container files (Ctrl+C to stop)");
    }
}

/// Every directory strictly below `root`
fn subdirectories(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect()
}

fn watch_directory(watcher: &mut RecommendedWatcher, dir: &Path) -> bool {
    match watcher.watch(dir, RecursiveMode::NonRecursive) {
        Ok(()) => {
            debug!("Watching subdirectory {}", dir.display());
            true
        }
        Err(e) => {
            warn!("Could not watch directory {}: {}", dir.display(), e);
            false
        }
    }
}

/// Start watching a directory created at runtime and queue container files
/// already inside it, which may have been written before the watch was registered
fn add_new_directory(watcher: &mut RecommendedWatcher, dir: &Path, buffer: &mut WatchBuffer) {
    if !watch_directory(watcher, dir) {
        return;
    }

    let now = Instant::now();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && is_container(&path) {
                buffer.touch(path, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchSettings;
    use crate::error::OperationError;
    use crate::job::Job;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const QUIET: Duration = Duration::from_secs(1);

    #[test]
    fn test_burst_becomes_one_candidate() {
        let start = Instant::now();
        let mut buffer = WatchBuffer::new();
        let path = PathBuf::from("/watch/ep01.mkv");

        for i in 0..5 {
            buffer.touch(path.clone(), start + Duration::from_millis(i * 40));
        }
        assert_eq!(buffer.len(), 1);

        // Still inside the quiet window measured from the first event.
        assert!(buffer.sweep(start + Duration::from_millis(900), QUIET).is_empty());
        assert_eq!(buffer.len(), 1);

        let ready = buffer.sweep(start + Duration::from_millis(1100), QUIET);
        assert_eq!(ready, vec![path]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_window_counts_from_first_event() {
        let start = Instant::now();
        let mut buffer = WatchBuffer::new();
        let path = PathBuf::from("ep02.mkv");
        buffer.touch(path.clone(), start);
        buffer.touch(path.clone(), start + Duration::from_millis(950));

        assert_eq!(buffer.sweep(start + Duration::from_millis(1001), QUIET), vec![path]);
    }

    #[test]
    fn test_sweep_discards_other_extensions() {
        let start = Instant::now();
        let mut buffer = WatchBuffer::new();
        buffer.touch(PathBuf::from("ep01.mkv.part"), start);
        buffer.touch(PathBuf::from("cover.jpg"), start);
        buffer.touch(PathBuf::from("EP03.MKV"), start);

        let ready = buffer.sweep(start + Duration::from_secs(2), QUIET);
        assert_eq!(ready, vec![PathBuf::from("EP03.MKV")]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_cooldown_drops_repeats() {
        let start = Instant::now();
        let mut cooldown = Cooldown::new(Duration::from_secs(30));
        let path = Path::new("/watch/ep01.mkv");

        assert!(cooldown.admit(path, start));
        assert!(!cooldown.admit(path, start + Duration::from_secs(5)));
        assert!(cooldown.admit(Path::new("/watch/ep02.mkv"), start + Duration::from_secs(5)));
        assert!(cooldown.admit(path, start + Duration::from_secs(31)));
    }

    #[test]
    fn test_cooldown_forgets_expired_paths() {
        let start = Instant::now();
        let mut cooldown = Cooldown::new(Duration::from_secs(30));
        for i in 0..10 {
            let path = PathBuf::from(format!("/watch/ep{:02}.mkv", i));
            assert!(cooldown.admit(&path, start));
        }
        assert_eq!(cooldown.len(), 10);

        assert!(cooldown.admit(Path::new("/watch/ep99.mkv"), start + Duration::from_secs(40)));
        assert_eq!(cooldown.len(), 1);
    }

    #[derive(Default)]
    struct RecordingOperation {
        seen: Mutex<Vec<(PathBuf, PathBuf, usize)>>,
    }

    impl RecordingOperation {
        fn names(&self) -> Vec<String> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .map(|(p, _, _)| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        }
    }

    impl Operation for RecordingOperation {
        async fn process(&self, job: &Job) -> Result<(), OperationError> {
            self.seen.lock().unwrap().push((
                job.path.clone(),
                job.options.dir.clone(),
                job.options.checkpoint_interval,
            ));
            Ok(())
        }
    }

    fn watch_config(dir: &Path, recursive: bool) -> RunConfig {
        RunConfig {
            dir: dir.to_path_buf(),
            recursive,
            max_procs: 1,
            watch: WatchSettings {
                tick_ms: 50,
                quiet_ms: 300,
                cooldown_secs: 30,
            },
            ..Default::default()
        }
    }

    async fn wait_for(op: &RecordingOperation, count: usize) {
        for _ in 0..100 {
            if op.seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_submits_written_file_once() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(RecordingOperation::default());
        let cancel = CancellationToken::new();
        let watcher = DirectoryWatcher::new(watch_config(dir.path(), false), Arc::clone(&op))
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(async move { watcher.run().await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let target = dir.path().join("ep01.mkv");
        for chunk in 0..5u8 {
            let mut data = std::fs::read(&target).unwrap_or_default();
            data.extend_from_slice(&[chunk; 1024]);
            std::fs::write(&target, data).unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        wait_for(&op, 1).await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(op.names(), vec!["ep01.mkv"]);
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.success, 1);

        let (_, run_dir, interval) = op.seen.lock().unwrap()[0].clone();
        assert_eq!(run_dir, std::fs::canonicalize(dir.path()).unwrap());
        assert_eq!(interval, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recursive_watch_follows_new_directories() {
        let dir = TempDir::new().unwrap();
        let op = Arc::new(RecordingOperation::default());
        let cancel = CancellationToken::new();
        let watcher = DirectoryWatcher::new(watch_config(dir.path(), true), Arc::clone(&op))
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(async move { watcher.run().await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let season = dir.path().join("season2");
        std::fs::create_dir(&season).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(season.join("ep07.mkv"), [0u8; 512]).unwrap();

        wait_for(&op, 1).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(op.names(), vec!["ep07.mkv"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recursive_startup_ignores_existing_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old_root.mkv"), [0u8; 256]).unwrap();
        let season = dir.path().join("season1");
        std::fs::create_dir(&season).unwrap();
        std::fs::write(season.join("old_s1.mkv"), [0u8; 256]).unwrap();

        let op = Arc::new(RecordingOperation::default());
        let cancel = CancellationToken::new();
        let watcher = DirectoryWatcher::new(watch_config(dir.path(), true), Arc::clone(&op))
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(async move { watcher.run().await });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert!(op.names().is_empty());
        assert_eq!(stats.submitted, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_recursive_watch_sees_writes_in_existing_directories() {
        let dir = TempDir::new().unwrap();
        let season = dir.path().join("season1");
        std::fs::create_dir(&season).unwrap();
        std::fs::write(season.join("ep01.mkv"), [0u8; 256]).unwrap();

        let op = Arc::new(RecordingOperation::default());
        let cancel = CancellationToken::new();
        let watcher = DirectoryWatcher::new(watch_config(dir.path(), true), Arc::clone(&op))
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(async move { watcher.run().await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(season.join("ep02.mkv"), [0u8; 256]).unwrap();

        wait_for(&op, 1).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(op.names(), vec!["ep02.mkv"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_fatal() {
        let dir = TempDir::new().unwrap();
        let watcher = DirectoryWatcher::new(
            watch_config(&dir.path().join("missing"), false),
            Arc::new(RecordingOperation::default()),
        );
        let err = watcher.run().await.unwrap_err();
        assert!(matches!(err, BatchError::WatchSetup { .. }));
    }
}
