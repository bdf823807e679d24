pub mod config;
pub mod error;
pub mod outcome;
pub mod job;
pub mod checkpoint;
pub mod progress;
pub mod pool;
pub mod engine;
pub mod scan;
pub mod watcher;
pub mod mkv;

pub use config::{Mode, RunConfig, WatchSettings};
pub use error::{BatchError, BatchResult, OperationError};
pub use outcome::{Operation, Outcome};
pub use job::{Job, JobIdentity};
pub use checkpoint::{Checkpoint, CheckpointStore, ResumeStats, CHECKPOINT_FILE};
pub use progress::{ProgressCounters, ProgressReporter, ResumePrompt, RunPhase, Summary};
pub use pool::{PoolReport, WorkerPool};
pub use engine::{BatchEngine, ProgressHandle};
pub use scan::{is_container, scan_files};
pub use watcher::{DirectoryWatcher, WatchStats};
pub use mkv::MkvToolkit;
