use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use batch::checkpoint::{CheckpointStore, ResumeStats};
use batch::config::{parse_languages, Mode, RunConfig};
use batch::mkv::{extract::subs_dir, merge::output_root, MkvToolkit};
use batch::progress::{FixedAnswer, ResumePrompt, Summary};
use batch::{scan_files, BatchEngine, DirectoryWatcher};
use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn, LevelFilter};
use tokio_util::sync::CancellationToken;

/// Batch subtitle extraction and merging for MKV libraries
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract subtitle tracks into subs/<lang>/
    #[command(alias = "e")]
    Extract(RunArgs),

    /// Merge external subtitles back into each file
    #[command(alias = "m")]
    Merge(RunArgs),

    /// Process new files as they appear in a directory
    #[command(alias = "w")]
    Watch {
        #[command(flatten)]
        run: RunArgs,

        /// Operation applied to new files (extract or merge)
        #[arg(long, default_value = "extract")]
        mode: Mode,
    },

    /// Delete the checkpoint of a directory
    ClearCheckpoint {
        /// Batch root (defaults to the current directory)
        dir: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Directory to process (defaults to the current directory)
    dir: Option<PathBuf>,

    /// Subtitle languages, comma separated (e.g. "ita,eng")
    #[arg(short, long)]
    lang: Option<String>,

    /// Output directory for merged files
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory holding external subtitles for merge
    #[arg(short, long)]
    subs_dir: Option<PathBuf>,

    /// Process subdirectories
    #[arg(short, long)]
    recursive: bool,

    /// Keep only audio tracks in this language when merging
    #[arg(short, long)]
    audio: Option<String>,

    /// Save the checkpoint every N files (0 disables resume support)
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Concurrent operations (defaults to half the CPUs, between 2 and 8)
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Print what would be done without running MKVToolNix
    #[arg(long)]
    dry_run: bool,

    /// Resume an existing checkpoint without asking
    #[arg(short, long)]
    yes: bool,
}

impl RunArgs {
    /// Overlay command-line flags on the loaded configuration
    fn apply(&self, cfg: &mut RunConfig, mode: Mode) -> Result<()> {
        cfg.mode = mode;
        if let Some(dir) = &self.dir {
            cfg.dir = dir.clone();
        }
        if let Some(lang) = &self.lang {
            cfg.languages = parse_languages(lang);
        }
        if self.output.is_some() {
            cfg.out_dir = self.output.clone();
        }
        if self.subs_dir.is_some() {
            cfg.subs_dir = self.subs_dir.clone();
        }
        if self.audio.is_some() {
            cfg.keep_audio = self.audio.clone();
        }
        if let Some(interval) = self.checkpoint_interval {
            cfg.checkpoint_interval = interval;
        }
        if let Some(jobs) = self.jobs {
            cfg.max_procs = jobs;
        }
        cfg.recursive |= self.recursive;
        cfg.dry_run |= self.dry_run;

        cfg.validate()?;
        cfg.dir = std::fs::canonicalize(&cfg.dir)
            .with_context(|| format!("Failed to resolve directory: {}", cfg.dir.display()))?;
        Ok(())
    }
}

/// Asks on stdin whether to resume; anything but y/yes declines
struct StdinPrompt;

impl ResumePrompt for StdinPrompt {
    fn confirm_resume(&self, stats: &ResumeStats) -> bool {
        // Runs inside the engine's async run; needs the multi-thread runtime.
        tokio::task::block_in_place(|| ask_resume(stats, io::stdin().lock()))
    }
}

fn ask_resume(stats: &ResumeStats, mut input: impl BufRead) -> bool {
    println!();
    println!("📋 Found checkpoint from a previous run");
    println!("   ✅ Processed: {}", stats.processed);
    println!("   ⏳ Remaining: {}", stats.remaining_clamped());
    println!("   📦 Total:     {}", stats.total);
    print!("Resume from checkpoint? [y/n]: ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    match input.read_line(&mut answer) {
        Ok(_) => is_yes(&answer),
        Err(e) => {
            warn!("Could not read answer: {}", e);
            false
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing running jobs...");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose {
        logger.filter_level(LevelFilter::Debug);
    }
    logger.format_timestamp_secs().init();

    let mut cfg = RunConfig::load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Command::Extract(args) => {
            args.apply(&mut cfg, Mode::Extract)?;
            run_batch(cfg, args.yes).await
        }
        Command::Merge(args) => {
            args.apply(&mut cfg, Mode::Merge)?;
            run_batch(cfg, args.yes).await
        }
        Command::Watch { run, mode } => {
            run.apply(&mut cfg, mode)?;
            run_watch(cfg).await
        }
        Command::ClearCheckpoint { dir } => {
            let dir = dir.unwrap_or_else(|| PathBuf::from("."));
            let mut store = CheckpointStore::new(&dir);
            store.clear()?;
            println!("🗑️  Checkpoint cleared: {}", store.path().display());
            Ok(())
        }
    }
}

async fn run_batch(cfg: RunConfig, assume_yes: bool) -> Result<()> {
    let toolkit = MkvToolkit::new(&cfg);
    toolkit.validate_dependencies().await?;

    let files = scan_files(&cfg.dir, cfg.recursive)?;
    if files.is_empty() {
        println!("No MKV files found in {}", cfg.dir.display());
        return Ok(());
    }
    info!(
        "Found {} MKV file(s) | Mode: {} | Languages: {}",
        files.len(),
        cfg.mode,
        cfg.languages.join(", ")
    );

    let prompt: Arc<dyn ResumePrompt> = if assume_yes {
        Arc::new(FixedAnswer(true))
    } else {
        Arc::new(StdinPrompt)
    };

    let engine = BatchEngine::new(cfg.clone(), Arc::new(toolkit))
        .with_prompt(prompt)
        .with_cancellation(cancel_on_ctrl_c());
    let summary = engine.run(files).await?;

    print_summary(&cfg, &summary);
    Ok(())
}

async fn run_watch(cfg: RunConfig) -> Result<()> {
    let toolkit = MkvToolkit::new(&cfg);
    toolkit.validate_dependencies().await?;

    let watcher = DirectoryWatcher::new(cfg, Arc::new(toolkit)).with_cancellation(cancel_on_ctrl_c());
    let stats = watcher.run().await.context("Watch mode failed")?;

    println!();
    println!("👋 Watch stopped after {} file(s)", stats.submitted);
    println!(
        "   ✅ {} success | ⏭️  {} skipped | ❌ {} failed",
        stats.success, stats.skipped, stats.failed
    );
    Ok(())
}

fn print_summary(cfg: &RunConfig, summary: &Summary) {
    println!();
    if summary.already_processed {
        println!("✅ All files have been processed!");
        println!("   Run `mkvbatch clear-checkpoint` to start over.");
        return;
    }

    println!("══════════════════════════════════════");
    println!(" 🎉 {} complete", cfg.mode);
    println!("══════════════════════════════════════");
    println!("   ✅ Success: {}", summary.success);
    println!("   ⏭️  Skipped: {}", summary.skipped);
    println!("   ❌ Failed:  {}", summary.failed);
    if summary.interrupted {
        println!("   ⚠️  Interrupted: {} file(s) not started", summary.abandoned);
    }
    if cfg.checkpointing_enabled() {
        println!(
            "   💾 Checkpoint: {}",
            CheckpointStore::new(&cfg.dir).path().display()
        );
    }

    if cfg.dry_run {
        println!();
        println!("🔍 Dry run, nothing was written:");
        match cfg.mode {
            Mode::Extract => {
                for lang in &cfg.languages {
                    let example = subs_dir(&cfg.dir.join("<file>"), lang);
                    println!("   Subtitles ({}) would go to {}", lang, example.display());
                }
            }
            Mode::Merge => {
                println!("   Merged files would go to {}", output_root(cfg).display());
            }
        }
    }
    debug!("Final summary: {:?}", summary);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_aliases_and_flags() {
        let cli = Cli::parse_from(["mkvbatch", "e", "/tmp", "-l", "ita, eng", "-r", "-j", "3", "-y"]);
        match cli.command {
            Command::Extract(args) => {
                assert_eq!(args.dir, Some(PathBuf::from("/tmp")));
                assert_eq!(args.lang.as_deref(), Some("ita, eng"));
                assert!(args.recursive && args.yes);
                assert_eq!(args.jobs, Some(3));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let cli = Cli::parse_from(["mkvbatch", "w", "--mode", "merge", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Watch { mode: Mode::Merge, .. }));
    }

    #[test]
    fn test_apply_overlays_config() {
        let dir = TempDir::new().unwrap();
        let args = RunArgs {
            dir: Some(dir.path().to_path_buf()),
            lang: Some("eng,jpn".to_string()),
            audio: Some("jpn".to_string()),
            checkpoint_interval: Some(0),
            dry_run: true,
            ..Default::default()
        };
        let mut cfg = RunConfig::default();
        args.apply(&mut cfg, Mode::Merge).unwrap();

        assert_eq!(cfg.mode, Mode::Merge);
        assert_eq!(cfg.languages, vec!["eng", "jpn"]);
        assert_eq!(cfg.keep_audio.as_deref(), Some("jpn"));
        assert!(!cfg.checkpointing_enabled());
        assert!(cfg.dry_run);
        assert!(cfg.dir.is_absolute());
    }

    #[test]
    fn test_apply_rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let args = RunArgs {
            dir: Some(dir.path().join("missing")),
            ..Default::default()
        };
        assert!(args.apply(&mut RunConfig::default(), Mode::Extract).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_answer_read_off_the_runtime() {
        let stats = ResumeStats {
            processed: 3,
            remaining: -1,
            total: 2,
            ..Default::default()
        };
        let accepted =
            tokio::task::block_in_place(|| ask_resume(&stats, io::Cursor::new("yes\n")));
        assert!(accepted);
        assert!(!ask_resume(&stats, io::Cursor::new("no\n")));
        assert!(!ask_resume(&stats, io::Cursor::new("")));
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("n"));
        assert!(!is_yes(""));
    }
}
