use std::io::stdout;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use batch::checkpoint::{Checkpoint, CheckpointStore};
use batch::progress::ProgressCounters;
use chrono::Local;
use clap::Parser;
use humansize::{format_size, DECIMAL};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState, Wrap},
    Frame, Terminal,
};
use sysinfo::System;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Read-only monitor for a mkvbatch checkpoint
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Batch root holding the checkpoint (defaults to the current directory)
    dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordStatus {
    Success,
    Skipped,
    Failed,
}

impl RecordStatus {
    fn label(&self) -> &'static str {
        match self {
            RecordStatus::Success => "OK",
            RecordStatus::Skipped => "SKIP",
            RecordStatus::Failed => "FAIL",
        }
    }

    fn color(&self) -> Color {
        match self {
            RecordStatus::Success => Color::Green,
            RecordStatus::Skipped => Color::Yellow,
            RecordStatus::Failed => Color::Red,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordRow {
    status: RecordStatus,
    name: String,
    hash: String,
    reason: String,
}

/// Failures first, then skips, then successes; newest first within each list
fn record_rows(checkpoint: &Checkpoint) -> Vec<RecordRow> {
    let processed = &checkpoint.processed;
    let failed = processed.failed.iter().rev().map(|f| RecordRow {
        status: RecordStatus::Failed,
        name: f.identity.name.clone(),
        hash: f.identity.hash.clone(),
        reason: f.error.clone(),
    });
    let skipped = processed.skipped.iter().rev().map(|s| RecordRow {
        status: RecordStatus::Skipped,
        name: s.identity.name.clone(),
        hash: s.identity.hash.clone(),
        reason: s.reason.clone(),
    });
    let successful = processed.successful.iter().rev().map(|p| RecordRow {
        status: RecordStatus::Success,
        name: p.identity.name.clone(),
        hash: p.identity.hash.clone(),
        reason: "-".to_string(),
    });
    failed.chain(skipped).chain(successful).collect()
}

struct App {
    dir: PathBuf,
    checkpoint: Option<Checkpoint>,
    rows: Vec<RecordRow>,
    load_error: Option<String>,
    file_size: Option<u64>,
    system: System,
    table_state: TableState,
    last_refresh: Option<Instant>,
    should_quit: bool,
}

impl App {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            checkpoint: None,
            rows: Vec::new(),
            load_error: None,
            file_size: None,
            system: System::new(),
            table_state: TableState::default(),
            last_refresh: None,
            should_quit: false,
        }
    }

    fn due(&self) -> bool {
        self.last_refresh
            .map(|at| at.elapsed() >= POLL_INTERVAL)
            .unwrap_or(true)
    }

    fn refresh(&mut self) {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let mut store = CheckpointStore::new(&self.dir);
        self.file_size = std::fs::metadata(store.path()).map(|m| m.len()).ok();
        match store.load() {
            Ok(checkpoint) => {
                self.checkpoint = checkpoint.cloned();
                self.load_error = None;
            }
            Err(e) => {
                self.checkpoint = None;
                self.load_error = Some(e.to_string());
            }
        }
        self.rows = self.checkpoint.as_ref().map(record_rows).unwrap_or_default();
        self.last_refresh = Some(Instant::now());
    }

    /// Recorded and declared totals of the loaded checkpoint
    fn progress(&self) -> ProgressCounters {
        let Some(cp) = self.checkpoint.as_ref() else {
            return ProgressCounters::default();
        };
        ProgressCounters {
            total: cp.total_files,
            processed: cp.processed_count(),
            success: cp.processed.successful.len(),
            skipped: cp.processed.skipped.len(),
            failed: cp.processed.failed.len(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let dir = args.dir.unwrap_or_else(|| PathBuf::from("."));
    let dir = std::fs::canonicalize(&dir)
        .with_context(|| format!("Directory not found: {}", dir.display()))?;

    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(dir);
    let result = run_app(&mut terminal, &mut app);

    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    result
}

fn run_app<B: Backend>(terminal: &mut Terminal<B>, app: &mut App) -> Result<()> {
    loop {
        if app.due() {
            app.refresh();
        }

        terminal.draw(|f| ui(f, app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => app.should_quit = true,
                    crossterm::event::KeyCode::Char('r') => app.refresh(),
                    _ => {}
                }
            }
        }

        if app.should_quit {
            return Ok(());
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let size = f.size();

    if size.height < 10 || size.width < 80 {
        let error_msg = Paragraph::new("Terminal too small! Please resize to at least 80x10.")
            .block(Block::default().borders(Borders::ALL).title("Error"))
            .style(Style::default().fg(Color::Red));
        f.render_widget(error_msg, size);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(4),
        ])
        .split(size);

    render_top_bar(f, app, chunks[0]);
    render_record_table(f, app, chunks[1]);
    render_status_bar(f, app, chunks[2]);
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(50),
        ])
        .split(area);

    let cpu_usage = clamp_percent(app.system.global_cpu_usage() as f64);
    let total_memory = app.system.total_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        clamp_percent(app.system.used_memory() as f64 / total_memory as f64 * 100.0)
    };

    let cpu_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("CPU"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(cpu_usage as u16)
        .label(format!("{:.1}%", cpu_usage));
    f.render_widget(cpu_gauge, chunks[0]);

    let memory_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Memory"))
        .gauge_style(Style::default().fg(Color::Green))
        .percent(memory_percent as u16)
        .label(format!("{:.1}%", memory_percent));
    f.render_widget(memory_gauge, chunks[1]);

    let counters = app.progress();
    let batch_percent = counters.percent();
    let batch_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Batch"))
        .gauge_style(Style::default().fg(Color::Magenta))
        .percent(batch_percent)
        .label(format!("{}/{} ({}%)", counters.processed, counters.total, batch_percent));
    f.render_widget(batch_gauge, chunks[2]);
}

fn render_record_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "FILE", "FINGERPRINT", "REASON"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.rows.is_empty() {
        vec![Row::new(vec![
            "-".to_string(),
            "No records yet".to_string(),
            "-".to_string(),
            "-".to_string(),
        ])]
    } else {
        app.rows
            .iter()
            .take(max_rows)
            .map(|record| {
                Row::new(vec![
                    record.status.label().to_string(),
                    truncate_string(&record.name, 50),
                    record.hash.clone(),
                    truncate_string(&record.reason, 40),
                ])
                .style(Style::default().fg(record.status.color()))
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(45),
        Constraint::Length(17),
        Constraint::Percentage(35),
    ];

    let title = format!("Records ({})", app.rows.len());
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let dir_display = app.dir.display().to_string();
    let size = app
        .file_size
        .map(|b| format_size(b, DECIMAL))
        .unwrap_or_else(|| "-".to_string());

    let status_text = match (&app.checkpoint, &app.load_error) {
        (_, Some(err)) => format!("Checkpoint error: {} | q=quit r=refresh", err),
        (None, None) => format!(
            "No checkpoint in {} | q=quit r=refresh",
            truncate_string(&dir_display, 50)
        ),
        (Some(cp), None) => {
            let count = |status: RecordStatus| app.rows.iter().filter(|r| r.status == status).count();
            format!(
                "Success: {} | Skipped: {} | Failed: {} | Mode: {} | Languages: {} | Last flush: {} | Size: {} | Dir: {} | q=quit r=refresh",
                count(RecordStatus::Success),
                count(RecordStatus::Skipped),
                count(RecordStatus::Failed),
                cp.mode,
                cp.languages.join(","),
                cp.last_checkpoint.with_timezone(&Local).format("%H:%M:%S"),
                size,
                truncate_string(&dir_display, 35),
            )
        }
    };

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(Wrap { trim: true });

    f.render_widget(paragraph, area);
}

/// Shorten to at most `max_len` characters, ending in "..." when cut
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch::config::RunConfig;
    use proptest::prelude::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("short.mkv", 20), "short.mkv");
        assert_eq!(truncate_string("a_rather_long_name.mkv", 10), "a_rathe...");
        assert_eq!(truncate_string("エピソード第一話.mkv", 6), "エピソ...");
    }

    #[test]
    fn test_record_rows_order() {
        let mut cp = Checkpoint::new(&RunConfig::default(), 4);
        let id = |n: &str| batch::JobIdentity::from_path(std::path::Path::new(n));
        cp.processed.successful.push(batch::checkpoint::ProcessedFile { identity: id("a.mkv") });
        cp.processed.successful.push(batch::checkpoint::ProcessedFile { identity: id("b.mkv") });
        cp.processed.skipped.push(batch::checkpoint::SkippedFile {
            identity: id("c.mkv"),
            reason: "no subtitles".to_string(),
        });
        cp.processed.failed.push(batch::checkpoint::FailedFile {
            identity: id("d.mkv"),
            error: "exit 2".to_string(),
        });

        let rows = record_rows(&cp);
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["d.mkv", "c.mkv", "b.mkv", "a.mkv"]);
        assert_eq!(rows[0].status, RecordStatus::Failed);
        assert_eq!(rows[0].reason, "exit 2");
        assert_eq!(rows[3].reason, "-");
    }

    #[test]
    fn test_progress_from_checkpoint() {
        let dir = std::env::temp_dir();
        let mut app = App::new(dir.join("mkvtop-progress"));
        let mut cp = Checkpoint::new(&RunConfig::default(), 8);
        let id = |n: &str| batch::JobIdentity::from_path(std::path::Path::new(n));
        cp.processed.successful.push(batch::checkpoint::ProcessedFile { identity: id("a.mkv") });
        cp.processed.failed.push(batch::checkpoint::FailedFile {
            identity: id("b.mkv"),
            error: "exit 2".to_string(),
        });
        app.checkpoint = Some(cp);

        let counters = app.progress();
        assert_eq!(counters.total, 8);
        assert_eq!(counters.processed, 2);
        assert_eq!(counters.success, 1);
        assert_eq!(counters.failed, 1);
        assert_eq!(counters.percent(), 25);
    }

    #[test]
    fn test_refresh_without_checkpoint() {
        let dir = std::env::temp_dir();
        let mut app = App::new(dir.join("mkvtop-missing-dir"));
        app.refresh();
        assert!(app.checkpoint.is_none());
        assert!(app.rows.is_empty());
        assert_eq!(app.progress(), ProgressCounters::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// **Property 1: Truncation never exceeds the limit and never splits a character**
        #[test]
        fn test_truncate_bounds(s in "\\PC{0,80}", max_len in 3usize..60) {
            let out = truncate_string(&s, max_len);
            prop_assert!(out.chars().count() <= max_len);
            if s.chars().count() <= max_len {
                prop_assert_eq!(out, s);
            }
        }
    }
}
