use anyhow::{Context, Result};
use clap::Parser;
use pipeline::{AlbumConversionState, AlbumStatus, ConversionSession, FileStatus, PipelineConfig};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    widgets::{Block, Borders, Gauge, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::io::stdout;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::Disks;
use humansize::{format_size, BINARY};

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Free and total bytes of the disk holding the working root
#[derive(Debug, Clone, Copy)]
struct DiskUsage {
    available: u64,
    total: u64,
}

struct App {
    session: Option<ConversionSession>,
    load_error: Option<String>,
    disks: Disks,
    disk: Option<DiskUsage>,
    table_state: TableState,
    should_quit: bool,
    session_file: PathBuf,
    working_dir: PathBuf,
    pause_signal: PathBuf,
    last_refresh: Option<Instant>,
}

impl App {
    fn new(cfg: &PipelineConfig) -> Self {
        Self {
            session: None,
            load_error: None,
            disks: Disks::new_with_refreshed_list(),
            disk: None,
            table_state: TableState::default(),
            should_quit: false,
            session_file: cfg.session_file_path(),
            working_dir: cfg.working_dir.clone(),
            pause_signal: cfg.pause_signal_path(),
            last_refresh: None,
        }
    }

    fn due(&self) -> bool {
        self.last_refresh.map_or(true, |t| t.elapsed() >= REFRESH_INTERVAL)
    }

    fn refresh(&mut self) {
        self.last_refresh = Some(Instant::now());

        // a half-written file shows up as an error until the next tick
        match ConversionSession::read(&self.session_file) {
            Ok(session) => {
                self.session = session;
                self.load_error = None;
            }
            Err(e) => self.load_error = Some(e.to_string()),
        }

        self.disks.refresh_list();
        self.disk = disk_usage(&self.disks, &self.working_dir);
    }

    fn albums(&self) -> &[AlbumConversionState] {
        self.session.as_ref().map(|s| s.albums.as_slice()).unwrap_or(&[])
    }

    fn count_by_status(&self, status: AlbumStatus) -> usize {
        self.albums().iter().filter(|a| a.status == status).count()
    }
}

/// Longest mount point containing `path`
fn disk_usage(disks: &Disks, path: &Path) -> Option<DiskUsage> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    disks
        .list()
        .iter()
        .filter(|d| resolved.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| DiskUsage {
            available: d.available_space(),
            total: d.total_space(),
        })
}

fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = PipelineConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Setup terminal
    crossterm::terminal::enable_raw_mode()?;
    let mut stdout = stdout();
    crossterm::execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = App::new(&cfg);

    loop {
        if app.due() {
            app.refresh();
        }

        terminal.draw(|f| ui(f, &mut app))?;

        if crossterm::event::poll(Duration::from_millis(100))? {
            if let crossterm::event::Event::Key(key) = crossterm::event::read()? {
                match key.code {
                    crossterm::event::KeyCode::Char('q') => {
                        app.should_quit = true;
                    }
                    crossterm::event::KeyCode::Char('r') => {
                        app.refresh();
                    }
                    _ => {}
                }
            }
        }

        if app.should_quit {
            break;
        }
    }

    // Restore terminal
    crossterm::terminal::disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        crossterm::terminal::LeaveAlternateScreen
    )?;

    Ok(())
}

/// DSD conversion session monitor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
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

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // session progress and disk gauges
            Constraint::Min(3),    // album table
            Constraint::Length(3), // status bar
        ])
        .split(size);

    render_top_bar(f, app, main_chunks[0]);
    render_album_table(f, app, main_chunks[1]);
    render_status_bar(f, app, main_chunks[2]);
}

fn render_top_bar(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);

    let stats = app.session.as_ref().map(|s| s.statistics()).unwrap_or_default();
    let files_percent = if stats.files_total == 0 {
        0
    } else {
        (stats.files_completed * 100 / stats.files_total).min(100) as u16
    };
    let files_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Files"))
        .gauge_style(Style::default().fg(Color::Cyan))
        .percent(files_percent)
        .label(format!("{}/{} converted", stats.files_completed, stats.files_total));
    f.render_widget(files_gauge, chunks[0]);

    let (disk_percent, disk_label) = match app.disk {
        Some(usage) if usage.total > 0 => {
            let used = usage.total.saturating_sub(usage.available);
            let percent = (used as f64 / usage.total as f64 * 100.0).clamp(0.0, 100.0);
            (
                percent as u16,
                format!(
                    "{} free of {}",
                    format_size(usage.available, BINARY),
                    format_size(usage.total, BINARY)
                ),
            )
        }
        _ => (0, "unknown".to_string()),
    };
    let disk_color = if disk_percent >= 90 { Color::Red } else { Color::Green };
    let disk_gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Working disk"))
        .gauge_style(Style::default().fg(disk_color))
        .percent(disk_percent)
        .label(disk_label);
    f.render_widget(disk_gauge, chunks[1]);
}

fn status_label(status: AlbumStatus) -> (&'static str, Color) {
    match status {
        AlbumStatus::Pending => ("PEND", Color::Gray),
        AlbumStatus::Converting => ("CONV", Color::Yellow),
        AlbumStatus::Archiving => ("ARCH", Color::Yellow),
        AlbumStatus::Completed => ("OK", Color::Green),
        AlbumStatus::Failed => ("FAIL", Color::Red),
        AlbumStatus::Skipped => ("SKIP", Color::Blue),
    }
}

fn render_album_table(f: &mut Frame, app: &mut App, area: Rect) {
    let max_rows = (area.height as usize).saturating_sub(3);

    let header = Row::new(vec!["ST", "ALBUM", "STAGE", "FILES", "TRIES", "ERROR"])
        .style(Style::default().add_modifier(Modifier::BOLD))
        .height(1);

    let rows: Vec<Row> = if app.albums().is_empty() {
        let hint = match &app.load_error {
            Some(e) => truncate_string(e, 60),
            None => format!("No session in {}", app.session_file.display()),
        };
        vec![Row::new(vec!["-".to_string(), hint]).height(1)]
    } else {
        app.albums()
            .iter()
            .take(max_rows)
            .map(|album| {
                let (label, color) = status_label(album.status);
                let failed_files = album.files.iter().filter(|f| f.status == FileStatus::Failed).count();
                let files = if failed_files > 0 {
                    format!("{}/{} ({}✗)", album.files_completed(), album.files.len(), failed_files)
                } else {
                    format!("{}/{}", album.files_completed(), album.files.len())
                };
                Row::new(vec![
                    label.to_string(),
                    truncate_string(&album.album_name, 50),
                    album.processing_stage.map(|s| s.as_str()).unwrap_or("-").to_string(),
                    files,
                    album.total_attempts().to_string(),
                    truncate_string(album.error_message.as_deref().unwrap_or("-"), 40),
                ])
                .style(Style::default().fg(color))
                .height(1)
            })
            .collect()
    };

    let widths = [
        Constraint::Length(5),
        Constraint::Percentage(40),
        Constraint::Length(16),
        Constraint::Length(12),
        Constraint::Length(6),
        Constraint::Percentage(30),
    ];

    let title = match &app.session {
        Some(s) => format!("Session {} ({} albums)", s.session_id, s.albums.len()),
        None => "Albums".to_string(),
    };

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .column_spacing(1);

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let state = match &app.session {
        _ if app.pause_signal.exists() => "PAUSED",
        Some(s) if s.completed_at.is_some() => "finished",
        Some(s) if s.paused => "paused",
        Some(_) => "active",
        None => "idle",
    };

    let status_text = format!(
        "{} | Total: {} | Pending: {} | Converting: {} | Archiving: {} | Completed: {} | Failed: {} | Skipped: {} | q=quit r=refresh",
        state,
        app.albums().len(),
        app.count_by_status(AlbumStatus::Pending),
        app.count_by_status(AlbumStatus::Converting),
        app.count_by_status(AlbumStatus::Archiving),
        app.count_by_status(AlbumStatus::Completed),
        app.count_by_status(AlbumStatus::Failed),
        app.count_by_status(AlbumStatus::Skipped),
    );

    let paragraph = Paragraph::new(status_text)
        .block(Block::default().borders(Borders::ALL).title("Status"))
        .wrap(ratatui::widgets::Wrap { trim: true });

    f.render_widget(paragraph, area);
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
