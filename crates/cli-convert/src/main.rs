use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use humansize::{format_size, BINARY};
use log::{info, warn};
use pipeline::{
    workdir::WorkingDirectoryManager, ConversionMode, ConversionSession, PipelineConfig, PipelineOrchestrator,
    RunOptions, SessionStateStore, SystemDiskSpace,
};
use std::path::{Path, PathBuf};

/// DSD album conversion pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Values that take precedence over the configuration file
#[derive(clap::Args, Debug, Default)]
struct Overrides {
    /// Output directory for converted albums
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    /// Archive directory for original copies
    #[arg(long, global = true)]
    archive: Option<PathBuf>,

    /// Root for staging directories
    #[arg(long, global = true)]
    working: Option<PathBuf>,

    /// Directory holding the session file and pause sentinel
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// iso_dsf_to_flac or iso_to_dsf
    #[arg(long, global = true)]
    mode: Option<ConversionMode>,

    #[arg(long, global = true)]
    sample_rate: Option<u32>,

    #[arg(long, global = true)]
    bit_depth: Option<u16>,

    #[arg(long, global = true)]
    max_retries: Option<u32>,
}

impl Overrides {
    fn apply(&self, cfg: &mut PipelineConfig) {
        if let Some(p) = &self.output {
            cfg.output_dir = p.clone();
        }
        if let Some(p) = &self.archive {
            cfg.archive_dir = p.clone();
        }
        if let Some(p) = &self.working {
            cfg.working_dir = p.clone();
        }
        if let Some(p) = &self.state_dir {
            cfg.state_dir = p.clone();
        }
        if let Some(mode) = self.mode {
            cfg.conversion_mode = mode;
        }
        if let Some(rate) = self.sample_rate {
            cfg.sample_rate = rate;
        }
        if let Some(depth) = self.bit_depth {
            cfg.bit_depth = depth;
        }
        if let Some(retries) = self.max_retries {
            cfg.max_retries = retries;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every album found under INPUT
    Run {
        /// Input directory; falls back to `input_dir` from the config
        input: Option<PathBuf>,

        /// Continue the previous session from where it stopped
        #[arg(long)]
        resume: bool,

        /// Reprocess albums already recorded as done
        #[arg(long)]
        force: bool,

        /// Treat INPUT itself as one album
        #[arg(long)]
        single_album: bool,
    },
    /// Ask a running conversion to stop after the current album
    Pause,
    /// Remove the pause request
    Unpause,
    /// Show the persisted session
    Status,
    /// Report what a run would do without changing anything
    Plan {
        input: Option<PathBuf>,

        #[arg(long)]
        force: bool,

        #[arg(long)]
        single_album: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = PipelineConfig::load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.overrides.apply(&mut cfg);

    match args.command {
        Command::Run {
            input,
            resume,
            force,
            single_album,
        } => {
            let input = resolve_input(input, &cfg)?;
            run(cfg, &input, RunOptions {
                resume,
                force,
                single_album,
            })
            .await
        }
        Command::Pause => {
            let mut store = open_store(&cfg)?;
            store.create_pause_signal().context("Failed to create pause signal")?;
            info!("⏸️  Pause requested; the pipeline stops after the current album");
            Ok(())
        }
        Command::Unpause => {
            let mut store = open_store(&cfg)?;
            store.clear_pause_signal().context("Failed to clear pause signal")?;
            info!("▶️  Pause cleared; run with --resume to continue");
            Ok(())
        }
        Command::Status => status(&cfg),
        Command::Plan {
            input,
            force,
            single_album,
        } => {
            let input = resolve_input(input, &cfg)?;
            plan(cfg, &input, single_album, force)
        }
    }
}

fn resolve_input(input: Option<PathBuf>, cfg: &PipelineConfig) -> Result<PathBuf> {
    let input = input
        .or_else(|| cfg.input_dir.clone())
        .context("No input directory given on the command line or in the config")?;
    if !input.exists() {
        anyhow::bail!("Input directory does not exist: {}", input.display());
    }
    Ok(input)
}

fn open_store(cfg: &PipelineConfig) -> Result<SessionStateStore> {
    let mut store = SessionStateStore::new(&cfg.state_dir)
        .with_context(|| format!("Failed to open state directory: {}", cfg.state_dir.display()))?;
    store.load_session().context("Failed to load session state")?;
    Ok(store)
}

async fn run(cfg: PipelineConfig, input: &Path, options: RunOptions) -> Result<()> {
    info!("DSD conversion starting");
    info!("Configuration loaded:");
    info!("  Input: {}", input.display());
    info!("  Output: {}", cfg.output_dir.display());
    info!("  Archive: {}", cfg.archive_dir.display());
    info!("  Working: {}", cfg.working_dir.display());
    info!(
        "  Mode: {} ({} Hz / {} bit)",
        cfg.conversion_mode.as_str(),
        cfg.sample_rate,
        cfg.bit_depth
    );

    let mut orchestrator = PipelineOrchestrator::from_config(cfg).context("Failed to initialise pipeline")?;
    let summary = orchestrator
        .run(input, options)
        .await
        .with_context(|| format!("Conversion run failed for {}", input.display()))?;

    for album in summary.albums.iter().filter(|a| a.message.is_some()) {
        info!(
            "  {} [{}]: {}",
            album.name,
            album.status.as_str(),
            album.message.as_deref().unwrap_or_default()
        );
    }
    if summary.paused {
        warn!("Run paused; use `dsdconv unpause` then `dsdconv run --resume`");
    }

    let failed = summary.count(pipeline::AlbumStatus::Failed);
    if failed > 0 {
        anyhow::bail!("{} album(s) failed; rerun with --resume to retry", failed);
    }
    Ok(())
}

fn status(cfg: &PipelineConfig) -> Result<()> {
    let path = cfg.session_file_path();
    let session = match ConversionSession::read(&path)
        .with_context(|| format!("Failed to read session file: {}", path.display()))?
    {
        Some(s) => s,
        None => {
            println!("No session found in {}", cfg.state_dir.display());
            return Ok(());
        }
    };

    let stats = session.statistics();
    let state = if session.paused {
        "paused"
    } else if session.completed_at.is_some() {
        "finished"
    } else {
        "running or interrupted"
    };
    println!("Session {} ({})", session.session_id, state);
    println!(
        "  Started: {}",
        session.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Input: {}", session.input_dir.display());
    println!(
        "  Albums: {} total, {} completed, {} failed, {} skipped, {} pending",
        stats.albums_total, stats.albums_completed, stats.albums_failed, stats.albums_skipped, stats.albums_pending
    );
    println!(
        "  Files: {} total, {} completed, {} failed, {} pending",
        stats.files_total, stats.files_completed, stats.files_failed, stats.files_pending
    );

    for album in &session.albums {
        println!(
            "  [{:<10}] {:<16} {}/{}  {}",
            album.status.as_str(),
            album.processing_stage.map(|s| s.as_str()).unwrap_or("-"),
            album.files_completed(),
            album.files.len(),
            album.album_name
        );
        if let Some(err) = &album.error_message {
            println!("               ↳ {}", err);
        }
    }

    let workdirs = WorkingDirectoryManager::new(cfg, Box::new(SystemDiskSpace))
        .context("Failed to open working directory root")?;
    let pairs = workdirs.list_working_directories().context("Failed to list working directories")?;
    if !pairs.is_empty() {
        println!("  Working directories:");
        for pair in pairs {
            println!("    {}", pair.source.display());
        }
    }
    if cfg.pause_signal_path().exists() {
        println!("  Pause signal present: {}", cfg.pause_signal_path().display());
    }
    Ok(())
}

fn plan(cfg: PipelineConfig, input: &Path, single_album: bool, force: bool) -> Result<()> {
    let orchestrator = PipelineOrchestrator::from_config(cfg).context("Failed to initialise pipeline")?;
    let entries = orchestrator
        .plan(input, single_album, force)
        .with_context(|| format!("Failed to plan {}", input.display()))?;

    let mut to_process = 0;
    let mut required = 0u64;
    for entry in &entries {
        let verdict = if entry.will_skip { "skip" } else { "convert" };
        println!(
            "{:<8} {} ({} files, {}) - {}",
            verdict,
            entry.name,
            entry.file_count,
            format_size(entry.total_bytes, BINARY),
            entry.reason
        );
        if !entry.will_skip {
            to_process += 1;
            required = required.max(entry.required_bytes);
        }
    }
    println!(
        "{} of {} album(s) would be converted; largest staging need {}",
        to_process,
        entries.len(),
        format_size(required, BINARY)
    );
    Ok(())
}
