//! watchdeck: watch a project directory, re-run its build file on change,
//! and show the run in an interactive terminal dashboard.

mod engine;
mod lifecycle;
mod model;
mod notifier;
mod session;
mod ui;

use anyhow::Context;
use clap::Parser;
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use engine::DeckfileEngine;
use lifecycle::RunLifecycle;
use model::Model;
use notifier::{monitor_worker, spawn_edit_notifier};
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use session::{Session, SessionChannels};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wd_store::{mirror_directory_into, FileMatcher, MemStore, PointerId};

#[derive(Parser)]
#[command(name = "watchdeck", about = "Live-rebuild dashboard for a build file")]
struct Args {
    /// Project directory to watch.
    #[arg(default_value = ".")]
    dir: PathBuf,

    /// Build file name, relative to the project directory.
    #[arg(long, default_value = "Deckfile")]
    build_file: String,

    /// How long a superseded run gets to exit before it is abandoned.
    #[arg(long, default_value_t = 3000)]
    grace_ms: u64,
}

struct Config {
    root: PathBuf,
    build_file: String,
    pointer: PointerId,
    grace: Duration,
    state_dir: PathBuf,
}

fn load_config(args: Args) -> anyhow::Result<Config> {
    let root = args
        .dir
        .canonicalize()
        .with_context(|| format!("project directory {}", args.dir.display()))?;
    Ok(Config {
        root,
        build_file: args.build_file,
        pointer: PointerId::new("mirror"),
        grace: Duration::from_millis(args.grace_ms),
        state_dir: resolve_state_dir(),
    })
}

fn resolve_state_dir() -> PathBuf {
    if let Ok(value) = std::env::var("XDG_STATE_HOME") {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("watchdeck");
        }
    }
    if let Ok(value) = std::env::var("HOME") {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("watchdeck");
    }
    PathBuf::from(".watchdeck/state")
}

// The alternate screen owns stdout, so logs default to a file under the
// state dir; WATCHDECK_LOG_STDOUT=1 overrides for non-TUI debugging.
fn init_logging(state_dir: &std::path::Path) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_enabled = matches!(
        std::env::var("WATCHDECK_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    );
    if stdout_enabled {
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        return;
    }
    let log_file = std::fs::create_dir_all(state_dir)
        .and_then(|()| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(state_dir.join("watchdeck.log"))
        })
        .ok();
    match log_file {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(Args::parse())?;
    init_logging(&config.state_dir);
    info!(root = %config.root.display(), build_file = %config.build_file, "starting");

    let store = Arc::new(MemStore::new());
    let mirror = mirror_directory_into(
        store.clone(),
        config.root.clone(),
        config.pointer.clone(),
        FileMatcher::file(config.build_file.clone()),
    )
    .context("starting directory mirror")?;

    let (edits_tx, edits_rx) = mpsc::channel(64);
    let (edit_errors_tx, edit_errors_rx) = mpsc::channel(1);
    let (fatal_tx, fatal_rx) = mpsc::channel(8);
    let notifier = spawn_edit_notifier(
        store.clone(),
        config.pointer.clone(),
        edits_tx,
        edit_errors_tx,
    );
    monitor_worker("edit-notifier", notifier, fatal_tx);

    let engine = Arc::new(DeckfileEngine::new(
        config.root.join(&config.build_file),
        config.root.clone(),
    ));
    let mut session = Session::new(
        store,
        Model::new(config.build_file.clone()),
        RunLifecycle::new(engine, config.grace),
        SessionChannels {
            edits: edits_rx,
            edit_errors: edit_errors_rx,
            fatal: fatal_rx,
        },
    );

    enable_raw_mode().context("entering raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("entering alternate screen")?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout)).context("terminal init")?;

    let result = session.run(&mut terminal).await;

    session.shutdown().await;
    mirror.close();
    let _ = disable_raw_mode();
    let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen);
    let _ = terminal.show_cursor();

    if let Err(err) = &result {
        error!(error = %err, "session ended with error");
    }
    info!("stopped");
    result.map_err(Into::into)
}
