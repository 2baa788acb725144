//! Session view state. Pure data plus the small bits of chooser logic that
//! are worth testing without a terminal.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use wd_core::Cursor;
use wd_store::SnapshotId;

pub const SPINNER_FRAMES: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

#[derive(Debug, Default, Clone, Copy)]
pub struct Spinner {
    frame: usize,
}

impl Spinner {
    pub fn advance(&mut self) {
        self.frame = (self.frame + 1) % SPINNER_FRAMES.len();
    }

    pub fn glyph(&self) -> char {
        SPINNER_FRAMES[self.frame]
    }
}

/// One command within the active run.
#[derive(Debug, Clone)]
pub struct CommandRun {
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub output: String,
    pub done: bool,
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl CommandRun {
    pub fn new(command: String, started_at: DateTime<Utc>) -> Self {
        Self {
            command,
            started_at,
            output: String::new(),
            done: false,
            error: None,
            duration: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunState {
    pub started_at: DateTime<Utc>,
    pub evals: Vec<CommandRun>,
    pub done: bool,
    pub error: Option<String>,
    pub duration: Option<Duration>,
}

impl RunState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            evals: Vec::new(),
            done: false,
            error: None,
            duration: None,
        }
    }
}

pub struct Model {
    pub build_file: String,
    pub now: DateTime<Utc>,
    /// Head revision of the mirrored pointer, as last observed.
    pub revision: u64,
    pub head_snapshot: SnapshotId,
    /// Paths edited since the current run started, first-seen order.
    pub queued_paths: Vec<String>,
    pub targets: Vec<String>,
    /// Empty string selects the default target.
    pub selected_target: String,
    pub chooser_visible: bool,
    /// 0 is the default target, 1..=targets.len() the named ones.
    pub chooser_pos: usize,
    pub active_run: Option<RunState>,
    pub run_elapsed: Duration,
    pub cursor: Cursor,
    pub collapsed: HashSet<usize>,
    pub block_sizes: Vec<usize>,
    pub view_height: usize,
    pub spinner: Spinner,
}

impl Model {
    pub fn new(build_file: String) -> Self {
        Self {
            build_file,
            now: Utc::now(),
            revision: 0,
            head_snapshot: SnapshotId::EMPTY,
            queued_paths: Vec::new(),
            targets: Vec::new(),
            selected_target: String::new(),
            chooser_visible: false,
            chooser_pos: 0,
            active_run: None,
            run_elapsed: Duration::ZERO,
            cursor: Cursor::default(),
            collapsed: HashSet::new(),
            block_sizes: Vec::new(),
            view_height: 0,
            spinner: Spinner::default(),
        }
    }

    pub fn chooser_up(&mut self) {
        if self.chooser_pos == 0 {
            self.chooser_pos = self.targets.len();
        } else {
            self.chooser_pos -= 1;
        }
    }

    pub fn chooser_down(&mut self) {
        if self.chooser_pos >= self.targets.len() {
            self.chooser_pos = 0;
        } else {
            self.chooser_pos += 1;
        }
    }

    /// The target name the chooser position denotes, default target as "".
    pub fn chooser_target(&self) -> String {
        if self.chooser_pos == 0 {
            return String::new();
        }
        self.targets
            .get(self.chooser_pos - 1)
            .cloned()
            .unwrap_or_default()
    }
}
