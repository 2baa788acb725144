//! The session controller: a single select loop that owns the model and is
//! its only mutator. Edits, run events, timers and key presses all arrive as
//! messages; workers never touch the model directly.

use crate::engine::{RunEngine, RunEvent};
use crate::lifecycle::RunLifecycle;
use crate::model::{CommandRun, Model, RunState};
use crate::ui;
use chrono::Utc;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures_util::StreamExt;
use ratatui::backend::Backend;
use ratatui::layout::Rect;
use ratatui::Terminal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::error;
use wd_core::{cursor, merge_paths, Cursor, ScrollAction};
use wd_store::{FileMatcher, MemStore, PointerAtRev, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("terminal failure: {0}")]
    Terminal(#[from] std::io::Error),
    #[error("worker {worker} panicked: {message}")]
    WorkerPanic {
        worker: &'static str,
        message: String,
    },
}

/// Inbound message channels, wired up in main.
pub struct SessionChannels {
    pub edits: mpsc::Receiver<PointerAtRev>,
    pub edit_errors: mpsc::Receiver<StoreError>,
    pub fatal: mpsc::Receiver<SessionError>,
}

enum Flow {
    Continue,
    Quit,
}

pub struct Session<E> {
    store: Arc<MemStore>,
    model: Model,
    lifecycle: RunLifecycle<E>,
    run_events: Option<mpsc::Receiver<RunEvent>>,
    run_started: Instant,
    channels: SessionChannels,
}

impl<E: RunEngine> Session<E> {
    pub fn new(
        store: Arc<MemStore>,
        model: Model,
        lifecycle: RunLifecycle<E>,
        channels: SessionChannels,
    ) -> Self {
        Self {
            store,
            model,
            lifecycle,
            run_events: None,
            run_started: Instant::now(),
            channels,
        }
    }

    pub async fn run<B: Backend>(
        &mut self,
        terminal: &mut Terminal<B>,
    ) -> Result<(), SessionError> {
        self.start_run().await;
        let mut term_events = EventStream::new();
        let mut clock_tick = tokio::time::interval(Duration::from_secs(1));
        let mut run_tick = tokio::time::interval(Duration::from_millis(200));

        loop {
            self.refresh_geometry(terminal.size()?);
            terminal.draw(|frame| ui::render(frame, &self.model))?;

            tokio::select! {
                Some(head) = self.channels.edits.recv() => {
                    self.handle_edit(head)?;
                }
                Some(err) = self.channels.edit_errors.recv() => {
                    return Err(err.into());
                }
                Some(err) = self.channels.fatal.recv() => {
                    return Err(err);
                }
                event = recv_run_event(&mut self.run_events) => {
                    match event {
                        Some(event) => self.apply_run_event(event),
                        None => self.run_events = None,
                    }
                }
                _ = clock_tick.tick() => {
                    self.model.now = Utc::now();
                    self.model.spinner.advance();
                }
                _ = run_tick.tick() => {
                    if self.model.active_run.as_ref().is_some_and(|run| !run.done) {
                        self.model.run_elapsed = self.run_started.elapsed();
                    }
                }
                maybe = term_events.next() => {
                    match maybe {
                        Some(Ok(Event::Key(key))) => {
                            if let Flow::Quit = self.handle_key(key).await {
                                return Ok(());
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Cancel whatever run is in flight. Called once on the way out.
    pub async fn shutdown(&mut self) {
        let previous = self.run_events.take();
        self.lifecycle.cancel_active(previous).await;
    }

    fn handle_edit(&mut self, head: PointerAtRev) -> Result<(), SessionError> {
        let snap = self.store.get(&head)?;
        let changed = self
            .store
            .diff_paths(self.model.head_snapshot, snap, &FileMatcher::all())?;
        self.model.head_snapshot = snap;
        self.model.revision = head.rev;
        merge_paths(&mut self.model.queued_paths, changed);
        Ok(())
    }

    fn apply_run_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::TargetsDiscovered { targets } => {
                self.model.targets = targets;
            }
            RunEvent::CommandStarted { command } => {
                let Some(run) = self.model.active_run.as_mut() else {
                    invariant_breach("command started with no active run");
                    return;
                };
                run.evals.push(CommandRun::new(command, Utc::now()));
            }
            RunEvent::CommandOutput { chunk } => {
                let Some(eval) = self
                    .model
                    .active_run
                    .as_mut()
                    .and_then(|run| run.evals.last_mut())
                else {
                    invariant_breach("output arrived before any command started");
                    return;
                };
                eval.output.push_str(&chunk);
            }
            RunEvent::CommandFinished { error } => {
                let Some(eval) = self
                    .model
                    .active_run
                    .as_mut()
                    .and_then(|run| run.evals.last_mut())
                else {
                    invariant_breach("command finished before any command started");
                    return;
                };
                eval.done = true;
                eval.duration = (Utc::now() - eval.started_at).to_std().ok();
                eval.error = error;
            }
            RunEvent::RunFinished { error } => {
                let elapsed = self.run_started.elapsed();
                let Some(run) = self.model.active_run.as_mut() else {
                    invariant_breach("run finished with no active run");
                    return;
                };
                run.done = true;
                run.error = error;
                run.duration = Some(elapsed);
                self.model.run_elapsed = elapsed;
            }
        }
    }

    async fn handle_key(&mut self, key: KeyEvent) -> Flow {
        if key.kind == KeyEventKind::Release {
            return Flow::Continue;
        }
        // Raw mode turns Ctrl-C into an ordinary key event.
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Flow::Quit;
        }
        if self.model.chooser_visible {
            match key.code {
                KeyCode::Char('q') => return Flow::Quit,
                KeyCode::Up => self.model.chooser_up(),
                KeyCode::Down => self.model.chooser_down(),
                KeyCode::Esc | KeyCode::Char('f') => self.model.chooser_visible = false,
                KeyCode::Enter | KeyCode::Char('r') => self.confirm_target().await,
                _ => {}
            }
            return Flow::Continue;
        }
        match key.code {
            KeyCode::Char('q') => return Flow::Quit,
            KeyCode::Char('f') => self.model.chooser_visible = true,
            KeyCode::Char('r') => self.start_run().await,
            KeyCode::Char('o') => self.toggle_collapse(),
            KeyCode::Up => self.apply_scroll(ScrollAction::LineUp),
            KeyCode::Down => self.apply_scroll(ScrollAction::LineDown),
            KeyCode::PageUp => self.apply_scroll(ScrollAction::PageUp),
            KeyCode::PageDown => self.apply_scroll(ScrollAction::PageDown),
            KeyCode::Char('k') => self.apply_scroll(ScrollAction::JumpBlockUp),
            KeyCode::Char('j') => self.apply_scroll(ScrollAction::JumpBlockDown),
            _ => {}
        }
        Flow::Continue
    }

    async fn confirm_target(&mut self) {
        self.model.chooser_visible = false;
        self.model.selected_target = self.model.chooser_target();
        self.start_run().await;
    }

    async fn start_run(&mut self) {
        self.run_started = Instant::now();
        self.model.run_elapsed = Duration::ZERO;
        self.model.active_run = Some(RunState::new(Utc::now()));
        self.model.cursor = Cursor::default();
        self.model.queued_paths.clear();
        let previous = self.run_events.take();
        self.run_events = Some(
            self.lifecycle
                .start(&self.model.selected_target, previous)
                .await,
        );
    }

    fn apply_scroll(&mut self, action: ScrollAction) {
        self.model.cursor = cursor::scroll(
            self.model.cursor,
            &self.model.block_sizes,
            self.model.view_height,
            action,
        );
    }

    fn toggle_collapse(&mut self) {
        let block = self.model.cursor.block;
        if self.model.collapsed.remove(&block) {
            self.model.block_sizes = ui::block_sizes(&self.model);
            return;
        }
        self.model.collapsed.insert(block);
        self.model.cursor.line = 0;
        self.model.block_sizes = ui::block_sizes(&self.model);
        // Collapsing above the cursor may leave fewer buffer lines than the
        // viewport row claims; pull the row up to the cursor's offset.
        let idx = cursor::buffer_index(self.model.cursor, &self.model.block_sizes);
        if idx < self.model.cursor.line_in_view {
            self.model.cursor.line_in_view = idx;
        }
    }

    fn refresh_geometry(&mut self, area: Rect) {
        self.model.view_height = ui::output_height(area);
        self.model.block_sizes = ui::block_sizes(&self.model);
        let (block, line) = cursor::normalize(
            self.model.cursor.block as i64,
            self.model.cursor.line as i64,
            &self.model.block_sizes,
        );
        self.model.cursor.block = block;
        self.model.cursor.line = line;
        let idx = cursor::buffer_index(self.model.cursor, &self.model.block_sizes);
        let max_row = self.model.view_height.saturating_sub(1);
        self.model.cursor.line_in_view = self.model.cursor.line_in_view.min(max_row).min(idx);
    }
}

/// A run event ordering the engine can never produce; in debug builds this
/// aborts loudly, in release the event is dropped.
fn invariant_breach(what: &str) {
    debug_assert!(false, "{what}");
    error!(what, "dropping run event that violates ordering");
}

async fn recv_run_event(rx: &mut Option<mpsc::Receiver<RunEvent>>) -> Option<RunEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
