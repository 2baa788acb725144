//! Build-script run engine.
//!
//! The engine contract is intentionally narrow: `start` launches one run
//! against a target and streams [`RunEvent`]s until the channel closes,
//! which signals that the underlying process tree has exited. The supplied
//! implementation executes a Deckfile: a flat list of shell commands with
//! optional `[target]` sections, not a scripting language.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const RUN_EVENT_CAPACITY: usize = 256;

/// Everything a run can tell the session. `CommandOutput` and
/// `CommandFinished` always apply to the most recently started command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RunEvent {
    TargetsDiscovered { targets: Vec<String> },
    CommandStarted { command: String },
    CommandOutput { chunk: String },
    CommandFinished { error: Option<String> },
    RunFinished { error: Option<String> },
}

pub trait RunEngine: Send + Sync + 'static {
    /// Launch the build script against `target` (empty string selects the
    /// default target). Cancellation is requested by flipping `cancel` to
    /// true; the engine kills its process tree and closes the channel.
    fn start(&self, cancel: watch::Receiver<bool>, target: &str) -> mpsc::Receiver<RunEvent>;
}

/// Parsed build file: commands before any `[section]` form the default
/// target; each section is a named target.
pub struct Deckfile {
    default: Vec<String>,
    sections: Vec<(String, Vec<String>)>,
}

impl Deckfile {
    pub fn parse(text: &str) -> Self {
        let mut default = Vec::new();
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
                sections.push((name.trim().to_string(), Vec::new()));
                continue;
            }
            match sections.last_mut() {
                Some((_, commands)) => commands.push(line.to_string()),
                None => default.push(line.to_string()),
            }
        }
        Self { default, sections }
    }

    pub fn targets(&self) -> Vec<String> {
        self.sections.iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn commands(&self, target: &str) -> Option<&[String]> {
        if target.is_empty() {
            return Some(&self.default);
        }
        self.sections
            .iter()
            .find(|(name, _)| name == target)
            .map(|(_, commands)| commands.as_slice())
    }
}

/// Runs Deckfile commands sequentially through `sh -c`, streaming their
/// combined output.
pub struct DeckfileEngine {
    build_file: PathBuf,
    workdir: PathBuf,
}

impl DeckfileEngine {
    pub fn new(build_file: PathBuf, workdir: PathBuf) -> Self {
        Self {
            build_file,
            workdir,
        }
    }
}

impl RunEngine for DeckfileEngine {
    fn start(&self, cancel: watch::Receiver<bool>, target: &str) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(RUN_EVENT_CAPACITY);
        let build_file = self.build_file.clone();
        let workdir = self.workdir.clone();
        let target = target.to_string();
        tokio::spawn(run_script(build_file, workdir, target, cancel, tx));
        rx
    }
}

async fn run_script(
    build_file: PathBuf,
    workdir: PathBuf,
    target: String,
    mut cancel: watch::Receiver<bool>,
    tx: mpsc::Sender<RunEvent>,
) {
    let script = match tokio::fs::read_to_string(&build_file).await {
        Ok(text) => Deckfile::parse(&text),
        Err(err) => {
            let _ = tx
                .send(RunEvent::RunFinished {
                    error: Some(format!("read {}: {err}", build_file.display())),
                })
                .await;
            return;
        }
    };
    let _ = tx
        .send(RunEvent::TargetsDiscovered {
            targets: script.targets(),
        })
        .await;

    let Some(commands) = script.commands(&target) else {
        let _ = tx
            .send(RunEvent::RunFinished {
                error: Some(format!("unknown target {target:?}")),
            })
            .await;
        return;
    };

    for command in commands {
        let _ = tx
            .send(RunEvent::CommandStarted {
                command: command.clone(),
            })
            .await;
        match run_command(command, &workdir, &mut cancel, &tx).await {
            Ok(()) => {
                let _ = tx.send(RunEvent::CommandFinished { error: None }).await;
            }
            Err(err) => {
                let _ = tx
                    .send(RunEvent::CommandFinished {
                        error: Some(err.clone()),
                    })
                    .await;
                let _ = tx.send(RunEvent::RunFinished { error: Some(err) }).await;
                return;
            }
        }
    }
    let _ = tx.send(RunEvent::RunFinished { error: None }).await;
}

async fn run_command(
    command: &str,
    workdir: &std::path::Path,
    cancel: &mut watch::Receiver<bool>,
    tx: &mpsc::Sender<RunEvent>,
) -> Result<(), String> {
    debug!(command, "running command");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| format!("spawn failed: {err}"))?;

    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(forward_output(out, tx.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(forward_output(err, tx.clone())));

    let status = tokio::select! {
        // A closed cancel channel counts as cancellation too: it means the
        // lifecycle that owned this run is gone.
        _ = async { let _ = cancel.wait_for(|stop| *stop).await; } => {
            let _ = child.kill().await;
            flush([stdout_task, stderr_task]).await;
            return Err("cancelled".to_string());
        }
        status = child.wait() => status.map_err(|err| format!("wait failed: {err}"))?,
    };
    flush([stdout_task, stderr_task]).await;

    if status.success() {
        Ok(())
    } else {
        match status.code() {
            Some(code) => Err(format!("exit status {code}")),
            None => Err("terminated by signal".to_string()),
        }
    }
}

async fn flush(tasks: [Option<JoinHandle<()>>; 2]) {
    for task in tasks.into_iter().flatten() {
        let _ = task.await;
    }
}

async fn forward_output(reader: impl AsyncRead + Unpin, tx: mpsc::Sender<RunEvent>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let chunk = format!("{line}\n");
        if tx.send(RunEvent::CommandOutput { chunk }).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_deckfile(dir: &tempfile::TempDir, text: &str) -> PathBuf {
        let path = dir.path().join("Deckfile");
        std::fs::write(&path, text).expect("write deckfile");
        path
    }

    async fn collect(mut rx: mpsc::Receiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn parse_splits_default_and_named_targets() {
        let script = Deckfile::parse("# build steps\necho one\n\n[test]\ncargo test\n[lint]\ncargo clippy\n");
        assert_eq!(script.targets(), vec!["test", "lint"]);
        assert_eq!(script.commands(""), Some(&["echo one".to_string()][..]));
        assert_eq!(script.commands("lint"), Some(&["cargo clippy".to_string()][..]));
        assert_eq!(script.commands("missing"), None);
    }

    #[test]
    fn parse_of_empty_text_has_no_targets_and_empty_default() {
        let script = Deckfile::parse("");
        assert!(script.targets().is_empty());
        assert_eq!(script.commands(""), Some(&[][..]));
    }

    #[tokio::test]
    async fn runs_default_commands_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_deckfile(&dir, "echo one\necho two\n[extra]\necho three\n");
        let engine = DeckfileEngine::new(file, dir.path().to_path_buf());

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let events = collect(engine.start(cancel_rx, "")).await;

        assert_eq!(
            events[0],
            RunEvent::TargetsDiscovered {
                targets: vec!["extra".to_string()]
            }
        );
        let commands: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::CommandStarted { command } => Some(command.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(commands, vec!["echo one", "echo two"]);
        let output: String = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::CommandOutput { chunk } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(output, "one\ntwo\n");
        assert_eq!(events.last(), Some(&RunEvent::RunFinished { error: None }));
    }

    #[tokio::test]
    async fn failing_command_ends_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_deckfile(&dir, "false\necho never\n");
        let engine = DeckfileEngine::new(file, dir.path().to_path_buf());

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let events = collect(engine.start(cancel_rx, "")).await;

        let started: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, RunEvent::CommandStarted { .. }))
            .collect();
        assert_eq!(started.len(), 1);
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunFinished { error: Some(_) })
        ));
    }

    #[tokio::test]
    async fn unknown_target_fails_without_running_anything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_deckfile(&dir, "echo one\n");
        let engine = DeckfileEngine::new(file, dir.path().to_path_buf());

        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let events = collect(engine.start(cancel_rx, "nope")).await;
        assert!(!events
            .iter()
            .any(|event| matches!(event, RunEvent::CommandStarted { .. })));
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunFinished { error: Some(_) })
        ));
    }

    #[tokio::test]
    async fn cancellation_kills_a_running_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = write_deckfile(&dir, "sleep 30\n");
        let engine = DeckfileEngine::new(file, dir.path().to_path_buf());

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let rx = engine.start(cancel_rx, "");

        // Let the command start, then cancel.
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).expect("cancel");

        let events = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("run ends well before the sleep would");
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunFinished { error: Some(_) })
        ));
    }
}
