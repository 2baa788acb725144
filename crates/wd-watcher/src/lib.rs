//! Directory change watcher.
//!
//! Wraps the platform backend behind `notify` and turns its raw events into
//! the canonical [`ChangeEvent`] stream. The native backend delivers events
//! on its own callback thread; those are forwarded untouched into a raw
//! channel, and a single dedicated translation thread (the only writer of
//! the output channel) normalizes, dedupes, and filters them.

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::mpsc as raw_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use wd_core::{ChangeEvent, ChangeOp};

const EVENT_QUEUE_CAPACITY: usize = 256;
const ERROR_QUEUE_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("native watch error: {0}")]
    Native(#[from] notify::Error),
    #[error("watcher translation worker panicked: {0}")]
    Panicked(String),
    #[error("watcher is closed")]
    Closed,
}

enum RawMsg {
    Event(notify::Result<notify::Event>),
    Stop,
}

struct Shared {
    roots: Mutex<Vec<PathBuf>>,
}

impl Shared {
    fn is_tracked_root(&self, path: &Path) -> bool {
        lock(&self.roots).iter().any(|root| root == path)
    }
}

/// Recursive multi-root watcher producing canonical change events.
///
/// `new` returns the watcher handle together with its event and error
/// streams; both streams close exactly once, when the watcher is closed or
/// dropped.
pub struct DirWatcher {
    shared: Arc<Shared>,
    native: Mutex<Option<RecommendedWatcher>>,
    raw_tx: Mutex<Option<raw_mpsc::Sender<RawMsg>>>,
}

impl DirWatcher {
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>, mpsc::Receiver<WatchError>), WatchError>
    {
        let shared = Arc::new(Shared {
            roots: Mutex::new(Vec::new()),
        });
        let (raw_tx, raw_rx) = raw_mpsc::channel::<RawMsg>();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);

        let callback_tx = raw_tx.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Native callback thread: hand off immediately, never translate
            // or block here.
            let _ = callback_tx.send(RawMsg::Event(res));
        })?;

        let loop_shared = Arc::clone(&shared);
        let panic_tx = errors_tx.clone();
        std::thread::spawn(move || {
            let run = AssertUnwindSafe(|| translation_loop(loop_shared, raw_rx, events_tx, errors_tx));
            if let Err(panic) = std::panic::catch_unwind(run) {
                let _ = panic_tx.blocking_send(WatchError::Panicked(panic_message(panic)));
            }
        });

        Ok((
            Self {
                shared,
                native: Mutex::new(Some(watcher)),
                raw_tx: Mutex::new(Some(raw_tx)),
            },
            events_rx,
            errors_rx,
        ))
    }

    /// Start watching `path` recursively. A path already covered by an
    /// existing root is a no-op; recursive semantics mean the parent covers
    /// it. The first root starts the native subscription, later roots are
    /// added to the same subscription.
    pub fn add_root(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        let path = path.as_ref().to_path_buf();
        {
            let mut roots = lock(&self.shared.roots);
            if roots.iter().any(|root| path.starts_with(root)) {
                return Ok(());
            }
            roots.push(path.clone());
            // Lock released before touching the native API.
        }

        let mut native = lock(&self.native);
        let Some(watcher) = native.as_mut() else {
            lock(&self.shared.roots).retain(|root| *root != path);
            return Err(WatchError::Closed);
        };
        if let Err(err) = watcher.watch(&path, RecursiveMode::Recursive) {
            lock(&self.shared.roots).retain(|root| *root != path);
            return Err(err.into());
        }
        debug!(path = %path.display(), "watch root added");
        Ok(())
    }

    pub fn roots(&self) -> Vec<PathBuf> {
        lock(&self.shared.roots).clone()
    }

    /// Stop the native subscription and close the event and error streams.
    /// Safe to call more than once; only the first call has any effect.
    pub fn close(&self) {
        if let Some(raw_tx) = lock(&self.raw_tx).take() {
            let _ = raw_tx.send(RawMsg::Stop);
        }
        lock(&self.native).take();
    }
}

impl Drop for DirWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn translation_loop(
    shared: Arc<Shared>,
    raw_rx: raw_mpsc::Receiver<RawMsg>,
    events_tx: mpsc::Sender<ChangeEvent>,
    errors_tx: mpsc::Sender<WatchError>,
) {
    let mut translator = Translator::default();
    while let Ok(msg) = raw_rx.recv() {
        match msg {
            RawMsg::Stop => return,
            RawMsg::Event(Ok(event)) => {
                let op = op_for_kind(&event.kind);
                for path in event.paths {
                    let Some(out) = translator.translate(path, op, |p| shared.is_tracked_root(p))
                    else {
                        continue;
                    };
                    if events_tx.blocking_send(out).is_err() {
                        return;
                    }
                }
            }
            RawMsg::Event(Err(err)) => {
                if errors_tx.blocking_send(WatchError::Native(err)).is_err() {
                    return;
                }
            }
        }
    }
}

/// Stateful part of the raw-to-canonical translation: duplicate-create
/// suppression and watch-root self-event filtering.
#[derive(Default)]
struct Translator {
    last_create: Option<PathBuf>,
}

impl Translator {
    fn translate(
        &mut self,
        path: PathBuf,
        op: ChangeOp,
        is_root: impl Fn(&Path) -> bool,
    ) -> Option<ChangeEvent> {
        // Backends are permitted to double-fire creation notifications.
        // Only a create for a *different* path resets the dedup state.
        if op == ChangeOp::Create {
            if self.last_create.as_deref() == Some(path.as_path()) {
                return None;
            }
            self.last_create = Some(path.clone());
        }

        // Backends fire a create/write for the watched directory itself
        // when a watch is established.
        if matches!(op, ChangeOp::Create | ChangeOp::Write) && is_root(&path) {
            return None;
        }

        Some(ChangeEvent { path, op })
    }
}

fn op_for_kind(kind: &EventKind) -> ChangeOp {
    match kind {
        EventKind::Create(_) => ChangeOp::Create,
        EventKind::Remove(_) => ChangeOp::Remove,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeOp::Rename,
        EventKind::Modify(ModifyKind::Metadata(_)) => ChangeOp::Metadata,
        _ => ChangeOp::Write,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, MetadataKind, ModifyKind, RemoveKind, RenameMode};
    use std::time::Duration;

    fn no_roots(_: &Path) -> bool {
        false
    }

    #[test]
    fn kinds_map_to_canonical_ops() {
        assert_eq!(
            op_for_kind(&EventKind::Create(CreateKind::File)),
            ChangeOp::Create
        );
        assert_eq!(
            op_for_kind(&EventKind::Remove(RemoveKind::File)),
            ChangeOp::Remove
        );
        assert_eq!(
            op_for_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Any))),
            ChangeOp::Rename
        );
        assert_eq!(
            op_for_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            ChangeOp::Metadata
        );
        assert_eq!(
            op_for_kind(&EventKind::Modify(ModifyKind::Data(
                notify::event::DataChange::Content
            ))),
            ChangeOp::Write
        );
        assert_eq!(op_for_kind(&EventKind::Any), ChangeOp::Write);
    }

    #[test]
    fn consecutive_duplicate_creates_collapse() {
        let mut tr = Translator::default();
        assert!(tr
            .translate(PathBuf::from("/x"), ChangeOp::Create, no_roots)
            .is_some());
        assert!(tr
            .translate(PathBuf::from("/x"), ChangeOp::Create, no_roots)
            .is_none());
    }

    #[test]
    fn differing_create_path_resets_dedup_state() {
        let mut tr = Translator::default();
        let mut emitted = 0;
        for path in ["/x", "/y", "/x"] {
            if tr
                .translate(PathBuf::from(path), ChangeOp::Create, no_roots)
                .is_some()
            {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 3);
    }

    #[test]
    fn non_create_events_do_not_reset_dedup_state() {
        let mut tr = Translator::default();
        assert!(tr
            .translate(PathBuf::from("/x"), ChangeOp::Create, no_roots)
            .is_some());
        assert!(tr
            .translate(PathBuf::from("/x"), ChangeOp::Write, no_roots)
            .is_some());
        assert!(tr
            .translate(PathBuf::from("/x"), ChangeOp::Create, no_roots)
            .is_none());
    }

    #[test]
    fn create_and_write_for_a_watch_root_are_discarded() {
        let mut tr = Translator::default();
        let is_root = |p: &Path| p == Path::new("/root");
        assert!(tr
            .translate(PathBuf::from("/root"), ChangeOp::Create, is_root)
            .is_none());
        assert!(tr
            .translate(PathBuf::from("/root"), ChangeOp::Write, is_root)
            .is_none());
        // Removal of the root itself is still reported.
        assert!(tr
            .translate(PathBuf::from("/root"), ChangeOp::Remove, is_root)
            .is_some());
    }

    #[tokio::test]
    async fn descendant_root_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let child = dir.path().join("sub");
        std::fs::create_dir(&child).expect("mkdir");

        let (watcher, _events, _errors) = DirWatcher::new().expect("watcher");
        watcher.add_root(dir.path()).expect("add root");
        watcher.add_root(&child).expect("add child");
        watcher.add_root(dir.path()).expect("re-add root");
        assert_eq!(watcher.roots(), vec![dir.path().to_path_buf()]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_streams() {
        let (watcher, mut events, mut errors) = DirWatcher::new().expect("watcher");
        watcher.close();
        watcher.close();
        assert!(watcher.add_root("/tmp").is_err());
        assert!(events.recv().await.is_none());
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn emits_canonical_events_for_new_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (watcher, mut events, _errors) = DirWatcher::new().expect("watcher");
        watcher.add_root(dir.path()).expect("add root");

        let file = dir.path().join("hello.txt");
        std::fs::write(&file, b"hi").expect("write");

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event within timeout")
            .expect("stream open");
        assert_eq!(event.path, file);
        assert!(matches!(event.op, ChangeOp::Create | ChangeOp::Write));
        watcher.close();
    }
}
