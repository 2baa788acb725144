//! Local-directory mirroring bridge.
//!
//! Keeps a store pointer in sync with the contents of a directory: one
//! initial scan-and-commit, then a worker that consumes canonical change
//! events and commits a fresh snapshot whenever a matched file's content
//! digest actually changes.

use crate::{hash_bytes, FileMatcher, MemStore, PointerId, SnapshotFiles, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wd_core::{ChangeEvent, ChangeOp};
use wd_watcher::{DirWatcher, WatchError};

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Watch(#[from] WatchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Handle to a running mirror. Closing it tears down the watcher, which in
/// turn ends the worker task.
pub struct Mirror {
    watcher: DirWatcher,
    task: JoinHandle<()>,
}

impl Mirror {
    pub fn close(&self) {
        self.watcher.close();
    }

    /// Wait for the worker to drain after `close`.
    pub async fn join(self) {
        self.watcher.close();
        let _ = self.task.await;
    }
}

/// Mirror `root` into the pointer, committing the initial snapshot before
/// returning. Must be called from within a tokio runtime; intended to run
/// once at startup, before the session loop begins.
pub fn mirror_directory_into(
    store: Arc<MemStore>,
    root: PathBuf,
    ptr: PointerId,
    matcher: FileMatcher,
) -> Result<Mirror, MirrorError> {
    let (watcher, events, errors) = DirWatcher::new()?;
    let files = scan(&root, &matcher)?;
    store.acquire(&ptr)?;
    store.commit(&ptr, files.clone())?;
    watcher.add_root(&root)?;

    let task = tokio::spawn(mirror_loop(store, root, ptr, matcher, files, events, errors));
    Ok(Mirror { watcher, task })
}

fn scan(root: &Path, matcher: &FileMatcher) -> Result<SnapshotFiles, MirrorError> {
    let mut files = SnapshotFiles::new();
    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(root).to_path_buf();
            MirrorError::Scan {
                source: err.into(),
                path,
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative(root, entry.path()) else {
            continue;
        };
        if !matcher.matches(&rel) {
            continue;
        }
        let data = std::fs::read(entry.path()).map_err(|source| MirrorError::Scan {
            path: entry.path().to_path_buf(),
            source,
        })?;
        files.insert(rel, hash_bytes(&data));
    }
    Ok(files)
}

async fn mirror_loop(
    store: Arc<MemStore>,
    root: PathBuf,
    ptr: PointerId,
    matcher: FileMatcher,
    mut files: SnapshotFiles,
    mut events: mpsc::Receiver<ChangeEvent>,
    mut errors: mpsc::Receiver<WatchError>,
) {
    loop {
        tokio::select! {
            maybe = events.recv() => {
                let Some(event) = maybe else { break };
                if !apply_event(&root, &matcher, &mut files, &event).await {
                    continue;
                }
                if let Err(err) = store.commit(&ptr, files.clone()) {
                    warn!(error = %err, "mirror commit failed; stopping");
                    break;
                }
                debug!(path = %event.path.display(), "mirrored change");
            }
            Some(err) = errors.recv() => {
                warn!(error = %err, "watch error while mirroring");
            }
        }
    }
}

/// Fold one change event into the file map; returns whether anything
/// actually changed (digest-equality suppresses no-op commits).
async fn apply_event(
    root: &Path,
    matcher: &FileMatcher,
    files: &mut SnapshotFiles,
    event: &ChangeEvent,
) -> bool {
    let Some(rel) = relative(root, &event.path) else {
        return false;
    };
    if !matcher.matches(&rel) {
        return false;
    }
    match event.op {
        // A rename reports the old name; the new name arrives as a create.
        ChangeOp::Remove | ChangeOp::Rename => files.remove(&rel).is_some(),
        ChangeOp::Create | ChangeOp::Write | ChangeOp::Metadata => {
            match tokio::fs::read(&event.path).await {
                Ok(data) => {
                    let digest = hash_bytes(&data);
                    files.insert(rel, digest) != Some(digest)
                }
                // Gone by the time we looked; treat as removal.
                Err(_) => files.remove(&rel).is_some(),
            }
        }
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
}
