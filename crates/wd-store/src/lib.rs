//! In-memory content-addressed store.
//!
//! A pointer names a mutable location whose revision counter only ever goes
//! up; each revision resolves to an immutable snapshot, addressed by the
//! sha256 digest of its file map. The session consumes this through the
//! narrow acquire / head / wait / get / diff surface; the mirror (in
//! [`mirror`]) is the only writer.

pub mod mirror;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;

pub use mirror::{mirror_directory_into, Mirror, MirrorError};

pub type FileDigest = [u8; 32];

/// Relative path -> content digest, ordered by path.
pub type SnapshotFiles = BTreeMap<String, FileDigest>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown pointer {0}")]
    UnknownPointer(String),
    #[error("pointer {ptr} has no revision {rev}")]
    UnknownRevision { ptr: String, rev: u64 },
    #[error("unknown snapshot {0}")]
    UnknownSnapshot(SnapshotId),
    #[error("pointer {0} is closed")]
    Closed(String),
}

/// Identifier of a mutable named location in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointerId(String);

impl PointerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PointerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pointer observed at one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerAtRev {
    pub id: PointerId,
    pub rev: u64,
}

impl PointerAtRev {
    pub fn origin(id: PointerId) -> Self {
        Self { id, rev: 0 }
    }
}

/// Content address of a snapshot: sha256 over its ordered file map. The
/// all-zero id is the empty snapshot every pointer starts from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotId([u8; 32]);

impl SnapshotId {
    pub const EMPTY: SnapshotId = SnapshotId([0; 32]);
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SnapshotId({self})")
    }
}

/// Decides which relative paths take part in mirroring and diffing.
#[derive(Debug, Clone)]
pub enum FileMatcher {
    All,
    File(String),
}

impl FileMatcher {
    pub fn all() -> Self {
        Self::All
    }

    pub fn file(name: impl Into<String>) -> Self {
        Self::File(name.into())
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        match self {
            Self::All => true,
            Self::File(name) => rel_path == name,
        }
    }
}

struct PtrState {
    rev: u64,
    // revs[r - 1] is the snapshot for revision r; revision 0 is EMPTY.
    revs: Vec<SnapshotId>,
    advance: watch::Sender<u64>,
}

#[derive(Default)]
struct Inner {
    pointers: HashMap<String, PtrState>,
    snapshots: HashMap<SnapshotId, SnapshotFiles>,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the pointer exists and return its current position. Acquiring
    /// an existing pointer is a no-op.
    pub fn acquire(&self, ptr: &PointerId) -> Result<PointerAtRev, StoreError> {
        let mut inner = lock(&self.inner);
        let state = inner
            .pointers
            .entry(ptr.name().to_string())
            .or_insert_with(|| PtrState {
                rev: 0,
                revs: Vec::new(),
                advance: watch::channel(0).0,
            });
        Ok(PointerAtRev {
            id: ptr.clone(),
            rev: state.rev,
        })
    }

    pub fn head(&self, ptr: &PointerId) -> Result<PointerAtRev, StoreError> {
        let inner = lock(&self.inner);
        let state = inner
            .pointers
            .get(ptr.name())
            .ok_or_else(|| StoreError::UnknownPointer(ptr.name().to_string()))?;
        Ok(PointerAtRev {
            id: ptr.clone(),
            rev: state.rev,
        })
    }

    /// Block until the pointer moves past `at.rev`. Returns immediately if
    /// it already has.
    pub async fn wait_for_advance(&self, at: &PointerAtRev) -> Result<(), StoreError> {
        let mut rx = {
            let inner = lock(&self.inner);
            let state = inner
                .pointers
                .get(at.id.name())
                .ok_or_else(|| StoreError::UnknownPointer(at.id.name().to_string()))?;
            state.advance.subscribe()
            // Lock dropped before awaiting.
        };
        let target = at.rev;
        rx.wait_for(|rev| *rev > target)
            .await
            .map(|_| ())
            .map_err(|_| StoreError::Closed(at.id.name().to_string()))
    }

    pub fn get(&self, at: &PointerAtRev) -> Result<SnapshotId, StoreError> {
        if at.rev == 0 {
            return Ok(SnapshotId::EMPTY);
        }
        let inner = lock(&self.inner);
        let state = inner
            .pointers
            .get(at.id.name())
            .ok_or_else(|| StoreError::UnknownPointer(at.id.name().to_string()))?;
        state
            .revs
            .get(at.rev as usize - 1)
            .copied()
            .ok_or(StoreError::UnknownRevision {
                ptr: at.id.name().to_string(),
                rev: at.rev,
            })
    }

    /// Record `files` as the pointer's next revision and wake waiters.
    pub fn commit(&self, ptr: &PointerId, files: SnapshotFiles) -> Result<PointerAtRev, StoreError> {
        let id = snapshot_digest(&files);
        let mut inner = lock(&self.inner);
        inner.snapshots.entry(id).or_insert(files);
        let state = inner
            .pointers
            .get_mut(ptr.name())
            .ok_or_else(|| StoreError::UnknownPointer(ptr.name().to_string()))?;
        state.rev += 1;
        state.revs.push(id);
        let _ = state.advance.send(state.rev);
        Ok(PointerAtRev {
            id: ptr.clone(),
            rev: state.rev,
        })
    }

    /// Ordered list of paths whose content differs between two snapshots,
    /// restricted to paths the matcher accepts.
    pub fn diff_paths(
        &self,
        old: SnapshotId,
        new: SnapshotId,
        matcher: &FileMatcher,
    ) -> Result<Vec<String>, StoreError> {
        let inner = lock(&self.inner);
        let old_files = snapshot(&inner, old)?;
        let new_files = snapshot(&inner, new)?;

        let paths: BTreeSet<&String> = old_files.keys().chain(new_files.keys()).collect();
        Ok(paths
            .into_iter()
            .filter(|path| old_files.get(*path) != new_files.get(*path))
            .filter(|path| matcher.matches(path))
            .cloned()
            .collect())
    }
}

static EMPTY_FILES: SnapshotFiles = SnapshotFiles::new();

fn snapshot(inner: &Inner, id: SnapshotId) -> Result<&SnapshotFiles, StoreError> {
    if id == SnapshotId::EMPTY {
        return Ok(&EMPTY_FILES);
    }
    inner
        .snapshots
        .get(&id)
        .ok_or(StoreError::UnknownSnapshot(id))
}

fn snapshot_digest(files: &SnapshotFiles) -> SnapshotId {
    let mut hasher = Sha256::new();
    for (path, digest) in files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest);
    }
    SnapshotId(hasher.finalize().into())
}

pub fn hash_bytes(data: &[u8]) -> FileDigest {
    Sha256::digest(data).into()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn files(entries: &[(&str, &[u8])]) -> SnapshotFiles {
        entries
            .iter()
            .map(|(path, data)| (path.to_string(), hash_bytes(data)))
            .collect()
    }

    #[test]
    fn acquire_starts_at_revision_zero() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        let at = store.acquire(&ptr).expect("acquire");
        assert_eq!(at.rev, 0);
        assert_eq!(store.get(&at).expect("get"), SnapshotId::EMPTY);
    }

    #[test]
    fn commit_advances_head_monotonically() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        store.acquire(&ptr).expect("acquire");

        let first = store.commit(&ptr, files(&[("a", b"1")])).expect("commit");
        let second = store.commit(&ptr, files(&[("a", b"2")])).expect("commit");
        assert_eq!(first.rev, 1);
        assert_eq!(second.rev, 2);
        assert_eq!(store.head(&ptr).expect("head").rev, 2);
    }

    #[test]
    fn identical_content_yields_identical_snapshot_id() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        store.acquire(&ptr).expect("acquire");

        let first = store.commit(&ptr, files(&[("a", b"1")])).expect("commit");
        let second = store.commit(&ptr, files(&[("a", b"1")])).expect("commit");
        let id_one = store.get(&first).expect("get");
        let id_two = store.get(&second).expect("get");
        assert_eq!(id_one, id_two);
    }

    #[test]
    fn diff_paths_is_ordered_and_complete() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        store.acquire(&ptr).expect("acquire");

        let old = store
            .commit(&ptr, files(&[("b", b"1"), ("a", b"1"), ("gone", b"1")]))
            .expect("commit");
        let new = store
            .commit(&ptr, files(&[("b", b"2"), ("a", b"1"), ("new", b"1")]))
            .expect("commit");

        let old_id = store.get(&old).expect("get");
        let new_id = store.get(&new).expect("get");
        let diff = store
            .diff_paths(old_id, new_id, &FileMatcher::all())
            .expect("diff");
        assert_eq!(diff, vec!["b", "gone", "new"]);
    }

    #[test]
    fn diff_from_empty_lists_every_path() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        store.acquire(&ptr).expect("acquire");
        let head = store
            .commit(&ptr, files(&[("x", b"1"), ("y", b"2")]))
            .expect("commit");
        let id = store.get(&head).expect("get");
        let diff = store
            .diff_paths(SnapshotId::EMPTY, id, &FileMatcher::all())
            .expect("diff");
        assert_eq!(diff, vec!["x", "y"]);
    }

    #[test]
    fn diff_respects_matcher() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        store.acquire(&ptr).expect("acquire");
        let head = store
            .commit(&ptr, files(&[("Deckfile", b"1"), ("other", b"2")]))
            .expect("commit");
        let id = store.get(&head).expect("get");
        let diff = store
            .diff_paths(SnapshotId::EMPTY, id, &FileMatcher::file("Deckfile"))
            .expect("diff");
        assert_eq!(diff, vec!["Deckfile"]);
    }

    #[tokio::test]
    async fn wait_for_advance_returns_once_revision_moves() {
        let store = std::sync::Arc::new(MemStore::new());
        let ptr = PointerId::new("mirror");
        let at = store.acquire(&ptr).expect("acquire");

        let waiter = {
            let store = store.clone();
            let at = at.clone();
            tokio::spawn(async move { store.wait_for_advance(&at).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.commit(&ptr, files(&[("a", b"1")])).expect("commit");

        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter finished")
            .expect("join")
            .expect("advance observed");
    }

    #[tokio::test]
    async fn wait_for_advance_is_immediate_when_already_past() {
        let store = MemStore::new();
        let ptr = PointerId::new("mirror");
        let origin = store.acquire(&ptr).expect("acquire");
        store.commit(&ptr, files(&[("a", b"1")])).expect("commit");
        store.wait_for_advance(&origin).await.expect("no blocking");
    }
}
