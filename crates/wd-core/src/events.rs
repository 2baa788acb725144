use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Canonical filesystem operation, normalized from whatever flag soup the
/// native backend reports. Translation priority when a backend reports
/// several flags at once: create beats remove beats rename beats
/// owner/metadata change; anything else is a plain write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeOp {
    Create,
    Write,
    Remove,
    Rename,
    Metadata,
}

/// One canonical change event as emitted by the watcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub op: ChangeOp,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, op: ChangeOp) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }
}

/// Append `incoming` onto `queued`, preserving first-seen order and
/// suppressing duplicates. Used for the session's queued-changed-paths
/// list, which accumulates between runs.
pub fn merge_paths(queued: &mut Vec<String>, incoming: impl IntoIterator<Item = String>) {
    for path in incoming {
        if !queued.iter().any(|existing| *existing == path) {
            queued.push(path);
        }
    }
}
