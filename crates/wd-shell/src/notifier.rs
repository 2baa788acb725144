//! Background workers feeding the session loop: the edit notifier that turns
//! store advances into channel messages, and the panic monitor that turns a
//! worker panic into a fatal session error instead of a silent stall.

use crate::session::SessionError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use wd_store::{MemStore, PointerAtRev, PointerId, StoreError};

/// Watch the pointer from revision 0 and push every observed head into
/// `edits`. A store error is reported once on `errors`, then the notifier
/// stops; a closed edits channel stops it silently.
pub fn spawn_edit_notifier(
    store: Arc<MemStore>,
    ptr: PointerId,
    edits: mpsc::Sender<PointerAtRev>,
    errors: mpsc::Sender<StoreError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut at = PointerAtRev::origin(ptr);
        loop {
            if let Err(err) = store.wait_for_advance(&at).await {
                let _ = errors.send(err).await;
                return;
            }
            at = match store.head(&at.id) {
                Ok(head) => head,
                Err(err) => {
                    let _ = errors.send(err).await;
                    return;
                }
            };
            debug!(ptr = %at.id, rev = at.rev, "pointer advanced");
            if edits.send(at.clone()).await.is_err() {
                return;
            }
        }
    })
}

/// Forward a worker panic as a fatal session error. Normal exit and
/// cancellation pass through silently.
pub fn monitor_worker(
    worker: &'static str,
    handle: JoinHandle<()>,
    fatal: mpsc::Sender<SessionError>,
) {
    tokio::spawn(async move {
        let Err(err) = handle.await else { return };
        if !err.is_panic() {
            return;
        }
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        let _ = fatal
            .send(SessionError::WorkerPanic { worker, message })
            .await;
    });
}
