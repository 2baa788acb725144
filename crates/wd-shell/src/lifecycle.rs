//! Run lifecycle management: at most one in-flight run, superseded runs
//! cancelled with a bounded grace window.

use crate::engine::{RunEngine, RunEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

pub struct RunLifecycle<E> {
    engine: Arc<E>,
    cancel: Option<watch::Sender<bool>>,
    grace: Duration,
}

impl<E: RunEngine> RunLifecycle<E> {
    pub fn new(engine: Arc<E>, grace: Duration) -> Self {
        Self {
            engine,
            cancel: None,
            grace,
        }
    }

    /// Start a run against `target`, first cancelling the previous run (its
    /// event channel is handed back in `previous`). Returns the new run's
    /// event stream.
    pub async fn start(
        &mut self,
        target: &str,
        previous: Option<mpsc::Receiver<RunEvent>>,
    ) -> mpsc::Receiver<RunEvent> {
        self.cancel_active(previous).await;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);
        debug!(target, "launching run");
        self.engine.start(cancel_rx, target)
    }

    /// Signal cancellation and wait, up to the grace window, for the run's
    /// event channel to close (the sign that its process tree has exited).
    /// Past the window the run is abandoned: residual events are drained
    /// and discarded in the background and never reach the session again.
    pub async fn cancel_active(&mut self, previous: Option<mpsc::Receiver<RunEvent>>) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        let _ = cancel.send(true);
        let Some(mut events) = previous else {
            return;
        };
        let deadline = Instant::now() + self.grace;
        loop {
            match timeout_at(deadline, events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => {
                    warn!(
                        grace_ms = self.grace.as_millis() as u64,
                        "superseded run did not stop in time; abandoning it"
                    );
                    tokio::spawn(async move { while events.recv().await.is_some() {} });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Closes its event channel as soon as cancellation is requested.
    struct ObedientEngine;

    impl RunEngine for ObedientEngine {
        fn start(&self, mut cancel: watch::Receiver<bool>, _target: &str) -> mpsc::Receiver<RunEvent> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                let _ = cancel.wait_for(|stop| *stop).await;
                drop(tx);
            });
            rx
        }
    }

    /// Ignores cancellation and keeps its event channel open forever.
    struct StubbornEngine;

    impl RunEngine for StubbornEngine {
        fn start(&self, _cancel: watch::Receiver<bool>, _target: &str) -> mpsc::Receiver<RunEvent> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                loop {
                    if tx
                        .send(RunEvent::CommandOutput {
                            chunk: "tick\n".to_string(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn supersede_waits_for_acknowledging_run() {
        let mut lifecycle = RunLifecycle::new(Arc::new(ObedientEngine), Duration::from_secs(5));
        let first = lifecycle.start("", None).await;

        let started = Instant::now();
        let _second = lifecycle.start("", Some(first)).await;
        // The obedient run closes promptly; we never burn the grace window.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn supersede_abandons_unresponsive_run_after_grace() {
        let grace = Duration::from_millis(100);
        let mut lifecycle = RunLifecycle::new(Arc::new(StubbornEngine), grace);
        let first = lifecycle.start("", None).await;

        let started = Instant::now();
        let mut second = lifecycle.start("", Some(first)).await;
        let waited = started.elapsed();
        assert!(waited >= grace, "waited {waited:?}");
        assert!(waited < Duration::from_secs(5));

        // The replacement run is live and is the only one we hold.
        assert!(second.recv().await.is_some());
    }

    #[tokio::test]
    async fn shutdown_cancel_without_prior_run_is_a_no_op() {
        let mut lifecycle = RunLifecycle::new(Arc::new(ObedientEngine), Duration::from_millis(50));
        lifecycle.cancel_active(None).await;
    }
}
