//! Start/stop lifecycle shared by long-running services.
//!
//! A service holds a [`Playable`] and routes its own `start`/`stop` through it. Transitions are
//! serialized, repeated calls are no-ops, and the status can be observed through a watch channel.

use std::future::Future;

use tokio::sync::{watch, Mutex};

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Status {
    /// Not running. The initial state.
    Stopped,
    /// `start` is in progress.
    Starting,
    /// Running.
    Started,
    /// `stop` is in progress.
    Stopping,
}

/// The lifecycle state machine: `stopped -> starting -> started -> stopping -> stopped`.
#[derive(Debug)]
pub struct Playable {
    transition: Mutex<()>,
    status: watch::Sender<Status>,
}

impl Default for Playable {
    fn default() -> Self {
        Self::new()
    }
}

/// Puts the status back if a transition future is dropped halfway.
struct Rollback<'a> {
    status: &'a watch::Sender<Status>,
    to: Status,
    armed: bool,
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.status.send_replace(self.to);
        }
    }
}

impl Playable {
    /// A stopped lifecycle.
    pub fn new() -> Self {
        let (status, _) = watch::channel(Status::Stopped);
        Self {
            transition: Mutex::new(()),
            status,
        }
    }

    /// The current status.
    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn watch(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    /// Run `starting` and move to [`Status::Started`].
    ///
    /// Does nothing unless stopped. If `starting` fails the status returns to
    /// [`Status::Stopped`].
    pub async fn start<F, Fut, E>(&self, starting: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.transition.lock().await;
        if self.status() != Status::Stopped {
            return Ok(());
        }
        self.status.send_replace(Status::Starting);
        let mut rollback = Rollback {
            status: &self.status,
            to: Status::Stopped,
            armed: true,
        };
        starting().await?;
        rollback.armed = false;
        self.status.send_replace(Status::Started);
        Ok(())
    }

    /// Run `stopping` and move to [`Status::Stopped`].
    ///
    /// Does nothing unless started. The status ends up stopped even if `stopping` fails.
    pub async fn stop<F, Fut, E>(&self, stopping: F) -> Result<(), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let _guard = self.transition.lock().await;
        if self.status() != Status::Started {
            return Ok(());
        }
        self.status.send_replace(Status::Stopping);
        let _rollback = Rollback {
            status: &self.status,
            to: Status::Stopped,
            armed: true,
        };
        stopping().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use testresult::TestResult;

    use super::*;

    #[tokio::test]
    async fn transitions() -> TestResult {
        let playable = Playable::new();
        let mut watch = playable.watch();
        assert_eq!(playable.status(), Status::Stopped);

        let calls = AtomicUsize::new(0);
        let start = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            anyhow::Ok(())
        };
        playable.start(start).await?;
        playable.start(start).await?;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(playable.status(), Status::Started);
        assert!(watch.has_changed()?);
        assert_eq!(*watch.borrow_and_update(), Status::Started);

        playable.stop(|| async { anyhow::Ok(()) }).await?;
        assert_eq!(playable.status(), Status::Stopped);
        assert_eq!(playable.status().to_string(), "stopped");
        Ok(())
    }

    #[tokio::test]
    async fn failed_start_returns_to_stopped() {
        let playable = Playable::new();
        let res = playable
            .start(|| async { Err::<(), _>(anyhow::anyhow!("no network")) })
            .await;
        assert!(res.is_err());
        assert_eq!(playable.status(), Status::Stopped);
        // stopping a stopped service is a no-op
        playable
            .stop(|| async { Err::<(), _>(anyhow::anyhow!("unreachable")) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_starts_run_once() -> TestResult {
        let playable = Arc::new(Playable::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let tasks = (0..4).map(|_| {
            let playable = playable.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                playable
                    .start(|| async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        anyhow::Ok(())
                    })
                    .await
            })
        });
        for res in futures::future::join_all(tasks).await {
            res??;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(playable.status(), Status::Started);
        Ok(())
    }
}
