use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::watch;

/// A cancellation signal shared by cooperating tasks.
///
/// Cancelling a signal also cancels every child derived from it with
/// [`Shutdown::child`]; cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    tx: watch::Sender<bool>,
    parent: Option<Shutdown>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Shutdown>) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { tx, parent }),
        }
    }

    pub fn child(&self) -> Shutdown {
        Self::with_parent(Some(self.clone()))
    }

    pub fn cancel(&self) {
        self.inner.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.tx.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(|parent| parent.is_cancelled())
    }

    /// Resolves once this signal or any ancestor is cancelled.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.inner.tx.subscribe();
            let own = async move {
                // The sender lives as long as `self`, so this only returns on cancel.
                let _ = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
            };
            match &self.inner.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = own => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminate the process with status 1 if it is still alive after `after`.
///
/// `on_expire` runs on the timer thread right before exiting, e.g. to restore
/// the local terminal.
pub fn force_exit_after<F>(after: Duration, on_expire: F)
where
    F: FnOnce() + Send + 'static,
{
    let spawned = thread::Builder::new()
        .name("force-exit".to_string())
        .spawn(move || {
            thread::sleep(after);
            log::warn!("shutdown did not finish within {after:?}, forcing exit");
            on_expire();
            std::process::exit(1);
        });
    if let Err(err) = spawned {
        log::error!("failed to arm force-exit timer: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!shutdown.is_cancelled());
        shutdown.cancel();
        timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(shutdown.is_cancelled());

        // Already cancelled resolves immediately.
        timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancels_child_only_downwards() {
        let parent = Shutdown::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
        timeout(Duration::from_secs(1), other.cancelled())
            .await
            .unwrap();
    }
}
