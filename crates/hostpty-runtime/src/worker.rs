//! Groups of cooperating background workers.
//!
//! Every worker yields exactly one `Result` on its own channel and may signal
//! its spawner through a [`Continue`] callback once an initial phase is done
//! (for example "listener bound, start dialing"). The group keeps a count of
//! running workers so shutdown can wait for all of them.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, oneshot, Notify};

/// Tracks every worker launched through it.
#[derive(Clone, Default)]
pub struct WorkerGroup {
    inner: Arc<GroupInner>,
}

#[derive(Default)]
struct GroupInner {
    active: AtomicUsize,
    idle: Notify,
}

/// Decrements the active count when a worker finishes, even by panicking.
struct ActiveGuard {
    inner: Arc<GroupInner>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Lets a worker tell its spawner that it reached a checkpoint.
#[derive(Clone)]
pub struct Continue {
    tx: mpsc::Sender<()>,
}

impl Continue {
    pub fn signal(&self) {
        // A pending signal is as good as two.
        let _ = self.tx.try_send(());
    }
}

/// The spawner's side of one worker.
pub struct WorkerHandle<T, E> {
    name: String,
    continued: mpsc::Receiver<()>,
    outcome: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> WorkerHandle<T, E> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the worker's next [`Continue::signal`].
    ///
    /// Returns `false` if the worker finished without signalling.
    pub async fn wait_continue(&mut self) -> bool {
        self.continued.recv().await.is_some()
    }

    /// Wait for the worker's outcome.
    ///
    /// `None` means the worker panicked, or the outcome was already taken.
    pub async fn join(&mut self) -> Option<Result<T, E>> {
        (&mut self.outcome).await.ok()
    }

    /// The outcome if the worker already finished.
    pub fn try_join(&mut self) -> Option<Result<T, E>> {
        self.outcome.try_recv().ok()
    }
}

impl WorkerGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of workers that have not finished yet.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    fn enter(&self) -> ActiveGuard {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        ActiveGuard {
            inner: self.inner.clone(),
        }
    }

    fn channels<T, E>(
        name: String,
    ) -> (Continue, oneshot::Sender<Result<T, E>>, WorkerHandle<T, E>) {
        let (cont_tx, continued) = mpsc::channel(1);
        let (out_tx, outcome) = oneshot::channel();
        let handle = WorkerHandle {
            name,
            continued,
            outcome,
        };
        (Continue { tx: cont_tx }, out_tx, handle)
    }

    /// Launch an async worker on the current tokio runtime.
    pub fn spawn<T, E, F, Fut>(&self, name: impl Into<String>, f: F) -> WorkerHandle<T, E>
    where
        F: FnOnce(Continue) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (cont, out_tx, handle) = Self::channels(name.into());
        let guard = self.enter();
        let fut = f(cont);
        let name = handle.name.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let result = fut.await;
            log::trace!("worker {name} finished");
            let _ = out_tx.send(result);
        });
        handle
    }

    /// Launch a worker on a dedicated, named OS thread.
    ///
    /// Used for blocking reads that must never tie up the async runtime.
    pub fn spawn_thread<T, E, F>(
        &self,
        name: impl Into<String>,
        f: F,
    ) -> io::Result<WorkerHandle<T, E>>
    where
        F: FnOnce(Continue) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (cont, out_tx, handle) = Self::channels(name.into());
        let guard = self.enter();
        thread::Builder::new()
            .name(handle.name.clone())
            .spawn(move || {
                let _guard = guard;
                let result = f(cont);
                let _ = out_tx.send(result);
            })?;
        Ok(handle)
    }

    /// Wait until every worker launched through this group has finished.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
