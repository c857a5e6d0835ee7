//! Listening sockets that survive a binary upgrade.
//!
//! Components never bind their listeners directly; they ask a
//! [`ListenerRegistry`]. On SIGHUP the [`HandoffRegistry`] re-executes the
//! current binary, passing every active listener as an inherited descriptor.
//! The successor adopts them by path, reports readiness over a socketpair,
//! and the old process then drains and exits. Connections already accepted
//! by the old process stay with it until they finish.

use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::net::prepare_unix_socket;
use crate::shutdown::{force_exit_after, Shutdown};

/// JSON array of the listener paths handed to a successor, in descriptor order.
pub const LISTENERS_ENV: &str = "HOSTPTY_UPGRADE_LISTENERS";
/// Descriptor the successor writes one byte to once it is serving.
pub const READY_FD_ENV: &str = "HOSTPTY_UPGRADE_READY_FD";
/// How long the old process waits for its successor, and then for itself to drain.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(30);

const READY_FD: RawFd = 3;
const FIRST_LISTENER_FD: RawFd = READY_FD + 1;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("graceful upgrade is not supported by this listener registry")]
    Unsupported,

    #[error("an upgrade is already in progress")]
    InProgress,

    #[error("failed to start the new process: {0}")]
    Spawn(#[source] io::Error),

    #[error("new process exited before it was ready")]
    ChildExited,

    #[error("new process was not ready within {0:?}")]
    Timeout(Duration),

    #[error("inherited listeners are unusable: {0}")]
    Inherit(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Source of listening sockets for every server in the process.
pub trait ListenerRegistry: Send + Sync {
    /// Bind a listener on `path`, or adopt the one inherited for it.
    ///
    /// Must be called from within a tokio runtime.
    fn listen_unix(&self, path: &Path) -> io::Result<UnixListener>;

    /// Forget the listener on `path`; it is no longer handed to successors.
    fn release(&self, path: &Path);

    /// Start a successor and block until it is ready.
    fn upgrade(&self) -> Result<(), UpgradeError>;

    /// Tell the parent, if any, that this process is serving.
    fn ready(&self) -> Result<(), UpgradeError>;

    /// Becomes `true` once a successor took over and this process should exit.
    fn exit_signal(&self) -> watch::Receiver<bool>;
}

/// Binds listeners directly and never upgrades.
pub struct StaticRegistry {
    exit: watch::Sender<bool>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        let (exit, _rx) = watch::channel(false);
        Self { exit }
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry for StaticRegistry {
    fn listen_unix(&self, path: &Path) -> io::Result<UnixListener> {
        prepare_unix_socket(path)?;
        UnixListener::bind(path)
    }

    fn release(&self, _path: &Path) {}

    fn upgrade(&self) -> Result<(), UpgradeError> {
        Err(UpgradeError::Unsupported)
    }

    fn ready(&self) -> Result<(), UpgradeError> {
        Ok(())
    }

    fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }
}

/// Hands listeners to a re-executed copy of the current binary.
pub struct HandoffRegistry {
    inherited: Mutex<HashMap<PathBuf, StdUnixListener>>,
    /// Duplicates of every live listener, kept for handoff.
    active: Mutex<BTreeMap<PathBuf, StdUnixListener>>,
    ready_fd: Mutex<Option<OwnedFd>>,
    upgrading: AtomicBool,
    exit: watch::Sender<bool>,
    timeout: Duration,
    args: Vec<OsString>,
}

impl HandoffRegistry {
    /// Build the registry, adopting listeners passed down by a parent process.
    ///
    /// The handoff variables are removed from the environment so shells
    /// spawned later never see them.
    pub fn from_env(timeout: Duration) -> Result<Self, UpgradeError> {
        let mut inherited = HashMap::new();
        if let Some(raw) = env::var_os(LISTENERS_ENV) {
            env::remove_var(LISTENERS_ENV);
            let raw = raw
                .into_string()
                .map_err(|_| UpgradeError::Inherit(format!("{LISTENERS_ENV} is not UTF-8")))?;
            let paths: Vec<PathBuf> = serde_json::from_str(&raw)
                .map_err(|e| UpgradeError::Inherit(format!("bad {LISTENERS_ENV}: {e}")))?;

            for (index, path) in paths.into_iter().enumerate() {
                let fd = FIRST_LISTENER_FD + index as RawFd;
                set_cloexec(fd)?;
                // SAFETY: the parent placed this listener at exactly this
                // descriptor and nothing else in the process owns it.
                let listener = unsafe { StdUnixListener::from_raw_fd(fd) };
                listener.local_addr().map_err(|e| {
                    UpgradeError::Inherit(format!("fd {fd} for {}: {e}", path.display()))
                })?;
                log::debug!("inherited listener {} on fd {fd}", path.display());
                inherited.insert(path, listener);
            }
        }

        let ready_fd = match env::var(READY_FD_ENV) {
            Ok(raw) => {
                env::remove_var(READY_FD_ENV);
                let fd: RawFd = raw
                    .parse()
                    .map_err(|_| UpgradeError::Inherit(format!("bad {READY_FD_ENV}: {raw}")))?;
                set_cloexec(fd)?;
                // SAFETY: as above, the parent passed its end of the ready socketpair here.
                Some(unsafe { OwnedFd::from_raw_fd(fd) })
            }
            Err(_) => None,
        };

        let (exit, _rx) = watch::channel(false);
        Ok(Self {
            inherited: Mutex::new(inherited),
            active: Mutex::new(BTreeMap::new()),
            ready_fd: Mutex::new(ready_fd),
            upgrading: AtomicBool::new(false),
            exit,
            timeout,
            args: env::args_os().skip(1).collect(),
        })
    }

    /// Whether this process was started by an upgrade.
    pub fn is_successor(&self) -> bool {
        self.ready_fd.lock().is_some()
    }

    fn spawn_successor(&self) -> Result<(), UpgradeError> {
        let (mut ready_rx, ready_tx) = StdUnixStream::pair()?;
        let active = self.active.lock();

        let paths: Vec<&Path> = active.keys().map(PathBuf::as_path).collect();
        let mut sources = vec![ready_tx.as_raw_fd()];
        sources.extend(active.values().map(AsRawFd::as_raw_fd));
        let mut staged = vec![-1; sources.len()];

        let mut cmd = Command::new(env::current_exe()?);
        cmd.args(&self.args)
            .env(LISTENERS_ENV, serde_json::to_string(&paths).map_err(io::Error::from)?)
            .env(READY_FD_ENV, READY_FD.to_string());
        // SAFETY: the hook only calls async-signal-safe fcntl/dup2 and writes
        // into buffers allocated before fork.
        unsafe {
            cmd.pre_exec(move || {
                // Stage above the target range first so no source is
                // clobbered, then move into place without CLOEXEC.
                let floor = READY_FD + sources.len() as RawFd;
                for (slot, fd) in staged.iter_mut().zip(&sources) {
                    *slot = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, floor);
                    if *slot < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                for (target, fd) in (READY_FD..).zip(&staged) {
                    if libc::dup2(*fd, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(UpgradeError::Spawn)?;
        drop(active);
        drop(ready_tx);
        log::info!("started successor pid {}", child.id());

        ready_rx.set_read_timeout(Some(self.timeout))?;
        let mut buf = [0u8; 1];
        let outcome = match ready_rx.read(&mut buf) {
            Ok(1) => Ok(()),
            Ok(_) => Err(UpgradeError::ChildExited),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Err(UpgradeError::Timeout(self.timeout))
            }
            Err(err) => Err(UpgradeError::Io(err)),
        };

        if outcome.is_err() {
            let _ = child.kill();
            let _ = child.wait();
        }
        outcome
    }
}

impl ListenerRegistry for HandoffRegistry {
    fn listen_unix(&self, path: &Path) -> io::Result<UnixListener> {
        let listener = match self.inherited.lock().remove(path) {
            Some(listener) => {
                log::info!("adopted inherited listener {}", path.display());
                listener
            }
            None => {
                prepare_unix_socket(path)?;
                StdUnixListener::bind(path)?
            }
        };
        listener.set_nonblocking(true)?;
        let handoff = listener.try_clone()?;
        self.active.lock().insert(path.to_path_buf(), handoff);
        UnixListener::from_std(listener)
    }

    fn release(&self, path: &Path) {
        self.active.lock().remove(path);
    }

    fn upgrade(&self) -> Result<(), UpgradeError> {
        if self.upgrading.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::InProgress);
        }
        match self.spawn_successor() {
            Ok(()) => {
                self.exit.send_replace(true);
                Ok(())
            }
            Err(err) => {
                self.upgrading.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn ready(&self) -> Result<(), UpgradeError> {
        if let Some(fd) = self.ready_fd.lock().take() {
            let mut parent = StdUnixStream::from(fd);
            parent.write_all(b"1")?;
            log::info!("signalled readiness to the previous process");
        }
        for (path, _listener) in self.inherited.lock().drain() {
            log::warn!("closing unused inherited listener {}", path.display());
        }
        Ok(())
    }

    fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit.subscribe()
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor number has no memory-safety requirements.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wire a registry into the process lifecycle.
///
/// SIGHUP starts an upgrade. Once a successor is serving, `shutdown` is
/// cancelled and the process is force-exited if it has not drained within
/// `timeout`. Finally tells a parent process, if any, that we are ready.
pub fn init_graceful_upgrade(
    registry: Arc<dyn ListenerRegistry>,
    shutdown: Shutdown,
    timeout: Duration,
) -> Result<(), UpgradeError> {
    let mut hangup = signal(SignalKind::hangup())?;
    let upgrader = registry.clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                received = hangup.recv() => {
                    if received.is_none() {
                        return;
                    }
                }
            }
            log::info!("SIGHUP received, starting graceful upgrade");
            let registry = upgrader.clone();
            match tokio::task::spawn_blocking(move || registry.upgrade()).await {
                Ok(Ok(())) => return,
                Ok(Err(err)) => log::error!("graceful upgrade failed: {err}"),
                Err(err) => log::error!("graceful upgrade task failed: {err}"),
            }
        }
    });

    let mut exit = registry.exit_signal();
    tokio::spawn(async move {
        if exit.wait_for(|exit| *exit).await.is_ok() {
            log::info!("successor is serving, draining");
            shutdown.cancel();
            force_exit_after(timeout, || {});
        }
    });

    registry.ready()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn registry() -> HandoffRegistry {
        let (exit, _rx) = watch::channel(false);
        HandoffRegistry {
            inherited: Mutex::new(HashMap::new()),
            active: Mutex::new(BTreeMap::new()),
            ready_fd: Mutex::new(None),
            upgrading: AtomicBool::new(false),
            exit,
            timeout: Duration::from_secs(1),
            args: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_static_registry_binds_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pts0").join("pts0");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let registry = StaticRegistry::new();
        let listener = registry.listen_unix(&path).unwrap();
        let (accepted, dialed) =
            tokio::join!(listener.accept(), tokio::net::UnixStream::connect(&path));
        accepted.unwrap();
        dialed.unwrap();

        assert!(matches!(registry.upgrade(), Err(UpgradeError::Unsupported)));
        assert!(registry.ready().is_ok());
        assert!(!*registry.exit_signal().borrow());
    }

    #[tokio::test]
    async fn test_handoff_tracks_active_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.sock");
        let b = dir.path().join("b.sock");

        let registry = registry();
        let _a = registry.listen_unix(&a).unwrap();
        let _b = registry.listen_unix(&b).unwrap();
        assert_eq!(registry.active.lock().len(), 2);

        registry.release(&a);
        let active: Vec<PathBuf> = registry.active.lock().keys().cloned().collect();
        assert_eq!(active, vec![b]);
    }

    #[tokio::test]
    async fn test_adopted_listener_accepts_on_old_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pts1.sock");
        let original = StdUnixListener::bind(&path).unwrap();

        let registry = registry();
        registry.inherited.lock().insert(path.clone(), original);
        let listener = registry.listen_unix(&path).unwrap();
        assert!(registry.inherited.lock().is_empty());

        let (accepted, dialed) =
            tokio::join!(listener.accept(), tokio::net::UnixStream::connect(&path));
        let (mut server, _) = accepted.unwrap();
        let mut client = dialed.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[test]
    fn test_ready_writes_to_parent() {
        let (mut parent, child) = StdUnixStream::pair().unwrap();
        let registry = registry();
        *registry.ready_fd.lock() = Some(OwnedFd::from(child));
        assert!(registry.is_successor());

        registry.ready().unwrap();
        let mut buf = [0u8; 1];
        parent.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"1");
        assert!(!registry.is_successor());
    }

    #[test]
    fn test_second_upgrade_is_rejected_while_running() {
        let registry = registry();
        registry.upgrading.store(true, Ordering::SeqCst);
        assert!(matches!(registry.upgrade(), Err(UpgradeError::InProgress)));
    }
}
