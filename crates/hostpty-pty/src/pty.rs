use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hostpty_proto::Size;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Notify;

/// Errors from PTY operations.
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("PTY spawn failed: {0}")]
    Spawn(String),

    #[error("PTY I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("PTY is closed")]
    Closed,

    #[error("invalid PTY size {cols}x{rows}")]
    InvalidSize { cols: u32, rows: u32 },
}

/// Lifecycle of the shell behind a [`TerminalProcess`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited,
}

const RUNNING: u8 = 0;
const EXITED: u8 = 1;

/// Written once by the exit watcher, read by anyone.
struct ExitState {
    state: AtomicU8,
    changed: Notify,
}

impl ExitState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RUNNING),
            changed: Notify::new(),
        }
    }

    fn load(&self) -> ProcessState {
        match self.state.load(Ordering::Acquire) {
            EXITED => ProcessState::Exited,
            _ => ProcessState::Running,
        }
    }

    fn mark_exited(&self) {
        self.state.store(EXITED, Ordering::Release);
        self.changed.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.load() == ProcessState::Exited {
                return;
            }
            notified.await;
        }
    }
}

struct Inner {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    last_size: Mutex<Size>,
    exit: ExitState,
    /// Held by the watcher from marking the exit until the child is reaped,
    /// and by `kill` while it signals, so a reaped pid is never signalled.
    reaping: Mutex<()>,
}

impl Inner {
    fn release_pty(&self) {
        self.writer.lock().take();
        self.master.lock().take();
    }
}

/// One shell running on its own pseudo-terminal.
///
/// The master side is closed either by [`TerminalProcess::close`] or by the
/// exit watcher once the shell is gone; after that every operation reports
/// [`PtyError::Closed`].
pub struct TerminalProcess {
    inner: Arc<Inner>,
    pid: Option<u32>,
}

impl TerminalProcess {
    /// Spawn `shell` on a fresh PTY of `cols` x `rows`.
    ///
    /// An empty `shell` selects the platform default (`sh`, or `cmd.exe` on
    /// Windows).
    pub fn open(shell: &str, cols: u32, rows: u32) -> Result<Self, PtyError> {
        let size = pty_size(cols, rows)?;
        let shell = if shell.is_empty() {
            default_shell()
        } else {
            shell
        };

        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm");
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(format!("failed to spawn {shell}: {e}")))?;
        // Only the child may hold the slave, so the master sees EOF on exit.
        drop(pair.slave);

        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = child.kill();
                return Err(PtyError::Spawn(format!("failed to take writer: {e}")));
            }
        };

        let pid = child.process_id();
        let inner = Arc::new(Inner {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            killer: Mutex::new(child.clone_killer()),
            last_size: Mutex::new(Size::new(cols, rows)),
            exit: ExitState::new(),
            reaping: Mutex::new(()),
        });

        let watcher = inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("pty-exit-{}", pid.unwrap_or_default()))
            .spawn(move || watch_exit(child, &watcher));
        if let Err(err) = spawned {
            // The closure, and the child handle in it, is gone; kill by pid.
            let process = TerminalProcess { inner, pid };
            process.close();
            return Err(PtyError::Spawn(format!("failed to start exit watcher: {err}")));
        }

        log::debug!("spawned {shell} as pid {pid:?} on a {cols}x{rows} PTY");
        Ok(Self { inner, pid })
    }

    pub fn process_id(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.inner.exit.load()
    }

    /// Whether the shell has exited. Never goes back to `false`.
    pub fn completed(&self) -> bool {
        self.state() == ProcessState::Exited
    }

    /// Resolves once the shell has exited.
    pub async fn wait_exited(&self) {
        self.inner.exit.wait().await
    }

    /// Apply a new window size and return the size now in effect.
    pub fn resize_pty(&self, cols: u32, rows: u32) -> Result<Size, PtyError> {
        let size = pty_size(cols, rows)?;
        let master = self.inner.master.lock();
        let master = master.as_ref().ok_or(PtyError::Closed)?;
        master
            .resize(size)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        let applied = match master.get_size() {
            Ok(now) => Size::new(now.cols.into(), now.rows.into()),
            Err(_) => Size::new(cols, rows),
        };
        *self.inner.last_size.lock() = applied;
        Ok(applied)
    }

    /// Current window size; the last applied one once the PTY is closed.
    pub fn size(&self) -> Size {
        let master = self.inner.master.lock();
        match master.as_ref().map(|m| m.get_size()) {
            Some(Ok(now)) => Size::new(now.cols.into(), now.rows.into()),
            _ => *self.inner.last_size.lock(),
        }
    }

    /// Write all of `data` to the shell's input.
    pub fn write_all(&self, data: &[u8]) -> Result<(), PtyError> {
        if self.completed() {
            return Err(PtyError::Closed);
        }
        let mut writer = self.inner.writer.lock();
        let writer = writer.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// A new reader of the shell's output.
    ///
    /// Each reader owns a duplicate of the master descriptor, so it keeps
    /// draining buffered output after the master itself was closed.
    pub fn output_reader(&self) -> Result<PtyReader, PtyError> {
        let master = self.inner.master.lock();
        let fd = master
            .as_ref()
            .and_then(|m| MasterPty::as_raw_fd(&**m))
            .ok_or(PtyError::Closed)?;
        // SAFETY: `fd` is the open master held under the lock above.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: `dup` is a fresh descriptor nothing else owns.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(dup) });
        Ok(PtyReader { file })
    }

    /// Kill the shell if it is still running and close the PTY.
    ///
    /// Idempotent, and a no-op once the shell has exited on its own.
    pub fn close(&self) {
        if self.completed() {
            return;
        }
        if let Err(err) = self.kill() {
            log::debug!("kill pid {:?}: {err}", self.pid);
        }
        self.inner.release_pty();
    }

    fn kill(&self) -> io::Result<()> {
        let _reaping = self.inner.reaping.lock();
        if self.completed() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                // SAFETY: plain signal delivery to our own child.
                if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
                    return Ok(());
                }
                return Err(io::Error::last_os_error());
            }
        }
        self.inner.killer.lock().kill()
    }
}

impl Drop for TerminalProcess {
    fn drop(&mut self) {
        self.close();
    }
}

fn watch_exit(mut child: Box<dyn Child + Send + Sync>, inner: &Inner) {
    #[cfg(unix)]
    let zombie = child.process_id().is_some_and(wait_unreaped);
    #[cfg(not(unix))]
    let zombie = false;

    let waited = if zombie {
        // The pid cannot be reused until the wait below, and `kill` sees
        // `Exited` before that can happen.
        let _reaping = inner.reaping.lock();
        inner.exit.mark_exited();
        child.wait()
    } else {
        let waited = child.wait();
        let _reaping = inner.reaping.lock();
        inner.exit.mark_exited();
        waited
    };
    match waited {
        Ok(status) => log::debug!(
            "shell {:?} exited with code {}",
            child.process_id(),
            status.exit_code()
        ),
        Err(err) => log::warn!("waiting for shell {:?}: {err}", child.process_id()),
    }
    inner.release_pty();
}

/// Block until `pid` has exited without reaping it.
///
/// `false` if the wait failed; the caller's reaping wait then blocks instead.
#[cfg(unix)]
fn wait_unreaped(pid: u32) -> bool {
    loop {
        // SAFETY: `info` is a plain C struct the kernel fills in.
        let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
        // SAFETY: waits on our own child; WNOWAIT leaves it waitable.
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return true;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            log::debug!("waitid on pid {pid}: {err}");
            return false;
        }
    }
}

fn pty_size(cols: u32, rows: u32) -> Result<PtySize, PtyError> {
    match (u16::try_from(cols), u16::try_from(rows)) {
        (Ok(cols), Ok(rows)) => Ok(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }),
        _ => Err(PtyError::InvalidSize { cols, rows }),
    }
}

fn default_shell() -> &'static str {
    if cfg!(windows) {
        "cmd.exe"
    } else {
        "sh"
    }
}

/// Reader over one duplicate of a PTY master.
///
/// A hung-up PTY (`EIO` on Linux) reads as end of file.
pub struct PtyReader {
    file: File,
}

impl PtyReader {
    /// Wait up to `timeout` for output, then read whatever is available.
    ///
    /// `Ok(None)` means nothing arrived in time; `Ok(Some(0))` is end of file.
    /// Never waits for a full buffer or a line.
    pub fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let mut pollfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: one valid pollfd for the duration of the call.
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(err);
        }
        if ready == 0 {
            return Ok(None);
        }
        self.read(buf).map(Some)
    }
}

impl Read for PtyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.file.read(buf) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.raw_os_error() == Some(libc::EIO) => return Ok(0),
                other => return other,
            }
        }
    }
}
