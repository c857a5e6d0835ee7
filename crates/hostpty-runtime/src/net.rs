use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {} timed out after {:?}", .path.display(), .timeout)]
    Timeout {
        path: PathBuf,
        timeout: Duration,
        #[source]
        last: Option<io::Error>,
    },
}

/// Connect to a unix socket, retrying until `timeout` elapses.
///
/// A freshly bound socket may not accept yet; a socket that never accepts
/// within the bound is reported as [`DialError::Timeout`].
pub async fn dial_unix(path: &Path, timeout: Duration) -> Result<UnixStream, DialError> {
    let deadline = Instant::now() + timeout;
    let mut last = None;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(DialError::Timeout {
                path: path.to_path_buf(),
                timeout,
                last,
            });
        }
        match tokio::time::timeout(deadline - now, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => {
                log::trace!("dial {} failed: {err}", path.display());
                last = Some(err);
            }
            Err(_) => continue,
        }
        sleep(RETRY_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

/// Make `path` bindable: create its parent directory and remove a stale
/// socket file left by a previous listener.
pub fn prepare_unix_socket(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
        set_dir_mode(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed stale socket {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_dir_mode(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_dial_times_out_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");

        let started = std::time::Instant::now();
        let err = dial_unix(&path, Duration::from_millis(200)).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        let DialError::Timeout { last, .. } = err;
        assert_eq!(last.unwrap().kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_dial_waits_for_late_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.sock");

        let bind_path = path.clone();
        let listener = tokio::spawn(async move {
            sleep(Duration::from_millis(120)).await;
            let listener = UnixListener::bind(&bind_path).unwrap();
            listener.accept().await.unwrap();
        });

        dial_unix(&path, Duration::from_secs(2)).await.unwrap();
        listener.await.unwrap();
    }

    #[test]
    fn test_prepare_creates_dir_and_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pts0").join("pts0");

        prepare_unix_socket(&path).unwrap();
        assert!(path.parent().unwrap().is_dir());

        std::fs::write(&path, b"stale").unwrap();
        prepare_unix_socket(&path).unwrap();
        assert!(!path.exists());
    }
}
