//! Serves one [`TerminalProcess`] over a unix socket.
//!
//! Each connection carries a single call, chosen by its first frame:
//! `attach` streams the PTY both ways until the shell exits or either side
//! goes away, `resize` applies a window size, `ping` answers liveness checks.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hostpty_proto::{
    FrameReader, FrameWriter, InputFrame, OutputFrame, Pong, ProtoError, ResizeReply, Size,
    TerminalRequest,
};
use hostpty_runtime::{ListenerRegistry, Shutdown, WorkerGroup};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::pty::{PtyError, PtyReader, TerminalProcess};

/// How long the output reader waits before rechecking for cancellation.
const READ_POLL: Duration = Duration::from_millis(100);
/// How long an attach waits for the exit watcher after the PTY hung up.
const EXIT_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("failed to start PTY reader: {0}")]
    Reader(#[source] io::Error),
}

pub struct TerminalStreamServer {
    terminal: Arc<TerminalProcess>,
    listener: UnixListener,
    path: PathBuf,
    registry: Arc<dyn ListenerRegistry>,
    workers: WorkerGroup,
    stop: Shutdown,
}

impl TerminalStreamServer {
    /// Obtain a listener on `path` from `registry`.
    ///
    /// Nothing is accepted until [`serve`](Self::serve) runs.
    pub fn bind(
        terminal: Arc<TerminalProcess>,
        path: &Path,
        registry: Arc<dyn ListenerRegistry>,
        workers: WorkerGroup,
        stop: Shutdown,
    ) -> io::Result<Self> {
        let listener = registry.listen_unix(path)?;
        Ok(Self {
            terminal,
            listener,
            path: path.to_path_buf(),
            registry,
            workers,
            stop,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until the shell exits or `stop` fires.
    ///
    /// Calls already running continue on their own workers. The socket file
    /// is left in place; the next bind on the same path replaces it.
    pub async fn serve(self) -> io::Result<()> {
        let result = loop {
            tokio::select! {
                _ = self.stop.cancelled() => break Ok(()),
                _ = self.terminal.wait_exited() => {
                    log::debug!("shell behind {} exited, closing listener", self.path.display());
                    break Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => self.spawn_connection(stream),
                    Err(err) => {
                        log::error!("accept on {}: {err}", self.path.display());
                        break Err(err);
                    }
                },
            }
        };
        self.registry.release(&self.path);
        result
    }

    fn spawn_connection(&self, stream: UnixStream) {
        let conn = Connection {
            terminal: self.terminal.clone(),
            workers: self.workers.clone(),
            stop: self.stop.child(),
        };
        let name = format!("conn-{}", self.path.display());
        self.workers.spawn(name, move |_| async move {
            let result = conn.run(stream).await;
            if let Err(err) = &result {
                log::warn!("terminal call ended with error: {err}");
            }
            result
        });
    }
}

struct Connection {
    terminal: Arc<TerminalProcess>,
    workers: WorkerGroup,
    /// Cancelled when the call ends; stops its helper workers.
    stop: Shutdown,
}

impl Connection {
    async fn run(self, stream: UnixStream) -> Result<(), StreamError> {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        let request = match reader.next::<TerminalRequest>().await? {
            Some(request) => request,
            None => return Ok(()),
        };
        let result = match request {
            TerminalRequest::Attach => self.attach(reader, &mut writer).await,
            TerminalRequest::Resize(size) => {
                writer.send(&self.resize(size)).await?;
                Ok(())
            }
            TerminalRequest::Ping => {
                writer.send(&Pong { pong: true }).await?;
                Ok(())
            }
        };
        self.stop.cancel();
        result
    }

    fn resize(&self, size: Size) -> ResizeReply {
        match self.terminal.resize_pty(size.cols, size.rows) {
            Ok(applied) => ResizeReply::applied(applied),
            Err(err) => {
                log::warn!("resize to {}x{} failed: {err}", size.cols, size.rows);
                ResizeReply::failed(err.to_string())
            }
        }
    }

    async fn attach(
        &self,
        reader: FrameReader<OwnedReadHalf>,
        writer: &mut FrameWriter<OwnedWriteHalf>,
    ) -> Result<(), StreamError> {
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(1);
        match self.terminal.output_reader() {
            Ok(pty) => self.spawn_output_reader(pty, out_tx)?,
            // Already gone: fall through to the final frame below.
            Err(PtyError::Closed) => drop(out_tx),
            Err(err) => return Err(err.into()),
        }

        let (in_tx, mut in_rx) = mpsc::channel::<Result<Vec<u8>, ProtoError>>(1);
        self.spawn_input_reader(reader, in_tx);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                chunk = out_rx.recv() => match chunk {
                    Some(payload) => {
                        let completed = self.terminal.completed();
                        writer.send(&OutputFrame { payload, completed }).await?;
                        if completed {
                            return Ok(());
                        }
                    }
                    None => return self.finish(writer).await,
                },
                input = in_rx.recv() => match input {
                    Some(Ok(payload)) => self.write_input(payload).await?,
                    Some(Err(err)) => return Err(err.into()),
                    // Peer closed its side.
                    None => return Ok(()),
                },
            }
        }
    }

    /// PTY output is exhausted. Give the exit watcher a moment, then tell the
    /// client the session is over so it never waits on a dead shell.
    async fn finish(&self, writer: &mut FrameWriter<OwnedWriteHalf>) -> Result<(), StreamError> {
        if self.stop.is_cancelled() {
            return Ok(());
        }
        let exited = tokio::time::timeout(EXIT_GRACE, self.terminal.wait_exited())
            .await
            .is_ok();
        if exited {
            writer
                .send(&OutputFrame {
                    payload: Vec::new(),
                    completed: true,
                })
                .await?;
        } else {
            log::warn!("PTY output closed but the shell is still running");
        }
        Ok(())
    }

    fn spawn_output_reader(
        &self,
        mut pty: PtyReader,
        out_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<(), StreamError> {
        let stop = self.stop.clone();
        let name = format!("pty-read-{}", self.terminal.process_id().unwrap_or_default());
        self.workers
            .spawn_thread(name, move |_| -> io::Result<()> {
                let mut buf = vec![0u8; READ_CHUNK];
                while !stop.is_cancelled() {
                    match pty.read_timeout(&mut buf, READ_POLL)? {
                        None => continue,
                        Some(0) => break,
                        Some(n) => {
                            if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
                Ok(())
            })
            .map_err(StreamError::Reader)?;
        Ok(())
    }

    fn spawn_input_reader(
        &self,
        mut reader: FrameReader<OwnedReadHalf>,
        in_tx: mpsc::Sender<Result<Vec<u8>, ProtoError>>,
    ) {
        let stop = self.stop.clone();
        self.workers.spawn("attach-input", move |_| async move {
            loop {
                let frame = tokio::select! {
                    _ = stop.cancelled() => return Ok::<_, ProtoError>(()),
                    frame = reader.next::<InputFrame>() => frame,
                };
                let forwarded = match frame {
                    Ok(Some(frame)) => in_tx.send(Ok(frame.payload)).await,
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        let _ = in_tx.send(Err(ProtoError::Unexpected(err.to_string()))).await;
                        return Err(err);
                    }
                };
                if forwarded.is_err() {
                    return Ok(());
                }
            }
        });
    }

    async fn write_input(&self, payload: Vec<u8>) -> Result<(), PtyError> {
        let terminal = self.terminal.clone();
        tokio::task::spawn_blocking(move || terminal.write_all(&payload))
            .await
            .map_err(|e| PtyError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TerminalClient;
    use hostpty_runtime::StaticRegistry;
    use std::time::Instant;
    use tokio::time::timeout;

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        terminal: Arc<TerminalProcess>,
        workers: WorkerGroup,
        stop: Shutdown,
    }

    async fn serve_shell() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pts0").join("pts0");
        let terminal = Arc::new(TerminalProcess::open("/bin/sh", 80, 30).unwrap());
        let workers = WorkerGroup::new();
        let stop = Shutdown::new();
        let server = TerminalStreamServer::bind(
            terminal.clone(),
            &path,
            Arc::new(StaticRegistry::new()),
            workers.clone(),
            stop.clone(),
        )
        .unwrap();
        workers.spawn("serve", move |_| server.serve());
        Fixture {
            _dir: dir,
            path,
            terminal,
            workers,
            stop,
        }
    }

    async fn collect_until(
        rx: &mut crate::client::AttachReceiver,
        needle: &str,
        within: Duration,
    ) -> (String, bool) {
        let deadline = Instant::now() + within;
        let mut output = Vec::new();
        let mut completed = false;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match timeout(left, rx.recv()).await {
                Ok(Ok(Some(frame))) => {
                    output.extend_from_slice(&frame.payload);
                    completed = frame.completed;
                    if completed || String::from_utf8_lossy(&output).contains(needle) {
                        break;
                    }
                }
                _ => break,
            }
        }
        (String::from_utf8_lossy(&output).into_owned(), completed)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attach_echo() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);
        let (mut tx, mut rx) = client.attach().await.unwrap();

        tx.send(b"echo hi_$((1+1))\n").await.unwrap();
        let (text, completed) = collect_until(&mut rx, "hi_2", Duration::from_secs(5)).await;
        assert!(text.contains("hi_2"), "got: {text}");
        assert!(!completed);
        fx.stop.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_input_order_is_preserved_across_frames() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);
        let (mut tx, mut rx) = client.attach().await.unwrap();

        for chunk in ["ec", "ho or", "der_", "ok", "\n"] {
            tx.send(chunk.as_bytes()).await.unwrap();
        }
        let (text, _) = collect_until(&mut rx, "order_ok\r\n", Duration::from_secs(5)).await;
        assert!(text.contains("order_ok"), "got: {text}");
        fx.stop.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resize_round_trip() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);

        let size = client.resize(Size::new(120, 40)).await.unwrap();
        assert_eq!(size, Size::new(120, 40));
        assert_eq!(fx.terminal.size(), Size::new(120, 40));
        fx.stop.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resize_failure_is_zero_size() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);

        let err = client.resize(Size::new(100_000, 40)).await.unwrap_err();
        match err {
            crate::client::ClientError::ResizeRejected(reason) => {
                assert!(reason.unwrap().contains("invalid PTY size"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // The session survives a bad resize.
        client.ping().await.unwrap();
        fx.stop.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_exit_sends_final_completed_frame() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);
        let (mut tx, mut rx) = client.attach().await.unwrap();

        tx.send(b"exit\n").await.unwrap();
        let (_, completed) = collect_until(&mut rx, "\u{0}never", Duration::from_secs(5)).await;
        assert!(completed);
        assert!(fx.terminal.completed());
        // Nothing follows the completed frame.
        let next = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert!(matches!(next, Ok(None)), "got {next:?}");

        // The listener is gone with the shell.
        timeout(Duration::from_secs(3), fx.workers.wait()).await.unwrap();
        let client = client.with_timeout(Duration::from_millis(300));
        assert!(client.ping().await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_killed_shell_ends_attach() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);
        let (_tx, mut rx) = client.attach().await.unwrap();

        fx.terminal.close();
        let (_, completed) = collect_until(&mut rx, "\u{0}never", Duration::from_secs(5)).await;
        assert!(completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_ends_calls_and_listener() {
        let fx = serve_shell().await;
        let client = TerminalClient::new(&fx.path);
        let (_tx, mut rx) = client.attach().await.unwrap();

        fx.stop.cancel();
        // Frames already on the wire (the prompt) may still arrive first.
        let end = timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(Some(frame)) => assert!(!frame.completed, "shell should keep running"),
                    other => return other,
                }
            }
        })
        .await
        .expect("call did not end after stop");
        assert!(matches!(end, Ok(None)), "got {end:?}");
        timeout(Duration::from_secs(3), fx.workers.wait()).await.unwrap();
        assert!(!fx.terminal.completed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_garbage_first_frame_is_dropped() {
        let fx = serve_shell().await;
        let mut stream = UnixStream::connect(&fx.path).await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut stream, b"{\"method\":\"detach\"}\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let n = timeout(
            Duration::from_secs(2),
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(n, 0);

        TerminalClient::new(&fx.path).ping().await.unwrap();
        fx.stop.cancel();
    }
}
