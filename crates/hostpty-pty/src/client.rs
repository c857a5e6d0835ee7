use std::path::{Path, PathBuf};
use std::time::Duration;

use hostpty_proto::{
    FrameReader, FrameWriter, InputFrame, OutputFrame, Pong, ProtoError, ResizeReply, Size,
    TerminalRequest,
};
use hostpty_runtime::{dial_unix, DialError};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Bound for connecting and for unary replies.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// The host answered with a zero size.
    #[error("resize rejected: {}", .0.as_deref().unwrap_or("no reason given"))]
    ResizeRejected(Option<String>),

    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Talks to one terminal session socket.
#[derive(Debug, Clone)]
pub struct TerminalClient {
    path: PathBuf,
    timeout: Duration,
}

impl TerminalClient {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call(
        &self,
        request: &TerminalRequest,
    ) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>), ClientError> {
        let stream = dial_unix(&self.path, self.timeout).await?;
        let (read_half, write_half) = stream.into_split();
        let mut writer = FrameWriter::new(write_half);
        writer.send(request).await?;
        Ok((FrameReader::new(read_half), writer))
    }

    async fn unary<T: serde::de::DeserializeOwned>(
        &self,
        request: &TerminalRequest,
    ) -> Result<T, ClientError> {
        let (mut reader, _writer) = self.call(request).await?;
        tokio::time::timeout(self.timeout, reader.expect::<T>())
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?
            .map_err(ClientError::from)
    }

    /// Check that the session's accept loop answers.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let pong: Pong = self.unary(&TerminalRequest::Ping).await?;
        if !pong.pong {
            return Err(ProtoError::Unexpected("pong: false".to_string()).into());
        }
        Ok(())
    }

    /// Resize the remote PTY, returning the size now in effect.
    pub async fn resize(&self, size: Size) -> Result<Size, ClientError> {
        let reply: ResizeReply = self.unary(&TerminalRequest::Resize(size)).await?;
        if reply.size.is_zero() {
            return Err(ClientError::ResizeRejected(reply.error));
        }
        Ok(reply.size)
    }

    /// Open a streaming session on the remote PTY.
    pub async fn attach(&self) -> Result<(AttachSender, AttachReceiver), ClientError> {
        let (reader, writer) = self.call(&TerminalRequest::Attach).await?;
        Ok((AttachSender { writer }, AttachReceiver { reader }))
    }
}

/// Input side of an attach call.
pub struct AttachSender {
    writer: FrameWriter<OwnedWriteHalf>,
}

impl AttachSender {
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ProtoError> {
        self.writer
            .send(&InputFrame {
                payload: payload.to_vec(),
            })
            .await
    }

    /// Close the input side; the host ends the call.
    pub async fn close(mut self) -> Result<(), ProtoError> {
        self.writer.shutdown().await
    }
}

/// Output side of an attach call.
pub struct AttachReceiver {
    reader: FrameReader<OwnedReadHalf>,
}

impl AttachReceiver {
    /// Next output frame, or `None` once the host closed the call.
    pub async fn recv(&mut self) -> Result<Option<OutputFrame>, ProtoError> {
        self.reader.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_zero_size_reply_is_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let host = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, write_half) = stream.into_split();
            let mut reader = FrameReader::new(read_half);
            let request: TerminalRequest = reader.expect().await.unwrap();
            assert_eq!(request, TerminalRequest::Resize(Size::new(90, 20)));
            // A host that only knows the zero-size convention.
            let mut writer = FrameWriter::new(write_half);
            writer.send(&Size::default()).await.unwrap();
        });

        let err = TerminalClient::new(&path)
            .resize(Size::new(90, 20))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ResizeRejected(None)), "got {err:?}");
        host.await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_host_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let _host = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let err = TerminalClient::new(&path)
            .with_timeout(Duration::from_millis(200))
            .ping()
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)), "got {err:?}");
    }
}
