use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

/// Upper bound for a single encoded frame, newline included.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,

    #[error("stream closed in the middle of a frame")]
    UnexpectedEof,

    #[error("unexpected message: {0}")]
    Unexpected(String),
}

/// Reads newline-delimited JSON frames from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: Vec::new(),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtoError> {
        self.line.clear();
        let limit = MAX_FRAME_LEN as u64 + 1;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut self.line)
            .await?;

        if n == 0 {
            return Ok(None);
        }
        if self.line.last() != Some(&b'\n') {
            if self.line.len() > MAX_FRAME_LEN {
                return Err(ProtoError::FrameTooLarge);
            }
            return Err(ProtoError::UnexpectedEof);
        }

        Ok(Some(serde_json::from_slice(&self.line)?))
    }

    /// Read the next frame, treating a closed stream as an error.
    pub async fn expect<T: DeserializeOwned>(&mut self) -> Result<T, ProtoError> {
        self.next().await?.ok_or(ProtoError::UnexpectedEof)
    }
}

/// Writes newline-delimited JSON frames to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode and flush one frame.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtoError> {
        let mut buf = serde_json::to_vec(message)?;
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Close the write direction so the peer observes end of stream.
    pub async fn shutdown(&mut self) -> Result<(), ProtoError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
