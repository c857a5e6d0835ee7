//! The three loops of an attached client: host output to the local
//! terminal, local input to the host, and local signals.

use std::io;

use hostpty_proto::Size;
use hostpty_pty::{AttachReceiver, AttachSender, TerminalClient};
use hostpty_runtime::Shutdown;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

/// Copy host output to `out` until the session completes or the call ends.
pub async fn output_relay<W>(mut rx: AttachReceiver, mut out: W, shutdown: Shutdown) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = rx.recv() => frame?,
        };
        let Some(frame) = frame else {
            log::debug!("host closed the attach call");
            return Ok(());
        };
        if !frame.payload.is_empty() {
            out.write_all(&frame.payload).await?;
            out.flush().await?;
        }
        if frame.completed {
            log::debug!("remote shell exited");
            return Ok(());
        }
    }
}

/// Send local input to the host until input ends.
pub async fn input_relay(
    mut input: mpsc::Receiver<io::Result<Vec<u8>>>,
    mut tx: AttachSender,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    loop {
        let chunk = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            chunk = input.recv() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => tx.send(&bytes).await?,
            Some(Err(err)) => return Err(err.into()),
            None => {
                log::debug!("local input closed");
                if let Err(err) = tx.close().await {
                    log::debug!("close input side failed: {err}");
                }
                return Ok(());
            }
        }
    }
}

/// Follow window changes; return on interrupt.
pub async fn signal_relay(client: TerminalClient, shutdown: Shutdown) -> anyhow::Result<()> {
    let mut winch = signal(SignalKind::window_change())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = interrupt.recv() => {
                log::info!("interrupted");
                return Ok(());
            }
            _ = winch.recv() => resize_remote(&client).await,
        }
    }
}

/// Push the local window size to the host. Failures are only logged.
pub async fn resize_remote(client: &TerminalClient) {
    let (cols, rows) = match crossterm::terminal::size() {
        Ok(size) => size,
        Err(err) => {
            log::info!("get terminal size failed: {err}");
            return;
        }
    };
    match client.resize(Size::new(cols.into(), rows.into())).await {
        Ok(size) => log::debug!("remote pty resized to {}x{}", size.cols, size.rows),
        Err(err) => log::info!("resize failed: {err}"),
    }
}
