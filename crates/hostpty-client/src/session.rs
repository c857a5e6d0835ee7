use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use hostpty_pty::TerminalClient;
use hostpty_runtime::{force_exit_after, Shutdown, WorkerGroup};

use crate::raw::{self, RawModeGuard};
use crate::relay::{input_relay, output_relay, resize_remote, signal_relay};
use crate::stdin;

/// How long the relays get to wind down once one of them ended.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Attach the local terminal to the session behind `socket` until the
/// remote shell exits, input ends, or the user interrupts.
pub async fn run(socket: &Path) -> anyhow::Result<()> {
    let client = TerminalClient::new(socket);
    log::debug!("request attach to host pty {}", socket.display());
    let (tx, rx) = client
        .attach()
        .await
        .with_context(|| format!("attach host pty {} failed", socket.display()))?;

    let raw_mode = match RawModeGuard::enable() {
        Ok(guard) => Some(guard),
        Err(err) => {
            log::error!("make raw stdin failed: {err}");
            None
        }
    };
    resize_remote(&client).await;

    let shutdown = Shutdown::new();
    let workers = WorkerGroup::new();
    let input = stdin::spawn_reader("stdin-reader", std::io::stdin())?;

    let mut handles = vec![
        workers.spawn("output-relay", |_| {
            cancel_on_exit(shutdown.clone(), output_relay(rx, tokio::io::stdout(), shutdown.clone()))
        }),
        workers.spawn("input-relay", |_| {
            cancel_on_exit(shutdown.clone(), input_relay(input, tx, shutdown.clone()))
        }),
        workers.spawn("signal-relay", |_| {
            cancel_on_exit(shutdown.clone(), signal_relay(client.clone(), shutdown.clone()))
        }),
    ];

    shutdown.cancelled().await;
    force_exit_after(EXIT_GRACE, raw::restore);
    workers.wait().await;
    drop(raw_mode);

    for handle in &mut handles {
        if let Some(Err(err)) = handle.try_join() {
            return Err(err.context(format!("{} failed", handle.name())));
        }
    }
    Ok(())
}

/// Any relay ending takes the others down with it.
async fn cancel_on_exit<F>(shutdown: Shutdown, relay: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    let result = relay.await;
    shutdown.cancel();
    result
}
