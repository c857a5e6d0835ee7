use std::io::{self, Read};
use std::thread;

use tokio::sync::mpsc;

const CHUNK: usize = 4096;

/// Forward whatever `reader` has available, chunk by chunk, to the runtime.
///
/// The channel closes at end of input. A read error is delivered once and
/// also closes it. The thread is detached: a blocked terminal read cannot be
/// interrupted, so it simply dies with the process.
pub fn spawn_reader<R>(name: &str, mut reader: R) -> io::Result<mpsc::Receiver<io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut buf = [0u8; CHUNK];
        loop {
            let chunk = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => Ok(buf[..n].to_vec()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(err),
            };
            let failed = chunk.is_err();
            if tx.blocking_send(chunk).is_err() || failed {
                break;
            }
        }
    })?;
    Ok(rx)
}
