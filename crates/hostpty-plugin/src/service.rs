use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hostpty_proto::deviceplugin::{PluginRequest, Reply};
use hostpty_proto::{FrameReader, FrameWriter, ProtoError};
use hostpty_runtime::{ListenerRegistry, Shutdown, WorkerGroup};
use serde::de::IgnoredAny;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};

use crate::allocator::SessionAllocator;

/// Serves the device-plugin API on the plugin's own socket.
pub struct PluginServer {
    allocator: Arc<SessionAllocator>,
    listener: UnixListener,
    path: PathBuf,
    registry: Arc<dyn ListenerRegistry>,
    workers: WorkerGroup,
    shutdown: Shutdown,
}

impl PluginServer {
    pub fn bind(
        allocator: Arc<SessionAllocator>,
        path: &Path,
        registry: Arc<dyn ListenerRegistry>,
        workers: WorkerGroup,
        shutdown: Shutdown,
    ) -> io::Result<Self> {
        let listener = registry.listen_unix(path)?;
        Ok(Self {
            allocator,
            listener,
            path: path.to_path_buf(),
            registry,
            workers,
            shutdown,
        })
    }

    pub async fn serve(self) -> io::Result<()> {
        log::info!("ListenAndServe device-plugin {}", self.path.display());
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let allocator = self.allocator.clone();
                        let shutdown = self.shutdown.clone();
                        self.workers.spawn("device-plugin-call", move |_| async move {
                            let result = handle_call(&allocator, &shutdown, stream).await;
                            if let Err(err) = &result {
                                log::warn!("device-plugin call failed: {err}");
                            }
                            result
                        });
                    }
                    Err(err) => break Err(err),
                },
            }
        };
        self.registry.release(&self.path);
        log::info!("ListenAndServe device-plugin {} exited", self.path.display());
        result
    }
}

async fn handle_call(
    allocator: &SessionAllocator,
    shutdown: &Shutdown,
    stream: UnixStream,
) -> Result<(), ProtoError> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    let Some(request) = reader.next::<PluginRequest>().await? else {
        return Ok(());
    };
    match request {
        PluginRequest::GetDevicePluginOptions => {
            writer
                .send(&Reply::ok(allocator.get_device_plugin_options()))
                .await
        }
        PluginRequest::ListAndWatch => {
            writer.send(&Reply::ok(allocator.list_and_watch())).await?;
            // Health never changes; hold the stream open until either side quits.
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = peer_gone(&mut reader) => {}
            }
            Ok(())
        }
        PluginRequest::Allocate(request) => {
            let reply = match allocator.allocate(request).await {
                Ok(response) => Reply::ok(response),
                Err(err) => {
                    log::error!("allocate failed: {err}");
                    Reply::error(err.to_string())
                }
            };
            writer.send(&reply).await
        }
        PluginRequest::PreStartContainer(request) => {
            writer
                .send(&Reply::ok(allocator.pre_start_container(request)))
                .await
        }
    }
}

/// Resolves once the peer closed its side of the connection.
async fn peer_gone(reader: &mut FrameReader<OwnedReadHalf>) {
    while let Ok(Some(_)) = reader.next::<IgnoredAny>().await {}
}
