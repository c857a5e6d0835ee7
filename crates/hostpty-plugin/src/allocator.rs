//! Device allocation: one host shell per advertised PTY device.
//!
//! The device pool `pts0..ptsN-1` is fixed at construction. Every Allocate
//! for a device retires whatever session held it before, starts a new shell
//! with its own session socket under `<root>/<id>/<id>`, and only reports
//! success once that socket answers a ping.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use hostpty_proto::deviceplugin::{
    AllocateRequest, AllocateResponse, ContainerAllocateRequest, ContainerAllocateResponse, Device,
    DevicePluginOptions, Health, ListAndWatchResponse, Mount, PreStartContainerRequest,
    PreStartContainerResponse,
};
pub use hostpty_proto::terminal::SOCK_FILE_ENV;
use hostpty_pty::{ClientError, PtyError, TerminalClient, TerminalProcess, TerminalStreamServer};
use hostpty_runtime::{ListenerRegistry, Shutdown, WorkerGroup, WorkerHandle};
use parking_lot::{Mutex, RwLock};

/// Resource name advertised to the node agent.
pub const RESOURCE_NAME: &str = "hostpty.dev/pty";
/// Where the per-device directory is mounted inside the container.
pub const CONTAINER_PTS_DIR: &str = "/var/run/hostpty/pts";
/// Bound for the self-dial and the registration call.
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 30;
/// How long retiring a session waits for its shell and server to finish.
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum AllocateError {
    #[error("expected exactly one device id per container, got {count}")]
    EmptyRequest { count: usize },

    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("create terminal pts failed: {0}")]
    Spawn(#[source] PtyError),

    #[error("failed to listen on {}: {source}", .path.display())]
    Bind { path: PathBuf, source: io::Error },

    #[error("session socket is not answering: {0}")]
    Dial(#[source] ClientError),
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub shell: String,
    pub socket_root: PathBuf,
    pub device_count: u8,
    pub dial_timeout: Duration,
}

struct Session {
    terminal: Arc<TerminalProcess>,
    stop: Shutdown,
    served: WorkerHandle<(), io::Error>,
}

pub struct SessionAllocator {
    shell: RwLock<String>,
    socket_root: PathBuf,
    dial_timeout: Duration,
    devices: Vec<Device>,
    /// One exclusive section per device, held across a whole allocation.
    slots: HashMap<String, tokio::sync::Mutex<()>>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    listeners: Arc<dyn ListenerRegistry>,
    workers: WorkerGroup,
    shutdown: Shutdown,
}

impl SessionAllocator {
    pub fn new(
        config: AllocatorConfig,
        listeners: Arc<dyn ListenerRegistry>,
        workers: WorkerGroup,
        shutdown: Shutdown,
    ) -> Self {
        let devices: Vec<Device> = (0..config.device_count)
            .map(|i| Device {
                id: format!("pts{i}"),
                health: Health::Healthy,
            })
            .collect();
        let slots = devices
            .iter()
            .map(|d| (d.id.clone(), tokio::sync::Mutex::new(())))
            .collect();

        Self {
            shell: RwLock::new(config.shell),
            socket_root: config.socket_root,
            dial_timeout: config.dial_timeout,
            devices,
            slots,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            listeners,
            workers,
            shutdown,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn shell(&self) -> String {
        self.shell.read().clone()
    }

    /// Shell used by allocations from now on; live sessions keep theirs.
    pub fn set_shell(&self, shell: impl Into<String>) {
        let shell = shell.into();
        log::info!("shell for new sessions is now {shell:?}");
        *self.shell.write() = shell;
    }

    pub fn get_device_plugin_options(&self) -> DevicePluginOptions {
        DevicePluginOptions {
            pre_start_required: false,
        }
    }

    /// The full device list. Devices never change health.
    pub fn list_and_watch(&self) -> ListAndWatchResponse {
        ListAndWatchResponse {
            devices: self.devices.clone(),
        }
    }

    pub fn pre_start_container(&self, _request: PreStartContainerRequest) -> PreStartContainerResponse {
        PreStartContainerResponse {}
    }

    /// Allocate a session for every container in `request`.
    ///
    /// The batch stops at the first failing container; sessions already
    /// started for earlier containers stay mapped.
    pub async fn allocate(&self, request: AllocateRequest) -> Result<AllocateResponse, AllocateError> {
        let mut container_responses = Vec::with_capacity(request.container_requests.len());
        for container in request.container_requests {
            log::debug!("allocate pty device {:?}", container.devices_ids);
            container_responses.push(self.allocate_container(container).await?);
        }
        Ok(AllocateResponse {
            container_responses,
        })
    }

    async fn allocate_container(
        &self,
        request: ContainerAllocateRequest,
    ) -> Result<ContainerAllocateResponse, AllocateError> {
        let id = match request.devices_ids.as_slice() {
            [id] => id.clone(),
            ids => return Err(AllocateError::EmptyRequest { count: ids.len() }),
        };
        let slot = self
            .slots
            .get(&id)
            .ok_or_else(|| AllocateError::UnknownDevice(id.clone()))?;
        let _exclusive = slot.lock().await;

        // Never reuse a previous session, whatever state it is in.
        self.retire(&id).await;

        let shell = self.shell();
        let terminal = Arc::new(
            TerminalProcess::open(&shell, DEFAULT_COLS, DEFAULT_ROWS).map_err(|err| {
                log::error!("create terminal pts for {id} failed: {err}");
                AllocateError::Spawn(err)
            })?,
        );

        let host_dir = self.socket_root.join(&id);
        let socket = host_dir.join(&id);
        let stop = self.shutdown.child();
        let server = match TerminalStreamServer::bind(
            terminal.clone(),
            &socket,
            self.listeners.clone(),
            self.workers.clone(),
            stop.clone(),
        ) {
            Ok(server) => server,
            Err(source) => {
                terminal.close();
                return Err(AllocateError::Bind {
                    path: socket,
                    source,
                });
            }
        };
        let served = self.spawn_server(&id, server, terminal.clone());

        let client = TerminalClient::new(&socket).with_timeout(self.dial_timeout);
        if let Err(err) = client.ping().await {
            log::error!("dial pts service {} failed: {err}", socket.display());
            terminal.close();
            stop.cancel();
            return Err(AllocateError::Dial(err));
        }

        {
            let mut table = self.sessions.lock();
            // The exit watcher may have beaten us; its server already cleaned up.
            if terminal.completed() {
                log::warn!("shell on {id} exited during allocation");
            } else {
                table.insert(
                    id.clone(),
                    Session {
                        terminal,
                        stop,
                        served,
                    },
                );
            }
        }

        log::info!("allocated {id} at {}", socket.display());
        Ok(container_response(&id, &host_dir))
    }

    fn spawn_server(
        &self,
        id: &str,
        server: TerminalStreamServer,
        terminal: Arc<TerminalProcess>,
    ) -> WorkerHandle<(), io::Error> {
        let sessions = self.sessions.clone();
        let id = id.to_string();
        self.workers.spawn(format!("serve-{id}"), move |_| async move {
            log::info!("ListenAndServe pts {}", server.path().display());
            let result = server.serve().await;
            log::info!("ListenAndServe pts {id} exited");

            if terminal.completed() {
                let mut table = sessions.lock();
                let current = table
                    .get(&id)
                    .is_some_and(|s| Arc::ptr_eq(&s.terminal, &terminal));
                if current {
                    table.remove(&id);
                    log::info!("shell on {id} exited, mapping removed");
                }
            }
            result
        })
    }

    /// Close the session mapped to `id`, if any, and wait (bounded) until its
    /// shell is gone and its server stopped.
    async fn retire(&self, id: &str) {
        let previous = self.sessions.lock().remove(id);
        let Some(mut session) = previous else {
            return;
        };
        log::info!("retiring previous session on {id}");
        session.terminal.close();
        session.stop.cancel();

        let settled = tokio::time::timeout(RETIRE_TIMEOUT, async {
            session.terminal.wait_exited().await;
            let _ = session.served.join().await;
        })
        .await;
        if settled.is_err() {
            log::warn!("previous session on {id} did not stop within {RETIRE_TIMEOUT:?}");
        }
    }

    /// The live shell mapped to `id`.
    pub fn session(&self, id: &str) -> Option<Arc<TerminalProcess>> {
        self.sessions.lock().get(id).map(|s| s.terminal.clone())
    }

    /// Ids of every mapped device, sorted.
    pub fn live_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close every session. Used when the plugin stops.
    pub async fn shutdown(&self) {
        let sessions: Vec<(String, Session)> = self.sessions.lock().drain().collect();
        for (id, session) in &sessions {
            log::debug!("closing session on {id}");
            session.terminal.close();
            session.stop.cancel();
        }
        for (id, mut session) in sessions {
            let settled = tokio::time::timeout(RETIRE_TIMEOUT, session.served.join()).await;
            if settled.is_err() {
                log::warn!("session server for {id} did not stop in time");
            }
        }
    }
}

fn container_response(id: &str, host_dir: &Path) -> ContainerAllocateResponse {
    let container_dir = Path::new(CONTAINER_PTS_DIR);
    ContainerAllocateResponse {
        envs: BTreeMap::from([(
            SOCK_FILE_ENV.to_string(),
            container_dir.join(id).to_string_lossy().into_owned(),
        )]),
        mounts: vec![Mount {
            container_path: CONTAINER_PTS_DIR.to_string(),
            host_path: host_dir.to_string_lossy().into_owned(),
            read_only: false,
        }],
        annotations: BTreeMap::new(),
    }
}
