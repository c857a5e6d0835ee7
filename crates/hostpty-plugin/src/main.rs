use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use hostpty_plugin::options::{self, Command, Options, Overrides};
use hostpty_plugin::{register, AllocatorConfig, PluginServer, SessionAllocator, CONTROL_TIMEOUT};
use hostpty_runtime::upgrade::DEFAULT_UPGRADE_TIMEOUT;
use hostpty_runtime::{
    dial_unix, init_graceful_upgrade, logging, version, watch, HandoffRegistry, ListenerRegistry,
    Shutdown, WorkerGroup,
};
use notify::RecommendedWatcher;
use tokio::signal::unix::{signal, SignalKind};

const NAME: &str = "pty-device-plugin";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = match options::parse_args(std::env::args().skip(1)) {
        Ok(Command::Run(cli)) => cli,
        Ok(Command::Help) => {
            options::print_help();
            return Ok(());
        }
        Ok(Command::Version) => {
            println!("{}", version::info(NAME));
            return Ok(());
        }
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    let opts = Options::resolve(&cli)?;
    logging::init(logging::parse_level(&opts.log).map_err(anyhow::Error::msg)?);
    log::info!("{}", version::info(NAME));

    let shutdown = Shutdown::new();
    let workers = WorkerGroup::new();
    let handoff = HandoffRegistry::from_env(DEFAULT_UPGRADE_TIMEOUT)
        .context("failed to adopt inherited listeners")?;
    if handoff.is_successor() {
        log::info!("taking over listeners from the previous process");
    }
    let registry: Arc<dyn ListenerRegistry> = Arc::new(handoff);
    let allocator = Arc::new(SessionAllocator::new(
        AllocatorConfig {
            shell: opts.shell.clone(),
            socket_root: opts.pts_socket_dir.clone(),
            device_count: opts.max_pty,
            dial_timeout: CONTROL_TIMEOUT,
        },
        registry.clone(),
        workers.clone(),
        shutdown.clone(),
    ));

    let result = run(
        &opts,
        cli.config.as_deref(),
        &cli.overrides,
        &allocator,
        registry,
        &workers,
        &shutdown,
    )
    .await;
    if let Err(err) = &result {
        log::error!("{err:#}");
    }

    shutdown.cancel();
    allocator.shutdown().await;
    if tokio::time::timeout(DEFAULT_UPGRADE_TIMEOUT, workers.wait())
        .await
        .is_err()
    {
        log::warn!("{} workers still running at exit", workers.active());
    }
    result
}

async fn run(
    opts: &Options,
    config: Option<&Path>,
    overrides: &Overrides,
    allocator: &Arc<SessionAllocator>,
    registry: Arc<dyn ListenerRegistry>,
    workers: &WorkerGroup,
    shutdown: &Shutdown,
) -> anyhow::Result<()> {
    log::debug!(
        "creating device-plugin service on {} with {} devices",
        opts.listen_socket.display(),
        opts.max_pty
    );
    spawn_signal_handler(workers, shutdown.clone())?;

    let server = PluginServer::bind(
        allocator.clone(),
        &opts.listen_socket,
        registry.clone(),
        workers.clone(),
        shutdown.clone(),
    )
    .with_context(|| format!("failed to listen on {}", opts.listen_socket.display()))?;
    let mut served = workers.spawn("device-plugin", move |_| server.serve());

    dial_unix(&opts.listen_socket, CONTROL_TIMEOUT)
        .await
        .context("dial device-plugin service failed")?;

    init_graceful_upgrade(registry, shutdown.clone(), DEFAULT_UPGRADE_TIMEOUT)?;
    register(&opts.kubelet_socket, &opts.listen_socket, CONTROL_TIMEOUT)
        .await
        .context("register resource failed")?;

    let _watcher = match config {
        Some(path) => match spawn_config_reload(
            path,
            overrides.clone(),
            allocator.clone(),
            workers,
            shutdown.clone(),
        ) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                log::warn!("config hot reload disabled: {err}");
                None
            }
        },
        None => None,
    };

    tokio::select! {
        _ = shutdown.cancelled() => Ok(()),
        outcome = served.join() => match outcome {
            Some(Err(err)) => Err(anyhow::Error::new(err).context("device-plugin server failed")),
            _ => Ok(()),
        },
    }
}

fn spawn_signal_handler(workers: &WorkerGroup, shutdown: Shutdown) -> std::io::Result<()> {
    let mut quit = signal(SignalKind::quit())?;
    let mut terminate = signal(SignalKind::terminate())?;
    workers.spawn("signals", move |_| async move {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok::<_, std::io::Error>(()),
            _ = tokio::signal::ctrl_c() => log::info!("interrupted, shutting down"),
            _ = quit.recv() => log::info!("SIGQUIT received, shutting down"),
            _ = terminate.recv() => log::info!("SIGTERM received, shutting down"),
        }
        shutdown.cancel();
        Ok(())
    });
    Ok(())
}

/// Reload the config file on change and apply its shell to new sessions.
/// Flags given on the command line keep precedence.
fn spawn_config_reload(
    path: &Path,
    overrides: Overrides,
    allocator: Arc<SessionAllocator>,
    workers: &WorkerGroup,
    shutdown: Shutdown,
) -> Result<RecommendedWatcher, String> {
    let (mut changes, watcher) = watch::watch_file(path)?;
    let path = path.to_path_buf();
    workers.spawn("config-reload", move |_| async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok::<_, String>(()),
                changed = changes.recv() => if changed.is_none() {
                    return Ok(());
                },
            }
            match Options::load(&path) {
                Ok(mut reloaded) => {
                    reloaded.apply(&overrides);
                    if reloaded.shell != allocator.shell() {
                        allocator.set_shell(reloaded.shell);
                    }
                }
                Err(err) => log::warn!("ignoring config change: {err}"),
            }
        }
    });
    Ok(watcher)
}
