use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use flotilla_proto::{
    ChannelImages, DaemonInfo, Fleet, FleetClient, FleetDispatcher, MacAssignment, Operation,
    RANDOM_UUID, VmInfo,
};
use roam_stream::{Client, Connector, HandshakeConfig, NoDispatcher, accept};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::error::{FleetError, wire};
use crate::image::{self, ImageStore};
use crate::launcher::{self, Collaborators};
use crate::registry::State;
use crate::supervisor::{self, Settings, Supervisor};

/// How long `server:stop` waits before tearing down, so its reply flushes.
const STOP_DEFER: Duration = Duration::from_millis(100);

// ── Daemon context ──────────────────────────────────────────────────

/// Everything a running daemon owns. One per process, passed explicitly.
pub struct Daemon {
    meta: DaemonInfo,
    config: DaemonConfig,
    state: Arc<Mutex<State>>,
    store: ImageStore,
    collaborators: Collaborators,
    supervisor: Supervisor,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        let store = ImageStore::from_config(&config);
        let collaborators = Collaborators::system(store.clone(), config.runner.clone());
        Self::with_collaborators(config, store, collaborators)
    }

    pub fn with_collaborators(
        config: DaemonConfig,
        store: ImageStore,
        collaborators: Collaborators,
    ) -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let supervisor = Supervisor::new(
            state.clone(),
            collaborators.clone(),
            Settings::from_config(&config),
        );
        Self {
            meta: DaemonInfo {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
                pid: std::process::id(),
                started_at: supervisor::now_unix(),
            },
            config,
            state,
            store,
            collaborators,
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn store(&self) -> &ImageStore {
        &self.store
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Cancelled once the daemon has been asked to exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // ── Operations ──────────────────────────────────────────────────

    pub fn echo(&self) -> DaemonInfo {
        self.meta.clone()
    }

    /// Rescan the store under the lock; the scan may delete directories.
    pub async fn images_list(&self) -> Result<Vec<ChannelImages>, FleetError> {
        let mut state = self.state.lock().await;
        state.media = self.store.scan()?;
        Ok(image::to_wire(&state.media))
    }

    pub async fn images_remove(
        &self,
        channel: &str,
        version: &str,
    ) -> Result<Vec<ChannelImages>, FleetError> {
        let taken = {
            let mut state = self.state.lock().await;
            image::take(&mut state.media, channel, version)?
        };
        self.store.delete_version(channel, &taken)?;
        tracing::info!(channel, version = %taken, "removed image");
        self.images_list().await
    }

    pub async fn vm_list(&self) -> Vec<VmInfo> {
        self.state.lock().await.registry.snapshot()
    }

    pub async fn vm_run(&self, draft: VmInfo) -> Result<VmInfo, FleetError> {
        self.supervisor.run(draft).await
    }

    pub async fn vm_stop(&self, targets: &[String]) -> Vec<String> {
        self.supervisor.stop(targets).await
    }

    /// Identity lookup without reserving anything. `original` is the UUID the
    /// user asked for, used only to report a replacement.
    pub async fn vm_uuid2mac(
        &self,
        uuid: &str,
        original: &str,
    ) -> Result<MacAssignment, FleetError> {
        let state = self.state.lock().await;
        let assigned = state
            .registry
            .resolve_identity(uuid, self.collaborators.resolver.as_ref())?;
        if !original.is_empty()
            && original != RANDOM_UUID
            && !assigned.uuid.eq_ignore_ascii_case(original)
        {
            tracing::info!(original, uuid = %assigned.uuid, "requested UUID replaced");
        }
        Ok(assigned)
    }

    /// Ask the serve loop to exit once the reply has been written.
    pub fn server_stop(&self) -> String {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_DEFER).await;
            token.cancel();
        });
        format!("{} (pid {}) stopping", self.meta.name, self.meta.pid)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Refuse to run twice or without privileges, then prepare the host and
    /// the image store.
    pub async fn preflight(&self) -> Result<(), FleetError> {
        let addr = self.config.listen_addr()?;
        if let Ok(info) = probe(addr, self.config.probe_timeout()).await {
            return Err(FleetError::AlreadyRunning { pid: info.pid });
        }
        if !launcher::is_privileged() {
            return Err(FleetError::InsufficientPrivilege);
        }
        self.collaborators.host.prepare()?;
        self.store.ensure_layout()?;
        let versions: usize = self.images_list().await?.iter().map(|c| c.versions.len()).sum();
        tracing::info!(root = %self.store.root().display(), versions, "image store ready");
        Ok(())
    }

    pub async fn bind(&self) -> Result<TcpListener, FleetError> {
        let addr = self.config.listen_addr()?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| FleetError::io(format!("binding {addr}"), e))
    }

    /// Accept connections until a signal or `server:stop`, then halt every
    /// VM and wait for all supervision tasks.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), FleetError> {
        let mut sigterm = unix_signal(SignalKind::terminate(), "SIGTERM")?;
        let mut sigint = unix_signal(SignalKind::interrupt(), "SIGINT")?;
        let mut sighup = unix_signal(SignalKind::hangup(), "SIGHUP")?;
        let mut sigquit = unix_signal(SignalKind::quit(), "SIGQUIT")?;

        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, pid = self.meta.pid, "daemon listening");

        let handler = FleetImpl {
            daemon: self.clone(),
        };

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted connection");
                            let dispatcher = FleetDispatcher::new(handler.clone());
                            let closing = self.shutdown.clone();
                            tokio::spawn(async move {
                                match accept(stream, HandshakeConfig::default(), dispatcher).await {
                                    Ok((_handle, _incoming, driver)) => {
                                        tokio::select! {
                                            _ = driver.run() => {}
                                            _ = closing.cancelled() => {
                                                tracing::debug!(%peer, "closing connection for shutdown");
                                            }
                                        }
                                    }
                                    Err(e) => tracing::error!("daemon handshake failed: {e}"),
                                }
                            });
                        }
                        Err(e) => tracing::error!("daemon accept error: {e}"),
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("daemon received server:stop");
                    break;
                }
                _ = sigterm.recv() => { tracing::info!("daemon received SIGTERM"); break; }
                _ = sigint.recv() => { tracing::info!("daemon received SIGINT"); break; }
                _ = sighup.recv() => { tracing::info!("daemon received SIGHUP"); break; }
                _ = sigquit.recv() => { tracing::info!("daemon received SIGQUIT"); break; }
            }
        }

        drop(listener);
        self.shutdown.cancel();
        let halted = self.supervisor.shutdown().await;
        tracing::info!(count = halted.len(), "waiting for VMs to exit");
        self.supervisor.drain().await;
        tracing::info!("daemon exited");
        Ok(())
    }
}

fn unix_signal(kind: SignalKind, name: &str) -> Result<tokio::signal::unix::Signal, FleetError> {
    signal(kind).map_err(|e| FleetError::io(format!("registering {name} handler"), e))
}

/// Full daemon lifecycle for `server start`.
pub async fn run_serve(config: DaemonConfig) -> Result<(), FleetError> {
    let daemon = Arc::new(Daemon::new(config));
    daemon.preflight().await?;
    let listener = daemon.bind().await?;
    daemon.serve(listener).await
}

// ── FleetImpl: roam glue ────────────────────────────────────────────

#[derive(Clone)]
pub struct FleetImpl {
    daemon: Arc<Daemon>,
}

impl Fleet for FleetImpl {
    async fn echo(&self, _cx: &roam::Context) -> Result<DaemonInfo, String> {
        tracing::debug!(op = %Operation::Echo);
        Ok(self.daemon.echo())
    }

    async fn images_list(&self, _cx: &roam::Context) -> Result<Vec<ChannelImages>, String> {
        tracing::debug!(op = %Operation::ImagesList);
        self.daemon.images_list().await.map_err(wire)
    }

    async fn images_remove(
        &self,
        _cx: &roam::Context,
        channel: String,
        version: String,
    ) -> Result<Vec<ChannelImages>, String> {
        tracing::debug!(op = %Operation::ImagesRemove, channel, version);
        self.daemon
            .images_remove(&channel, &version)
            .await
            .map_err(wire)
    }

    async fn vm_list(&self, _cx: &roam::Context) -> Result<Vec<VmInfo>, String> {
        tracing::debug!(op = %Operation::VmList);
        Ok(self.daemon.vm_list().await)
    }

    async fn vm_run(&self, _cx: &roam::Context, draft: VmInfo) -> Result<VmInfo, String> {
        tracing::debug!(op = %Operation::VmRun, uuid = %draft.uuid, name = %draft.name);
        self.daemon.vm_run(draft).await.map_err(|e| {
            tracing::error!("vm:run failed: {e}");
            wire(e)
        })
    }

    async fn vm_stop(
        &self,
        _cx: &roam::Context,
        targets: Vec<String>,
    ) -> Result<Vec<String>, String> {
        tracing::debug!(op = %Operation::VmStop, ?targets);
        Ok(self.daemon.vm_stop(&targets).await)
    }

    async fn vm_uuid2mac(
        &self,
        _cx: &roam::Context,
        uuid: String,
        original: String,
    ) -> Result<MacAssignment, String> {
        tracing::debug!(op = %Operation::VmUuid2Mac, uuid);
        self.daemon
            .vm_uuid2mac(&uuid, &original)
            .await
            .map_err(wire)
    }

    async fn server_stop(&self, _cx: &roam::Context) -> Result<String, String> {
        tracing::debug!(op = %Operation::ServerStop);
        Ok(self.daemon.server_stop())
    }
}

// ── Client side ─────────────────────────────────────────────────────

pub struct DaemonConnector {
    addr: SocketAddr,
}

impl Connector for DaemonConnector {
    type Transport = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.addr).await
    }
}

pub type DaemonClient = FleetClient<Client<DaemonConnector, NoDispatcher>>;

/// Client handle bound to `addr`. The connection is made lazily on the first
/// call.
pub fn connect(addr: SocketAddr) -> DaemonClient {
    let client = roam_stream::connect(DaemonConnector { addr }, HandshakeConfig::default(), NoDispatcher);
    FleetClient::new(client)
}

/// Liveness check: an `echo` answered within `timeout`.
pub async fn probe(addr: SocketAddr, timeout: Duration) -> Result<DaemonInfo, FleetError> {
    let client = connect(addr);
    match tokio::time::timeout(timeout, client.echo()).await {
        Ok(Ok(info)) => Ok(info),
        Ok(Err(e)) => {
            tracing::debug!(%addr, "probe failed: {e}");
            Err(FleetError::Unreachable {
                addr: addr.to_string(),
            })
        }
        Err(_) => Err(FleetError::Unreachable {
            addr: addr.to_string(),
        }),
    }
}

/// Bound a client call by `timeout`. The daemon keeps working on the request
/// if the deadline passes.
pub async fn call<T, E, F>(
    addr: SocketAddr,
    operation: Operation,
    timeout: Duration,
    request: F,
) -> Result<T, FleetError>
where
    E: std::fmt::Display,
    F: IntoFuture<Output = Result<T, E>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FleetError::Daemon {
            message: e.to_string(),
        }),
        Err(_) => Err(FleetError::Unresponsive {
            addr: addr.to_string(),
            operation: operation.to_string(),
        }),
    }
}
