//! Bridge Orchestrator — owns one Child Supervisor and one Mini-Server per
//! configured child, wiring the Line Framer, Request Router, Session
//! Registry, and Tool Discovery together into a single running bridge.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{ChildConfig, ToolInfo};
use crate::discovery;
use crate::error::{BridgeError, Result};
use crate::framer::LineFramer;
use crate::mini_server::{self, ConnectionRegistry, MiniServerState};
use crate::observability::{LogSource, ObservabilityHooks};
use crate::router::{Dispatch, Router};
use crate::session::SessionRegistry;
use crate::supervisor;

/// The lifecycle state of one bridged child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// One running (or stopped) bridge: a child process plus the Mini-Server
/// multiplexing network clients onto it.
pub struct BridgeInstance {
    pub config: ChildConfig,
    status: RwLock<BridgeStatus>,
    pub port: RwLock<Option<u16>>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionRegistry>,
    pub connections: Arc<ConnectionRegistry>,
    pub hooks: Arc<ObservabilityHooks>,
    cancel: CancellationToken,
}

impl BridgeInstance {
    pub fn new(config: ChildConfig, hooks: Arc<ObservabilityHooks>) -> Self {
        Self {
            config,
            status: RwLock::new(BridgeStatus::Stopped),
            port: RwLock::new(None),
            router: Arc::new(Router::new()),
            sessions: Arc::new(SessionRegistry::new()),
            connections: Arc::new(ConnectionRegistry::new()),
            hooks,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn status(&self) -> BridgeStatus {
        *self.status.read().await
    }

    async fn set_status(&self, status: BridgeStatus) {
        *self.status.write().await = status;
        self.hooks.emit_status(&self.config.id, status);
    }

    pub async fn active_client_names(&self) -> Vec<String> {
        self.sessions
            .active_clients()
            .await
            .into_iter()
            .map(|s| s.display_name.unwrap_or(s.session_id))
            .collect()
    }

    pub fn stop_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Starts a bridge: spawns the child, binds the Mini-Server's listener, and
/// launches the background tasks (egress pump, stderr drain, session
/// sweeper, tool discovery). Returns once the listener is bound and the
/// child is spawned — `Running` is set just before returning on success.
pub async fn start(instance: Arc<BridgeInstance>) -> Result<()> {
    instance.set_status(BridgeStatus::Starting).await;

    if !instance.config.enabled {
        instance.set_status(BridgeStatus::Stopped).await;
        return Ok(());
    }

    if instance.config.port != 0 && instance.config.port < 1024 {
        instance.set_status(BridgeStatus::Error).await;
        return Err(BridgeError::PortRestricted(
            instance.config.id.clone(),
            instance.config.port,
        ));
    }

    let mut handle = match supervisor::spawn(&instance.config) {
        Ok(h) => h,
        Err(e) => {
            instance.set_status(BridgeStatus::Error).await;
            return Err(e);
        }
    };

    let bind_addr = format!("{}:{}", instance.config.host, instance.config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            let _ = handle.child.start_kill();
            instance.set_status(BridgeStatus::Error).await;
            let kind = e.kind();
            return Err(if kind == std::io::ErrorKind::AddrInUse {
                BridgeError::PortInUse(instance.config.id.clone(), instance.config.port)
            } else {
                BridgeError::BindFailed(instance.config.id.clone(), e.to_string())
            });
        }
    };
    let bound_port = listener
        .local_addr()
        .map_err(|e| BridgeError::BindFailed(instance.config.id.clone(), e.to_string()))?
        .port();
    *instance.port.write().await = Some(bound_port);

    info!(child = %instance.config.id, port = bound_port, "bridge listening");

    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<String>();
    let stdin = handle.stdin;
    spawn_stdin_writer(stdin, stdin_rx, instance.config.id.clone());

    let discovery_stdin_tx = stdin_tx.clone();

    let mini_state = Arc::new(MiniServerState {
        child_id: instance.config.id.clone(),
        bearer_token: instance.config.bearer_token.clone(),
        host: instance.config.host.clone(),
        port: bound_port,
        router: instance.router.clone(),
        sessions: instance.sessions.clone(),
        connections: instance.connections.clone(),
        stdin_tx,
    });

    let cancel = instance.cancel.clone();
    tokio::spawn(mini_server::serve(listener, mini_state, cancel.clone()));

    spawn_stderr_drain(handle.stderr, instance.clone());
    spawn_egress_pump(handle.stdout, instance.clone(), cancel.clone());
    spawn_session_sweeper(instance.clone(), cancel.clone());

    if instance.config.tools.is_empty() {
        spawn_discovery(instance.clone(), discovery_stdin_tx);
    } else {
        instance.hooks.emit_tools(&instance.config.id, instance.config.tools.clone());
    }

    tokio::spawn(watch_child_exit(handle.child, instance.clone()));

    instance.set_status(BridgeStatus::Running).await;
    Ok(())
}

fn spawn_stdin_writer(
    mut stdin: tokio::process::ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    child_id: String,
) {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                warn!(child = %child_id, error = %e, "failed writing to child stdin");
                break;
            }
        }
    });
}

fn spawn_stderr_drain(stderr: tokio::io::BufReader<tokio::process::ChildStderr>, instance: Arc<BridgeInstance>) {
    tokio::spawn(async move {
        supervisor::drain_stderr(stderr, |line| {
            instance.hooks.emit_log(&instance.config.id, LogSource::ChildStderr, line);
        })
        .await;
    });
}

fn spawn_egress_pump(
    mut stdout: tokio::io::BufReader<tokio::process::ChildStdout>,
    instance: Arc<BridgeInstance>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;
        let mut framer = LineFramer::new();
        let mut buf = [0u8; 8192];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => {
                            info!(child = %instance.config.id, "child stdout closed");
                            instance.set_status(BridgeStatus::Stopped).await;
                            instance.cancel.cancel();
                            return;
                        }
                        Ok(n) => {
                            for line in framer.push(&buf[..n]) {
                                handle_egress_line(&instance, &line).await;
                            }
                        }
                        Err(e) => {
                            error!(child = %instance.config.id, error = %e, "error reading child stdout");
                            instance.set_status(BridgeStatus::Error).await;
                            instance.cancel.cancel();
                            return;
                        }
                    }
                }
            }
        }
    });
}

async fn handle_egress_line(instance: &Arc<BridgeInstance>, line: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        warn!(child = %instance.config.id, "child emitted non-JSON line, dropping");
        return;
    };

    match instance.router.dispatch_line(line).await {
        Dispatch::ToPending(crate::router::PendingRequest::Sync { connection_id })
        | Dispatch::ToPending(crate::router::PendingRequest::Stream { connection_id }) => {
            instance.connections.deliver(&connection_id, value).await;
        }
        Dispatch::ToSession(session_id) => {
            if let Some(session) = instance.sessions.get(&session_id).await {
                if let Some(conn_id) = session.bound_connection {
                    instance.connections.deliver(&conn_id, value).await;
                }
            }
        }
        Dispatch::Broadcast => {
            instance.connections.broadcast(&value).await;
        }
    }
}

fn spawn_session_sweeper(instance: Arc<BridgeInstance>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    instance.sessions.sweep().await;
                    let names = instance.active_client_names().await;
                    instance.hooks.emit_active_clients(&instance.config.id, names);
                }
            }
        }
    });
}

fn spawn_discovery(instance: Arc<BridgeInstance>, stdin_tx: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        tokio::time::sleep(discovery::DISCOVERY_DELAY).await;
        if !matches!(
            instance.status().await,
            BridgeStatus::Running | BridgeStatus::Starting
        ) {
            return;
        }
        instance.router.begin_discovery();
        let result = discovery::run_live_discovery(
            &instance.router,
            &instance.connections,
            &stdin_tx,
            &instance.config.id,
        )
        .await;
        instance.router.end_discovery();
        match result {
            Ok(tools) => {
                info!(child = %instance.config.id, count = tools.len(), "discovered tools");
                instance.hooks.emit_tools(&instance.config.id, tools);
            }
            Err(e) => {
                warn!(child = %instance.config.id, error = %e, "tool discovery failed");
            }
        }
    });
}

async fn watch_child_exit(mut child: tokio::process::Child, instance: Arc<BridgeInstance>) {
    let status = child.wait().await;
    match status {
        Ok(status) => info!(child = %instance.config.id, %status, "child process exited"),
        Err(e) => error!(child = %instance.config.id, error = %e, "error waiting on child"),
    }
    instance.cancel.cancel();
    let mut current = instance.status.write().await;
    if *current != BridgeStatus::Stopped {
        *current = BridgeStatus::Stopped;
        instance.hooks.emit_status(&instance.config.id, BridgeStatus::Stopped);
    }
}

/// Stops a running bridge: cancels its token (tearing down the Mini-Server
/// and background tasks) and marks it `Stopped`.
pub async fn stop(instance: &Arc<BridgeInstance>) {
    instance.cancel.cancel();
    instance.set_status(BridgeStatus::Stopped).await;
}
