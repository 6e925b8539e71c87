//! Bridge daemon: socket listener, shim session, engine event loop.
//!
//! Architecture: a single daemon loop owns the [`Engine`] of the active
//! shim session and feeds it events strictly in arrival order. The
//! connection task answers request/reply traffic on its own, so the
//! engine can await browser calls from inside the loop without
//! starving the socket. Only one shim is served at a time; a second
//! concurrent connection is told `busy` and closed.
//!
//! A session's engine lives exactly as long as its connection. On
//! disconnect all refocus timers are cancelled and the registry is
//! dropped; the next shim rebuilds it from its startup event.

mod connection;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use connection::ConnectionId;

use crate::browser::BrowserEvent;
use crate::browser::remote::{RemoteBrowser, ReplyRouter};
use crate::config::EngineConfig;
use crate::engine::Engine;

/// Daemon startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("$XDG_RUNTIME_DIR is not set and no --socket was given")]
    NoRuntimeDir,
    #[error("daemon already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Explicit socket path; defaults to `$XDG_RUNTIME_DIR/tabwarden/bridge.sock`.
    pub socket: Option<PathBuf>,
    /// How long a bridge request may wait for the shim's reply.
    pub request_timeout: Duration,
    /// How long a new connection may take to send its hello.
    pub hello_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket: None,
            request_timeout: Duration::from_secs(10),
            hello_timeout: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}

/// Run the daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `DaemonError` if no socket path can be resolved, the bind
/// fails, or another daemon is already listening.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let socket_path = match &config.socket {
        Some(path) => path.clone(),
        None => resolve_socket_path()?,
    };
    let listener = bind_socket(&socket_path, config.socket.is_none()).await?;

    tracing::info!(path = %socket_path.display(), "daemon listening");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    serve(listener, &config, shutdown).await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!("daemon stopped");
    Ok(())
}

/// One shim connection and the engine driven by it.
struct Session {
    id: ConnectionId,
    engine: Engine,
    router: ReplyRouter,
    events: mpsc::UnboundedReceiver<BrowserEvent>,
    task: JoinHandle<()>,
}

impl Session {
    fn start(id: ConnectionId, stream: UnixStream, config: &DaemonConfig) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let router = ReplyRouter::new();

        let browser = Arc::new(RemoteBrowser::new(
            outgoing_tx,
            router.clone(),
            config.request_timeout,
        ));
        let engine = Engine::new(browser, config.engine.clone());
        let task = connection::spawn_connection(
            stream,
            id,
            config.hello_timeout,
            router.clone(),
            outgoing_rx,
            events_tx,
        );

        tracing::debug!(conn_id = ?id, "session started");
        Self {
            id,
            engine,
            router,
            events,
            task,
        }
    }

    fn close(mut self) {
        self.engine.shutdown();
        self.router.fail_all();
        self.task.abort();
        tracing::info!(conn_id = ?self.id, "session closed");
    }
}

/// Next event of the active session. Pending forever without one;
/// `None` means the session's connection ended.
async fn next_event(session: &mut Option<Session>) -> Option<BrowserEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

/// The daemon loop. Returns when `shutdown` completes.
async fn serve(listener: UnixListener, config: &DaemonConfig, shutdown: impl Future<Output = ()>) {
    tokio::pin!(shutdown);

    let mut session: Option<Session> = None;
    let mut next_conn = 0u64;

    let period = config.engine.gc_interval;
    let mut gc = tokio::time::interval_at(Instant::now() + period, period);
    gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // -- New connection --
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        next_conn += 1;
                        let conn_id = ConnectionId(next_conn);
                        match &session {
                            Some(active) => connection::reject_busy(stream, conn_id, active.id),
                            None => session = Some(Session::start(conn_id, stream, config)),
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                }
            }

            // -- Browser event, or disconnect --
            event = next_event(&mut session) => {
                match (event, session.as_mut()) {
                    (Some(event), Some(active)) => active.engine.handle_event(event).await,
                    (None, _) => {
                        if let Some(closed) = session.take() {
                            closed.close();
                        }
                    }
                    (Some(_), None) => {}
                }
            }

            // -- Registry garbage collection --
            _ = gc.tick() => {
                if let Some(active) = session.as_mut() {
                    active.engine.collect_garbage().await;
                }
            }

            () = &mut shutdown => break,
        }
    }

    if let Some(active) = session.take() {
        active.close();
    }
}

// -- Socket setup --

/// Resolve the default socket path from `$XDG_RUNTIME_DIR`.
fn resolve_socket_path() -> Result<PathBuf, DaemonError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| DaemonError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("tabwarden")
        .join("bridge.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// The parent directory is restricted to mode 0700 only when this call
/// created it or when `own_dir` marks it as the daemon's own runtime
/// directory; a directory handed in through `--socket` keeps its mode.
///
/// Handles stale socket detection: if EADDRINUSE, attempts to connect
/// to the existing socket. If the connection succeeds, another daemon
/// is running. If it fails, the socket is stale and is removed.
async fn bind_socket(path: &Path, own_dir: bool) -> Result<UnixListener, DaemonError> {
    let bind_failed = |source| DaemonError::BindFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let mkdir_failed = |source| DaemonError::MkdirFailed {
            path: parent.to_path_buf(),
            source,
        };
        let created = !parent.exists();
        if created {
            std::fs::create_dir_all(parent).map_err(mkdir_failed)?;
        }
        if created || own_dir {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))
                .map_err(mkdir_failed)?;
        }
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => match UnixStream::connect(path).await {
            Ok(_) => Err(DaemonError::AlreadyRunning(path.to_path_buf())),
            Err(_) => {
                tracing::info!(path = %path.display(), "removing stale socket");
                std::fs::remove_file(path).map_err(bind_failed)?;
                UnixListener::bind(path).map_err(bind_failed)
            }
        },
        Err(e) => Err(bind_failed(e)),
    }
}
