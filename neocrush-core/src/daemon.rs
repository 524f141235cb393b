//! The background daemon: one process per session, listening on the session
//! socket, routing frames between however many clients connect.
//!
//! The daemon is spawned by the first client (see `launcher`) with the
//! session id in the environment. It exits when the last identified client
//! disconnects or on SIGINT/SIGTERM, removing its socket and the workspace
//! session file either way.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::router::{Client, ClientRole, Router};
use crate::session::{Session, SessionManager};
use crate::transport::Transport;
use crate::SESSION_ID_ENV;

pub struct Daemon {
    pub router: Router,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            router: Router::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until the daemon shuts down.
    pub async fn serve(self: &Arc<Self>, listener: UnixListener) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move { daemon.serve_connection(stream).await });
                        }
                        Err(err) => {
                            error!(%err, "accept failed");
                            return;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => return,
            }
        }
    }

    /// Reads frames from one connection until EOF, identifying the client on
    /// its first meaningful frame and dispatching the rest through the
    /// router. Shuts the daemon down when the last identified client leaves.
    pub async fn serve_connection(self: &Arc<Self>, stream: UnixStream) {
        let transport = Arc::new(Transport::socket(stream));
        let mut registered: Option<Arc<Client>> = None;

        loop {
            let frame = tokio::select! {
                frame = transport.read() => frame,
                _ = self.shutdown.cancelled() => break,
            };

            let (method, content) = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    // Malformed frame or JSON is fatal for this connection
                    // only; peers are unaffected.
                    warn!(%err, "closing connection after protocol error");
                    break;
                }
            };

            let client = match &registered {
                Some(client) => client.clone(),
                None => match self.identify(&transport, &method, &content).await {
                    Ok(Some(client)) => {
                        registered = Some(client.clone());
                        // An initialize was answered directly and is never
                        // forwarded; tool queries fall through to dispatch.
                        if method == "initialize" {
                            continue;
                        }
                        client
                    }
                    Ok(None) => continue,
                    Err(err) => {
                        warn!(%err, "failed to identify client");
                        continue;
                    }
                },
            };

            if let Err(err) = self.router.handle_message(&client, &method, &content).await {
                warn!(role = %client.role, method, %err, "handler error");
            }
        }

        transport.close();

        if let Some(client) = registered {
            let remaining = self.router.unregister(client.id);
            if remaining == 0 {
                info!("no clients remaining, shutting down");
                self.shutdown.cancel();
            }
        }
    }

    /// First-frame identification. Tool-query methods identify the sender as
    /// a tool client with no `initialize` required; an `initialize` is
    /// answered and mapped to a role; anything else is ignored until a role
    /// exists (the daemon still answers a later `initialize`).
    async fn identify(
        &self,
        transport: &Arc<Transport>,
        method: &str,
        content: &[u8],
    ) -> Result<Option<Arc<Client>>> {
        let role = match method {
            "crush/getEditorContext" | "crush/showLocations" => ClientRole::Tool,
            "initialize" => self.router.respond_initialize(transport, content).await?,
            _ => {
                debug!(method, "frame before identification, ignoring");
                return Ok(None);
            }
        };

        let client = Arc::new(Client::new(role, transport.clone()));
        self.router.register(client.clone());
        Ok(Some(client))
    }
}

/// Full daemon bring-up, driven from the hidden `--daemon` CLI flag.
pub async fn run() -> Result<()> {
    let session_id =
        std::env::var(SESSION_ID_ENV).with_context(|| format!("{SESSION_ID_ENV} not set"))?;

    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let manager = SessionManager::new();

    let session = manager
        .load_metadata(&cwd)
        .context("failed to load session metadata")?;
    if session.id != session_id {
        bail!("session id mismatch: expected {session_id}, found {}", session.id);
    }

    if let Err(err) = manager.cleanup_stale() {
        warn!(%err, "stale socket sweep failed");
    }

    let listener = bind_session_socket(&manager, &session)?;
    info!(socket = %session.socket_path.display(), "daemon listening");

    let daemon = Daemon::new();

    let accept = {
        let daemon = daemon.clone();
        tokio::spawn(async move { daemon.serve(listener).await })
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("failed to install SIGINT handler")?;

    let shutdown = daemon.shutdown_token();
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sigterm.recv() => {
            info!("received SIGTERM");
            shutdown.cancel();
        }
        _ = sigint.recv() => {
            info!("received SIGINT");
            shutdown.cancel();
        }
    }

    info!("daemon shutting down");
    daemon.router.close_all();
    accept.abort();
    manager.remove(&session.id);

    Ok(())
}

/// Binds the session socket with owner-only permissions, clearing any
/// leftover socket file from a previous daemon first.
fn bind_session_socket(manager: &SessionManager, session: &Session) -> Result<UnixListener> {
    manager.ensure_secure_socket_dir()?;

    if session.socket_path.exists() {
        fs::remove_file(&session.socket_path)
            .with_context(|| format!("failed to remove stale socket {}", session.socket_path.display()))?;
    }

    let listener = UnixListener::bind(&session.socket_path)
        .with_context(|| format!("failed to listen on {}", session.socket_path.display()))?;

    if let Err(err) =
        fs::set_permissions(&session.socket_path, fs::Permissions::from_mode(0o600))
    {
        warn!(%err, "failed to set socket permissions");
    }

    Ok(listener)
}
