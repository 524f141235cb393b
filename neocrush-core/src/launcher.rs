//! Client-side bootstrap.
//!
//! Every `neocrush` invocation without `--daemon` is a client: it detects the
//! protocol its caller speaks on stdin, finds or starts the workspace daemon,
//! and then either bridges stdio to the daemon socket (LSP) or serves the MCP
//! tools backed by the daemon connection.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::rpc;
use crate::session::{Session, SessionManager};
use crate::{mcp, SESSION_ID_ENV};

/// How long the first byte on stdin may take before we assume a tool-protocol
/// client that stays silent until solicited.
const PROTOCOL_DETECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Connect timeout against a daemon we believe is already running.
const EXISTING_DAEMON_TIMEOUT: Duration = Duration::from_secs(2);
/// Connect timeout against a daemon we just spawned.
const FRESH_DAEMON_TIMEOUT: Duration = Duration::from_secs(5);
/// Socket rendezvous: 50 polls, 100 ms apart.
const SOCKET_POLLS: u32 = 50;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireProtocol {
    /// Content-Length framed JSON-RPC, from the editor or the agent.
    Lsp,
    /// Newline-delimited JSON, from MCP tool clients.
    Mcp,
}

/// Runs the client side: detect, connect, bridge.
pub async fn run() -> Result<()> {
    let cwd = std::env::current_dir().context("failed to resolve working directory")?;
    let manager = SessionManager::new();

    let mut stdin = tokio::io::stdin();
    let (protocol, prefix) = detect_protocol(&mut stdin).await;
    info!(?protocol, "detected client protocol");

    let stream = connect_to_daemon(&manager, &cwd).await?;

    match protocol {
        WireProtocol::Mcp => mcp::serve_stdio(stream, prefix, stdin).await,
        WireProtocol::Lsp => bridge(stream, prefix, stdin).await,
    }
}

/// Peeks at the first byte of stdin: `{` opens a line-delimited JSON message
/// (MCP), `C` opens a `Content-Length` header (LSP). No byte within the
/// timeout, or an unreadable stdin, is treated as MCP, which may legitimately
/// stay silent until the daemon side answers.
async fn detect_protocol(stdin: &mut tokio::io::Stdin) -> (WireProtocol, Vec<u8>) {
    let mut first = [0u8; 1];
    match timeout(PROTOCOL_DETECT_TIMEOUT, stdin.read(&mut first)).await {
        Ok(Ok(0)) => {
            debug!("stdin closed before first byte, attempting MCP mode");
            (WireProtocol::Mcp, Vec::new())
        }
        Ok(Ok(_)) => {
            let protocol = if first[0] == b'{' { WireProtocol::Mcp } else { WireProtocol::Lsp };
            (protocol, first.to_vec())
        }
        Ok(Err(err)) => {
            debug!(%err, "stdin read failed, attempting MCP mode");
            (WireProtocol::Mcp, Vec::new())
        }
        Err(_elapsed) => {
            debug!("no bytes within detection timeout, assuming MCP");
            (WireProtocol::Mcp, Vec::new())
        }
    }
}

/// Connects to the workspace daemon, starting one when none answers.
async fn connect_to_daemon(manager: &SessionManager, cwd: &Path) -> Result<UnixStream> {
    // A session file alone proves nothing; connecting is the liveness check.
    if let Ok(session) = manager.load_metadata(cwd) {
        match timeout(EXISTING_DAEMON_TIMEOUT, UnixStream::connect(&session.socket_path)).await {
            Ok(Ok(stream)) => {
                info!(id = %session.id, "connected to existing session");
                return Ok(stream);
            }
            _ => {
                info!("session exists but daemon unreachable, creating new session");
            }
        }
    }

    let session = start_daemon(manager, cwd).await?;

    let stream = timeout(FRESH_DAEMON_TIMEOUT, UnixStream::connect(&session.socket_path))
        .await
        .context("timed out connecting to daemon")?
        .context("failed to connect to daemon")?;

    info!(id = %session.id, "connected to session");
    Ok(stream)
}

/// Creates a session, spawns a detached daemon for it, and waits for the
/// socket to appear.
async fn start_daemon(manager: &SessionManager, cwd: &Path) -> Result<Session> {
    let session = manager
        .create(cwd, std::os::unix::process::parent_id().try_into().ok())
        .context("failed to create session")?;

    let exe = std::env::current_exe().context("failed to resolve executable path")?;
    let log_path = session
        .socket_path
        .parent()
        .map(|dir| dir.join("daemon.log"))
        .unwrap_or_else(|| "daemon.log".into());

    let child = tokio::process::Command::new(exe)
        .arg("--daemon")
        .arg("--log")
        .arg(&log_path)
        .current_dir(cwd)
        .env(SESSION_ID_ENV, &session.id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to start daemon")?;

    // Dropping the handle detaches the child; it must outlive this client.
    drop(child);

    for _ in 0..SOCKET_POLLS {
        tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        if session.socket_path.exists() {
            return Ok(session);
        }
    }

    bail!("daemon did not create socket within timeout");
}

/// Bridges stdio to the daemon socket, frame by frame in both directions.
/// Returns when either side reaches end-of-stream.
async fn bridge(stream: UnixStream, prefix: Vec<u8>, stdin: tokio::io::Stdin) -> Result<()> {
    let (socket_read, socket_write) = stream.into_split();
    let stdin = std::io::Cursor::new(prefix).chain(stdin);

    let inbound = tokio::spawn(pump(stdin, socket_write));
    let outbound = tokio::spawn(pump(socket_read, tokio::io::stdout()));

    tokio::select! {
        result = inbound => result??,
        result = outbound => result??,
    }
    Ok(())
}

/// Copies complete frames from reader to writer until end-of-stream.
async fn pump(
    mut reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    let mut chunk = [0u8; 64 * 1024];

    loop {
        while let Some(frame) = rpc::split(&mut buf)? {
            writer.write_all(&frame).await?;
            writer.flush().await?;
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !buf.is_empty() {
                warn!("stream ended mid-frame ({} buffered bytes)", buf.len());
            }
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
