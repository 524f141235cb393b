//! Session files and socket placement for daemon coordination.
//!
//! A session pairs one workspace with one daemon socket. Metadata lives at
//! `<workspace>/.crush/session` so every client launched from that workspace
//! finds the same daemon; the socket lives in a per-user owner-only runtime
//! directory.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::{getuid, Pid};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Name of the session file inside the workspace `.crush` folder.
pub const SESSION_FILE_NAME: &str = "session";
/// Name of the socket directory inside the runtime dir.
pub const SOCKET_DIR_NAME: &str = "neocrush";

const STALE_SOCKET_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// A paired editor/agent session: one workspace, one socket, shared state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub workspace_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neovim_pid: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub socket_path: PathBuf,
}

/// Handles session files and the secure socket directory.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
    socket_dir: PathBuf,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::with_socket_dir(secure_socket_dir())
    }

    /// Uses an explicit socket directory instead of the environment-derived
    /// one. Used by tests that must not touch the real runtime dir.
    pub fn with_socket_dir(socket_dir: PathBuf) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            socket_dir,
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Socket path for a session id inside the secure directory.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.socket_dir.join(format!("{id}.sock"))
    }

    /// Creates the socket directory with owner-only permissions, fixing the
    /// mode if the directory already existed with a wider one.
    pub fn ensure_secure_socket_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.socket_dir)
            .with_context(|| format!("failed to create socket directory {}", self.socket_dir.display()))?;

        let mode = fs::metadata(&self.socket_dir)?.permissions().mode() & 0o777;
        if mode != 0o700 {
            fs::set_permissions(&self.socket_dir, fs::Permissions::from_mode(0o700))
                .context("failed to set socket directory permissions")?;
        }
        Ok(())
    }

    /// Creates a new session: mints an id, secures the socket directory,
    /// writes the workspace session file, and registers it in memory.
    pub fn create(&self, workspace_root: &Path, neovim_pid: Option<i32>) -> Result<Session> {
        let id = generate_session_id();
        self.ensure_secure_socket_dir()?;

        let session = Session {
            socket_path: self.socket_path(&id),
            id,
            workspace_root: workspace_root.to_path_buf(),
            neovim_pid,
            created_at: Utc::now(),
        };

        save_workspace_session_file(&session)?;

        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(session.id.clone(), session.clone());

        Ok(session)
    }

    /// Reads the workspace session file without verifying the socket.
    /// The daemon uses this before it has created the socket.
    pub fn load_metadata(&self, workspace_root: &Path) -> Result<Session> {
        self.load_inner(workspace_root, false)
    }

    /// Reads the workspace session file and verifies the socket still exists.
    /// A missing socket marks the session stale: the metadata file is removed
    /// and an error returned.
    pub fn load(&self, workspace_root: &Path) -> Result<Session> {
        self.load_inner(workspace_root, true)
    }

    fn load_inner(&self, workspace_root: &Path, check_socket: bool) -> Result<Session> {
        let session_file = workspace_session_file(workspace_root);
        let data = fs::read(&session_file)
            .with_context(|| format!("no session file at {}", session_file.display()))?;
        let session: Session =
            serde_json::from_slice(&data).context("failed to parse session file")?;

        if check_socket && !session.socket_path.exists() {
            let _ = fs::remove_file(&session_file);
            anyhow::bail!("session socket no longer exists");
        }

        self.sessions
            .write()
            .expect("session table lock poisoned")
            .insert(session.id.clone(), session.clone());

        Ok(session)
    }

    /// Loads a valid session for the workspace, or creates a new one.
    pub fn discover(&self, workspace_root: &Path, neovim_pid: Option<i32>) -> Result<Session> {
        match self.load(workspace_root) {
            Ok(session) => Ok(session),
            Err(_) => self.create(workspace_root, neovim_pid),
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions
            .read()
            .expect("session table lock poisoned")
            .get(id)
            .cloned()
    }

    /// Removes a session's socket, workspace file, and in-memory record.
    pub fn remove(&self, id: &str) {
        let session = self
            .sessions
            .write()
            .expect("session table lock poisoned")
            .remove(id);

        let Some(session) = session else { return };
        let _ = fs::remove_file(&session.socket_path);
        let _ = fs::remove_file(workspace_session_file(&session.workspace_root));
    }

    /// Sweeps the socket directory for leftovers from dead daemons.
    /// Sockets older than 24 hours are assumed abandoned.
    pub fn cleanup_stale(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.socket_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sock") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            if modified.elapsed().map(|age| age > STALE_SOCKET_AGE).unwrap_or(false) {
                debug!(path = %path.display(), "removing stale socket");
                let _ = fs::remove_file(&path);
            }
        }

        Ok(())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 16 hex characters from 8 cryptographically random bytes.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Secure per-user socket directory: `$XDG_RUNTIME_DIR/neocrush` when the
/// runtime dir is announced, otherwise `<tmp>/neocrush-<uid>`.
pub fn secure_socket_dir() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        if !runtime_dir.is_empty() {
            return PathBuf::from(runtime_dir).join(SOCKET_DIR_NAME);
        }
    }
    std::env::temp_dir().join(format!("{SOCKET_DIR_NAME}-{}", getuid().as_raw()))
}

fn workspace_session_file(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".crush").join(SESSION_FILE_NAME)
}

/// Writes the session file under `<workspace>/.crush/`, via a temp file and
/// rename so a concurrent reader sees either the old or the new JSON.
fn save_workspace_session_file(session: &Session) -> Result<()> {
    let crush_dir = session.workspace_root.join(".crush");
    fs::create_dir_all(&crush_dir)
        .with_context(|| format!("failed to create {}", crush_dir.display()))?;

    let data = serde_json::to_vec_pretty(session).context("failed to serialize session")?;

    let target = crush_dir.join(SESSION_FILE_NAME);
    let tmp = crush_dir.join(format!(".{SESSION_FILE_NAME}.{}.tmp", std::process::id()));
    fs::write(&tmp, &data).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
    fs::rename(&tmp, &target)
        .with_context(|| format!("failed to move session file into {}", target.display()))?;

    Ok(())
}

/// Signal-0 probe: true when a process with this pid exists and is ours to
/// signal.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::with_socket_dir(dir.path().join("sockets"))
    }

    #[test]
    fn session_ids_are_16_hex_chars_and_unique() {
        let first = generate_session_id();
        let second = generate_session_id();

        assert_eq!(first.len(), 16);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }

    #[test]
    fn create_writes_metadata_and_socket_path() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        let session = mgr.create(tmp.path(), Some(12345)).unwrap();

        assert_eq!(session.id.len(), 16);
        assert_eq!(session.workspace_root, tmp.path());
        assert_eq!(session.neovim_pid, Some(12345));
        assert!(session.socket_path.starts_with(mgr.socket_dir()));
        assert!(tmp.path().join(".crush").join(SESSION_FILE_NAME).exists());

        let mode = fs::metadata(mgr.socket_dir()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }

    #[test]
    fn load_metadata_ignores_missing_socket() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let created = mgr.create(tmp.path(), None).unwrap();

        let loaded = manager(&tmp).load_metadata(tmp.path()).unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.socket_path, created.socket_path);
    }

    #[test]
    fn load_detects_stale_session_and_removes_metadata() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        mgr.create(tmp.path(), None).unwrap();

        // No socket file was ever created, so the session is stale.
        assert!(manager(&tmp).load(tmp.path()).is_err());
        assert!(!tmp.path().join(".crush").join(SESSION_FILE_NAME).exists());
    }

    #[test]
    fn load_succeeds_when_socket_exists() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let created = mgr.create(tmp.path(), None).unwrap();
        fs::write(&created.socket_path, b"").unwrap();

        let loaded = manager(&tmp).load(tmp.path()).unwrap();
        assert_eq!(loaded.id, created.id);
    }

    #[test]
    fn discover_creates_when_stale() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let first = mgr.create(tmp.path(), None).unwrap();

        // Socket never appeared, so discover mints a fresh session.
        let second = manager(&tmp).discover(tmp.path(), None).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn remove_deletes_socket_and_metadata() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let session = mgr.create(tmp.path(), None).unwrap();
        fs::write(&session.socket_path, b"").unwrap();

        mgr.remove(&session.id);

        assert!(!session.socket_path.exists());
        assert!(!tmp.path().join(".crush").join(SESSION_FILE_NAME).exists());
        assert!(mgr.get(&session.id).is_none());
    }

    #[test]
    fn metadata_survives_a_reload_round_trip() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let created = mgr.create(tmp.path(), Some(4242)).unwrap();

        let raw = fs::read_to_string(tmp.path().join(".crush").join(SESSION_FILE_NAME)).unwrap();
        let parsed: Session = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.id, created.id);
        assert_eq!(parsed.neovim_pid, Some(4242));
        assert_eq!(parsed.created_at, created.created_at);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id() as i32));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(-1));
    }
}
