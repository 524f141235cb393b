//! Message routing between connected clients.
//!
//! The router owns the client table and the shared session state. Frames from
//! an identified client are classified in a fixed order: tool queries are
//! answered locally, cursor/selection notifications mutate state, responses
//! to daemon-issued requests are swallowed, and everything else is forwarded
//! to the peer role (editor <-> agent), with agent edits rewritten into
//! minimal `workspace/applyEdit` requests on the way to the editor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::edits::{compute_line_edits, noop_replacement, uri_to_path};
use crate::protocol::*;
use crate::state::SessionState;
use crate::transport::Transport;

pub type ClientId = Uuid;

/// Function a connected client serves, derived from its `initialize` request
/// (or from a tool-query method for tool clients).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRole {
    Editor,
    Agent,
    Tool,
    /// Unrecognized `clientInfo.name`, kept verbatim as a fallback role.
    Other(String),
}

impl ClientRole {
    /// Single canonical matcher for `clientInfo.name`. Case-insensitive
    /// contains: anything in the vim family is the editor, anything in the
    /// crush family is the agent.
    pub fn from_client_info(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower.contains("vim") {
            ClientRole::Editor
        } else if lower.contains("crush") || lower.contains("powernap") {
            ClientRole::Agent
        } else if name.is_empty() {
            ClientRole::Other("unknown".to_string())
        } else {
            ClientRole::Other(name.to_string())
        }
    }

    /// The role this client's traffic is forwarded to.
    fn peer(&self) -> Option<ClientRole> {
        match self {
            ClientRole::Editor => Some(ClientRole::Agent),
            ClientRole::Agent => Some(ClientRole::Editor),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ClientRole::Editor => "editor",
            ClientRole::Agent => "agent",
            ClientRole::Tool => "tool",
            ClientRole::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event categories a tool or agent client can subscribe to.
#[derive(Debug, Clone, Copy, Default)]
pub struct Subscriptions {
    pub document_changes: bool,
    pub cursor_changes: bool,
    pub focus_changes: bool,
    pub diagnostics: bool,
}

pub struct Client {
    pub id: ClientId,
    pub role: ClientRole,
    pub transport: Arc<Transport>,
    subscriptions: StdRwLock<Subscriptions>,
}

impl Client {
    pub fn new(role: ClientRole, transport: Arc<Transport>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            transport,
            subscriptions: StdRwLock::new(Subscriptions::default()),
        }
    }

    fn subscriptions(&self) -> Subscriptions {
        *self.subscriptions.read().expect("subscriptions lock poisoned")
    }
}

#[derive(Default)]
pub struct Router {
    clients: DashMap<ClientId, Arc<Client>>,
    pub state: SessionState,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an identified client. For the singleton roles (editor,
    /// agent) the most recent registration wins; a superseded connection
    /// stays open but no longer receives forwarded traffic.
    pub fn register(&self, client: Arc<Client>) {
        if matches!(client.role, ClientRole::Editor | ClientRole::Agent) {
            let stale: Vec<ClientId> = self
                .clients
                .iter()
                .filter(|entry| entry.value().role == client.role)
                .map(|entry| *entry.key())
                .collect();
            for id in stale {
                debug!(role = %client.role, "replacing superseded {} connection", client.role);
                self.clients.remove(&id);
            }
        }

        info!(role = %client.role, id = %client.id, "client registered");
        self.clients.insert(client.id, client);
    }

    /// Drops a client from the table. Returns how many clients remain.
    pub fn unregister(&self, id: ClientId) -> usize {
        if let Some((_, client)) = self.clients.remove(&id) {
            info!(role = %client.role, id = %id, "client disconnected");
        }
        self.clients.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn find_role(&self, role: &ClientRole) -> Option<Arc<Client>> {
        self.clients
            .iter()
            .find(|entry| entry.value().role == *role)
            .map(|entry| entry.value().clone())
    }

    pub fn editor(&self) -> Option<Arc<Client>> {
        self.find_role(&ClientRole::Editor)
    }

    /// Closes every client transport. Used during daemon shutdown.
    pub fn close_all(&self) {
        for entry in self.clients.iter() {
            entry.value().transport.close();
        }
        self.clients.clear();
    }

    // ------------------------------------------------------------------
    // Identification
    // ------------------------------------------------------------------

    /// Answers an `initialize` request on behalf of the daemon and returns
    /// the role derived from `clientInfo.name`. The request is never
    /// forwarded upstream.
    pub async fn respond_initialize(
        &self,
        transport: &Transport,
        content: &[u8],
    ) -> Result<ClientRole> {
        let envelope: IncomingEnvelope =
            serde_json::from_slice(content).context("failed to parse initialize request")?;
        let params: InitializeParams = envelope
            .params
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or(InitializeParams { client_info: None });

        let name = params
            .client_info
            .map(|info| info.name)
            .unwrap_or_default();
        let role = ClientRole::from_client_info(&name);

        // The editor's own change stream must not echo back through us, so
        // its sync is disabled; the agent streams full-document changes in.
        let change_sync = if role == ClientRole::Editor { 0 } else { 2 };

        let response = JsonRpcResponse::result(
            envelope.id.unwrap_or(Value::Null),
            json!({
                "capabilities": {
                    "textDocumentSync": {
                        "openClose": true,
                        "change": change_sync,
                    },
                    "experimental": {
                        "cursorSync": true,
                        "selectionSync": true,
                        "editorContext": true,
                    },
                },
                "serverInfo": {
                    "name": "neocrush",
                    "version": crate::version(),
                },
            }),
        );
        transport.write(&response).await?;

        info!(client = %name, role = %role, "client identified");
        Ok(role)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    pub async fn handle_message(
        &self,
        client: &Arc<Client>,
        method: &str,
        content: &[u8],
    ) -> Result<()> {
        debug!(role = %client.role, method, "received");

        match method {
            // Tool queries are served locally and never forwarded.
            "crush/getEditorContext" => self.respond_editor_context(client, content).await,
            "crush/getState" => self.respond_get_state(client, content).await,
            "crush/subscribe" => self.respond_subscribe(client, content).await,
            "crush/showLocations" => self.forward_to_editor(method, content).await,

            "initialized" => Ok(()),

            "crush/cursorMoved" => self.handle_cursor_moved(client, content).await,
            "crush/selectionChanged" => self.handle_selection_changed(client, content).await,

            // No method: a response. The editor's answers to daemon-issued
            // requests (workspace/applyEdit) are consumed here; anything
            // else falls through to the peer.
            "" => {
                if client.role == ClientRole::Editor && self.consume_own_response(content).await {
                    return Ok(());
                }
                self.forward_to_peer(client, method, content).await
            }

            "textDocument/didOpen" => self.handle_did_open(client, content).await,
            "textDocument/didChange" => self.handle_did_change(client, content).await,
            "textDocument/didClose" => self.handle_did_close(client, content).await,

            "textDocument/didSave" => {
                debug!(role = %client.role, "document saved");
                self.forward_to_peer(client, method, content).await
            }

            "textDocument/hover"
            | "textDocument/completion"
            | "textDocument/definition"
            | "textDocument/references"
            | "textDocument/documentHighlight"
            | "textDocument/codeAction"
            | "textDocument/signatureHelp" => {
                if client.role == ClientRole::Editor {
                    self.track_cursor_from_request(client, method, content).await;
                }
                self.forward_to_peer(client, method, content).await
            }

            _ => self.forward_to_peer(client, method, content).await,
        }
    }

    async fn consume_own_response(&self, content: &[u8]) -> bool {
        let Ok(envelope) = serde_json::from_slice::<IncomingEnvelope>(content) else {
            return false;
        };
        let Some(id) = envelope.id.and_then(|id| id.as_i64()) else {
            return false;
        };
        if id > 0 && self.state.consume_pending(id).await {
            debug!(id, "consumed response to daemon-issued request");
            return true;
        }
        false
    }

    // ------------------------------------------------------------------
    // Document sync
    // ------------------------------------------------------------------

    async fn handle_did_open(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let params: DidOpenParams =
            serde_json::from_slice(content).context("failed to parse didOpen")?;
        let doc = params.text_document;

        let diagnostics = self
            .state
            .open_document(&doc.uri, &doc.text, &doc.language_id, doc.version)
            .await;

        if client.role == ClientRole::Editor {
            self.state.mark_editor_open(&doc.uri).await;
            debug!(uri = %doc.uri, "editor opened document");
        }

        self.publish_diagnostics(client, &doc.uri, diagnostics).await;
        self.broadcast_document_changed(client, &doc.uri, &doc.text, doc.version)
            .await;
        self.broadcast_focus_changed(client, &doc.uri).await;

        // The editor opens files on its own; a raw didOpen from the agent
        // would make it open buffers it never asked for.
        if client.role == ClientRole::Agent {
            return Ok(());
        }
        self.forward_to_peer(client, "textDocument/didOpen", content).await
    }

    async fn handle_did_change(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let params: DidChangeParams =
            serde_json::from_slice(content).context("failed to parse didChange")?;
        let Some(change) = params.content_changes.first() else {
            return Ok(());
        };
        let uri = params.text_document.uri.clone();
        let version = params.text_document.version;

        let (previous, editor_open, diagnostics) =
            self.state.replace_document(&uri, &change.text, version).await;

        self.publish_diagnostics(client, &uri, diagnostics).await;
        self.broadcast_document_changed(client, &uri, &change.text, version).await;

        if client.role == ClientRole::Agent {
            return self
                .agent_change_to_apply_edit(&uri, &change.text, previous, editor_open)
                .await;
        }
        self.forward_to_peer(client, "textDocument/didChange", content).await
    }

    async fn handle_did_close(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let params: DidCloseParams =
            serde_json::from_slice(content).context("failed to parse didClose")?;

        if client.role == ClientRole::Editor {
            // The cached content stays: it is still the diff baseline for
            // future agent edits to this file.
            self.state.mark_editor_closed(&params.text_document.uri).await;
            return self.forward_to_peer(client, "textDocument/didClose", content).await;
        }

        // Agent didClose is internal bookkeeping on its side; not forwarded.
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edit transformation (agent -> editor)
    // ------------------------------------------------------------------

    /// Converts a full-document change from the agent into the minimal
    /// `workspace/applyEdit` request for the editor.
    async fn agent_change_to_apply_edit(
        &self,
        uri: &str,
        new_text: &str,
        previous: Option<String>,
        editor_open: bool,
    ) -> Result<()> {
        let Some(editor) = self.editor() else {
            warn!(uri, "editor not connected, dropping agent edit");
            return Ok(());
        };

        let baseline = match previous {
            Some(content) => content,
            None => match self.read_disk_baseline(uri).await {
                Some(content) => content,
                None => {
                    warn!(uri, "no baseline for diff, skipping edit");
                    return Ok(());
                }
            },
        };

        let Some(edit) = compute_line_edits(&baseline, new_text) else {
            debug!(uri, "no changes detected");
            return Ok(());
        };

        // If the editor does not have the file open, the agent's save already
        // put the new text on disk. Replacing the changed range with its own
        // new content opens and highlights the file without doubling it.
        let edit = if editor_open {
            edit
        } else {
            debug!(uri, "editor buffer not open, sending no-op highlight edit");
            TextEdit {
                new_text: noop_replacement(new_text, &edit.range),
                range: edit.range,
            }
        };

        let request_id = self.state.allocate_request_id().await;
        let request = JsonRpcRequest::new(
            request_id,
            "workspace/applyEdit",
            serde_json::to_value(ApplyWorkspaceEditParams {
                label: "Crush edit".to_string(),
                edit: WorkspaceEdit {
                    changes: HashMap::from([(uri.to_string(), vec![edit])]),
                },
            })?,
        );

        info!(uri, request_id, editor_open, "forwarding agent edit as workspace/applyEdit");
        editor.transport.write(&request).await
    }

    async fn read_disk_baseline(&self, uri: &str) -> Option<String> {
        let path = uri_to_path(uri)?;
        tokio::fs::read_to_string(path).await.ok()
    }

    // ------------------------------------------------------------------
    // Cursor & selection
    // ------------------------------------------------------------------

    async fn handle_cursor_moved(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let params: CursorMovedParams =
            serde_json::from_slice(content).context("failed to parse cursorMoved")?;
        let uri = params.text_document.uri;

        self.state
            .update_cursor(&uri, params.position, params.selection, "crush/cursorMoved")
            .await;
        self.state.set_focused(&uri).await;
        self.broadcast_cursor_changed(client, &uri, params.position).await;
        Ok(())
    }

    async fn handle_selection_changed(&self, _client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let params: SelectionChangedParams =
            serde_json::from_slice(content).context("failed to parse selectionChanged")?;
        let uri = params.text_document.uri;

        if let Some(selection) = params.selections.first() {
            self.state
                .update_cursor(&uri, selection.start, Some(*selection), "crush/selectionChanged")
                .await;
        }
        self.state.set_selection_text(&uri, &params.text).await;

        debug!(uri, chars = params.text.len(), "selection updated");
        Ok(())
    }

    async fn track_cursor_from_request(&self, client: &Arc<Client>, method: &str, content: &[u8]) {
        let Ok(params) = serde_json::from_slice::<PositionParams>(content) else {
            return;
        };
        let uri = params.text_document.uri;
        if uri.is_empty() {
            return;
        }
        // codeAction carries a range; the rest carry a position.
        let Some(position) = params.position.or_else(|| params.range.map(|r| r.start)) else {
            return;
        };

        self.state.update_cursor(&uri, position, None, method).await;
        debug!(uri, line = position.line, character = position.character, from = method, "cursor updated");
        self.broadcast_cursor_changed(client, &uri, position).await;
    }

    // ------------------------------------------------------------------
    // Tool queries
    // ------------------------------------------------------------------

    async fn respond_editor_context(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let envelope: IncomingEnvelope =
            serde_json::from_slice(content).context("failed to parse getEditorContext")?;

        let context = self.state.editor_context().await;
        let response = JsonRpcResponse::result(
            envelope.id.unwrap_or(Value::Null),
            serde_json::to_value(context)?,
        );
        client.transport.write(&response).await
    }

    async fn respond_get_state(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let envelope: IncomingEnvelope =
            serde_json::from_slice(content).context("failed to parse getState")?;
        let params: GetStateParams = envelope
            .params
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();

        let mut result = GetStateResult::default();

        if let Some(uri) = self.state.focused_uri().await {
            result.focused_document = Some(TextDocumentIdentifier { uri });
        }

        if params.include_cursor {
            if let Some(cursor) = self.state.cursor().await {
                result.cursor = Some(CursorInfo {
                    text_document: TextDocumentIdentifier { uri: cursor.uri },
                    position: cursor.position,
                    selection: cursor.selection,
                });
            }
        }

        for (uri, doc) in self.state.open_documents().await {
            let diagnostics = if params.include_diagnostics {
                self.state.diagnostics(&uri).await
            } else {
                Vec::new()
            };
            result.open_documents.push(DocumentInfo {
                text_document: TextDocumentIdentifier { uri },
                language_id: doc.language_id,
                version: doc.version,
                content: params.include_content.then_some(doc.content),
                diagnostics,
            });
        }

        let response = JsonRpcResponse::result(
            envelope.id.unwrap_or(Value::Null),
            serde_json::to_value(result)?,
        );
        client.transport.write(&response).await
    }

    async fn respond_subscribe(&self, client: &Arc<Client>, content: &[u8]) -> Result<()> {
        let envelope: IncomingEnvelope =
            serde_json::from_slice(content).context("failed to parse subscribe")?;
        let params: SubscribeParams = envelope
            .params
            .map(serde_json::from_value)
            .transpose()
            .unwrap_or_default()
            .unwrap_or_default();

        *client.subscriptions.write().expect("subscriptions lock poisoned") = Subscriptions {
            document_changes: params.document_changes,
            cursor_changes: params.cursor_changes,
            focus_changes: params.focus_changes,
            diagnostics: params.diagnostics,
        };

        let response = JsonRpcResponse::result(
            envelope.id.unwrap_or(Value::Null),
            json!({"subscribed": true}),
        );
        client.transport.write(&response).await
    }

    // ------------------------------------------------------------------
    // Forwarding & broadcast
    // ------------------------------------------------------------------

    async fn forward_to_peer(&self, from: &Arc<Client>, method: &str, content: &[u8]) -> Result<()> {
        let Some(peer_role) = from.role.peer() else {
            return Ok(());
        };
        let Some(peer) = self.find_role(&peer_role) else {
            debug!(%peer_role, method, "peer not connected, dropping message");
            return Ok(());
        };
        peer.transport.write_content(content).await
    }

    async fn forward_to_editor(&self, method: &str, content: &[u8]) -> Result<()> {
        let Some(editor) = self.editor() else {
            warn!(method, "editor not connected, dropping message");
            return Ok(());
        };
        editor.transport.write_content(content).await
    }

    async fn publish_diagnostics(&self, client: &Arc<Client>, uri: &str, diagnostics: Vec<Diagnostic>) {
        let notification = JsonRpcNotification::new(
            "textDocument/publishDiagnostics",
            json!(PublishDiagnosticsParams {
                uri: uri.to_string(),
                diagnostics,
            }),
        );
        if let Err(err) = client.transport.write(&notification).await {
            warn!(uri, %err, "failed to publish diagnostics");
        }
    }

    async fn broadcast_document_changed(
        &self,
        from: &Arc<Client>,
        uri: &str,
        content: &str,
        version: i32,
    ) {
        let notification = JsonRpcNotification::new(
            "crush/documentChanged",
            json!(DocumentChangedParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.to_string(),
                    version,
                },
                content: content.to_string(),
                change_source: from.role.as_str().to_string(),
            }),
        );
        self.broadcast(from.id, &notification, |subs| subs.document_changes).await;
    }

    async fn broadcast_cursor_changed(&self, from: &Arc<Client>, uri: &str, position: Position) {
        let notification = JsonRpcNotification::new(
            "crush/cursorMoved",
            json!(CursorChangedParams {
                text_document: TextDocumentIdentifier { uri: uri.to_string() },
                position,
            }),
        );
        self.broadcast(from.id, &notification, |subs| subs.cursor_changes).await;
    }

    async fn broadcast_focus_changed(&self, from: &Arc<Client>, uri: &str) {
        let notification = JsonRpcNotification::new(
            "crush/focusChanged",
            json!(FocusChangedParams {
                text_document: TextDocumentIdentifier { uri: uri.to_string() },
                source: from.role.as_str().to_string(),
            }),
        );
        self.broadcast(from.id, &notification, |subs| subs.focus_changes).await;
    }

    /// Fan-out to subscribed clients, never echoing to the sender. The target
    /// list is snapshotted first so no table lock is held while a slow peer
    /// blocks a write.
    async fn broadcast(
        &self,
        sender: ClientId,
        notification: &JsonRpcNotification,
        wants: impl Fn(&Subscriptions) -> bool,
    ) {
        let targets: Vec<Arc<Client>> = self
            .clients
            .iter()
            .filter(|entry| entry.value().id != sender && wants(&entry.value().subscriptions()))
            .map(|entry| entry.value().clone())
            .collect();

        for target in targets {
            if let Err(err) = target.transport.write(notification).await {
                warn!(id = %target.id, %err, "failed to broadcast notification");
            }
        }
    }
}
