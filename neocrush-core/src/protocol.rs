//! JSON-RPC envelopes and the typed message bodies the daemon handles.
//!
//! Dispatch reads only the envelope; every handler deserializes its own
//! params struct. The `crush/*` family extends standard LSP with cursor,
//! selection, subscription, and editor-context messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// JSON-RPC envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

impl JsonRpcResponse {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// Envelope fields shared by requests and responses, used when only the id
/// or client identity matters.
#[derive(Debug, Deserialize)]
pub struct IncomingEnvelope {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

// ============================================================================
// Base LSP structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDocumentIdentifier {
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionedTextDocumentIdentifier {
    pub uri: String,
    #[serde(default)]
    pub version: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDocumentItem {
    pub uri: String,
    #[serde(rename = "languageId", default)]
    pub language_id: String,
    #[serde(default)]
    pub version: i32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEdit {
    pub range: Range,
    #[serde(rename = "newText")]
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub range: Range,
    pub severity: i32,
    pub source: String,
    pub message: String,
}

// ============================================================================
// Standard LSP params
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "clientInfo", default)]
    pub client_info: Option<ClientInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidOpenParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentItem,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidChangeParams {
    #[serde(rename = "textDocument")]
    pub text_document: VersionedTextDocumentIdentifier,
    #[serde(rename = "contentChanges", default)]
    pub content_changes: Vec<ContentChange>,
}

/// The agent sends full-document replacements, so only `text` matters.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentChange {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DidCloseParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
}

/// Params shape shared by the position-carrying language feature requests
/// (hover, completion, definition, references, documentHighlight,
/// signatureHelp). `codeAction` carries a range instead.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default)]
    pub range: Option<Range>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyWorkspaceEditParams {
    pub label: String,
    pub edit: WorkspaceEdit,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceEdit {
    pub changes: std::collections::HashMap<String, Vec<TextEdit>>,
}

// ============================================================================
// crush/* extensions
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct CursorMovedParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
    #[serde(default)]
    pub selection: Option<Range>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionChangedParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    #[serde(default)]
    pub selections: Vec<Range>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeParams {
    pub document_changes: bool,
    pub cursor_changes: bool,
    pub focus_changes: bool,
    pub diagnostics: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GetStateParams {
    pub include_content: bool,
    pub include_diagnostics: bool,
    pub include_cursor: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GetStateResult {
    #[serde(rename = "focusedDocument", skip_serializing_if = "Option::is_none")]
    pub focused_document: Option<TextDocumentIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorInfo>,
    #[serde(rename = "openDocuments", skip_serializing_if = "Vec::is_empty")]
    pub open_documents: Vec<DocumentInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorInfo {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<Range>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    #[serde(rename = "languageId", skip_serializing_if = "String::is_empty")]
    pub language_id: String,
    pub version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentChangedParams {
    #[serde(rename = "textDocument")]
    pub text_document: VersionedTextDocumentIdentifier,
    pub content: String,
    #[serde(rename = "changeSource")]
    pub change_source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorChangedParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    pub position: Position,
}

#[derive(Debug, Clone, Serialize)]
pub struct FocusChangedParams {
    #[serde(rename = "textDocument")]
    pub text_document: TextDocumentIdentifier,
    pub source: String,
}

/// Response body of `crush/getEditorContext`, consumed verbatim by the MCP
/// `editor_context` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditorContext {
    pub uri: String,
    pub filename: String,
    pub cursor_line: u32,
    pub cursor_column: u32,
    pub has_selection: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<String>,
    pub total_lines: u32,
    pub context_before: String,
    pub context_line: String,
    pub context_after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShowLocationsParams {
    pub title: String,
    #[serde(default)]
    pub items: Vec<LocationItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationItem {
    pub filename: String,
    /// 1-indexed line number, matching the editor picker's convention.
    #[serde(rename = "lnum")]
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,
    pub text: String,
    pub note: String,
    /// E/W/I/N severity tag; defaults to N in the editor.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}
