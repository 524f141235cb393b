//! Shared per-session state.
//!
//! Everything the router tracks for one workspace sits behind a single
//! reader/writer lock: the document cache, the set of editor-open URIs, the
//! cursor/selection, and the ids of requests the daemon itself has issued
//! toward the editor. Read-heavy paths take shared access; mutations take
//! exclusive access. Callers copy what they need out of the lock before
//! serializing or writing to a peer.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::diagnostics::diagnostics_for_text;
use crate::protocol::{Diagnostic, EditorContext, Position, Range};

/// Lines of surrounding code included on each side of the cursor in an
/// editor-context snapshot.
const CONTEXT_LINES: usize = 5;

#[derive(Debug, Clone)]
pub struct Document {
    pub content: String,
    pub version: i32,
    pub language_id: String,
}

#[derive(Debug, Clone)]
pub struct CursorState {
    pub uri: String,
    pub position: Position,
    pub selection: Option<Range>,
    /// Method that reported the position, e.g. `crush/cursorMoved` or
    /// `textDocument/hover`.
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct StateInner {
    documents: HashMap<String, Document>,
    neovim_open_docs: HashSet<String>,
    diagnostics: HashMap<String, Vec<Diagnostic>>,
    cursor: Option<CursorState>,
    selection_text: String,
    focused_uri: Option<String>,
    pending_requests: HashSet<i64>,
    next_request_id: i64,
    version: u64,
}

#[derive(Default)]
pub struct SessionState {
    inner: RwLock<StateInner>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caches an opened document, marks it focused, and returns fresh
    /// diagnostics for it.
    pub async fn open_document(
        &self,
        uri: &str,
        text: &str,
        language_id: &str,
        version: i32,
    ) -> Vec<Diagnostic> {
        let mut inner = self.inner.write().await;
        inner.documents.insert(
            uri.to_string(),
            Document {
                content: text.to_string(),
                version,
                language_id: language_id.to_string(),
            },
        );
        inner.focused_uri = Some(uri.to_string());
        inner.version += 1;

        let diags = diagnostics_for_text(text);
        inner.diagnostics.insert(uri.to_string(), diags.clone());
        diags
    }

    /// Replaces a document's content, returning the previous content (the
    /// diff baseline), whether the editor has the file open, and fresh
    /// diagnostics. The three reads and the write happen under one lock so
    /// the baseline always matches the state the agent's change applies to.
    pub async fn replace_document(
        &self,
        uri: &str,
        text: &str,
        version: i32,
    ) -> (Option<String>, bool, Vec<Diagnostic>) {
        let mut inner = self.inner.write().await;

        let previous = match inner.documents.get_mut(uri) {
            Some(doc) => {
                let old = std::mem::replace(&mut doc.content, text.to_string());
                doc.version = version;
                Some(old)
            }
            None => {
                inner.documents.insert(
                    uri.to_string(),
                    Document {
                        content: text.to_string(),
                        version,
                        language_id: String::new(),
                    },
                );
                None
            }
        };
        inner.version += 1;

        let editor_open = inner.neovim_open_docs.contains(uri);
        let diags = diagnostics_for_text(text);
        inner.diagnostics.insert(uri.to_string(), diags.clone());

        (previous, editor_open, diags)
    }

    pub async fn close_document(&self, uri: &str) {
        let mut inner = self.inner.write().await;
        inner.documents.remove(uri);
        inner.diagnostics.remove(uri);
        inner.version += 1;
    }

    pub async fn document_content(&self, uri: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.documents.get(uri).map(|doc| doc.content.clone())
    }

    pub async fn document_version(&self, uri: &str) -> Option<i32> {
        let inner = self.inner.read().await;
        inner.documents.get(uri).map(|doc| doc.version)
    }

    // ------------------------------------------------------------------
    // Editor-open tracking
    // ------------------------------------------------------------------

    pub async fn mark_editor_open(&self, uri: &str) {
        let mut inner = self.inner.write().await;
        inner.neovim_open_docs.insert(uri.to_string());
        inner.version += 1;
    }

    pub async fn mark_editor_closed(&self, uri: &str) {
        let mut inner = self.inner.write().await;
        inner.neovim_open_docs.remove(uri);
        inner.version += 1;
    }

    pub async fn editor_has_open(&self, uri: &str) -> bool {
        self.inner.read().await.neovim_open_docs.contains(uri)
    }

    // ------------------------------------------------------------------
    // Cursor, selection, focus
    // ------------------------------------------------------------------

    pub async fn update_cursor(
        &self,
        uri: &str,
        position: Position,
        selection: Option<Range>,
        source: &str,
    ) {
        let mut inner = self.inner.write().await;
        inner.cursor = Some(CursorState {
            uri: uri.to_string(),
            position,
            selection,
            source: source.to_string(),
            timestamp: Utc::now(),
        });
        inner.version += 1;
    }

    pub async fn set_selection_text(&self, uri: &str, text: &str) {
        let mut inner = self.inner.write().await;
        inner.selection_text = text.to_string();
        if !uri.is_empty() {
            if let Some(cursor) = inner.cursor.as_mut() {
                cursor.uri = uri.to_string();
            }
            inner.focused_uri = Some(uri.to_string());
        }
        inner.version += 1;
    }

    pub async fn set_focused(&self, uri: &str) {
        let mut inner = self.inner.write().await;
        inner.focused_uri = Some(uri.to_string());
        inner.version += 1;
    }

    pub async fn cursor(&self) -> Option<CursorState> {
        self.inner.read().await.cursor.clone()
    }

    pub async fn focused_uri(&self) -> Option<String> {
        self.inner.read().await.focused_uri.clone()
    }

    pub async fn diagnostics(&self, uri: &str) -> Vec<Diagnostic> {
        self.inner
            .read()
            .await
            .diagnostics
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn open_documents(&self) -> Vec<(String, Document)> {
        let inner = self.inner.read().await;
        inner
            .documents
            .iter()
            .map(|(uri, doc)| (uri.clone(), doc.clone()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Outgoing request bookkeeping
    // ------------------------------------------------------------------

    /// Mints a request id for a daemon-issued request toward the editor and
    /// marks it pending so the editor's response can be recognized.
    pub async fn allocate_request_id(&self) -> i64 {
        let mut inner = self.inner.write().await;
        inner.next_request_id += 1;
        let id = inner.next_request_id;
        inner.pending_requests.insert(id);
        id
    }

    /// Consumes a pending request id. Returns true exactly once per id.
    pub async fn consume_pending(&self, id: i64) -> bool {
        self.inner.write().await.pending_requests.remove(&id)
    }

    pub async fn version(&self) -> u64 {
        self.inner.read().await.version
    }

    // ------------------------------------------------------------------
    // Editor context snapshot
    // ------------------------------------------------------------------

    /// Builds the `crush/getEditorContext` payload. Every value is copied
    /// under one shared-lock acquisition; serialization happens afterwards.
    pub async fn editor_context(&self) -> EditorContext {
        let inner = self.inner.read().await;

        let (uri, line, column) = match inner.cursor.as_ref() {
            Some(cursor) => (cursor.uri.clone(), cursor.position.line, cursor.position.character),
            None => (String::new(), 0, 0),
        };

        let has_selection = !inner.selection_text.is_empty();
        let mut context = EditorContext {
            filename: extract_filename(&uri),
            uri,
            cursor_line: line,
            cursor_column: column,
            has_selection,
            selection: has_selection.then(|| inner.selection_text.clone()),
            ..Default::default()
        };

        if let Some(doc) = inner.documents.get(&context.uri) {
            let lines: Vec<&str> = doc.content.split('\n').collect();
            context.total_lines = lines.len() as u32;

            let line = line as usize;
            let before_end = line.min(lines.len());
            let before_start = line.saturating_sub(CONTEXT_LINES).min(before_end);
            let after_end = (line + 1 + CONTEXT_LINES).min(lines.len());

            context.context_before = lines[before_start..before_end].join("\n");
            context.context_line = lines.get(line).copied().unwrap_or_default().to_string();
            if line + 1 < after_end {
                context.context_after = lines[line + 1..after_end].join("\n");
            }
        }

        context
    }
}

/// Basename of a `file://` URI's path.
pub fn extract_filename(uri: &str) -> String {
    let path = uri.strip_prefix("file://").unwrap_or(uri);
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn document_cache_tracks_last_notification() {
        let state = SessionState::new();

        state.open_document("file:///a.txt", "one\n", "text", 1).await;
        state.replace_document("file:///a.txt", "two\n", 2).await;
        state.replace_document("file:///a.txt", "three\n", 3).await;

        assert_eq!(state.document_content("file:///a.txt").await.unwrap(), "three\n");
        assert_eq!(state.document_version("file:///a.txt").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn replace_returns_previous_content_as_baseline() {
        let state = SessionState::new();
        state.open_document("file:///a.txt", "old\n", "text", 1).await;
        state.mark_editor_open("file:///a.txt").await;

        let (previous, editor_open, _) = state.replace_document("file:///a.txt", "new\n", 2).await;
        assert_eq!(previous.as_deref(), Some("old\n"));
        assert!(editor_open);

        let (previous, editor_open, _) = state.replace_document("file:///b.txt", "x\n", 1).await;
        assert!(previous.is_none());
        assert!(!editor_open);
    }

    #[tokio::test]
    async fn pending_request_ids_are_consumed_exactly_once() {
        let state = SessionState::new();

        let first = state.allocate_request_id().await;
        let second = state.allocate_request_id().await;
        assert!(second > first);

        assert!(state.consume_pending(first).await);
        assert!(!state.consume_pending(first).await);
        assert!(state.consume_pending(second).await);
    }

    #[tokio::test]
    async fn version_counter_moves_on_every_mutation() {
        let state = SessionState::new();
        let start = state.version().await;

        state.open_document("file:///a.txt", "", "text", 1).await;
        state.update_cursor("file:///a.txt", Position::default(), None, "textDocument/hover").await;
        state.close_document("file:///a.txt").await;

        assert!(state.version().await >= start + 3);
    }

    #[tokio::test]
    async fn cursor_column_beyond_line_length_is_stored_verbatim() {
        let state = SessionState::new();
        state.open_document("file:///a.txt", "ab\n", "text", 1).await;
        state
            .update_cursor(
                "file:///a.txt",
                Position { line: 0, character: 500 },
                None,
                "crush/cursorMoved",
            )
            .await;

        let context = state.editor_context().await;
        assert_eq!(context.cursor_column, 500);
        assert_eq!(context.context_line, "ab");
    }

    #[tokio::test]
    async fn editor_context_windows_five_lines_each_side() {
        let state = SessionState::new();
        state
            .open_document("file:///ws/code.txt", "L0\nL1\nL2\nL3\nL4\nL5\nL6\n", "text", 1)
            .await;
        state
            .update_cursor(
                "file:///ws/code.txt",
                Position { line: 3, character: 0 },
                None,
                "crush/cursorMoved",
            )
            .await;

        let context = state.editor_context().await;
        assert_eq!(context.filename, "code.txt");
        assert_eq!(context.total_lines, 8);
        assert_eq!(context.context_before, "L0\nL1\nL2");
        assert_eq!(context.context_line, "L3");
        assert_eq!(context.context_after, "L4\nL5\nL6");
    }

    #[tokio::test]
    async fn editor_context_without_cached_document_is_empty() {
        let state = SessionState::new();
        state
            .update_cursor(
                "file:///gone.txt",
                Position { line: 2, character: 1 },
                None,
                "crush/cursorMoved",
            )
            .await;

        let context = state.editor_context().await;
        assert_eq!(context.total_lines, 0);
        assert_eq!(context.context_before, "");
        assert_eq!(context.context_line, "");
        assert_eq!(context.context_after, "");
    }

    #[tokio::test]
    async fn selection_text_feeds_has_selection() {
        let state = SessionState::new();
        state.set_selection_text("file:///a.txt", "let x = 1;").await;

        let context = state.editor_context().await;
        assert!(context.has_selection);
        assert_eq!(context.selection.as_deref(), Some("let x = 1;"));

        state.set_selection_text("file:///a.txt", "").await;
        let context = state.editor_context().await;
        assert!(!context.has_selection);
        assert!(context.selection.is_none());
    }

    #[test]
    fn filename_extraction_handles_uris_and_bare_paths() {
        assert_eq!(extract_filename("file:///home/user/a.txt"), "a.txt");
        assert_eq!(extract_filename("file:///a.txt"), "a.txt");
        assert_eq!(extract_filename(""), "");
    }
}
