//! MCP face of the client process.
//!
//! When a tool client (an AI assistant) is on the other side of stdin, the
//! client process serves MCP instead of bridging LSP. The tools are thin:
//! each one is a framed request over the daemon socket with 5 second
//! deadlines in both directions, so an unresponsive daemon surfaces as a
//! tool error rather than a hang.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::{Json, Parameters};
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::{schemars, tool, tool_handler, tool_router, ErrorData, ServerHandler, ServiceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LocationItem, ShowLocationsParams};
use crate::transport::Transport;

const TOOL_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of the `editor_context` tool, exactly the daemon's
/// `crush/getEditorContext` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize, schemars::JsonSchema)]
pub struct EditorContextOutput {
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

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ShowLocationsInput {
    #[schemars(description = "Title shown above the location list")]
    pub title: String,
    pub items: Vec<LocationInput>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LocationInput {
    #[schemars(description = "Absolute or workspace-relative file path")]
    pub filename: String,
    #[schemars(description = "1-indexed line number")]
    pub line: u32,
    #[schemars(description = "1-indexed column (optional)")]
    pub col: Option<u32>,
    #[schemars(description = "The code snippet at this location")]
    pub text: String,
    #[schemars(description = "Why this location matters")]
    pub note: String,
    #[schemars(description = "Severity tag: E, W, I, or N (default)")]
    pub kind: Option<String>,
}

#[derive(Clone)]
pub struct EditorTools {
    daemon: Arc<Transport>,
    next_id: Arc<AtomicI64>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl EditorTools {
    pub fn new(daemon: Arc<Transport>) -> Self {
        Self {
            daemon,
            next_id: Arc::new(AtomicI64::new(1)),
            tool_router: Self::tool_router(),
        }
    }

    /// Get the current editor context including cursor position, surrounding
    /// code, and the active file.
    #[tool(name = "editor_context")]
    async fn editor_context(&self) -> Result<Json<EditorContextOutput>, ErrorData> {
        self.request_editor_context()
            .await
            .map(Json)
            .map_err(|err| ErrorData::internal_error(err.to_string(), None))
    }

    /// Display code locations with explanatory notes in the editor's picker.
    #[tool(name = "show_locations")]
    async fn show_locations(
        &self,
        params: Parameters<ShowLocationsInput>,
    ) -> Result<CallToolResult, ErrorData> {
        let input = params.0;
        let count = input.items.len();

        self.send_show_locations(input)
            .await
            .map_err(|err| ErrorData::internal_error(err.to_string(), None))?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "sent {count} locations to the editor"
        ))]))
    }

    pub async fn request_editor_context(&self) -> Result<EditorContextOutput> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, "crush/getEditorContext", json!({}));

        timeout(TOOL_QUERY_TIMEOUT, self.daemon.write(&request))
            .await
            .context("timed out writing to daemon")??;

        // Subscribed notifications may be interleaved; skip until our id.
        loop {
            let frame = timeout(TOOL_QUERY_TIMEOUT, self.daemon.read())
                .await
                .context("daemon did not answer within the deadline")??;
            let Some((method, content)) = frame else {
                bail!("daemon closed the connection");
            };
            if !method.is_empty() {
                debug!(method, "skipping notification while waiting for response");
                continue;
            }

            let response: JsonRpcResponse =
                serde_json::from_slice(&content).context("failed to parse daemon response")?;
            if response.id != json!(id) {
                continue;
            }

            if let Some(error) = response.error {
                bail!("daemon error: {}", error.message);
            }
            let result = response.result.ok_or_else(|| anyhow!("daemon response had no result"))?;
            return Ok(serde_json::from_value(result)?);
        }
    }

    async fn send_show_locations(&self, input: ShowLocationsInput) -> Result<()> {
        let params = ShowLocationsParams {
            title: input.title,
            items: input
                .items
                .into_iter()
                .map(|item| LocationItem {
                    filename: item.filename,
                    line: item.line,
                    col: item.col,
                    text: item.text,
                    note: item.note,
                    kind: item.kind,
                })
                .collect(),
        };

        let notification = JsonRpcNotification::new("crush/showLocations", json!(params));
        timeout(TOOL_QUERY_TIMEOUT, self.daemon.write(&notification))
            .await
            .context("timed out writing to daemon")??;
        Ok(())
    }
}

#[tool_handler]
impl ServerHandler for EditorTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Provides editor context from Neovim via the neocrush daemon. \
                 Use editor_context to read the cursor position and surrounding \
                 code, and show_locations to point the user at annotated \
                 locations in their editor."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "neocrush".into(),
                version: crate::version().into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Serves MCP over stdio, backed by the daemon connection. `prefix` holds
/// bytes already consumed from stdin during protocol detection.
pub async fn serve_stdio(
    stream: UnixStream,
    prefix: Vec<u8>,
    stdin: tokio::io::Stdin,
) -> Result<()> {
    let daemon = Arc::new(Transport::socket(stream));
    let tools = EditorTools::new(daemon);

    let reader = std::io::Cursor::new(prefix).chain(stdin);
    let service = tools
        .serve((reader, tokio::io::stdout()))
        .await
        .context("failed to start MCP server")?;
    service.waiting().await.context("MCP server exited with an error")?;
    Ok(())
}
