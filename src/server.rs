//! MCP server: tool definitions using rmcp macros.
//!
//! Defines `BridgeServer` with the agent-facing tools:
//! - terminal lifecycle: `open_terminal`, `close_terminal`, `get_terminal_status`
//! - commands: `execute_command`, `check_command_status`, `get_command_output`,
//!   `cancel_command`, `list_commands`

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::schemars;
use rmcp::tool;
use rmcp::tool_handler;
use rmcp::tool_router;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::Serialize;

use crate::error::BridgeError;
use crate::filter::OutputMode;
use crate::link::RemoteHost;
use crate::orchestrator::Orchestrator;
use crate::registry::CommandStatus;

// ---------------------------------------------------------------------------
// Parameter structs (deserialized from MCP tool call arguments)
// ---------------------------------------------------------------------------

/// Parameters for the `open_terminal` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct OpenTerminalParams {
    /// Remote host name or address.
    pub host: String,
    /// User to log in as.
    pub user: String,
    /// SSH port. Defaults to 22.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Password for password authentication. When omitted, public-key
    /// authentication is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key file. Defaults to ~/.ssh/id_ed25519 or
    /// ~/.ssh/id_rsa.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
}

/// Parameters for the `execute_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExecuteCommandParams {
    /// The shell command to run in the remote terminal.
    pub command: String,
    /// Maximum execution time in seconds. Defaults to 300, capped at 3600.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// How to render the output: auto (default), raw, full, preview,
    /// summary, or minimal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mode: Option<OutputMode>,
    /// Optional conversation id recorded on the command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Parameters for the `check_command_status` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CheckCommandStatusParams {
    /// Id of the command to check.
    pub command_id: String,
    /// Output mode for the payload once the command is finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_mode: Option<OutputMode>,
}

/// Parameters for the `get_command_output` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct GetCommandOutputParams {
    /// Id of the command to retrieve output from.
    pub command_id: String,
    /// Return the buffer as retained, control sequences and all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    /// Start line (0-indexed, inclusive). Defaults to 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    /// End line (0-indexed, exclusive). Defaults to all remaining lines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
}

/// Parameters for the `cancel_command` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CancelCommandParams {
    /// Id of the command to cancel.
    pub command_id: String,
}

/// Parameters for the `list_commands` tool.
#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ListCommandsParams {
    /// Only list commands in this status (pending, running, completed,
    /// cancelled, timeout, interrupted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_filter: Option<String>,
    /// Maximum number of entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

// ---------------------------------------------------------------------------
// Result helpers
// ---------------------------------------------------------------------------

/// Raw-buffer result of `get_command_output`.
#[derive(Debug, Clone, Serialize)]
struct RawOutputResult {
    command_id: String,
    output: String,
}

fn json_content<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("JSON serialization error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(json)]))
}

fn err_result(msg: impl Into<String>) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg.into())]))
}

/// Recoverable failures come back as a structured `{kind, message}` body.
fn bridge_err(err: &BridgeError) -> Result<CallToolResult, McpError> {
    let payload = err.to_payload();
    let json = serde_json::to_string_pretty(&payload)
        .unwrap_or_else(|_| format!("{{\"kind\":\"{}\"}}", payload.kind));
    Ok(CallToolResult::error(vec![Content::text(json)]))
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// The termbridge MCP server.
///
/// Thin tool layer over the [`Orchestrator`]; no shell state lives here.
#[derive(Clone)]
pub struct BridgeServer {
    orchestrator: Orchestrator,
    tool_router: ToolRouter<BridgeServer>,
}

impl BridgeServer {
    #[must_use]
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl BridgeServer {
    #[tool(
        description = "Open the remote terminal session over SSH. Only one session exists at a time; every attached browser viewer shares it. Uses password auth when a password is given, public-key auth otherwise. Must be called before execute_command."
    )]
    async fn open_terminal(
        &self,
        Parameters(params): Parameters<OpenTerminalParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(host = %params.host, user = %params.user, "open_terminal");
        let remote = RemoteHost {
            host: params.host,
            port: params.port.unwrap_or(22),
            user: params.user,
            password: params.password,
            private_key_path: params.private_key_path,
        };
        match self.orchestrator.connect(remote).await {
            Ok(status) => json_content(&status),
            Err(e) => bridge_err(&e),
        }
    }

    #[tool(
        description = "Close the remote terminal session. Running commands become interrupted and viewers are disconnected."
    )]
    async fn close_terminal(&self) -> Result<CallToolResult, McpError> {
        tracing::info!("close_terminal");
        self.orchestrator.disconnect().await;
        json_content(&serde_json::json!({"connected": false}))
    }

    #[tool(description = "Report whether a terminal session is connected, and to where.")]
    async fn get_terminal_status(&self) -> Result<CallToolResult, McpError> {
        let status = self.orchestrator.terminal_status().await;
        json_content(&status)
    }

    #[tool(
        description = "Run a shell command in the remote terminal and wait up to timeout_seconds for it to finish. If it finishes in time you get the filtered output (auto mode by default: full output for small or failing commands, a class-aware summary or preview for voluminous ones). If the wait elapses the command keeps running in the background and the result carries status=running; poll it with check_command_status using the returned command_id. Only one command runs at a time; a second call while one is in flight returns a busy error naming the in-flight id."
    )]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        let mode = params.output_mode.unwrap_or_default();
        tracing::info!(command = %params.command, "execute_command");
        match self
            .orchestrator
            .execute(
                &params.command,
                params.timeout_seconds,
                mode,
                params.conversation_id,
            )
            .await
        {
            Ok(outcome) => {
                tracing::info!(
                    id = %outcome.command_id,
                    status = ?outcome.status,
                    bytes = outcome.buffer_info.total_bytes,
                    "execute_command finished"
                );
                json_content(&outcome)
            }
            Err(e) => bridge_err(&e),
        }
    }

    #[tool(
        description = "Check a command's status without blocking. Finished commands include the filtered output in the requested output_mode (default auto)."
    )]
    async fn check_command_status(
        &self,
        Parameters(params): Parameters<CheckCommandStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let mode = params.output_mode.unwrap_or_default();
        match self.orchestrator.status(&params.command_id, mode).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => bridge_err(&e),
        }
    }

    #[tool(
        description = "Retrieve a command's stored output. With raw=true, returns the buffer exactly as retained (terminal control sequences included, middle possibly elided for very large outputs). Otherwise returns cleaned lines; use start_line/end_line to page through large outputs, up to 500 lines per call."
    )]
    async fn get_command_output(
        &self,
        Parameters(params): Parameters<GetCommandOutputParams>,
    ) -> Result<CallToolResult, McpError> {
        if params.raw.unwrap_or(false) {
            return match self.orchestrator.fetch_raw(&params.command_id).await {
                Ok(raw) => json_content(&RawOutputResult {
                    command_id: params.command_id,
                    output: String::from_utf8_lossy(&raw).into_owned(),
                }),
                Err(e) => bridge_err(&e),
            };
        }
        match self
            .orchestrator
            .output_slice(&params.command_id, params.start_line, params.end_line)
            .await
        {
            Ok(slice) => json_content(&slice),
            Err(e) => bridge_err(&e),
        }
    }

    #[tool(
        description = "Cancel the in-flight command by id: sends an interrupt to the remote shell and the command settles as cancelled at the next prompt. Returns not_running for finished commands or ids that aren't in flight."
    )]
    async fn cancel_command(
        &self,
        Parameters(params): Parameters<CancelCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(id = %params.command_id, "cancel_command");
        match self.orchestrator.cancel(&params.command_id).await {
            Ok(outcome) => json_content(&outcome),
            Err(e) => bridge_err(&e),
        }
    }

    #[tool(
        description = "List tracked commands, most recent first, with id, command text, status, and timestamp. Optionally filter by status."
    )]
    async fn list_commands(
        &self,
        Parameters(params): Parameters<ListCommandsParams>,
    ) -> Result<CallToolResult, McpError> {
        let status = match params.status_filter.as_deref() {
            Some(raw) => match CommandStatus::parse(raw) {
                Some(s) => Some(s),
                None => return err_result(format!("unknown status filter: {raw}")),
            },
            None => None,
        };
        let commands = self.orchestrator.list(status, params.limit).await;
        json_content(&commands)
    }
}

#[tool_handler]
impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "termbridge".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: Some(
                "termbridge drives one interactive shell on a remote machine while \
                 streaming the raw terminal to browser viewers.\n\n\
                 LIFECYCLE: call open_terminal(host, user, ...) once; all commands run \
                 in that single shell, so working directory and environment persist. \
                 close_terminal ends the session.\n\n\
                 COMMANDS: execute_command runs a command and waits up to \
                 timeout_seconds. Large outputs are filtered for you: auto mode \
                 returns everything for small or failing commands and a summary or \
                 head/tail preview otherwise. If the wait elapses, the command keeps \
                 running -- poll check_command_status with the returned command_id, or \
                 cancel_command to interrupt it. get_command_output retrieves stored \
                 output later, including specific line ranges.\n\n\
                 VIEWERS: humans watching over WebSocket always see the unfiltered \
                 byte stream; their keystrokes type into the same shell."
                    .to_string(),
            ),
        }
    }
}
