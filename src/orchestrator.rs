//! The command orchestrator: the agent-facing surface of the broker.
//!
//! Owns the single-session slot and composes the registry, session, filter
//! and viewer set into the public operations: connect/disconnect, execute
//! with a bounded synchronous wait, status, raw retrieval, cancel, and
//! listing. Handlers never touch shell internals; everything goes through
//! the session's own API.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::bus::ViewerSet;
use crate::config::Config;
use crate::error::BridgeError;
use crate::filter::{self, FilterInput, FilteredOutput, OutputMode};
use crate::link::RemoteHost;
use crate::registry::{CommandRecord, CommandRegistry, CommandStatus, CommandSummary};
use crate::session::ShellSession;

/// Lines returned per `get_command_output` call, at most.
const MAX_SLICE_LINES: usize = 500;

/// Result of `execute`: terminal with a filtered payload, or still running
/// with just the handle.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteOutcome {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<FilteredOutput>,
    pub buffer_info: BufferInfo,
}

/// Where the buffer stands, independent of any filtering.
#[derive(Debug, Clone, Serialize)]
pub struct BufferInfo {
    pub total_bytes: u64,
    pub line_hint: usize,
    pub truncated: bool,
}

impl From<&CommandRecord> for BufferInfo {
    fn from(rec: &CommandRecord) -> Self {
        Self {
            total_bytes: rec.total_bytes,
            line_hint: rec.line_hint,
            truncated: rec.truncated,
        }
    }
}

/// Result of `status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusOutcome {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<FilteredOutput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    pub buffer_info: BufferInfo,
}

/// Result of `cancel`.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub command_id: String,
    /// `ok` when the interrupt was delivered to the in-flight command;
    /// `not_running` otherwise.
    pub result: &'static str,
}

/// A line-range slice of a command's cleaned output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSlice {
    pub command_id: String,
    pub start_line: usize,
    pub end_line: usize,
    pub total_lines: usize,
    pub lines: Vec<String>,
}

/// Connection state of the single terminal slot.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Composes the core subsystems behind the public API.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<Config>,
    registry: CommandRegistry,
    viewers: ViewerSet,
    session: Arc<RwLock<Option<Arc<ShellSession>>>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let registry = CommandRegistry::new(config.max_history, config.buffer_max_bytes);
        let viewers = ViewerSet::new(config.viewer_queue_capacity, config.viewer_max_dropped);
        Self {
            config,
            registry,
            viewers,
            session: Arc::new(RwLock::new(None)),
        }
    }

    /// The viewer set shared with the gateway.
    #[must_use]
    pub fn viewers(&self) -> ViewerSet {
        self.viewers.clone()
    }

    #[must_use]
    pub fn registry(&self) -> CommandRegistry {
        self.registry.clone()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open the single SSH session. Fails if one is already connected.
    pub async fn connect(&self, remote: RemoteHost) -> Result<TerminalStatus, BridgeError> {
        let mut slot = self.session.write().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_connected() {
                return Err(BridgeError::AlreadyConnected {
                    host: existing.host().to_string(),
                });
            }
        }
        let session = ShellSession::open(
            &remote,
            self.registry.clone(),
            self.viewers.clone(),
            self.config.clone(),
        )
        .await?;
        let status = TerminalStatus {
            connected: true,
            host: Some(session.host().to_string()),
            user: Some(session.user().to_string()),
        };
        *slot = Some(session);
        Ok(status)
    }

    /// Install an already-started session into the slot (tests drive
    /// scripted sessions through here).
    pub async fn adopt_session(&self, session: Arc<ShellSession>) -> Result<(), BridgeError> {
        let mut slot = self.session.write().await;
        if let Some(existing) = slot.as_ref() {
            if existing.is_connected() {
                return Err(BridgeError::AlreadyConnected {
                    host: existing.host().to_string(),
                });
            }
        }
        *slot = Some(session);
        Ok(())
    }

    /// Tear the session down. A no-op when nothing is connected.
    pub async fn disconnect(&self) {
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn terminal_status(&self) -> TerminalStatus {
        let slot = self.session.read().await;
        match slot.as_ref() {
            Some(s) if s.is_connected() => TerminalStatus {
                connected: true,
                host: Some(s.host().to_string()),
                user: Some(s.user().to_string()),
            },
            _ => TerminalStatus {
                connected: false,
                host: None,
                user: None,
            },
        }
    }

    async fn live_session(&self) -> Result<Arc<ShellSession>, BridgeError> {
        let slot = self.session.read().await;
        match slot.as_ref() {
            Some(s) if s.is_connected() => Ok(s.clone()),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Dispatch a command and wait synchronously up to its timeout for a
    /// terminal state. When the wait elapses first the command keeps
    /// running and the outcome carries `status = running`.
    pub async fn execute(
        &self,
        command: &str,
        timeout_seconds: Option<u64>,
        mode: OutputMode,
        conversation_id: Option<String>,
    ) -> Result<ExecuteOutcome, BridgeError> {
        let session = self.live_session().await?;
        let timeout = self.config.effective_timeout(timeout_seconds);

        let id = self
            .registry
            .create(command, conversation_id, session.session_id())
            .await;

        if let Err(e) = session.execute(&id, command, timeout).await {
            self.registry.discard_pending(&id).await;
            return Err(e);
        }

        let deadline = Instant::now() + timeout;
        let record = self.wait_terminal(&id, deadline).await?;

        let output = if record.status.is_terminal() {
            Some(self.render(&record, mode).await)
        } else {
            None
        };

        Ok(ExecuteOutcome {
            command_id: id,
            status: record.status,
            output,
            buffer_info: BufferInfo::from(&record),
        })
    }

    /// Block until the record reaches a terminal state or the deadline
    /// passes; returns the last snapshot either way.
    async fn wait_terminal(
        &self,
        id: &str,
        deadline: Instant,
    ) -> Result<CommandRecord, BridgeError> {
        loop {
            let changed = self.registry.changed();
            let record = self.registry.get(id).await?;
            if record.status.is_terminal() || Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::select! {
                () = changed => {}
                () = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Current snapshot; terminal records come with a filtered payload.
    pub async fn status(
        &self,
        id: &str,
        mode: OutputMode,
    ) -> Result<StatusOutcome, BridgeError> {
        let record = self.registry.get(id).await?;
        let output = if record.status.is_terminal() {
            Some(self.render(&record, mode).await)
        } else {
            None
        };
        Ok(StatusOutcome {
            command_id: record.id.clone(),
            status: record.status,
            output,
            completed_at: record.completed_at,
            buffer_info: BufferInfo::from(&record),
        })
    }

    /// The buffer exactly as retained, middle elision included.
    pub async fn fetch_raw(&self, id: &str) -> Result<Vec<u8>, BridgeError> {
        // Existence check routes unknown ids to the right error.
        let _ = self.registry.get(id).await?;
        self.registry.raw(id).await
    }

    /// Cleaned line-range slice of a command's output.
    pub async fn output_slice(
        &self,
        id: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<OutputSlice, BridgeError> {
        let _ = self.registry.get(id).await?;
        let raw = self.registry.raw(id).await?;
        let clean = filter::strip_marker_lines(&filter::normalize(&raw));
        let lines: Vec<&str> = if clean.is_empty() {
            Vec::new()
        } else {
            clean.lines().collect()
        };
        let total_lines = lines.len();
        let start = start_line.unwrap_or(0).min(total_lines);
        let end = end_line.unwrap_or(total_lines).min(total_lines);
        let effective_end = end.min(start + MAX_SLICE_LINES);
        let slice = if start < effective_end {
            lines[start..effective_end]
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            Vec::new()
        };
        Ok(OutputSlice {
            command_id: id.to_string(),
            start_line: start,
            end_line: effective_end,
            total_lines,
            lines: slice,
        })
    }

    /// Interrupt the in-flight command if it is `id`; a no-op (and
    /// `not_running`) for anything else, terminal ids included.
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome, BridgeError> {
        let record = self.registry.get(id).await?;
        if record.status.is_terminal() {
            return Ok(CancelOutcome {
                command_id: id.to_string(),
                result: "not_running",
            });
        }
        let session = match self.live_session().await {
            Ok(s) => s,
            Err(_) => {
                return Ok(CancelOutcome {
                    command_id: id.to_string(),
                    result: "not_running",
                });
            }
        };
        let delivered = session.cancel(id).await?;
        Ok(CancelOutcome {
            command_id: id.to_string(),
            result: if delivered { "ok" } else { "not_running" },
        })
    }

    pub async fn list(
        &self,
        status: Option<CommandStatus>,
        limit: Option<usize>,
    ) -> Vec<CommandSummary> {
        self.registry.list(status, limit).await
    }

    /// Viewer keystrokes into the shared shell. Never attributed to a
    /// command.
    pub async fn viewer_input(&self, data: &str) -> Result<(), BridgeError> {
        self.live_session().await?.type_bytes(data.as_bytes()).await
    }

    /// Viewer terminal resize.
    pub async fn viewer_resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.live_session().await?.resize(cols, rows).await
    }

    async fn render(&self, record: &CommandRecord, mode: OutputMode) -> FilteredOutput {
        let raw = self.registry.raw(&record.id).await.unwrap_or_default();
        let input = FilterInput {
            command_id: &record.id,
            command: &record.command,
            raw: &raw,
            exit_code: record.exit_code,
            duration: record.duration_seconds.map(Duration::from_secs_f64),
            buffer_truncated: record.truncated,
        };
        filter::render(
            &input,
            mode,
            &self.config.thresholds,
            &self.config.truncation,
        )
    }
}
