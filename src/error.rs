//! Error kinds surfaced by the broker core.
//!
//! Agent-facing failures carry a stable snake_case `kind` plus a message;
//! programming faults (illegal state transitions) are logged and collapsed
//! to a generic `internal` kind before they cross the tool boundary.

use serde::Serialize;
use thiserror::Error;

use crate::registry::CommandStatus;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// No shell session is open.
    #[error("no terminal session is connected")]
    NotConnected,

    /// A session is already open; only one may exist at a time.
    #[error("a terminal session to {host} is already open")]
    AlreadyConnected { host: String },

    /// A command is already in flight; carries its id.
    #[error("a command is already running: {inflight_id}")]
    Busy { inflight_id: String },

    /// The command id does not name a known record.
    #[error("unknown command id: {0}")]
    UnknownCommandId(String),

    /// Illegal registry edge. Programming fault: never shown to the agent
    /// as-is.
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    /// The remote channel failed; the session is being torn down.
    #[error("transport error: {0}")]
    Transport(String),
}

impl BridgeError {
    /// Stable kind string used in agent-facing error payloads.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::AlreadyConnected { .. } => "already_connected",
            Self::Busy { .. } => "busy",
            Self::UnknownCommandId(_) => "unknown_command_id",
            // Programming fault: masked at the boundary.
            Self::InvalidTransition { .. } => "internal",
            Self::Transport(_) => "transport_error",
        }
    }

    /// Agent-facing payload. Transitions faults are logged here and
    /// replaced with a generic message.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            Self::InvalidTransition { from, to } => {
                tracing::error!(?from, ?to, "invalid state transition reached tool boundary");
                debug_assert!(false, "invalid state transition {from:?} -> {to:?}");
                ErrorPayload {
                    kind: "internal",
                    message: "internal server error".to_string(),
                    inflight_id: None,
                }
            }
            Self::Busy { inflight_id } => ErrorPayload {
                kind: self.kind(),
                message: self.to_string(),
                inflight_id: Some(inflight_id.clone()),
            },
            _ => ErrorPayload {
                kind: self.kind(),
                message: self.to_string(),
                inflight_id: None,
            },
        }
    }
}

/// Structured error object returned to the agent.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inflight_id: Option<String>,
}
