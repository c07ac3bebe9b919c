//! Command registry: every dispatched command, from creation to eviction.
//!
//! Records are keyed by an unguessable UUID id, mutated only by the session's
//! drain path while running, and frozen once they reach a terminal state.
//! Waiters block on a registry-wide notifier and re-check their record after
//! every transition. Retention is pull-based: terminal records beyond the
//! history cap are evicted when the registry is next listed or read.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};

use crate::buffer::OutputBuffer;
use crate::error::BridgeError;

/// Lifecycle of a dispatched command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    #[serde(rename = "timeout")]
    TimedOut,
    Interrupted,
}

impl CommandStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::TimedOut | Self::Interrupted
        )
    }

    /// Parse the wire spelling used by `list_commands` filters.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "timeout" => Some(Self::TimedOut),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Legal state-machine edges. Anything else is a programming fault.
    fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running) => true,
            // A session torn down before dispatch interrupts pending
            // commands too.
            (Self::Pending, Self::Interrupted) => true,
            (
                Self::Running,
                Self::Completed | Self::Cancelled | Self::TimedOut | Self::Interrupted,
            ) => true,
            _ => false,
        }
    }
}

/// Read-only snapshot of a command record. Callers never mutate state
/// through one of these.
#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub id: String,
    pub command: String,
    pub status: CommandStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub created_at: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub has_errors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    /// Newline count over the retained bytes; cheap, not exact for
    /// truncated buffers.
    pub line_hint: usize,
    pub total_bytes: u64,
    /// The retained buffer dropped bytes from its middle.
    pub truncated: bool,
    /// The boundary was forced after the secondary grace, not observed.
    pub boundary_forced: bool,
}

/// One line of `list_commands` output.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSummary {
    pub command_id: String,
    pub command: String,
    pub status: CommandStatus,
    pub timestamp: f64,
}

struct CommandEntry {
    command: String,
    conversation_id: Option<String>,
    session_id: String,
    status: CommandStatus,
    buffer: OutputBuffer,
    exit_code: Option<i32>,
    created_wall: f64,
    started_mono: Option<Instant>,
    completed_wall: Option<f64>,
    duration: Option<f64>,
    has_errors: bool,
    error_context: Option<String>,
    boundary_forced: bool,
    /// Creation order, for most-recent-first listing and eviction.
    seq: u64,
}

impl CommandEntry {
    fn snapshot(&self, id: &str) -> CommandRecord {
        CommandRecord {
            id: id.to_string(),
            command: self.command.clone(),
            status: self.status,
            conversation_id: self.conversation_id.clone(),
            session_id: self.session_id.clone(),
            exit_code: self.exit_code,
            created_at: self.created_wall,
            completed_at: self.completed_wall,
            duration_seconds: self.duration,
            has_errors: self.has_errors,
            error_context: self.error_context.clone(),
            line_hint: self.buffer.line_hint(),
            total_bytes: self.buffer.total_bytes(),
            truncated: self.buffer.truncated(),
            boundary_forced: self.boundary_forced,
        }
    }
}

struct Inner {
    entries: HashMap<String, CommandEntry>,
    next_seq: u64,
}

/// Thread-safe registry of dispatched commands.
#[derive(Clone)]
pub struct CommandRegistry {
    inner: Arc<RwLock<Inner>>,
    notify: Arc<Notify>,
    max_history: usize,
    buffer_max_bytes: usize,
}

impl CommandRegistry {
    #[must_use]
    pub fn new(max_history: usize, buffer_max_bytes: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
            })),
            notify: Arc::new(Notify::new()),
            max_history,
            buffer_max_bytes,
        }
    }

    /// Create a record in `pending` and return its id. Ids are UUIDs and
    /// never recycled for the process lifetime.
    pub async fn create(
        &self,
        command: &str,
        conversation_id: Option<String>,
        session_id: &str,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;
        Self::evict_locked(&mut inner, self.max_history);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            id.clone(),
            CommandEntry {
                command: command.to_string(),
                conversation_id,
                session_id: session_id.to_string(),
                status: CommandStatus::Pending,
                buffer: OutputBuffer::new(self.buffer_max_bytes),
                exit_code: None,
                created_wall: unix_now(),
                started_mono: None,
                completed_wall: None,
                duration: None,
                has_errors: false,
                error_context: None,
                boundary_forced: false,
                seq,
            },
        );
        id
    }

    /// Move a record along a legal edge. Terminal transitions stamp the
    /// completion time and wake every waiter.
    pub async fn transition(&self, id: &str, to: CommandStatus) -> Result<(), BridgeError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownCommandId(id.to_string()))?;

        if !entry.status.can_transition_to(to) {
            return Err(BridgeError::InvalidTransition {
                from: entry.status,
                to,
            });
        }

        entry.status = to;
        match to {
            CommandStatus::Running => entry.started_mono = Some(Instant::now()),
            s if s.is_terminal() => {
                entry.completed_wall = Some(unix_now());
                entry.duration = entry.started_mono.map(|t| t.elapsed().as_secs_f64());
            }
            _ => {}
        }
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Append output bytes. Only legal while the record is `running`.
    pub async fn append(&self, id: &str, chunk: &[u8]) -> Result<(), BridgeError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownCommandId(id.to_string()))?;
        if entry.status != CommandStatus::Running {
            return Err(BridgeError::InvalidTransition {
                from: entry.status,
                to: entry.status,
            });
        }
        entry.buffer.append(chunk);
        Ok(())
    }

    /// Record the exit code extracted from the status marker. Legal until
    /// the record turns terminal.
    pub async fn record_exit_code(&self, id: &str, code: i32) -> Result<(), BridgeError> {
        self.mutate_live(id, |e| e.exit_code = Some(code)).await
    }

    /// Flag detected errors with their extracted context.
    pub async fn mark_errors(&self, id: &str, context: Option<String>) -> Result<(), BridgeError> {
        self.mutate_live(id, |e| {
            e.has_errors = true;
            e.error_context = context;
        })
        .await
    }

    /// Flag a boundary committed by the secondary grace, not observation.
    pub async fn mark_boundary_forced(&self, id: &str) -> Result<(), BridgeError> {
        self.mutate_live(id, |e| e.boundary_forced = true).await
    }

    async fn mutate_live(
        &self,
        id: &str,
        f: impl FnOnce(&mut CommandEntry),
    ) -> Result<(), BridgeError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| BridgeError::UnknownCommandId(id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(BridgeError::InvalidTransition {
                from: entry.status,
                to: entry.status,
            });
        }
        f(entry);
        Ok(())
    }

    /// Snapshot a record.
    pub async fn get(&self, id: &str) -> Result<CommandRecord, BridgeError> {
        let mut inner = self.inner.write().await;
        Self::evict_locked(&mut inner, self.max_history);
        inner
            .entries
            .get(id)
            .map(|e| e.snapshot(id))
            .ok_or_else(|| BridgeError::UnknownCommandId(id.to_string()))
    }

    /// The retained raw buffer, middle elision included.
    pub async fn raw(&self, id: &str) -> Result<Vec<u8>, BridgeError> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(id)
            .map(|e| e.buffer.to_bytes())
            .ok_or_else(|| BridgeError::UnknownCommandId(id.to_string()))
    }

    /// Most-recent-first summaries, optionally filtered by status.
    pub async fn list(
        &self,
        status: Option<CommandStatus>,
        limit: Option<usize>,
    ) -> Vec<CommandSummary> {
        let mut inner = self.inner.write().await;
        Self::evict_locked(&mut inner, self.max_history);
        let mut rows: Vec<(u64, CommandSummary)> = inner
            .entries
            .iter()
            .filter(|(_, e)| status.is_none_or(|s| e.status == s))
            .map(|(id, e)| {
                (
                    e.seq,
                    CommandSummary {
                        command_id: id.clone(),
                        command: e.command.clone(),
                        status: e.status,
                        timestamp: e.created_wall,
                    },
                )
            })
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.truncate(limit.unwrap_or(usize::MAX));
        rows.into_iter().map(|(_, s)| s).collect()
    }

    /// Interrupt every non-terminal record (session teardown). Returns the
    /// ids that changed.
    pub async fn interrupt_active(&self) -> Vec<String> {
        let mut changed = Vec::new();
        {
            let mut inner = self.inner.write().await;
            for (id, entry) in inner.entries.iter_mut() {
                if !entry.status.is_terminal() {
                    entry.status = CommandStatus::Interrupted;
                    entry.completed_wall = Some(unix_now());
                    entry.duration = entry.started_mono.map(|t| t.elapsed().as_secs_f64());
                    changed.push(id.clone());
                }
            }
        }
        if !changed.is_empty() {
            self.notify.notify_waiters();
        }
        changed
    }

    /// Drop a record that never left `pending` (its dispatch was rejected).
    /// The id is burned either way; it is never reused.
    pub async fn discard_pending(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if inner
            .entries
            .get(id)
            .is_some_and(|e| e.status == CommandStatus::Pending)
        {
            inner.entries.remove(id);
        }
    }

    /// A future resolving at the next transition. Obtain it *before*
    /// checking the record to avoid missing a wakeup.
    #[must_use]
    pub fn changed(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Drop terminal records beyond the retention cap, oldest first.
    fn evict_locked(inner: &mut Inner, max_history: usize) {
        let terminal: usize = inner
            .entries
            .values()
            .filter(|e| e.status.is_terminal())
            .count();
        if terminal <= max_history {
            return;
        }
        let mut victims: Vec<(u64, String)> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.status.is_terminal())
            .map(|(id, e)| (e.seq, id.clone()))
            .collect();
        victims.sort_by_key(|(seq, _)| *seq);
        for (_, id) in victims.into_iter().take(terminal - max_history) {
            inner.entries.remove(&id);
        }
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
