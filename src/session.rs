//! The shell session: sole owner of the remote interactive channel.
//!
//! One long-lived shell, reached over a [`ShellLink`]. Writes are serialised
//! through the link; output bytes flow through a single drain task that, in
//! order, appends to the in-flight command's buffer, feeds the prompt
//! detector, and fans the chunk out to every viewer. Command boundaries are
//! committed when the learned prompt signature sits quiescent at the end of
//! the stream for the grace interval.
//!
//! At most one command is ever in flight; the slot is a mutex-guarded
//! option holding the current command id and its intended terminal state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::bus::ViewerSet;
use crate::config::Config;
use crate::error::BridgeError;
use crate::filter;
use crate::link::{LinkEvent, RemoteHost, ShellLink, SshLink};
use crate::prompt::PromptDetector;
use crate::registry::{CommandRegistry, CommandStatus};

/// Prefix shared by every internal marker written into the shell stream.
pub const MARKER_PREFIX: &str = "__TERMBRIDGE_";

/// Interrupt byte written for cancel and timeout (Ctrl-C).
const INTERRUPT: &[u8] = &[0x03];

/// Bound on prompt-signature learning at connect time.
const LEARN_TIMEOUT: Duration = Duration::from_secs(5);

/// After a deadline interrupt, how long to wait for a boundary before
/// forcing the transition.
const SECONDARY_GRACE: Duration = Duration::from_secs(2);

/// Default pseudo-terminal size at open.
const DEFAULT_COLS: u16 = 200;
const DEFAULT_ROWS: u16 = 50;

/// The command currently occupying the shell, if any.
struct Inflight {
    id: String,
    /// Terminal state the next boundary will commit. `Completed` unless a
    /// cancel or deadline re-aimed it.
    intended: CommandStatus,
    /// Guards deadline watchdogs against acting on a later command.
    epoch: u64,
}

/// One open session to one remote host.
pub struct ShellSession {
    id: String,
    host: String,
    user: String,
    link: Box<dyn ShellLink>,
    registry: CommandRegistry,
    viewers: ViewerSet,
    config: Arc<Config>,
    inflight: Mutex<Option<Inflight>>,
    detector: Mutex<PromptDetector>,
    /// Random per-session component of the exit-status marker.
    salt: String,
    open: AtomicBool,
    next_epoch: AtomicU64,
    /// Self-handle for spawning per-command watchdogs.
    weak: Weak<Self>,
}

impl ShellSession {
    /// Connect over SSH, learn the prompt, and start the drain task.
    pub async fn open(
        remote: &RemoteHost,
        registry: CommandRegistry,
        viewers: ViewerSet,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, BridgeError> {
        let (link, events) = SshLink::open(
            remote,
            DEFAULT_COLS,
            DEFAULT_ROWS,
            config.keepalive_interval,
        )
        .await?;
        Self::start(
            Box::new(link),
            events,
            remote.host.clone(),
            remote.user.clone(),
            registry,
            viewers,
            config,
        )
        .await
    }

    /// Bring a session up over an already-open link. Production goes
    /// through [`ShellSession::open`]; tests supply scripted links here.
    pub async fn start(
        link: Box<dyn ShellLink>,
        mut events: mpsc::Receiver<LinkEvent>,
        host: String,
        user: String,
        registry: CommandRegistry,
        viewers: ViewerSet,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, BridgeError> {
        let session = Arc::new_cyclic(|weak| Self {
            id: uuid::Uuid::new_v4().to_string(),
            host,
            user,
            link,
            registry,
            viewers,
            config,
            inflight: Mutex::new(None),
            detector: Mutex::new(PromptDetector::new()),
            salt: uuid::Uuid::new_v4().simple().to_string(),
            open: AtomicBool::new(true),
            next_epoch: AtomicU64::new(0),
            weak: weak.clone(),
        });

        session.learn_prompt(&mut events).await?;

        tokio::spawn(drain(session.clone(), events));
        Ok(session)
    }

    /// Learn the prompt signature: probe the idle shell with a marker echo
    /// and take the last line standing once output settles.
    async fn learn_prompt(
        self: &Arc<Self>,
        events: &mut mpsc::Receiver<LinkEvent>,
    ) -> Result<(), BridgeError> {
        let probe = format!(
            "echo '{MARKER_PREFIX}PROBE_{}__'\n",
            uuid::Uuid::new_v4().simple()
        );
        self.link.send(probe.as_bytes()).await?;

        let deadline = Instant::now() + LEARN_TIMEOUT;
        let idle = self.config.prompt_grace.max(Duration::from_millis(200));
        let mut detector = self.detector.lock().await;

        loop {
            match tokio::time::timeout(idle, events.recv()).await {
                Ok(Some(LinkEvent::Data(chunk))) => {
                    detector.feed(&chunk);
                    self.viewers.broadcast(&chunk).await;
                }
                Ok(Some(LinkEvent::Eof)) | Ok(None) => {
                    return Err(BridgeError::Transport(
                        "shell closed while learning prompt".to_string(),
                    ));
                }
                // Quiescent: the idle terminal's tail is the signature.
                Err(_) => {
                    if let Some(sig) = detector.learn_signature() {
                        tracing::debug!(signature = %sig, "prompt signature learned");
                        detector.reset();
                        return Ok(());
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(BridgeError::Transport(
                    "could not learn prompt signature".to_string(),
                ));
            }
        }
    }

    /// Dispatch a command. The registry record for `id` must exist in
    /// `pending`. Fails fast with `busy` when the slot is occupied; output
    /// then flows asynchronously and the boundary commits the record.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }

        // Claim the slot and attribute the drain before any bytes hit the
        // wire, so the command's own echo is never lost.
        let epoch = {
            let mut slot = self.inflight.lock().await;
            if let Some(current) = slot.as_ref() {
                return Err(BridgeError::Busy {
                    inflight_id: current.id.clone(),
                });
            }
            let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
            *slot = Some(Inflight {
                id: id.to_string(),
                intended: CommandStatus::Completed,
                epoch,
            });
            epoch
        };

        if let Err(e) = self.registry.transition(id, CommandStatus::Running).await {
            *self.inflight.lock().await = None;
            return Err(e);
        }

        // Trailing status capture; the salt keeps it unmistakable for
        // legitimate output.
        let wire = format!(
            "{command}; echo \"{MARKER_PREFIX}{}_STATUS_$?__\"\n",
            self.salt
        );
        if let Err(e) = self.link.send(wire.as_bytes()).await {
            tracing::error!(error = %e, "command write failed; tearing session down");
            self.teardown().await;
            return Err(e);
        }

        tracing::info!(id = %id, command = %command, timeout = ?timeout, "command dispatched");

        if let Some(session) = self.weak.upgrade() {
            tokio::spawn(watchdog(session, id.to_string(), epoch, timeout));
        }
        Ok(())
    }

    /// Re-aim the in-flight command at `cancelled` and interrupt the shell.
    /// Returns false when `id` is not the in-flight command.
    pub async fn cancel(&self, id: &str) -> Result<bool, BridgeError> {
        {
            let mut slot = self.inflight.lock().await;
            match slot.as_mut() {
                Some(current) if current.id == id => {
                    current.intended = CommandStatus::Cancelled;
                }
                _ => return Ok(false),
            }
        }
        self.send_interrupt().await?;
        tracing::info!(id = %id, "cancel requested; interrupt sent");
        Ok(true)
    }

    /// Write the interrupt byte, bypassing command dispatch.
    pub async fn send_interrupt(&self) -> Result<(), BridgeError> {
        self.link.send(INTERRUPT).await
    }

    /// Viewer keystrokes. Never attributed to a command and never touching
    /// the in-flight slot; whatever the shell echoes back is ordinary
    /// output.
    pub async fn type_bytes(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        self.link.send(bytes).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        self.link.resize(cols, rows).await
    }

    /// Explicit disconnect: closes the channel and tears state down.
    pub async fn close(&self) {
        self.link.close().await;
        self.teardown().await;
    }

    /// Session teardown: runs once, no matter how many paths reach it.
    /// Running and pending commands become `interrupted`; viewers get a
    /// terminal status frame and are dropped.
    pub(crate) async fn teardown(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.inflight.lock().await = None;
        let interrupted = self.registry.interrupt_active().await;
        if !interrupted.is_empty() {
            tracing::warn!(count = interrupted.len(), "commands interrupted by session loss");
        }
        self.viewers.close_all().await;
        tracing::info!(host = %self.host, "session torn down");
    }

    /// Commit the boundary for the in-flight command, if any: extract the
    /// exit code, scan for errors, transition to the intended state, and
    /// reset the detector.
    pub(crate) async fn finalize_boundary(&self, forced: bool) {
        let Some(inflight) = self.inflight.lock().await.take() else {
            return;
        };
        let id = inflight.id;

        if let Ok(raw) = self.registry.raw(&id).await {
            if let Some(code) = self.parse_exit_marker(&raw) {
                let _ = self.registry.record_exit_code(&id, code).await;
            }
            // Scan the agent-visible text: the echoed command line carries
            // the marker and must not feed the error scan.
            let clean = filter::strip_marker_lines(&filter::normalize(&raw));
            let lines: Vec<&str> = clean.lines().collect();
            if let Some(n) = filter::find_error_line(&lines) {
                let _ = self
                    .registry
                    .mark_errors(&id, Some(lines[n].to_string()))
                    .await;
            } else if self
                .registry
                .get(&id)
                .await
                .is_ok_and(|r| r.exit_code.is_some_and(|c| c != 0))
            {
                let _ = self.registry.mark_errors(&id, None).await;
            }
        }

        if forced {
            let _ = self.registry.mark_boundary_forced(&id).await;
        }

        if let Err(e) = self.registry.transition(&id, inflight.intended).await {
            tracing::error!(id = %id, error = %e, "boundary transition failed");
        } else {
            tracing::info!(id = %id, status = ?inflight.intended, forced, "command finalised");
        }

        self.detector.lock().await.reset();
    }

    /// Last occurrence of this session's status marker in the buffer.
    /// The echoed command line carries a literal `$?`, so only the shell's
    /// expansion matches.
    fn parse_exit_marker(&self, raw: &[u8]) -> Option<i32> {
        let text = String::from_utf8_lossy(raw);
        let needle = format!("{MARKER_PREFIX}{}_STATUS_", self.salt);
        let start = text.rfind(&needle)? + needle.len();
        let rest = &text[start..];
        let end = rest.find("__")?;
        rest[..end].parse().ok()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub async fn inflight_id(&self) -> Option<String> {
        self.inflight.lock().await.as_ref().map(|c| c.id.clone())
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }
}

/// The producer path: one task drains link events for the session's
/// lifetime. Per chunk, strictly in order: registry append, detector feed,
/// viewer broadcast. Boundary commits happen here too, so they are always
/// observed after every byte of the command has been appended.
async fn drain(session: Arc<ShellSession>, mut events: mpsc::Receiver<LinkEvent>) {
    let mut armed: Option<Instant> = None;

    loop {
        // `armed` is copied in; the handler below may freely re-arm it.
        let grace = async move {
            match armed {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(LinkEvent::Data(chunk)) => {
                    let inflight = session.inflight_id().await;
                    if let Some(id) = &inflight {
                        if let Err(e) = session.registry.append(id, &chunk).await {
                            tracing::debug!(id = %id, error = %e, "append skipped");
                        }
                    }

                    let at_prompt = {
                        let mut detector = session.detector.lock().await;
                        detector.feed(&chunk);
                        detector.matches_prompt()
                    };

                    session.viewers.broadcast(&chunk).await;

                    // Arm the grace timer only while a command is in
                    // flight; any further bytes re-evaluate (and so
                    // disarm a match that didn't survive).
                    armed = if inflight.is_some() && at_prompt {
                        Some(Instant::now() + session.config.prompt_grace)
                    } else {
                        None
                    };
                }
                Some(LinkEvent::Eof) | None => {
                    session.teardown().await;
                    return;
                }
            },
            () = grace => {
                armed = None;
                session.finalize_boundary(false).await;
            }
        }
    }
}

/// Per-command deadline: on expiry, interrupt and re-aim at `timeout`;
/// if no boundary follows within the secondary grace, force it.
async fn watchdog(session: Arc<ShellSession>, id: String, epoch: u64, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    {
        let mut slot = session.inflight.lock().await;
        match slot.as_mut() {
            Some(current) if current.id == id && current.epoch == epoch => {
                // A cancel that already re-aimed the command keeps its
                // intended state; the deadline still drives the interrupt.
                if current.intended == CommandStatus::Completed {
                    current.intended = CommandStatus::TimedOut;
                }
            }
            _ => return,
        }
    }

    tracing::warn!(id = %id, "command deadline elapsed; sending interrupt");
    let _ = session.send_interrupt().await;

    tokio::time::sleep(SECONDARY_GRACE).await;

    let still_inflight = session
        .inflight
        .lock()
        .await
        .as_ref()
        .is_some_and(|c| c.id == id && c.epoch == epoch);
    if still_inflight {
        tracing::warn!(id = %id, "no boundary after interrupt; forcing transition");
        session.finalize_boundary(true).await;
    }
}
