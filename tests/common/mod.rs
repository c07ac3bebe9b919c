//! Shared test harness: a scripted in-memory shell behind the `ShellLink`
//! seam.
//!
//! The scripted shell behaves like a PTY-attached remote bash: it echoes
//! everything typed, substitutes `$?` into the trailing status marker, and
//! prints a prompt when idle. Commands are matched by prefix against
//! programmed behaviours, so tests can make the shell produce output, hang
//! until interrupted, or drop the connection mid-command.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use termbridge::bus::ViewerSet;
use termbridge::config::Config;
use termbridge::error::BridgeError;
use termbridge::link::{LinkEvent, ShellLink};
use termbridge::registry::{CommandRecord, CommandRegistry};
use termbridge::session::ShellSession;
use tokio::sync::{Mutex, mpsc};

/// The prompt the scripted shell prints when idle.
pub const PROMPT: &str = "testuser@remote:~$ ";

/// Programmed behaviour for a command, matched by prefix.
#[derive(Clone)]
pub enum Script {
    /// Emit these lines, then the status marker with `exit_code`, then the
    /// prompt.
    Output { lines: Vec<String>, exit_code: i32 },
    /// Produce nothing until interrupted; Ctrl-C yields `^C`, marker 130,
    /// prompt.
    Hang,
    /// Produce nothing and swallow interrupts (forces the secondary-grace
    /// path).
    HangIgnoringInterrupt,
    /// Emit these lines, then drop the connection.
    Die { lines: Vec<String> },
}

pub fn output(lines: &[&str], exit_code: i32) -> Script {
    Script::Output {
        lines: lines.iter().map(|s| s.to_string()).collect(),
        exit_code,
    }
}

struct ShellState {
    scripts: Vec<(String, Script)>,
    /// Marker template of a hanging command, waiting for an interrupt.
    pending: Option<(String, bool)>,
    line_buf: String,
    closed: bool,
    last_resize: Option<(u16, u16)>,
}

/// Scripted in-memory shell implementing [`ShellLink`].
#[derive(Clone)]
pub struct ScriptedLink {
    state: Arc<Mutex<ShellState>>,
    tx: mpsc::Sender<LinkEvent>,
}

impl ScriptedLink {
    pub fn new() -> (Self, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(65536);
        (
            Self {
                state: Arc::new(Mutex::new(ShellState {
                    scripts: Vec::new(),
                    pending: None,
                    line_buf: String::new(),
                    closed: false,
                    last_resize: None,
                })),
                tx,
            },
            rx,
        )
    }

    pub async fn script(&self, prefix: &str, behaviour: Script) {
        self.state
            .lock()
            .await
            .scripts
            .push((prefix.to_string(), behaviour));
    }

    /// Simulate transport loss out from under the session.
    pub async fn kill(&self) {
        let mut st = self.state.lock().await;
        st.closed = true;
        let _ = self.tx.send(LinkEvent::Eof).await;
    }

    pub async fn last_resize(&self) -> Option<(u16, u16)> {
        self.state.lock().await.last_resize
    }

    async fn emit(&self, text: &str) {
        let _ = self
            .tx
            .send(LinkEvent::Data(Bytes::from(text.as_bytes().to_vec())))
            .await;
    }

    async fn run_line(&self, st: &mut ShellState, line: &str) {
        let line = line.trim_end_matches('\r');

        // Prompt-learning probe: `echo '__TERMBRIDGE_PROBE_x__'`.
        if line.contains("__TERMBRIDGE_PROBE_") {
            if let Some(inner) = line.split('\'').nth(1) {
                self.emit(&format!("{inner}\r\n")).await;
            }
            self.emit(PROMPT).await;
            return;
        }

        // Split off the trailing status-capture echo.
        let (command, marker) = match line.rfind("; echo \"") {
            Some(idx) => {
                let rest = &line[idx + 8..];
                (
                    line[..idx].to_string(),
                    Some(rest.trim_end_matches('"').to_string()),
                )
            }
            None => (line.to_string(), None),
        };

        let behaviour = st
            .scripts
            .iter()
            .find(|(prefix, _)| command.trim().starts_with(prefix.as_str()))
            .map(|(_, s)| s.clone())
            .unwrap_or(Script::Output {
                lines: Vec::new(),
                exit_code: 0,
            });

        match behaviour {
            Script::Output { lines, exit_code } => {
                for l in &lines {
                    self.emit(&format!("{l}\r\n")).await;
                }
                if let Some(m) = marker {
                    self.emit(&format!("{}\r\n", m.replace("$?", &exit_code.to_string())))
                        .await;
                }
                self.emit(PROMPT).await;
            }
            Script::Hang => st.pending = marker.map(|m| (m, false)),
            Script::HangIgnoringInterrupt => st.pending = marker.map(|m| (m, true)),
            Script::Die { lines } => {
                for l in &lines {
                    self.emit(&format!("{l}\r\n")).await;
                }
                st.closed = true;
                let _ = self.tx.send(LinkEvent::Eof).await;
            }
        }
    }
}

#[async_trait]
impl ShellLink for ScriptedLink {
    async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(BridgeError::Transport("link closed".to_string()));
        }

        if bytes.contains(&0x03) {
            if let Some((marker, ignore)) = st.pending.clone() {
                if !ignore {
                    st.pending = None;
                    self.emit("^C\r\n").await;
                    self.emit(&format!("{}\r\n", marker.replace("$?", "130"))).await;
                    self.emit(PROMPT).await;
                }
            }
            return Ok(());
        }

        let text = String::from_utf8_lossy(bytes).into_owned();
        // PTY echo.
        self.emit(&text.replace('\n', "\r\n")).await;

        st.line_buf.push_str(&text);
        while let Some(pos) = st.line_buf.find('\n') {
            let line: String = st.line_buf.drain(..=pos).collect();
            self.run_line(&mut st, line.trim_end_matches('\n')).await;
        }
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let mut st = self.state.lock().await;
        if st.closed {
            return Err(BridgeError::Transport("link closed".to_string()));
        }
        st.last_resize = Some((cols, rows));
        Ok(())
    }

    async fn close(&self) {
        let mut st = self.state.lock().await;
        st.closed = true;
        let _ = self.tx.send(LinkEvent::Eof).await;
    }
}

/// Everything a session test needs in one place.
pub struct Harness {
    pub link: ScriptedLink,
    pub session: Arc<ShellSession>,
    pub registry: CommandRegistry,
    pub viewers: ViewerSet,
    pub config: Arc<Config>,
}

pub fn test_config() -> Arc<Config> {
    Arc::new(Config {
        default_timeout: Duration::from_secs(30),
        ..Config::default()
    })
}

/// Start a session over a scripted shell with the given behaviours.
pub async fn scripted_session(scripts: Vec<(&str, Script)>) -> Harness {
    let config = test_config();
    let (link, events) = ScriptedLink::new();
    for (prefix, s) in scripts {
        link.script(prefix, s).await;
    }
    let registry = CommandRegistry::new(config.max_history, config.buffer_max_bytes);
    let viewers = ViewerSet::new(config.viewer_queue_capacity, config.viewer_max_dropped);
    let session = ShellSession::start(
        Box::new(link.clone()),
        events,
        "remote".to_string(),
        "testuser".to_string(),
        registry.clone(),
        viewers.clone(),
        config.clone(),
    )
    .await
    .expect("scripted session failed to start");
    Harness {
        link,
        session,
        registry,
        viewers,
        config,
    }
}

/// Poll the registry until the command leaves its non-terminal states.
pub async fn wait_for_terminal(registry: &CommandRegistry, id: &str) -> CommandRecord {
    for _ in 0..5000 {
        let record = registry.get(id).await.expect("record evicted while waiting");
        if record.status.is_terminal() {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("command {id} never reached a terminal state");
}

/// Create a registry record and dispatch it through the session; returns
/// the id.
pub async fn dispatch(h: &Harness, command: &str, timeout: Duration) -> String {
    let id = h
        .registry
        .create(command, None, h.session.session_id())
        .await;
    h.session
        .execute(&id, command, timeout)
        .await
        .expect("dispatch failed");
    id
}
