//! Transport seam between the shell session and the remote channel.
//!
//! The session logic only ever sees a [`ShellLink`] (write side) plus a
//! stream of [`LinkEvent`]s (read side). Production uses [`SshLink`], an
//! interactive PTY shell over SSH; tests drive the same seam with a scripted
//! in-memory shell.

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, AuthResult, Handle, Handler, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use crate::error::BridgeError;

/// Connection establishment timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Slice length for the shared-channel read loop. Writers acquire the
/// channel mutex between slices.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Capacity of the link event channel feeding the session's drain task.
const EVENT_QUEUE: usize = 256;

/// What the read side of a link produces.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Output bytes, stdout and stderr merged in arrival order.
    Data(Bytes),
    /// The remote side is gone. Terminal; nothing follows.
    Eof,
}

/// Write side of a remote shell channel.
#[async_trait]
pub trait ShellLink: Send + Sync {
    /// Write bytes into the remote shell's input.
    async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError>;

    /// Propagate pseudo-terminal dimensions.
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError>;

    /// Tear the channel down. Idempotent, best effort.
    async fn close(&self);
}

/// Where and how to reach the remote shell.
#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
}

struct AcceptingHandler;

impl Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host-key pinning belongs to the inventory layer, not the broker.
        Ok(true)
    }
}

/// Interactive PTY shell over SSH.
///
/// The russh channel is shared between one reader task and the writer
/// methods through a mutex; the reader waits in short slices so writes
/// never starve.
pub struct SshLink {
    _session: Handle<AcceptingHandler>,
    channel: Arc<Mutex<Channel<Msg>>>,
}

impl SshLink {
    /// Connect, authenticate, open a PTY shell channel, and spawn the
    /// reader task. Returns the write handle and the event stream.
    pub async fn open(
        remote: &RemoteHost,
        cols: u16,
        rows: u16,
        keepalive: Duration,
    ) -> Result<(Self, mpsc::Receiver<LinkEvent>), BridgeError> {
        let config = client::Config {
            keepalive_interval: Some(keepalive),
            ..Default::default()
        };

        tracing::info!(host = %remote.host, port = remote.port, user = %remote.user, "connecting");

        let mut session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(
                Arc::new(config),
                (remote.host.as_str(), remote.port),
                AcceptingHandler,
            ),
        )
        .await
        .map_err(|_| BridgeError::Transport(format!("connection to {} timed out", remote.host)))?
        .map_err(|e| BridgeError::Transport(format!("connection failed: {e}")))?;

        Self::authenticate(&mut session, remote).await?;

        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to open channel: {e}")))?;

        channel
            .request_pty(true, "xterm-256color", u32::from(cols), u32::from(rows), 0, 0, &[])
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to request PTY: {e}")))?;

        channel
            .request_shell(true)
            .await
            .map_err(|e| BridgeError::Transport(format!("failed to request shell: {e}")))?;

        let channel = Arc::new(Mutex::new(channel));
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(read_loop(channel.clone(), tx));

        tracing::info!(host = %remote.host, "shell channel open");

        Ok((
            Self {
                _session: session,
                channel,
            },
            rx,
        ))
    }

    async fn authenticate(
        session: &mut Handle<AcceptingHandler>,
        remote: &RemoteHost,
    ) -> Result<(), BridgeError> {
        if let Some(password) = &remote.password {
            let result = session
                .authenticate_password(&remote.user, password)
                .await
                .map_err(|e| BridgeError::Transport(format!("password auth error: {e}")))?;
            match result {
                AuthResult::Success => Ok(()),
                _ => Err(BridgeError::Transport(
                    "password authentication rejected".to_string(),
                )),
            }
        } else {
            let key_path = match &remote.private_key_path {
                Some(path) => expand_home(path),
                None => default_key_path().ok_or_else(|| {
                    BridgeError::Transport("no SSH key found under ~/.ssh".to_string())
                })?,
            };
            let key = load_secret_key(&key_path, None)
                .map_err(|e| BridgeError::Transport(format!("failed to load key {key_path}: {e}")))?;
            let result = session
                .authenticate_publickey(
                    &remote.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key), Some(HashAlg::Sha256)),
                )
                .await
                .map_err(|e| BridgeError::Transport(format!("public key auth error: {e}")))?;
            match result {
                AuthResult::Success => Ok(()),
                _ => Err(BridgeError::Transport(
                    "public key authentication rejected".to_string(),
                )),
            }
        }
    }
}

#[async_trait]
impl ShellLink for SshLink {
    async fn send(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let channel = self.channel.lock().await;
        channel
            .data(bytes)
            .await
            .map_err(|e| BridgeError::Transport(format!("write failed: {e}")))
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), BridgeError> {
        let channel = self.channel.lock().await;
        channel
            .window_change(u32::from(cols), u32::from(rows), 0, 0)
            .await
            .map_err(|e| BridgeError::Transport(format!("resize failed: {e}")))
    }

    async fn close(&self) {
        let channel = self.channel.lock().await;
        let _ = channel.data(&b"exit\n"[..]).await;
        let _ = channel.close().await;
    }
}

/// Drain channel messages into the event stream. Stdout and stderr merge;
/// EOF and close both end the stream with a single [`LinkEvent::Eof`].
async fn read_loop(channel: Arc<Mutex<Channel<Msg>>>, tx: mpsc::Sender<LinkEvent>) {
    loop {
        let msg = {
            let mut channel = channel.lock().await;
            match tokio::time::timeout(WAIT_SLICE, channel.wait()).await {
                Ok(msg) => msg,
                // Slice elapsed with no traffic; release the lock so
                // writers can run, then wait again.
                Err(_) => continue,
            }
        };

        match msg {
            Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                if tx
                    .send(LinkEvent::Data(Bytes::copy_from_slice(&data)))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                let _ = tx.send(LinkEvent::Eof).await;
                return;
            }
            Some(_) => {}
        }
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{home}{rest}"),
        _ => path.to_string(),
    }
}

fn default_key_path() -> Option<String> {
    let home = std::env::var("HOME").ok()?;
    for name in ["id_ed25519", "id_rsa"] {
        let candidate = format!("{home}/.ssh/{name}");
        if std::path::Path::new(&candidate).exists() {
            return Some(candidate);
        }
    }
    None
}
