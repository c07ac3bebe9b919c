//! Runtime configuration.
//!
//! Everything tunable about the broker lives here: timeouts, the prompt
//! grace window, retention bounds, filter thresholds, and the viewer queue
//! sizing. Defaults are compiled in; any value can be overridden with a
//! `TERMBRIDGE_*` environment variable.

use std::net::SocketAddr;
use std::time::Duration;

/// Hard ceiling on any command timeout (1 hour).
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;

/// Per-class line thresholds above which auto mode stops returning full
/// output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub install: usize,
    pub file_listing: usize,
    pub log_search: usize,
    pub generic: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            install: 100,
            file_listing: 50,
            log_search: 50,
            generic: 50,
        }
    }
}

/// Head/tail line counts used by preview truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    pub head_lines: usize,
    pub tail_lines: usize,
}

impl Default for Truncation {
    fn default() -> Self {
        Self {
            head_lines: 30,
            tail_lines: 20,
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Default per-command timeout when the agent doesn't pass one.
    pub default_timeout: Duration,
    /// Ceiling applied to any requested timeout.
    pub max_timeout: Duration,
    /// Quiescence window after a prompt-signature match before a command
    /// boundary is committed.
    pub prompt_grace: Duration,
    /// Terminal command records retained beyond any still running.
    pub max_history: usize,
    /// Hard cap on a single command's retained output bytes.
    pub buffer_max_bytes: usize,
    pub thresholds: Thresholds,
    pub truncation: Truncation,
    /// Outbound frame queue depth per viewer.
    pub viewer_queue_capacity: usize,
    /// Dropped-frame budget before a lagging viewer is disconnected.
    pub viewer_max_dropped: u32,
    /// SSH keepalive interval.
    pub keepalive_interval: Duration,
    /// Bind address for the viewer WebSocket server.
    pub listen_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(300),
            max_timeout: Duration::from_secs(MAX_TIMEOUT_SECONDS),
            prompt_grace: Duration::from_millis(300),
            max_history: 50,
            buffer_max_bytes: 8 * 1024 * 1024,
            thresholds: Thresholds::default(),
            truncation: Truncation::default(),
            viewer_queue_capacity: 256,
            viewer_max_dropped: 32,
            keepalive_interval: Duration::from_secs(30),
            listen_addr: "127.0.0.1:8090".parse().expect("static addr"),
        }
    }
}

impl Config {
    /// Build a config from defaults plus `TERMBRIDGE_*` overrides.
    ///
    /// Unparseable values fall back to the default for that field rather
    /// than failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(secs) = env_u64("TERMBRIDGE_DEFAULT_TIMEOUT") {
            cfg.default_timeout = Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECONDS));
        }
        if let Some(secs) = env_u64("TERMBRIDGE_MAX_TIMEOUT") {
            cfg.max_timeout = Duration::from_secs(secs.clamp(1, MAX_TIMEOUT_SECONDS));
        }
        if let Some(ms) = env_u64("TERMBRIDGE_PROMPT_GRACE_MS") {
            cfg.prompt_grace = Duration::from_millis(ms.clamp(50, 5000));
        }
        if let Some(n) = env_u64("TERMBRIDGE_MAX_HISTORY") {
            cfg.max_history = (n as usize).max(1);
        }
        if let Some(n) = env_u64("TERMBRIDGE_BUFFER_MAX_BYTES") {
            cfg.buffer_max_bytes = (n as usize).max(4096);
        }
        if let Some(n) = env_u64("TERMBRIDGE_THRESHOLD_INSTALL") {
            cfg.thresholds.install = n as usize;
        }
        if let Some(n) = env_u64("TERMBRIDGE_THRESHOLD_FILE_LISTING") {
            cfg.thresholds.file_listing = n as usize;
        }
        if let Some(n) = env_u64("TERMBRIDGE_THRESHOLD_LOG_SEARCH") {
            cfg.thresholds.log_search = n as usize;
        }
        if let Some(n) = env_u64("TERMBRIDGE_THRESHOLD_GENERIC") {
            cfg.thresholds.generic = n as usize;
        }
        if let Some(n) = env_u64("TERMBRIDGE_HEAD_LINES") {
            cfg.truncation.head_lines = (n as usize).max(1);
        }
        if let Some(n) = env_u64("TERMBRIDGE_TAIL_LINES") {
            cfg.truncation.tail_lines = (n as usize).max(1);
        }
        if let Some(n) = env_u64("TERMBRIDGE_VIEWER_QUEUE_CAPACITY") {
            cfg.viewer_queue_capacity = (n as usize).max(8);
        }
        if let Some(n) = env_u64("TERMBRIDGE_VIEWER_MAX_DROPPED") {
            cfg.viewer_max_dropped = n as u32;
        }
        if let Some(secs) = env_u64("TERMBRIDGE_KEEPALIVE_SECONDS") {
            cfg.keepalive_interval = Duration::from_secs(secs.clamp(5, 600));
        }
        if let Ok(raw) = std::env::var("TERMBRIDGE_LISTEN_ADDR") {
            if let Ok(addr) = raw.parse() {
                cfg.listen_addr = addr;
            } else {
                tracing::warn!(value = %raw, "ignoring unparseable TERMBRIDGE_LISTEN_ADDR");
            }
        }

        cfg
    }

    /// Clamp a requested timeout to the configured ceiling, falling back to
    /// the default when absent.
    #[must_use]
    pub fn effective_timeout(&self, requested_seconds: Option<u64>) -> Duration {
        match requested_seconds {
            Some(secs) => Duration::from_secs(secs).min(self.max_timeout),
            None => self.default_timeout.min(self.max_timeout),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}
