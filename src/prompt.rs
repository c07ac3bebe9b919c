//! Prompt boundary detection.
//!
//! No shell parser: the prompt's bytes are learned once at connect time by
//! probing the idle terminal, and command completion is detected as "the
//! learned signature is back at the end of the stream and nothing else has
//! arrived for a grace interval". The grace window is what makes
//! prompt-looking substrings in chatty output harmless: they never sit at
//! a quiescent end-of-buffer.

use std::collections::VecDeque;

use crate::filter::strip_ansi;
use crate::session::MARKER_PREFIX;

/// Rolling window size. A few KiB is enough to hold the tail of any sane
/// prompt plus trailing output.
const WINDOW_BYTES: usize = 4096;

/// Stateful detector over a streaming suffix of recent shell bytes.
#[derive(Debug)]
pub struct PromptDetector {
    window: VecDeque<u8>,
    signature: Option<String>,
}

impl PromptDetector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: VecDeque::new(),
            signature: None,
        }
    }

    /// Append bytes to the rolling window.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.window.extend(bytes.iter().copied());
        while self.window.len() > WINDOW_BYTES {
            self.window.pop_front();
        }
    }

    /// Current window rendered as ANSI-stripped text.
    fn window_text(&self) -> String {
        let (a, b) = self.window.as_slices();
        let mut raw = Vec::with_capacity(self.window.len());
        raw.extend_from_slice(a);
        raw.extend_from_slice(b);
        strip_ansi(&String::from_utf8_lossy(&raw))
    }

    /// Learn the prompt signature from the idle terminal: the last
    /// non-empty line of the window that isn't one of our own markers.
    ///
    /// Returns the learned signature, or `None` if the window holds nothing
    /// usable (the caller should retry after more output arrives).
    pub fn learn_signature(&mut self) -> Option<String> {
        let text = self.window_text();
        let sig = text
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.contains(MARKER_PREFIX))?
            .to_string();
        self.signature = Some(sig.clone());
        Some(sig)
    }

    /// Install a known signature (reconnect paths, tests).
    pub fn set_signature(&mut self, signature: impl Into<String>) {
        self.signature = Some(signature.into());
    }

    #[must_use]
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Whether the window's tail currently looks like the interactive
    /// prompt. The caller still owes the grace-interval quiescence check
    /// before committing a boundary.
    #[must_use]
    pub fn matches_prompt(&self) -> bool {
        let Some(sig) = self.signature.as_deref() else {
            return false;
        };
        // A prompt sits at end-of-buffer without a trailing newline; output
        // that merely ends on a newline is never a boundary.
        if matches!(self.window.back().copied(), Some(b'\n' | b'\r') | None) {
            return false;
        }
        let text = self.window_text();
        let Some(last) = text.lines().next_back().map(str::trim) else {
            return false;
        };
        if last.is_empty() {
            return false;
        }
        if last == sig {
            return true;
        }
        // Prompts commonly embed the working directory, which moves under
        // `cd`. Accept a changed prompt when it ends with the same
        // terminator character as the learned one ("$", "#", ">").
        match sig.chars().next_back() {
            Some(term @ ('$' | '#' | '>' | '%')) => last.ends_with(term),
            _ => false,
        }
    }

    /// Clear the window after a boundary is committed. The signature is
    /// kept for the session's lifetime.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new()
    }
}
