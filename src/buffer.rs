//! Bounded command output buffer.
//!
//! A command may produce far more than we are willing to retain. The buffer
//! keeps the head and the tail of the stream intact and drops the middle,
//! recording how much was elided. Appends are cheap; the head fills once and
//! the tail behaves as a byte ring.

use std::collections::VecDeque;

/// Head-keep/tail-keep byte buffer with a recorded gap.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_cap: usize,
    tail_cap: usize,
    /// Bytes dropped between head and tail.
    gap_bytes: u64,
    total_bytes: u64,
}

impl OutputBuffer {
    /// Split `max_bytes` evenly between head and tail retention.
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        let head_cap = (max_bytes / 2).max(1);
        let tail_cap = (max_bytes - head_cap).max(1);
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_cap,
            tail_cap,
            gap_bytes: 0,
            total_bytes: 0,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.total_bytes += chunk.len() as u64;

        let mut rest = chunk;
        if self.head.len() < self.head_cap {
            let take = (self.head_cap - self.head.len()).min(rest.len());
            self.head.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        if rest.is_empty() {
            return;
        }

        // Past the head cap everything flows through the tail ring; bytes
        // pushed out of the ring widen the gap.
        self.tail.extend(rest.iter().copied());
        while self.tail.len() > self.tail_cap {
            self.tail.pop_front();
            self.gap_bytes += 1;
        }
    }

    /// Total bytes ever appended, including any elided middle.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Bytes currently retained.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    #[must_use]
    pub fn gap_bytes(&self) -> u64 {
        self.gap_bytes
    }

    /// Whether the middle of the stream has been dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.gap_bytes > 0
    }

    /// Newline count across the retained bytes; a cheap line-count hint.
    #[must_use]
    pub fn line_hint(&self) -> usize {
        self.head.iter().filter(|&&b| b == b'\n').count()
            + self.tail.iter().filter(|&&b| b == b'\n').count()
    }

    /// Materialise the retained stream. When truncated, the elided middle
    /// is replaced with a marker naming the dropped byte count.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.retained_bytes() + 64);
        out.extend_from_slice(&self.head);
        if self.truncated() {
            out.extend_from_slice(
                format!("\n... [{} bytes elided] ...\n", self.gap_bytes).as_bytes(),
            );
        }
        let (a, b) = self.tail.as_slices();
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_bytes == 0
    }
}
