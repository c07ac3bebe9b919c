//! Fan-out of the shell byte stream to attached viewers.
//!
//! One producer (the session drain task) offers every chunk to every viewer
//! currently attached. Viewer queues are bounded and sends never block: a
//! viewer that cannot keep up accumulates dropped frames and is disconnected
//! once it exceeds the lag budget, so the agent pipeline always makes
//! progress. New viewers see bytes from their attach time forward; there is
//! no backfill.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Server → viewer frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Output { data: String },
    Status { connected: bool },
}

/// Viewer → server frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

struct ViewerSlot {
    tx: mpsc::Sender<ServerFrame>,
    dropped_frames: Arc<AtomicU32>,
}

/// The dynamically changing set of attached viewers.
#[derive(Clone)]
pub struct ViewerSet {
    viewers: Arc<RwLock<HashMap<Uuid, ViewerSlot>>>,
    queue_capacity: usize,
    max_dropped: u32,
}

impl ViewerSet {
    #[must_use]
    pub fn new(queue_capacity: usize, max_dropped: u32) -> Self {
        Self {
            viewers: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity,
            max_dropped,
        }
    }

    /// Attach a viewer; returns its id and the outbound frame stream.
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<ServerFrame>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.viewers.write().await.insert(
            id,
            ViewerSlot {
                tx,
                dropped_frames: Arc::new(AtomicU32::new(0)),
            },
        );
        tracing::info!(viewer = %id, "viewer attached");
        (id, rx)
    }

    /// Detach a viewer. Idempotent: detaching an unknown or already-removed
    /// id is a no-op.
    pub async fn deregister(&self, id: Uuid) {
        if self.viewers.write().await.remove(&id).is_some() {
            tracing::info!(viewer = %id, "viewer detached");
        }
    }

    /// Offer one output chunk to every attached viewer without blocking.
    /// Viewers whose queues overflow past the lag budget are disconnected.
    pub async fn broadcast(&self, chunk: &Bytes) {
        let data = String::from_utf8_lossy(chunk).into_owned();
        let mut lagging: Vec<Uuid> = Vec::new();

        {
            let viewers = self.viewers.read().await;
            for (id, slot) in viewers.iter() {
                match slot.tx.try_send(ServerFrame::Output { data: data.clone() }) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let dropped = slot.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                        if dropped > self.max_dropped {
                            lagging.push(*id);
                        }
                    }
                    Err(TrySendError::Closed(_)) => lagging.push(*id),
                }
            }
        }

        if !lagging.is_empty() {
            let mut viewers = self.viewers.write().await;
            for id in lagging {
                if viewers.remove(&id).is_some() {
                    tracing::warn!(viewer = %id, "disconnecting lagging viewer");
                }
            }
        }
    }

    /// Send a terminal status frame to every viewer and drop them all.
    /// Closing the senders ends each viewer's outbound pump.
    pub async fn close_all(&self) {
        let mut viewers = self.viewers.write().await;
        for (id, slot) in viewers.drain() {
            let _ = slot.tx.try_send(ServerFrame::Status { connected: false });
            tracing::debug!(viewer = %id, "viewer closed with session");
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }
}
