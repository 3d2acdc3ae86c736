//! Bounded message queues between producers (watch loop, external bridges)
//! and the agent loop.
//!
//! Publishes never block: a full queue or a closed bus drops the message
//! with a log record, so a stalled consumer cannot back-pressure the watch
//! tick.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Capacity of each direction's queue.
pub const QUEUE_CAPACITY: usize = 100;

// ─── Message ──────────────────────────────────────────────────────────────────

/// One routed message with its envelope metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(
        channel: impl Into<String>,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            channel: channel.into(),
            sender: sender.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

/// Bounded inbound queue (single consumer: the agent loop) and outbound
/// broadcast (any number of delivery bridges).
pub struct Bus {
    inbound_tx: mpsc::Sender<BusMessage>,
    inbound_rx: Mutex<mpsc::Receiver<BusMessage>>,
    outbound_tx: broadcast::Sender<BusMessage>,
    closed: AtomicBool,
}

impl Bus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(QUEUE_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Non-blocking publish toward the agent loop. Returns false when the
    /// message was dropped (bus closed or queue full).
    pub fn publish_inbound(&self, msg: BusMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(id = %msg.id, "dropping inbound message: bus closed");
            return false;
        }
        match self.inbound_tx.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(id = %msg.id, "dropping inbound message: queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(msg)) => {
                debug!(id = %msg.id, "dropping inbound message: receiver gone");
                false
            }
        }
    }

    /// Await the next inbound message; `None` on cancellation or close.
    pub async fn consume_inbound(&self, cancel: &CancellationToken) -> Option<BusMessage> {
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            msg = rx.recv() => msg,
            _ = cancel.cancelled() => None,
        }
    }

    /// Non-blocking publish toward delivery bridges.
    pub fn publish_outbound(&self, msg: BusMessage) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(id = %msg.id, "dropping outbound message: bus closed");
            return false;
        }
        // A send error only means there is no subscriber right now.
        self.outbound_tx.send(msg).is_ok()
    }

    /// Subscribe to outbound messages from this point on.
    pub fn subscribe_outbound(&self) -> OutboundSubscription {
        OutboundSubscription {
            rx: self.outbound_tx.subscribe(),
        }
    }

    /// Stop accepting publishes. In-flight consumers drain what is queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's view of the outbound stream.
pub struct OutboundSubscription {
    rx: broadcast::Receiver<BusMessage>,
}

impl OutboundSubscription {
    /// Await the next outbound message; `None` on cancellation or when the
    /// bus is gone. Lagged subscribers skip to the oldest retained message.
    pub async fn recv(&mut self, cancel: &CancellationToken) -> Option<BusMessage> {
        loop {
            tokio::select! {
                res = self.rx.recv() => match res {
                    Ok(msg) => return Some(msg),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "outbound subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
