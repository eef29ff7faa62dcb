//! Subject-addressed message bus.
//!
//! Every service communicates exclusively through this capability:
//! publish bytes on a subject, subscribe to a subject pattern (optionally
//! inside a queue-group so replicas share load). The in-process
//! implementation backs single-binary deployments and tests; the NATS
//! adapter backs clustered ones.

mod memory;
mod nats;

pub use memory::InProcessBus;
pub use nats::NatsBus;

use crate::config::BusConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Fire-and-forget publish.
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()>;

    /// Subscribe to a subject pattern (`*` matches one token, a trailing `>`
    /// matches the rest). Subscribers in the same queue-group split messages;
    /// `capacity` bounds the delivery buffer, with overflow dropping oldest.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> AppResult<Subscription>;

    /// Graceful shutdown.
    async fn close(&self) -> AppResult<()>;
}

/// Handle to an active subscription.
///
/// Delivery is lossy: if the subscriber falls behind its buffer, the
/// oldest undelivered messages are discarded and counted.
pub struct Subscription {
    rx: broadcast::Receiver<BusMessage>,
    subject: String,
    // Dropped together with the subscription; adapters use it to tear down
    // their delivery task or server-side interest.
    _guard: Option<Box<dyn std::any::Any + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: broadcast::Receiver<BusMessage>,
        subject: String,
        guard: Option<Box<dyn std::any::Any + Send>>,
    ) -> Self {
        Self {
            rx,
            subject,
            _guard: guard,
        }
    }

    /// Receive the next message, or `None` once the bus side is closed.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(subject = %self.subject, dropped = n, "Subscriber lagged, oldest messages dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Build the bus selected by configuration.
pub async fn connect(cfg: &BusConfig) -> AppResult<Arc<dyn MessageBus>> {
    match cfg.mode.as_str() {
        "memory" => Ok(Arc::new(InProcessBus::new())),
        "nats" => Ok(Arc::new(NatsBus::connect(&cfg.url).await?)),
        other => Err(AppError::InvalidConfig(format!("unknown bus mode: {other}"))),
    }
}

/// Subject pattern matching with NATS-style wildcards.
pub(crate) fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
