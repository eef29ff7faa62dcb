//! NATS adapter for clustered deployments.
//!
//! Reconnect backoff and connection-level buffering are handled by the
//! `async-nats` client itself; this adapter only bridges subscriptions onto
//! the crate's lossy delivery channel.

use super::{BusMessage, MessageBus, Subscription};
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::info;

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| AppError::bus(format!("NATS connect to {url} failed: {e}")))?;
        info!(url, "Connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| AppError::bus(format!("publish on {subject} failed: {e}")))
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> AppResult<Subscription> {
        let mut subscriber = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await,
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| AppError::bus(format!("subscribe to {subject} failed: {e}")))?;

        let (tx, rx) = broadcast::channel(capacity.max(1));
        let pump = tokio::spawn(async move {
            while let Some(msg) = subscriber.next().await {
                let delivered = tx.send(BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload,
                });
                if delivered.is_err() {
                    // Subscription handle dropped; stop pumping.
                    let _ = subscriber.unsubscribe().await;
                    break;
                }
            }
        });

        struct AbortOnDrop(tokio::task::JoinHandle<()>);
        impl Drop for AbortOnDrop {
            fn drop(&mut self) {
                self.0.abort();
            }
        }

        Ok(Subscription::new(
            rx,
            subject.to_string(),
            Some(Box::new(AbortOnDrop(pump))),
        ))
    }

    async fn close(&self) -> AppResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| AppError::bus(format!("flush failed: {e}")))
    }
}
