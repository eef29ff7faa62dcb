//! Transcript-segment batching.
//!
//! Segments queue in memory and flush as one bulk insert either on the
//! periodic timer or when the queue reaches the batch size. Failed batches
//! re-enqueue with a bounded retry count; segments that exhaust retries go
//! to the dead-letter subject. Successful flushes publish one
//! `data_persisted` confirmation per segment for the optimistic UI.

use crate::bus::MessageBus;
use crate::db::{DbPool, NewSegment, SegmentRepo};
use crate::error::AppResult;
use crate::events::{subjects, ControlMessage};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::{info, warn};

struct PendingSegment {
    segment: NewSegment,
    session_id: String,
    attempts: u32,
}

#[derive(Serialize)]
struct DeadLetter<'a> {
    session_id: &'a str,
    call_id: &'a str,
    text: &'a str,
    start_offset: f64,
    end_offset: f64,
    attempts: u32,
}

pub struct SegmentBatcher {
    pool: DbPool,
    bus: Arc<dyn MessageBus>,
    queue: Mutex<Vec<PendingSegment>>,
    batch_size: usize,
    max_retries: u32,
}

impl SegmentBatcher {
    pub fn new(pool: DbPool, bus: Arc<dyn MessageBus>, batch_size: usize, max_retries: u32) -> Self {
        Self {
            pool,
            bus,
            queue: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            max_retries,
        }
    }

    pub fn depth(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Queue a resolved segment; flushes immediately once the batch fills.
    pub async fn enqueue(&self, session_id: String, segment: NewSegment) -> AppResult<()> {
        let should_flush = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push(PendingSegment {
                segment,
                session_id,
                attempts: 0,
            });
            queue.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Swap the queue atomically and bulk-insert everything taken.
    pub async fn flush(&self) -> AppResult<()> {
        let batch: Vec<PendingSegment> = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *queue)
        };
        if batch.is_empty() {
            return Ok(());
        }

        let segments: Vec<NewSegment> = batch.iter().map(|p| p.segment.clone()).collect();
        match SegmentRepo::insert_batch(&self.pool, &segments).await {
            Ok(ids) => {
                info!(count = ids.len(), "Flushed transcript segments");
                for (pending, id) in batch.iter().zip(ids) {
                    self.confirm(&pending.session_id, &id).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(count = batch.len(), error = %e, "Batch flush failed");
                self.requeue_or_dead_letter(batch).await;
                Ok(())
            }
        }
    }

    async fn confirm(&self, session_id: &str, segment_id: &str) {
        let msg = ControlMessage::DataPersisted {
            id: segment_id.to_string(),
        };
        if let Ok(payload) = serde_json::to_vec(&msg) {
            let _ = self
                .bus
                .publish(&subjects::ui_commands(session_id), Bytes::from(payload))
                .await;
        }
    }

    async fn requeue_or_dead_letter(&self, batch: Vec<PendingSegment>) {
        let mut keep = Vec::new();
        for mut pending in batch {
            pending.attempts += 1;
            if pending.attempts > self.max_retries {
                warn!(
                    session_id = %pending.session_id,
                    attempts = pending.attempts,
                    "Segment exhausted retries, dead-lettering"
                );
                let letter = DeadLetter {
                    session_id: &pending.session_id,
                    call_id: &pending.segment.call_id,
                    text: &pending.segment.text,
                    start_offset: pending.segment.start_offset,
                    end_offset: pending.segment.end_offset,
                    attempts: pending.attempts,
                };
                if let Ok(payload) = serde_json::to_vec(&letter) {
                    let _ = self
                        .bus
                        .publish(subjects::DEAD_LETTER, Bytes::from(payload))
                        .await;
                }
            } else {
                keep.push(pending);
            }
        }
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.extend(keep);
    }
}
