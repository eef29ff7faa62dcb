//! Durability worker: archives raw call audio and batches transcript
//! segments into the relational store.
//!
//! Audio subscribes under its own queue-group so it receives a copy of the
//! stream independently of the speech workers. Finalisation fires on
//! `call.ended` or after the idle window with no frames.

pub mod batcher;
pub mod spool;

pub use batcher::SegmentBatcher;
pub use spool::{ArchivedAudio, AudioSpool, SpoolConfig};

use crate::bus::{BusMessage, MessageBus};
use crate::config::PersistenceConfig;
use crate::db::{self, CallRepo, CallStatus, DbPool, NewSegment};
use crate::error::AppResult;
use crate::events::{subjects, CallEnded, TranscriptEvent};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Queue-group names. Distinct from the speech group so both receive the
/// audio stream; one member per group gets each message.
pub const ARCHIVER_GROUP: &str = "persistence_archiver";
pub const SEGMENTS_GROUP: &str = "persistence_segments";
pub const FINALIZER_GROUP: &str = "persistence_finalizer";

pub struct PersistenceWorker {
    bus: Arc<dyn MessageBus>,
    pool: DbPool,
    spool: AudioSpool,
    batcher: SegmentBatcher,
    cfg: PersistenceConfig,
    /// session_id -> call_id resolution cache
    call_ids: DashMap<String, String>,
}

impl PersistenceWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        pool: DbPool,
        spool: AudioSpool,
        cfg: PersistenceConfig,
    ) -> Arc<Self> {
        let batcher = SegmentBatcher::new(
            pool.clone(),
            Arc::clone(&bus),
            cfg.batch_size,
            cfg.max_flush_retries,
        );
        Arc::new(Self {
            bus,
            pool,
            spool,
            batcher,
            cfg,
            call_ids: DashMap::new(),
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut audio_sub = self
            .bus
            .subscribe(subjects::AUDIO_RAW_WILDCARD, Some(ARCHIVER_GROUP), 1024)
            .await?;
        let mut transcript_sub = self
            .bus
            .subscribe(subjects::TRANSCRIPT_EVENT_WILDCARD, Some(SEGMENTS_GROUP), 512)
            .await?;
        let mut ended_sub = self
            .bus
            .subscribe(subjects::CALL_ENDED, Some(FINALIZER_GROUP), 64)
            .await?;
        info!("Persistence worker subscribed");

        let mut flush_tick =
            tokio::time::interval(Duration::from_secs(self.cfg.flush_interval_secs.max(1)));
        let mut idle_tick = tokio::time::interval(Duration::from_secs(
            (self.cfg.finalization_idle_secs / 2).max(1),
        ));

        loop {
            tokio::select! {
                msg = audio_sub.recv() => match msg {
                    Some(msg) => self.handle_audio(&msg).await,
                    None => break,
                },
                msg = transcript_sub.recv() => {
                    if let Some(msg) = msg {
                        self.handle_transcript(&msg).await;
                    }
                }
                msg = ended_sub.recv() => {
                    if let Some(msg) = msg {
                        self.handle_call_ended(&msg).await;
                    }
                }
                _ = flush_tick.tick() => {
                    if let Err(e) = self.batcher.flush().await {
                        warn!(error = %e, "Periodic flush failed");
                    }
                }
                _ = idle_tick.tick() => self.finalize_idle().await,
                _ = shutdown.changed() => break,
            }
        }

        self.drain().await;
        Ok(())
    }

    /// Graceful shutdown: flush pending segments, finalise every open spool,
    /// and announce the call ends so downstream workers run their pipelines.
    async fn drain(&self) {
        info!("Persistence worker draining");
        if let Err(e) = self.batcher.flush().await {
            warn!(error = %e, "Final flush failed");
        }
        for session_id in self.spool.open_sessions().await {
            self.finalize_session(&session_id).await;
            let payload = CallEnded::now(&session_id, "shutdown");
            if let Ok(bytes) = serde_json::to_vec(&payload) {
                let _ = self
                    .bus
                    .publish(subjects::CALL_ENDED, bytes::Bytes::from(bytes))
                    .await;
            }
        }
    }

    async fn handle_audio(&self, msg: &BusMessage) {
        let Some(session_id) = subjects::session_from_audio(&msg.subject) else {
            return;
        };
        if let Err(e) = self.spool.append(session_id, &msg.payload).await {
            warn!(session_id, error = %e, "Spool append failed, frame dropped");
        }
    }

    async fn handle_transcript(&self, msg: &BusMessage) {
        let event: TranscriptEvent = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(subject = %msg.subject, error = %e, "Malformed transcript event dropped");
                return;
            }
        };

        let Some(call_id) = self.resolve_call_id(&event.session_id).await else {
            warn!(session_id = %event.session_id, "No call for transcript event, dropping");
            return;
        };

        let segment = NewSegment {
            call_id,
            text: event.text,
            start_offset: event.start_offset,
            end_offset: event.end_offset,
            speaker: event.speaker.as_str().to_string(),
        };
        if let Err(e) = self.batcher.enqueue(event.session_id, segment).await {
            warn!(error = %e, "Segment enqueue failed");
        }
    }

    /// Cheap session -> call lookup, optionally bootstrapping dev fixtures
    /// so foreign keys hold before the real provisioning path exists.
    async fn resolve_call_id(&self, session_id: &str) -> Option<String> {
        if let Some(call_id) = self.call_ids.get(session_id) {
            return Some(call_id.clone());
        }

        let call = match CallRepo::get_by_session_id(&self.pool, session_id).await {
            Ok(call) => call,
            Err(e) => {
                warn!(session_id, error = %e, "Call lookup failed");
                return None;
            }
        };

        let call = match call {
            Some(call) => Some(call),
            None if self.cfg.seed_fixtures => {
                match db::ensure_fixtures(&self.pool, session_id).await {
                    Ok(call) => {
                        debug!(session_id, "Seeded fixture rows for unknown session");
                        Some(call)
                    }
                    Err(e) => {
                        warn!(session_id, error = %e, "Fixture bootstrap failed");
                        None
                    }
                }
            }
            None => None,
        }?;

        self.call_ids
            .insert(session_id.to_string(), call.id.clone());
        Some(call.id)
    }

    async fn handle_call_ended(&self, msg: &BusMessage) {
        let payload: CallEnded = match serde_json::from_slice(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Malformed call.ended dropped");
                return;
            }
        };
        info!(session_id = %payload.session_id, reason = %payload.reason, "Finalising call");
        // Flush first so the call's segments are durable before the status
        // moves on.
        if let Err(e) = self.batcher.flush().await {
            warn!(error = %e, "Flush on call end failed");
        }
        self.finalize_session(&payload.session_id).await;
    }

    async fn finalize_idle(&self) {
        let idle = Duration::from_secs(self.cfg.finalization_idle_secs);
        for session_id in self.spool.idle_sessions(idle).await {
            info!(session_id, "Finalising idle audio spool");
            self.finalize_session(&session_id).await;
        }
    }

    async fn finalize_session(&self, session_id: &str) {
        let archived = match self.spool.finalize(session_id).await {
            Ok(Some(archived)) => archived,
            Ok(None) => {
                debug!(session_id, "No spool to finalise");
                return;
            }
            Err(e) => {
                warn!(session_id, error = %e, "Audio finalisation failed, spool retained");
                return;
            }
        };

        match CallRepo::get_by_session_id(&self.pool, session_id).await {
            Ok(Some(call)) => {
                if let Err(e) =
                    CallRepo::set_archived(&self.pool, &call.id, &archived.object_key).await
                {
                    warn!(session_id, error = %e, "Failed to record audio key");
                }
                match CallRepo::advance_status(&self.pool, &call.id, CallStatus::Completed).await {
                    Ok(true) => debug!(session_id, "Call marked completed"),
                    Ok(false) => debug!(session_id, "Call already past completed"),
                    Err(e) => warn!(session_id, error = %e, "Status advance failed"),
                }
            }
            Ok(None) => debug!(session_id, "Archived audio for audio-only session"),
            Err(e) => warn!(session_id, error = %e, "Call lookup failed after archive"),
        }
    }
}
