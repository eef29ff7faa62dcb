//! Main speech event loop: audio frames -> VAD -> buffered snapshots ->
//! STT -> scrub -> hint routing -> UI triggers and transcript events.
//!
//! Frames for all sessions arrive on one queue-group subscription. Each
//! session gets an inbox channel drained by a dedicated frame task (owner of
//! the ring buffer) and a transcription task that consumes the session's
//! snapshot FIFO. Different sessions transcribe in parallel up to the worker
//! pool size; one session never runs two transcriptions concurrently.

use crate::bus::{BusMessage, MessageBus};
use crate::config::SpeechConfig;
use crate::error::AppResult;
use crate::events::{subjects, ControlMessage, Speaker, TranscriptEvent};
use crate::hints::{CooldownMap, HintRouter};
use crate::security::PiiScrubber;
use crate::speech::buffer::{pcm_s16le_to_f32, PreallocatedRingBuffer};
use crate::speech::state::TranscriptStore;
use crate::speech::stt::Transcriber;
use crate::speech::vad::VoiceActivityDetector;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify, Semaphore};
use tracing::{debug, info, warn};

/// Queue-group shared by speech replicas: the bus hands each audio subject
/// to exactly one member.
pub const QUEUE_GROUP: &str = "speech_workers";

/// Per-session inbox depth. Audio ingress never blocks on a slow session;
/// overflow drops the frame.
const FRAME_INBOX: usize = 256;

/// Subscription buffer for the shared audio firehose.
const AUDIO_SUB_BUFFER: usize = 1024;

/// A drained window of buffered speech, ready for transcription.
struct Snapshot {
    samples: Vec<f32>,
    start_offset: f64,
    end_offset: f64,
}

/// Bounded FIFO between a session's frame task and its transcription task.
/// Overflow drops the oldest pending snapshot rather than blocking ingress.
struct SnapshotQueue {
    inner: Mutex<VecDeque<Snapshot>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl SnapshotQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, snapshot: Snapshot) -> bool {
        let dropped = {
            let mut queue = match self.inner.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            let dropped = if queue.len() >= self.capacity {
                queue.pop_front().is_some()
            } else {
                false
            };
            queue.push_back(snapshot);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    async fn pop(&self) -> Option<Snapshot> {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = match self.inner.lock() {
                    Ok(queue) => queue,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(snapshot) = queue.pop_front() {
                    return Some(snapshot);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

struct SessionHandle {
    frames_tx: mpsc::Sender<Bytes>,
    /// Milliseconds since pipeline start at the last received frame
    last_seen_ms: Arc<AtomicU64>,
}

pub struct SpeechPipeline {
    bus: Arc<dyn MessageBus>,
    transcriber: Arc<dyn Transcriber>,
    router: Arc<HintRouter>,
    transcripts: Arc<dyn TranscriptStore>,
    scrubber: Arc<PiiScrubber>,
    vad: Arc<dyn VoiceActivityDetector>,
    cfg: SpeechConfig,
    stt_permits: Arc<Semaphore>,
    sessions: DashMap<String, SessionHandle>,
    epoch: Instant,
}

impl SpeechPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn MessageBus>,
        transcriber: Arc<dyn Transcriber>,
        router: Arc<HintRouter>,
        transcripts: Arc<dyn TranscriptStore>,
        scrubber: Arc<PiiScrubber>,
        vad: Arc<dyn VoiceActivityDetector>,
        cfg: SpeechConfig,
    ) -> Arc<Self> {
        let stt_permits = Arc::new(Semaphore::new(cfg.stt_workers.max(1)));
        Arc::new(Self {
            bus,
            transcriber,
            router,
            transcripts,
            scrubber,
            vad,
            cfg,
            stt_permits,
            sessions: DashMap::new(),
            epoch: Instant::now(),
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Consume the audio firehose until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut sub = self
            .bus
            .subscribe(subjects::AUDIO_RAW_WILDCARD, Some(QUEUE_GROUP), AUDIO_SUB_BUFFER)
            .await?;
        info!(queue_group = QUEUE_GROUP, "Speech pipeline subscribed to audio stream");

        let sweep_secs = (self.cfg.idle_timeout_secs / 5).max(1);
        let mut sweep = tokio::time::interval(Duration::from_secs(sweep_secs));

        loop {
            tokio::select! {
                msg = sub.recv() => match msg {
                    Some(msg) => self.dispatch(msg),
                    None => break,
                },
                _ = sweep.tick() => self.evict_idle(),
                _ = shutdown.changed() => break,
            }
        }

        info!(active_sessions = self.sessions.len(), "Speech pipeline draining");
        self.sessions.clear();
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn dispatch(&self, msg: BusMessage) {
        let Some(session_id) = subjects::session_from_audio(&msg.subject) else {
            return;
        };

        let handle = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| self.spawn_session(session_id));
        handle.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);

        if handle.frames_tx.try_send(msg.payload).is_err() {
            // Never block audio ingress on a slow session; drop the frame.
            warn!(session_id, "Session inbox full, dropping audio frame");
        }
    }

    fn spawn_session(&self, session_id: &str) -> SessionHandle {
        info!(session_id, "Creating speech session");
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_INBOX);
        let queue = Arc::new(SnapshotQueue::new(self.cfg.snapshot_queue));

        tokio::spawn(run_frame_loop(
            session_id.to_string(),
            frames_rx,
            Arc::clone(&queue),
            Arc::clone(&self.vad),
            self.cfg.clone(),
        ));

        tokio::spawn(run_transcription_loop(TranscriptionLoop {
            session_id: session_id.to_string(),
            queue,
            bus: Arc::clone(&self.bus),
            transcriber: Arc::clone(&self.transcriber),
            router: Arc::clone(&self.router),
            transcripts: Arc::clone(&self.transcripts),
            scrubber: Arc::clone(&self.scrubber),
            stt_permits: Arc::clone(&self.stt_permits),
            prompt_suffix_chars: self.cfg.prompt_suffix_chars,
        }));

        SessionHandle {
            frames_tx,
            last_seen_ms: Arc::new(AtomicU64::new(self.now_ms())),
        }
    }

    /// Drop sessions with no frames for `idle_timeout_secs`. Closing the
    /// inbox lets the session's tasks drain and exit.
    fn evict_idle(&self) {
        let cutoff_ms = self.cfg.idle_timeout_secs * 1000;
        let now = self.now_ms();
        self.sessions.retain(|session_id, handle| {
            let idle = now.saturating_sub(handle.last_seen_ms.load(Ordering::Relaxed));
            if idle >= cutoff_ms {
                info!(session_id, idle_ms = idle, "Evicting idle speech session");
                false
            } else {
                true
            }
        });
    }
}

/// Owns the session's ring buffer; decodes, gates by VAD, and cuts
/// transcription snapshots.
async fn run_frame_loop(
    session_id: String,
    mut frames_rx: mpsc::Receiver<Bytes>,
    queue: Arc<SnapshotQueue>,
    vad: Arc<dyn VoiceActivityDetector>,
    cfg: SpeechConfig,
) {
    let mut ring = PreallocatedRingBuffer::new(cfg.capacity_samples());
    let sample_rate = cfg.sample_rate as f64;
    let min_samples = cfg.min_samples();
    let silence_flush_samples = (cfg.silence_flush_ms * cfg.sample_rate as u64 / 1000) as usize;

    // Stream position in samples across speech and silence, so offsets track
    // time from call start.
    let mut stream_pos: u64 = 0;
    let mut silence_run: usize = 0;

    while let Some(frame) = frames_rx.recv().await {
        let chunk = pcm_s16le_to_f32(&frame);
        if chunk.is_empty() {
            continue;
        }
        stream_pos += chunk.len() as u64;

        if !vad.has_speech(&chunk) {
            silence_run += chunk.len();
            // End of utterance: enough trailing silence and enough speech
            // buffered to be worth transcribing.
            if silence_run >= silence_flush_samples && ring.len() >= min_samples {
                cut_snapshot(&session_id, &mut ring, stream_pos, sample_rate, &queue);
                silence_run = 0;
            }
            continue;
        }

        silence_run = 0;
        ring.push(&chunk);

        if ring.len() >= min_samples {
            cut_snapshot(&session_id, &mut ring, stream_pos, sample_rate, &queue);
        }
    }

    // Inbox closed (session evicted or shutdown): flush the remainder.
    if ring.len() >= min_samples {
        cut_snapshot(&session_id, &mut ring, stream_pos, sample_rate, &queue);
    }
    queue.close();
    debug!(session_id, "Frame loop ended");
}

fn cut_snapshot(
    session_id: &str,
    ring: &mut PreallocatedRingBuffer,
    stream_pos: u64,
    sample_rate: f64,
    queue: &SnapshotQueue,
) {
    if ring.is_empty() {
        return;
    }
    let end_offset = stream_pos as f64 / sample_rate;
    let start_offset = end_offset - ring.len() as f64 / sample_rate;
    let snapshot = Snapshot {
        samples: ring.snapshot(),
        start_offset,
        end_offset,
    };
    ring.clear();
    if queue.push(snapshot) {
        warn!(session_id, "Snapshot queue full, dropped oldest pending snapshot");
    }
}

struct TranscriptionLoop {
    session_id: String,
    queue: Arc<SnapshotQueue>,
    bus: Arc<dyn MessageBus>,
    transcriber: Arc<dyn Transcriber>,
    router: Arc<HintRouter>,
    transcripts: Arc<dyn TranscriptStore>,
    scrubber: Arc<PiiScrubber>,
    stt_permits: Arc<Semaphore>,
    prompt_suffix_chars: usize,
}

/// Drains the session's snapshot FIFO strictly in order.
async fn run_transcription_loop(ctx: TranscriptionLoop) {
    let mut last_suffix = String::new();
    let mut cooldowns = CooldownMap::new();

    while let Some(snapshot) = ctx.queue.pop().await {
        let permit = match ctx.stt_permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let transcribed = ctx
            .transcriber
            .transcribe(&snapshot.samples, &last_suffix)
            .await;
        drop(permit);

        let text = match transcribed {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %ctx.session_id, error = %e, "Transcription failed, skipping snapshot");
                continue;
            }
        };
        if text.trim().is_empty() {
            continue;
        }

        // Scrub before anything durable sees the text.
        let scrubbed = ctx.scrubber.scrub(&text);
        info!(session_id = %ctx.session_id, chars = scrubbed.len(), "Transcript");

        if let Err(e) = ctx.transcripts.append(&ctx.session_id, &scrubbed).await {
            warn!(session_id = %ctx.session_id, error = %e, "Transcript cache append failed");
        }
        last_suffix = tail_chars(&scrubbed, ctx.prompt_suffix_chars);

        if let Some(trigger) = ctx.router.route(&scrubbed, &mut cooldowns).await {
            info!(session_id = %ctx.session_id, title = %trigger.title, "Trigger match");

            let overlay = ControlMessage::OverlayTrigger {
                content: trigger.overlay_content(),
                display_duration_ms: 5000,
            };
            publish_json(&ctx.bus, &subjects::ui_commands(&ctx.session_id), &overlay).await;

            let event = TranscriptEvent {
                session_id: ctx.session_id.clone(),
                text: scrubbed,
                start_offset: snapshot.start_offset,
                end_offset: snapshot.end_offset,
                speaker: Speaker::Agent,
            };
            publish_json(&ctx.bus, &subjects::transcript_event(&ctx.session_id), &event).await;
        }
    }
    debug!(session_id = %ctx.session_id, "Transcription loop ended");
}

async fn publish_json<T: serde::Serialize>(bus: &Arc<dyn MessageBus>, subject: &str, value: &T) {
    match serde_json::to_vec(value) {
        Ok(payload) => {
            if let Err(e) = bus.publish(subject, Bytes::from(payload)).await {
                warn!(subject, error = %e, "Bus publish failed, dropping message");
            }
        }
        Err(e) => warn!(subject, error = %e, "Failed to serialize bus payload"),
    }
}

/// Last `n` characters of `text`, on a char boundary.
fn tail_chars(text: &str, n: usize) -> String {
    let count = text.chars().count();
    if count <= n {
        return text.to_string();
    }
    text.chars().skip(count - n).collect()
}
