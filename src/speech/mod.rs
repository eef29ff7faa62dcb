//! Per-session streaming speech pipeline: VAD, buffering, batched STT, and
//! hint routing back to the client overlay.

pub mod buffer;
pub mod processor;
pub mod state;
pub mod stt;
pub mod vad;

pub use buffer::PreallocatedRingBuffer;
pub use processor::SpeechPipeline;
pub use state::{InMemoryTranscriptStore, RedisTranscriptStore, TranscriptStore};
pub use stt::{HttpTranscriber, Transcriber};
pub use vad::{EnergyVad, VoiceActivityDetector};
