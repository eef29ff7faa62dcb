//! Wire envelopes shared by every service: WebSocket control frames,
//! bus payloads, and the subject naming scheme.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Negotiated audio format. Default: 16kHz, mono, PCM int16.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u8 {
    1
}

fn default_encoding() -> String {
    "pcm_s16le".to_string()
}

fn default_chunk_size() -> usize {
    4096
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            encoding: default_encoding(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Data rendered on the desktop overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayContent {
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub action_items: Vec<String>,
    #[serde(default = "default_sentiment")]
    pub sentiment: Option<String>,
    #[serde(default = "default_color")]
    pub color_hex: String,
}

fn default_sentiment() -> Option<String> {
    Some("neutral".to_string())
}

fn default_color() -> String {
    "#FFFFFF".to_string()
}

/// Control envelope exchanged over the client WebSocket and on
/// `ui.commands.{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame sent by the client to authenticate
    Handshake {
        token: String,
        client_version: String,
        audio_config: AudioConfig,
    },
    /// Server response to a valid handshake
    HandshakeAck {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
    },
    /// Keep-alive from the client
    Heartbeat,
    /// Client muted its microphone
    Mute,
    /// Client ends the call explicitly
    End {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Instruction for the client to show a hint
    OverlayTrigger {
        content: OverlayContent,
        #[serde(default = "default_display_duration")]
        display_duration_ms: u64,
    },
    /// Optimistic confirmation that a segment reached durable storage
    DataPersisted { id: String },
    Error { code: u16, message: String },
}

fn default_display_duration() -> u64 {
    5000
}

/// Published on `call.ended` when a session terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnded {
    pub session_id: String,
    pub reason: String,
    /// Unix seconds
    pub timestamp: i64,
}

impl CallEnded {
    pub fn now(session_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            reason: reason.into(),
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// Which side of the call produced an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    Customer,
}

impl Speaker {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Customer => "customer",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "customer" => Self::Customer,
            _ => Self::Agent,
        }
    }
}

/// Published on `transcript_event.{session_id}` for durable segment storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub session_id: String,
    /// PII-scrubbed utterance text
    pub text: String,
    /// Seconds from call start
    pub start_offset: f64,
    pub end_offset: f64,
    pub speaker: Speaker,
}

/// Bus subject naming scheme.
pub mod subjects {
    pub const AUDIO_RAW_WILDCARD: &str = "audio.raw.>";
    pub const TRANSCRIPT_EVENT_WILDCARD: &str = "transcript_event.>";
    pub const CALL_ENDED: &str = "call.ended";
    pub const AUDIT_WILDCARD: &str = "audit.>";
    pub const DEAD_LETTER: &str = "persistence.deadletter";

    pub fn audio_raw(session_id: &str) -> String {
        format!("audio.raw.{session_id}")
    }

    pub fn ui_commands(session_id: &str) -> String {
        format!("ui.commands.{session_id}")
    }

    pub fn transcript_event(session_id: &str) -> String {
        format!("transcript_event.{session_id}")
    }

    pub fn audit(action: &str) -> String {
        format!("audit.{action}")
    }

    /// Session id carried by an `audio.raw.{session_id}` subject.
    ///
    /// Session ids may themselves contain dots, so the prefix is stripped
    /// rather than splitting on the last token.
    pub fn session_from_audio(subject: &str) -> Option<&str> {
        subject.strip_prefix("audio.raw.").filter(|s| !s.is_empty())
    }

    /// Session id carried by a `transcript_event.{session_id}` subject.
    pub fn session_from_transcript(subject: &str) -> Option<&str> {
        subject
            .strip_prefix("transcript_event.")
            .filter(|s| !s.is_empty())
    }
}
