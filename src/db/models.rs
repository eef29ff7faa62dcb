use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Top-level tenant
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub api_key_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Agents and managers
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub org_id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a call record. Transitions only ever advance:
/// `in_progress -> completed -> {processed, crm_failed}`. A reconciliation
/// retry may still move `crm_failed -> processed`; only `processed` is
/// final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    InProgress,
    Completed,
    Processed,
    CrmFailed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Processed => "processed",
            Self::CrmFailed => "crm_failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "processed" => Self::Processed,
            "crm_failed" => Self::CrmFailed,
            _ => Self::InProgress,
        }
    }

    /// Whether `next` is a legal forward transition from `self`.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (Self::InProgress, Self::Completed)
                | (Self::Completed, Self::Processed)
                | (Self::Completed, Self::CrmFailed)
                | (Self::CrmFailed, Self::Processed)
        )
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single voice interaction session
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub org_id: String,
    pub user_id: String,
    /// Maps to the WebSocket session; unique
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Object-store key of the archived recording
    pub audio_object_key: Option<String>,
    pub status: String,
    pub customer_email: Option<String>,
    pub sentiment_score: Option<f64>,
}

impl Call {
    pub fn status(&self) -> CallStatus {
        CallStatus::from_str(&self.status)
    }
}

/// Granular, immutable speech segment for search/replay
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: String,
    pub call_id: String,
    /// Always PII-scrubbed before insertion
    pub text: String,
    /// Seconds from call start
    pub start_offset: f64,
    pub end_offset: f64,
    pub speaker: String,
    /// Vector-store point id, when the segment was embedded
    pub vector_id: Option<String>,
}

/// Wrapped tenant data-encryption key
#[derive(Debug, Clone, FromRow)]
pub struct TenantKeyRow {
    pub tenant_id: String,
    pub dek_encrypted: String,
    pub created_at: DateTime<Utc>,
}

/// New call creation request
#[derive(Debug, Clone)]
pub struct NewCall {
    pub org_id: String,
    pub user_id: String,
    pub session_id: String,
    pub customer_email: Option<String>,
}

/// New transcript segment, pre-resolution
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub call_id: String,
    pub text: String,
    pub start_offset: f64,
    pub end_offset: f64,
    pub speaker: String,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
