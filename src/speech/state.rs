//! Running-transcript cache.
//!
//! Each session's scrubbed transcript accumulates under `transcript:{id}`
//! with a 24-hour TTL. Redis backs it in deployments; the in-memory store
//! backs tests and single-binary runs without Redis.

use crate::error::AppResult;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;

const TRANSCRIPT_TTL_SECS: i64 = 86_400;

#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Append text to the session's running transcript and refresh its TTL.
    async fn append(&self, session_id: &str, text: &str) -> AppResult<()>;

    async fn get(&self, session_id: &str) -> AppResult<Option<String>>;
}

fn key(session_id: &str) -> String {
    format!("transcript:{session_id}")
}

pub struct RedisTranscriptStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisTranscriptStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl TranscriptStore for RedisTranscriptStore {
    async fn append(&self, session_id: &str, text: &str) -> AppResult<()> {
        let key = key(session_id);
        let mut con = self.manager.clone();
        con.append::<_, _, ()>(&key, format!(" {text}")).await?;
        con.expire::<_, ()>(&key, TRANSCRIPT_TTL_SECS).await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> AppResult<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = con.get(key(session_id)).await?;
        Ok(value)
    }
}

#[derive(Default)]
pub struct InMemoryTranscriptStore {
    map: DashMap<String, String>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append(&self, session_id: &str, text: &str) -> AppResult<()> {
        self.map
            .entry(key(session_id))
            .or_default()
            .push_str(&format!(" {text}"));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> AppResult<Option<String>> {
        Ok(self.map.get(&key(session_id)).map(|v| v.clone()))
    }
}
