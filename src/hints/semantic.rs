//! Semantic hint matching: external sentence embedder + vector index.
//!
//! Both are external collaborators behind traits; the in-memory index keeps
//! the full pipeline runnable without a vector store and doubles as the test
//! double. Embeddings are memoised in an LRU so repeated short utterances
//! skip the embedder round-trip.

use super::Trigger;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Embedding dimension of the sentence model (all-MiniLM-L6-v2 family).
pub const EMBEDDING_DIM: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>>;
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Replace the indexed rules with the given (vector, trigger) points.
    async fn upsert(&self, points: Vec<(Vec<f32>, Trigger)>) -> AppResult<()>;

    /// Top-1 nearest neighbour by cosine distance.
    async fn nearest(&self, vector: &[f32]) -> AppResult<Option<(f32, Trigger)>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// HTTP client for the external sentence embedder.
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
}

impl HttpEmbedder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> AppResult<Vec<f32>> {
        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { text })
            .send()
            .await?
            .error_for_status()?;
        let body: EmbedResponse = response.json().await?;
        if body.embedding.len() != EMBEDDING_DIM {
            return Err(AppError::Internal(format!(
                "embedder returned {} dims, expected {EMBEDDING_DIM}",
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }
}

/// Cosine-distance vector index held in process memory.
pub struct InMemoryVectorIndex {
    points: Mutex<Vec<(Vec<f32>, Trigger)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, new_points: Vec<(Vec<f32>, Trigger)>) -> AppResult<()> {
        let mut points = self.points.lock().await;
        *points = new_points;
        Ok(())
    }

    async fn nearest(&self, vector: &[f32]) -> AppResult<Option<(f32, Trigger)>> {
        let points = self.points.lock().await;
        let mut best: Option<(f32, &Trigger)> = None;
        for (candidate, trigger) in points.iter() {
            let distance = cosine_distance(vector, candidate);
            if best.map_or(true, |(d, _)| distance < d) {
                best = Some((distance, trigger));
            }
        }
        Ok(best.map(|(d, t)| (d, t.clone())))
    }
}

/// Embeds text (with LRU memoisation) and looks up the nearest hint rule.
pub struct SemanticMatcher {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    cache: Mutex<LruCache<String, Vec<f32>>>,
    threshold: f32,
}

impl SemanticMatcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        cache_size: usize,
        threshold: f32,
    ) -> Self {
        Self {
            embedder,
            index,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_size.max(1)).expect("cache size clamped to >= 1"),
            )),
            threshold,
        }
    }

    async fn embedding_for(&self, text: &str) -> AppResult<Vec<f32>> {
        if let Some(vector) = self.cache.lock().await.get(text) {
            return Ok(vector.clone());
        }
        let vector = self.embedder.embed(text).await?;
        self.cache
            .lock()
            .await
            .put(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Top-1 lookup gated by the distance threshold. Embedder or index
    /// failures degrade to no match; the fast path already ran.
    pub async fn lookup(&self, text: &str) -> Option<Trigger> {
        let vector = match self.embedding_for(text).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Embedding failed, skipping semantic match");
                return None;
            }
        };
        match self.index.nearest(&vector).await {
            Ok(Some((distance, trigger))) if distance <= self.threshold => {
                debug!(distance, title = %trigger.title, "Semantic hint match");
                Some(trigger)
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Vector lookup failed");
                None
            }
        }
    }
}
