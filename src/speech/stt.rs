//! Speech-to-text capability.
//!
//! The model runs in an external inference service; this module holds the
//! RPC contract and the HTTP client. Greedy decoding with the session's
//! recent transcript as priming context keeps streaming latency bounded.

use crate::config::SttConfig;
use crate::error::AppResult;
use crate::speech::buffer::f32_to_pcm_s16le;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a snapshot of float32 samples. An empty string means no
    /// usable speech.
    async fn transcribe(&self, samples: &[f32], initial_prompt: &str) -> AppResult<String>;
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    /// Base64-encoded PCM s16le, mono
    audio_base64: String,
    sample_rate: u32,
    model: &'a str,
    device: &'a str,
    compute_type: &'a str,
    beam_size: u32,
    temperature: f32,
    condition_on_previous_text: bool,
    initial_prompt: &'a str,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
}

/// HTTP client for the STT inference service.
pub struct HttpTranscriber {
    client: reqwest::Client,
    cfg: SttConfig,
    sample_rate: u32,
}

impl HttpTranscriber {
    pub fn new(cfg: SttConfig, sample_rate: u32) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.timeout_secs))
                .build()
                .unwrap_or_default(),
            cfg,
            sample_rate,
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, samples: &[f32], initial_prompt: &str) -> AppResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }

        let request = TranscribeRequest {
            audio_base64: BASE64.encode(f32_to_pcm_s16le(samples)),
            sample_rate: self.sample_rate,
            model: &self.cfg.model_size,
            device: &self.cfg.device,
            compute_type: &self.cfg.compute_type,
            beam_size: 1,
            temperature: 0.0,
            condition_on_previous_text: false,
            initial_prompt,
        };

        let response = self
            .client
            .post(&self.cfg.url)
            .json(&request)
            .send()
            .await;

        match response {
            Ok(response) => {
                let body: TranscribeResponse = response.error_for_status()?.json().await?;
                Ok(body.text)
            }
            // A deadline miss yields an empty transcript; the stream moves on.
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.cfg.timeout_secs, "STT request timed out");
                Ok(String::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns a fixed script of transcripts, one per call, then empties.
    pub struct ScriptedTranscriber {
        script: Mutex<Vec<String>>,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedTranscriber {
        pub fn new(script: Vec<&str>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().rev().map(String::from).collect()),
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transcriber for ScriptedTranscriber {
        async fn transcribe(&self, _samples: &[f32], initial_prompt: &str) -> AppResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(initial_prompt.to_string());
            Ok(self.script.lock().unwrap().pop().unwrap_or_default())
        }
    }
}
