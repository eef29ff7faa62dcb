//! Post-call analysis via an external summariser LLM.
//!
//! The model is an external collaborator; the mock implementation keeps the
//! pipeline runnable offline and is the default in development.

use crate::config::PostCallConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Structured output of the call summariser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallAnalysis {
    pub summary: String,
    #[serde(default)]
    pub action_items: Vec<String>,
    /// Positive, Neutral, Negative
    pub sentiment: String,
    #[serde(default)]
    pub objections: Vec<String>,
    #[serde(default)]
    pub deal_risk_score: u8,
}

impl CallAnalysis {
    /// Positive -> 1.0, Neutral -> 0.5, Negative -> 0.0
    pub fn sentiment_score(&self) -> f64 {
        match self.sentiment.as_str() {
            "Positive" => 1.0,
            "Negative" => 0.0,
            _ => 0.5,
        }
    }
}

/// Render the analysis into the activity description pushed to the CRM.
pub fn render_summary(analysis: &CallAnalysis) -> String {
    let action_items = if analysis.action_items.is_empty() {
        "none".to_string()
    } else {
        format!("- {}", analysis.action_items.join("\n- "))
    };
    format!(
        "SUMMARY:\n{}\n\nACTION ITEMS:\n{}\n\nSENTIMENT: {}\nRISK SCORE: {}/10",
        analysis.summary, action_items, analysis.sentiment, analysis.deal_risk_score
    )
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> AppResult<CallAnalysis>;
}

/// Synthetic analysis for development and tests.
pub struct MockSummarizer;

#[async_trait]
impl Summarizer for MockSummarizer {
    async fn summarize(&self, _transcript: &str) -> AppResult<CallAnalysis> {
        Ok(CallAnalysis {
            summary: "The customer was interested in the Enterprise plan but had concerns about the timeline.".to_string(),
            action_items: vec![
                "Send technical specs".to_string(),
                "Schedule follow-up with CTO".to_string(),
            ],
            sentiment: "Neutral".to_string(),
            objections: vec!["Timeline".to_string()],
            deal_risk_score: 4,
        })
    }
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    transcript: &'a str,
}

/// HTTP client for the summariser service.
pub struct HttpSummarizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSummarizer {
    pub fn new(cfg: &PostCallConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.summarizer_timeout_secs))
                .build()
                .unwrap_or_default(),
            url: cfg.summarizer_url.clone(),
        }
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    async fn summarize(&self, transcript: &str) -> AppResult<CallAnalysis> {
        let response = self
            .client
            .post(&self.url)
            .json(&SummarizeRequest { transcript })
            .send()
            .await?
            .error_for_status()?;
        let analysis: CallAnalysis = response.json().await?;
        Ok(analysis)
    }
}

/// Build the summariser selected by configuration.
pub fn build(cfg: &PostCallConfig) -> AppResult<std::sync::Arc<dyn Summarizer>> {
    match cfg.summarizer.as_str() {
        "mock" => Ok(std::sync::Arc::new(MockSummarizer)),
        "http" => Ok(std::sync::Arc::new(HttpSummarizer::new(cfg))),
        other => Err(AppError::InvalidConfig(format!(
            "unknown summarizer mode: {other}"
        ))),
    }
}
