//! Conversational cue matching.
//!
//! Given a scrubbed utterance, the router returns at most one trigger for the
//! agent's overlay. The keyword regex path runs first and wins in rule
//! declaration order; the semantic path (embedding + vector lookup) only runs
//! when no keyword matched. A per-session cooldown suppresses rapid re-fires
//! of the same hint title.

pub mod semantic;

pub use semantic::{
    Embedder, HttpEmbedder, InMemoryVectorIndex, SemanticMatcher, VectorIndex, EMBEDDING_DIM,
};

use crate::events::OverlayContent;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Overlay payload attached to a hint rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub title: String,
    pub message: String,
    pub color_hex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl Trigger {
    pub fn overlay_content(&self) -> OverlayContent {
        OverlayContent {
            title: self.title.clone(),
            message: self.message.clone(),
            action_items: Vec::new(),
            sentiment: Some("neutral".to_string()),
            color_hex: self.color_hex.clone(),
        }
    }
}

/// Knowledge-base entry: keywords for the fast path, example phrases for the
/// embedding path, and the trigger delivered on a match.
#[derive(Debug, Clone)]
pub struct HintRule {
    pub keywords: Vec<String>,
    /// Example phrases, embedded and indexed for the semantic path
    pub phrases: String,
    pub trigger: Trigger,
    compiled: Regex,
}

impl HintRule {
    pub fn new(keywords: Vec<String>, phrases: impl Into<String>, trigger: Trigger) -> Self {
        // \b(budget|price|cost)\b, case-insensitive
        let escaped: Vec<String> = keywords.iter().map(|k| regex::escape(k)).collect();
        let pattern = format!(r"(?i)\b({})\b", escaped.join("|"));
        let compiled = Regex::new(&pattern).expect("keyword alternation is always valid");
        Self {
            keywords,
            phrases: phrases.into(),
            trigger,
            compiled,
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.compiled.is_match(text)
    }
}

/// Timestamps of the last delivery per hint title, owned by the session.
pub type CooldownMap = HashMap<String, Instant>;

pub struct HintRouter {
    rules: Vec<HintRule>,
    semantic: Option<SemanticMatcher>,
    cooldown: Duration,
}

impl HintRouter {
    pub fn new(rules: Vec<HintRule>, semantic: Option<SemanticMatcher>, cooldown: Duration) -> Self {
        Self {
            rules,
            semantic,
            cooldown,
        }
    }

    pub fn rules(&self) -> &[HintRule] {
        &self.rules
    }

    /// Route a scrubbed utterance to at most one trigger.
    ///
    /// A candidate inside its cooldown window is suppressed entirely rather
    /// than falling through to lower-priority rules.
    pub async fn route(&self, text: &str, cooldowns: &mut CooldownMap) -> Option<Trigger> {
        let candidate = self.match_text(text).await?;

        let now = Instant::now();
        if let Some(last) = cooldowns.get(&candidate.title) {
            if now.duration_since(*last) < self.cooldown {
                debug!(title = %candidate.title, "Trigger suppressed by cooldown");
                return None;
            }
        }
        cooldowns.insert(candidate.title.clone(), now);
        Some(candidate)
    }

    async fn match_text(&self, text: &str) -> Option<Trigger> {
        // Fast path: first keyword match wins, in declaration order.
        for rule in &self.rules {
            if rule.matches(text) {
                debug!(title = %rule.trigger.title, "Keyword hint match");
                return Some(rule.trigger.clone());
            }
        }
        // Slow path only when the cheap one found nothing.
        match &self.semantic {
            Some(matcher) => matcher.lookup(text).await,
            None => None,
        }
    }
}

/// The built-in sales playbook. Deployments replace this from their knowledge
/// base; it also seeds the vector index at startup.
pub fn default_playbook() -> Vec<HintRule> {
    vec![
        HintRule::new(
            vec![
                "budget".to_string(),
                "price".to_string(),
                "expensive".to_string(),
                "cost".to_string(),
            ],
            "The price is too high, it is very expensive, cost is an issue.",
            Trigger {
                title: "Pricing Objection".to_string(),
                message: "Pivot to ROI: 'If we could save you 20 hours a week, is the price justified?'".to_string(),
                color_hex: "#FFA500".to_string(),
                action: None,
            },
        ),
        HintRule::new(
            vec![
                "competitor".to_string(),
                "other solution".to_string(),
                "using jira".to_string(),
            ],
            "We are using a competitor, we use Jira, we use Salesforce.",
            Trigger {
                title: "Competitor Mention".to_string(),
                message: "Highlight our AI features: 'Does your current tool offer real-time coaching?'".to_string(),
                color_hex: "#FF0000".to_string(),
                action: None,
            },
        ),
        HintRule::new(
            vec![
                "my manager".to_string(),
                "approval".to_string(),
                "proposal".to_string(),
            ],
            "I need to ask my manager, I need approval, send me a proposal.",
            Trigger {
                title: "Decision Maker Gate".to_string(),
                message: "Secure the next step: 'When will you meet your manager? Can I join?'".to_string(),
                color_hex: "#0000FF".to_string(),
                action: None,
            },
        ),
        HintRule::new(
            vec![
                "timeline".to_string(),
                "start date".to_string(),
                "implementation".to_string(),
            ],
            "When can we start? How long is implementation? What is the timeline?",
            Trigger {
                title: "Buying Signal".to_string(),
                message: "Close now: 'We can deploy within 24 hours. Shall I send the contract?'".to_string(),
                color_hex: "#00FF00".to_string(),
                action: None,
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn router() -> HintRouter {
        HintRouter::new(default_playbook(), None, Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_keyword_match() {
        let router = router();
        let mut cooldowns = CooldownMap::new();

        let trigger = router
            .route("the price is too high for our budget", &mut cooldowns)
            .await
            .unwrap();
        assert_eq!(trigger.title, "Pricing Objection");
    }

    #[tokio::test]
    async fn test_no_match() {
        let router = router();
        let mut cooldowns = CooldownMap::new();
        assert!(router.route("hello world", &mut cooldowns).await.is_none());
    }

    #[tokio::test]
    async fn test_case_insensitive_word_boundaries() {
        let router = router();
        let mut cooldowns = CooldownMap::new();

        assert!(router
            .route("What is the TIMELINE here?", &mut cooldowns)
            .await
            .is_some());

        // "cost" inside "costume" must not match
        let mut fresh = CooldownMap::new();
        assert!(router
            .route("nice costume you have", &mut fresh)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_declaration_order_wins() {
        let router = router();
        let mut cooldowns = CooldownMap::new();

        // Text matches both pricing (rule 0) and timeline (rule 3)
        let trigger = router
            .route("the budget depends on the timeline", &mut cooldowns)
            .await
            .unwrap();
        assert_eq!(trigger.title, "Pricing Objection");
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_fire() {
        let router = router();
        let mut cooldowns = CooldownMap::new();

        assert!(router
            .route("this is too expensive", &mut cooldowns)
            .await
            .is_some());
        assert!(router
            .route("really too expensive", &mut cooldowns)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_cooldown_is_per_title() {
        let router = router();
        let mut cooldowns = CooldownMap::new();

        assert!(router
            .route("this is too expensive", &mut cooldowns)
            .await
            .is_some());
        // A different rule still fires inside the pricing cooldown
        assert!(router
            .route("what is the timeline", &mut cooldowns)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let router = HintRouter::new(default_playbook(), None, Duration::from_millis(10));
        let mut cooldowns = CooldownMap::new();

        assert!(router
            .route("this is too expensive", &mut cooldowns)
            .await
            .is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(router
            .route("still too expensive", &mut cooldowns)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_cooldowns() {
        let router = router();
        let mut session_a = CooldownMap::new();
        let mut session_b = CooldownMap::new();

        assert!(router
            .route("too expensive", &mut session_a)
            .await
            .is_some());
        assert!(router
            .route("too expensive", &mut session_b)
            .await
            .is_some());
    }

    proptest! {
        // Two consecutive matches of the same rule inside the cooldown
        // window yield exactly one trigger.
        #[test]
        fn prop_consecutive_matches_fire_once(
            keyword in prop::sample::select(vec!["budget", "price", "expensive", "cost"]),
            filler in "[a-z ]{0,20}",
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async {
                let router = HintRouter::new(
                    default_playbook(),
                    None,
                    Duration::from_secs(10),
                );
                let mut cooldowns = CooldownMap::new();
                let text = format!("{filler} {keyword}");

                let mut fired = 0;
                for _ in 0..2 {
                    if router.route(&text, &mut cooldowns).await.is_some() {
                        fired += 1;
                    }
                }
                assert_eq!(fired, 1);
            });
        }
    }
}
