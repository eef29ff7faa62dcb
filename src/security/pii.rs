//! Regex-based PII redaction applied to every transcript before it touches
//! durable storage.

use crate::config::SecurityConfig;
use regex::Regex;

struct Pattern {
    kind: &'static str,
    regex: Regex,
}

pub struct PiiScrubber {
    patterns: Vec<Pattern>,
    mask: String,
}

impl PiiScrubber {
    pub fn new(cfg: &SecurityConfig) -> Self {
        let mut patterns = Vec::new();

        if cfg.scrub_email {
            patterns.push(Pattern {
                kind: "EMAIL",
                regex: Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")
                    .expect("email regex"),
            });
        }

        // US SSN, 000-00-0000
        if cfg.scrub_ssn {
            patterns.push(Pattern {
                kind: "SSN",
                regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"),
            });
        }

        // Card numbers first so a 16-digit run is not half-eaten by the
        // phone pattern. Shape-only check, no Luhn.
        if cfg.scrub_credit_cards {
            patterns.push(Pattern {
                kind: "CC",
                regex: Regex::new(r"\b(?:\d[ -]*?){13,16}\b").expect("cc regex"),
            });
        }

        // US phone: 123-456-7890, (123) 456-7890, +1 123 456 7890
        if cfg.scrub_phone {
            patterns.push(Pattern {
                kind: "PHONE",
                regex: Regex::new(r"(\+\d{1,2}\s?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b")
                    .expect("phone regex"),
            });
        }

        Self {
            patterns,
            mask: cfg.redaction_mask.clone(),
        }
    }

    /// Replace every PII occurrence with the configured mask.
    ///
    /// Runs passes to a fixpoint: a long digit run can be consumed only
    /// partially by one pass, and the remainder may become matchable once
    /// its neighbour is masked. Termination is guaranteed because every
    /// replacement strictly reduces the digit count.
    pub fn scrub(&self, text: &str) -> String {
        if text.is_empty() {
            return String::new();
        }

        let mut current = text.to_string();
        // Bounded in case a configured mask itself contains digits.
        for _ in 0..32 {
            let mut next = current.clone();
            for p in &self.patterns {
                let replacement = self.mask.replace("{type}", p.kind);
                next = p
                    .regex
                    .replace_all(&next, replacement.as_str())
                    .into_owned();
            }
            if next == current {
                break;
            }
            current = next;
        }
        current
    }
}

impl Default for PiiScrubber {
    fn default() -> Self {
        Self::new(&SecurityConfig::default())
    }
}
