//! Attention: priority classification of incoming messages.
//!
//! A lightweight feature score maps each message to a priority class that
//! downstream stages use to size resource envelopes and ordering.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Priority classes, highest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AttentionPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// One scored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionRecord {
    pub step: u64,
    pub priority: AttentionPriority,
    pub score: f64,
}

/// Tunables for attention scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    pub critical_score: f64,
    pub high_score: f64,
    pub low_score: f64,
    /// Records kept for snapshots and trend inspection.
    pub history: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            critical_score: 0.8,
            high_score: 0.55,
            low_score: 0.2,
            history: 64,
        }
    }
}

/// The attention engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionEngine {
    pub config: AttentionConfig,
    records: VecDeque<AttentionRecord>,
}

const URGENCY_MARKERS: &[&str] = &[
    "urgent", "asap", "immediately", "critical", "emergency", "right now", "production down",
];

const PROBLEM_MARKERS: &[&str] = &[
    "error", "broken", "failing", "crash", "outage", "data loss", "security",
];

impl AttentionEngine {
    pub fn new(config: AttentionConfig) -> Self {
        Self {
            config,
            records: VecDeque::new(),
        }
    }

    /// Classify a message and record the result.
    pub fn classify(&mut self, step: u64, message: &str) -> AttentionPriority {
        let lower = message.to_lowercase();
        let mut score: f64 = 0.35;

        if URGENCY_MARKERS.iter().any(|m| lower.contains(m)) {
            score += 0.35;
        }
        if PROBLEM_MARKERS.iter().any(|m| lower.contains(m)) {
            score += 0.2;
        }
        if message.contains('!') {
            score += 0.05;
        }
        if message.ends_with('?') && message.split_whitespace().count() < 12 {
            // Short questions are routine.
            score -= 0.1;
        }
        let score = score.clamp(0.0, 1.0);

        let priority = if score >= self.config.critical_score {
            AttentionPriority::Critical
        } else if score >= self.config.high_score {
            AttentionPriority::High
        } else if score <= self.config.low_score {
            AttentionPriority::Low
        } else {
            AttentionPriority::Normal
        };

        self.records.push_back(AttentionRecord {
            step,
            priority,
            score,
        });
        while self.records.len() > self.config.history {
            self.records.pop_front();
        }
        priority
    }

    pub fn records(&self) -> impl Iterator<Item = &AttentionRecord> {
        self.records.iter()
    }
}

impl Default for AttentionEngine {
    fn default() -> Self {
        Self::new(AttentionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_failures_rank_critical() {
        let mut engine = AttentionEngine::default();
        let p = engine.classify(1, "URGENT: production down, security error everywhere!");
        assert_eq!(p, AttentionPriority::Critical);
    }

    #[test]
    fn short_questions_rank_at_most_normal() {
        let mut engine = AttentionEngine::default();
        let p = engine.classify(1, "What time is the standup?");
        assert!(p <= AttentionPriority::Normal);
    }

    #[test]
    fn problem_reports_rank_high() {
        let mut engine = AttentionEngine::default();
        let p = engine.classify(1, "the checkout flow is broken and throwing an error for every user");
        assert!(p >= AttentionPriority::High);
    }
}
