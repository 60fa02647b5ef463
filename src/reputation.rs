//! Tool reputation: tit-for-tat trust dynamics with quarantine.
//!
//! Each tool carries a trust score updated from outcomes and a consistency
//! bonus, a consecutive-failure counter, and an optional quarantine window
//! that grows exponentially with repeated failure runs. Quarantined tools
//! are absent from every ranked and available listing.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

/// Tunables for reputation dynamics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    /// Trust EMA step toward the outcome.
    pub alpha: f64,
    /// Weight of the consistency bonus.
    pub beta: f64,
    /// Outcomes kept for the consistency window.
    pub window: usize,
    /// Consecutive failures before quarantine engages.
    pub quarantine_threshold: u32,
    /// Base quarantine duration in seconds; doubles per extra failure.
    pub quarantine_base_seconds: u64,
    /// Trust assigned by a forgive operation.
    pub forgive_trust: f64,
    /// Starting trust for a previously unseen tool.
    pub initial_trust: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            beta: 0.05,
            window: 20,
            quarantine_threshold: 3,
            quarantine_base_seconds: 60,
            forgive_trust: 0.3,
            initial_trust: 0.5,
        }
    }
}

/// Reputation record for one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolReputation {
    /// Trust in [0, 1]. Forced to 0 while quarantined.
    trust: f64,
    /// Recent outcome values for the consistency window.
    outcomes: VecDeque<f64>,
    pub consecutive_failures: u32,
    /// Epoch-seconds expiry of the active quarantine, if any.
    pub quarantine_until: Option<u64>,
}

impl ToolReputation {
    fn new(initial_trust: f64) -> Self {
        Self {
            trust: initial_trust,
            outcomes: VecDeque::new(),
            consecutive_failures: 0,
            quarantine_until: None,
        }
    }

    /// Consistency in [0, 1]: 1 − 4·variance over the window.
    pub fn consistency(&self) -> f64 {
        let n = self.outcomes.len();
        if n < 2 {
            return 0.5;
        }
        let mean = self.outcomes.iter().sum::<f64>() / n as f64;
        let variance = self
            .outcomes
            .iter()
            .map(|o| (o - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        (1.0 - 4.0 * variance).clamp(0.0, 1.0)
    }

    fn quarantined_at(&self, now_secs: u64) -> bool {
        self.quarantine_until.is_some_and(|until| now_secs < until)
    }
}

/// The per-session reputation book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationBook {
    pub config: ReputationConfig,
    tools: BTreeMap<String, ToolReputation>,
}

impl ReputationBook {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            config,
            tools: BTreeMap::new(),
        }
    }

    /// Record an outcome in [0, 1] for a tool at `now_secs`.
    ///
    /// trust' = trust + α·(outcome − trust) + β·(consistency − 0.5), then a
    /// quarantine check: on the k-th consecutive failure with
    /// k ≥ threshold, the tool is quarantined for base·2^(k−threshold)
    /// seconds and its trust drops to zero.
    pub fn record(&mut self, tool: &str, outcome: f64, now_secs: u64) {
        let cfg = self.config.clone();
        let record = self
            .tools
            .entry(tool.to_string())
            .or_insert_with(|| ToolReputation::new(cfg.initial_trust));

        Self::process_expiry(record, now_secs);

        let outcome = outcome.clamp(0.0, 1.0);
        record.outcomes.push_back(outcome);
        while record.outcomes.len() > cfg.window {
            record.outcomes.pop_front();
        }

        let consistency = record.consistency();
        record.trust = (record.trust
            + cfg.alpha * (outcome - record.trust)
            + cfg.beta * (consistency - 0.5))
            .clamp(0.0, 1.0);

        if outcome < 0.5 {
            record.consecutive_failures += 1;
            let k = record.consecutive_failures;
            if k >= cfg.quarantine_threshold {
                let exponent = k - cfg.quarantine_threshold;
                let duration = cfg
                    .quarantine_base_seconds
                    .saturating_mul(1u64 << exponent.min(20));
                record.quarantine_until = Some(now_secs + duration);
                record.trust = 0.0;
                tracing::warn!(tool, failures = k, duration_secs = duration, "tool quarantined");
            }
        } else {
            record.consecutive_failures = 0;
        }
    }

    /// Clear an expired quarantine, resetting trust to max(0.2, trust·0.5).
    fn process_expiry(record: &mut ToolReputation, now_secs: u64) {
        if let Some(until) = record.quarantine_until {
            if now_secs >= until {
                record.quarantine_until = None;
                record.consecutive_failures = 0;
                record.trust = (record.trust * 0.5).max(0.2);
            }
        }
    }

    /// Trust for a tool at `now_secs`: zero while quarantined.
    pub fn trust(&self, tool: &str, now_secs: u64) -> f64 {
        match self.tools.get(tool) {
            Some(r) if r.quarantined_at(now_secs) => 0.0,
            Some(r) => r.trust,
            None => self.config.initial_trust,
        }
    }

    /// Whether a tool is currently quarantined.
    pub fn is_quarantined(&self, tool: &str, now_secs: u64) -> bool {
        self.tools
            .get(tool)
            .is_some_and(|r| r.quarantined_at(now_secs))
    }

    /// Filter candidates down to the non-quarantined set, processing any
    /// expired quarantines on the way.
    pub fn available(&mut self, candidates: &[String], now_secs: u64) -> Vec<String> {
        for record in self.tools.values_mut() {
            Self::process_expiry(record, now_secs);
        }
        candidates
            .iter()
            .filter(|name| !self.is_quarantined(name, now_secs))
            .cloned()
            .collect()
    }

    /// Candidates ranked by trust descending, quarantined tools excluded.
    pub fn ranked(&mut self, candidates: &[String], now_secs: u64) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .available(candidates, now_secs)
            .into_iter()
            .map(|name| {
                let t = self.trust(&name, now_secs);
                (name, t)
            })
            .collect();
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Forgive a tool: trust 0.3, quarantine cleared, streak reset.
    pub fn forgive(&mut self, tool: &str) {
        let cfg_trust = self.config.forgive_trust;
        let initial = self.config.initial_trust;
        let record = self
            .tools
            .entry(tool.to_string())
            .or_insert_with(|| ToolReputation::new(initial));
        record.trust = cfg_trust;
        record.quarantine_until = None;
        record.consecutive_failures = 0;
    }

    /// The raw record, if the tool has been seen.
    pub fn get(&self, tool: &str) -> Option<&ToolReputation> {
        self.tools.get(tool)
    }

    /// All recorded tool names.
    pub fn known_tools(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for ReputationBook {
    fn default() -> Self {
        Self::new(ReputationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn three_failures_quarantine_for_at_least_base() {
        let mut book = ReputationBook::default();
        for _ in 0..3 {
            book.record("flaky_search", 0.0, NOW);
        }
        assert!(book.is_quarantined("flaky_search", NOW));
        assert_eq!(book.trust("flaky_search", NOW), 0.0);
        let until = book.get("flaky_search").unwrap().quarantine_until.unwrap();
        assert!(until >= NOW + 60);

        let candidates = vec!["flaky_search".to_string(), "other".to_string()];
        assert_eq!(book.available(&candidates, NOW), vec!["other".to_string()]);
    }

    #[test]
    fn quarantine_duration_doubles_per_extra_failure() {
        let mut book = ReputationBook::default();
        for _ in 0..3 {
            book.record("t", 0.0, NOW);
        }
        let first = book.get("t").unwrap().quarantine_until.unwrap() - NOW;
        // Fourth consecutive failure (post-expiry would reset; record inside
        // the window extends with doubled duration).
        book.record("t", 0.0, NOW);
        let second = book.get("t").unwrap().quarantine_until.unwrap() - NOW;
        assert_eq!(first, 60);
        assert_eq!(second, 120);
    }

    #[test]
    fn expiry_halves_trust_with_floor() {
        let mut book = ReputationBook::default();
        // Build decent trust, then fail into quarantine.
        for _ in 0..20 {
            book.record("t", 1.0, NOW);
        }
        for _ in 0..3 {
            book.record("t", 0.0, NOW);
        }
        assert!(book.is_quarantined("t", NOW));
        // After expiry the tool returns at max(0.2, 0·0.5) = 0.2.
        let later = NOW + 10_000;
        assert!(!book.is_quarantined("t", later));
        let available = book.available(&["t".to_string()], later);
        assert_eq!(available.len(), 1);
        assert!((book.trust("t", later) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn forgive_restores_access() {
        let mut book = ReputationBook::default();
        for _ in 0..4 {
            book.record("t", 0.0, NOW);
        }
        assert!(book.is_quarantined("t", NOW));
        book.forgive("t");
        assert!(!book.is_quarantined("t", NOW));
        assert!((book.trust("t", NOW) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn consistency_rewards_steady_tools() {
        let mut book = ReputationBook::default();
        for _ in 0..20 {
            book.record("steady", 1.0, NOW);
        }
        for i in 0..20 {
            book.record("erratic", if i % 2 == 0 { 1.0 } else { 0.0 }, NOW);
        }
        let steady = book.get("steady").unwrap().consistency();
        let erratic = book.get("erratic").unwrap().consistency();
        assert!(steady > 0.9);
        assert!(erratic < 0.1);
        assert!(book.trust("steady", NOW) > book.trust("erratic", NOW));
    }

    #[test]
    fn ranked_sorts_by_trust() {
        let mut book = ReputationBook::default();
        for _ in 0..10 {
            book.record("good", 1.0, NOW);
            book.record("bad", 0.2, NOW);
        }
        let ranked = book.ranked(&["bad".to_string(), "good".to_string()], NOW);
        assert_eq!(ranked[0].0, "good");
    }
}
