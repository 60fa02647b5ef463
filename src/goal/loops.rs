//! Multi-resolution loop detector.
//!
//! Four parallel detectors watch the action stream at different
//! resolutions: exact duplicate hashes, semantic near-duplicates,
//! short-period oscillation, and repeated dead-end errors. Their
//! confidences fuse into a single detection with a recommended recovery.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Window sizes and trip thresholds for the four detectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Exact-hash window and repeat threshold.
    pub exact_window: usize,
    pub exact_repeats: usize,
    /// Semantic window, Jaccard threshold, and match count.
    pub semantic_window: usize,
    pub semantic_similarity: f64,
    pub semantic_matches: usize,
    /// Oscillation window and minimum cycle count.
    pub oscillation_window: usize,
    pub oscillation_cycles: usize,
    /// Dead-end window and repeat threshold.
    pub dead_end_window: usize,
    pub dead_end_repeats: usize,
    /// Fused confidence above which escalation is recommended.
    pub escalate_confidence: f64,
    /// Total repeats above which escalation is recommended.
    pub escalate_repeats: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            exact_window: 500,
            exact_repeats: 3,
            semantic_window: 30,
            semantic_similarity: 0.65,
            semantic_matches: 2,
            oscillation_window: 20,
            oscillation_cycles: 2,
            dead_end_window: 15,
            dead_end_repeats: 3,
            escalate_confidence: 0.85,
            escalate_repeats: 5,
        }
    }
}

/// Which detector resolution tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopKind {
    Exact,
    Semantic,
    Oscillation,
    DeadEnd,
}

/// Recovery recommended for a detected loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoopAction {
    Escalate,
    Backtrack,
    Replan,
}

/// A fused loop detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopDetection {
    pub kinds: Vec<LoopKind>,
    pub confidence: f64,
    pub total_repeats: usize,
    pub action: LoopAction,
}

/// One observed step in the action stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LoopEntry {
    hash: [u8; 32],
    tokens: BTreeSet<String>,
    error: Option<String>,
}

/// The multi-resolution loop detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetector {
    pub config: LoopConfig,
    entries: VecDeque<LoopEntry>,
}

impl LoopDetector {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    /// Observe one action and check all four detectors.
    pub fn observe(
        &mut self,
        description: &str,
        output: &str,
        error: Option<&str>,
    ) -> Option<LoopDetection> {
        let entry = LoopEntry {
            hash: normalized_hash(description, output),
            tokens: token_set(description),
            error: error.map(normalize_error),
        };
        self.entries.push_back(entry);
        let cap = self
            .config
            .exact_window
            .max(self.config.semantic_window)
            .max(self.config.oscillation_window)
            .max(self.config.dead_end_window);
        while self.entries.len() > cap {
            self.entries.pop_front();
        }
        self.evaluate()
    }

    fn evaluate(&self) -> Option<LoopDetection> {
        let mut kinds = Vec::new();
        let mut confidences = Vec::new();
        let mut total_repeats = 0usize;
        let mut dead_end = false;

        if let Some((conf, repeats)) = self.check_exact() {
            kinds.push(LoopKind::Exact);
            confidences.push(conf);
            total_repeats = total_repeats.max(repeats);
        }
        if let Some((conf, repeats)) = self.check_semantic() {
            kinds.push(LoopKind::Semantic);
            confidences.push(conf);
            total_repeats = total_repeats.max(repeats);
        }
        if let Some((conf, cycles)) = self.check_oscillation() {
            kinds.push(LoopKind::Oscillation);
            confidences.push(conf);
            total_repeats = total_repeats.max(cycles * 2);
        }
        if let Some((conf, repeats)) = self.check_dead_end() {
            kinds.push(LoopKind::DeadEnd);
            confidences.push(conf);
            total_repeats = total_repeats.max(repeats);
            dead_end = true;
        }

        if kinds.is_empty() {
            return None;
        }
        let mean = confidences.iter().sum::<f64>() / confidences.len() as f64;
        let confidence = (mean + 0.1 * (kinds.len() as f64 - 1.0)).clamp(0.0, 1.0);

        let action = if confidence > self.config.escalate_confidence
            || total_repeats > self.config.escalate_repeats
        {
            LoopAction::Escalate
        } else if dead_end {
            LoopAction::Backtrack
        } else {
            LoopAction::Replan
        };

        tracing::warn!(?kinds, confidence, total_repeats, ?action, "loop detected");
        Some(LoopDetection {
            kinds,
            confidence,
            total_repeats,
            action,
        })
    }

    /// Same normalized hash appearing `exact_repeats` times in the window.
    fn check_exact(&self) -> Option<(f64, usize)> {
        let last = self.entries.back()?;
        let count = self
            .entries
            .iter()
            .rev()
            .take(self.config.exact_window)
            .filter(|e| e.hash == last.hash)
            .count();
        if count >= self.config.exact_repeats {
            let conf = (0.6 + 0.1 * (count - self.config.exact_repeats) as f64).min(0.95);
            Some((conf, count))
        } else {
            None
        }
    }

    /// Token-set Jaccard ≥ threshold against the recent window, tripping on
    /// enough near-matches.
    fn check_semantic(&self) -> Option<(f64, usize)> {
        let last = self.entries.back()?;
        if last.tokens.is_empty() {
            return None;
        }
        let mut matches = 0usize;
        let mut best = 0.0f64;
        for prior in self
            .entries
            .iter()
            .rev()
            .skip(1)
            .take(self.config.semantic_window)
        {
            let sim = jaccard(&last.tokens, &prior.tokens);
            if sim >= self.config.semantic_similarity {
                matches += 1;
                best = best.max(sim);
            }
        }
        if matches >= self.config.semantic_matches {
            Some((0.5 + 0.4 * best.min(1.0) * (matches as f64 / 4.0).min(1.0), matches + 1))
        } else {
            None
        }
    }

    /// A/B/A/B-style period of 2, 3, or 4 over the oscillation window.
    fn check_oscillation(&self) -> Option<(f64, usize)> {
        let window: Vec<&[u8; 32]> = self
            .entries
            .iter()
            .rev()
            .take(self.config.oscillation_window)
            .map(|e| &e.hash)
            .collect();
        for period in 2..=4usize {
            // Count whole trailing cycles in which hash[i] == hash[i + period],
            // requiring at least two distinct values so a pure repeat does not
            // double-report as oscillation.
            let needed = period * (self.config.oscillation_cycles + 1);
            if window.len() < needed {
                continue;
            }
            let aligned = (0..period * self.config.oscillation_cycles)
                .all(|i| window[i] == window[i + period]);
            let distinct = window[..period].iter().collect::<BTreeSet<_>>().len() > 1;
            if aligned && distinct {
                return Some((0.55 + 0.1 * period as f64, self.config.oscillation_cycles));
            }
        }
        None
    }

    /// Same error string repeating within the dead-end window.
    fn check_dead_end(&self) -> Option<(f64, usize)> {
        let last_error = self.entries.back()?.error.as_ref()?;
        let count = self
            .entries
            .iter()
            .rev()
            .take(self.config.dead_end_window)
            .filter(|e| e.error.as_ref() == Some(last_error))
            .count();
        if count >= self.config.dead_end_repeats {
            Some(((0.7 + 0.05 * count as f64).min(0.95), count))
        } else {
            None
        }
    }

    /// Number of observed entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopConfig::default())
    }
}

/// SHA-256 of the normalized `description|output` pair.
fn normalized_hash(description: &str, output: &str) -> [u8; 32] {
    let normalized = format!(
        "{}|{}",
        normalize_text(description),
        normalize_text(output)
    );
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_error(error: &str) -> String {
    normalize_text(error)
}

fn token_set(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
