//! Goal-DNA: a compact fingerprint of a goal for O(1) similarity checks.
//!
//! The fingerprint is a pair (token-set, trigram-set) extracted from the
//! goal string with stop-words removed and identifiers split on
//! underscores. Similarity against an action text is
//! 0.7·Jaccard(tokens) + 0.3·Jaccard(trigrams).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::GoalError;

/// Weight of token-set Jaccard in the similarity blend.
pub const TOKEN_WEIGHT: f64 = 0.7;

/// Weight of trigram-set Jaccard in the similarity blend.
pub const TRIGRAM_WEIGHT: f64 = 0.3;

/// English stop-words stripped during fingerprint extraction.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "have", "in",
    "into", "is", "it", "its", "of", "on", "or", "our", "so", "that", "the", "their",
    "then", "this", "to", "was", "we", "were", "will", "with", "you", "your",
];

/// Fingerprint of a goal, fixed for the goal's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalDna {
    pub tokens: BTreeSet<String>,
    pub trigrams: BTreeSet<String>,
}

impl GoalDna {
    /// Extract the fingerprint from a goal string.
    ///
    /// Errors if nothing survives normalization.
    pub fn from_text(text: &str) -> Result<Self, GoalError> {
        let dna = Self::extract(text);
        if dna.tokens.is_empty() {
            return Err(GoalError::EmptyGoal);
        }
        Ok(dna)
    }

    /// Extract without the non-empty check (used for action texts, which may
    /// legitimately normalize to nothing).
    pub fn extract(text: &str) -> Self {
        let tokens = tokenize(text);
        let joined = tokens.iter().cloned().collect::<Vec<_>>().join(" ");
        let trigrams = char_trigrams(&joined);
        Self { tokens, trigrams }
    }

    /// Similarity to another fingerprint:
    /// 0.7·Jaccard(tokens) + 0.3·Jaccard(trigrams).
    pub fn similarity(&self, other: &Self) -> f64 {
        TOKEN_WEIGHT * jaccard(&self.tokens, &other.tokens)
            + TRIGRAM_WEIGHT * jaccard(&self.trigrams, &other.trigrams)
    }

    /// Similarity against a raw action text.
    pub fn similarity_to_text(&self, text: &str) -> f64 {
        self.similarity(&Self::extract(text))
    }

    /// Fraction of `other`'s tokens absent from this fingerprint, a topic
    /// divergence measure used by the drift engine.
    pub fn novel_token_ratio(&self, text: &str) -> f64 {
        let other = tokenize(text);
        if other.is_empty() {
            return 0.0;
        }
        let novel = other.iter().filter(|t| !self.tokens.contains(*t)).count();
        novel as f64 / other.len() as f64
    }
}

/// Lowercase, split on non-alphanumerics and underscores, drop stop-words
/// and single characters.
fn tokenize(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .filter(|t| !STOP_WORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Character trigrams over the normalized token stream.
fn char_trigrams(text: &str) -> BTreeSet<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < 3 {
        return BTreeSet::new();
    }
    chars.windows(3).map(|w| w.iter().collect()).collect()
}

/// Jaccard similarity of two sets. Two empty sets are identical (1.0).
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 { 0.0 } else { intersection / union }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_is_symmetric() {
        let goal = GoalDna::extract("Implement JWT login endpoint");
        let action = GoalDna::extract("write the token validation middleware");
        assert!((goal.similarity(&action) - action.similarity(&goal)).abs() < 1e-12);
    }

    #[test]
    fn self_similarity_is_one() {
        let dna = GoalDna::extract("summarize recent weather for Berlin");
        assert!((dna.similarity(&dna) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn unrelated_texts_score_near_zero() {
        let goal = GoalDna::from_text("Implement JWT login endpoint").unwrap();
        let sim = goal.similarity_to_text("quantum physics entanglement experiments");
        assert!(sim < 0.1, "similarity was {sim}");
    }

    #[test]
    fn identifiers_split_on_underscores() {
        let goal = GoalDna::from_text("fix the parse_config function").unwrap();
        assert!(goal.tokens.contains("parse"));
        assert!(goal.tokens.contains("config"));
        assert!(!goal.tokens.contains("parse_config"));
    }

    #[test]
    fn stop_words_removed() {
        let goal = GoalDna::from_text("the quick fix for the parser").unwrap();
        assert!(!goal.tokens.contains("the"));
        assert!(!goal.tokens.contains("for"));
        assert!(goal.tokens.contains("quick"));
    }

    #[test]
    fn empty_goal_rejected() {
        assert!(GoalDna::from_text("the of a").is_err());
        assert!(GoalDna::from_text("").is_err());
    }

    #[test]
    fn novel_token_ratio_bounds() {
        let goal = GoalDna::from_text("deploy the billing service").unwrap();
        assert!(goal.novel_token_ratio("deploy billing service") < 1e-9);
        assert!((goal.novel_token_ratio("quantum flux capacitor") - 1.0).abs() < 1e-9);
    }
}
