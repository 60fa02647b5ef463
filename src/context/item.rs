//! Context items: the records of the hot/warm/cold store.
//!
//! Each item keeps its original text, its current compressed rendering,
//! token counts at L0 and at the current level, an importance score, and a
//! compression level that only ever increases.

use serde::{Deserialize, Serialize};

/// What produced a context item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ContextItemKind {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    Decision,
}

/// Temperature tier of an item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

/// Progressive compression levels, verbatim to structured digest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CompressionLevel {
    L0,
    L1,
    L2,
    L3,
}

impl CompressionLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::L0 => 0,
            Self::L1 => 1,
            Self::L2 => 2,
            Self::L3 => 3,
        }
    }
}

/// Estimate a token count from text. The core never parses provider wire
/// formats, so a chars/4 heuristic stands in; provider-reported usage
/// overrides it where available.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// One record of the context store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: u64,
    pub kind: ContextItemKind,
    pub original_text: String,
    /// Rendering at the current compression level.
    pub current_text: String,
    pub step_inserted: u64,
    pub tokens_l0: usize,
    pub tokens_current: usize,
    /// Importance score in [0, 1], recomputed during packing.
    pub importance: f64,
    pub reference_count: u32,
    /// Marks decisions and errors for the causal importance factor.
    pub is_decision: bool,
    pub level: CompressionLevel,
    pub tier: Tier,
    /// Which tool produced a tool-result item, for per-tool mask limits.
    pub tool_name: Option<String>,
    /// Whether the step carried an error (causal factor, loop signals).
    pub had_error: bool,
    /// Whether the step's outcome was a success (success-correlation factor).
    pub was_success: bool,
}

impl ContextItem {
    pub fn new(id: u64, kind: ContextItemKind, text: &str, step: u64) -> Self {
        let tokens = estimate_tokens(text);
        Self {
            id,
            kind,
            original_text: text.to_string(),
            current_text: text.to_string(),
            step_inserted: step,
            tokens_l0: tokens,
            tokens_current: tokens,
            importance: 0.5,
            reference_count: 0,
            is_decision: kind == ContextItemKind::Decision,
            level: CompressionLevel::L0,
            tier: Tier::Hot,
            tool_name: None,
            had_error: false,
            was_success: true,
        }
    }

    /// Age of the item in steps.
    pub fn age(&self, current_step: u64) -> u64 {
        current_step.saturating_sub(self.step_inserted)
    }

    /// Replace the rendering with a higher compression level.
    ///
    /// Compression level is monotone: a request to move to a lower or equal
    /// level is ignored.
    pub fn compress_to(&mut self, level: CompressionLevel, rendered: String) {
        if level <= self.level {
            return;
        }
        self.level = level;
        self.tokens_current = estimate_tokens(&rendered).min(self.tokens_l0);
        self.current_text = rendered;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compression_level_is_monotone() {
        let mut item = ContextItem::new(1, ContextItemKind::ToolResult, "a long tool output", 1);
        item.compress_to(CompressionLevel::L2, "summary".into());
        assert_eq!(item.level, CompressionLevel::L2);
        // Attempting to go back down is ignored.
        item.compress_to(CompressionLevel::L1, "masked".into());
        assert_eq!(item.level, CompressionLevel::L2);
        assert_eq!(item.current_text, "summary");
    }

    #[test]
    fn compressed_tokens_never_exceed_l0() {
        let mut item = ContextItem::new(1, ContextItemKind::ToolResult, "short", 1);
        item.compress_to(
            CompressionLevel::L1,
            "a much longer placeholder than the original".into(),
        );
        assert!(item.tokens_current <= item.tokens_l0);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
