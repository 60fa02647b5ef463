//! Progressive compression renderings: L1 masking, L2 summary, L3 digest.
//!
//! L1 trims old tool outputs to a typed placeholder with a short summary,
//! honoring per-tool character limits and a preserve-verbatim pattern list.
//! L2 renders a prose summary of decisions and outcomes over a step range.
//! L3 keeps only a structured digest of goals, entities, and lessons.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::item::{ContextItem, ContextItemKind};

/// Tunables for the compression renderings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Default character budget for an L1 placeholder summary.
    pub mask_chars_default: usize,
    /// Per-tool overrides of the L1 character budget.
    pub mask_chars_per_tool: BTreeMap<String, usize>,
    /// Regex patterns whose matches are preserved verbatim at L1.
    pub preserve_patterns: Vec<String>,
    /// Maximum entities listed in an L3 digest.
    pub digest_entities: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            mask_chars_default: 120,
            mask_chars_per_tool: BTreeMap::new(),
            // Paths, URLs, and error codes survive masking verbatim.
            preserve_patterns: vec![
                r"error\[[A-Z0-9]+\]".to_string(),
                r"https?://\S+".to_string(),
                r"(?:/[\w.\-]+){2,}".to_string(),
            ],
            digest_entities: 12,
        }
    }
}

/// L1 observation masking: a typed placeholder with a clipped summary.
pub fn mask_observation(item: &ContextItem, config: &CompressionConfig) -> String {
    let limit = item
        .tool_name
        .as_deref()
        .and_then(|tool| config.mask_chars_per_tool.get(tool).copied())
        .unwrap_or(config.mask_chars_default);

    let kind = match item.kind {
        ContextItemKind::ToolResult => "tool result",
        ContextItemKind::ToolCall => "tool call",
        ContextItemKind::User => "user message",
        ContextItemKind::Assistant => "assistant message",
        ContextItemKind::Decision => "decision",
    };

    let mut preserved: Vec<String> = Vec::new();
    for pattern in &config.preserve_patterns {
        if let Ok(re) = Regex::new(pattern) {
            for m in re.find_iter(&item.original_text).take(3) {
                preserved.push(m.as_str().to_string());
            }
        }
    }

    let summary: String = item
        .original_text
        .chars()
        .take(limit)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let tool = item
        .tool_name
        .as_deref()
        .map(|t| format!(" from {t}"))
        .unwrap_or_default();
    let mut masked = format!("[{kind}{tool}, step {}] {summary}", item.step_inserted);
    if !preserved.is_empty() {
        masked.push_str(&format!(" | kept: {}", preserved.join(", ")));
    }
    masked
}

/// L2: a prose summary of decisions and outcomes spanning a step range.
pub fn summarize_range(items: &[&ContextItem]) -> String {
    if items.is_empty() {
        return String::new();
    }
    let first = items.iter().map(|i| i.step_inserted).min().unwrap_or(0);
    let last = items.iter().map(|i| i.step_inserted).max().unwrap_or(0);
    let decisions = items.iter().filter(|i| i.is_decision).count();
    let errors = items.iter().filter(|i| i.had_error).count();
    let tools: Vec<&str> = {
        let mut seen = Vec::new();
        for item in items {
            if let Some(tool) = item.tool_name.as_deref() {
                if !seen.contains(&tool) {
                    seen.push(tool);
                }
            }
        }
        seen
    };

    let mut summary = format!(
        "Steps {first}-{last}: {} entries, {decisions} decisions, {errors} errors.",
        items.len()
    );
    if !tools.is_empty() {
        summary.push_str(&format!(" Tools used: {}.", tools.join(", ")));
    }
    if let Some(last_decision) = items.iter().rev().find(|i| i.is_decision) {
        let head: String = last_decision.original_text.chars().take(80).collect();
        summary.push_str(&format!(" Last decision: {head}"));
    }
    summary
}

/// L3: a structured digest of goals, entities, and lessons only.
pub fn digest(items: &[&ContextItem], goal_text: &str, config: &CompressionConfig) -> String {
    let mut entity_counts: BTreeMap<String, usize> = BTreeMap::new();
    for item in items {
        for token in item
            .original_text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 3)
        {
            *entity_counts.entry(token.to_lowercase()).or_default() += 1;
        }
    }
    let mut entities: Vec<(String, usize)> = entity_counts.into_iter().collect();
    entities.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    entities.truncate(config.digest_entities);

    let lessons: Vec<String> = items
        .iter()
        .filter(|i| i.had_error)
        .rev()
        .take(3)
        .map(|i| i.original_text.chars().take(60).collect())
        .collect();

    let mut out = format!("goal: {goal_text}\n");
    out.push_str(&format!(
        "entities: {}\n",
        entities
            .iter()
            .map(|(e, _)| e.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    ));
    if !lessons.is_empty() {
        out.push_str(&format!("lessons: {}", lessons.join(" | ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::item::CompressionLevel;

    fn tool_item(id: u64, text: &str, step: u64) -> ContextItem {
        let mut item = ContextItem::new(id, ContextItemKind::ToolResult, text, step);
        item.tool_name = Some("search".into());
        item
    }

    #[test]
    fn mask_clips_to_limit_and_tags_type() {
        let long = "word ".repeat(200);
        let item = tool_item(1, &long, 4);
        let masked = mask_observation(&item, &CompressionConfig::default());
        assert!(masked.starts_with("[tool result from search, step 4]"));
        assert!(masked.len() < long.len());
    }

    #[test]
    fn mask_preserves_error_codes_and_paths() {
        let item = tool_item(
            1,
            &format!(
                "{} the build failed with error[E0502] at /src/context/packer.rs line 9",
                "noise ".repeat(40)
            ),
            2,
        );
        let masked = mask_observation(&item, &CompressionConfig::default());
        assert!(masked.contains("error[E0502]"));
        assert!(masked.contains("/src/context/packer.rs"));
    }

    #[test]
    fn per_tool_limit_overrides_default() {
        let mut config = CompressionConfig::default();
        config.mask_chars_per_tool.insert("search".into(), 10);
        let item = tool_item(1, "0123456789abcdefghij", 1);
        let masked = mask_observation(&item, &config);
        assert!(masked.contains("0123456789"));
        assert!(!masked.contains("abcdefghij"));
    }

    #[test]
    fn summary_names_range_and_tools() {
        let a = tool_item(1, "found 3 results", 10);
        let mut b = ContextItem::new(2, ContextItemKind::Decision, "chose the fast path", 12);
        b.is_decision = true;
        let summary = summarize_range(&[&a, &b]);
        assert!(summary.contains("Steps 10-12"));
        assert!(summary.contains("search"));
        assert!(summary.contains("chose the fast path"));
    }

    #[test]
    fn digest_lists_frequent_entities() {
        let a = ContextItem::new(1, ContextItemKind::Assistant, "billing invoice billing", 1);
        let b = ContextItem::new(2, ContextItemKind::Assistant, "invoice ledger billing", 2);
        let out = digest(&[&a, &b], "reconcile billing", &CompressionConfig::default());
        assert!(out.starts_with("goal: reconcile billing"));
        assert!(out.contains("billing"));
        assert!(out.contains("invoice"));
    }

    #[test]
    fn digest_is_terser_than_source() {
        let long = "analysis ".repeat(500);
        let mut item = ContextItem::new(1, ContextItemKind::Assistant, &long, 1);
        let rendered = digest(&[&item], "goal", &CompressionConfig::default());
        item.compress_to(CompressionLevel::L3, rendered);
        assert!(item.tokens_current < item.tokens_l0);
    }
}
