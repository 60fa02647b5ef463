//! The context packer: hot/warm/cold tiers under a fixed token budget.
//!
//! Items age from hot through warm into cold, their compression level
//! escalates through L1/L2/L3 age thresholds, and packing assembles the
//! window in a fixed order (system prompt, task state, warm, cold, hot)
//! while evicting cold items in ascending importance when the budget
//! overflows. Checkpoints snapshot the store shape on a bounded ring.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::goal::GoalDna;

use super::compress::{digest, mask_observation, summarize_range, CompressionConfig};
use super::item::{estimate_tokens, CompressionLevel, ContextItem, ContextItemKind, Tier};

/// Importance-factor weights; they sum to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportanceWeights {
    pub recency: f64,
    pub goal_relevance: f64,
    pub causal: f64,
    pub references: f64,
    pub success: f64,
    pub domain: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            recency: 0.25,
            goal_relevance: 0.25,
            causal: 0.20,
            references: 0.10,
            success: 0.10,
            domain: 0.10,
        }
    }
}

/// Tunables for the context packer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackerConfig {
    /// Model context window, in tokens.
    pub context_window: usize,
    /// Fraction of the window the packer may use.
    pub window_ratio: f64,
    /// Tokens reserved for the model's output.
    pub output_reservation: usize,
    /// Tokens reserved for the system prompt.
    pub system_prompt_budget: usize,
    /// Tier share of the packed budget.
    pub hot_ratio: f64,
    pub warm_ratio: f64,
    pub cold_ratio: f64,
    /// Age at which an item leaves the hot tier.
    pub warm_age: u64,
    /// Age at which an item leaves the warm tier.
    pub cold_age: u64,
    /// Compression-level age thresholds.
    pub l1_age: u64,
    pub l2_age: u64,
    pub l3_age: u64,
    /// Recency half-life in steps.
    pub recency_half_life: f64,
    pub importance: ImportanceWeights,
    /// Domain-profile keywords scoring the domain factor.
    pub domain_keywords: Vec<String>,
    /// Steps between checkpoints, and the checkpoint ring size.
    pub checkpoint_interval: u64,
    pub checkpoint_ring: usize,
    pub compression: CompressionConfig,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            context_window: 100_000,
            window_ratio: 0.9,
            output_reservation: 4_096,
            system_prompt_budget: 2_048,
            hot_ratio: 0.40,
            warm_ratio: 0.35,
            cold_ratio: 0.25,
            warm_age: 10,
            cold_age: 50,
            l1_age: 10,
            l2_age: 50,
            l3_age: 200,
            recency_half_life: 30.0,
            importance: ImportanceWeights::default(),
            domain_keywords: Vec::new(),
            checkpoint_interval: 50,
            checkpoint_ring: 20,
            compression: CompressionConfig::default(),
        }
    }
}

impl PackerConfig {
    /// Packable budget B = ratio·window − output_reservation − system_prompt_budget.
    pub fn budget(&self) -> usize {
        ((self.context_window as f64 * self.window_ratio) as usize)
            .saturating_sub(self.output_reservation)
            .saturating_sub(self.system_prompt_budget)
    }
}

/// Origin of a packed segment, in packing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentSource {
    SystemPrompt,
    TaskState,
    Warm,
    Cold,
    Hot,
}

/// One segment of the assembled window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedSegment {
    pub source: SegmentSource,
    pub item_id: Option<u64>,
    pub text: String,
    pub tokens: usize,
}

/// The assembled window plus eviction bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackedContext {
    pub segments: Vec<PackedSegment>,
    pub total_tokens: usize,
    /// Item ids evicted from the store during this pack.
    pub evicted: Vec<u64>,
}

impl PackedContext {
    /// Concatenated window text, segments in packing order.
    pub fn render(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Checkpoint of the store shape, kept on a bounded ring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub step: u64,
    pub task_state: String,
    pub hot_ids: Vec<u64>,
    pub warm_ids: Vec<u64>,
    pub cumulative_tokens: u64,
}

/// The tiered context store and packer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStore {
    pub config: PackerConfig,
    items: Vec<ContextItem>,
    next_id: u64,
    checkpoints: VecDeque<Checkpoint>,
    cumulative_tokens: u64,
    last_checkpoint_step: u64,
}

impl ContextStore {
    pub fn new(config: PackerConfig) -> Self {
        Self {
            config,
            items: Vec::new(),
            next_id: 1,
            checkpoints: VecDeque::new(),
            cumulative_tokens: 0,
            last_checkpoint_step: 0,
        }
    }

    /// Insert a new item at the hot tier. Returns its id.
    pub fn insert(
        &mut self,
        kind: ContextItemKind,
        text: &str,
        step: u64,
        tool_name: Option<&str>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let mut item = ContextItem::new(id, kind, text, step);
        item.tool_name = tool_name.map(str::to_string);
        self.cumulative_tokens += item.tokens_l0 as u64;
        self.items.push(item);
        id
    }

    /// Flag an item's step as errored or successful.
    pub fn mark_outcome(&mut self, id: u64, had_error: bool, was_success: bool) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.had_error = had_error;
            item.was_success = was_success;
        }
    }

    /// Bump an item's reference count.
    pub fn mark_referenced(&mut self, id: u64) {
        if let Some(item) = self.items.iter_mut().find(|i| i.id == id) {
            item.reference_count += 1;
        }
    }

    /// Advance the store to `step`: demote tiers, escalate compression,
    /// rescore importance, and take a checkpoint when the interval elapses.
    pub fn advance(&mut self, step: u64, goal: Option<&GoalDna>, goal_text: &str, task_state: &str) {
        let cfg = self.config.clone();
        for idx in 0..self.items.len() {
            let age = self.items[idx].age(step);

            let tier = if age > cfg.cold_age {
                Tier::Cold
            } else if age > cfg.warm_age {
                Tier::Warm
            } else {
                Tier::Hot
            };
            self.items[idx].tier = tier;

            if age >= cfg.l3_age && self.items[idx].level < CompressionLevel::L3 {
                let rendered = digest(&[&self.items[idx]], goal_text, &cfg.compression);
                self.items[idx].compress_to(CompressionLevel::L3, rendered);
            } else if age >= cfg.l2_age && self.items[idx].level < CompressionLevel::L2 {
                let rendered = summarize_range(&[&self.items[idx]]);
                self.items[idx].compress_to(CompressionLevel::L2, rendered);
            } else if age >= cfg.l1_age && self.items[idx].level < CompressionLevel::L1 {
                let rendered = mask_observation(&self.items[idx], &cfg.compression);
                self.items[idx].compress_to(CompressionLevel::L1, rendered);
            }

            let importance = self.score_importance(&self.items[idx], step, goal);
            self.items[idx].importance = importance;
        }

        if step.saturating_sub(self.last_checkpoint_step) >= cfg.checkpoint_interval {
            self.take_checkpoint(step, task_state);
        }
    }

    /// Importance: weighted sum of recency, goal relevance, causal flag,
    /// reference count, success correlation, and domain-profile match.
    fn score_importance(&self, item: &ContextItem, step: u64, goal: Option<&GoalDna>) -> f64 {
        let w = &self.config.importance;
        let age = item.age(step) as f64;
        let recency = 0.5_f64.powf(age / self.config.recency_half_life);
        let goal_relevance = goal
            .map(|g| g.similarity_to_text(&item.original_text))
            .unwrap_or(0.5);
        let causal = if item.is_decision || item.had_error { 1.0 } else { 0.0 };
        let references = (f64::from(item.reference_count) / 5.0).min(1.0);
        let success = if item.was_success { 1.0 } else { 0.0 };
        let lower = item.original_text.to_lowercase();
        let domain = if self.config.domain_keywords.is_empty() {
            0.5
        } else {
            let hits = self
                .config
                .domain_keywords
                .iter()
                .filter(|k| lower.contains(k.as_str()))
                .count();
            (hits as f64 / self.config.domain_keywords.len() as f64).min(1.0)
        };

        (w.recency * recency
            + w.goal_relevance * goal_relevance
            + w.causal * causal
            + w.references * references
            + w.success * success
            + w.domain * domain)
            .clamp(0.0, 1.0)
    }

    /// Assemble the window: system prompt, task state, warm (by step), cold
    /// (by importance), hot (chronological, recent turns last). Overflowing
    /// hot/warm items cascade down a tier for this pack; cold overflow is
    /// evicted from the store in ascending importance.
    pub fn pack(&mut self, system_prompt: &str, task_state: &str) -> PackedContext {
        let budget = self.config.budget();
        let hot_budget = (budget as f64 * self.config.hot_ratio) as usize;
        let warm_budget = (budget as f64 * self.config.warm_ratio) as usize;
        let cold_budget = (budget as f64 * self.config.cold_ratio) as usize;

        let mut hot: Vec<&ContextItem> = Vec::new();
        let mut warm: Vec<&ContextItem> = Vec::new();
        let mut cold: Vec<&ContextItem> = Vec::new();
        for item in &self.items {
            match item.tier {
                Tier::Hot => hot.push(item),
                Tier::Warm => warm.push(item),
                Tier::Cold => cold.push(item),
            }
        }
        hot.sort_by_key(|i| (i.step_inserted, i.id));
        warm.sort_by_key(|i| (i.step_inserted, i.id));

        // Hot keeps its most recent entries; older overflow joins warm.
        let mut hot_tokens = 0usize;
        let mut hot_kept: Vec<&ContextItem> = Vec::new();
        for &item in hot.iter().rev() {
            if hot_tokens + item.tokens_current <= hot_budget {
                hot_tokens += item.tokens_current;
                hot_kept.push(item);
            } else {
                warm.push(item);
            }
        }
        hot_kept.reverse();
        warm.sort_by_key(|i| (i.step_inserted, i.id));

        // Warm keeps by step order; overflow joins cold.
        let mut warm_tokens = 0usize;
        let mut warm_kept: Vec<&ContextItem> = Vec::new();
        for &item in &warm {
            if warm_tokens + item.tokens_current <= warm_budget {
                warm_tokens += item.tokens_current;
                warm_kept.push(item);
            } else {
                cold.push(item);
            }
        }

        // Cold keeps by importance descending; the rest is evicted.
        cold.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        let mut cold_tokens = 0usize;
        let mut cold_kept: Vec<&ContextItem> = Vec::new();
        let mut evicted: Vec<u64> = Vec::new();
        for &item in &cold {
            if cold_tokens + item.tokens_current <= cold_budget {
                cold_tokens += item.tokens_current;
                cold_kept.push(item);
            } else {
                evicted.push(item.id);
            }
        }

        let mut segments = Vec::new();
        let mut total = 0usize;
        let sys_tokens = estimate_tokens(system_prompt).min(self.config.system_prompt_budget);
        segments.push(PackedSegment {
            source: SegmentSource::SystemPrompt,
            item_id: None,
            text: system_prompt.to_string(),
            tokens: sys_tokens,
        });
        segments.push(PackedSegment {
            source: SegmentSource::TaskState,
            item_id: None,
            text: task_state.to_string(),
            tokens: estimate_tokens(task_state),
        });
        for (source, list) in [
            (SegmentSource::Warm, &warm_kept),
            (SegmentSource::Cold, &cold_kept),
            (SegmentSource::Hot, &hot_kept),
        ] {
            for item in list {
                total += item.tokens_current;
                segments.push(PackedSegment {
                    source,
                    item_id: Some(item.id),
                    text: item.current_text.clone(),
                    tokens: item.tokens_current,
                });
            }
        }

        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "evicted cold-tier items");
            self.items.retain(|i| !evicted.contains(&i.id));
        }

        PackedContext {
            segments,
            total_tokens: total,
            evicted,
        }
    }

    /// Emergency recompression: escalate every item one level. Used when
    /// the provider signals context overflow.
    pub fn recompress_all(&mut self, goal_text: &str) {
        let cfg = self.config.clone();
        for idx in 0..self.items.len() {
            let next = match self.items[idx].level {
                CompressionLevel::L0 => {
                    let rendered = mask_observation(&self.items[idx], &cfg.compression);
                    Some((CompressionLevel::L1, rendered))
                }
                CompressionLevel::L1 => {
                    let rendered = summarize_range(&[&self.items[idx]]);
                    Some((CompressionLevel::L2, rendered))
                }
                CompressionLevel::L2 => {
                    let rendered = digest(&[&self.items[idx]], goal_text, &cfg.compression);
                    Some((CompressionLevel::L3, rendered))
                }
                CompressionLevel::L3 => None,
            };
            if let Some((level, rendered)) = next {
                self.items[idx].compress_to(level, rendered);
            }
        }
    }

    fn take_checkpoint(&mut self, step: u64, task_state: &str) {
        let hot_ids = self
            .items
            .iter()
            .filter(|i| i.tier == Tier::Hot)
            .map(|i| i.id)
            .collect();
        let warm_ids = self
            .items
            .iter()
            .filter(|i| i.tier == Tier::Warm)
            .map(|i| i.id)
            .collect();
        self.checkpoints.push_back(Checkpoint {
            step,
            task_state: task_state.to_string(),
            hot_ids,
            warm_ids,
            cumulative_tokens: self.cumulative_tokens,
        });
        while self.checkpoints.len() > self.config.checkpoint_ring {
            self.checkpoints.pop_front();
        }
        self.last_checkpoint_step = step;
    }

    pub fn checkpoints(&self) -> impl Iterator<Item = &Checkpoint> {
        self.checkpoints.iter()
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn get(&self, id: u64) -> Option<&ContextItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(PackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filler(tokens: usize) -> String {
        // 4 chars per token under the estimate heuristic.
        "abcd".repeat(tokens)
    }

    #[test]
    fn three_hundred_items_stay_under_budget() {
        let mut store = ContextStore::default();
        for step in 0..300u64 {
            store.insert(
                ContextItemKind::ToolResult,
                &filler(200),
                step,
                Some("search"),
            );
            store.advance(step, None, "test goal", "state");
        }
        let packed = store.pack("system prompt", "task state");
        assert!(packed.total_tokens <= store.config.budget());

        // Items older than 200 steps are at L3.
        let old_l3 = store
            .items()
            .iter()
            .filter(|i| i.age(299) >= 200)
            .all(|i| i.level == CompressionLevel::L3);
        assert!(old_l3);

        // At most 20 items remain verbatim.
        let l0_count = store
            .items()
            .iter()
            .filter(|i| i.level == CompressionLevel::L0)
            .count();
        assert!(l0_count <= 20, "{l0_count} items still at L0");
    }

    #[test]
    fn packing_order_is_fixed() {
        let mut store = ContextStore::default();
        store.insert(ContextItemKind::User, "old warm message", 0, None);
        store.insert(ContextItemKind::User, "fresh hot message", 20, None);
        store.advance(20, None, "goal", "state");
        let packed = store.pack("sys", "task");
        let sources: Vec<SegmentSource> = packed.segments.iter().map(|s| s.source).collect();
        let warm_pos = sources.iter().position(|s| *s == SegmentSource::Warm).unwrap();
        let hot_pos = sources.iter().position(|s| *s == SegmentSource::Hot).unwrap();
        assert_eq!(sources[0], SegmentSource::SystemPrompt);
        assert_eq!(sources[1], SegmentSource::TaskState);
        assert!(warm_pos < hot_pos);
        // The most recent hot item is the final segment.
        assert_eq!(packed.segments.last().unwrap().source, SegmentSource::Hot);
    }

    #[test]
    fn cold_eviction_drops_least_important_first() {
        let config = PackerConfig {
            context_window: 2_000,
            window_ratio: 1.0,
            output_reservation: 0,
            system_prompt_budget: 0,
            ..PackerConfig::default()
        };
        let mut store = ContextStore::new(config);
        let boring = store.insert(ContextItemKind::ToolResult, &filler(300), 0, Some("t"));
        let decision = store.insert(ContextItemKind::Decision, &filler(300), 1, None);
        store.mark_outcome(decision, false, true);
        // Age both into the cold tier.
        store.advance(100, None, "goal", "state");
        let packed = store.pack("", "");
        // Cold budget is 500 tokens; the decision outscores the tool noise.
        if !packed.evicted.is_empty() {
            assert!(packed.evicted.contains(&boring));
            assert!(!packed.evicted.contains(&decision));
        }
    }

    #[test]
    fn checkpoints_ring_is_bounded() {
        let mut store = ContextStore::default();
        for step in 0..3000u64 {
            if step % 10 == 0 {
                store.insert(ContextItemKind::User, "msg", step, None);
            }
            store.advance(step, None, "goal", "state");
        }
        let count = store.checkpoints().count();
        assert!(count <= store.config.checkpoint_ring);
        assert!(count > 0);
    }

    #[test]
    fn recompress_all_escalates_levels() {
        let mut store = ContextStore::default();
        store.insert(ContextItemKind::ToolResult, &filler(100), 0, Some("t"));
        store.recompress_all("goal");
        assert_eq!(store.items()[0].level, CompressionLevel::L1);
        store.recompress_all("goal");
        assert_eq!(store.items()[0].level, CompressionLevel::L2);
    }
}
