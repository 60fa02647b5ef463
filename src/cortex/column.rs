//! Functional columns: per-task-family specialization units.
//!
//! A column bundles preferred tools, a model tier, and weight overrides for
//! one task family. Selection scores keyword affinity blended with learned
//! competence; maintenance merges and prunes weak columns (cortical-map
//! reorganization).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::router::ProcessingPath;

/// One specialization unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionalColumn {
    pub name: String,
    /// Keywords that attract this column.
    pub affinity: Vec<String>,
    pub preferred_tools: Vec<String>,
    /// Model tier this column prefers when selected.
    pub preferred_path: ProcessingPath,
    /// Flat weight-key overrides contributed while the column is active.
    pub weight_overrides: BTreeMap<String, f64>,
    /// Learned competence EMA in [0, 1].
    pub competence: f64,
    pub activations: u64,
}

impl FunctionalColumn {
    pub fn new(name: &str, affinity: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            affinity: affinity.iter().map(|s| s.to_string()).collect(),
            preferred_tools: Vec::new(),
            preferred_path: ProcessingPath::System1,
            weight_overrides: BTreeMap::new(),
            competence: 0.5,
            activations: 0,
        }
    }
}

/// Tunables for column selection and reorganization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnConfig {
    /// EMA step for competence updates.
    pub competence_alpha: f64,
    /// Competence below which an unused column is pruned at maintenance.
    pub prune_competence: f64,
    /// Activations under which a column is prunable.
    pub prune_activations: u64,
    /// Affinity overlap above which two columns merge at maintenance.
    pub merge_overlap: f64,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            competence_alpha: 0.15,
            prune_competence: 0.25,
            prune_activations: 3,
            merge_overlap: 0.8,
        }
    }
}

/// The column manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnManager {
    pub config: ColumnConfig,
    columns: Vec<FunctionalColumn>,
}

impl ColumnManager {
    pub fn new(config: ColumnConfig) -> Self {
        Self {
            config,
            columns: Vec::new(),
        }
    }

    /// A manager seeded with general-purpose columns for common profiles.
    pub fn with_default_columns(config: ColumnConfig) -> Self {
        let mut manager = Self::new(config);
        manager.register(FunctionalColumn::new(
            "coding",
            &["code", "function", "compile", "bug", "test", "implement", "endpoint"],
        ));
        manager.register(FunctionalColumn::new(
            "research",
            &["research", "find", "summarize", "compare", "sources", "papers"],
        ));
        manager.register(FunctionalColumn::new(
            "conversation",
            &["explain", "tell", "what", "how", "why", "weather"],
        ));
        manager
    }

    pub fn register(&mut self, column: FunctionalColumn) {
        self.columns.push(column);
    }

    /// Select the best-matching column for a message, if any scores at all.
    ///
    /// Score = keyword-affinity hit ratio blended with learned competence.
    pub fn select(&mut self, message: &str) -> Option<&FunctionalColumn> {
        let lower = message.to_lowercase();
        let mut best: Option<(usize, f64)> = None;
        for (idx, column) in self.columns.iter().enumerate() {
            if column.affinity.is_empty() {
                continue;
            }
            let hits = column
                .affinity
                .iter()
                .filter(|k| lower.contains(k.as_str()))
                .count();
            if hits == 0 {
                continue;
            }
            let affinity = hits as f64 / column.affinity.len() as f64;
            let score = 0.7 * affinity + 0.3 * column.competence;
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((idx, score)),
            }
        }
        let (idx, _) = best?;
        self.columns[idx].activations += 1;
        Some(&self.columns[idx])
    }

    /// Fold an outcome into a column's competence EMA.
    pub fn record_outcome(&mut self, name: &str, success: bool) {
        let alpha = self.config.competence_alpha;
        if let Some(column) = self.columns.iter_mut().find(|c| c.name == name) {
            let outcome = if success { 1.0 } else { 0.0 };
            column.competence += alpha * (outcome - column.competence);
        }
    }

    /// Maintenance: merge near-duplicate columns and prune weak unused
    /// ones. Returns (merged, pruned) counts.
    pub fn reorganize(&mut self) -> (usize, usize) {
        let mut merged = 0usize;
        // Merge pairs with heavy affinity overlap; the stronger survives.
        let mut idx = 0;
        while idx < self.columns.len() {
            let mut other = idx + 1;
            while other < self.columns.len() {
                if affinity_overlap(&self.columns[idx], &self.columns[other])
                    >= self.config.merge_overlap
                {
                    let (keep, drop) =
                        if self.columns[idx].competence >= self.columns[other].competence {
                            (idx, other)
                        } else {
                            (other, idx)
                        };
                    let dropped = self.columns[drop].clone();
                    self.columns[keep].activations += dropped.activations;
                    for kw in dropped.affinity {
                        if !self.columns[keep].affinity.contains(&kw) {
                            self.columns[keep].affinity.push(kw);
                        }
                    }
                    self.columns.remove(drop);
                    merged += 1;
                    if drop < idx {
                        idx -= 1;
                    }
                    other = idx + 1;
                } else {
                    other += 1;
                }
            }
            idx += 1;
        }

        let before = self.columns.len();
        let prune_competence = self.config.prune_competence;
        let prune_activations = self.config.prune_activations;
        self.columns.retain(|c| {
            c.competence >= prune_competence || c.activations >= prune_activations
        });
        (merged, before - self.columns.len())
    }

    pub fn columns(&self) -> &[FunctionalColumn] {
        &self.columns
    }

    pub fn get(&self, name: &str) -> Option<&FunctionalColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

impl Default for ColumnManager {
    fn default() -> Self {
        Self::with_default_columns(ColumnConfig::default())
    }
}

fn affinity_overlap(a: &FunctionalColumn, b: &FunctionalColumn) -> f64 {
    if a.affinity.is_empty() || b.affinity.is_empty() {
        return 0.0;
    }
    let shared = a.affinity.iter().filter(|k| b.affinity.contains(k)).count();
    shared as f64 / a.affinity.len().min(b.affinity.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_matching_family() {
        let mut manager = ColumnManager::default();
        let column = manager.select("implement a function to compile the test suite");
        assert_eq!(column.unwrap().name, "coding");
    }

    #[test]
    fn no_affinity_no_selection() {
        let mut manager = ColumnManager::new(ColumnConfig::default());
        manager.register(FunctionalColumn::new("niche", &["spectroscopy"]));
        assert!(manager.select("hello there").is_none());
    }

    #[test]
    fn competence_tracks_outcomes() {
        let mut manager = ColumnManager::default();
        for _ in 0..10 {
            manager.record_outcome("coding", true);
        }
        assert!(manager.get("coding").unwrap().competence > 0.7);
        for _ in 0..10 {
            manager.record_outcome("coding", false);
        }
        assert!(manager.get("coding").unwrap().competence < 0.5);
    }

    #[test]
    fn reorganize_merges_duplicates() {
        let mut manager = ColumnManager::new(ColumnConfig::default());
        manager.register(FunctionalColumn::new("a", &["code", "test", "compile"]));
        manager.register(FunctionalColumn::new("b", &["code", "test", "compile", "bug"]));
        let (merged, _) = manager.reorganize();
        assert_eq!(merged, 1);
        assert_eq!(manager.columns().len(), 1);
    }

    #[test]
    fn reorganize_prunes_weak_unused() {
        let mut manager = ColumnManager::new(ColumnConfig::default());
        let mut weak = FunctionalColumn::new("weak", &["zzz"]);
        weak.competence = 0.1;
        manager.register(weak);
        let (_, pruned) = manager.reorganize();
        assert_eq!(pruned, 1);
    }
}
