//! Process-wide shared services: trajectory model, user-insight store, and
//! the opt-in global weight aggregator.
//!
//! These are named services with explicit lifetimes; sessions hold a
//! handle, never an ambient singleton. A mutex guards the trajectory model
//! so only one writer proceeds at a time; the insight store partitions by
//! user id; the aggregator receives periodic snapshot diffs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// First-order task-transition model shared across sessions of a user.
///
/// Predicts the next task family from the current one; the distance between
/// prediction and observation is the router's task-novelty signal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrajectoryModel {
    transitions: BTreeMap<String, BTreeMap<String, u64>>,
    last_task: Option<String>,
}

impl TrajectoryModel {
    /// Observe a task family and return its novelty in [0, 1]:
    /// 1 − P(observed | predicted-from-last).
    pub fn observe(&mut self, task: &str) -> f64 {
        let novelty = match &self.last_task {
            None => 0.5,
            Some(last) => {
                let row = self.transitions.get(last);
                match row {
                    None => 1.0,
                    Some(counts) => {
                        let total: u64 = counts.values().sum();
                        let seen = counts.get(task).copied().unwrap_or(0);
                        if total == 0 {
                            1.0
                        } else {
                            1.0 - seen as f64 / total as f64
                        }
                    }
                }
            }
        };
        if let Some(last) = self.last_task.take() {
            *self
                .transitions
                .entry(last)
                .or_default()
                .entry(task.to_string())
                .or_default() += 1;
        }
        self.last_task = Some(task.to_string());
        novelty
    }

    /// Most likely next task family, if the model has seen this state.
    pub fn predict_next(&self) -> Option<&str> {
        let last = self.last_task.as_deref()?;
        self.transitions
            .get(last)?
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(task, _)| task.as_str())
    }
}

/// Per-user cross-session insight scores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInsights {
    pub scores: BTreeMap<String, f64>,
}

/// Opt-in aggregator of per-category weight means across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalWeightAggregator {
    sums: BTreeMap<String, f64>,
    counts: BTreeMap<String, u64>,
}

impl GlobalWeightAggregator {
    /// Absorb one snapshot diff of per-key weight values.
    pub fn absorb(&mut self, values: &BTreeMap<String, f64>) {
        for (key, value) in values {
            *self.sums.entry(key.clone()).or_default() += value;
            *self.counts.entry(key.clone()).or_default() += 1;
        }
    }

    /// Mean observed value for a key.
    pub fn mean(&self, key: &str) -> Option<f64> {
        let sum = self.sums.get(key)?;
        let count = self.counts.get(key)?;
        if *count == 0 {
            None
        } else {
            Some(sum / *count as f64)
        }
    }
}

/// The shared-service bundle sessions hold a handle to.
///
/// Lifetime is explicit: created by the runtime at init, dropped at
/// shutdown.
#[derive(Debug, Default)]
pub struct SharedServices {
    /// One writer at a time; sessions briefly lock around observe calls.
    trajectory: Mutex<TrajectoryModel>,
    /// Partitioned per user id.
    insights: DashMap<String, UserInsights>,
    /// Present only when global aggregation is opted in.
    aggregator: Option<Mutex<GlobalWeightAggregator>>,
}

impl SharedServices {
    pub fn new(enable_global_aggregation: bool) -> Arc<Self> {
        Arc::new(Self {
            trajectory: Mutex::new(TrajectoryModel::default()),
            insights: DashMap::new(),
            aggregator: enable_global_aggregation
                .then(|| Mutex::new(GlobalWeightAggregator::default())),
        })
    }

    /// Observe a task transition, returning its novelty.
    pub fn observe_task(&self, task: &str) -> f64 {
        match self.trajectory.lock() {
            Ok(mut model) => model.observe(task),
            Err(_) => 0.5,
        }
    }

    /// Read an insight score for a user.
    pub fn insight(&self, user: &str, key: &str) -> Option<f64> {
        self.insights
            .get(user)
            .and_then(|i| i.scores.get(key).copied())
    }

    /// Write an insight score for a user.
    pub fn record_insight(&self, user: &str, key: &str, value: f64) {
        self.insights
            .entry(user.to_string())
            .or_default()
            .scores
            .insert(key.to_string(), value);
    }

    /// Push a snapshot diff to the aggregator, if enabled.
    pub fn aggregate_weights(&self, values: &BTreeMap<String, f64>) {
        if let Some(aggregator) = &self.aggregator {
            if let Ok(mut agg) = aggregator.lock() {
                agg.absorb(values);
            }
        }
    }

    /// Global mean for a weight key, if aggregation is enabled.
    pub fn global_mean(&self, key: &str) -> Option<f64> {
        let aggregator = self.aggregator.as_ref()?;
        aggregator.lock().ok()?.mean(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_transitions_lose_novelty() {
        let mut model = TrajectoryModel::default();
        model.observe("coding");
        let first = model.observe("testing");
        model.observe("coding");
        let second = model.observe("testing");
        assert!(first > second);
        assert!(second < 0.5);
    }

    #[test]
    fn predict_next_follows_counts() {
        let mut model = TrajectoryModel::default();
        for _ in 0..3 {
            model.observe("coding");
            model.observe("testing");
        }
        model.observe("coding");
        assert_eq!(model.predict_next(), Some("testing"));
    }

    #[test]
    fn insights_partition_by_user() {
        let services = SharedServices::new(false);
        services.record_insight("alice", "prefers_brevity", 0.8);
        assert_eq!(services.insight("alice", "prefers_brevity"), Some(0.8));
        assert_eq!(services.insight("bob", "prefers_brevity"), None);
    }

    #[test]
    fn aggregator_is_opt_in() {
        let off = SharedServices::new(false);
        let mut diff = BTreeMap::new();
        diff.insert("behavioral.verbosity".to_string(), 0.4);
        off.aggregate_weights(&diff);
        assert_eq!(off.global_mean("behavioral.verbosity"), None);

        let on = SharedServices::new(true);
        on.aggregate_weights(&diff);
        diff.insert("behavioral.verbosity".to_string(), 0.6);
        on.aggregate_weights(&diff);
        let mean = on.global_mean("behavioral.verbosity").unwrap();
        assert!((mean - 0.5).abs() < 1e-9);
    }
}
