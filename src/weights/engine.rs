//! Seven-category weight engine with Bayesian tool posteriors.
//!
//! Maintains named floating-point weights per category, each updated through
//! a momentum + homeostatic-pull rule, plus per-tool Beta/Gamma posteriors,
//! EMA preferences with loss-averse depression, and Thompson sampling for
//! tool choice. All maps are ordered so snapshots serialize deterministically.

use std::collections::{BTreeMap, VecDeque};

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::WeightError;

use super::posterior::{BetaPosterior, GammaPosterior, DEFAULT_DECAY};
use super::prospect::ProspectConfig;

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

/// The seven weight categories. Each selects a learning rate, an update
/// policy, and a clamp range.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum WeightCategory {
    Behavioral,
    ToolPreference,
    ModelSelection,
    GoalAlignment,
    UserInsight,
    Enterprise,
    Global,
}

impl WeightCategory {
    /// All categories, in canonical order.
    pub const ALL: [Self; 7] = [
        Self::Behavioral,
        Self::ToolPreference,
        Self::ModelSelection,
        Self::GoalAlignment,
        Self::UserInsight,
        Self::Enterprise,
        Self::Global,
    ];

    /// Clamp range for values in this category.
    ///
    /// Behavioral and goal-alignment weights are signed; preference and
    /// model scores live in [0, 1].
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::Behavioral | Self::GoalAlignment => (-1.0, 1.0),
            _ => (0.0, 1.0),
        }
    }

    /// Canonical lowercase name, used in flat weight keys and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Behavioral => "behavioral",
            Self::ToolPreference => "tool_preference",
            Self::ModelSelection => "model_selection",
            Self::GoalAlignment => "goal_alignment",
            Self::UserInsight => "user_insight",
            Self::Enterprise => "enterprise",
            Self::Global => "global",
        }
    }

    /// Parse a category from its canonical name.
    pub fn parse(name: &str) -> Result<Self, WeightError> {
        match name {
            "behavioral" => Ok(Self::Behavioral),
            "tool_preference" => Ok(Self::ToolPreference),
            "model_selection" => Ok(Self::ModelSelection),
            "goal_alignment" => Ok(Self::GoalAlignment),
            "user_insight" => Ok(Self::UserInsight),
            "enterprise" => Ok(Self::Enterprise),
            "global" => Ok(Self::Global),
            other => Err(WeightError::UnknownCategory { name: other.into() }),
        }
    }
}

impl std::fmt::Display for WeightCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-category learning rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningRates {
    pub behavioral: f64,
    pub tool_preference: f64,
    pub model_selection: f64,
    pub goal_alignment: f64,
    pub user_insight: f64,
    pub enterprise: f64,
    pub global: f64,
}

impl Default for LearningRates {
    fn default() -> Self {
        Self {
            behavioral: 0.10,
            tool_preference: 0.15,
            model_selection: 0.10,
            goal_alignment: 0.12,
            user_insight: 0.05,
            enterprise: 0.02,
            global: 0.01,
        }
    }
}

impl LearningRates {
    pub fn for_category(&self, category: WeightCategory) -> f64 {
        match category {
            WeightCategory::Behavioral => self.behavioral,
            WeightCategory::ToolPreference => self.tool_preference,
            WeightCategory::ModelSelection => self.model_selection,
            WeightCategory::GoalAlignment => self.goal_alignment,
            WeightCategory::UserInsight => self.user_insight,
            WeightCategory::Enterprise => self.enterprise,
            WeightCategory::Global => self.global,
        }
    }
}

/// Tunables for the weight engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub learning_rates: LearningRates,
    /// Fraction of the momentum EMA added to each update.
    pub momentum_carry: f64,
    /// Strength of the homeostatic pull toward zero per update.
    pub homeostatic_pull: f64,
    /// Capacity of the WeightUpdate event ring.
    pub event_capacity: usize,
    /// Multiplicative posterior decay per maintenance pass.
    pub posterior_decay: f64,
    /// EMA step for the per-tool preference score.
    pub preference_alpha: f64,
    /// Long-term potentiation bonus applied to the preference on success.
    pub potentiation_bonus: f64,
    /// Window for the recent-success anomaly filter.
    pub recent_window: usize,
    /// Recent-vs-long success divergence that flags a tool anomalous.
    pub anomaly_threshold: f64,
    /// Window of per-key deltas kept for metaplasticity.
    pub delta_window: usize,
    pub prospect: ProspectConfig,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            learning_rates: LearningRates::default(),
            momentum_carry: 0.7,
            homeostatic_pull: 0.01,
            event_capacity: 256,
            posterior_decay: DEFAULT_DECAY,
            preference_alpha: 0.2,
            potentiation_bonus: 0.03,
            recent_window: 10,
            anomaly_threshold: 0.3,
            delta_window: 20,
            prospect: ProspectConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// State of a single named weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightState {
    pub value: f64,
    /// Exponential average of recent applied deltas, bounded in [−1, 1].
    pub momentum: f64,
    /// Metaplastic per-key learning-rate multiplier.
    pub lr_scale: f64,
    pub update_count: u64,
    /// Recent applied deltas, for volatility estimation.
    pub recent_deltas: VecDeque<f64>,
}

impl Default for WeightState {
    fn default() -> Self {
        Self {
            value: 0.0,
            momentum: 0.0,
            lr_scale: 1.0,
            update_count: 0,
            recent_deltas: VecDeque::new(),
        }
    }
}

impl WeightState {
    /// Standard deviation of recent deltas. Zero with fewer than 2 samples.
    pub fn volatility(&self) -> f64 {
        let n = self.recent_deltas.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.recent_deltas.iter().sum::<f64>() / n as f64;
        let var = self
            .recent_deltas
            .iter()
            .map(|d| (d - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        var.sqrt()
    }
}

/// A recorded weight update, kept in a bounded ring buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightUpdate {
    pub seq: u64,
    pub category: WeightCategory,
    pub key: String,
    pub requested_delta: f64,
    pub applied_delta: f64,
    pub value_after: f64,
    pub source: String,
    pub reason: String,
}

/// One entry of an atomic update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub category: WeightCategory,
    pub key: String,
    pub delta: f64,
    pub source: String,
    pub reason: String,
}

/// Per-tool statistics: posteriors, preference EMA, streaks, windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStats {
    pub quality: BetaPosterior,
    pub latency: GammaPosterior,
    /// EMA preference score in [0, 1], potentiated on success and
    /// depressed loss-aversely on failure.
    pub preference: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Recent outcomes for the availability filter.
    pub recent: VecDeque<bool>,
    pub long_successes: u64,
    pub long_total: u64,
}

impl Default for ToolStats {
    fn default() -> Self {
        Self {
            quality: BetaPosterior::flat(),
            latency: GammaPosterior::default(),
            preference: 0.5,
            consecutive_successes: 0,
            consecutive_failures: 0,
            recent: VecDeque::new(),
            long_successes: 0,
            long_total: 0,
        }
    }
}

impl ToolStats {
    /// Success rate over the recent window, or None without observations.
    pub fn recent_rate(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let hits = self.recent.iter().filter(|&&b| b).count();
        Some(hits as f64 / self.recent.len() as f64)
    }

    /// Success rate over the full history, or None without observations.
    pub fn long_rate(&self) -> Option<f64> {
        if self.long_total == 0 {
            return None;
        }
        Some(self.long_successes as f64 / self.long_total as f64)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The weight engine: seven categories of named weights, per-tool posteriors,
/// and the bounded update-event ring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightEngine {
    pub config: WeightConfig,
    weights: BTreeMap<WeightCategory, BTreeMap<String, WeightState>>,
    tools: BTreeMap<String, ToolStats>,
    events: VecDeque<WeightUpdate>,
    next_seq: u64,
}

impl WeightEngine {
    pub fn new(config: WeightConfig) -> Self {
        let mut weights = BTreeMap::new();
        for cat in WeightCategory::ALL {
            weights.insert(cat, BTreeMap::new());
        }
        Self {
            config,
            weights,
            tools: BTreeMap::new(),
            events: VecDeque::new(),
            next_seq: 0,
        }
    }

    /// Current value of a weight, if it exists.
    pub fn get(&self, category: WeightCategory, key: &str) -> Option<f64> {
        self.weights
            .get(&category)
            .and_then(|m| m.get(key))
            .map(|s| s.value)
    }

    /// Seed a previously unseen key from an anchor. No-op if the key exists.
    ///
    /// The initial value is the anchor's prior mean mapped into the
    /// category's clamp range; the anchor also seeds the tool's Beta
    /// posterior when the category is tool preference.
    pub fn seed_anchor(
        &mut self,
        category: WeightCategory,
        key: &str,
        prior_mean: f64,
        confidence: f64,
    ) {
        let (lo, hi) = category.bounds();
        let map = self.weights.entry(category).or_default();
        if !map.contains_key(key) {
            let value = (lo + prior_mean.clamp(0.0, 1.0) * (hi - lo)).clamp(lo, hi);
            map.insert(
                key.to_string(),
                WeightState {
                    value,
                    ..WeightState::default()
                },
            );
        }
        if category == WeightCategory::ToolPreference && !self.tools.contains_key(key) {
            let mut stats = ToolStats::default();
            stats.quality = BetaPosterior::from_anchor(prior_mean, confidence);
            stats.preference = prior_mean.clamp(0.0, 1.0);
            self.tools.insert(key.to_string(), stats);
        }
    }

    /// Apply a delta to a weight and return the applied (post-clamp) delta.
    ///
    /// The update is scaled by the category learning rate and the key's
    /// metaplastic multiplier, carries 0.7 of the momentum EMA, and is
    /// followed by a homeostatic pull of 0.01·value toward zero.
    pub fn update(
        &mut self,
        category: WeightCategory,
        key: &str,
        delta: f64,
        source: &str,
        reason: &str,
    ) -> Result<f64, WeightError> {
        if !delta.is_finite() {
            return Err(WeightError::Invariant {
                detail: format!("non-finite delta for {category}.{key}"),
            });
        }
        let lr = self.config.learning_rates.for_category(category);
        let (lo, hi) = category.bounds();
        let carry = self.config.momentum_carry;
        let pull = self.config.homeostatic_pull;
        let delta_window = self.config.delta_window;

        let state = self
            .weights
            .entry(category)
            .or_default()
            .entry(key.to_string())
            .or_default();

        let scaled = delta * lr * state.lr_scale;
        let nudge = scaled + carry * state.momentum - pull * state.value;
        let before = state.value;
        state.value = (state.value + nudge).clamp(lo, hi);
        let applied = state.value - before;

        state.momentum = (carry * state.momentum + (1.0 - carry) * applied).clamp(-1.0, 1.0);
        state.update_count += 1;
        state.recent_deltas.push_back(applied);
        while state.recent_deltas.len() > delta_window {
            state.recent_deltas.pop_front();
        }
        let value_after = state.value;

        self.push_event(WeightUpdate {
            seq: 0,
            category,
            key: key.to_string(),
            requested_delta: delta,
            applied_delta: applied,
            value_after,
            source: source.to_string(),
            reason: reason.to_string(),
        });
        Ok(applied)
    }

    fn push_event(&mut self, mut event: WeightUpdate) {
        event.seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back(event);
        while self.events.len() > self.config.event_capacity {
            self.events.pop_front();
        }
    }

    /// Atomic batch: either every entry applies or none does.
    pub fn apply_update_batch(
        &mut self,
        entries: &[BatchEntry],
    ) -> Result<BTreeMap<String, f64>, WeightError> {
        for entry in entries {
            if !entry.delta.is_finite() {
                return Err(WeightError::BatchRejected {
                    reason: format!(
                        "non-finite delta for {}.{}",
                        entry.category, entry.key
                    ),
                });
            }
        }
        let mut applied = BTreeMap::new();
        for entry in entries {
            let d = self.update(
                entry.category,
                &entry.key,
                entry.delta,
                &entry.source,
                &entry.reason,
            )?;
            applied.insert(format!("{}.{}", entry.category, entry.key), d);
        }
        Ok(applied)
    }

    /// Record a tool invocation outcome.
    ///
    /// Updates the Beta posterior (conjugate), the Gamma latency posterior,
    /// the EMA preference with long-term potentiation on success or a
    /// loss-averse depression on failure, the streak counters, and the
    /// availability windows.
    pub fn record_tool_outcome(&mut self, tool: &str, success: bool, latency_ms: f64) {
        let alpha = self.config.preference_alpha;
        let bonus = self.config.potentiation_bonus;
        let aversion = self.config.prospect.loss_aversion;
        let window = self.config.recent_window;

        let stats = self.tools.entry(tool.to_string()).or_default();
        stats.quality.observe(success);
        stats.latency.observe_ms(latency_ms);

        let outcome = if success { 1.0 } else { 0.0 };
        stats.preference += alpha * (outcome - stats.preference);
        if success {
            stats.preference += bonus;
            stats.consecutive_successes += 1;
            stats.consecutive_failures = 0;
            stats.long_successes += 1;
        } else {
            stats.preference -= bonus * aversion;
            stats.consecutive_failures += 1;
            stats.consecutive_successes = 0;
        }
        stats.preference = stats.preference.clamp(0.0, 1.0);
        stats.long_total += 1;
        stats.recent.push_back(success);
        while stats.recent.len() > window {
            stats.recent.pop_front();
        }
    }

    /// Availability filter: a tool is anomalous when its recent-window
    /// success rate deviates from the long-window rate by more than the
    /// configured threshold.
    pub fn tool_anomalous(&self, tool: &str) -> bool {
        let Some(stats) = self.tools.get(tool) else {
            return false;
        };
        match (stats.recent_rate(), stats.long_rate()) {
            (Some(recent), Some(long)) if stats.long_total as usize > self.config.recent_window => {
                (recent - long).abs() > self.config.anomaly_threshold
            }
            _ => false,
        }
    }

    /// Thompson sampling over candidate tools.
    ///
    /// Draws one sample from each candidate's Beta posterior and returns the
    /// argmax. With a speed weight w_s the score blends the quality sample
    /// (1−w_s) with an exponentially mapped latency speed
    /// (w_s · exp(−mean_latency_ms/1000)).
    pub fn best_tool_thompson(
        &self,
        candidates: &[String],
        speed_weight: f64,
        rng: &mut ChaCha8Rng,
    ) -> Result<String, WeightError> {
        if candidates.is_empty() {
            return Err(WeightError::EmptyCandidates);
        }
        let w_s = speed_weight.clamp(0.0, 1.0);
        let mut best: Option<(&str, f64)> = None;
        for name in candidates {
            let stats = self.tools.get(name).cloned().unwrap_or_default();
            let quality = stats.quality.sample(rng)?;
            let speed = (-stats.latency.mean_latency_ms() / 1000.0).exp();
            let score = (1.0 - w_s) * quality + w_s * speed;
            match best {
                Some((_, s)) if s >= score => {}
                _ => best = Some((name, score)),
            }
        }
        // candidates is non-empty, so best is always set here
        Ok(best.map(|(n, _)| n.to_string()).unwrap_or_default())
    }

    /// Flat view of one category: key → value.
    pub fn category_values(&self, category: WeightCategory) -> BTreeMap<String, f64> {
        self.weights
            .get(&category)
            .map(|m| m.iter().map(|(k, s)| (k.clone(), s.value)).collect())
            .unwrap_or_default()
    }

    /// Flat view of every weight keyed "category.name", the form the
    /// modulator overlay targets.
    pub fn flat_values(&self) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        for (cat, map) in &self.weights {
            for (key, state) in map {
                out.insert(format!("{cat}.{key}"), state.value);
            }
        }
        out
    }

    /// Write a flat value back, clamping to the category range. Unknown
    /// categories in the flat key are ignored (modulators may target keys
    /// that only exist as overlay outputs).
    pub fn set_flat(&mut self, flat_key: &str, value: f64) {
        let Some((cat_name, key)) = flat_key.split_once('.') else {
            return;
        };
        let Ok(category) = WeightCategory::parse(cat_name) else {
            return;
        };
        let (lo, hi) = category.bounds();
        let state = self
            .weights
            .entry(category)
            .or_default()
            .entry(key.to_string())
            .or_default();
        state.value = value.clamp(lo, hi);
    }

    /// Iterate weight states of one category mutably (plasticity rules).
    pub(crate) fn states_mut(
        &mut self,
        category: WeightCategory,
    ) -> impl Iterator<Item = (&String, &mut WeightState)> {
        self.weights.entry(category).or_default().iter_mut()
    }

    /// Per-tool statistics, if recorded.
    pub fn tool_stats(&self, tool: &str) -> Option<&ToolStats> {
        self.tools.get(tool)
    }

    /// All tool names with recorded statistics.
    pub fn known_tools(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// The bounded update-event ring, oldest first.
    pub fn events(&self) -> impl Iterator<Item = &WeightUpdate> {
        self.events.iter()
    }

    /// Recent applied deltas across all categories, newest last.
    pub fn recent_applied_deltas(&self, n: usize) -> Vec<f64> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).map(|e| e.applied_delta).collect()
    }

    /// Maintenance decay: multiply every posterior by the configured factor.
    pub fn decay_posteriors(&mut self) {
        let factor = self.config.posterior_decay;
        for stats in self.tools.values_mut() {
            stats.quality.decay(factor);
            stats.latency.decay(factor);
        }
    }

    /// Validate engine-wide numeric invariants.
    pub fn check_invariants(&self) -> Result<(), WeightError> {
        for (cat, map) in &self.weights {
            let (lo, hi) = cat.bounds();
            for (key, state) in map {
                if !state.value.is_finite() || state.value < lo || state.value > hi {
                    return Err(WeightError::Invariant {
                        detail: format!("{cat}.{key} = {} outside [{lo}, {hi}]", state.value),
                    });
                }
                if state.momentum.abs() > 1.0 {
                    return Err(WeightError::Invariant {
                        detail: format!("{cat}.{key} momentum {} outside [-1, 1]", state.momentum),
                    });
                }
            }
        }
        for (name, stats) in &self.tools {
            stats.quality.check().map_err(|e| WeightError::Invariant {
                detail: format!("tool {name}: {e}"),
            })?;
        }
        Ok(())
    }
}

impl Default for WeightEngine {
    fn default() -> Self {
        Self::new(WeightConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn update_clamps_and_records() {
        let mut engine = WeightEngine::default();
        for _ in 0..200 {
            engine
                .update(WeightCategory::Behavioral, "verbosity", 10.0, "test", "push up")
                .unwrap();
        }
        let v = engine.get(WeightCategory::Behavioral, "verbosity").unwrap();
        assert!(v <= 1.0);
        assert!(engine.events().count() <= engine.config.event_capacity);
        engine.check_invariants().unwrap();
    }

    #[test]
    fn homeostatic_pull_resists_extremes() {
        let mut engine = WeightEngine::default();
        // Start from a hot value with no momentum history.
        engine.set_flat("behavioral.w", 0.8);
        for _ in 0..10 {
            engine
                .update(WeightCategory::Behavioral, "w", 0.0, "t", "r")
                .unwrap();
        }
        let decayed = engine.get(WeightCategory::Behavioral, "w").unwrap();
        assert!(decayed < 0.8);
    }

    #[test]
    fn batch_is_atomic() {
        let mut engine = WeightEngine::default();
        let entries = vec![
            BatchEntry {
                category: WeightCategory::Behavioral,
                key: "a".into(),
                delta: 0.5,
                source: "t".into(),
                reason: "r".into(),
            },
            BatchEntry {
                category: WeightCategory::Behavioral,
                key: "b".into(),
                delta: f64::NAN,
                source: "t".into(),
                reason: "r".into(),
            },
        ];
        let err = engine.apply_update_batch(&entries).unwrap_err();
        assert!(matches!(err, WeightError::BatchRejected { .. }));
        assert!(engine.get(WeightCategory::Behavioral, "a").is_none());
    }

    #[test]
    fn tool_outcomes_move_posterior_and_streaks() {
        let mut engine = WeightEngine::default();
        for _ in 0..5 {
            engine.record_tool_outcome("search", true, 300.0);
        }
        engine.record_tool_outcome("search", false, 900.0);
        let stats = engine.tool_stats("search").unwrap();
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.consecutive_successes, 0);
        // Beta(1+5, 1+1): mean 6/8.
        assert!((stats.quality.mean() - 0.75).abs() < 1e-9);
        assert_eq!(stats.long_total, 6);
    }

    #[test]
    fn loss_averse_depression_outweighs_potentiation() {
        let mut engine = WeightEngine::default();
        engine.record_tool_outcome("t", true, 100.0);
        let after_success = engine.tool_stats("t").unwrap().preference;
        let gain = after_success - 0.5;

        let mut engine2 = WeightEngine::default();
        engine2.record_tool_outcome("t", false, 100.0);
        let after_failure = engine2.tool_stats("t").unwrap().preference;
        let loss = 0.5 - after_failure;
        assert!(loss > gain);
    }

    #[test]
    fn thompson_prefers_dominant_tool() {
        let mut engine = WeightEngine::default();
        for _ in 0..40 {
            engine.record_tool_outcome("good", true, 200.0);
            engine.record_tool_outcome("bad", false, 200.0);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let candidates = vec!["good".to_string(), "bad".to_string()];
        let mut good = 0;
        for _ in 0..20 {
            if engine.best_tool_thompson(&candidates, 0.0, &mut rng).unwrap() == "good" {
                good += 1;
            }
        }
        assert!(good >= 18, "good chosen only {good}/20 times");
    }

    #[test]
    fn thompson_speed_weight_prefers_fast_tool() {
        let mut engine = WeightEngine::default();
        for _ in 0..40 {
            engine.record_tool_outcome("fast", true, 50.0);
            engine.record_tool_outcome("slow", true, 5000.0);
        }
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let candidates = vec!["fast".to_string(), "slow".to_string()];
        let mut fast = 0;
        for _ in 0..20 {
            if engine.best_tool_thompson(&candidates, 1.0, &mut rng).unwrap() == "fast" {
                fast += 1;
            }
        }
        assert_eq!(fast, 20);
    }

    #[test]
    fn anomaly_filter_flags_divergence() {
        let mut engine = WeightEngine::default();
        // Long history of success, then a recent run of failures.
        for _ in 0..30 {
            engine.record_tool_outcome("t", true, 100.0);
        }
        for _ in 0..10 {
            engine.record_tool_outcome("t", false, 100.0);
        }
        assert!(engine.tool_anomalous("t"));
        assert!(!engine.tool_anomalous("never_seen"));
    }

    #[test]
    fn anchor_seeds_value_and_posterior() {
        let mut engine = WeightEngine::default();
        engine.seed_anchor(WeightCategory::ToolPreference, "kb_lookup", 0.8, 0.9);
        assert!((engine.get(WeightCategory::ToolPreference, "kb_lookup").unwrap() - 0.8).abs() < 1e-9);
        let stats = engine.tool_stats("kb_lookup").unwrap();
        assert!((stats.quality.mean() - 0.8).abs() < 1e-6);
        assert!(stats.quality.strength() <= 22.0 + 1e-9);
    }

    #[test]
    fn flat_keys_round_trip() {
        let mut engine = WeightEngine::default();
        engine
            .update(WeightCategory::Behavioral, "detail", 1.0, "t", "r")
            .unwrap();
        let flat = engine.flat_values();
        assert!(flat.contains_key("behavioral.detail"));
        engine.set_flat("behavioral.detail", 5.0);
        assert!((engine.get(WeightCategory::Behavioral, "detail").unwrap() - 1.0).abs() < 1e-9);
    }
}
