//! Plasticity rules applied during per-turn consolidation.
//!
//! Three rules run over the weight engine as dictated by the surprise
//! signal: Hebbian strengthening of the combinations active in a successful
//! turn, a homeostatic sweep pulling extreme values toward zero, and a
//! metaplastic pass scaling per-key learning rates by recent volatility.

use serde::{Deserialize, Serialize};

use crate::error::WeightError;

use super::engine::{WeightCategory, WeightEngine};

/// Tunables for the consolidation-time plasticity pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlasticityConfig {
    /// |value| beyond which the homeostatic sweep engages.
    pub extreme_threshold: f64,
    /// Fraction of the overshoot removed per sweep.
    pub sweep_strength: f64,
    /// Volatility above which a key's learning rate is cooled.
    pub volatility_high: f64,
    /// Volatility below which a key's learning rate warms back up.
    pub volatility_low: f64,
    /// Multiplier applied when cooling.
    pub cool_factor: f64,
    /// Multiplier applied when warming.
    pub warm_factor: f64,
    /// Clamp range for the metaplastic multiplier.
    pub lr_scale_min: f64,
    pub lr_scale_max: f64,
}

impl Default for PlasticityConfig {
    fn default() -> Self {
        Self {
            extreme_threshold: 0.8,
            sweep_strength: 0.05,
            volatility_high: 0.1,
            volatility_low: 0.01,
            cool_factor: 0.9,
            warm_factor: 1.05,
            lr_scale_min: 0.25,
            lr_scale_max: 4.0,
        }
    }
}

/// A weight key that participated in the turn being consolidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveKey {
    pub category: WeightCategory,
    pub key: String,
}

/// Outcome of one consolidation pass, for the decision log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlasticityReport {
    pub hebbian_updates: usize,
    pub swept_keys: usize,
    pub cooled_keys: usize,
    pub warmed_keys: usize,
}

/// Apply all three plasticity rules.
///
/// `learning_signal` is the tanh-shaped signal from the surprise computation,
/// signed by outcome direction: positive strengthens the active combination,
/// negative weakens it.
pub fn consolidate(
    engine: &mut WeightEngine,
    active: &[ActiveKey],
    learning_signal: f64,
    config: &PlasticityConfig,
) -> Result<PlasticityReport, WeightError> {
    let mut report = PlasticityReport::default();

    // Hebbian: the keys that fired together this turn move together.
    for key in active {
        engine.update(
            key.category,
            &key.key,
            learning_signal,
            "plasticity",
            "hebbian consolidation",
        )?;
        report.hebbian_updates += 1;
    }

    // Homeostatic sweep: pull extremes toward zero across every category.
    for category in WeightCategory::ALL {
        for (_, state) in engine.states_mut(category) {
            if state.value.abs() > config.extreme_threshold {
                let overshoot = state.value.abs() - config.extreme_threshold;
                state.value -= state.value.signum() * overshoot * config.sweep_strength;
                report.swept_keys += 1;
            }
        }
    }

    // Metaplastic: volatile keys cool down, quiet keys warm back toward 1.
    for category in WeightCategory::ALL {
        for (_, state) in engine.states_mut(category) {
            let vol = state.volatility();
            if vol > config.volatility_high {
                state.lr_scale =
                    (state.lr_scale * config.cool_factor).max(config.lr_scale_min);
                report.cooled_keys += 1;
            } else if vol < config.volatility_low && state.lr_scale < 1.0 {
                state.lr_scale =
                    (state.lr_scale * config.warm_factor).min(config.lr_scale_max);
                report.warmed_keys += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hebbian_strengthens_active_keys() {
        let mut engine = WeightEngine::default();
        let active = vec![ActiveKey {
            category: WeightCategory::Behavioral,
            key: "concise".into(),
        }];
        consolidate(&mut engine, &active, 0.8, &PlasticityConfig::default()).unwrap();
        assert!(engine.get(WeightCategory::Behavioral, "concise").unwrap() > 0.0);
    }

    #[test]
    fn sweep_pulls_extremes_in() {
        let mut engine = WeightEngine::default();
        engine.set_flat("behavioral.hot", 0.95);
        consolidate(&mut engine, &[], 0.0, &PlasticityConfig::default()).unwrap();
        let v = engine.get(WeightCategory::Behavioral, "hot").unwrap();
        assert!(v < 0.95);
        assert!(v > 0.8);
    }

    #[test]
    fn volatile_keys_cool_down() {
        let mut engine = WeightEngine::default();
        // Alternate large deltas to build volatility.
        for i in 0..20 {
            let delta = if i % 2 == 0 { 3.0 } else { -3.0 };
            engine
                .update(WeightCategory::Behavioral, "jumpy", delta, "t", "r")
                .unwrap();
        }
        let report =
            consolidate(&mut engine, &[], 0.0, &PlasticityConfig::default()).unwrap();
        assert!(report.cooled_keys >= 1);
    }
}
