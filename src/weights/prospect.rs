//! Prospect-theoretic value and probability-weighting functions.
//!
//! Outcome-driven nudges on behavioral and goal-alignment weights are shaped
//! by Kahneman-Tversky curves: diminishing sensitivity (exponent 0.88),
//! loss aversion (losses weighted 2.25×), and inverse-S probability
//! weighting (γ = 0.61).

use serde::{Deserialize, Serialize};

/// Diminishing-sensitivity exponent for gains and losses.
pub const VALUE_EXPONENT: f64 = 0.88;

/// Loss-aversion multiplier applied to losses.
pub const LOSS_AVERSION: f64 = 2.25;

/// Curvature of the probability-weighting function.
pub const WEIGHTING_GAMMA: f64 = 0.61;

/// Tunables for prospect-theoretic updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProspectConfig {
    pub value_exponent: f64,
    pub loss_aversion: f64,
    pub weighting_gamma: f64,
    /// Reference point against which outcome quality is judged.
    pub reference_point: f64,
}

impl Default for ProspectConfig {
    fn default() -> Self {
        Self {
            value_exponent: VALUE_EXPONENT,
            loss_aversion: LOSS_AVERSION,
            weighting_gamma: WEIGHTING_GAMMA,
            reference_point: 0.5,
        }
    }
}

/// Subjective value of an outcome relative to the reference point.
///
/// value(x) = x^0.88 for gains; −2.25·|x|^0.88 for losses.
pub fn value(x: f64, config: &ProspectConfig) -> f64 {
    if x >= 0.0 {
        x.powf(config.value_exponent)
    } else {
        -config.loss_aversion * x.abs().powf(config.value_exponent)
    }
}

/// Inverse-S probability weighting: w(p) = p^γ / (p^γ + (1−p)^γ)^(1/γ).
///
/// Overweights small probabilities and underweights large ones.
pub fn weight_probability(p: f64, config: &ProspectConfig) -> f64 {
    let p = p.clamp(0.0, 1.0);
    let g = config.weighting_gamma;
    let num = p.powf(g);
    let den = (p.powf(g) + (1.0 - p).powf(g)).powf(1.0 / g);
    if den == 0.0 { 0.0 } else { num / den }
}

/// Delta applied to a weight for an observed outcome quality:
/// lr · value(outcome_quality − reference_point).
pub fn prospect_delta(outcome_quality: f64, lr: f64, config: &ProspectConfig) -> f64 {
    lr * value(outcome_quality - config.reference_point, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn losses_loom_larger_than_gains() {
        let cfg = ProspectConfig::default();
        let gain = value(0.3, &cfg);
        let loss = value(-0.3, &cfg);
        assert!(loss.abs() > gain.abs());
        assert!((loss.abs() / gain - LOSS_AVERSION).abs() < 1e-9);
    }

    #[test]
    fn value_is_monotone() {
        let cfg = ProspectConfig::default();
        let mut prev = f64::NEG_INFINITY;
        for i in -10..=10 {
            let v = value(i as f64 / 10.0, &cfg);
            assert!(v >= prev);
            prev = v;
        }
    }

    #[test]
    fn weighting_fixed_points() {
        let cfg = ProspectConfig::default();
        assert!(weight_probability(0.0, &cfg).abs() < 1e-9);
        assert!((weight_probability(1.0, &cfg) - 1.0).abs() < 1e-9);
        // Inverse-S: small probabilities are overweighted.
        assert!(weight_probability(0.05, &cfg) > 0.05);
        // Large probabilities are underweighted.
        assert!(weight_probability(0.95, &cfg) < 0.95);
    }

    #[test]
    fn delta_sign_follows_reference() {
        let cfg = ProspectConfig::default();
        assert!(prospect_delta(0.9, 0.1, &cfg) > 0.0);
        assert!(prospect_delta(0.1, 0.1, &cfg) < 0.0);
        // Loss-averse: the penalty for 0.1 exceeds the bonus for 0.9.
        assert!(prospect_delta(0.1, 0.1, &cfg).abs() > prospect_delta(0.9, 0.1, &cfg).abs());
    }
}
