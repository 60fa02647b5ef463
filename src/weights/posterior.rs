//! Conjugate posteriors for tool and model outcomes.
//!
//! Two kinds are first-class: Beta(α,β) for binary success/failure and
//! Gamma(shape, rate) for latency distributions. Both decay multiplicatively
//! to model non-stationarity, and both can be seeded from informed anchors.

use rand::distributions::Distribution;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, Gamma};

use crate::error::WeightError;

/// Lower bound for posterior parameters. α,β ≥ ε keeps the distributions proper.
pub const POSTERIOR_EPSILON: f64 = 1e-3;

/// Default multiplicative decay applied to both Beta parameters per decay pass.
pub const DEFAULT_DECAY: f64 = 0.99;

/// Maximum pseudo-count an informed anchor may seed (α + β ≤ 22).
pub const MAX_ANCHOR_PSEUDO_COUNT: f64 = 22.0;

/// Minimum pseudo-count an anchor seeds, even at zero confidence.
pub const MIN_ANCHOR_PSEUDO_COUNT: f64 = 2.0;

// ---------------------------------------------------------------------------
// Beta posterior
// ---------------------------------------------------------------------------

/// Beta(α,β) posterior over a binary success probability.
///
/// A flat Beta(1,1) represents complete uncertainty. Conjugate updates:
/// success increments α, failure increments β.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for BetaPosterior {
    fn default() -> Self {
        Self::flat()
    }
}

impl BetaPosterior {
    /// The flat prior Beta(1,1).
    pub fn flat() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }

    /// Seed from an anchor: a prior mean with a confidence in [0,1].
    ///
    /// Confidence maps linearly to an effective pseudo-count between 2 and 22,
    /// so high-confidence anchors resist early evidence.
    pub fn from_anchor(prior_mean: f64, confidence: f64) -> Self {
        let mean = prior_mean.clamp(POSTERIOR_EPSILON, 1.0 - POSTERIOR_EPSILON);
        let confidence = confidence.clamp(0.0, 1.0);
        let pseudo = MIN_ANCHOR_PSEUDO_COUNT
            + confidence * (MAX_ANCHOR_PSEUDO_COUNT - MIN_ANCHOR_PSEUDO_COUNT);
        Self {
            alpha: (mean * pseudo).max(POSTERIOR_EPSILON),
            beta: ((1.0 - mean) * pseudo).max(POSTERIOR_EPSILON),
        }
    }

    /// Conjugate update: success → α += 1, failure → β += 1.
    pub fn observe(&mut self, success: bool) {
        if success {
            self.alpha += 1.0;
        } else {
            self.beta += 1.0;
        }
    }

    /// Multiply both parameters by `factor`, flooring at ε.
    pub fn decay(&mut self, factor: f64) {
        self.alpha = (self.alpha * factor).max(POSTERIOR_EPSILON);
        self.beta = (self.beta * factor).max(POSTERIOR_EPSILON);
    }

    /// Posterior mean α/(α+β).
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Total pseudo-observations α+β.
    pub fn strength(&self) -> f64 {
        self.alpha + self.beta
    }

    /// Draw one sample from the posterior.
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Result<f64, WeightError> {
        let dist = Beta::new(self.alpha, self.beta).map_err(|e| WeightError::Invariant {
            detail: format!("Beta({}, {}) not constructible: {e}", self.alpha, self.beta),
        })?;
        Ok(dist.sample(rng))
    }

    /// Validate the ε floor invariant.
    pub fn check(&self) -> Result<(), WeightError> {
        if self.alpha < POSTERIOR_EPSILON || self.beta < POSTERIOR_EPSILON {
            return Err(WeightError::Invariant {
                detail: format!(
                    "Beta parameters below epsilon: alpha={}, beta={}",
                    self.alpha, self.beta
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Gamma posterior
// ---------------------------------------------------------------------------

/// Scale used to fold millisecond observations into the Gamma rate.
pub const LATENCY_SCALE_MS: f64 = 1000.0;

/// Gamma(shape, rate) posterior over a tool's latency.
///
/// Observation of u ms increments shape by 1 and rate by u/1000.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GammaPosterior {
    pub shape: f64,
    pub rate: f64,
}

impl Default for GammaPosterior {
    fn default() -> Self {
        Self {
            shape: 1.0,
            rate: 1.0,
        }
    }
}

impl GammaPosterior {
    /// Record a latency observation in milliseconds.
    pub fn observe_ms(&mut self, latency_ms: f64) {
        self.shape += 1.0;
        self.rate += latency_ms.max(0.0) / LATENCY_SCALE_MS;
    }

    /// Multiply both parameters by `factor`, flooring at ε.
    pub fn decay(&mut self, factor: f64) {
        self.shape = (self.shape * factor).max(POSTERIOR_EPSILON);
        self.rate = (self.rate * factor).max(POSTERIOR_EPSILON);
    }

    /// Posterior mean latency in milliseconds: (shape/rate) · scale⁻¹ inverted.
    ///
    /// Since rate accumulates u/1000, shape/rate is in units of 1/seconds of
    /// observation mass; the mean observed latency is rate/shape · 1000 ms.
    pub fn mean_latency_ms(&self) -> f64 {
        if self.shape <= 0.0 {
            return 0.0;
        }
        self.rate / self.shape * LATENCY_SCALE_MS
    }

    /// Draw one sample (in the scaled domain).
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Result<f64, WeightError> {
        let dist = Gamma::new(self.shape, self.rate).map_err(|e| WeightError::Invariant {
            detail: format!(
                "Gamma({}, {}) not constructible: {e}",
                self.shape, self.rate
            ),
        })?;
        Ok(dist.sample(rng))
    }
}
