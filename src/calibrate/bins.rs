//! Calibration bins, ECE, Platt rescaling, and meta-cognition alerts.
//!
//! Ten half-open probability bins of width 0.1 per domain accumulate
//! (predicted, observed) pairs. Every calibration cycle recomputes the
//! expected calibration error, fits Platt parameters by gradient descent
//! against the bin summaries, and snapshots ECE into a trend history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Number of bins per domain.
pub const BIN_COUNT: usize = 10;

/// Observations required before a bin is trusted.
pub const TRUSTED_BIN_MIN: usize = 5;

/// Bound keeping Platt output strictly inside (0, 1).
pub const PLATT_EPSILON: f64 = 1e-6;

/// The closed set of calibration domains.
///
/// Unknown domain names are a protocol version mismatch, never silently
/// accepted.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CalibrationDomain {
    ToolSuccess,
    ModelQuality,
    Latency,
    GoalProgress,
    UserSatisfaction,
}

impl CalibrationDomain {
    pub const ALL: [Self; 5] = [
        Self::ToolSuccess,
        Self::ModelQuality,
        Self::Latency,
        Self::GoalProgress,
        Self::UserSatisfaction,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolSuccess => "tool_success",
            Self::ModelQuality => "model_quality",
            Self::Latency => "latency",
            Self::GoalProgress => "goal_progress",
            Self::UserSatisfaction => "user_satisfaction",
        }
    }

    pub fn parse(name: &str) -> Result<Self, CalibrationError> {
        match name {
            "tool_success" => Ok(Self::ToolSuccess),
            "model_quality" => Ok(Self::ModelQuality),
            "latency" => Ok(Self::Latency),
            "goal_progress" => Ok(Self::GoalProgress),
            "user_satisfaction" => Ok(Self::UserSatisfaction),
            other => Err(CalibrationError::UnknownDomain { name: other.into() }),
        }
    }
}

impl std::fmt::Display for CalibrationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One half-open probability interval [lo, hi).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub predicted_sum: f64,
    pub outcomes: Vec<bool>,
}

impl CalibrationBin {
    pub fn count(&self) -> usize {
        self.outcomes.len()
    }

    /// Whether the bin holds enough observations to be trusted.
    pub fn is_trusted(&self) -> bool {
        self.count() >= TRUSTED_BIN_MIN
    }

    pub fn mean_predicted(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.predicted_sum / self.outcomes.len() as f64
    }

    pub fn empirical_freq(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.outcomes.iter().filter(|&&b| b).count() as f64 / self.outcomes.len() as f64
    }
}

/// Platt rescaling parameters: adjusted_p = sigmoid(a·raw_p + b).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlattParams {
    pub a: f64,
    pub b: f64,
}

impl Default for PlattParams {
    fn default() -> Self {
        Self { a: 1.0, b: 0.0 }
    }
}

impl PlattParams {
    /// Apply the rescaling, bounded strictly inside (0, 1).
    pub fn adjust(&self, raw_p: f64) -> f64 {
        let z = self.a * raw_p.clamp(0.0, 1.0) + self.b;
        sigmoid(z).clamp(PLATT_EPSILON, 1.0 - PLATT_EPSILON)
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Per-domain calibration state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainCalibration {
    pub bins: Vec<CalibrationBin>,
    pub platt: PlattParams,
    /// Whether a Platt fit has run; raw probabilities pass through until then.
    pub platt_fitted: bool,
    pub ece_history: Vec<f64>,
    pub observations_since_cycle: usize,
    pub total_observations: u64,
}

impl Default for DomainCalibration {
    fn default() -> Self {
        Self {
            bins: vec![CalibrationBin::default(); BIN_COUNT],
            platt: PlattParams::default(),
            platt_fitted: false,
            ece_history: Vec::new(),
            observations_since_cycle: 0,
            total_observations: 0,
        }
    }
}

impl DomainCalibration {
    fn bin_index(p: f64) -> usize {
        // [0.9, 1.0] folds into the last bin so p = 1.0 is representable.
        ((p * BIN_COUNT as f64) as usize).min(BIN_COUNT - 1)
    }

    /// Record one (predicted probability, observed outcome) pair.
    pub fn record(&mut self, predicted: f64, success: bool) {
        let bin = &mut self.bins[Self::bin_index(predicted)];
        bin.predicted_sum += predicted;
        bin.outcomes.push(success);
        self.observations_since_cycle += 1;
        self.total_observations += 1;
    }

    /// Expected calibration error over all non-empty bins:
    /// Σ_b (n_b/N)·|mean_predicted_b − empirical_freq_b|.
    pub fn ece(&self) -> f64 {
        let total: usize = self.bins.iter().map(CalibrationBin::count).sum();
        if total == 0 {
            return 0.0;
        }
        self.bins
            .iter()
            .filter(|b| b.count() > 0)
            .map(|b| {
                (b.count() as f64 / total as f64)
                    * (b.mean_predicted() - b.empirical_freq()).abs()
            })
            .sum()
    }

    /// Fit Platt parameters against trusted-bin summaries by gradient
    /// descent (20 iterations, lr 0.1) minimizing MSE.
    pub fn fit_platt(&mut self, iterations: usize, lr: f64) {
        let points: Vec<(f64, f64)> = self
            .bins
            .iter()
            .filter(|b| b.is_trusted())
            .map(|b| (b.mean_predicted(), b.empirical_freq()))
            .collect();
        if points.is_empty() {
            return;
        }
        self.platt_fitted = true;
        let n = points.len() as f64;
        let (mut a, mut b) = (self.platt.a, self.platt.b);
        for _ in 0..iterations {
            let mut grad_a = 0.0;
            let mut grad_b = 0.0;
            for &(x, y) in &points {
                let p = sigmoid(a * x + b);
                let common = 2.0 * (p - y) * p * (1.0 - p) / n;
                grad_a += common * x;
                grad_b += common;
            }
            a -= lr * grad_a;
            b -= lr * grad_b;
        }
        self.platt = PlattParams { a, b };
    }
}

/// Meta-cognition alert derived from recent learning dynamics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaAlert {
    /// More than 60% sign flips across recent weight deltas.
    Oscillation { flip_ratio: f64, lr_factor: f64 },
    /// All recent deltas below the stagnation floor.
    Stagnation { lr_factor: f64 },
    /// ECE trend slope is positive; calibration is degrading.
    Degradation {
        domain: CalibrationDomain,
        slope: f64,
    },
}

/// Tunables for the calibration subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Observations per domain between calibration cycles.
    pub calibration_interval: usize,
    /// ECE above which the domain alarms.
    pub ece_alarm: f64,
    pub platt_iterations: usize,
    pub platt_lr: f64,
    /// Window of weight deltas for oscillation/stagnation analysis.
    pub delta_window: usize,
    pub oscillation_flip_ratio: f64,
    pub stagnation_floor: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            calibration_interval: 20,
            ece_alarm: 0.15,
            platt_iterations: 20,
            platt_lr: 0.1,
            delta_window: 20,
            oscillation_flip_ratio: 0.6,
            stagnation_floor: 0.02,
        }
    }
}

/// Result of one calibration cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Domains whose ECE crossed the alarm threshold, with their ECE.
    pub alarms: Vec<(CalibrationDomain, f64)>,
    /// Per-domain ECE after the recompute.
    pub ece: BTreeMap<String, f64>,
}

/// The calibrator: all five domains plus cycle bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibrator {
    pub config: CalibrationConfig,
    domains: BTreeMap<CalibrationDomain, DomainCalibration>,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self::new(CalibrationConfig::default())
    }
}

impl Calibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        let mut domains = BTreeMap::new();
        for d in CalibrationDomain::ALL {
            domains.insert(d, DomainCalibration::default());
        }
        Self { config, domains }
    }

    /// Record an observation; runs a cycle for the domain when its interval
    /// elapses. Returns the cycle report if one ran.
    pub fn record(
        &mut self,
        domain: CalibrationDomain,
        predicted: f64,
        success: bool,
    ) -> Result<Option<CycleReport>, CalibrationError> {
        if !(0.0..=1.0).contains(&predicted) {
            return Err(CalibrationError::BadProbability { value: predicted });
        }
        let interval = self.config.calibration_interval;
        let state = self.domains.entry(domain).or_default();
        state.record(predicted, success);
        if state.observations_since_cycle >= interval {
            Ok(Some(self.run_cycle()))
        } else {
            Ok(None)
        }
    }

    /// Run a calibration cycle across every domain: recompute ECE, fit
    /// Platt parameters, snapshot ECE into history.
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        for (domain, state) in &mut self.domains {
            let ece = state.ece();
            state.fit_platt(self.config.platt_iterations, self.config.platt_lr);
            state.ece_history.push(ece);
            state.observations_since_cycle = 0;
            report.ece.insert(domain.as_str().to_string(), ece);
            if ece > self.config.ece_alarm && state.total_observations > 0 {
                tracing::warn!(domain = %domain, ece, "calibration alarm");
                report.alarms.push((*domain, ece));
            }
        }
        report
    }

    /// Current ECE for a domain.
    pub fn ece(&self, domain: CalibrationDomain) -> f64 {
        self.domains.get(&domain).map(DomainCalibration::ece).unwrap_or(0.0)
    }

    /// Platt-rescale a raw probability for a domain. Until the first fit,
    /// the raw probability passes through (bounded into the open interval).
    pub fn adjust(&self, domain: CalibrationDomain, raw_p: f64) -> f64 {
        match self.domains.get(&domain) {
            Some(d) if d.platt_fitted => d.platt.adjust(raw_p),
            _ => raw_p.clamp(PLATT_EPSILON, 1.0 - PLATT_EPSILON),
        }
    }

    /// Per-domain state, for snapshots and inspection.
    pub fn domain(&self, domain: CalibrationDomain) -> Option<&DomainCalibration> {
        self.domains.get(&domain)
    }

    /// Meta-cognition pass over recent weight deltas and ECE trends.
    pub fn meta_alerts(&self, recent_deltas: &[f64]) -> Vec<MetaAlert> {
        let mut alerts = Vec::new();

        let window: Vec<f64> = recent_deltas
            .iter()
            .rev()
            .take(self.config.delta_window)
            .copied()
            .collect();
        if window.len() >= 4 {
            let flips = window
                .windows(2)
                .filter(|w| w[0] * w[1] < 0.0)
                .count() as f64
                / (window.len() - 1) as f64;
            if flips > self.config.oscillation_flip_ratio {
                alerts.push(MetaAlert::Oscillation {
                    flip_ratio: flips,
                    lr_factor: 0.5,
                });
            } else if window.iter().all(|d| d.abs() < self.config.stagnation_floor) {
                alerts.push(MetaAlert::Stagnation { lr_factor: 2.0 });
            }
        }

        for (domain, state) in &self.domains {
            if let Some(slope) = trend_slope(&state.ece_history) {
                if slope > 0.0 && state.ece_history.len() >= 3 {
                    alerts.push(MetaAlert::Degradation {
                        domain: *domain,
                        slope,
                    });
                }
            }
        }
        alerts
    }
}

/// Least-squares slope of a series against its index. None below 2 points.
pub fn trend_slope(series: &[f64]) -> Option<f64> {
    let n = series.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 { None } else { Some(num / den) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overconfident_domain_alarms_and_rescales_down() {
        // 25 predictions at p = 0.9 of which 15 succeed:
        // ECE ≈ |0.9 − 0.6| = 0.3, alarm triggered, adjust(0.9) < 0.9.
        let mut cal = Calibrator::default();
        for i in 0..25 {
            let success = i < 15;
            cal.record(CalibrationDomain::ToolSuccess, 0.9, success)
                .unwrap();
        }
        let ece = cal.ece(CalibrationDomain::ToolSuccess);
        assert!((ece - 0.3).abs() < 0.01, "ece was {ece}");
        let report = cal.run_cycle();
        assert!(report
            .alarms
            .iter()
            .any(|(d, _)| *d == CalibrationDomain::ToolSuccess));
        assert!(cal.adjust(CalibrationDomain::ToolSuccess, 0.9) < 0.9);
    }

    #[test]
    fn platt_output_strictly_inside_unit_interval() {
        let extreme = PlattParams { a: 50.0, b: -40.0 };
        for i in 0..=10 {
            let p = i as f64 / 10.0;
            let adj = extreme.adjust(p);
            assert!(adj > 0.0 && adj < 1.0);
        }
    }

    #[test]
    fn unknown_domain_rejected() {
        assert!(CalibrationDomain::parse("vibes").is_err());
        assert!(CalibrationDomain::parse("tool_success").is_ok());
    }

    #[test]
    fn bad_probability_rejected() {
        let mut cal = Calibrator::default();
        assert!(cal
            .record(CalibrationDomain::Latency, 1.5, true)
            .is_err());
    }

    #[test]
    fn well_calibrated_domain_stays_quiet() {
        let mut cal = Calibrator::default();
        // Predict 0.5, succeed half the time.
        for i in 0..40 {
            cal.record(CalibrationDomain::ModelQuality, 0.5, i % 2 == 0)
                .unwrap();
        }
        assert!(cal.ece(CalibrationDomain::ModelQuality) < 0.05);
    }

    #[test]
    fn oscillation_alert_fires() {
        let cal = Calibrator::default();
        let deltas: Vec<f64> = (0..20).map(|i| if i % 2 == 0 { 0.1 } else { -0.1 }).collect();
        let alerts = cal.meta_alerts(&deltas);
        assert!(alerts
            .iter()
            .any(|a| matches!(a, MetaAlert::Oscillation { lr_factor, .. } if *lr_factor == 0.5)));
    }

    #[test]
    fn stagnation_alert_fires() {
        let cal = Calibrator::default();
        let deltas = vec![0.001; 20];
        let alerts = cal.meta_alerts(&deltas);
        assert!(alerts
            .iter()
            .any(|a| matches!(a, MetaAlert::Stagnation { lr_factor } if *lr_factor == 2.0)));
    }

    #[test]
    fn trend_slope_detects_rising_series() {
        let slope = trend_slope(&[0.1, 0.15, 0.2, 0.25]).unwrap();
        assert!(slope > 0.0);
        assert!(trend_slope(&[0.2]).is_none());
    }
}
