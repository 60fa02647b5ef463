//! Pre-action predictions, outcomes, and the surprise computation.
//!
//! Before each tool/model invocation the orchestrator emits a prediction
//! record; after execution the outcome is matched against it exactly once,
//! producing a surprise signal that drives routing and plasticity.

use std::collections::BTreeMap;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;

/// Outcome classes on the fixed rank ladder.
///
/// The ordering failure < timeout < unexpected < partial < success is part
/// of the surprise contract; Δrank is normalized by dividing by 4.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OutcomeClass {
    Failure,
    Timeout,
    Unexpected,
    Partial,
    Success,
}

impl OutcomeClass {
    /// Numeric rank: failure=0, timeout=1, unexpected=2, partial=3, success=4.
    pub fn rank(self) -> u8 {
        match self {
            Self::Failure => 0,
            Self::Timeout => 1,
            Self::Unexpected => 2,
            Self::Partial => 3,
            Self::Success => 4,
        }
    }

    /// Span of the rank ladder, the Δrank normalizer.
    pub const RANK_SPAN: f64 = 4.0;
}

impl std::fmt::Display for OutcomeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Unexpected => "unexpected",
            Self::Partial => "partial",
            Self::Success => "success",
        };
        f.write_str(s)
    }
}

/// A pre-action prediction bound to an opaque id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub id: u64,
    pub expected: OutcomeClass,
    /// Confidence in the prediction, in [0, 1].
    pub confidence: f64,
    pub predicted_latency_ms: f64,
    /// Predicted output quality, in [0, 1].
    pub predicted_quality: f64,
    pub tool: String,
    pub model: String,
    /// Step number at which the prediction was issued.
    pub step: u64,
}

/// The observed result matched against a prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub class: OutcomeClass,
    pub latency_ms: f64,
    /// Observed output quality, in [0, 1].
    pub quality: f64,
}

/// Scalar prediction error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Surprise {
    /// Magnitude in [0, 1]:
    /// 0.5·|Δrank| + 0.2·|Δlog-latency| + 0.3·|Δquality|.
    pub magnitude: f64,
    /// Direction in [−1, 1]; negative means worse than expected.
    pub direction: f64,
    /// tanh(magnitude · confidence · 2).
    pub learning_signal: f64,
}

impl Surprise {
    /// Compute the surprise of an outcome against its prediction.
    pub fn compute(prediction: &Prediction, outcome: &Outcome) -> Self {
        let d_rank = (f64::from(outcome.class.rank()) - f64::from(prediction.expected.rank()))
            / OutcomeClass::RANK_SPAN;
        let d_log_latency = (outcome.latency_ms.max(1.0).ln()
            - prediction.predicted_latency_ms.max(1.0).ln())
        .clamp(-1.0, 1.0);
        let d_quality = outcome.quality - prediction.predicted_quality;

        let magnitude = (0.5 * d_rank.abs() + 0.2 * d_log_latency.abs() + 0.3 * d_quality.abs())
            .clamp(0.0, 1.0);
        // Worse-than-expected rank or quality pulls direction negative;
        // latency contributes through its sign (slower is worse).
        let direction = (0.5 * d_rank - 0.2 * d_log_latency + 0.3 * d_quality).clamp(-1.0, 1.0);
        let learning_signal = (magnitude * prediction.confidence * 2.0).tanh();
        Self {
            magnitude,
            direction,
            learning_signal,
        }
    }
}

/// A matched (prediction, outcome, surprise) triple kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPrediction {
    pub prediction: Prediction,
    pub outcome: Outcome,
    pub surprise: Surprise,
}

/// The per-session prediction ledger.
///
/// Open predictions are matched at most once; matching retires the
/// prediction into the bounded history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionLedger {
    open: BTreeMap<u64, Prediction>,
    history: VecDeque<MatchedPrediction>,
    history_capacity: usize,
    next_id: u64,
}

impl Default for PredictionLedger {
    fn default() -> Self {
        Self::new(200)
    }
}

impl PredictionLedger {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            open: BTreeMap::new(),
            history: VecDeque::new(),
            history_capacity,
            next_id: 1,
        }
    }

    /// Issue a new prediction and return its id.
    #[allow(clippy::too_many_arguments)]
    pub fn predict(
        &mut self,
        expected: OutcomeClass,
        confidence: f64,
        predicted_latency_ms: f64,
        predicted_quality: f64,
        tool: &str,
        model: &str,
        step: u64,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.open.insert(
            id,
            Prediction {
                id,
                expected,
                confidence: confidence.clamp(0.0, 1.0),
                predicted_latency_ms,
                predicted_quality: predicted_quality.clamp(0.0, 1.0),
                tool: tool.to_string(),
                model: model.to_string(),
                step,
            },
        );
        id
    }

    /// Match an outcome against an open prediction.
    ///
    /// A second compare on the same id returns `PredictionRetired` and leaves
    /// the ledger untouched.
    pub fn compare(&mut self, id: u64, outcome: Outcome) -> Result<Surprise, CalibrationError> {
        let Some(prediction) = self.open.remove(&id) else {
            return if self.history.iter().any(|m| m.prediction.id == id) || id < self.next_id {
                Err(CalibrationError::PredictionRetired { id })
            } else {
                Err(CalibrationError::PredictionNotFound { id })
            };
        };
        let surprise = Surprise::compute(&prediction, &outcome);
        self.history.push_back(MatchedPrediction {
            prediction,
            outcome,
            surprise,
        });
        while self.history.len() > self.history_capacity {
            self.history.pop_front();
        }
        Ok(surprise)
    }

    /// Mean surprise magnitude over the last `n` matched predictions.
    pub fn recent_surprise(&self, n: usize) -> f64 {
        if self.history.is_empty() {
            return 0.0;
        }
        let skip = self.history.len().saturating_sub(n);
        let tail: Vec<f64> = self
            .history
            .iter()
            .skip(skip)
            .map(|m| m.surprise.magnitude)
            .collect();
        tail.iter().sum::<f64>() / tail.len() as f64
    }

    /// Most recent matched record, if any.
    pub fn last_matched(&self) -> Option<&MatchedPrediction> {
        self.history.back()
    }

    /// Full matched history, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &MatchedPrediction> {
        self.history.iter()
    }

    /// Number of still-open predictions.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Drop open predictions older than `before_step` (cancelled turns).
    pub fn expire_open(&mut self, before_step: u64) {
        self.open.retain(|_, p| p.step >= before_step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with_one() -> (PredictionLedger, u64) {
        let mut ledger = PredictionLedger::default();
        let id = ledger.predict(OutcomeClass::Success, 0.9, 1000.0, 0.9, "t", "worker", 1);
        (ledger, id)
    }

    #[test]
    fn match_exactly_once() {
        let (mut ledger, id) = ledger_with_one();
        let outcome = Outcome {
            class: OutcomeClass::Success,
            latency_ms: 1000.0,
            quality: 0.9,
        };
        ledger.compare(id, outcome).unwrap();
        assert_eq!(ledger.history().count(), 1);

        let err = ledger.compare(id, outcome).unwrap_err();
        assert!(matches!(err, CalibrationError::PredictionRetired { .. }));
        assert_eq!(ledger.history().count(), 1);
    }

    #[test]
    fn unknown_id_is_distinct_from_retired() {
        let (mut ledger, _) = ledger_with_one();
        let outcome = Outcome {
            class: OutcomeClass::Success,
            latency_ms: 100.0,
            quality: 0.5,
        };
        let err = ledger.compare(999, outcome).unwrap_err();
        assert!(matches!(err, CalibrationError::PredictionNotFound { .. }));
    }

    #[test]
    fn exact_match_has_zero_surprise() {
        let (mut ledger, id) = ledger_with_one();
        let s = ledger
            .compare(
                id,
                Outcome {
                    class: OutcomeClass::Success,
                    latency_ms: 1000.0,
                    quality: 0.9,
                },
            )
            .unwrap();
        assert!(s.magnitude < 1e-9);
        assert!(s.learning_signal.abs() < 1e-9);
    }

    #[test]
    fn failure_against_expected_success_is_negative_surprise() {
        let (mut ledger, id) = ledger_with_one();
        let s = ledger
            .compare(
                id,
                Outcome {
                    class: OutcomeClass::Failure,
                    latency_ms: 4000.0,
                    quality: 0.1,
                },
            )
            .unwrap();
        assert!(s.magnitude > 0.5);
        assert!(s.direction < 0.0);
        assert!(s.learning_signal > 0.0);
    }

    #[test]
    fn timeout_ranks_between_failure_and_unexpected() {
        assert!(OutcomeClass::Failure.rank() < OutcomeClass::Timeout.rank());
        assert!(OutcomeClass::Timeout.rank() < OutcomeClass::Unexpected.rank());
    }

    #[test]
    fn recent_surprise_windows() {
        let mut ledger = PredictionLedger::default();
        for i in 0..5 {
            let id = ledger.predict(OutcomeClass::Success, 1.0, 100.0, 1.0, "t", "m", i);
            ledger
                .compare(
                    id,
                    Outcome {
                        class: OutcomeClass::Failure,
                        latency_ms: 100.0,
                        quality: 0.0,
                    },
                )
                .unwrap();
        }
        assert!(ledger.recent_surprise(10) > 0.7);
    }
}
