//! Population quality estimation from many weak evaluators.
//!
//! Several cheap heuristic evaluators each emit a (value, confidence)
//! reading on the response. Outliers are damped, readings fuse into a
//! consensus with an agreement score, and the population blends with the
//! self-report, calibration, and surprise channels into one composite
//! confidence that drives the recommended action.

use serde::{Deserialize, Serialize};

/// One evaluator reading: value and confidence, both in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorReading {
    pub evaluator: String,
    pub value: f64,
    pub confidence: f64,
}

/// Aggregated population estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationVector {
    /// Confidence-weighted consensus value.
    pub consensus: f64,
    /// Agreement across evaluators, in [0, 1].
    pub agreement: f64,
    /// Mean confidence × agreement.
    pub confidence: f64,
}

/// Z-score beyond which an evaluator's confidence is damped.
pub const OUTLIER_Z: f64 = 2.0;

/// Confidence multiplier applied to outliers.
pub const OUTLIER_DAMPING: f64 = 0.2;

/// Aggregate evaluator readings into a population vector.
///
/// 1. Readings with |z| > 2 have confidence multiplied by 0.2.
/// 2. Consensus = Σ cᵢ·vᵢ / Σ cᵢ.
/// 3. Agreement = clamp(1 − 2·sqrt(weighted variance), 0, 1).
/// 4. Confidence = mean(cᵢ) · agreement.
pub fn aggregate(readings: &[EvaluatorReading]) -> PopulationVector {
    if readings.is_empty() {
        return PopulationVector::default();
    }
    let n = readings.len() as f64;
    let mean = readings.iter().map(|r| r.value).sum::<f64>() / n;
    let std = (readings.iter().map(|r| (r.value - mean).powi(2)).sum::<f64>() / n).sqrt();

    let damped: Vec<(f64, f64)> = readings
        .iter()
        .map(|r| {
            let z = if std > 0.0 { (r.value - mean) / std } else { 0.0 };
            let confidence = if z.abs() > OUTLIER_Z {
                r.confidence * OUTLIER_DAMPING
            } else {
                r.confidence
            };
            (r.value, confidence)
        })
        .collect();

    let total_c: f64 = damped.iter().map(|(_, c)| c).sum();
    if total_c <= 0.0 {
        return PopulationVector::default();
    }
    let consensus = damped.iter().map(|(v, c)| v * c).sum::<f64>() / total_c;
    let weighted_var = damped
        .iter()
        .map(|(v, c)| c * (v - consensus).powi(2))
        .sum::<f64>()
        / total_c;
    let agreement = (1.0 - 2.0 * weighted_var.sqrt()).clamp(0.0, 1.0);
    let mean_c = damped.iter().map(|(_, c)| c).sum::<f64>() / n;

    PopulationVector {
        consensus,
        agreement,
        confidence: mean_c * agreement,
    }
}

// ---------------------------------------------------------------------------
// Built-in evaluators
// ---------------------------------------------------------------------------

/// Length-class heuristic: mid-length responses score highest.
pub fn length_class(response: &str) -> EvaluatorReading {
    let words = response.split_whitespace().count();
    let value = match words {
        0 => 0.0,
        1..=5 => 0.35,
        6..=400 => 0.8,
        401..=1200 => 0.6,
        _ => 0.4,
    };
    EvaluatorReading {
        evaluator: "length_class".into(),
        value,
        confidence: 0.4,
    }
}

/// Completeness markers: structure and closure raise the score, trailing
/// ellipses and cliffhangers lower it.
pub fn completeness_markers(response: &str) -> EvaluatorReading {
    let trimmed = response.trim_end();
    let mut value: f64 = 0.5;
    if trimmed.ends_with('.') || trimmed.ends_with('!') || trimmed.ends_with('`') {
        value += 0.2;
    }
    if trimmed.ends_with("...") || trimmed.ends_with("…") {
        value -= 0.3;
    }
    if response.contains("\n- ") || response.contains("\n1.") || response.contains("```") {
        value += 0.1;
    }
    EvaluatorReading {
        evaluator: "completeness".into(),
        value: value.clamp(0.0, 1.0),
        confidence: 0.5,
    }
}

/// Refusal markers: hedged non-answers score low.
pub fn refusal_markers(response: &str) -> EvaluatorReading {
    let lower = response.to_lowercase();
    let refusing = [
        "i cannot",
        "i can't help",
        "i'm unable",
        "i am unable",
        "as an ai",
        "i don't have access",
    ]
    .iter()
    .any(|m| lower.contains(m));
    EvaluatorReading {
        evaluator: "refusal".into(),
        value: if refusing { 0.15 } else { 0.75 },
        confidence: if refusing { 0.8 } else { 0.3 },
    }
}

/// Run the built-in evaluator ensemble over a response.
pub fn evaluate_response(response: &str) -> Vec<EvaluatorReading> {
    vec![
        length_class(response),
        completeness_markers(response),
        refusal_markers(response),
    ]
}

// ---------------------------------------------------------------------------
// Composite confidence
// ---------------------------------------------------------------------------

/// Channel weights for the composite blend; auto-normalized on use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub llm_self_report: f64,
    pub population: f64,
    pub calibration: f64,
    pub surprise: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            llm_self_report: 0.30,
            population: 0.30,
            calibration: 0.25,
            surprise: 0.15,
        }
    }
}

/// The action ladder driven by the composite assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecommendedAction {
    EscalateToHuman,
    EscalateToSystem2,
    RetryStrongerModel,
    VerifyOutput,
    ProceedConfident,
    Proceed,
}

/// Composite quality assessment for one turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeAssessment {
    pub confidence: f64,
    pub agreement: f64,
    pub urgency: f64,
    pub action: RecommendedAction,
}

/// Blend the four channels and pick the recommended action.
///
/// `surprise_signal` is inverted (high surprise lowers confidence);
/// `urgency` rises as confidence falls and drives the human-escalation
/// rung.
pub fn composite_confidence(
    llm_self_report: f64,
    population: &PopulationVector,
    calibration_confidence: f64,
    surprise_magnitude: f64,
    weights: &CompositeWeights,
) -> CompositeAssessment {
    let total =
        weights.llm_self_report + weights.population + weights.calibration + weights.surprise;
    let (w_self, w_pop, w_cal, w_sur) = if total > 0.0 {
        (
            weights.llm_self_report / total,
            weights.population / total,
            weights.calibration / total,
            weights.surprise / total,
        )
    } else {
        (0.25, 0.25, 0.25, 0.25)
    };

    let confidence = (w_self * llm_self_report.clamp(0.0, 1.0)
        + w_pop * population.confidence
        + w_cal * calibration_confidence.clamp(0.0, 1.0)
        + w_sur * (1.0 - surprise_magnitude.clamp(0.0, 1.0)))
    .clamp(0.0, 1.0);
    let urgency = (1.0 - confidence).max(surprise_magnitude.clamp(0.0, 1.0));

    let action = if urgency >= 0.7 {
        RecommendedAction::EscalateToHuman
    } else if urgency >= 0.5 {
        RecommendedAction::EscalateToSystem2
    } else if confidence < 0.3 {
        RecommendedAction::RetryStrongerModel
    } else if population.agreement < 0.4 {
        RecommendedAction::VerifyOutput
    } else if confidence >= 0.8 && population.agreement >= 0.7 {
        RecommendedAction::ProceedConfident
    } else {
        RecommendedAction::Proceed
    };

    CompositeAssessment {
        confidence,
        agreement: population.agreement,
        urgency,
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(value: f64, confidence: f64) -> EvaluatorReading {
        EvaluatorReading {
            evaluator: "test".into(),
            value,
            confidence,
        }
    }

    #[test]
    fn unanimous_readings_agree_fully() {
        let pop = aggregate(&[reading(0.8, 0.5), reading(0.8, 0.7), reading(0.8, 0.9)]);
        assert!((pop.consensus - 0.8).abs() < 1e-9);
        assert!((pop.agreement - 1.0).abs() < 1e-9);
        assert!(pop.confidence > 0.6);
    }

    #[test]
    fn split_readings_disagree() {
        let pop = aggregate(&[reading(0.1, 0.8), reading(0.9, 0.8)]);
        assert!(pop.agreement < 0.3);
    }

    #[test]
    fn outlier_confidence_damped() {
        // Five tight readings and one far outlier: the consensus stays near
        // the cluster because the outlier's confidence is slashed.
        let readings = vec![
            reading(0.7, 0.8),
            reading(0.72, 0.8),
            reading(0.71, 0.8),
            reading(0.69, 0.8),
            reading(0.7, 0.8),
            reading(0.05, 0.8),
        ];
        let pop = aggregate(&readings);
        assert!(pop.consensus > 0.6, "consensus was {}", pop.consensus);
    }

    #[test]
    fn empty_readings_default() {
        let pop = aggregate(&[]);
        assert_eq!(pop.confidence, 0.0);
    }

    #[test]
    fn refusal_scores_low() {
        let r = refusal_markers("I cannot help with that request.");
        assert!(r.value < 0.3);
        let ok = refusal_markers("The deployment finished successfully.");
        assert!(ok.value > 0.5);
    }

    #[test]
    fn composite_ladder_rungs() {
        let strong = PopulationVector {
            consensus: 0.9,
            agreement: 0.9,
            confidence: 0.85,
        };
        let a = composite_confidence(0.9, &strong, 0.9, 0.05, &CompositeWeights::default());
        assert_eq!(a.action, RecommendedAction::ProceedConfident);

        let weak = PopulationVector {
            consensus: 0.2,
            agreement: 0.2,
            confidence: 0.1,
        };
        let b = composite_confidence(0.1, &weak, 0.1, 0.9, &CompositeWeights::default());
        assert_eq!(b.action, RecommendedAction::EscalateToHuman);
    }

    #[test]
    fn disagreement_verifies_output() {
        let split = PopulationVector {
            consensus: 0.6,
            agreement: 0.3,
            confidence: 0.5,
        };
        let a = composite_confidence(0.75, &split, 0.75, 0.1, &CompositeWeights::default());
        assert_eq!(a.action, RecommendedAction::VerifyOutput);
    }
}
