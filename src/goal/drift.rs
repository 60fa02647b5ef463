//! Drift engine: five-signal fusion of goal deviation per step.
//!
//! Each step fuses goal relevance, budget consumption, topic divergence,
//! output-quality trend, and accumulated prediction surprise into a single
//! drift score, maps the score to a severity band, and recommends a
//! recovery action. A consecutive-drift bonus punishes sustained
//! low-similarity runs.

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::calibrate::trend_slope;

use super::dna::GoalDna;

/// Signal weights and thresholds for the drift engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub relevance_weight: f64,
    pub budget_weight: f64,
    pub divergence_weight: f64,
    pub quality_weight: f64,
    pub surprise_weight: f64,
    /// Steps of sustained low similarity before the bonus applies.
    pub consecutive_window: usize,
    pub consecutive_bonus: f64,
    /// Similarity below which a step counts as low-relevance.
    pub low_similarity: f64,
    /// Similarity at or above which a step contributes no relevance drift.
    pub relevance_floor: f64,
    /// Window of recent qualities for the trend slope.
    pub quality_window: usize,
    /// Scale mapping a negative quality slope into [0, 1].
    pub quality_slope_scale: f64,
    /// EMA carry for accumulated surprise.
    pub surprise_carry: f64,
    /// Recent actions whose tokens count as already-seen topics.
    pub seen_window: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            relevance_weight: 0.35,
            budget_weight: 0.15,
            divergence_weight: 0.20,
            quality_weight: 0.15,
            surprise_weight: 0.15,
            consecutive_window: 3,
            consecutive_bonus: 0.15,
            low_similarity: 0.3,
            relevance_floor: 0.4,
            quality_window: 5,
            quality_slope_scale: 5.0,
            surprise_carry: 0.7,
            seen_window: 10,
        }
    }
}

/// Severity bands for the fused drift score.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DriftSeverity {
    None,
    Low,
    Moderate,
    High,
    Critical,
    Emergency,
}

/// Recommended recovery action per severity band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriftAction {
    Continue,
    InjectReminder,
    SummarizeReplan,
    CheckpointReset,
    AskUser,
}

impl DriftSeverity {
    /// Map a drift score into its severity band.
    pub fn from_score(score: f64) -> Self {
        if score < 0.1 {
            Self::None
        } else if score < 0.3 {
            Self::Low
        } else if score < 0.5 {
            Self::Moderate
        } else if score < 0.7 {
            Self::High
        } else if score < 0.85 {
            Self::Critical
        } else {
            Self::Emergency
        }
    }

    pub fn default_action(self) -> DriftAction {
        match self {
            Self::None | Self::Low => DriftAction::Continue,
            Self::Moderate => DriftAction::InjectReminder,
            Self::High => DriftAction::SummarizeReplan,
            Self::Critical => DriftAction::CheckpointReset,
            Self::Emergency => DriftAction::AskUser,
        }
    }
}

/// The five raw signals of one drift assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DriftSignals {
    pub goal_similarity: f64,
    pub budget_ratio: f64,
    pub topic_divergence: f64,
    pub quality_trend_drift: f64,
    pub accumulated_surprise: f64,
    pub consecutive_bonus_applied: bool,
}

/// Result of one per-step drift assessment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftAssessment {
    pub score: f64,
    pub severity: DriftSeverity,
    pub action: DriftAction,
    pub signals: DriftSignals,
}

/// Per-goal drift tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftEngine {
    pub config: DriftConfig,
    recent_similarities: VecDeque<f64>,
    recent_qualities: VecDeque<f64>,
    /// Tokens of recent actions, so repeated off-topic chatter stops
    /// counting as newly divergent.
    seen_tokens: VecDeque<BTreeSet<String>>,
    accumulated_surprise: f64,
    /// Whether the emergency ask-user action has already been issued for
    /// this goal. Later emergencies fall back to checkpoint-reset.
    asked_user: bool,
    last_score: f64,
}

impl DriftEngine {
    pub fn new(config: DriftConfig) -> Self {
        Self {
            config,
            recent_similarities: VecDeque::new(),
            recent_qualities: VecDeque::new(),
            seen_tokens: VecDeque::new(),
            accumulated_surprise: 0.0,
            asked_user: false,
            last_score: 0.0,
        }
    }

    /// Assess drift for one step.
    ///
    /// `budget_ratio` is consumed/total from the adaptive budget;
    /// `quality` the step's output quality; `surprise` the step's
    /// prediction-surprise magnitude.
    pub fn assess(
        &mut self,
        goal: &GoalDna,
        action_text: &str,
        budget_ratio: f64,
        quality: f64,
        surprise: f64,
    ) -> DriftAssessment {
        let cfg = self.config.clone();
        let similarity = goal.similarity_to_text(action_text);
        // On-topic steps (similarity at or above the floor) contribute no
        // relevance drift; below the floor the signal rises linearly to 1.
        let relevance_drift =
            ((cfg.relevance_floor - similarity) / cfg.relevance_floor).clamp(0.0, 1.0);

        let action_dna = GoalDna::extract(action_text);
        // New entities only count as divergence when the step is off-topic;
        // an on-topic answer naturally introduces new entities.
        let divergence = self.topic_divergence(goal, &action_dna.tokens) * relevance_drift;
        self.seen_tokens.push_back(action_dna.tokens);
        while self.seen_tokens.len() > cfg.seen_window {
            self.seen_tokens.pop_front();
        }

        self.recent_qualities.push_back(quality.clamp(0.0, 1.0));
        while self.recent_qualities.len() > cfg.quality_window {
            self.recent_qualities.pop_front();
        }
        let qualities: Vec<f64> = self.recent_qualities.iter().copied().collect();
        let quality_drift = trend_slope(&qualities)
            .map(|s| (-s * cfg.quality_slope_scale).clamp(0.0, 1.0))
            .unwrap_or(0.0);

        self.accumulated_surprise = cfg.surprise_carry * self.accumulated_surprise
            + (1.0 - cfg.surprise_carry) * surprise.clamp(0.0, 1.0);

        self.recent_similarities.push_back(similarity);
        while self.recent_similarities.len() > cfg.consecutive_window {
            self.recent_similarities.pop_front();
        }
        let bonus_applies = self.recent_similarities.len() >= cfg.consecutive_window
            && self
                .recent_similarities
                .iter()
                .all(|&s| s < cfg.low_similarity);

        let mut score = cfg.relevance_weight * relevance_drift
            + cfg.budget_weight * budget_ratio.clamp(0.0, 1.0)
            + cfg.divergence_weight * divergence
            + cfg.quality_weight * quality_drift
            + cfg.surprise_weight * self.accumulated_surprise;
        if bonus_applies {
            score += cfg.consecutive_bonus;
        }
        let score = score.clamp(0.0, 1.0);

        let severity = DriftSeverity::from_score(score);
        let mut action = severity.default_action();
        if action == DriftAction::AskUser {
            if self.asked_user {
                action = DriftAction::CheckpointReset;
            } else {
                self.asked_user = true;
            }
        }
        self.last_score = score;

        if severity >= DriftSeverity::High {
            tracing::warn!(score, ?severity, ?action, "goal drift detected");
        }

        DriftAssessment {
            score,
            severity,
            action,
            signals: DriftSignals {
                goal_similarity: similarity,
                budget_ratio,
                topic_divergence: divergence,
                quality_trend_drift: quality_drift,
                accumulated_surprise: self.accumulated_surprise,
                consecutive_bonus_applied: bonus_applies,
            },
        }
    }

    /// Fraction of action tokens that are neither goal topics nor recently
    /// seen. A topic stops counting as divergent once it has been
    /// established in the conversation.
    fn topic_divergence(&self, goal: &GoalDna, action_tokens: &BTreeSet<String>) -> f64 {
        if action_tokens.is_empty() {
            return 0.0;
        }
        let novel = action_tokens
            .iter()
            .filter(|t| !goal.tokens.contains(*t))
            .filter(|t| !self.seen_tokens.iter().any(|seen| seen.contains(*t)))
            .count();
        novel as f64 / action_tokens.len() as f64
    }

    /// Most recent fused score.
    pub fn last_score(&self) -> f64 {
        self.last_score
    }
}

impl Default for DriftEngine {
    fn default() -> Self {
        Self::new(DriftConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal() -> GoalDna {
        GoalDna::from_text("Implement JWT login endpoint").unwrap()
    }

    #[test]
    fn on_topic_actions_stay_quiet() {
        let goal = goal();
        let mut engine = DriftEngine::default();
        let a = engine.assess(&goal, "implement the JWT login endpoint handler", 0.05, 0.8, 0.0);
        assert!(a.score < 0.1, "score was {}", a.score);
        assert_eq!(a.action, DriftAction::Continue);
    }

    #[test]
    fn sustained_off_topic_reaches_replan() {
        let goal = goal();
        let mut engine = DriftEngine::default();
        let actions = [
            "study quantum physics entanglement",
            "quantum decoherence in physics experiments",
            "physics of quantum superposition states",
            "quantum physics measurement problem",
            "interpretations of quantum physics",
        ];
        let mut last = None;
        for (i, action) in actions.iter().enumerate() {
            last = Some(engine.assess(&goal, action, 0.05 * (i + 1) as f64, 0.6, 0.1));
        }
        let a = last.unwrap();
        assert!(a.severity >= DriftSeverity::High, "severity {:?}", a.severity);
        assert_eq!(a.action, DriftAction::SummarizeReplan);
    }

    #[test]
    fn total_drift_asks_user_exactly_once() {
        let goal = goal();
        let mut engine = DriftEngine::default();
        let topics = [
            "quantum entanglement research",
            "medieval castle architecture",
            "sourdough fermentation chemistry",
            "orbital mechanics transfer windows",
            "watercolor pigment lightfastness",
            "volcano seismology sensors",
            "beekeeping winter cluster behavior",
            "cuneiform tablet translation",
            "glacier mass balance surveys",
            "coral reef symbiont bleaching",
        ];
        let mut ask_count = 0;
        let mut max_score: f64 = 0.0;
        for (i, topic) in topics.iter().enumerate() {
            let a = engine.assess(&goal, topic, (i + 1) as f64 / 10.0, 0.4, 0.9);
            max_score = max_score.max(a.score);
            if a.action == DriftAction::AskUser {
                ask_count += 1;
            }
        }
        assert!(max_score >= 0.85, "max score was {max_score}");
        assert_eq!(ask_count, 1);
    }

    #[test]
    fn severity_bands_match_table() {
        assert_eq!(DriftSeverity::from_score(0.05), DriftSeverity::None);
        assert_eq!(DriftSeverity::from_score(0.2), DriftSeverity::Low);
        assert_eq!(DriftSeverity::from_score(0.4), DriftSeverity::Moderate);
        assert_eq!(DriftSeverity::from_score(0.6), DriftSeverity::High);
        assert_eq!(DriftSeverity::from_score(0.8), DriftSeverity::Critical);
        assert_eq!(DriftSeverity::from_score(0.9), DriftSeverity::Emergency);
    }
}
