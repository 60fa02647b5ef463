//! Dual-process router: System-1 fast path versus System-2 deliberation.
//!
//! Seven signals of the incoming turn are checked against escalation
//! thresholds; any single trigger escalates to System-2. Every decision is
//! recorded with its triggering signals so routing can be replayed.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The two processing paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingPath {
    /// Fast path: worker model tier, pruned prompt.
    System1,
    /// Deliberate path: orchestrator model tier, tool and retrieval budgets.
    System2,
}

/// Which signal tripped an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscalationTrigger {
    HighSurprise,
    LowAgreement,
    TaskNovelty,
    EnterpriseSafety,
    ExplicitRequest,
    PreviousError,
    GoalDrift,
}

impl EscalationTrigger {
    /// Reason string recorded in the decision log.
    pub fn reason(self) -> &'static str {
        match self {
            Self::HighSurprise => "high_recent_surprise",
            Self::LowAgreement => "low_population_agreement",
            Self::TaskNovelty => "task_novelty",
            Self::EnterpriseSafety => "enterprise_safety_level",
            Self::ExplicitRequest => "explicit_deliberation_request",
            Self::PreviousError => "error_in_last_step",
            Self::GoalDrift => "goal_drift",
        }
    }
}

/// The seven routing signals for one turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterSignals {
    /// Average surprise over the last 10 predictions.
    pub avg_surprise: f64,
    /// Population-quality agreement on the previous turn.
    pub population_agreement: f64,
    /// Distance of the task from the trajectory-model prediction.
    pub task_novelty: f64,
    /// Enterprise safety level of the turn.
    pub enterprise_safety: f64,
    /// The user explicitly asked for careful thinking.
    pub explicit_request: bool,
    /// The previous step errored.
    pub previous_error: bool,
    /// Current goal drift score.
    pub goal_drift: f64,
}

/// Escalation thresholds. Any single trigger escalates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub surprise_threshold: f64,
    pub agreement_threshold: f64,
    pub novelty_threshold: f64,
    pub safety_threshold: f64,
    pub drift_threshold: f64,
    /// Routing decisions kept for replay.
    pub log_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            surprise_threshold: 0.6,
            agreement_threshold: 0.4,
            novelty_threshold: 0.7,
            safety_threshold: 0.8,
            drift_threshold: 0.4,
            log_capacity: 256,
        }
    }
}

/// One recorded routing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub step: u64,
    pub path: ProcessingPath,
    pub triggers: Vec<EscalationTrigger>,
    pub signals: RouterSignals,
}

/// The dual-process router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DualProcessRouter {
    pub config: RouterConfig,
    log: Vec<RouteDecision>,
}

impl DualProcessRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            log: Vec::new(),
        }
    }

    /// Route one turn. Any single trigger above threshold escalates to
    /// System-2; otherwise the fast path is kept.
    pub fn route(&mut self, step: u64, signals: RouterSignals) -> RouteDecision {
        let cfg = &self.config;
        let mut triggers = Vec::new();
        if signals.avg_surprise > cfg.surprise_threshold {
            triggers.push(EscalationTrigger::HighSurprise);
        }
        if signals.population_agreement < cfg.agreement_threshold {
            triggers.push(EscalationTrigger::LowAgreement);
        }
        if signals.task_novelty > cfg.novelty_threshold {
            triggers.push(EscalationTrigger::TaskNovelty);
        }
        if signals.enterprise_safety > cfg.safety_threshold {
            triggers.push(EscalationTrigger::EnterpriseSafety);
        }
        if signals.explicit_request {
            triggers.push(EscalationTrigger::ExplicitRequest);
        }
        if signals.previous_error {
            triggers.push(EscalationTrigger::PreviousError);
        }
        if signals.goal_drift > cfg.drift_threshold {
            triggers.push(EscalationTrigger::GoalDrift);
        }

        let path = if triggers.is_empty() {
            ProcessingPath::System1
        } else {
            ProcessingPath::System2
        };
        let decision = RouteDecision {
            step,
            path,
            triggers,
            signals,
        };
        tracing::debug!(step, ?path, triggers = decision.triggers.len(), "routed turn");
        self.log.push(decision.clone());
        while self.log.len() > cfg.log_capacity {
            self.log.remove(0);
        }
        decision
    }

    /// Recorded decisions, oldest first.
    pub fn log(&self) -> &[RouteDecision] {
        &self.log
    }

    /// The most recent decision.
    pub fn last(&self) -> Option<&RouteDecision> {
        self.log.last()
    }
}

impl Default for DualProcessRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

/// Whether the message explicitly asks for careful deliberation.
pub fn detects_deliberation_request(message: &str) -> bool {
    // Compiled per call; routing happens once per turn so this stays off any
    // hot path.
    Regex::new(
        r"(?i)\b(think (?:carefully|hard|step by step|deeply)|take your time|be thorough|double.?check|reason (?:through|carefully))\b",
    )
    .map(|re| re.is_match(message))
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calm_signals() -> RouterSignals {
        RouterSignals {
            avg_surprise: 0.1,
            population_agreement: 0.9,
            task_novelty: 0.1,
            enterprise_safety: 0.2,
            explicit_request: false,
            previous_error: false,
            goal_drift: 0.05,
        }
    }

    #[test]
    fn calm_turn_stays_system1() {
        let mut router = DualProcessRouter::default();
        let d = router.route(1, calm_signals());
        assert_eq!(d.path, ProcessingPath::System1);
        assert!(d.triggers.is_empty());
    }

    #[test]
    fn any_single_trigger_escalates() {
        let cases: Vec<(RouterSignals, EscalationTrigger)> = vec![
            (
                RouterSignals {
                    avg_surprise: 0.7,
                    ..calm_signals()
                },
                EscalationTrigger::HighSurprise,
            ),
            (
                RouterSignals {
                    population_agreement: 0.3,
                    ..calm_signals()
                },
                EscalationTrigger::LowAgreement,
            ),
            (
                RouterSignals {
                    task_novelty: 0.8,
                    ..calm_signals()
                },
                EscalationTrigger::TaskNovelty,
            ),
            (
                RouterSignals {
                    enterprise_safety: 0.9,
                    ..calm_signals()
                },
                EscalationTrigger::EnterpriseSafety,
            ),
            (
                RouterSignals {
                    explicit_request: true,
                    ..calm_signals()
                },
                EscalationTrigger::ExplicitRequest,
            ),
            (
                RouterSignals {
                    previous_error: true,
                    ..calm_signals()
                },
                EscalationTrigger::PreviousError,
            ),
            (
                RouterSignals {
                    goal_drift: 0.5,
                    ..calm_signals()
                },
                EscalationTrigger::GoalDrift,
            ),
        ];
        for (signals, expected) in cases {
            let mut router = DualProcessRouter::default();
            let d = router.route(1, signals);
            assert_eq!(d.path, ProcessingPath::System2);
            assert_eq!(d.triggers, vec![expected]);
        }
    }

    #[test]
    fn escalation_is_monotone_in_each_signal() {
        // Raising any single signal above threshold never flips the route
        // back toward System-1.
        let mut router = DualProcessRouter::default();
        let base = router.route(1, calm_signals());
        assert_eq!(base.path, ProcessingPath::System1);
        let escalated = router.route(2, RouterSignals {
            avg_surprise: 0.95,
            ..calm_signals()
        });
        assert_eq!(escalated.path, ProcessingPath::System2);
    }

    #[test]
    fn decision_log_is_replayable() {
        let mut router = DualProcessRouter::default();
        router.route(1, calm_signals());
        router.route(
            2,
            RouterSignals {
                previous_error: true,
                ..calm_signals()
            },
        );
        let log = router.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].triggers, vec![EscalationTrigger::PreviousError]);
        assert_eq!(log[1].triggers[0].reason(), "error_in_last_step");
    }

    #[test]
    fn deliberation_phrases_detected() {
        assert!(detects_deliberation_request("Please think carefully about this."));
        assert!(detects_deliberation_request("think step by step"));
        assert!(!detects_deliberation_request("what time is it?"));
    }
}
