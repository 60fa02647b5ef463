//! Goal subsystem: fingerprinting, drift fusion, loop detection, and the
//! adaptive budget.

pub mod budget;
pub mod dna;
pub mod drift;
pub mod loops;

pub use budget::{AdaptiveBudget, BudgetConfig, BudgetDecision};
pub use dna::GoalDna;
pub use drift::{
    DriftAction, DriftAssessment, DriftConfig, DriftEngine, DriftSeverity, DriftSignals,
};
pub use loops::{LoopAction, LoopConfig, LoopDetection, LoopDetector, LoopKind};

use serde::{Deserialize, Serialize};

use crate::error::GoalError;

/// The current goal of a session: its text and fixed fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Monotonic goal id within the session; goal-scoped modulations expire
    /// when it changes.
    pub id: u64,
    pub text: String,
    pub dna: GoalDna,
}

impl Goal {
    pub fn new(id: u64, text: &str) -> Result<Self, GoalError> {
        Ok(Self {
            id,
            text: text.to_string(),
            dna: GoalDna::from_text(text)?,
        })
    }
}
