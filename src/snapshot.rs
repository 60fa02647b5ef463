//! Versioned, self-describing session snapshots.
//!
//! A snapshot contains every field of every engine, including the RNG
//! stream position, so `restore(snapshot(s))` reproduces the session
//! exactly: the next turn draws identical samples and makes bit-identical
//! routing decisions.

use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::adapt::{AdaptationFilter, FeedbackDetector};
use crate::calibrate::{Calibrator, PredictionLedger};
use crate::context::ContextStore;
use crate::cortex::{AttentionEngine, ColumnManager, ConceptGraph, CrossModalAssociator};
use crate::error::SessionError;
use crate::goal::Goal;
use crate::modulate::Modulator;
use crate::observe::DecisionLog;
use crate::provider::{LlmProvider, ToolExecutor};
use crate::reputation::ReputationBook;
use crate::router::DualProcessRouter;
use crate::session::{GoalEngines, Session, SessionConfig};
use crate::trajectory::SharedServices;
use crate::weights::WeightEngine;

/// Current snapshot schema version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Core session fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCore {
    pub id: u64,
    pub step: u64,
    pub next_goal_id: u64,
    pub goal: Option<Goal>,
    pub total_tokens: u64,
    pub previous_error: bool,
    pub last_agreement: f64,
    pub last_response_chars: usize,
    pub rng_seed: u64,
    /// ChaCha word position split into (high, low) halves.
    pub rng_word_pos: (u64, u64),
    pub config: SessionConfig,
}

/// Remaining engine states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStates {
    pub router: DualProcessRouter,
    pub attention: AttentionEngine,
    pub columns: ColumnManager,
    pub concepts: ConceptGraph,
    pub associator: CrossModalAssociator,
    pub adaptation: AdaptationFilter,
    pub goal_engines: Option<GoalEngines>,
    pub decision_log: DecisionLog,
}

/// A complete, versioned session snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub session: SessionCore,
    pub weights: WeightEngine,
    pub calibration: Calibrator,
    pub predictions: PredictionLedger,
    pub reputation: ReputationBook,
    pub modulations: Modulator,
    pub context: ContextStore,
    pub engines: EngineStates,
}

impl SessionSnapshot {
    /// Compact binary encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        bincode::serialize(self).map_err(|e| SessionError::SnapshotDecode {
            message: e.to_string(),
        })
    }

    /// Decode from the binary encoding, checking the schema version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        let snapshot: Self =
            bincode::deserialize(bytes).map_err(|e| SessionError::SnapshotDecode {
                message: e.to_string(),
            })?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
            return Err(SessionError::SnapshotVersion {
                found: snapshot.schema_version,
                expected: SNAPSHOT_SCHEMA_VERSION,
            });
        }
        Ok(snapshot)
    }

    /// Human-readable JSON encoding, for post-mortems.
    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string_pretty(self).map_err(|e| SessionError::SnapshotDecode {
            message: e.to_string(),
        })
    }
}

impl Session {
    /// Capture the complete session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let word_pos = self.rng.get_word_pos();
        SessionSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            session: SessionCore {
                id: self.id,
                step: self.step,
                next_goal_id: self.next_goal_id,
                goal: self.goal.clone(),
                total_tokens: self.total_tokens,
                previous_error: self.previous_error,
                last_agreement: self.last_agreement,
                last_response_chars: self.last_response_chars,
                rng_seed: self.config.rng_seed,
                rng_word_pos: ((word_pos >> 64) as u64, word_pos as u64),
                config: self.config.clone(),
            },
            weights: self.weights.clone(),
            calibration: self.calibrator.clone(),
            predictions: self.ledger.clone(),
            reputation: self.reputation.clone(),
            modulations: self.modulator.clone(),
            context: self.context.clone(),
            engines: EngineStates {
                router: self.router.clone(),
                attention: self.attention.clone(),
                columns: self.columns.clone(),
                concepts: self.concepts.clone(),
                associator: self.associator.clone(),
                adaptation: self.adaptation.clone(),
                goal_engines: self.goal_engines.clone(),
                decision_log: self.decision_log.clone(),
            },
        }
    }
}

/// Rebuild a session from a snapshot around fresh collaborator handles.
pub fn restore_session(
    snapshot: SessionSnapshot,
    services: Arc<SharedServices>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
) -> Result<Session, SessionError> {
    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(SessionError::SnapshotVersion {
            found: snapshot.schema_version,
            expected: SNAPSHOT_SCHEMA_VERSION,
        });
    }
    let core = snapshot.session;
    let mut rng = ChaCha8Rng::seed_from_u64(core.rng_seed);
    let word_pos = (u128::from(core.rng_word_pos.0) << 64) | u128::from(core.rng_word_pos.1);
    rng.set_word_pos(word_pos);

    let mut session = Session::new(
        core.id,
        core.config.clone(),
        services,
        provider,
        tools,
    );
    session.step = core.step;
    session.next_goal_id = core.next_goal_id;
    session.goal = core.goal;
    session.total_tokens = core.total_tokens;
    session.previous_error = core.previous_error;
    session.last_agreement = core.last_agreement;
    session.last_response_chars = core.last_response_chars;
    session.rng = rng;
    session.weights = snapshot.weights;
    session.calibrator = snapshot.calibration;
    session.ledger = snapshot.predictions;
    session.reputation = snapshot.reputation;
    session.modulator = snapshot.modulations;
    session.context = snapshot.context;
    session.router = snapshot.engines.router;
    session.attention = snapshot.engines.attention;
    session.columns = snapshot.engines.columns;
    session.concepts = snapshot.engines.concepts;
    session.associator = snapshot.engines.associator;
    session.adaptation = snapshot.engines.adaptation;
    session.goal_engines = snapshot.engines.goal_engines;
    session.decision_log = snapshot.engines.decision_log;
    // Pattern tables are rebuilt, not serialized.
    session.detector = FeedbackDetector::new(core.config.adaptation.clone());
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::error::ProviderError;
    use crate::provider::{GenerationRequest, LlmResponse, RoleHint, ToolDescriptor, ToolResponse};

    struct NullProvider;

    #[async_trait]
    impl LlmProvider for NullProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::Unavailable {
                message: "null".into(),
            })
        }

        fn model_id(&self, role: RoleHint) -> String {
            format!("null-{}", role.as_str())
        }
    }

    struct NullTools;

    #[async_trait]
    impl ToolExecutor for NullTools {
        fn list(&self) -> Vec<ToolDescriptor> {
            Vec::new()
        }

        async fn execute(&self, _name: &str, _args: &str) -> ToolResponse {
            ToolResponse::err("no tools")
        }
    }

    fn session() -> Session {
        Session::new(
            7,
            SessionConfig::default(),
            SharedServices::new(false),
            Arc::new(NullProvider),
            Arc::new(NullTools),
        )
    }

    #[test]
    fn snapshot_bytes_round_trip() {
        let mut session = session();
        session.set_goal("ship the release notes").unwrap();
        session
            .weights
            .update(
                crate::weights::WeightCategory::Behavioral,
                "verbosity",
                0.4,
                "test",
                "seed",
            )
            .unwrap();
        session.weights.record_tool_outcome("search", true, 120.0);
        session.reputation.record("search", 1.0, 1_700_000_000);

        let snapshot = session.snapshot();
        let bytes = snapshot.to_bytes().unwrap();
        let decoded = SessionSnapshot::from_bytes(&bytes).unwrap();

        let restored = restore_session(
            decoded,
            SharedServices::new(false),
            Arc::new(NullProvider),
            Arc::new(NullTools),
        )
        .unwrap();

        assert_eq!(restored.step(), session.step());
        assert_eq!(
            restored.goal().map(|g| g.text.clone()),
            session.goal().map(|g| g.text.clone())
        );
        assert_eq!(
            restored.weights().flat_values(),
            session.weights().flat_values()
        );
        let original_stats = session.weights().tool_stats("search").unwrap();
        let restored_stats = restored.weights().tool_stats("search").unwrap();
        assert_eq!(original_stats.quality.alpha, restored_stats.quality.alpha);
        assert_eq!(original_stats.quality.beta, restored_stats.quality.beta);
    }

    #[test]
    fn rng_stream_position_survives_restore() {
        let mut session = session();
        session.weights.record_tool_outcome("a", true, 10.0);
        session.weights.record_tool_outcome("b", false, 10.0);
        // Advance the RNG stream.
        let candidates = vec!["a".to_string(), "b".to_string()];
        let _ = session
            .weights
            .best_tool_thompson(&candidates, 0.0, &mut session.rng)
            .unwrap();

        let snapshot = session.snapshot();
        let mut restored = restore_session(
            snapshot,
            SharedServices::new(false),
            Arc::new(NullProvider),
            Arc::new(NullTools),
        )
        .unwrap();

        // The next draw on both sessions must be identical.
        let next_original = session
            .weights
            .best_tool_thompson(&candidates, 0.0, &mut session.rng)
            .unwrap();
        let next_restored = restored
            .weights
            .best_tool_thompson(&candidates, 0.0, &mut restored.rng)
            .unwrap();
        assert_eq!(next_original, next_restored);
    }

    #[test]
    fn version_mismatch_rejected() {
        let session = session();
        let mut snapshot = session.snapshot();
        snapshot.schema_version = 99;
        let bytes = bincode::serialize(&snapshot).unwrap();
        let err = SessionSnapshot::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, SessionError::SnapshotVersion { found: 99, .. }));
    }
}
