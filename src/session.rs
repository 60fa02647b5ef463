//! Sessions and the tenant-partitioned runtime.
//!
//! A session exclusively owns its sub-engines and context store; nothing
//! outside the session mutates session state. The runtime registry
//! partitions sessions strictly by tenant id and hands out opaque handles.
//! Each session carries its own deterministic RNG stream so snapshots
//! restore to bit-identical sampling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::adapt::{AdaptationConfig, AdaptationFilter, FeedbackDetector};
use crate::calibrate::{CalibrationConfig, Calibrator, PredictionLedger};
use crate::context::{ContextStore, PackerConfig};
use crate::cortex::{
    AttentionConfig, AttentionEngine, ColumnConfig, ColumnManager, ConceptConfig, ConceptGraph,
    CrossModalAssociator,
};
use crate::error::{CoreResult, SessionError};
use crate::goal::{
    AdaptiveBudget, BudgetConfig, DriftConfig, DriftEngine, Goal, LoopConfig, LoopDetector,
};
use crate::modulate::{Modulator, ModulatorConfig};
use crate::observe::DecisionLog;
use crate::provider::{LlmProvider, RetryConfig, RoleHint, StreamChunk, ToolExecutor};
use crate::reputation::{ReputationBook, ReputationConfig};
use crate::router::{DualProcessRouter, RouterConfig};
use crate::trajectory::SharedServices;
use crate::weights::{PlasticityConfig, WeightConfig, WeightEngine};

/// Full session configuration: identity, budgets, and every engine tunable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Tenant partition key; no cross-tenant read or write is permitted.
    pub tenant: String,
    /// User id for the shared insight store.
    pub user: String,
    /// Context profile, e.g. "coding" or "research".
    pub context_profile: String,
    /// Compliance frameworks, opaque to the core; passed through to the
    /// policy collaborator.
    pub compliance_frameworks: Vec<String>,
    /// Seed of the session's deterministic RNG stream.
    pub rng_seed: u64,
    /// Enterprise safety level fed to the router, in [0, 1].
    pub enterprise_safety_level: f64,
    /// Speed weight for Thompson tool scoring, in [0, 1].
    pub speed_weight: f64,
    /// System prompt packed at the head of every window.
    pub system_prompt: String,
    /// Maximum tool-execution rounds per turn.
    pub max_tool_rounds: u32,
    /// Turns between calibration cycles.
    pub calibration_cycle_turns: u64,
    /// Turns between maintenance passes.
    pub maintenance_turns: u64,
    /// Initial flat weight values ("category.key" → value).
    pub initial_weights: Vec<(String, f64)>,

    pub weights: WeightConfig,
    pub plasticity: PlasticityConfig,
    pub calibration: CalibrationConfig,
    pub router: RouterConfig,
    pub drift: DriftConfig,
    pub loops: LoopConfig,
    pub budget: BudgetConfig,
    pub reputation: ReputationConfig,
    pub packer: PackerConfig,
    pub adaptation: AdaptationConfig,
    pub modulator: ModulatorConfig,
    pub attention: AttentionConfig,
    pub columns: ColumnConfig,
    pub concepts: ConceptConfig,
    pub retry: RetryConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tenant: "default".into(),
            user: "default".into(),
            context_profile: "general".into(),
            compliance_frameworks: Vec::new(),
            rng_seed: 0x6d65_6475_6c6c,
            enterprise_safety_level: 0.2,
            speed_weight: 0.2,
            system_prompt: "You are a capable assistant.".into(),
            max_tool_rounds: 5,
            calibration_cycle_turns: 10,
            maintenance_turns: 25,
            initial_weights: Vec::new(),
            weights: WeightConfig::default(),
            plasticity: PlasticityConfig::default(),
            calibration: CalibrationConfig::default(),
            router: RouterConfig::default(),
            drift: DriftConfig::default(),
            loops: LoopConfig::default(),
            budget: BudgetConfig::default(),
            reputation: ReputationConfig::default(),
            packer: PackerConfig::default(),
            adaptation: AdaptationConfig::default(),
            modulator: ModulatorConfig::default(),
            attention: AttentionConfig::default(),
            columns: ColumnConfig::default(),
            concepts: ConceptConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load overrides from a TOML document on top of the defaults.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }
}

/// Caller-held cancellation contract for an in-flight turn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation: the pipeline jumps to consolidation at the
    /// next stage boundary and the suspended call is abandoned.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Stats returned when a session closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub turns: u64,
    pub total_tokens: u64,
    pub ending_weights: std::collections::BTreeMap<String, f64>,
}

/// The goal-lifetime engines, allocated at goal initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalEngines {
    pub drift: DriftEngine,
    pub loops: LoopDetector,
    pub budget: AdaptiveBudget,
}

/// One logical conversation and everything it owns.
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) id: u64,
    pub(crate) step: u64,
    pub(crate) goal: Option<Goal>,
    pub(crate) next_goal_id: u64,
    pub(crate) goal_engines: Option<GoalEngines>,

    pub(crate) weights: WeightEngine,
    pub(crate) calibrator: Calibrator,
    pub(crate) ledger: PredictionLedger,
    pub(crate) router: DualProcessRouter,
    pub(crate) reputation: ReputationBook,
    pub(crate) modulator: Modulator,
    pub(crate) context: ContextStore,
    pub(crate) attention: AttentionEngine,
    pub(crate) columns: ColumnManager,
    pub(crate) concepts: ConceptGraph,
    pub(crate) associator: CrossModalAssociator,
    pub(crate) adaptation: AdaptationFilter,
    pub(crate) detector: FeedbackDetector,
    pub(crate) decision_log: DecisionLog,

    pub(crate) rng: ChaCha8Rng,
    pub(crate) total_tokens: u64,
    pub(crate) previous_error: bool,
    pub(crate) last_agreement: f64,
    pub(crate) last_response_chars: usize,

    pub(crate) services: Arc<SharedServices>,
    pub(crate) provider: Arc<dyn LlmProvider>,
    pub(crate) tools: Arc<dyn ToolExecutor>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant", &self.config.tenant)
            .field("step", &self.step)
            .field("goal", &self.goal.as_ref().map(|g| g.text.as_str()))
            .finish()
    }
}

impl Session {
    /// Build a fresh session around its collaborator handles.
    pub fn new(
        id: u64,
        config: SessionConfig,
        services: Arc<SharedServices>,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        let mut weights = WeightEngine::new(config.weights.clone());
        for (flat_key, value) in &config.initial_weights {
            weights.set_flat(flat_key, *value);
        }
        let mut packer = config.packer.clone();
        if packer.domain_keywords.is_empty() && config.context_profile != "general" {
            packer.domain_keywords = vec![config.context_profile.clone()];
        }
        Self {
            id,
            step: 0,
            goal: None,
            next_goal_id: 1,
            goal_engines: None,
            weights,
            calibrator: Calibrator::new(config.calibration.clone()),
            ledger: PredictionLedger::default(),
            router: DualProcessRouter::new(config.router.clone()),
            reputation: ReputationBook::new(config.reputation.clone()),
            modulator: Modulator::new(config.modulator.clone()),
            context: ContextStore::new(packer),
            attention: AttentionEngine::new(config.attention.clone()),
            columns: ColumnManager::with_default_columns(config.columns.clone()),
            concepts: ConceptGraph::new(config.concepts.clone()),
            associator: CrossModalAssociator::new(config.concepts.clone()),
            adaptation: AdaptationFilter::new(config.adaptation.clone()),
            detector: FeedbackDetector::new(config.adaptation.clone()),
            decision_log: DecisionLog::default(),
            rng: ChaCha8Rng::seed_from_u64(config.rng_seed),
            total_tokens: 0,
            previous_error: false,
            last_agreement: 1.0,
            last_response_chars: 0,
            services,
            provider,
            tools,
            config,
        }
    }

    /// Turn counter; monotonically increasing over the session lifetime.
    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tenant(&self) -> &str {
        &self.config.tenant
    }

    pub fn goal(&self) -> Option<&Goal> {
        self.goal.as_ref()
    }

    pub fn decision_log(&self) -> &DecisionLog {
        &self.decision_log
    }

    pub fn decision_log_mut(&mut self) -> &mut DecisionLog {
        &mut self.decision_log
    }

    pub fn router(&self) -> &DualProcessRouter {
        &self.router
    }

    pub fn weights(&self) -> &WeightEngine {
        &self.weights
    }

    pub fn reputation(&mut self) -> &mut ReputationBook {
        &mut self.reputation
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }

    /// Inject a previous-step error flag (testing and replay hooks).
    pub fn set_previous_error(&mut self, errored: bool) {
        self.previous_error = errored;
    }

    /// Closing stats for the session.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            turns: self.step,
            total_tokens: self.total_tokens,
            ending_weights: self.weights.flat_values(),
        }
    }

    /// Effective weights after the modulator overlay, for inspection.
    pub fn effective_weights(&self) -> std::collections::BTreeMap<String, f64> {
        let context = self.modulation_context();
        self.modulator.apply(&self.weights.flat_values(), &context)
    }

    /// Context variables visible to conditional modulations and policies.
    pub(crate) fn modulation_context(&self) -> std::collections::BTreeMap<String, f64> {
        let mut ctx = std::collections::BTreeMap::new();
        ctx.insert(
            "drift".to_string(),
            self.goal_engines
                .as_ref()
                .map(|g| g.drift.last_score())
                .unwrap_or(0.0),
        );
        ctx.insert("safety".to_string(), self.config.enterprise_safety_level);
        ctx.insert("step".to_string(), self.step as f64);
        ctx.insert(
            "surprise".to_string(),
            self.ledger.recent_surprise(10),
        );
        ctx.insert("agreement".to_string(), self.last_agreement);
        ctx
    }

    /// Current epoch seconds; quarantine and habituation clocks.
    pub(crate) fn now_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Opaque handle to a session in the runtime registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub tenant: String,
    pub id: u64,
}

/// The process-wide runtime: session registry plus shared services.
///
/// Sessions are partitioned strictly by tenant id; a handle from one tenant
/// can never reach another tenant's session.
pub struct Runtime {
    sessions: DashMap<(String, u64), Arc<tokio::sync::Mutex<Session>>>,
    services: Arc<SharedServices>,
    next_id: AtomicU64,
}

impl Runtime {
    pub fn new(enable_global_aggregation: bool) -> Self {
        Self {
            sessions: DashMap::new(),
            services: SharedServices::new(enable_global_aggregation),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn services(&self) -> &Arc<SharedServices> {
        &self.services
    }

    /// Create a session and register it under its tenant.
    pub fn create_session(
        &self,
        config: SessionConfig,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
    ) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tenant = config.tenant.clone();
        let session = Session::new(id, config, self.services.clone(), provider, tools);
        tracing::info!(tenant = %tenant, id, "session created");
        self.sessions.insert(
            (tenant.clone(), id),
            Arc::new(tokio::sync::Mutex::new(session)),
        );
        SessionHandle { tenant, id }
    }

    fn lookup(&self, handle: &SessionHandle) -> CoreResult<Arc<tokio::sync::Mutex<Session>>> {
        self.sessions
            .get(&(handle.tenant.clone(), handle.id))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                SessionError::NotFound {
                    tenant: handle.tenant.clone(),
                    id: handle.id,
                }
                .into()
            })
    }

    /// Run one turn against a session.
    pub async fn run_turn(
        &self,
        handle: &SessionHandle,
        user_message: &str,
        options: crate::orchestrator::TurnOptions,
    ) -> CoreResult<crate::orchestrator::TurnResult> {
        let session = self.lookup(handle)?;
        let mut guard = session.lock().await;
        guard.run_turn(user_message, options).await
    }

    /// Run a turn, streaming chunks as they become available.
    ///
    /// Providers without native streaming degrade gracefully: the final
    /// content arrives chunked, followed by an `is_final` marker.
    pub async fn stream_turn(
        &self,
        handle: &SessionHandle,
        user_message: &str,
    ) -> CoreResult<tokio::sync::mpsc::Receiver<StreamChunk>> {
        let session = self.lookup(handle)?;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let message = user_message.to_string();
        tokio::spawn(async move {
            let mut guard = session.lock().await;
            let model_id = guard.provider.model_id(RoleHint::Worker);
            match guard
                .run_turn(&message, crate::orchestrator::TurnOptions::default())
                .await
            {
                Ok(result) => {
                    for piece in chunk_text(&result.content, 256) {
                        let _ = tx
                            .send(StreamChunk {
                                content: piece,
                                is_final: false,
                                model_id: result.model_id.clone(),
                            })
                            .await;
                    }
                    let _ = tx
                        .send(StreamChunk {
                            content: String::new(),
                            is_final: true,
                            model_id: result.model_id,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamChunk {
                            content: format!("turn failed: {e}"),
                            is_final: true,
                            model_id,
                        })
                        .await;
                }
            }
        });
        Ok(rx)
    }

    /// Close a session, removing it from the registry.
    pub fn close_session(&self, handle: &SessionHandle) -> CoreResult<SessionStats> {
        let (_, session) = self
            .sessions
            .remove(&(handle.tenant.clone(), handle.id))
            .ok_or_else(|| SessionError::NotFound {
                tenant: handle.tenant.clone(),
                id: handle.id,
            })?;
        let stats = closing_stats(&session);
        tracing::info!(tenant = %handle.tenant, id = handle.id, turns = stats.turns, "session closed");
        Ok(stats)
    }

    /// Snapshot a session's complete state.
    pub async fn snapshot(
        &self,
        handle: &SessionHandle,
    ) -> CoreResult<crate::snapshot::SessionSnapshot> {
        let session = self.lookup(handle)?;
        let guard = session.lock().await;
        Ok(guard.snapshot())
    }

    /// Restore a snapshot into a fresh registered session.
    pub fn restore(
        &self,
        snapshot: crate::snapshot::SessionSnapshot,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
    ) -> CoreResult<SessionHandle> {
        let session =
            crate::snapshot::restore_session(snapshot, self.services.clone(), provider, tools)?;
        let handle = SessionHandle {
            tenant: session.config.tenant.clone(),
            id: session.id,
        };
        self.sessions.insert(
            (handle.tenant.clone(), handle.id),
            Arc::new(tokio::sync::Mutex::new(session)),
        );
        Ok(handle)
    }

    /// Number of live sessions for a tenant.
    pub fn session_count(&self, tenant: &str) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.key().0 == tenant)
            .count()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Read closing stats from an exclusively-held session mutex.
fn closing_stats(session: &Arc<tokio::sync::Mutex<Session>>) -> SessionStats {
    match session.try_lock() {
        Ok(guard) => guard.stats(),
        // A turn is still in flight; report what the counter shows.
        Err(_) => SessionStats {
            turns: 0,
            total_tokens: 0,
            ending_weights: std::collections::BTreeMap::new(),
        },
    }
}

/// Split text into chunks for degraded streaming.
fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(chunk_chars)
        .map(|c| c.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_toml_overrides_defaults() {
        let config = SessionConfig::from_toml_str(
            r#"
            tenant = "acme"
            context_profile = "coding"
            max_tool_rounds = 3

            [router]
            drift_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.tenant, "acme");
        assert_eq!(config.max_tool_rounds, 3);
        assert!((config.router.drift_threshold - 0.5).abs() < 1e-12);
        // Untouched fields keep defaults.
        assert_eq!(config.maintenance_turns, 25);
    }

    #[test]
    fn cancel_token_flips_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn chunking_preserves_content() {
        let text = "abcdef".repeat(100);
        let chunks = chunk_text(&text, 256);
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), text);
    }
}
