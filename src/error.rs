//! Rich diagnostic error types for the medulla decision core.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Collaborator-facing errors are typed
//! values; the only non-recoverable kind is an invariant violation, which
//! terminates the owning session.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the decision core.
///
/// Each variant wraps a subsystem-specific error, preserving the full
/// diagnostic chain (error codes, help text) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Weight(#[from] WeightError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Goal(#[from] GoalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Modulation(#[from] ModulationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Session(#[from] SessionError),
}

/// Convenience alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Weight engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WeightError {
    #[error("unknown weight category: \"{name}\"")]
    #[diagnostic(
        code(medulla::weights::unknown_category),
        help(
            "Valid categories are behavioral, tool_preference, model_selection, \
             goal_alignment, user_insight, enterprise, and global."
        )
    )]
    UnknownCategory { name: String },

    #[error("weight update batch rejected: {reason}")]
    #[diagnostic(
        code(medulla::weights::batch_rejected),
        help("Batches are atomic. Fix the offending entry and resubmit the whole batch.")
    )]
    BatchRejected { reason: String },

    #[error("no candidate tools to sample from")]
    #[diagnostic(
        code(medulla::weights::empty_candidates),
        help("Pass at least one non-quarantined tool to the Thompson sampler.")
    )]
    EmptyCandidates,

    #[error("invariant violated in weight engine: {detail}")]
    #[diagnostic(
        code(medulla::weights::invariant),
        help(
            "A numeric invariant (clamp range, posterior positivity) was broken. \
             This is fatal for the session; a post-mortem snapshot is taken."
        )
    )]
    Invariant { detail: String },
}

// ---------------------------------------------------------------------------
// Prediction / calibration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CalibrationError {
    #[error("prediction {id} not found")]
    #[diagnostic(
        code(medulla::calibrate::prediction_not_found),
        help("The prediction id was never issued by this session's ledger.")
    )]
    PredictionNotFound { id: u64 },

    #[error("prediction {id} was already matched with an outcome")]
    #[diagnostic(
        code(medulla::calibrate::prediction_retired),
        help(
            "Each prediction is matched at most once. A second compare is rejected \
             and leaves the ledger untouched."
        )
    )]
    PredictionRetired { id: u64 },

    #[error("unknown calibration domain: \"{name}\"")]
    #[diagnostic(
        code(medulla::calibrate::unknown_domain),
        help(
            "Domains are closed-set: tool_success, model_quality, latency, \
             goal_progress, user_satisfaction. Unknown domains are a protocol \
             version mismatch, never silently accepted."
        )
    )]
    UnknownDomain { name: String },

    #[error("probability {value} outside [0, 1]")]
    #[diagnostic(
        code(medulla::calibrate::bad_probability),
        help("Predicted probabilities must already be normalized into [0, 1].")
    )]
    BadProbability { value: f64 },
}

// ---------------------------------------------------------------------------
// Goal subsystem errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GoalError {
    #[error("no active goal — the session has not been given one")]
    #[diagnostic(
        code(medulla::goal::no_goal),
        help("The first turn of a session establishes the goal; run a turn first.")
    )]
    NoGoal,

    #[error("goal text is empty after normalization")]
    #[diagnostic(
        code(medulla::goal::empty_goal),
        help("A goal must contain at least one non-stop-word token.")
    )]
    EmptyGoal,
}

// ---------------------------------------------------------------------------
// Context packer errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ContextError {
    #[error("context item {id} not found")]
    #[diagnostic(
        code(medulla::context::item_not_found),
        help("The item may have been evicted from the cold tier.")
    )]
    ItemNotFound { id: u64 },

    #[error("token budget {budget} too small to pack the system prompt")]
    #[diagnostic(
        code(medulla::context::budget_too_small),
        help(
            "Increase the model context window or reduce the output reservation / \
             system prompt budget in PackerConfig."
        )
    )]
    BudgetTooSmall { budget: usize },
}

// ---------------------------------------------------------------------------
// Modulator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ModulationError {
    #[error("cannot parse condition expression: \"{expr}\"")]
    #[diagnostic(
        code(medulla::modulate::bad_condition),
        help("Conditions take the form `var op value` with op one of ==, !=, <, <=, >, >=.")
    )]
    BadCondition { expr: String },

    #[error("amplify factor {factor} below 1.0")]
    #[diagnostic(
        code(medulla::modulate::bad_amplify),
        help("Amplify factors must be >= 1.0; use Dampen for factors below 1.")
    )]
    BadAmplify { factor: f64 },

    #[error("dampen factor {factor} outside [0, 1]")]
    #[diagnostic(
        code(medulla::modulate::bad_dampen),
        help("Dampen factors must lie in [0, 1]; use Amplify for factors above 1.")
    )]
    BadDampen { factor: f64 },

    #[error("safety policy {level} blocks {kind} on safety-critical key \"{key}\"")]
    #[diagnostic(
        code(medulla::modulate::safety_blocked),
        help(
            "Under STRICT or LOCKED safety policy, Silence and Dampen may not \
             target keys in the safety-critical set."
        )
    )]
    SafetyBlocked {
        level: String,
        kind: String,
        key: String,
    },
}

// ---------------------------------------------------------------------------
// Provider-boundary errors
// ---------------------------------------------------------------------------

/// Typed errors crossing the LLM-provider boundary.
///
/// No exception mechanism is observable across this boundary: providers
/// return these values and the core decides retry/failover/fail-fast.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ProviderError {
    #[error("rate limited by provider{}", retry_after_ms.map(|ms| format!(" (retry after {ms} ms)")).unwrap_or_default())]
    #[diagnostic(
        code(medulla::provider::rate_limit),
        help("Retried automatically with exponential backoff, up to 3 attempts.")
    )]
    RateLimit { retry_after_ms: Option<u64> },

    #[error("provider service unavailable: {message}")]
    #[diagnostic(
        code(medulla::provider::unavailable),
        help("Retried automatically with exponential backoff, up to 3 attempts.")
    )]
    Unavailable { message: String },

    #[error("provider authentication failed")]
    #[diagnostic(
        code(medulla::provider::auth),
        help("Check the provider credentials. Auth failures fail the turn immediately.")
    )]
    Auth,

    #[error("context length exceeded: {tokens} tokens against a limit of {limit}")]
    #[diagnostic(
        code(medulla::provider::context_length),
        help(
            "The core runs one immediate recompression pass and retries once; \
             if the window still overflows it falls to the summarize-replan path."
        )
    )]
    ContextLength { tokens: usize, limit: usize },

    #[error("invalid request: {message}")]
    #[diagnostic(
        code(medulla::provider::invalid_request),
        help("Permanent provider error; the turn fails over to an alternative role if one exists.")
    )]
    InvalidRequest { message: String },

    #[error("provider call timed out after {timeout_ms} ms")]
    #[diagnostic(
        code(medulla::provider::timeout),
        help("Timeouts are retried with backoff and reported as timeout outcomes.")
    )]
    Timeout { timeout_ms: u64 },
}

impl ProviderError {
    /// Whether this error is retried with exponential backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimit { .. } | Self::Unavailable { .. } | Self::Timeout { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SessionError {
    #[error("session {id} not found for tenant \"{tenant}\"")]
    #[diagnostic(
        code(medulla::session::not_found),
        help("The session was closed or never created under this tenant.")
    )]
    NotFound { tenant: String, id: u64 },

    #[error("turn cancelled by caller")]
    #[diagnostic(
        code(medulla::session::cancelled),
        help("The cancel token was triggered; the pipeline jumped to consolidation.")
    )]
    Cancelled,

    #[error("turn aborted at stage {stage}: {message}")]
    #[diagnostic(
        code(medulla::session::stage_abort),
        help("Stages 1, 4, 5, 6, 9 and 13 must succeed; this one did not.")
    )]
    StageAbort { stage: u8, message: String },

    #[error("invariant violated: {detail}")]
    #[diagnostic(
        code(medulla::session::invariant),
        help(
            "An internal invariant (clamp range, posterior positivity, unknown \
             scope) was broken. The session is terminated; a post-mortem \
             snapshot was taken for analysis."
        )
    )]
    Invariant { detail: String },

    #[error("snapshot schema version {found} is not supported (expected {expected})")]
    #[diagnostic(
        code(medulla::session::snapshot_version),
        help("Snapshots are versioned; migrate the snapshot or use a matching core build.")
    )]
    SnapshotVersion { found: u32, expected: u32 },

    #[error("snapshot decode failed: {message}")]
    #[diagnostic(
        code(medulla::session::snapshot_decode),
        help("The snapshot bytes are corrupt or were produced by an incompatible build.")
    )]
    SnapshotDecode { message: String },
}
