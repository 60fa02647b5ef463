//! Provider-boundary contracts: LLM generation and tool execution.
//!
//! The core exposes contracts, not protocols. Providers return typed
//! errors; nothing unwinds across the boundary. Transient failures
//! (rate-limit, unavailable, timeout) are retried with exponential backoff
//! and jitter; everything else fails fast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Message roles on the provider wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message handed to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// Which model tier the router selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleHint {
    /// The deliberate tier (System-2).
    Orchestrator,
    /// The fast tier (System-1).
    Worker,
}

impl RoleHint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Worker => "worker",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments; the core treats them as opaque.
    pub args_json: String,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    ToolUse,
    Length,
    Other,
}

/// A complete generation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
}

/// One chunk of a streamed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub content: String,
    pub is_final: bool,
    pub model_id: String,
}

/// Everything a provider needs for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub messages: Vec<ChatMessage>,
    pub role_hint: RoleHint,
    pub temperature: f64,
    pub max_tokens: u64,
    pub tools: Vec<ToolDescriptor>,
}

/// The LLM-provider contract.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a response. Errors are typed values, never panics.
    async fn generate(&self, request: GenerationRequest) -> Result<LlmResponse, ProviderError>;

    /// Whether the provider is reachable.
    fn health_check(&self) -> bool {
        true
    }

    /// Model id for a role tier, used in stream chunks and decisions.
    fn model_id(&self, role: RoleHint) -> String;
}

/// A tool the executor can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters.
    pub parameters: serde_json::Value,
    pub is_async: bool,
}

/// Tool execution result. Errors come back as strings; no exception
/// crosses this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub result: String,
    pub error: Option<String>,
}

impl ToolResponse {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            result: result.into(),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            result: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

/// The tool-executor contract.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Descriptors of every available tool.
    fn list(&self) -> Vec<ToolDescriptor>;

    /// Execute a tool by name with JSON arguments.
    async fn execute(&self, name: &str, args_json: &str) -> ToolResponse;
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff policy for transient provider errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_jitter_ms: u64,
    pub max_attempts: u32,
    /// Deadline for each generation call.
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            factor: 2.0,
            max_jitter_ms: 500,
            max_attempts: 3,
            call_timeout_ms: 120_000,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before attempt `attempt` (1-based), with jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let jitter = if self.max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(base as u64 + jitter)
    }
}

/// Call the provider with timeout and the transient-retry policy.
///
/// Rate-limit, unavailable, and timeout errors retry up to
/// `max_attempts` with exponential backoff (honoring a provider-supplied
/// retry-after); all other errors fail fast.
pub async fn generate_with_retry(
    provider: &Arc<dyn LlmProvider>,
    request: GenerationRequest,
    config: &RetryConfig,
) -> Result<LlmResponse, ProviderError> {
    let mut attempt = 1u32;
    loop {
        let call = provider.generate(request.clone());
        let outcome =
            match tokio::time::timeout(Duration::from_millis(config.call_timeout_ms), call).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout {
                    timeout_ms: config.call_timeout_ms,
                }),
            };
        match outcome {
            Ok(response) => return Ok(response),
            Err(e) if e.is_transient() && attempt < config.max_attempts => {
                let delay = match &e {
                    ProviderError::RateLimit {
                        retry_after_ms: Some(ms),
                    } => Duration::from_millis(*ms),
                    _ => config.delay_for(attempt),
                };
                tracing::warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "transient provider error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct AlwaysErrProvider {
        kind: ProviderError,
    }

    #[async_trait]
    impl LlmProvider for AlwaysErrProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<LlmResponse, ProviderError> {
            Err(self.kind.clone())
        }

        fn model_id(&self, _role: RoleHint) -> String {
            "erring".into()
        }
    }

    struct CountingProvider {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<LlmResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(ProviderError::Unavailable {
                    message: "overloaded".into(),
                })
            } else {
                Ok(LlmResponse {
                    content: "ok".into(),
                    tool_calls: Vec::new(),
                    usage: TokenUsage {
                        input_tokens: 10,
                        output_tokens: 5,
                    },
                    finish_reason: FinishReason::Stop,
                })
            }
        }

        fn model_id(&self, _role: RoleHint) -> String {
            "counting".into()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            messages: vec![ChatMessage::user("hi")],
            role_hint: RoleHint::Worker,
            temperature: 0.3,
            max_tokens: 256,
            tools: Vec::new(),
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_delay_ms: 1,
            max_jitter_ms: 0,
            call_timeout_ms: 5_000,
            ..RetryConfig::default()
        }
    }

    #[tokio::test]
    async fn transient_errors_retry_to_success() {
        let provider: Arc<dyn LlmProvider> = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let response = generate_with_retry(&provider, request(), &fast_retry())
            .await
            .unwrap();
        assert_eq!(response.content, "ok");
    }

    #[tokio::test]
    async fn transient_errors_exhaust_attempts() {
        let provider: Arc<dyn LlmProvider> = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
            fail_first: 10,
        });
        let err = generate_with_retry(&provider, request(), &fast_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn permanent_errors_fail_fast() {
        let provider: Arc<dyn LlmProvider> = Arc::new(AlwaysErrProvider {
            kind: ProviderError::Auth,
        });
        let err = generate_with_retry(&provider, request(), &fast_retry())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let config = RetryConfig {
            max_jitter_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(config.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(config.delay_for(3), Duration::from_millis(4_000));
    }
}
