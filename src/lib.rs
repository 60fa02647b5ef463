//! # medulla
//!
//! An adaptive decision core for AI agent runtimes. On each conversational
//! turn it routes the turn through a fast or deliberate path, selects tools
//! and a model tier, tracks a multi-tier synaptic weight system with
//! Bayesian posteriors, monitors goal drift and loop conditions, and
//! consolidates learning through plasticity rules.
//!
//! ## Architecture
//!
//! - **Orchestrator** (`orchestrator`): the fixed 14-stage per-turn pipeline
//! - **Weights** (`weights`): seven categories, conjugate posteriors,
//!   Thompson sampling, prospect-theoretic updates
//! - **Calibration** (`calibrate`): prediction → outcome → surprise →
//!   ECE → Platt rescaling
//! - **Router** (`router`): System-1 / System-2 escalation on seven signals
//! - **Goal** (`goal`): Goal-DNA similarity, five-signal drift fusion,
//!   multi-resolution loop detection, adaptive budget
//! - **Reputation & modulation** (`reputation`, `modulate`): trust with
//!   quarantine; targeted activate/silence/amplify/dampen/clamp overlays
//! - **Context** (`context`): hot/warm/cold tiers with L0-L3 progressive
//!   compression under a fixed token budget
//! - **Cortex** (`cortex`): attention priority, functional columns, concept
//!   graph with spreading activation
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use medulla::session::{Runtime, SessionConfig};
//! use medulla::orchestrator::TurnOptions;
//! # use medulla::provider::{LlmProvider, ToolExecutor};
//! # async fn example(provider: Arc<dyn LlmProvider>, tools: Arc<dyn ToolExecutor>) {
//! let runtime = Runtime::new(false);
//! let handle = runtime.create_session(SessionConfig::default(), provider, tools);
//! let result = runtime
//!     .run_turn(&handle, "Summarize the open incidents", TurnOptions::default())
//!     .await
//!     .unwrap();
//! println!("{}", result.content);
//! # }
//! ```

pub mod adapt;
pub mod calibrate;
pub mod context;
pub mod cortex;
pub mod error;
pub mod goal;
pub mod modulate;
pub mod observe;
pub mod orchestrator;
pub mod population;
pub mod provider;
pub mod reputation;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod trajectory;
pub mod weights;
