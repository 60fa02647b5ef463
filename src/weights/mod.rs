//! Weight engine: seven categories of adaptive weights with Bayesian
//! posteriors, prospect-theoretic updates, Thompson sampling, and
//! consolidation-time plasticity rules.

pub mod engine;
pub mod plasticity;
pub mod posterior;
pub mod prospect;

pub use engine::{
    BatchEntry, LearningRates, ToolStats, WeightCategory, WeightConfig, WeightEngine,
    WeightState, WeightUpdate,
};
pub use plasticity::{consolidate, ActiveKey, PlasticityConfig, PlasticityReport};
pub use posterior::{BetaPosterior, GammaPosterior};
pub use prospect::{prospect_delta, value, weight_probability, ProspectConfig};
