//! Adaptive step/token budget with velocity tracking.
//!
//! Tracks remaining budget, sliding-window progress velocity, and its
//! acceleration. Fast sessions earn extensions, slow ones get tightened,
//! and stalled ones are flagged stuck. Expansion is capped at 3× the
//! initial budget.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Tunables for the adaptive budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub initial_steps: u32,
    pub initial_tokens: u64,
    /// Sliding window over which velocity is averaged.
    pub velocity_window: usize,
    /// Expected progress per step; velocity is judged against this.
    pub expected_velocity: f64,
    /// Velocity multiple above which the budget extends.
    pub extend_factor: f64,
    /// Velocity multiple below which the budget tightens.
    pub tighten_factor: f64,
    /// Steps added on extension.
    pub extend_steps: u32,
    /// Token fraction added on extension.
    pub extend_token_ratio: f64,
    /// Steps removed on tightening.
    pub tighten_steps: u32,
    /// Consecutive zero-velocity steps before the session is stuck.
    pub stuck_threshold: u32,
    /// Utilization triggering the soft cap.
    pub soft_cap: f64,
    /// Maximum expansion over the initial budget.
    pub max_expansion: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            initial_steps: 20,
            initial_tokens: 100_000,
            velocity_window: 5,
            expected_velocity: 0.1,
            extend_factor: 1.5,
            tighten_factor: 0.3,
            extend_steps: 3,
            extend_token_ratio: 0.10,
            tighten_steps: 2,
            stuck_threshold: 3,
            soft_cap: 0.8,
            max_expansion: 3.0,
        }
    }
}

/// Decision emitted after each recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BudgetDecision {
    Proceed,
    /// Budget extended: velocity well above expectation.
    Extended,
    /// Budget tightened: velocity well below expectation.
    Tightened,
    /// No measurable progress for `stuck_threshold` consecutive steps.
    Stuck,
    /// Utilization crossed the soft cap.
    SoftCap,
    /// Budget exhausted.
    HardCap,
}

/// The adaptive budget tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveBudget {
    pub config: BudgetConfig,
    steps_used: u32,
    step_limit: u32,
    tokens_used: u64,
    token_limit: u64,
    progress_window: VecDeque<f64>,
    previous_velocity: f64,
    zero_velocity_streak: u32,
}

impl AdaptiveBudget {
    pub fn new(config: BudgetConfig) -> Self {
        let step_limit = config.initial_steps;
        let token_limit = config.initial_tokens;
        Self {
            config,
            steps_used: 0,
            step_limit,
            tokens_used: 0,
            token_limit,
            progress_window: VecDeque::new(),
            previous_velocity: 0.0,
            zero_velocity_streak: 0,
        }
    }

    /// Record one completed step with its progress (0..1 scale) and token
    /// consumption, and decide how the budget responds.
    pub fn record_step(&mut self, progress: f64, tokens: u64) -> BudgetDecision {
        self.steps_used += 1;
        self.tokens_used += tokens;

        self.progress_window.push_back(progress.max(0.0));
        while self.progress_window.len() > self.config.velocity_window {
            self.progress_window.pop_front();
        }
        let velocity = self.velocity();
        let _acceleration = velocity - self.previous_velocity;
        self.previous_velocity = velocity;

        if progress <= f64::EPSILON {
            self.zero_velocity_streak += 1;
        } else {
            self.zero_velocity_streak = 0;
        }

        if self.utilization() >= 1.0 {
            return BudgetDecision::HardCap;
        }
        if self.zero_velocity_streak >= self.config.stuck_threshold {
            return BudgetDecision::Stuck;
        }
        if self.utilization() >= self.config.soft_cap {
            return BudgetDecision::SoftCap;
        }

        let expected = self.config.expected_velocity;
        if velocity > self.config.extend_factor * expected && self.can_extend() {
            self.step_limit += self.config.extend_steps;
            let bump = (self.config.initial_tokens as f64 * self.config.extend_token_ratio) as u64;
            self.token_limit = self
                .token_limit
                .saturating_add(bump)
                .min((self.config.initial_tokens as f64 * self.config.max_expansion) as u64);
            tracing::debug!(velocity, step_limit = self.step_limit, "budget extended");
            return BudgetDecision::Extended;
        }
        if velocity < self.config.tighten_factor * expected
            && self.progress_window.len() >= self.config.velocity_window
        {
            self.step_limit = self
                .step_limit
                .saturating_sub(self.config.tighten_steps)
                .max(self.steps_used);
            tracing::debug!(velocity, step_limit = self.step_limit, "budget tightened");
            return BudgetDecision::Tightened;
        }
        BudgetDecision::Proceed
    }

    fn can_extend(&self) -> bool {
        let max_steps = (self.config.initial_steps as f64 * self.config.max_expansion) as u32;
        self.step_limit + self.config.extend_steps <= max_steps
    }

    /// Mean progress per step over the sliding window.
    pub fn velocity(&self) -> f64 {
        if self.progress_window.is_empty() {
            return 0.0;
        }
        self.progress_window.iter().sum::<f64>() / self.progress_window.len() as f64
    }

    /// The larger of step and token utilization, in [0, 1+].
    pub fn utilization(&self) -> f64 {
        let steps = if self.step_limit == 0 {
            1.0
        } else {
            f64::from(self.steps_used) / f64::from(self.step_limit)
        };
        let tokens = if self.token_limit == 0 {
            1.0
        } else {
            self.tokens_used as f64 / self.token_limit as f64
        };
        steps.max(tokens)
    }

    /// Consumed-over-total ratio fed to the drift engine.
    pub fn consumption_ratio(&self) -> f64 {
        self.utilization().min(1.0)
    }

    pub fn steps_used(&self) -> u32 {
        self.steps_used
    }

    pub fn step_limit(&self) -> u32 {
        self.step_limit
    }

    pub fn tokens_used(&self) -> u64 {
        self.tokens_used
    }

    pub fn token_limit(&self) -> u64 {
        self.token_limit
    }
}

impl Default for AdaptiveBudget {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
