//! The turn orchestrator: a fixed 14-stage pipeline per conversational turn.
//!
//! Stage order is part of the contract. Stages 3, 11, 12 and 14 are
//! best-effort; stages 7 and 8 fail the turn but still run accounting and
//! consolidation; stages 1, 4, 5, 6, 9 and 13 abort the turn on failure.
//! Cancellation jumps straight to consolidation with a cancellation
//! outcome and leaves no partial writes behind.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::adapt::{FeedbackContext, FeedbackKind};
use crate::calibrate::{CalibrationDomain, Outcome, OutcomeClass, Surprise};
use crate::context::ContextItemKind;
use crate::cortex::AttentionPriority;
use crate::error::{CoreResult, ProviderError, SessionError};
use crate::goal::{DriftAction, DriftAssessment, Goal, LoopAction};
use crate::modulate::ModulationKind;
use crate::observe::{DecisionType, Metric};
use crate::population::{
    aggregate, composite_confidence, evaluate_response, CompositeWeights, RecommendedAction,
};
use crate::provider::{
    generate_with_retry, ChatMessage, GenerationRequest, LlmResponse, RoleHint, TokenUsage,
    ToolDescriptor,
};
use crate::router::{detects_deliberation_request, ProcessingPath, RouterSignals};
use crate::session::{CancelToken, GoalEngines, Session};
use crate::weights::{ActiveKey, WeightCategory};

/// Per-turn options.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// One-shot sampling temperature override.
    pub temperature_override: Option<f64>,
    /// One-shot output token cap override.
    pub max_tokens_override: Option<u64>,
    /// Force the model tier regardless of routing.
    pub force_role: Option<RoleHint>,
    pub cancel: Option<CancelToken>,
}

/// How a failed turn failed; carried in the result metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TurnErrorKind {
    Provider { message: String },
    ProviderTimeout { timeout_ms: u64 },
    ContextOverflow,
}

/// The result of one orchestrated turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub turn: u64,
    pub content: String,
    pub role: RoleHint,
    pub model_id: String,
    pub path: ProcessingPath,
    pub usage: TokenUsage,
    /// Estimated output quality from the population ensemble.
    pub quality: f64,
    pub surprise: Option<Surprise>,
    pub drift: Option<DriftAssessment>,
    pub recommended: RecommendedAction,
    pub tool_rounds: u32,
    pub error: Option<TurnErrorKind>,
}

/// What stages 7/8 produced for the rest of the pipeline.
struct StageOutcome {
    response: Option<LlmResponse>,
    error: Option<TurnErrorKind>,
    usage: TokenUsage,
    tool_rounds: u32,
    executed_tools: Vec<(String, bool)>,
    latency_ms: f64,
}

fn cancel_requested(options: &TurnOptions) -> bool {
    options.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
}

/// Base resource envelope per attention priority and path.
fn resource_envelope(priority: AttentionPriority, path: ProcessingPath) -> (f64, u64) {
    let (temperature, mut max_tokens) = match path {
        ProcessingPath::System1 => (0.3, 1024),
        ProcessingPath::System2 => (0.7, 4096),
    };
    if priority >= AttentionPriority::High {
        max_tokens *= 2;
    }
    (temperature, max_tokens)
}

impl Session {
    /// Establish the session goal explicitly, allocating the goal-lifetime
    /// engines. Called by stage 2 on the first turn when no goal exists.
    pub fn set_goal(&mut self, text: &str) -> CoreResult<()> {
        let goal = Goal::new(self.next_goal_id, text)?;
        self.next_goal_id += 1;
        let changed = self.goal.is_some();
        self.goal = Some(goal);
        self.goal_engines = Some(GoalEngines {
            drift: crate::goal::DriftEngine::new(self.config.drift.clone()),
            loops: crate::goal::LoopDetector::new(self.config.loops.clone()),
            budget: crate::goal::AdaptiveBudget::new(self.config.budget.clone()),
        });
        if changed {
            self.modulator.on_goal_change();
        }
        Ok(())
    }

    /// Drive one turn through the 14-stage pipeline.
    pub async fn run_turn(
        &mut self,
        user_message: &str,
        options: TurnOptions,
    ) -> CoreResult<TurnResult> {
        self.step += 1;
        let step = self.step;
        let now = Self::now_secs();
        tracing::debug!(step, "turn started");

        // ---- Stage 1: implicit feedback + adaptation (must succeed) ----
        if cancel_requested(&options) {
            return Err(self.finish_cancelled(step));
        }
        self.stage_feedback(user_message, now)
            .map_err(|e| SessionError::StageAbort {
                stage: 1,
                message: e.to_string(),
            })?;

        // ---- Stage 2: goal initialization (first turn only) ----
        if self.goal.is_none() {
            if self.set_goal(user_message).is_err() {
                // Messages with no token content fall back to a generic goal.
                self.set_goal("general assistance")?;
            }
        }
        let goal = self
            .goal
            .clone()
            .ok_or_else(|| SessionError::StageAbort {
                stage: 2,
                message: "goal missing after initialization".into(),
            })?;

        // ---- Stage 3: context integration (best effort) ----
        let user_item = self
            .context
            .insert(ContextItemKind::User, user_message, step, None);
        let priority = self.attention.classify(step, user_message);
        let column = self.columns.select(user_message).map(|c| c.name.clone());
        let topic_tokens: Vec<String> = crate::goal::GoalDna::extract(user_message)
            .tokens
            .into_iter()
            .take(5)
            .collect();
        {
            let seeds: Vec<&str> = topic_tokens.iter().map(String::as_str).collect();
            self.concepts.activate(&seeds, step);
        }
        if let (Some(column_name), Some(topic)) = (&column, topic_tokens.first()) {
            self.associator
                .associate("topic", topic, "column", column_name, 0.3);
        }

        // ---- Stage 4: prediction (must succeed) ----
        if cancel_requested(&options) {
            return Err(self.finish_cancelled(step));
        }
        let tool_names: Vec<String> = self.tools.list().into_iter().map(|d| d.name).collect();
        let available = self.reputation.available(&tool_names, now);
        let likely_tool = if available.is_empty() {
            "none".to_string()
        } else {
            self.weights
                .best_tool_thompson(&available, self.config.speed_weight, &mut self.rng)
                .map_err(|e| SessionError::StageAbort {
                    stage: 4,
                    message: e.to_string(),
                })?
        };
        let predicted_latency = self
            .weights
            .tool_stats(&likely_tool)
            .map(|s| s.latency.mean_latency_ms())
            .filter(|ms| *ms > 1.0)
            .unwrap_or(500.0);
        let tool_success_prior = self
            .weights
            .tool_stats(&likely_tool)
            .map(|s| s.quality.mean())
            .unwrap_or(0.6);
        let confidence = self
            .calibrator
            .adjust(CalibrationDomain::ToolSuccess, tool_success_prior);
        let predicted_quality = self.calibrator.adjust(CalibrationDomain::ModelQuality, 0.75);
        let prediction_id = self.ledger.predict(
            OutcomeClass::Success,
            confidence,
            predicted_latency,
            predicted_quality,
            &likely_tool,
            RoleHint::Worker.as_str(),
            step,
        );

        // ---- Stage 5: dual-process routing (must succeed) ----
        let novelty = self
            .services
            .observe_task(column.as_deref().unwrap_or("general"));
        let drift_score = self
            .goal_engines
            .as_ref()
            .map(|g| g.drift.last_score())
            .unwrap_or(0.0);
        let signals = RouterSignals {
            avg_surprise: self.ledger.recent_surprise(10),
            population_agreement: self.last_agreement,
            task_novelty: novelty,
            enterprise_safety: self.config.enterprise_safety_level,
            explicit_request: detects_deliberation_request(user_message),
            previous_error: self.previous_error,
            goal_drift: drift_score,
        };
        let route = self.router.route(step, signals);
        let mut role = match route.path {
            ProcessingPath::System1 => RoleHint::Worker,
            ProcessingPath::System2 => RoleHint::Orchestrator,
        };
        if let Some(forced) = options.force_role {
            role = forced;
        }
        let model_id = self.provider.model_id(role);
        if route.path == ProcessingPath::System2 {
            let reasons: Vec<String> = route
                .triggers
                .iter()
                .map(|t| t.reason().to_string())
                .collect();
            self.decision_log.record(
                step,
                DecisionType::Escalation,
                "system2",
                vec!["system1".into()],
                &reasons.join(","),
                0.9,
                "deliberate",
            );
        }
        self.decision_log.record(
            step,
            DecisionType::ModelSelection,
            &model_id,
            vec![
                self.provider.model_id(RoleHint::Worker),
                self.provider.model_id(RoleHint::Orchestrator),
            ],
            &format!("path {:?}", route.path),
            confidence,
            "success",
        );

        // ---- Stage 6: tool filter (must succeed) ----
        if cancel_requested(&options) {
            return Err(self.finish_cancelled(step));
        }
        let effective = self.effective_weights();
        let exposed: Vec<ToolDescriptor> = if route.path == ProcessingPath::System2 {
            self.tools
                .list()
                .into_iter()
                .filter(|d| available.contains(&d.name))
                .filter(|d| {
                    // Silenced tools are withheld from the model entirely.
                    effective
                        .get(&format!("tool_preference.{}", d.name))
                        .map(|v| *v > 0.0)
                        .unwrap_or(true)
                })
                .collect()
        } else {
            Vec::new()
        };
        self.decision_log.record(
            step,
            DecisionType::ToolSelection,
            &likely_tool,
            exposed.iter().map(|d| d.name.clone()).collect(),
            "thompson sample over non-quarantined candidates",
            confidence,
            "success",
        );

        // ---- Stages 7 + 8: LLM call and tool loop ----
        let (temperature, max_tokens) = {
            let (t, m) = resource_envelope(priority, route.path);
            (
                options.temperature_override.unwrap_or(t),
                options.max_tokens_override.unwrap_or(m),
            )
        };
        let task_state = self.task_state_block(&goal);
        let outcome = self
            .stage_generate_and_tools(
                &goal,
                &task_state,
                role,
                temperature,
                max_tokens,
                exposed,
                &options,
                step,
                now,
            )
            .await;
        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                // Cancellation inside a suspension point.
                return Err(e);
            }
        };

        // ---- Stage 9: response assembly (must succeed) ----
        let content = match (&outcome.response, &outcome.error) {
            (Some(r), None) if !r.content.is_empty() => r.content.clone(),
            (Some(_), None) => "(no content produced)".to_string(),
            (_, Some(kind)) => caller_safe_failure(kind),
            (None, None) => {
                return Err(SessionError::StageAbort {
                    stage: 9,
                    message: "no response and no recorded error".into(),
                }
                .into())
            }
        };
        let response_item =
            self.context
                .insert(ContextItemKind::Assistant, &content, step, None);
        if outcome.error.is_some() {
            self.context.mark_outcome(response_item, true, false);
            self.context.mark_outcome(user_item, true, false);
        }

        // ---- Stage 10: token accounting ----
        let mut usage = outcome.usage;
        if usage.total() == 0 {
            usage.input_tokens = crate::context::estimate_tokens(user_message) as u64;
            usage.output_tokens = crate::context::estimate_tokens(&content) as u64;
        }
        self.total_tokens += usage.total();
        self.decision_log.metric(Metric::Tokens {
            input: usage.input_tokens,
            output: usage.output_tokens,
        });

        // ---- Stage 11: quality estimation + surprise (best effort) ----
        let population = aggregate(&evaluate_response(&content));
        let quality = if outcome.error.is_some() {
            0.1
        } else {
            population.consensus
        };
        let outcome_class = match &outcome.error {
            Some(TurnErrorKind::ProviderTimeout { .. }) => OutcomeClass::Timeout,
            Some(_) => OutcomeClass::Failure,
            None if population.consensus < 0.3 => OutcomeClass::Partial,
            None => OutcomeClass::Success,
        };
        let surprise = self
            .ledger
            .compare(
                prediction_id,
                Outcome {
                    class: outcome_class,
                    latency_ms: outcome.latency_ms.max(1.0),
                    quality,
                },
            )
            .ok();
        let calibration_confidence =
            (1.0 - self.calibrator.ece(CalibrationDomain::ModelQuality)).clamp(0.0, 1.0);
        let composite = composite_confidence(
            predicted_quality,
            &population,
            calibration_confidence,
            surprise.map(|s| s.magnitude).unwrap_or(0.0),
            &CompositeWeights::default(),
        );
        self.last_agreement = population.agreement;

        // ---- Stage 12: plasticity (best effort) ----
        if let Some(s) = surprise {
            let signal = if s.direction >= 0.0 {
                s.learning_signal
            } else {
                -s.learning_signal
            };
            let mut active: Vec<ActiveKey> = outcome
                .executed_tools
                .iter()
                .map(|(tool, _)| ActiveKey {
                    category: WeightCategory::ToolPreference,
                    key: tool.clone(),
                })
                .collect();
            if let Some(column_name) = &column {
                active.push(ActiveKey {
                    category: WeightCategory::ModelSelection,
                    key: column_name.clone(),
                });
            }
            if let Err(e) = crate::weights::consolidate(
                &mut self.weights,
                &active,
                signal,
                &self.config.plasticity,
            ) {
                tracing::warn!(error = %e, "plasticity pass failed, continuing");
            }
            for alert in self
                .calibrator
                .meta_alerts(&self.weights.recent_applied_deltas(20))
            {
                tracing::info!(?alert, "meta-cognition alert");
            }
        }

        // ---- Stage 13: goal alignment (must succeed) ----
        if cancel_requested(&options) {
            return Err(self.finish_cancelled(step));
        }
        let (assessment, budget_decision, loop_hit) = {
            let engines = self
                .goal_engines
                .as_mut()
                .ok_or_else(|| SessionError::StageAbort {
                    stage: 13,
                    message: "goal engines missing".into(),
                })?;
            let budget_ratio = engines.budget.consumption_ratio();
            let assessment = engines.drift.assess(
                &goal.dna,
                &content,
                budget_ratio,
                quality,
                surprise.map(|s| s.magnitude).unwrap_or(0.0),
            );
            let progress = quality * assessment.signals.goal_similarity.max(0.2);
            let budget_decision = engines.budget.record_step(progress, usage.total());
            let loop_hit = engines.loops.observe(
                user_message,
                &content,
                outcome.error.as_ref().map(|e| match e {
                    TurnErrorKind::Provider { message } => message.as_str(),
                    TurnErrorKind::ProviderTimeout { .. } => "provider timeout",
                    TurnErrorKind::ContextOverflow => "context overflow",
                }),
            );
            (assessment, budget_decision, loop_hit)
        };
        self.decision_log.metric(Metric::Drift {
            score: assessment.score,
        });
        if assessment.action != DriftAction::Continue {
            self.decision_log.record(
                step,
                DecisionType::DriftResponse,
                &format!("{:?}", assessment.action),
                vec!["Continue".into()],
                &format!("drift score {:.2} ({:?})", assessment.score, assessment.severity),
                assessment.score,
                "recovered",
            );
            self.apply_drift_action(&goal, assessment.action, step);
        }
        if budget_decision != crate::goal::BudgetDecision::Proceed {
            self.decision_log.record(
                step,
                DecisionType::BudgetAdjustment,
                &format!("{budget_decision:?}"),
                vec!["Proceed".into()],
                "velocity against expectation",
                0.7,
                "on_budget",
            );
        }
        if let Some(hit) = &loop_hit {
            self.decision_log.record(
                step,
                DecisionType::LoopRecovery,
                &format!("{:?}", hit.action),
                vec!["Replan".into(), "Backtrack".into(), "Escalate".into()],
                &format!("loop kinds {:?}, confidence {:.2}", hit.kinds, hit.confidence),
                hit.confidence,
                "recovered",
            );
            if hit.action == LoopAction::Escalate {
                let _ = self.modulator.add(
                    ModulationKind::Amplify { factor: 1.2 },
                    "goal_alignment.focus",
                    crate::modulate::ModulationScope::Turns(3),
                    10,
                    "loop_recovery",
                );
            }
        }

        // ---- Stage 14: consolidation (best effort) ----
        self.stage_consolidate(
            &goal,
            &task_state,
            step,
            quality,
            predicted_quality,
            &assessment,
            column.as_deref(),
            &outcome.executed_tools,
            topic_tokens.first().map(String::as_str),
        );
        self.previous_error = outcome.error.is_some();
        self.last_response_chars = content.chars().count();

        tracing::info!(
            step,
            role = role.as_str(),
            quality,
            drift = assessment.score,
            tokens = usage.total(),
            "turn complete"
        );
        Ok(TurnResult {
            turn: step,
            content,
            role,
            model_id,
            path: route.path,
            usage,
            quality,
            surprise,
            drift: Some(assessment),
            recommended: composite.action,
            tool_rounds: outcome.tool_rounds,
            error: outcome.error,
        })
    }

    // -----------------------------------------------------------------
    // Stage helpers
    // -----------------------------------------------------------------

    fn stage_feedback(&mut self, user_message: &str, now: u64) -> CoreResult<()> {
        let ctx = FeedbackContext {
            previous_error: self.previous_error,
            previous_response_chars: self.last_response_chars,
        };
        let signals = self.detector.detect(user_message, &ctx);
        for signal in signals {
            let value_label = match signal.kind {
                FeedbackKind::PreferBrevity => "brief",
                FeedbackKind::PreferDetail => "detailed",
                FeedbackKind::PreferSpeed => "fast",
                FeedbackKind::Correction => "correction",
                FeedbackKind::Frustration => "frustration",
                FeedbackKind::Satisfaction => "satisfaction",
            };
            let weight = self
                .adaptation
                .filter(signal.kind.weight_key(), value_label, now);
            if weight <= 0.0 {
                continue;
            }
            let delta = signal.kind.direction() * signal.confidence * weight;
            self.weights.update(
                WeightCategory::Behavioral,
                signal.kind.weight_key(),
                delta,
                "implicit_feedback",
                signal.kind.as_str(),
            )?;
        }
        Ok(())
    }

    /// Stages 7 and 8: generation with retry plus up to `max_tool_rounds`
    /// sequential tool rounds. Provider failures are recorded, not thrown;
    /// only cancellation escapes as an error.
    #[allow(clippy::too_many_arguments)]
    async fn stage_generate_and_tools(
        &mut self,
        goal: &Goal,
        task_state: &str,
        role: RoleHint,
        temperature: f64,
        max_tokens: u64,
        exposed: Vec<ToolDescriptor>,
        options: &TurnOptions,
        step: u64,
        now: u64,
    ) -> CoreResult<StageOutcome> {
        let started = Instant::now();
        let mut usage = TokenUsage::default();
        let mut executed_tools: Vec<(String, bool)> = Vec::new();

        let packed = self.context.pack(&self.config.system_prompt, task_state);
        let mut messages = vec![
            ChatMessage::system(&self.config.system_prompt),
            ChatMessage::user(window_body(&packed)),
        ];
        let mut request = GenerationRequest {
            messages: messages.clone(),
            role_hint: role,
            temperature,
            max_tokens,
            tools: exposed.clone(),
        };

        let mut response = match generate_with_retry(&self.provider, request.clone(), &self.config.retry).await
        {
            Ok(r) => r,
            Err(ProviderError::ContextLength { .. }) => {
                // One immediate recompression pass, then a single retry.
                self.context.recompress_all(&goal.text);
                let repacked = self.context.pack(&self.config.system_prompt, task_state);
                messages[1] = ChatMessage::user(window_body(&repacked));
                request.messages = messages.clone();
                match generate_with_retry(&self.provider, request.clone(), &self.config.retry).await
                {
                    Ok(r) => r,
                    Err(_) => {
                        return Ok(StageOutcome {
                            response: None,
                            error: Some(TurnErrorKind::ContextOverflow),
                            usage,
                            tool_rounds: 0,
                            executed_tools,
                            latency_ms: started.elapsed().as_millis() as f64,
                        });
                    }
                }
            }
            Err(ProviderError::Timeout { timeout_ms }) => {
                return Ok(StageOutcome {
                    response: None,
                    error: Some(TurnErrorKind::ProviderTimeout { timeout_ms }),
                    usage,
                    tool_rounds: 0,
                    executed_tools,
                    latency_ms: started.elapsed().as_millis() as f64,
                });
            }
            Err(e) => {
                return Ok(StageOutcome {
                    response: None,
                    error: Some(TurnErrorKind::Provider {
                        message: e.to_string(),
                    }),
                    usage,
                    tool_rounds: 0,
                    executed_tools,
                    latency_ms: started.elapsed().as_millis() as f64,
                });
            }
        };
        usage.input_tokens += response.usage.input_tokens;
        usage.output_tokens += response.usage.output_tokens;

        // Stage 8: strictly sequential tool rounds.
        let mut rounds = 0u32;
        while !response.tool_calls.is_empty() && rounds < self.config.max_tool_rounds {
            if cancel_requested(options) {
                return Err(self.finish_cancelled(step));
            }
            rounds += 1;
            let calls = std::mem::take(&mut response.tool_calls);
            for call in calls {
                let tool_started = Instant::now();
                let result = self.tools.execute(&call.name, &call.args_json).await;
                let elapsed_ms = tool_started.elapsed().as_millis() as f64;
                let success = !result.is_err();

                self.weights
                    .record_tool_outcome(&call.name, success, elapsed_ms);
                self.reputation
                    .record(&call.name, if success { 1.0 } else { 0.0 }, now);
                let prior = self
                    .weights
                    .tool_stats(&call.name)
                    .map(|s| s.quality.mean())
                    .unwrap_or(0.6);
                let _ = self.calibrator.record(
                    CalibrationDomain::ToolSuccess,
                    prior.clamp(0.0, 1.0),
                    success,
                );
                self.decision_log.metric(Metric::Success {
                    name: call.name.clone(),
                    success,
                });
                self.decision_log.metric(Metric::LatencyMs {
                    name: call.name.clone(),
                    value: elapsed_ms,
                });

                if let Some(engines) = self.goal_engines.as_mut() {
                    engines.loops.observe(
                        &format!("{} {}", call.name, call.args_json),
                        &result.result,
                        result.error.as_deref(),
                    );
                }

                let call_item = self.context.insert(
                    ContextItemKind::ToolCall,
                    &format!("{}({})", call.name, call.args_json),
                    step,
                    Some(&call.name),
                );
                let body = result
                    .error
                    .clone()
                    .map(|e| format!("error: {e}"))
                    .unwrap_or_else(|| result.result.clone());
                let result_item = self.context.insert(
                    ContextItemKind::ToolResult,
                    &body,
                    step,
                    Some(&call.name),
                );
                self.context.mark_outcome(call_item, !success, success);
                self.context.mark_outcome(result_item, !success, success);

                executed_tools.push((call.name.clone(), success));
                messages.push(ChatMessage::assistant(format!(
                    "[tool call] {}({})",
                    call.name, call.args_json
                )));
                messages.push(ChatMessage::tool(body));
            }

            request.messages = messages.clone();
            response = match generate_with_retry(&self.provider, request.clone(), &self.config.retry)
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    let error = match e {
                        ProviderError::Timeout { timeout_ms } => {
                            TurnErrorKind::ProviderTimeout { timeout_ms }
                        }
                        other => TurnErrorKind::Provider {
                            message: other.to_string(),
                        },
                    };
                    return Ok(StageOutcome {
                        response: None,
                        error: Some(error),
                        usage,
                        tool_rounds: rounds,
                        executed_tools,
                        latency_ms: started.elapsed().as_millis() as f64,
                    });
                }
            };
            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;
        }

        Ok(StageOutcome {
            response: Some(response),
            error: None,
            usage,
            tool_rounds: rounds,
            executed_tools,
            latency_ms: started.elapsed().as_millis() as f64,
        })
    }

    /// The structured task-state block packed after the system prompt.
    fn task_state_block(&self, goal: &Goal) -> String {
        let (steps_used, step_limit, utilization) = self
            .goal_engines
            .as_ref()
            .map(|g| {
                (
                    g.budget.steps_used(),
                    g.budget.step_limit(),
                    g.budget.utilization(),
                )
            })
            .unwrap_or((0, 0, 0.0));
        format!(
            "[task] goal: {}\n[task] step {} of {} (utilization {:.0}%)\n[task] drift: {:.2}",
            goal.text,
            steps_used,
            step_limit,
            utilization * 100.0,
            self.goal_engines
                .as_ref()
                .map(|g| g.drift.last_score())
                .unwrap_or(0.0),
        )
    }

    /// Side effects of a drift recovery action.
    fn apply_drift_action(&mut self, goal: &Goal, action: DriftAction, step: u64) {
        match action {
            DriftAction::Continue => {}
            DriftAction::InjectReminder => {
                self.context.insert(
                    ContextItemKind::Decision,
                    &format!("Reminder: the active goal is \"{}\".", goal.text),
                    step,
                    None,
                );
            }
            DriftAction::SummarizeReplan => {
                self.context.recompress_all(&goal.text);
                self.context.insert(
                    ContextItemKind::Decision,
                    &format!("Replanning against goal \"{}\" after drift.", goal.text),
                    step,
                    None,
                );
            }
            DriftAction::CheckpointReset => {
                self.context.insert(
                    ContextItemKind::Decision,
                    &format!("Checkpoint: resetting focus to goal \"{}\".", goal.text),
                    step,
                    None,
                );
            }
            DriftAction::AskUser => {
                self.context.insert(
                    ContextItemKind::Decision,
                    &format!(
                        "Escalation: asking the user whether goal \"{}\" still stands.",
                        goal.text
                    ),
                    step,
                    None,
                );
            }
        }
    }

    /// Stage 14: write outcomes into memory, calibration, trajectory,
    /// associations, columns, and the periodic cycles.
    #[allow(clippy::too_many_arguments)]
    fn stage_consolidate(
        &mut self,
        goal: &Goal,
        task_state: &str,
        step: u64,
        quality: f64,
        predicted_quality: f64,
        assessment: &DriftAssessment,
        column: Option<&str>,
        executed_tools: &[(String, bool)],
        topic: Option<&str>,
    ) {
        self.context
            .advance(step, Some(&goal.dna), &goal.text, task_state);
        self.modulator.tick();

        let _ = self.calibrator.record(
            CalibrationDomain::ModelQuality,
            predicted_quality,
            quality > 0.5,
        );
        let _ = self.calibrator.record(
            CalibrationDomain::GoalProgress,
            (1.0 - assessment.score).clamp(0.0, 1.0),
            assessment.severity < crate::goal::DriftSeverity::Moderate,
        );

        if let Some(column_name) = column {
            self.columns.record_outcome(column_name, quality > 0.5);
        }
        for (tool, success) in executed_tools {
            if let Some(topic_token) = topic {
                self.associator
                    .associate("tool", tool, "topic", topic_token, 0.2);
            }
            if let Some(column_name) = column {
                self.associator
                    .associate("tool", tool, "column", column_name, if *success { 0.2 } else { -0.1 });
            }
        }

        // Cross-session learning: a decaying quality insight per user.
        let prior = self
            .services
            .insight(&self.config.user, "avg_quality")
            .unwrap_or(0.5);
        self.services.record_insight(
            &self.config.user,
            "avg_quality",
            prior + 0.1 * (quality - prior),
        );

        if step % self.config.calibration_cycle_turns == 0 {
            let report = self.calibrator.run_cycle();
            if !report.alarms.is_empty() {
                self.decision_log
                    .audit(step, "calibration_alarm", &format!("{:?}", report.alarms));
            }
        }
        if step % self.config.maintenance_turns == 0 {
            self.weights.decay_posteriors();
            let pruned = self.concepts.maintain(step, 100);
            let assoc_pruned = self.associator.maintain(step, 100);
            let (merged, dropped) = self.columns.reorganize();
            self.services.aggregate_weights(&self.weights.flat_values());
            tracing::debug!(
                step,
                pruned,
                assoc_pruned,
                merged,
                dropped,
                "maintenance pass complete"
            );
        }

        self.decision_log.audit(
            step,
            "turn_complete",
            &format!("quality {quality:.2}, drift {:.2}", assessment.score),
        );
    }

    /// Cancellation: jump to consolidation with a cancellation outcome and
    /// no partial writes.
    fn finish_cancelled(&mut self, step: u64) -> crate::error::CoreError {
        self.ledger.expire_open(step + 1);
        self.modulator.tick();
        self.decision_log
            .audit(step, "turn_cancelled", "cancellation requested by caller");
        tracing::info!(step, "turn cancelled");
        SessionError::Cancelled.into()
    }
}

/// Render the packed window minus its system-prompt segment.
fn window_body(packed: &crate::context::PackedContext) -> String {
    packed
        .segments
        .iter()
        .skip(1)
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Caller-safe description of a failed turn.
fn caller_safe_failure(kind: &TurnErrorKind) -> String {
    match kind {
        TurnErrorKind::Provider { .. } => {
            "I ran into a provider problem completing this turn. Please try again.".to_string()
        }
        TurnErrorKind::ProviderTimeout { .. } => {
            "The model did not respond in time for this turn. Please try again.".to_string()
        }
        TurnErrorKind::ContextOverflow => {
            "The conversation context exceeded the model window; it has been compressed. Please retry."
                .to_string()
        }
    }
}
