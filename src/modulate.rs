//! Modulation overlay: targeted runtime overrides on weight keys.
//!
//! A modulation applies one of Activate/Silence/Amplify/Dampen/Clamp to a
//! single key, with a temporal scope, a priority, and a source tag.
//! Enterprise policies pattern-match whole key families with globs and
//! generate derived modulations at priority ≥ 100. Clamp always wins;
//! otherwise highest priority, then recency. STRICT/LOCKED safety policies
//! block Silence and Dampen on safety-critical keys.

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ModulationError;
use crate::weights::WeightCategory;

/// Minimum priority of enterprise-policy derived modulations.
pub const ENTERPRISE_PRIORITY_FLOOR: i32 = 100;

/// Clamp range for a flat weight key, taken from its category prefix.
///
/// Behavioral and goal-alignment keys are signed; preference and model
/// scores live in [0, 1]. Keys with no recognizable category prefix fall
/// back to the widest range.
fn bounds_for_key(key: &str) -> (f64, f64) {
    key.split_once('.')
        .and_then(|(category, _)| WeightCategory::parse(category).ok())
        .map(WeightCategory::bounds)
        .unwrap_or((-1.0, 1.0))
}

// ---------------------------------------------------------------------------
// Kinds, conditions, scopes
// ---------------------------------------------------------------------------

/// The typed override applied to a weight key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModulationKind {
    /// Set the value to `strength` (clamped to the weight range).
    Activate { strength: f64 },
    /// Set the value to zero.
    Silence,
    /// Multiply by a factor ≥ 1.
    Amplify { factor: f64 },
    /// Multiply by a factor in [0, 1].
    Dampen { factor: f64 },
    /// Replace with `value`, overriding every other modulation.
    Clamp { value: f64 },
}

impl ModulationKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Activate { .. } => "activate",
            Self::Silence => "silence",
            Self::Amplify { .. } => "amplify",
            Self::Dampen { .. } => "dampen",
            Self::Clamp { .. } => "clamp",
        }
    }

    fn validate(&self) -> Result<(), ModulationError> {
        match *self {
            Self::Amplify { factor } if factor < 1.0 => {
                Err(ModulationError::BadAmplify { factor })
            }
            Self::Dampen { factor } if !(0.0..=1.0).contains(&factor) => {
                Err(ModulationError::BadDampen { factor })
            }
            _ => Ok(()),
        }
    }

    /// Apply this override to `current`, clamping into the target key's
    /// own category range (`lo`, `hi`).
    fn apply(&self, current: f64, lo: f64, hi: f64) -> f64 {
        match *self {
            Self::Activate { strength } => strength.clamp(lo, hi),
            Self::Silence => 0.0_f64.clamp(lo, hi),
            Self::Amplify { factor } => (current * factor).clamp(lo, hi),
            Self::Dampen { factor } => (current * factor).clamp(lo, hi),
            Self::Clamp { value } => value.clamp(lo, hi),
        }
    }
}

/// Comparison operators for conditional modulations and policy conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn eval(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Self::Ne => (lhs - rhs).abs() >= f64::EPSILON,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }

    /// Condition suffix used by enterprise policies (`__lt`, `__gte`, …).
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Le),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Ge),
            _ => None,
        }
    }
}

/// A `var op value` expression evaluated against turn context variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub var: String,
    pub op: CmpOp,
    pub value: f64,
}

impl Condition {
    /// Parse expressions like `drift > 0.4` or `safety_level >= 0.8`.
    pub fn parse(expr: &str) -> Result<Self, ModulationError> {
        let bad = || ModulationError::BadCondition { expr: expr.into() };
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(bad());
        }
        let op = match parts[1] {
            "==" => CmpOp::Eq,
            "!=" => CmpOp::Ne,
            "<" => CmpOp::Lt,
            "<=" => CmpOp::Le,
            ">" => CmpOp::Gt,
            ">=" => CmpOp::Ge,
            _ => return Err(bad()),
        };
        let value: f64 = parts[2].parse().map_err(|_| bad())?;
        Ok(Self {
            var: parts[0].to_string(),
            op,
            value,
        })
    }

    /// A qualified policy condition such as (`drift__gt`, 0.4). A bare
    /// variable name defaults to equality.
    pub fn from_qualified(qualified: &str, value: f64) -> Self {
        if let Some((var, suffix)) = qualified.rsplit_once("__") {
            if let Some(op) = CmpOp::from_suffix(suffix) {
                return Self {
                    var: var.to_string(),
                    op,
                    value,
                };
            }
        }
        Self {
            var: qualified.to_string(),
            op: CmpOp::Eq,
            value,
        }
    }

    /// Evaluate against context variables. Missing variables fail the check.
    pub fn holds(&self, context: &BTreeMap<String, f64>) -> bool {
        context
            .get(&self.var)
            .is_some_and(|&v| self.op.eval(v, self.value))
    }
}

/// Temporal scope of a modulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModulationScope {
    /// Active for N orchestrator ticks, decremented once per tick.
    Turns(u32),
    /// Removed when the goal id changes.
    Goal,
    /// Lives until the session closes.
    Session,
    Permanent,
    /// Active only while the condition holds against turn context.
    Conditional(Condition),
}

// ---------------------------------------------------------------------------
// Modulations and enterprise policies
// ---------------------------------------------------------------------------

/// A registered modulation on one weight key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modulation {
    pub id: u64,
    pub kind: ModulationKind,
    /// Flat weight key, e.g. `behavioral.verbosity`.
    pub target: String,
    pub priority: i32,
    pub source: String,
    /// Registration sequence number; later wins among equal priorities.
    pub seq: u64,
    pub scope: ModulationScope,
}

/// An enterprise policy: a glob over weight keys plus optional qualified
/// conditions, generating derived modulations at priority ≥ 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnterprisePolicy {
    pub name: String,
    /// Glob pattern with `*`, `?`, and `[…]` classes.
    pub pattern: String,
    pub kind: ModulationKind,
    pub priority: i32,
    /// Qualified conditions, e.g. (`drift__gt`, 0.4).
    pub conditions: Vec<Condition>,
}

/// Safety policy level gating destructive modulation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyLevel {
    Permissive,
    Strict,
    Locked,
}

impl SafetyLevel {
    fn blocks_suppression(self) -> bool {
        matches!(self, Self::Strict | Self::Locked)
    }
}

impl std::fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Permissive => "PERMISSIVE",
            Self::Strict => "STRICT",
            Self::Locked => "LOCKED",
        };
        f.write_str(s)
    }
}

/// Tunables for the modulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulatorConfig {
    pub safety_level: SafetyLevel,
    /// Keys on which Silence/Dampen are blocked under STRICT/LOCKED.
    pub safety_critical: BTreeSet<String>,
}

impl Default for ModulatorConfig {
    fn default() -> Self {
        Self {
            safety_level: SafetyLevel::Permissive,
            safety_critical: BTreeSet::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Modulator
// ---------------------------------------------------------------------------

/// The modulation overlay engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modulator {
    pub config: ModulatorConfig,
    modulations: Vec<Modulation>,
    policies: Vec<EnterprisePolicy>,
    next_id: u64,
    next_seq: u64,
}

impl Modulator {
    pub fn new(config: ModulatorConfig) -> Self {
        Self {
            config,
            modulations: Vec::new(),
            policies: Vec::new(),
            next_id: 1,
            next_seq: 0,
        }
    }

    /// Register a modulation; returns its id.
    pub fn add(
        &mut self,
        kind: ModulationKind,
        target: &str,
        scope: ModulationScope,
        priority: i32,
        source: &str,
    ) -> Result<u64, ModulationError> {
        kind.validate()?;
        if self.config.safety_level.blocks_suppression()
            && self.config.safety_critical.contains(target)
            && matches!(kind, ModulationKind::Silence | ModulationKind::Dampen { .. })
        {
            return Err(ModulationError::SafetyBlocked {
                level: self.config.safety_level.to_string(),
                kind: kind.name().to_string(),
                key: target.to_string(),
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.modulations.push(Modulation {
            id,
            kind,
            target: target.to_string(),
            priority,
            source: source.to_string(),
            seq,
            scope,
        });
        Ok(id)
    }

    /// Remove a modulation by id. Returns whether one was removed.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.modulations.len();
        self.modulations.retain(|m| m.id != id);
        before != self.modulations.len()
    }

    /// Register an enterprise policy. Its priority is floored at 100.
    pub fn add_policy(&mut self, mut policy: EnterprisePolicy) -> Result<(), ModulationError> {
        policy.kind.validate()?;
        policy.priority = policy.priority.max(ENTERPRISE_PRIORITY_FLOOR);
        self.policies.push(policy);
        Ok(())
    }

    /// Compose the overlay over a flat weight map.
    ///
    /// Resolution per key: any Clamp wins (latest among Clamps); otherwise
    /// highest priority; among equal priorities the most recent. Safety
    /// policy STRICT/LOCKED drops Silence/Dampen on safety-critical keys.
    pub fn apply(
        &self,
        weights: &BTreeMap<String, f64>,
        context: &BTreeMap<String, f64>,
    ) -> BTreeMap<String, f64> {
        let mut out = weights.clone();
        for (key, value) in &mut out {
            let (lo, hi) = bounds_for_key(key);
            let mut candidates: Vec<(&ModulationKind, i32, u64)> = Vec::new();

            for m in &self.modulations {
                if m.target != *key {
                    continue;
                }
                if let ModulationScope::Conditional(cond) = &m.scope {
                    if !cond.holds(context) {
                        continue;
                    }
                }
                candidates.push((&m.kind, m.priority, m.seq));
            }

            // Derived enterprise modulations. They are synthesized at apply
            // time, so their recency outranks session modulations of equal
            // priority.
            for (i, policy) in self.policies.iter().enumerate() {
                if !glob_match(&policy.pattern, key) {
                    continue;
                }
                if !policy.conditions.iter().all(|c| c.holds(context)) {
                    continue;
                }
                candidates.push((&policy.kind, policy.priority, self.next_seq + i as u64));
            }

            if self.config.safety_level.blocks_suppression()
                && self.config.safety_critical.contains(key)
            {
                candidates.retain(|(kind, _, _)| {
                    if matches!(**kind, ModulationKind::Silence | ModulationKind::Dampen { .. }) {
                        tracing::warn!(
                            key = %key,
                            kind = kind.name(),
                            "safety policy blocked suppressive modulation"
                        );
                        false
                    } else {
                        true
                    }
                });
            }

            let mut latest_clamp: Option<(&ModulationKind, u64)> = None;
            let mut best: Option<(&ModulationKind, i32, u64)> = None;
            for &(kind, prio, seq) in &candidates {
                if matches!(kind, ModulationKind::Clamp { .. })
                    && latest_clamp.is_none_or(|(_, s)| seq > s)
                {
                    latest_clamp = Some((kind, seq));
                }
                if best.is_none_or(|(_, p, s)| (prio, seq) > (p, s)) {
                    best = Some((kind, prio, seq));
                }
            }
            let chosen = latest_clamp
                .map(|(kind, _)| kind)
                .or(best.map(|(kind, _, _)| kind));
            if let Some(kind) = chosen {
                *value = kind.apply(*value, lo, hi);
            }
        }
        out
    }

    /// One orchestrator tick: decrement turn scopes and drop expired ones.
    pub fn tick(&mut self) {
        for m in &mut self.modulations {
            if let ModulationScope::Turns(n) = &mut m.scope {
                *n = n.saturating_sub(1);
            }
        }
        self.modulations
            .retain(|m| !matches!(m.scope, ModulationScope::Turns(0)));
    }

    /// The goal id changed: remove goal-scoped modulations.
    pub fn on_goal_change(&mut self) {
        self.modulations
            .retain(|m| !matches!(m.scope, ModulationScope::Goal));
    }

    /// Active modulations, for the decision log and snapshots.
    pub fn modulations(&self) -> &[Modulation] {
        &self.modulations
    }

    pub fn policies(&self) -> &[EnterprisePolicy] {
        &self.policies
    }
}

impl Default for Modulator {
    fn default() -> Self {
        Self::new(ModulatorConfig::default())
    }
}

/// Match a glob pattern (`*`, `?`, `[…]`) against a key.
fn glob_match(pattern: &str, key: &str) -> bool {
    match glob_to_regex(pattern) {
        Some(re) => re.is_match(key),
        None => pattern == key,
    }
}

/// Translate a glob into an anchored regex. `[!…]` negates a class.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                re.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    re.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    re.push(inner);
                }
                re.push(']');
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn clamp_dominates_everything() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Amplify { factor: 2.0 },
                "behavioral.detail",
                ModulationScope::Session,
                500,
                "test",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Silence,
                "behavioral.detail",
                ModulationScope::Session,
                999,
                "test",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Clamp { value: 0.42 },
                "behavioral.detail",
                ModulationScope::Session,
                1,
                "test",
            )
            .unwrap();
        let out = modulator.apply(&weights(&[("behavioral.detail", 0.9)]), &BTreeMap::new());
        assert!((out["behavioral.detail"] - 0.42).abs() < 1e-12);
    }

    #[test]
    fn latest_clamp_wins_among_clamps() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Clamp { value: 0.1 },
                "k",
                ModulationScope::Session,
                50,
                "a",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Clamp { value: 0.7 },
                "k",
                ModulationScope::Session,
                5,
                "b",
            )
            .unwrap();
        let out = modulator.apply(&weights(&[("k", 0.0)]), &BTreeMap::new());
        assert!((out["k"] - 0.7).abs() < 1e-12);
    }

    #[test]
    fn priority_then_recency() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Activate { strength: 0.2 },
                "k",
                ModulationScope::Session,
                10,
                "low",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Activate { strength: 0.8 },
                "k",
                ModulationScope::Session,
                20,
                "high",
            )
            .unwrap();
        let out = modulator.apply(&weights(&[("k", 0.0)]), &BTreeMap::new());
        assert!((out["k"] - 0.8).abs() < 1e-12);

        // Equal priority: the most recent wins.
        modulator
            .add(
                ModulationKind::Activate { strength: 0.5 },
                "k",
                ModulationScope::Session,
                20,
                "newer",
            )
            .unwrap();
        let out = modulator.apply(&weights(&[("k", 0.0)]), &BTreeMap::new());
        assert!((out["k"] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn turn_scope_expires_on_tick() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Silence,
                "k",
                ModulationScope::Turns(2),
                0,
                "test",
            )
            .unwrap();
        let w = weights(&[("k", 0.9)]);
        assert_eq!(modulator.apply(&w, &BTreeMap::new())["k"], 0.0);
        modulator.tick();
        assert_eq!(modulator.apply(&w, &BTreeMap::new())["k"], 0.0);
        modulator.tick();
        assert_eq!(modulator.apply(&w, &BTreeMap::new())["k"], 0.9);
    }

    #[test]
    fn goal_scope_clears_on_goal_change() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Dampen { factor: 0.5 },
                "k",
                ModulationScope::Goal,
                0,
                "test",
            )
            .unwrap();
        let w = weights(&[("k", 0.8)]);
        assert!((modulator.apply(&w, &BTreeMap::new())["k"] - 0.4).abs() < 1e-12);
        modulator.on_goal_change();
        assert!((modulator.apply(&w, &BTreeMap::new())["k"] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn conditional_scope_tracks_context() {
        let mut modulator = Modulator::default();
        let cond = Condition::parse("drift > 0.4").unwrap();
        modulator
            .add(
                ModulationKind::Amplify { factor: 1.5 },
                "goal_alignment.focus",
                ModulationScope::Conditional(cond),
                0,
                "drift-response",
            )
            .unwrap();
        let w = weights(&[("goal_alignment.focus", 0.4)]);

        let mut ctx = BTreeMap::new();
        ctx.insert("drift".to_string(), 0.2);
        assert!((modulator.apply(&w, &ctx)["goal_alignment.focus"] - 0.4).abs() < 1e-12);

        ctx.insert("drift".to_string(), 0.6);
        assert!((modulator.apply(&w, &ctx)["goal_alignment.focus"] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn enterprise_policy_globs_and_outranks() {
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Activate { strength: 0.9 },
                "tool_preference.shell_exec",
                ModulationScope::Session,
                99,
                "user",
            )
            .unwrap();
        modulator
            .add_policy(EnterprisePolicy {
                name: "lock-shell-tools".into(),
                pattern: "tool_preference.shell_*".into(),
                kind: ModulationKind::Activate { strength: 0.1 },
                priority: 0, // floored to 100
                conditions: vec![Condition::from_qualified("safety__gte", 0.8)],
            })
            .unwrap();

        let w = weights(&[("tool_preference.shell_exec", 0.5)]);
        let mut ctx = BTreeMap::new();
        ctx.insert("safety".to_string(), 0.9);
        let out = modulator.apply(&w, &ctx);
        assert!((out["tool_preference.shell_exec"] - 0.1).abs() < 1e-12);

        // Condition not met: the user modulation applies instead.
        ctx.insert("safety".to_string(), 0.5);
        let out = modulator.apply(&w, &ctx);
        assert!((out["tool_preference.shell_exec"] - 0.9).abs() < 1e-12);
    }

    #[test]
    fn strict_safety_blocks_suppression() {
        let mut critical = BTreeSet::new();
        critical.insert("enterprise.audit_gate".to_string());
        let mut modulator = Modulator::new(ModulatorConfig {
            safety_level: SafetyLevel::Strict,
            safety_critical: critical,
        });
        let err = modulator
            .add(
                ModulationKind::Silence,
                "enterprise.audit_gate",
                ModulationScope::Session,
                0,
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, ModulationError::SafetyBlocked { .. }));

        // Amplify on the same key is allowed.
        modulator
            .add(
                ModulationKind::Amplify { factor: 1.2 },
                "enterprise.audit_gate",
                ModulationScope::Session,
                0,
                "test",
            )
            .unwrap();
    }

    #[test]
    fn factor_validation() {
        let mut modulator = Modulator::default();
        assert!(modulator
            .add(
                ModulationKind::Amplify { factor: 0.5 },
                "k",
                ModulationScope::Session,
                0,
                "t",
            )
            .is_err());
        assert!(modulator
            .add(
                ModulationKind::Dampen { factor: 1.5 },
                "k",
                ModulationScope::Session,
                0,
                "t",
            )
            .is_err());
    }

    #[test]
    fn modulations_respect_category_bounds() {
        // Unit-interval categories never go negative, whatever the
        // modulation asks for; signed categories keep their full range.
        let mut modulator = Modulator::default();
        modulator
            .add(
                ModulationKind::Activate { strength: -0.3 },
                "tool_preference.shell_exec",
                ModulationScope::Session,
                0,
                "test",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Clamp { value: -0.5 },
                "model_selection.coding",
                ModulationScope::Session,
                0,
                "test",
            )
            .unwrap();
        modulator
            .add(
                ModulationKind::Activate { strength: -0.3 },
                "behavioral.caution",
                ModulationScope::Session,
                0,
                "test",
            )
            .unwrap();

        let out = modulator.apply(
            &weights(&[
                ("tool_preference.shell_exec", 0.5),
                ("model_selection.coding", 0.8),
                ("behavioral.caution", 0.0),
            ]),
            &BTreeMap::new(),
        );
        assert_eq!(out["tool_preference.shell_exec"], 0.0);
        assert_eq!(out["model_selection.coding"], 0.0);
        assert!((out["behavioral.caution"] - -0.3).abs() < 1e-12);
    }

    #[test]
    fn glob_classes() {
        assert!(glob_match("tool_preference.*", "tool_preference.search"));
        assert!(glob_match("behavioral.?", "behavioral.x"));
        assert!(glob_match("model_selection.[gw]pt", "model_selection.gpt"));
        assert!(!glob_match("model_selection.[gw]pt", "model_selection.apt"));
        assert!(!glob_match("tool_preference.*", "behavioral.search"));
    }
}
