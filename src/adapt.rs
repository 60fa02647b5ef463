//! Implicit feedback detection and habituation filtering.
//!
//! Incoming user messages are scanned with pattern rules for implicit
//! signals (correction, frustration, satisfaction, verbosity/detail/speed
//! preferences). Each detected signal then passes two adaptation filters in
//! parallel: a rapid filter with a novelty bonus and geometric decay, and a
//! sustained filter with linear habituation and timed recovery. The more
//! conservative (minimum) weight wins.

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Kinds of implicit feedback the detector recognizes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum FeedbackKind {
    Correction,
    Frustration,
    Satisfaction,
    PreferBrevity,
    PreferDetail,
    PreferSpeed,
}

impl FeedbackKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Correction => "correction",
            Self::Frustration => "frustration",
            Self::Satisfaction => "satisfaction",
            Self::PreferBrevity => "prefer_brevity",
            Self::PreferDetail => "prefer_detail",
            Self::PreferSpeed => "prefer_speed",
        }
    }

    /// The behavioral weight key this signal nudges.
    pub fn weight_key(self) -> &'static str {
        match self {
            Self::Correction => "accuracy",
            Self::Frustration => "patience",
            Self::Satisfaction => "approach",
            Self::PreferBrevity | Self::PreferDetail => "verbosity",
            Self::PreferSpeed => "speed",
        }
    }

    /// Direction of the nudge on the weight key.
    pub fn direction(self) -> f64 {
        match self {
            Self::Correction | Self::Frustration | Self::PreferBrevity => -1.0,
            Self::Satisfaction | Self::PreferDetail | Self::PreferSpeed => 1.0,
        }
    }
}

/// A detected implicit signal, before adaptation filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplicitFeedback {
    pub kind: FeedbackKind,
    /// Pattern confidence after context weighting, in [0, 1].
    pub confidence: f64,
    /// The text fragment that matched.
    pub matched: String,
}

/// Turn context that weights pattern confidences.
#[derive(Debug, Clone, Copy, Default)]
pub struct FeedbackContext {
    /// The previous step errored.
    pub previous_error: bool,
    /// Length of the previous assistant response, in characters.
    pub previous_response_chars: usize,
}

/// Tunables for detection and habituation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    /// Minimum post-weighting confidence to accept a signal.
    pub confidence_threshold: f64,
    /// Novelty bonus multiplier on first sight of a signal.
    pub novelty_bonus: f64,
    /// Geometric decay per repeat of the same value in the rapid filter.
    pub rapid_decay: f64,
    /// Identical repetitions over which the sustained filter decays linearly.
    pub sustained_span: u32,
    /// Floor the sustained filter decays to before full habituation.
    pub sustained_floor: f64,
    /// Seconds of silence after which a habituated signal recovers.
    pub recovery_secs: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            novelty_bonus: 2.0,
            rapid_decay: 0.5,
            sustained_span: 8,
            sustained_floor: 0.2,
            recovery_secs: 300,
        }
    }
}

/// Pattern-rule detector for implicit feedback.
///
/// Patterns are compiled once at construction; the detector carries no
/// session state and is rebuilt on restore.
#[derive(Debug)]
pub struct FeedbackDetector {
    rules: Vec<(FeedbackKind, Regex, f64)>,
    config: AdaptationConfig,
}

impl FeedbackDetector {
    pub fn new(config: AdaptationConfig) -> Self {
        let table: &[(FeedbackKind, &str, f64)] = &[
            (
                FeedbackKind::Correction,
                r"(?i)\b(no[,.]? that(?:'s| is) (?:wrong|incorrect|not right)|actually,|that(?:'s| is) (?:wrong|incorrect|not what)|i meant\b|not what i (?:asked|meant|wanted))",
                0.8,
            ),
            (
                FeedbackKind::Frustration,
                r"(?i)(again\?|still (?:wrong|broken|failing)|why (?:won't|can't) (?:you|this)|\bugh\b|come on|this is (?:frustrating|ridiculous))",
                0.75,
            ),
            (
                FeedbackKind::Satisfaction,
                r"(?i)\b(thanks|thank you|perfect|great (?:work|job)|exactly right|that works|well done|awesome)\b",
                0.75,
            ),
            (
                FeedbackKind::PreferBrevity,
                r"(?i)\b(in one sentence|briefly|keep it (?:short|brief)|too (?:long|verbose|wordy)|tl;?dr|be concise|just the summary)\b",
                0.8,
            ),
            (
                FeedbackKind::PreferDetail,
                r"(?i)\b(more detail|elaborate|explain (?:more|further|in depth)|too (?:short|terse)|can you expand|walk me through)\b",
                0.8,
            ),
            (
                FeedbackKind::PreferSpeed,
                r"(?i)\b(quickly|asap|as fast as possible|hurry|right away)\b",
                0.72,
            ),
        ];
        let rules = table
            .iter()
            .filter_map(|(kind, pattern, conf)| {
                Regex::new(pattern).ok().map(|re| (*kind, re, *conf))
            })
            .collect();
        Self { rules, config }
    }

    /// Detect implicit signals in a message, applying context-aware
    /// confidence weighting and the acceptance threshold.
    pub fn detect(&self, message: &str, context: &FeedbackContext) -> Vec<ImplicitFeedback> {
        let mut out = Vec::new();
        for (kind, re, base) in &self.rules {
            let Some(m) = re.find(message) else { continue };
            let mut confidence = *base;
            match kind {
                FeedbackKind::Correction | FeedbackKind::Frustration
                    if context.previous_error =>
                {
                    confidence += 0.15;
                }
                FeedbackKind::PreferBrevity if context.previous_response_chars > 2000 => {
                    confidence += 0.1;
                }
                FeedbackKind::PreferDetail
                    if context.previous_response_chars > 0
                        && context.previous_response_chars < 200 =>
                {
                    confidence += 0.1;
                }
                _ => {}
            }
            let confidence = confidence.min(1.0);
            if confidence >= self.config.confidence_threshold {
                out.push(ImplicitFeedback {
                    kind: *kind,
                    confidence,
                    matched: m.as_str().to_string(),
                });
            }
        }
        out
    }
}

impl Default for FeedbackDetector {
    fn default() -> Self {
        Self::new(AdaptationConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Adaptation filters
// ---------------------------------------------------------------------------

/// Rapid-filter state for one signal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RapidState {
    value: String,
    repeats: u32,
}

/// Sustained-filter state for one signal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SustainedState {
    value: String,
    repeats: u32,
    last_seen_secs: u64,
}

/// The paired rapid/sustained habituation filter.
///
/// `filter` returns the effective weight for a (signal, value) observation:
/// the minimum of the rapid weight (novelty bonus, geometric decay per
/// identical repeat) and the sustained weight (linear decay to the floor
/// over the span, then full habituation until value change or recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationFilter {
    pub config: AdaptationConfig,
    rapid: BTreeMap<String, RapidState>,
    sustained: BTreeMap<String, SustainedState>,
}

impl AdaptationFilter {
    pub fn new(config: AdaptationConfig) -> Self {
        Self {
            config,
            rapid: BTreeMap::new(),
            sustained: BTreeMap::new(),
        }
    }

    /// Weight one observation of `value` on signal `name` at `now_secs`.
    pub fn filter(&mut self, name: &str, value: &str, now_secs: u64) -> f64 {
        let rapid = self.rapid_weight(name, value);
        let sustained = self.sustained_weight(name, value, now_secs);
        rapid.min(sustained)
    }

    fn rapid_weight(&mut self, name: &str, value: &str) -> f64 {
        let cfg_bonus = self.config.novelty_bonus;
        let cfg_decay = self.config.rapid_decay;
        match self.rapid.get_mut(name) {
            None => {
                self.rapid.insert(
                    name.to_string(),
                    RapidState {
                        value: value.to_string(),
                        repeats: 0,
                    },
                );
                cfg_bonus
            }
            Some(state) if state.value != value => {
                state.value = value.to_string();
                state.repeats = 0;
                cfg_bonus
            }
            Some(state) => {
                state.repeats += 1;
                cfg_bonus * cfg_decay.powi(state.repeats as i32)
            }
        }
    }

    fn sustained_weight(&mut self, name: &str, value: &str, now_secs: u64) -> f64 {
        let span = self.config.sustained_span;
        let floor = self.config.sustained_floor;
        let recovery = self.config.recovery_secs;
        let state = self
            .sustained
            .entry(name.to_string())
            .or_insert_with(|| SustainedState {
                value: value.to_string(),
                repeats: 0,
                last_seen_secs: now_secs,
            });

        let recovered = now_secs.saturating_sub(state.last_seen_secs) >= recovery;
        if state.value != value || recovered {
            state.value = value.to_string();
            state.repeats = 0;
        }
        state.last_seen_secs = now_secs;

        let weight = if state.repeats >= span {
            // Fully habituated: no signal until value change or recovery.
            0.0
        } else {
            let progress = f64::from(state.repeats) / f64::from(span);
            (1.0 - progress * (1.0 - floor)).max(floor)
        };
        state.repeats += 1;
        weight
    }
}

impl Default for AdaptationFilter {
    fn default() -> Self {
        Self::new(AdaptationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_brevity_preference() {
        let detector = FeedbackDetector::default();
        let signals = detector.detect(
            "What is the weather in Berlin in one sentence?",
            &FeedbackContext::default(),
        );
        assert!(signals.iter().any(|s| s.kind == FeedbackKind::PreferBrevity));
    }

    #[test]
    fn correction_boosted_after_error() {
        let detector = FeedbackDetector::default();
        let msg = "No, that's wrong. The endpoint returns 403.";
        let plain = detector.detect(msg, &FeedbackContext::default());
        let boosted = detector.detect(
            msg,
            &FeedbackContext {
                previous_error: true,
                previous_response_chars: 0,
            },
        );
        let base = plain
            .iter()
            .find(|s| s.kind == FeedbackKind::Correction)
            .unwrap()
            .confidence;
        let hot = boosted
            .iter()
            .find(|s| s.kind == FeedbackKind::Correction)
            .unwrap()
            .confidence;
        assert!(hot > base);
    }

    #[test]
    fn below_threshold_signals_dropped() {
        let detector = FeedbackDetector::default();
        let signals = detector.detect("please fix the login page", &FeedbackContext::default());
        assert!(signals.is_empty());
    }

    #[test]
    fn rapid_filter_decays_geometrically() {
        let mut filter = AdaptationFilter::default();
        // First sight carries the novelty bonus, capped by sustained 1.0.
        assert!((filter.filter("verbosity", "brief", 0) - 1.0).abs() < 1e-9);
        let w1 = filter.filter("verbosity", "brief", 1);
        let w2 = filter.filter("verbosity", "brief", 2);
        let w3 = filter.filter("verbosity", "brief", 3);
        assert!(w1 > w2 && w2 > w3);
        // Third repeat: rapid = 2.0 · 0.5³ = 0.25 dominates the minimum.
        assert!((w3 - 0.25).abs() < 1e-9);
    }

    #[test]
    fn value_change_resets_rapid_filter() {
        let mut filter = AdaptationFilter::default();
        for i in 0..4 {
            filter.filter("verbosity", "brief", i);
        }
        let w = filter.filter("verbosity", "detailed", 5);
        // Fresh value: rapid resets to the bonus; sustained resets to 1.0.
        assert!((w - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sustained_filter_habituates_fully() {
        let mut filter = AdaptationFilter::default();
        let mut last = 1.0;
        for i in 0..9 {
            last = filter.filter("speed", "fast", i);
        }
        // Ninth identical observation: fully habituated.
        assert_eq!(last, 0.0);
    }

    #[test]
    fn habituation_recovers_after_silence() {
        let mut filter = AdaptationFilter::default();
        for i in 0..9 {
            filter.filter("speed", "fast", i);
        }
        assert_eq!(filter.filter("speed", "fast", 10), 0.0);
        // 300 s of silence resets the sustained span (rapid still decayed).
        let w = filter.filter("speed", "fast", 10 + 300);
        assert!(w > 0.0);
    }
}
