//! Observability: decision records, metrics, and the append-only audit
//! stream.
//!
//! Every branch point emits a decision record with the chosen value, the
//! alternatives considered, a reasoning string, and a confidence; outcomes
//! are filled in later. External collaborators subscribe through the
//! `Observer` trait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Branch points that emit decision records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DecisionType {
    ModelSelection,
    ToolSelection,
    DriftResponse,
    Escalation,
    BudgetAdjustment,
    LoopRecovery,
    PatternSelection,
}

/// A recorded decision, outcome filled in later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: u64,
    pub step: u64,
    pub decision_type: DecisionType,
    pub chosen: String,
    pub alternatives: Vec<String>,
    pub reasoning: String,
    pub confidence: f64,
    pub predicted_outcome: String,
    /// (rating in [0,1], detail), set via `update_outcome`.
    pub outcome: Option<(f64, String)>,
}

/// A point metric emitted during the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Metric {
    LatencyMs { name: String, value: f64 },
    Tokens { input: u64, output: u64 },
    Success { name: String, success: bool },
    Drift { score: f64 },
    Cost { tokens: u64 },
}

/// One append-only audit entry, chained by the external audit layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub step: u64,
    pub event: String,
    pub detail: String,
}

/// Collaborator-facing observer contract. All methods default to no-ops.
pub trait Observer: Send + Sync {
    fn on_decision(&self, _record: &DecisionRecord) {}
    fn on_metric(&self, _metric: &Metric) {}
    fn on_audit(&self, _record: &AuditRecord) {}
}

/// The in-session decision log plus observer fan-out.
#[derive(Clone, Serialize, Deserialize)]
pub struct DecisionLog {
    records: Vec<DecisionRecord>,
    audit: Vec<AuditRecord>,
    next_id: u64,
    next_audit_seq: u64,
    capacity: usize,
    #[serde(skip)]
    observers: Vec<Arc<dyn Observer>>,
}

impl std::fmt::Debug for DecisionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionLog")
            .field("records", &self.records.len())
            .field("audit", &self.audit.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl DecisionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            audit: Vec::new(),
            next_id: 1,
            next_audit_seq: 0,
            capacity,
            observers: Vec::new(),
        }
    }

    /// Attach an observer. Observers are not part of snapshots.
    pub fn subscribe(&mut self, observer: Arc<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Record a decision at a branch point; returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &mut self,
        step: u64,
        decision_type: DecisionType,
        chosen: &str,
        alternatives: Vec<String>,
        reasoning: &str,
        confidence: f64,
        predicted_outcome: &str,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let record = DecisionRecord {
            id,
            step,
            decision_type,
            chosen: chosen.to_string(),
            alternatives,
            reasoning: reasoning.to_string(),
            confidence,
            predicted_outcome: predicted_outcome.to_string(),
            outcome: None,
        };
        for observer in &self.observers {
            observer.on_decision(&record);
        }
        self.records.push(record);
        if self.records.len() > self.capacity {
            self.records.remove(0);
        }
        id
    }

    /// Fill in the outcome of an earlier decision.
    pub fn update_outcome(&mut self, id: u64, rating: f64, detail: &str) -> bool {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.outcome = Some((rating.clamp(0.0, 1.0), detail.to_string()));
            true
        } else {
            false
        }
    }

    /// Emit a metric to every observer.
    pub fn metric(&self, metric: Metric) {
        for observer in &self.observers {
            observer.on_metric(&metric);
        }
    }

    /// Append an audit entry and notify observers.
    pub fn audit(&mut self, step: u64, event: &str, detail: &str) {
        let record = AuditRecord {
            seq: self.next_audit_seq,
            step,
            event: event.to_string(),
            detail: detail.to_string(),
        };
        self.next_audit_seq += 1;
        for observer in &self.observers {
            observer.on_audit(&record);
        }
        self.audit.push(record);
    }

    pub fn records(&self) -> &[DecisionRecord] {
        &self.records
    }

    pub fn audit_records(&self) -> &[AuditRecord] {
        &self.audit
    }

    /// Decisions of one type, oldest first.
    pub fn by_type(&self, decision_type: DecisionType) -> Vec<&DecisionRecord> {
        self.records
            .iter()
            .filter(|r| r.decision_type == decision_type)
            .collect()
    }
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        decisions: AtomicUsize,
        metrics: AtomicUsize,
        audits: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn on_decision(&self, _record: &DecisionRecord) {
            self.decisions.fetch_add(1, Ordering::SeqCst);
        }
        fn on_metric(&self, _metric: &Metric) {
            self.metrics.fetch_add(1, Ordering::SeqCst);
        }
        fn on_audit(&self, _record: &AuditRecord) {
            self.audits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn record_then_update_outcome() {
        let mut log = DecisionLog::default();
        let id = log.record(
            1,
            DecisionType::ToolSelection,
            "search",
            vec!["search".into(), "kb_lookup".into()],
            "highest thompson sample",
            0.8,
            "success",
        );
        assert!(log.update_outcome(id, 0.9, "tool succeeded"));
        let record = &log.records()[0];
        assert_eq!(record.outcome.as_ref().unwrap().1, "tool succeeded");
        assert!(!log.update_outcome(999, 0.1, "missing"));
    }

    #[test]
    fn observers_receive_all_streams() {
        let observer = Arc::new(CountingObserver::default());
        let mut log = DecisionLog::default();
        log.subscribe(observer.clone());
        log.record(1, DecisionType::Escalation, "system2", vec![], "error", 1.0, "ok");
        log.metric(Metric::Drift { score: 0.2 });
        log.audit(1, "turn_complete", "turn 1 finished");
        assert_eq!(observer.decisions.load(Ordering::SeqCst), 1);
        assert_eq!(observer.metrics.load(Ordering::SeqCst), 1);
        assert_eq!(observer.audits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn audit_sequence_is_monotone() {
        let mut log = DecisionLog::default();
        log.audit(1, "a", "");
        log.audit(1, "b", "");
        log.audit(2, "c", "");
        let seqs: Vec<u64> = log.audit_records().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn bounded_capacity_drops_oldest() {
        let mut log = DecisionLog::new(2);
        for i in 0..5 {
            log.record(i, DecisionType::ModelSelection, "m", vec![], "r", 0.5, "ok");
        }
        assert_eq!(log.records().len(), 2);
        assert_eq!(log.records()[0].step, 3);
    }
}
