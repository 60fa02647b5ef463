//! Concept graph and cross-modal associator.
//!
//! Both are cyclic directed graphs held in stable arenas (petgraph
//! `StableDiGraph`): node and edge removals never invalidate other
//! handles, and nodes never own each other. Edges carry associative,
//! inhibitory, or hierarchical semantics; activation spreads a bounded
//! number of hops from seed concepts; a degree cap evicts the weakest
//! edge; pruning a node drops every edge referencing its handle.

use std::collections::BTreeMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

/// Edge semantics in the concept graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    Associative,
    /// Suppresses the target during spreading activation.
    Inhibitory,
    Hierarchical,
}

/// A concept node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptNode {
    pub label: String,
    pub activation: f64,
    pub last_activated_step: u64,
}

/// A weighted, typed edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConceptEdge {
    pub kind: EdgeKind,
    pub weight: f64,
}

/// Tunables for the concept graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConceptConfig {
    /// Maximum outgoing degree before the weakest edge is evicted.
    pub degree_cap: usize,
    /// Hops of spreading activation.
    pub spread_hops: usize,
    /// Activation decay per hop.
    pub hop_decay: f64,
    /// Activation decay applied at maintenance.
    pub maintenance_decay: f64,
    /// Activation floor below which a stale node is prunable.
    pub prune_activation: f64,
}

impl Default for ConceptConfig {
    fn default() -> Self {
        Self {
            degree_cap: 16,
            spread_hops: 2,
            hop_decay: 0.5,
            maintenance_decay: 0.9,
            prune_activation: 0.05,
        }
    }
}

/// The concept graph with spreading activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptGraph {
    pub config: ConceptConfig,
    graph: StableDiGraph<ConceptNode, ConceptEdge>,
    index: BTreeMap<String, NodeIndex>,
}

impl ConceptGraph {
    pub fn new(config: ConceptConfig) -> Self {
        Self {
            config,
            graph: StableDiGraph::new(),
            index: BTreeMap::new(),
        }
    }

    /// Look up or create a node for a label.
    pub fn ensure_node(&mut self, label: &str) -> NodeIndex {
        if let Some(&idx) = self.index.get(label) {
            return idx;
        }
        let idx = self.graph.add_node(ConceptNode {
            label: label.to_string(),
            activation: 0.0,
            last_activated_step: 0,
        });
        self.index.insert(label.to_string(), idx);
        idx
    }

    /// Add or strengthen an edge. When the source's outgoing degree exceeds
    /// the cap, the weakest outgoing edge is evicted.
    pub fn associate(&mut self, from: &str, to: &str, kind: EdgeKind, weight: f64) {
        let a = self.ensure_node(from);
        let b = self.ensure_node(to);
        if let Some(existing) = self.graph.find_edge(a, b) {
            if let Some(edge) = self.graph.edge_weight_mut(existing) {
                edge.weight = (edge.weight + weight).clamp(-1.0, 1.0);
                edge.kind = kind;
            }
            return;
        }
        self.graph.add_edge(
            a,
            b,
            ConceptEdge {
                kind,
                weight: weight.clamp(-1.0, 1.0),
            },
        );

        let degree = self.graph.edges_directed(a, Direction::Outgoing).count();
        if degree > self.config.degree_cap {
            let weakest = self
                .graph
                .edges_directed(a, Direction::Outgoing)
                .min_by(|x, y| {
                    x.weight()
                        .weight
                        .abs()
                        .partial_cmp(&y.weight().weight.abs())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|e| e.id());
            if let Some(edge_id) = weakest {
                self.graph.remove_edge(edge_id);
            }
        }
    }

    /// Spread activation from seed labels and return activated concepts,
    /// strongest first. Inhibitory edges subtract.
    pub fn activate(&mut self, seeds: &[&str], step: u64) -> Vec<(String, f64)> {
        let mut frontier: Vec<(NodeIndex, f64)> = Vec::new();
        for seed in seeds {
            let idx = self.ensure_node(seed);
            frontier.push((idx, 1.0));
        }

        let mut activation: BTreeMap<NodeIndex, f64> = BTreeMap::new();
        for &(idx, energy) in &frontier {
            *activation.entry(idx).or_default() += energy;
        }
        for _ in 0..self.config.spread_hops {
            let mut next: Vec<(NodeIndex, f64)> = Vec::new();
            for (idx, energy) in frontier {
                let mut targets = Vec::new();
                for edge in self.graph.edges_directed(idx, Direction::Outgoing) {
                    let sign = match edge.weight().kind {
                        EdgeKind::Inhibitory => -1.0,
                        _ => 1.0,
                    };
                    let spread = energy * edge.weight().weight.abs() * self.config.hop_decay * sign;
                    targets.push((edge.target(), spread));
                }
                for (target, spread) in targets {
                    *activation.entry(target).or_default() += spread;
                    if spread > 0.0 {
                        next.push((target, spread));
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        let mut out: Vec<(String, f64)> = Vec::new();
        for (idx, energy) in &activation {
            if let Some(node) = self.graph.node_weight_mut(*idx) {
                node.activation = (node.activation + energy).clamp(0.0, 1.0);
                node.last_activated_step = step;
                if *energy > 0.0 {
                    out.push((node.label.clone(), *energy));
                }
            }
        }
        out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        out
    }

    /// Maintenance: decay all activations and prune stale quiet nodes.
    /// Removing a node drops every edge referencing its handle.
    pub fn maintain(&mut self, current_step: u64, stale_after: u64) -> usize {
        let decay = self.config.maintenance_decay;
        let floor = self.config.prune_activation;
        let mut stale: Vec<NodeIndex> = Vec::new();
        for idx in self.graph.node_indices().collect::<Vec<_>>() {
            if let Some(node) = self.graph.node_weight_mut(idx) {
                node.activation *= decay;
                if node.activation < floor
                    && current_step.saturating_sub(node.last_activated_step) > stale_after
                {
                    stale.push(idx);
                }
            }
        }
        for idx in &stale {
            if let Some(node) = self.graph.remove_node(*idx) {
                self.index.remove(&node.label);
            }
        }
        stale.len()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn activation_of(&self, label: &str) -> Option<f64> {
        let idx = self.index.get(label)?;
        self.graph.node_weight(*idx).map(|n| n.activation)
    }
}

impl Default for ConceptGraph {
    fn default() -> Self {
        Self::new(ConceptConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Cross-modal associator
// ---------------------------------------------------------------------------

/// Associates keys across modalities (text topics, tools, outcomes) on the
/// same stable-arena representation, with modality-tagged labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrossModalAssociator {
    graph: ConceptGraph,
}

impl CrossModalAssociator {
    pub fn new(config: ConceptConfig) -> Self {
        Self {
            graph: ConceptGraph::new(config),
        }
    }

    fn tag(modality: &str, key: &str) -> String {
        format!("{modality}:{key}")
    }

    /// Strengthen a bidirectional association between two modal keys.
    pub fn associate(
        &mut self,
        modality_a: &str,
        key_a: &str,
        modality_b: &str,
        key_b: &str,
        weight: f64,
    ) {
        let a = Self::tag(modality_a, key_a);
        let b = Self::tag(modality_b, key_b);
        self.graph.associate(&a, &b, EdgeKind::Associative, weight);
        self.graph.associate(&b, &a, EdgeKind::Associative, weight);
    }

    /// Keys of `target_modality` associated with the given key, strongest
    /// first.
    pub fn associations(
        &mut self,
        modality: &str,
        key: &str,
        target_modality: &str,
        step: u64,
    ) -> Vec<(String, f64)> {
        let seed = Self::tag(modality, key);
        let prefix = format!("{target_modality}:");
        self.graph
            .activate(&[&seed], step)
            .into_iter()
            .filter_map(|(label, energy)| {
                label
                    .strip_prefix(&prefix)
                    .map(|k| (k.to_string(), energy))
            })
            .collect()
    }

    /// Maintenance pass-through.
    pub fn maintain(&mut self, current_step: u64, stale_after: u64) -> usize {
        self.graph.maintain(current_step, stale_after)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_spreads_two_hops() {
        let mut graph = ConceptGraph::default();
        graph.associate("auth", "jwt", EdgeKind::Associative, 0.8);
        graph.associate("jwt", "token", EdgeKind::Associative, 0.8);
        graph.associate("token", "expiry", EdgeKind::Associative, 0.8);
        let activated = graph.activate(&["auth"], 1);
        let labels: Vec<&str> = activated.iter().map(|(l, _)| l.as_str()).collect();
        assert!(labels.contains(&"jwt"));
        assert!(labels.contains(&"token"));
        // Three hops away: outside the spread radius.
        assert!(!labels.contains(&"expiry"));
    }

    #[test]
    fn inhibitory_edges_suppress() {
        let mut graph = ConceptGraph::default();
        graph.associate("panic", "calm", EdgeKind::Inhibitory, 0.9);
        let activated = graph.activate(&["panic"], 1);
        assert!(!activated.iter().any(|(l, _)| l == "calm"));
    }

    #[test]
    fn degree_cap_evicts_weakest_edge() {
        let config = ConceptConfig {
            degree_cap: 3,
            ..ConceptConfig::default()
        };
        let mut graph = ConceptGraph::new(config);
        graph.associate("hub", "weak", EdgeKind::Associative, 0.05);
        graph.associate("hub", "b", EdgeKind::Associative, 0.5);
        graph.associate("hub", "c", EdgeKind::Associative, 0.6);
        graph.associate("hub", "d", EdgeKind::Associative, 0.7);
        assert_eq!(graph.edge_count(), 3);
        let activated = graph.activate(&["hub"], 1);
        assert!(!activated.iter().any(|(l, _)| l == "weak"));
    }

    #[test]
    fn prune_removes_node_and_edges() {
        let mut graph = ConceptGraph::default();
        graph.associate("a", "b", EdgeKind::Associative, 0.5);
        graph.associate("b", "a", EdgeKind::Associative, 0.5);
        assert_eq!(graph.node_count(), 2);
        // Neither node ever activated; both go stale.
        let pruned = graph.maintain(1000, 10);
        assert_eq!(pruned, 2);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn cycles_are_safe() {
        let mut graph = ConceptGraph::default();
        graph.associate("a", "b", EdgeKind::Associative, 0.9);
        graph.associate("b", "a", EdgeKind::Associative, 0.9);
        let activated = graph.activate(&["a"], 1);
        assert!(activated.len() >= 2);
    }

    #[test]
    fn cross_modal_round_trip() {
        let mut assoc = CrossModalAssociator::default();
        assoc.associate("topic", "billing", "tool", "invoice_query", 0.8);
        let tools = assoc.associations("topic", "billing", "tool", 1);
        assert_eq!(tools[0].0, "invoice_query");
    }
}
