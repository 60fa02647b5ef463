//! Cortical layer: attention priority, functional columns, and the concept
//! graph with cross-modal association.

pub mod attention;
pub mod column;
pub mod concept;

pub use attention::{AttentionConfig, AttentionEngine, AttentionPriority, AttentionRecord};
pub use column::{ColumnConfig, ColumnManager, FunctionalColumn};
pub use concept::{
    ConceptConfig, ConceptEdge, ConceptGraph, ConceptNode, CrossModalAssociator, EdgeKind,
};
