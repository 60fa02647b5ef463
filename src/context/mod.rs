//! Context window management: tiered store, progressive compression, and
//! budgeted packing.

pub mod compress;
pub mod item;
pub mod packer;

pub use compress::{digest, mask_observation, summarize_range, CompressionConfig};
pub use item::{estimate_tokens, CompressionLevel, ContextItem, ContextItemKind, Tier};
pub use packer::{
    Checkpoint, ContextStore, ImportanceWeights, PackedContext, PackedSegment, PackerConfig,
    SegmentSource,
};
