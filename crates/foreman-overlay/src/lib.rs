//! Replays the checkpoint DAG in topological order to project what the
//! backlog would look like if pending checkpoints were applied.

pub mod order;
pub mod projection;


pub use order::topological_order;
pub use projection::{
    compute_overlay, ChangeAttribution, OverlayProjection, ProjectedEntity, ProjectionMark,
    SkippedCheckpoint,
};
