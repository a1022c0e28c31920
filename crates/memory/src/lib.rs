pub mod axis;
pub mod dreaming;
pub mod embedding;
pub mod error;
pub mod event_log;
pub mod insight;
pub mod manager;
pub mod schema;
pub mod scoring;
pub mod store;
pub mod weights;

#[cfg(test)]
pub(crate) mod testing;

pub use axis::{Axis, AxisVector};
pub use dreaming::{
    CycleOutcome, DreamPhase, DreamingEngine, DreamingOptions, DreamingStats, SkipReason,
    ThresholdStatus, Trigger, spawn_auto_dreaming,
};
pub use embedding::{EmbedFn, hashed_embedding};
pub use error::{ErrorKind, MemoryError, MemoryResult};
pub use insight::{Insight, InsightSections, InsightStore, Statement};
pub use manager::{ManagerOptions, MemoryManager, MemoryPaths, MemoryStats};
pub use schema::{ConsolidationBatch, MemoryRecord, RecordKind, truncate_str};
pub use scoring::{AxisScore, AxisScorer};
pub use store::{FeedbackContext, MemoryStore, StoreOptions, StoreStats};
pub use weights::{AxisWeightState, AxisWeights, WeightRule};
