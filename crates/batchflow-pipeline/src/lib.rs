//! Batched multi-stage inference pipeline.
//!
//! Paths flow through bounded queues: source → (load) → preprocess →
//! infer → postprocess. Device buffers come from fixed pools sized by the
//! first infer worker; completion markers drive epoch rollover and
//! throughput reporting.

pub mod batch;
pub mod config;
pub mod flow;
pub mod geometry;
pub mod state;
pub mod stats;
mod workers;

pub use batch::{InferenceResult, LoadedImage, PreparedBatch};
pub use config::{PipelineConfig, QueueCapacities, StageParallelism};
pub use flow::InferenceFlow;
pub use geometry::FlowGeometry;
pub use state::{EpochOutcome, FlowQueues, FlowState, QueueSizes, Registration};
pub use stats::{EpochReport, LatencySummary, PoolStatsReport, RunReport, ThroughputReport};
