pub mod progress;
pub mod registry;

pub use progress::{ChannelProgress, ProgressEvent, ProgressSink, TracingProgress};
pub use registry::{
    BatchGuard, BatchId, BatchRegistry, LimiterPermit, LimiterState, ProgressSnapshot,
    DEFAULT_BATCH_CONCURRENCY,
};
