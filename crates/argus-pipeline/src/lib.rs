// The streaming inference pipeline.
//
// A linear chain of worker pools connected by bounded queues:
//
//   Input -> [reader] -> Q0 -> [encode] -> Q1 -> [send xN] -> Q2
//         -> [receive] -> Q3 -> [output] -> sinks
//
// Backpressure flows upstream through the bounded queues; for infinite
// inputs the reader drops stale frames instead (queue.rs). The supervisor
// owns lifecycle: drain on the first interrupt, hard stop on the second or
// on any worker error.

pub mod control;
pub mod output;
pub mod progress;
pub mod queue;
pub mod reader;
pub mod stages;
pub mod supervisor;
pub mod worker;

use thiserror::Error;

pub use control::{Control, StopLevel};
pub use output::{OutputterStage, PostProcessor};
pub use queue::{FrameQueue, QueueKind};
pub use supervisor::{
    run, run_with_control, PipelineConfig, RunOutcome, DEFAULT_QUEUE_SIZE,
    DEFAULT_RESULT_TIMEOUT, DEFAULT_SENDER_COUNT,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Media(#[from] argus_media::MediaError),

    #[error(transparent)]
    Backend(#[from] argus_backend::BackendError),

    #[error("{0}")]
    Other(String),
}
