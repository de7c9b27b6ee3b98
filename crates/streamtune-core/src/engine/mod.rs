//! Streaming engine
//!
//! The engine is split into components that each own their state:
//! - `WorkerPool`: bounded set of chunk-processing worker threads
//! - `AudioProcessingPipeline`: pool dispatch with in-process fallback and backpressure
//! - `AutoTuningOptimizer`: closed-loop adjustment of live configuration
//! - `Engine`: the supervisor wiring them to the buffer controller, the health
//!   tracker, the scorer and the event bus, and running the periodic loops

pub mod optimizer;
pub mod pipeline;
mod supervisor;
pub mod types;
pub mod worker_pool;

pub use optimizer::{
    AutoTuningOptimizer, ParameterChange, TunableParams, TuningEvent, TuningLog, TuningPhase,
    TuningSignals, TuningTarget,
};
pub use pipeline::{AudioProcessingPipeline, PipelineStats};
pub use supervisor::{Collaborators, Engine, EngineStats};
pub use types::{DeviceId, DropReason, ProcessOutcome, Readiness, TuningReason, WorkerId};
pub use worker_pool::{PoolStats, WorkerPool, WorkerSnapshot};
