//! Streamtune Core - Adaptive Streaming Performance Engine
//!
//! This crate keeps real-time audio flowing from one source to many network
//! renderers while the host and the network change underneath it.
//!
//! # Architecture
//!
//! - A bounded worker pool processes chunks, with in-process fallback and
//!   backpressure toward the source
//! - Per-device buffers grow and shrink on underruns, overruns and dropouts
//! - Device health is probed on an adaptive cadence, with automatic recovery
//! - A weighted performance score drives a closed-loop auto-tuner
//! - Everything observable goes out on a single typed event channel
//!
//! # Example
//!
//! ```ignore
//! use streamtune_core::{Collaborators, Engine, EngineConfig, StreamMetadata};
//!
//! let engine = Engine::start(EngineConfig::default(), Collaborators::new(controller, relay))?;
//! engine.register_device("kitchen".into(), "192.168.1.20", 7000);
//! engine.open_stream(&"kitchen".into(), StreamMetadata::default()).await?;
//! let outcome = engine.process(&"kitchen".into(), chunk).await;
//! ```

pub mod alerts;
pub mod audio;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod scoring;

pub use alerts::{Alert, AlertLevel, AlertPublisher, EngineEvent};
pub use audio::{
    AdaptiveBufferController, AudioCounters, BufferAdjustment, BufferState, ChunkProcessor,
    PcmGainProcessor,
};
pub use collaborators::{AudioSource, DeviceController, StreamMetadata, StreamRelay};
pub use config::{EngineConfig, ServerConfig};
pub use engine::{
    Collaborators, DeviceId, DropReason, Engine, EngineStats, ParameterChange, PoolStats,
    ProcessOutcome, Readiness, TuningEvent, TuningPhase, TuningReason,
};
pub use error::{Error, Result};
pub use health::{DeviceEventKind, DeviceHealthTracker, DeviceSnapshot};
pub use scoring::{
    NetworkQuality, PerformanceScore, PerformanceScorer, SysinfoSampler, SystemMetrics,
    SystemSampler,
};
