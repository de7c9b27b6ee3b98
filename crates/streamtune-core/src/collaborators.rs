//! Interfaces the engine consumes but does not implement.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::engine::types::{DeviceId, Readiness};
use crate::error::Result;

/// What a renderer is told about the stream it should pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub title: Option<String>,
    pub artist: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for StreamMetadata {
    fn default() -> Self {
        Self {
            title: None,
            artist: None,
            content_type: default_content_type(),
        }
    }
}

fn default_content_type() -> String {
    "audio/L16;rate=44100;channels=2".to_string()
}

/// Control channel to a network renderer.
#[async_trait]
pub trait DeviceController: Send + Sync + 'static {
    /// Check the device is reachable. Returns the observed round trip.
    /// The caller bounds the call with the device's probe timeout.
    async fn probe(&self, device: &DeviceId, host: &str, port: u16) -> Result<Duration>;

    /// Volume in percent, 0..=100.
    async fn set_volume(&self, device: &DeviceId, volume: u8) -> Result<()>;

    async fn play(&self, device: &DeviceId, endpoint: &str, metadata: &StreamMetadata)
        -> Result<()>;

    async fn stop(&self, device: &DeviceId) -> Result<()>;
}

/// Producer of raw chunks, told when the engine cannot take more.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Next chunk, or `None` once the source is exhausted.
    async fn next_chunk(&self) -> Option<(DeviceId, Bytes)>;

    fn set_readiness(&self, device: &DeviceId, readiness: Readiness);
}

/// Pull endpoint per device. The engine only needs the URL.
pub trait StreamRelay: Send + Sync + 'static {
    fn endpoint_url(&self, device: &DeviceId) -> Option<String>;
}
