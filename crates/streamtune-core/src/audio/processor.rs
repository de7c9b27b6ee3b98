//! Chunk processors run by workers and by the in-process fallback path.

use bytes::{BufMut, Bytes, BytesMut};

use crate::engine::types::DeviceId;
use crate::error::{Error, Result};

/// Bytes per 16-bit sample
const SAMPLE_BYTES: usize = 2;

/// Synchronous, CPU-bound transformation of one audio chunk.
///
/// Implementations are shared by every worker thread. `buffer_size` is the
/// device's buffer depth at submission time and may differ between calls on
/// the same device.
pub trait ChunkProcessor: Send + Sync + 'static {
    fn process(&self, device: &DeviceId, chunk: Bytes, buffer_size: u32) -> Result<Bytes>;
}

/// Applies a linear gain to interleaved 16-bit little-endian PCM.
#[derive(Debug, Clone)]
pub struct PcmGainProcessor {
    gain: f32,
}

impl PcmGainProcessor {
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for PcmGainProcessor {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl ChunkProcessor for PcmGainProcessor {
    fn process(&self, device: &DeviceId, chunk: Bytes, _buffer_size: u32) -> Result<Bytes> {
        if chunk.len() % SAMPLE_BYTES != 0 {
            return Err(Error::ProcessingError(format!(
                "misaligned PCM chunk for {}: {} bytes",
                device,
                chunk.len()
            )));
        }

        if (self.gain - 1.0).abs() < f32::EPSILON {
            return Ok(chunk);
        }

        let mut out = BytesMut::with_capacity(chunk.len());
        for pair in chunk.chunks_exact(SAMPLE_BYTES) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]) as f32 * self.gain;
            let clamped = sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            out.put_i16_le(clamped);
        }
        Ok(out.freeze())
    }
}
