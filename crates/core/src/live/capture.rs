//! Audio Capture Adapter
//!
//! Microphone samples arrive in arbitrarily sized callbacks. They are cut into
//! fixed-size frames, converted to 16-bit PCM and base64 encoded for the wire.

use super::MediaBlob;
use crate::audio::{CAPTURE_MIME_TYPE, encode_f32_to_base64_i16};

/// Samples per outbound frame (256 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 4096;

pub struct CaptureEncoder {
    frame_len: usize,
    pending: Vec<f32>,
}

impl CaptureEncoder {
    pub fn new(frame_len: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            pending: Vec::with_capacity(frame_len),
        }
    }

    /// Buffers `samples` and returns every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<MediaBlob> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_len * self.frame_len;
        let frames = self.pending[..complete]
            .chunks_exact(self.frame_len)
            .map(encode_frame)
            .collect();
        self.pending.drain(..complete);
        frames
    }

    /// Drops any partial frame so the next session starts empty.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CaptureEncoder {
    fn default() -> Self {
        Self::new(CAPTURE_FRAME_SAMPLES)
    }
}

fn encode_frame(samples: &[f32]) -> MediaBlob {
    MediaBlob {
        mime_type: CAPTURE_MIME_TYPE.to_string(),
        data: encode_f32_to_base64_i16(samples),
    }
}
