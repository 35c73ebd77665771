//! # Audio Processing Module
//!
//! Everything that touches raw PCM on its way from the WebSocket to the
//! transcription collaborator.
//!
//! ## Key Components:
//! - **Frame Classifier**: labels one frame as speech or silence (WebRTC VAD)
//! - **Speech Segmenter**: per-connection hysteresis state machine that turns
//!   classified frames into whole utterances
//! - **Format Converter**: wraps PCM in a WAV container, decodes it back, resamples
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 8, 16, 32 or 48 kHz (16 kHz by default)
//! - **Bit Depth**: 16-bit PCM, little-endian signed integers
//! - **Channels**: Mono
//! - **Frame**: 10, 20 or 30 ms of samples per binary WebSocket message

pub mod classifier; // Speech/silence decision for one frame
pub mod converter;  // PCM <-> WAV and resampling
pub mod segmenter;  // Utterance assembly with a trailing-silence timer

pub use classifier::{FrameClassifier, VadClassifier};
pub use segmenter::{SpeechSegment, SpeechSegmenter};

use serde::Serialize;
use std::time::Duration;

/// Geometry of one fixed-size audio frame.
///
/// ## Formula:
/// `frame_byte_size = (sample_rate_hz / 1000) * frame_duration_ms * bytes_per_sample`
///
/// At 16 kHz, 30 ms and 16-bit mono that is 480 samples, or 960 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameFormat {
    pub sample_rate_hz: u32,
    pub frame_duration_ms: u32,
    pub bytes_per_sample: u32,
}

impl FrameFormat {
    pub fn new(sample_rate_hz: u32, frame_duration_ms: u32, bytes_per_sample: u32) -> Self {
        Self {
            sample_rate_hz,
            frame_duration_ms,
            bytes_per_sample,
        }
    }

    /// Number of samples in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate_hz / 1000) as usize * self.frame_duration_ms as usize
    }

    /// Exact byte length every incoming frame must have.
    pub fn frame_byte_size(&self) -> usize {
        self.samples_per_frame() * self.bytes_per_sample as usize
    }

    /// Playback duration of `frames` consecutive frames.
    pub fn duration_of(&self, frames: usize) -> Duration {
        Duration::from_millis(frames as u64 * self.frame_duration_ms as u64)
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::new(16_000, 30, 2)
    }
}
