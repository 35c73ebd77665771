//! # Frame Classifier
//!
//! Decides whether a single audio frame contains speech.
//!
//! Classification fails open: a frame of the wrong length, or one the detector
//! rejects, is reported as non-speech. Nothing in this module returns an error
//! once a classifier has been built, so a malformed client frame can never
//! break a voice session.

use super::FrameFormat;
use anyhow::Result;
use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Anything that can label one frame as speech (`true`) or silence (`false`).
///
/// Implementations are shared read-only between every open connection, hence
/// the `Send + Sync` bound.
pub trait FrameClassifier: Send + Sync {
    fn classify(&self, frame: &[u8]) -> bool;
}

/// WebRTC voice activity detection over 16-bit little-endian mono frames.
///
/// ## Aggressiveness:
/// - `0` Quality: most frames called speech
/// - `1` Low bitrate
/// - `2` Aggressive
/// - `3` Very aggressive: fewest false positives
///
/// The underlying detector keeps internal state and is not thread-safe, so a
/// fresh instance is created for every frame. This also guarantees that a
/// decision depends on the current frame alone.
#[derive(Debug, Clone)]
pub struct VadClassifier {
    format: FrameFormat,
    aggressiveness: u8,
}

impl VadClassifier {
    /// Build a classifier for the given frame geometry.
    ///
    /// Fails if the detector does not support the sample rate, frame duration or
    /// sample width, or if `aggressiveness` is above 3.
    pub fn new(format: FrameFormat, aggressiveness: u8) -> Result<Self> {
        if sample_rate(format.sample_rate_hz).is_none() {
            return Err(anyhow::anyhow!(
                "VAD does not support a sample rate of {} Hz",
                format.sample_rate_hz
            ));
        }
        if !matches!(format.frame_duration_ms, 10 | 20 | 30) {
            return Err(anyhow::anyhow!(
                "VAD frames must be 10, 20 or 30 ms, got {} ms",
                format.frame_duration_ms
            ));
        }
        if format.bytes_per_sample != 2 {
            return Err(anyhow::anyhow!("VAD requires 16-bit samples"));
        }
        if vad_mode(aggressiveness).is_none() {
            return Err(anyhow::anyhow!(
                "VAD aggressiveness must be 0-3, got {}",
                aggressiveness
            ));
        }

        Ok(Self {
            format,
            aggressiveness,
        })
    }
}

impl FrameClassifier for VadClassifier {
    fn classify(&self, frame: &[u8]) -> bool {
        if frame.len() != self.format.frame_byte_size() {
            trace!(
                expected = self.format.frame_byte_size(),
                got = frame.len(),
                "Frame has wrong length, treating as silence"
            );
            return false;
        }

        let (Some(rate), Some(mode)) = (
            sample_rate(self.format.sample_rate_hz),
            vad_mode(self.aggressiveness),
        ) else {
            return false;
        };

        let mut samples = vec![0i16; frame.len() / 2];
        LittleEndian::read_i16_into(frame, &mut samples);

        let mut vad = Vad::new();
        vad.set_mode(mode);
        vad.set_sample_rate(rate);
        vad.is_voice_segment(&samples).unwrap_or(false)
    }
}

fn sample_rate(hz: u32) -> Option<SampleRate> {
    match hz {
        8000 => Some(SampleRate::Rate8kHz),
        16000 => Some(SampleRate::Rate16kHz),
        32000 => Some(SampleRate::Rate32kHz),
        48000 => Some(SampleRate::Rate48kHz),
        _ => None,
    }
}

fn vad_mode(level: u8) -> Option<VadMode> {
    match level {
        0 => Some(VadMode::Quality),
        1 => Some(VadMode::LowBitrate),
        2 => Some(VadMode::Aggressive),
        3 => Some(VadMode::VeryAggressive),
        _ => None,
    }
}
