//! # Speech Segmenter
//!
//! Per-connection state machine that assembles classified frames into whole
//! utterances using a trailing-silence timer (hysteresis).
//!
//! ## States:
//! - **Idle**: waiting for speech
//! - **Speaking**: accumulating an utterance
//!
//! ## Transitions (for each incoming frame):
//! | state    | frame   | effect                                                      |
//! |----------|---------|-------------------------------------------------------------|
//! | Idle     | speech  | start an utterance with this frame                           |
//! | Speaking | speech  | append the frame, clear the silence run                      |
//! | Speaking | silence | count it; emit the utterance once the run reaches the threshold, otherwise drop the frame |
//! | Idle     | silence | nothing                                                      |
//!
//! Silence is measured in frames (`silence_run * frame_duration_ms`), never
//! with a clock, so the segmenter is fully deterministic. Trailing silence is
//! never part of an emitted segment.
//!
//! ## Pre-speech padding
//! When `pre_speech_padding_ms` is non-zero the segmenter remembers the last few
//! frames seen while idle and places them in front of the onset frame. This
//! recovers the soft attack of a word that the detector only fires on late.
//! It is disabled (0) by default.

use super::{FrameClassifier, FrameFormat};
use crate::config::AudioConfig;
use std::collections::VecDeque;
use std::time::Duration;

/// One complete utterance: the speech frames between onset and the end of
/// utterance, concatenated in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechSegment {
    bytes: Vec<u8>,
    frame_count: usize,
    format: FrameFormat,
}

impl SpeechSegment {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Playback duration of the utterance.
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.frame_count)
    }
}

/// Read-only snapshot of the segmenter, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmenterState {
    pub is_speaking: bool,
    pub silence_run: u32,
    pub accumulated_frames: usize,
    pub accumulated_bytes: usize,
}

/// Hysteresis state machine turning a frame stream into speech segments.
///
/// Owned by exactly one connection; it is never shared.
#[derive(Debug)]
pub struct SpeechSegmenter {
    format: FrameFormat,
    silence_threshold_ms: u64,
    padding_frames: usize,
    is_speaking: bool,
    silence_run: u32,
    accumulated: Vec<u8>,
    accumulated_frames: usize,
    lookback: VecDeque<Vec<u8>>,
}

impl SpeechSegmenter {
    /// Create an idle segmenter.
    ///
    /// ## Parameters:
    /// - **format**: frame geometry, used for the frame duration
    /// - **silence_threshold_ms**: trailing silence that ends an utterance (inclusive)
    /// - **pre_speech_padding_ms**: idle audio to keep ahead of speech onset, 0 to disable
    pub fn new(format: FrameFormat, silence_threshold_ms: u64, pre_speech_padding_ms: u32) -> Self {
        let padding_frames = if format.frame_duration_ms == 0 {
            0
        } else {
            pre_speech_padding_ms.div_ceil(format.frame_duration_ms) as usize
        };

        Self {
            format,
            silence_threshold_ms,
            padding_frames,
            is_speaking: false,
            silence_run: 0,
            accumulated: Vec::new(),
            accumulated_frames: 0,
            lookback: VecDeque::with_capacity(padding_frames),
        }
    }

    pub fn from_config(audio: &AudioConfig) -> Self {
        Self::new(
            audio.frame_format(),
            audio.silence_threshold_ms(),
            audio.pre_speech_padding_ms,
        )
    }

    /// Classify `frame` and advance the state machine.
    pub fn process(&mut self, frame: &[u8], classifier: &dyn FrameClassifier) -> Option<SpeechSegment> {
        let is_speech = classifier.classify(frame);
        self.push(frame, is_speech)
    }

    /// Advance the state machine with an already classified frame.
    ///
    /// Returns the finished utterance when this frame completes the silence
    /// threshold. An empty frame always counts as silence.
    pub fn push(&mut self, frame: &[u8], is_speech: bool) -> Option<SpeechSegment> {
        let is_speech = is_speech && !frame.is_empty();

        match (self.is_speaking, is_speech) {
            (false, true) => {
                self.is_speaking = true;
                self.silence_run = 0;
                self.accumulated.clear();
                self.accumulated_frames = 0;
                for padding in self.lookback.drain(..) {
                    self.accumulated.extend_from_slice(&padding);
                    self.accumulated_frames += 1;
                }
                self.append(frame);
                None
            }
            (true, true) => {
                self.silence_run = 0;
                self.append(frame);
                None
            }
            (true, false) => {
                self.silence_run += 1;
                let silence_ms = self.silence_run as u64 * self.format.frame_duration_ms as u64;
                if silence_ms >= self.silence_threshold_ms {
                    let segment = SpeechSegment {
                        bytes: std::mem::take(&mut self.accumulated),
                        frame_count: self.accumulated_frames,
                        format: self.format,
                    };
                    self.reset();
                    Some(segment)
                } else {
                    None
                }
            }
            (false, false) => {
                if self.padding_frames > 0 && frame.len() == self.format.frame_byte_size() {
                    if self.lookback.len() == self.padding_frames {
                        self.lookback.pop_front();
                    }
                    self.lookback.push_back(frame.to_vec());
                }
                None
            }
        }
    }

    /// Return to the initial idle state, discarding any partial utterance.
    pub fn reset(&mut self) {
        self.is_speaking = false;
        self.silence_run = 0;
        self.accumulated.clear();
        self.accumulated_frames = 0;
        self.lookback.clear();
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn state(&self) -> SegmenterState {
        SegmenterState {
            is_speaking: self.is_speaking,
            silence_run: self.silence_run,
            accumulated_frames: self.accumulated_frames,
            accumulated_bytes: self.accumulated.len(),
        }
    }

    fn append(&mut self, frame: &[u8]) {
        self.accumulated.extend_from_slice(frame);
        self.accumulated_frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 960;

    /// Speech when the frame is full-size and its first byte is non-zero.
    struct FirstByteClassifier;

    impl FrameClassifier for FirstByteClassifier {
        fn classify(&self, frame: &[u8]) -> bool {
            frame.len() == FRAME && frame[0] != 0
        }
    }

    fn speech(tag: u8) -> Vec<u8> {
        vec![tag.max(1); FRAME]
    }

    fn silence() -> Vec<u8> {
        vec![0; FRAME]
    }

    fn segmenter() -> SpeechSegmenter {
        SpeechSegmenter::new(FrameFormat::default(), 1500, 0)
    }

    /// Feed `n` frames and collect every emitted segment together with the
    /// 1-based index of the frame that triggered it.
    fn feed(seg: &mut SpeechSegmenter, frames: &[Vec<u8>]) -> Vec<(usize, SpeechSegment)> {
        frames
            .iter()
            .enumerate()
            .filter_map(|(i, f)| seg.process(f, &FirstByteClassifier).map(|s| (i + 1, s)))
            .collect()
    }

    /// Test the basic emission: 20 speech frames then 50 silent frames.
    #[test]
    fn test_emits_after_threshold_silence() {
        let mut seg = segmenter();
        let mut frames: Vec<Vec<u8>> = (0..20).map(|i| speech(i as u8 + 1)).collect();
        frames.extend((0..50).map(|_| silence()));

        let emitted = feed(&mut seg, &frames);
        assert_eq!(emitted.len(), 1);
        let (index, segment) = &emitted[0];
        assert_eq!(*index, 70, "emission must happen on silent frame #50");
        assert_eq!(segment.len(), 19_200);
        assert_eq!(segment.frame_count(), 20);
        assert_eq!(segment.duration(), Duration::from_millis(600));
        assert_eq!(seg.state(), SegmenterState::default());
    }

    /// Test that the 49th silent frame does not emit but the 50th does.
    #[test]
    fn test_exact_boundary() {
        let mut seg = segmenter();
        assert!(seg.push(&speech(1), true).is_none());
        for _ in 0..49 {
            assert!(seg.push(&silence(), false).is_none());
        }
        assert_eq!(seg.state().silence_run, 49);
        assert!(seg.push(&silence(), false).is_some());
    }

    /// Test that a threshold that is not a multiple of the frame duration
    /// rounds up to the next whole frame.
    #[test]
    fn test_boundary_with_uneven_threshold() {
        let mut seg = SpeechSegmenter::new(FrameFormat::default(), 1000, 0);
        seg.push(&speech(1), true);
        for _ in 0..33 {
            assert!(seg.push(&silence(), false).is_none());
        }
        assert!(seg.push(&silence(), false).is_some());
    }

    /// Test that brief pauses are folded into one utterance.
    #[test]
    fn test_short_pause_does_not_split_utterance() {
        let mut seg = segmenter();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        frames.extend((0..10).map(|_| speech(1)));
        frames.extend((0..10).map(|_| silence()));
        frames.extend((0..10).map(|_| speech(2)));
        frames.extend((0..50).map(|_| silence()));

        let emitted = feed(&mut seg, &frames);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].1.len(), 20 * FRAME);
    }

    /// Test that silences one frame short of the threshold never emit, while
    /// the accumulated utterance keeps growing.
    #[test]
    fn test_no_premature_emission() {
        let mut seg = segmenter();
        for round in 0..5 {
            assert!(seg.push(&speech(1), true).is_none());
            for _ in 0..49 {
                assert!(seg.push(&silence(), false).is_none());
            }
            assert_eq!(seg.state().accumulated_frames, round + 1);
        }
        assert!(seg.is_speaking());
    }

    /// Test that the segment holds exactly the speech frames, in order.
    #[test]
    fn test_segment_content_excludes_trailing_silence() {
        let mut seg = segmenter();
        let frames = [speech(1), speech(2), speech(3)];
        for frame in &frames {
            seg.push(frame, true);
        }
        seg.push(&silence(), false);
        seg.push(&speech(4), true);

        let mut segment = None;
        for _ in 0..50 {
            segment = seg.push(&silence(), false).or(segment);
        }
        let segment = segment.expect("segment");

        let expected: Vec<u8> = [speech(1), speech(2), speech(3), speech(4)].concat();
        assert_eq!(segment.as_bytes(), expected.as_slice());
        assert!(!segment.as_bytes().chunks(FRAME).any(|c| c[0] == 0));
    }

    /// Test that a short frame while idle changes nothing.
    #[test]
    fn test_malformed_frame_while_idle() {
        let mut seg = segmenter();
        assert!(seg.process(&[1u8; 500], &FirstByteClassifier).is_none());
        assert_eq!(seg.state(), SegmenterState::default());
    }

    /// Test that an empty frame can never start an utterance.
    #[test]
    fn test_empty_frame_is_silence() {
        let mut seg = segmenter();
        assert!(seg.push(&[], true).is_none());
        assert!(!seg.is_speaking());
    }

    /// Test that reset always yields the initial state and is idempotent.
    #[test]
    fn test_reset_is_idempotent() {
        let mut seg = segmenter();
        seg.reset();
        assert_eq!(seg.state(), SegmenterState::default());

        seg.push(&speech(1), true);
        seg.push(&silence(), false);
        assert_ne!(seg.state(), SegmenterState::default());

        seg.reset();
        let first = seg.state();
        seg.reset();
        assert_eq!(first, SegmenterState::default());
        assert_eq!(seg.state(), first);

        // Behaves like a fresh segmenter afterwards.
        let mut frames: Vec<Vec<u8>> = (0..20).map(|_| speech(1)).collect();
        frames.extend((0..50).map(|_| silence()));
        let emitted = feed(&mut seg, &frames);
        assert_eq!(emitted[0].1.len(), 19_200);
    }

    /// Test that pre-speech padding prepends the most recent idle frames.
    #[test]
    fn test_pre_speech_padding() {
        // 60 ms of padding at 30 ms frames keeps two frames.
        let mut seg = SpeechSegmenter::new(FrameFormat::default(), 1500, 60);
        seg.push(&[7u8; FRAME], false);
        seg.push(&[8u8; FRAME], false);
        seg.push(&[9u8; FRAME], false);
        seg.push(&speech(1), true);
        assert_eq!(seg.state().accumulated_frames, 3);

        let mut segment = None;
        for _ in 0..50 {
            segment = seg.push(&silence(), false).or(segment);
        }
        let segment = segment.expect("segment");
        let expected: Vec<u8> = [vec![8u8; FRAME], vec![9u8; FRAME], speech(1)].concat();
        assert_eq!(segment.as_bytes(), expected.as_slice());
    }

    /// Test that reset also forgets pre-speech padding.
    #[test]
    fn test_reset_clears_padding() {
        let mut seg = SpeechSegmenter::new(FrameFormat::default(), 1500, 60);
        seg.push(&[7u8; FRAME], false);
        seg.reset();
        seg.push(&speech(1), true);
        assert_eq!(seg.state().accumulated_frames, 1);
    }
}
