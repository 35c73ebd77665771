//! # Audio Format Conversion
//!
//! Wraps raw PCM segments in a self-describing WAV container for the
//! transcription provider, and offers the reverse direction plus a simple
//! resampler.
//!
//! ## Guarantees:
//! - **Lossless**: `pcm_to_wav` never resamples or re-quantizes, so
//!   `wav_to_pcm(pcm_to_wav(pcm))` returns exactly `pcm`
//! - **Strict input**: a buffer that does not divide into whole samples is
//!   rejected instead of silently truncated

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::io::Cursor;

/// The audio handed to the converter cannot be described by a WAV header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AudioFormatError {
    /// Byte length is not a whole number of samples
    MisalignedLength { len: usize, sample_width: u16 },
    /// Only 8, 16 and 24-bit integer PCM is written
    UnsupportedSampleWidth(u16),
    /// Zero channels or a zero sample rate
    InvalidParameters(String),
    /// The WAV container could not be written or parsed
    Container(String),
}

impl fmt::Display for AudioFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioFormatError::MisalignedLength { len, sample_width } => write!(
                f,
                "Invalid audio format: {} bytes is not a multiple of the {}-byte sample width",
                len, sample_width
            ),
            AudioFormatError::UnsupportedSampleWidth(width) => {
                write!(f, "Invalid audio format: unsupported sample width of {} bytes", width)
            }
            AudioFormatError::InvalidParameters(msg) => write!(f, "Invalid audio format: {}", msg),
            AudioFormatError::Container(msg) => write!(f, "Invalid audio format: {}", msg),
        }
    }
}

impl std::error::Error for AudioFormatError {}

/// Format information recovered from a WAV header.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width_bytes: u16,
}

/// Wrap raw little-endian PCM in a RIFF/WAVE container.
///
/// ## Parameters:
/// - **pcm**: interleaved samples, little-endian
/// - **sample_rate**: samples per second per channel
/// - **sample_width_bytes**: 1 (unsigned 8-bit), 2 (signed 16-bit) or 3 (signed 24-bit)
/// - **channels**: 1 for the voice pipeline
pub fn pcm_to_wav(
    pcm: &[u8],
    sample_rate: u32,
    sample_width_bytes: u16,
    channels: u16,
) -> Result<Vec<u8>, AudioFormatError> {
    if channels == 0 {
        return Err(AudioFormatError::InvalidParameters("channel count cannot be 0".to_string()));
    }
    if sample_rate == 0 {
        return Err(AudioFormatError::InvalidParameters("sample rate cannot be 0".to_string()));
    }
    if !matches!(sample_width_bytes, 1..=3) {
        return Err(AudioFormatError::UnsupportedSampleWidth(sample_width_bytes));
    }
    if pcm.len() % sample_width_bytes as usize != 0 {
        return Err(AudioFormatError::MisalignedLength {
            len: pcm.len(),
            sample_width: sample_width_bytes,
        });
    }

    let track = match sample_width_bytes {
        1 => wav::BitDepth::Eight(pcm.to_vec()),
        2 => {
            let mut samples = vec![0i16; pcm.len() / 2];
            LittleEndian::read_i16_into(pcm, &mut samples);
            wav::BitDepth::Sixteen(samples)
        }
        _ => wav::BitDepth::TwentyFour(pcm.chunks_exact(3).map(LittleEndian::read_i24).collect()),
    };

    let header = wav::Header::new(
        wav::WAV_FORMAT_PCM,
        channels,
        sample_rate,
        sample_width_bytes * 8,
    );

    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &track, &mut out)
        .map_err(|e| AudioFormatError::Container(format!("failed to write WAV: {}", e)))?;
    Ok(out.into_inner())
}

/// Decode a WAV container produced by [`pcm_to_wav`] back to raw PCM.
///
/// Only the tests read containers back; collaborators receive them as-is.
#[cfg(test)]
pub fn wav_to_pcm(container: &[u8]) -> Result<(WavSpec, Vec<u8>), AudioFormatError> {
    let mut reader = Cursor::new(container);
    let (header, track) = wav::read(&mut reader)
        .map_err(|e| AudioFormatError::Container(format!("failed to read WAV: {}", e)))?;

    if header.audio_format != wav::WAV_FORMAT_PCM {
        return Err(AudioFormatError::Container(format!(
            "expected integer PCM, found format tag {}",
            header.audio_format
        )));
    }

    let pcm = match track {
        wav::BitDepth::Eight(samples) => samples,
        wav::BitDepth::Sixteen(samples) => {
            let mut bytes = vec![0u8; samples.len() * 2];
            LittleEndian::write_i16_into(&samples, &mut bytes);
            bytes
        }
        wav::BitDepth::TwentyFour(samples) => {
            let mut bytes = vec![0u8; samples.len() * 3];
            for (chunk, sample) in bytes.chunks_exact_mut(3).zip(samples) {
                LittleEndian::write_i24(chunk, sample);
            }
            bytes
        }
        wav::BitDepth::ThirtyTwoFloat(_) => {
            return Err(AudioFormatError::UnsupportedSampleWidth(4));
        }
        wav::BitDepth::Empty => Vec::new(),
    };

    let spec = WavSpec {
        sample_rate: header.sampling_rate,
        channels: header.channel_count,
        sample_width_bytes: header.bits_per_sample / 8,
    };
    Ok((spec, pcm))
}

/// Resample 16-bit mono PCM with linear interpolation.
///
/// The output holds `round(n * to_rate / from_rate)` samples. Equal rates return
/// the input unchanged.
pub fn resample(pcm: &[u8], from_rate: u32, to_rate: u32) -> Result<Vec<u8>, AudioFormatError> {
    if from_rate == 0 || to_rate == 0 {
        return Err(AudioFormatError::InvalidParameters("sample rate cannot be 0".to_string()));
    }
    if pcm.len() % 2 != 0 {
        return Err(AudioFormatError::MisalignedLength {
            len: pcm.len(),
            sample_width: 2,
        });
    }
    if from_rate == to_rate || pcm.is_empty() {
        return Ok(pcm.to_vec());
    }

    let mut input = vec![0i16; pcm.len() / 2];
    LittleEndian::read_i16_into(pcm, &mut input);

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (input.len() as f64 * to_rate as f64 / from_rate as f64).round() as usize;
    let last = input.len() - 1;

    let output: Vec<i16> = (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let frac = position - index as f64;
            let a = input[index] as f64;
            let b = input[(index + 1).min(last)] as f64;
            (a + (b - a) * frac)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect();

    let mut bytes = vec![0u8; output.len() * 2];
    LittleEndian::write_i16_into(&output, &mut bytes);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(samples: usize) -> Vec<u8> {
        let values: Vec<i16> = (0..samples).map(|i| (i as i16).wrapping_mul(97)).collect();
        let mut bytes = vec![0u8; samples * 2];
        LittleEndian::write_i16_into(&values, &mut bytes);
        bytes
    }

    /// Test that a 16-bit segment survives the container unchanged.
    #[test]
    fn test_round_trip_16_bit() {
        let pcm = ramp(20 * 480);
        let container = pcm_to_wav(&pcm, 16_000, 2, 1).unwrap();
        assert_eq!(&container[0..4], b"RIFF");
        assert_eq!(&container[8..12], b"WAVE");

        let (spec, decoded) = wav_to_pcm(&container).unwrap();
        assert_eq!(decoded, pcm);
        assert_eq!(
            spec,
            WavSpec {
                sample_rate: 16_000,
                channels: 1,
                sample_width_bytes: 2
            }
        );
    }

    /// Test that an empty segment still yields a valid container.
    #[test]
    fn test_round_trip_empty() {
        let container = pcm_to_wav(&[], 16_000, 2, 1).unwrap();
        let (_, decoded) = wav_to_pcm(&container).unwrap();
        assert!(decoded.is_empty());
    }

    /// Test that a buffer that does not divide into samples is rejected.
    #[test]
    fn test_rejects_misaligned_pcm() {
        let err = pcm_to_wav(&[0u8; 961], 16_000, 2, 1).unwrap_err();
        assert_eq!(
            err,
            AudioFormatError::MisalignedLength {
                len: 961,
                sample_width: 2
            }
        );
        assert!(pcm_to_wav(&[0u8; 10], 16_000, 3, 1).is_err());
    }

    /// Test that impossible headers are rejected.
    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(matches!(
            pcm_to_wav(&[0u8; 4], 16_000, 2, 0),
            Err(AudioFormatError::InvalidParameters(_))
        ));
        assert!(matches!(
            pcm_to_wav(&[0u8; 4], 0, 2, 1),
            Err(AudioFormatError::InvalidParameters(_))
        ));
        assert!(matches!(
            pcm_to_wav(&[0u8; 4], 16_000, 4, 1),
            Err(AudioFormatError::UnsupportedSampleWidth(4))
        ));
    }

    /// Test that garbage is not mistaken for a container.
    #[test]
    fn test_decode_rejects_garbage() {
        assert!(wav_to_pcm(b"definitely not a wav file").is_err());
    }

    /// Test that resampling scales the sample count with the rate ratio.
    #[test]
    fn test_resample_length() {
        let pcm = ramp(480);
        assert_eq!(resample(&pcm, 16_000, 8_000).unwrap().len(), 240 * 2);
        assert_eq!(resample(&pcm, 16_000, 48_000).unwrap().len(), 1440 * 2);
        assert_eq!(resample(&ramp(3), 16_000, 8_000).unwrap().len(), 2 * 2);
    }

    /// Test that resampling to the same rate is the identity and is deterministic.
    #[test]
    fn test_resample_identity_and_determinism() {
        let pcm = ramp(480);
        assert_eq!(resample(&pcm, 16_000, 16_000).unwrap(), pcm);
        assert_eq!(
            resample(&pcm, 16_000, 22_050).unwrap(),
            resample(&pcm, 16_000, 22_050).unwrap()
        );
    }

    /// Test that downsampling a constant signal keeps its value.
    #[test]
    fn test_resample_constant_signal() {
        let mut pcm = vec![0u8; 960];
        LittleEndian::write_i16_into(&[1234i16; 480], &mut pcm);
        let out = resample(&pcm, 16_000, 8_000).unwrap();
        let mut samples = vec![0i16; out.len() / 2];
        LittleEndian::read_i16_into(&out, &mut samples);
        assert!(samples.iter().all(|&s| s == 1234));
    }

    #[test]
    fn test_resample_rejects_bad_input() {
        assert!(resample(&[0u8; 3], 16_000, 8_000).is_err());
        assert!(resample(&[0u8; 4], 0, 8_000).is_err());
    }
}
