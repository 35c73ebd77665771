//! # Turn Pipeline
//!
//! Runs one conversational turn for a finished speech segment:
//!
//! 1. **Convert**: wrap the PCM segment in a WAV container (resampling first if configured)
//! 2. **Transcribe**: speech-to-text
//! 3. **Persist** the user message and its transcript
//! 4. **Respond**: route the transcript and generate an answer
//! 5. **Persist** the assistant message and its transcript
//! 6. **Synthesize**: text-to-speech, base64 encoded for the JSON reply
//!
//! ## Failure isolation:
//! Every collaborator call is bounded by a timeout. Any failure or timeout
//! becomes one generic `{"error": true, "text": ...}` reply; the details only go
//! to the log. Persistence failures are logged and the turn carries on.

use crate::audio::converter::{self, AudioFormatError};
use crate::audio::SpeechSegment;
use crate::config::AudioConfig;
use crate::services::{
    GenerationError, PersistenceError, SynthesisError, TranscriptionError, VoiceServices,
};
use crate::session::{Role, Session};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Text of the reply sent when a turn fails, whatever the cause.
pub const GENERIC_FAILURE_TEXT: &str = "Sorry, I encountered an error processing your request.";

/// What the client receives once per completed turn.
///
/// ```json
/// {"text": "...", "audio_base64": "..."}
/// {"error": true, "text": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TurnReply {
    Success { text: String, audio_base64: String },
    Failure { error: bool, text: String },
}

impl TurnReply {
    pub fn failure() -> Self {
        TurnReply::Failure {
            error: true,
            text: GENERIC_FAILURE_TEXT.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TurnReply::Success { .. })
    }
}

/// Why a turn failed. Never shown to the client.
#[derive(Debug)]
pub enum TurnError {
    InvalidAudioFormat(AudioFormatError),
    Transcription(TranscriptionError),
    Generation(GenerationError),
    Synthesis(SynthesisError),
    /// Only logged; never ends a turn
    Persistence(PersistenceError),
    Timeout { stage: &'static str, after: Duration },
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::InvalidAudioFormat(err) => write!(f, "{}", err),
            TurnError::Transcription(err) => write!(f, "{}", err),
            TurnError::Generation(err) => write!(f, "{}", err),
            TurnError::Synthesis(err) => write!(f, "{}", err),
            TurnError::Persistence(err) => write!(f, "{}", err),
            TurnError::Timeout { stage, after } => {
                write!(f, "{} timed out after {}ms", stage, after.as_millis())
            }
        }
    }
}

impl std::error::Error for TurnError {}

impl From<AudioFormatError> for TurnError {
    fn from(err: AudioFormatError) -> Self {
        TurnError::InvalidAudioFormat(err)
    }
}

impl From<TranscriptionError> for TurnError {
    fn from(err: TranscriptionError) -> Self {
        TurnError::Transcription(err)
    }
}

impl From<GenerationError> for TurnError {
    fn from(err: GenerationError) -> Self {
        TurnError::Generation(err)
    }
}

impl From<SynthesisError> for TurnError {
    fn from(err: SynthesisError) -> Self {
        TurnError::Synthesis(err)
    }
}

/// The fixed per-turn pipeline, shared by every connection.
pub struct TurnPipeline {
    services: VoiceServices,
    capture_rate_hz: u32,
    transcription_rate_hz: Option<u32>,
    timeout: Duration,
}

impl TurnPipeline {
    pub fn new(services: VoiceServices, audio: &AudioConfig, timeout: Duration) -> Self {
        Self {
            services,
            capture_rate_hz: audio.sample_rate_hz,
            transcription_rate_hz: audio.transcription_sample_rate_hz,
            timeout,
        }
    }

    /// Run one turn. Never fails: errors become [`TurnReply::failure`].
    pub async fn run(&self, session: &Session, segment: SpeechSegment) -> TurnReply {
        let started = Instant::now();
        let frames = segment.frame_count();
        let audio_ms = segment.duration().as_millis() as u64;

        match self.try_run(session, segment).await {
            Ok(reply) => {
                info!(
                    session_id = %session.session_id,
                    frames,
                    audio_ms,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Turn completed"
                );
                reply
            }
            Err(err) => {
                error!(
                    session_id = %session.session_id,
                    frames,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Turn failed: {}",
                    err
                );
                TurnReply::failure()
            }
        }
    }

    async fn try_run(&self, session: &Session, segment: SpeechSegment) -> Result<TurnReply, TurnError> {
        let wav = self.encode(&segment)?;

        let transcript = self
            .bounded("transcription", self.services.transcriber.transcribe(wav))
            .await??;
        if transcript.trim().is_empty() {
            return Err(TranscriptionError("empty transcript".to_string()).into());
        }
        info!(session_id = %session.session_id, chars = transcript.len(), "Transcribed segment");

        self.persist(session, Role::User, &transcript).await;

        let answer = self
            .bounded(
                "response generation",
                self.services.responder.respond(&transcript, session.mode, None),
            )
            .await??;

        self.persist(session, Role::Assistant, &answer).await;

        let audio = self
            .bounded("speech synthesis", self.services.synthesizer.synthesize(&answer))
            .await??;

        Ok(TurnReply::Success {
            text: answer,
            audio_base64: STANDARD.encode(audio),
        })
    }

    fn encode(&self, segment: &SpeechSegment) -> Result<Vec<u8>, AudioFormatError> {
        let format = segment.format();
        let width = format.bytes_per_sample as u16;
        let pcm = segment.as_bytes();

        match self.transcription_rate_hz {
            Some(rate) if rate != self.capture_rate_hz => {
                let resampled = converter::resample(pcm, self.capture_rate_hz, rate)?;
                converter::pcm_to_wav(&resampled, rate, width, 1)
            }
            _ => converter::pcm_to_wav(pcm, self.capture_rate_hz, width, 1),
        }
    }

    /// Store one utterance as a chat message and as a voice transcript.
    async fn persist(&self, session: &Session, role: Role, text: &str) {
        let store = &self.services.store;
        let message = self.bounded("persistence", store.persist_turn(session, role, text)).await;
        let transcript = self
            .bounded("transcript", store.record_transcript(session, role, text))
            .await;

        for result in [message, transcript] {
            if let Err(err) = result.and_then(|stored| stored.map_err(TurnError::Persistence)) {
                warn!(session_id = %session.session_id, role = role.as_str(), "{}", err);
            }
        }
    }

    async fn bounded<T>(
        &self,
        stage: &'static str,
        call: impl Future<Output = T>,
    ) -> Result<T, TurnError> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| TurnError::Timeout {
                stage,
                after: self.timeout,
            })
    }
}
