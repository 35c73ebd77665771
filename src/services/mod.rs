//! # External Collaborators
//!
//! The voice pipeline talks to the outside world only through the traits in
//! this module:
//! - **Transcriber**: WAV container in, transcript out
//! - **Responder**: transcript in, assistant reply out
//! - **Synthesizer**: reply text in, encoded audio out
//! - **ChatStore**: opens and closes chats, records every user/assistant message
//!   and the spoken transcript of each utterance
//!
//! `VoiceServices` bundles one implementation of each, built once at startup
//! and shared by every connection through `Arc`s. Tests swap in the fakes from
//! [`fakes`].

pub mod elevenlabs; // Text-to-speech
pub mod groq;       // Chat completions and speech-to-text
pub mod router;     // Picks how to answer a transcript
pub mod store;      // In-memory chat history
pub mod tavily;     // Web search

use crate::audio::{FrameClassifier, VadClassifier};
use crate::config::AppConfig;
use crate::session::{ChatMode, Role, Session};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Speech-to-text failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionError(pub String);

/// The assistant could not produce a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationError(pub String);

/// Text-to-speech failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisError(pub String);

/// A chat or message could not be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceError(pub String);

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transcription failed: {}", self.0)
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response generation failed: {}", self.0)
    }
}

impl fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Speech synthesis failed: {}", self.0)
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Persistence failed: {}", self.0)
    }
}

impl std::error::Error for TranscriptionError {}
impl std::error::Error for GenerationError {}
impl std::error::Error for SynthesisError {}
impl std::error::Error for PersistenceError {}

impl From<reqwest::Error> for TranscriptionError {
    fn from(err: reqwest::Error) -> Self {
        TranscriptionError(err.to_string())
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError(err.to_string())
    }
}

impl From<reqwest::Error> for SynthesisError {
    fn from(err: reqwest::Error) -> Self {
        SynthesisError(err.to_string())
    }
}

/// Turns a WAV container into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, TranscriptionError>;
}

/// Produces the assistant's answer to a transcript.
///
/// `context` carries extra grounding text (e.g. an uploaded document) when the
/// caller has any.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(
        &self,
        text: &str,
        mode: ChatMode,
        context: Option<&str>,
    ) -> Result<String, GenerationError>;
}

/// Turns the answer into encoded audio (MP3 for the bundled provider).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Chat persistence. Failures are logged by the caller and never end a turn.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Start a new chat for `user_id` and return its id.
    async fn open_chat(&self, user_id: &str, mode: ChatMode) -> Result<String, PersistenceError>;

    /// Append one message to the session's chat.
    async fn persist_turn(&self, session: &Session, role: Role, text: &str)
        -> Result<(), PersistenceError>;

    /// Record what was said aloud in one utterance, by either side.
    async fn record_transcript(&self, session: &Session, role: Role, text: &str)
        -> Result<(), PersistenceError>;

    /// The connection behind `session` has ended.
    async fn close_chat(&self, session: &Session) -> Result<(), PersistenceError>;
}

/// Every collaborator a voice session needs, shared read-only across connections.
#[derive(Clone)]
pub struct VoiceServices {
    pub classifier: Arc<dyn FrameClassifier>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub store: Arc<dyn ChatStore>,
}

impl fmt::Debug for VoiceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceServices").finish_non_exhaustive()
    }
}

impl VoiceServices {
    /// Build the production collaborators from configuration.
    ///
    /// A single HTTP client (connection pool) is shared by every provider. Missing
    /// API keys are not an error here; the affected provider fails per call.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let classifier = VadClassifier::new(
            config.audio.frame_format(),
            config.audio.vad_aggressiveness,
        )?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.services.request_timeout_ms))
            .build()?;

        let groq = Arc::new(groq::GroqClient::new(
            http.clone(),
            &config.services,
            config.assistant.system_prompt.clone(),
        ));
        let search = Arc::new(tavily::TavilyClient::new(http.clone(), &config.services));
        let ip_lookup = Arc::new(router::HttpIpLookup::new(
            http.clone(),
            config.services.ip_lookup_url.clone(),
        ));
        let responder = router::QueryRouter::new(
            groq.clone(),
            search,
            ip_lookup,
            config.assistant.college_info.clone(),
        );
        let synthesizer = elevenlabs::ElevenLabsClient::new(http, &config.services);

        info!(
            stt_model = %config.services.stt_model,
            llm_model = %config.services.llm_model,
            tts_model = %config.services.tts_model,
            "Voice services initialized"
        );

        Ok(Self {
            classifier: Arc::new(classifier),
            transcriber: groq,
            responder: Arc::new(responder),
            synthesizer: Arc::new(synthesizer),
            store: Arc::new(store::InMemoryChatStore::new()),
        })
    }
}
