//! ElevenLabs text-to-speech. Returns the MP3 body as-is.

use super::{SynthesisError, Synthesizer};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
struct VoiceSettings {
    stability: f32,
    similarity_boost: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.5,
            similarity_boost: 0.5,
        }
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    text: &'a str,
    model_id: &'a str,
    voice_settings: VoiceSettings,
}

#[derive(Debug, Clone)]
pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsClient {
    pub fn new(http: reqwest::Client, services: &ServicesConfig) -> Self {
        Self {
            http,
            api_key: services.elevenlabs_api_key.clone(),
            base_url: services.elevenlabs_base_url.trim_end_matches('/').to_string(),
            voice_id: services.elevenlabs_voice_id.clone(),
            model_id: services.tts_model.clone(),
        }
    }

    fn speech_url(&self) -> String {
        format!("{}/text-to-speech/{}", self.base_url, self.voice_id)
    }
}

#[async_trait]
impl Synthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        if self.api_key.is_empty() {
            return Err(SynthesisError("ELEVENLABS_API_KEY is not configured".to_string()));
        }
        if text.trim().is_empty() {
            return Err(SynthesisError("nothing to synthesize".to_string()));
        }

        let request = SpeechRequest {
            text,
            model_id: &self.model_id,
            voice_settings: VoiceSettings::default(),
        };

        let audio = self
            .http
            .post(self.speech_url())
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        debug!(voice_id = %self.voice_id, bytes = audio.len(), "Speech synthesized");
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_speech_url() {
        let mut services = AppConfig::default().services;
        services.elevenlabs_base_url = "https://tts.local/v1/".to_string();
        services.elevenlabs_voice_id = "voice-1".to_string();
        let client = ElevenLabsClient::new(reqwest::Client::new(), &services);
        assert_eq!(client.speech_url(), "https://tts.local/v1/text-to-speech/voice-1");
    }

    #[test]
    fn test_request_body() {
        let body = serde_json::to_value(SpeechRequest {
            text: "hello",
            model_id: "eleven_multilingual_v2",
            voice_settings: VoiceSettings::default(),
        })
        .unwrap();
        assert_eq!(body["model_id"], "eleven_multilingual_v2");
        assert_eq!(body["voice_settings"]["stability"], 0.5);
    }

    #[tokio::test]
    async fn test_missing_key_fails() {
        let client = ElevenLabsClient::new(reqwest::Client::new(), &AppConfig::default().services);
        assert!(client.synthesize("hello").await.is_err());
    }
}
