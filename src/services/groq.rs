//! Groq's OpenAI-compatible API: chat completions for answers and the audio
//! transcription endpoint for speech-to-text.

use super::router::LanguageModel;
use super::{GenerationError, Transcriber, TranscriptionError};
use crate::config::ServicesConfig;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::debug;

const TEMPERATURE: f32 = 0.7;
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct GroqClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    llm_model: String,
    stt_model: String,
    system_prompt: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

impl GroqClient {
    pub fn new(http: reqwest::Client, services: &ServicesConfig, system_prompt: String) -> Self {
        Self {
            http,
            api_key: services.groq_api_key.clone(),
            base_url: services.groq_base_url.trim_end_matches('/').to_string(),
            llm_model: services.llm_model.clone(),
            stt_model: services.stt_model.clone(),
            system_prompt,
        }
    }

    fn system_message(&self, context: Option<&str>) -> String {
        match context {
            Some(context) if !context.is_empty() => {
                format!("{}\n\n{}", self.system_prompt, context)
            }
            _ => self.system_prompt.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for GroqClient {
    async fn complete(&self, prompt: &str, context: Option<&str>) -> Result<String, GenerationError> {
        if self.api_key.is_empty() {
            return Err(GenerationError("GROQ_API_KEY is not configured".to_string()));
        }

        let system = self.system_message(context);
        let request = ChatRequest {
            model: &self.llm_model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            top_p: 1.0,
            stream: false,
        };

        let response: ChatResponse = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| GenerationError("model returned an empty completion".to_string()))?;

        debug!(model = %self.llm_model, chars = text.len(), "Chat completion received");
        Ok(text)
    }
}

#[async_trait]
impl Transcriber for GroqClient {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, TranscriptionError> {
        if self.api_key.is_empty() {
            return Err(TranscriptionError("GROQ_API_KEY is not configured".to_string()));
        }

        let bytes = wav.len();
        let file = Part::bytes(wav)
            .file_name("speech.wav")
            .mime_str("audio/wav")?;
        let form = Form::new()
            .text("model", self.stt_model.clone())
            .text("response_format", "json")
            .part("file", file);

        let response: TranscriptionResponse = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        debug!(model = %self.stt_model, bytes, "Transcription received");
        Ok(response.text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn client(prompt: &str) -> GroqClient {
        GroqClient::new(
            reqwest::Client::new(),
            &AppConfig::default().services,
            prompt.to_string(),
        )
    }

    #[test]
    fn test_system_message_appends_context() {
        let groq = client("Be brief.");
        assert_eq!(groq.system_message(None), "Be brief.");
        assert_eq!(groq.system_message(Some("")), "Be brief.");
        assert_eq!(
            groq.system_message(Some("College information: x")),
            "Be brief.\n\nCollege information: x"
        );
    }

    /// Test that a missing key fails fast without touching the network.
    #[tokio::test]
    async fn test_missing_key_fails() {
        let groq = client("");
        assert!(groq.complete("hi", None).await.is_err());
        assert!(groq.transcribe(vec![0u8; 44]).await.is_err());
    }

    #[test]
    fn test_request_shape() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage {
                role: "user",
                content: "hi",
            }],
            temperature: TEMPERATURE,
            max_tokens: MAX_TOKENS,
            top_p: 1.0,
            stream: false,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["max_tokens"], 4096);
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "user");
    }
}
