//! # Configuration Management
//!
//! Loads the voice backend's settings from layered sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Well-known provider variables (GROQ_API_KEY, ELEVENLABS_API_KEY, ...)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: The same structs are serialized into the `config` builder as defaults
//!   and deserialized back out after all sources are merged
//! - **Option<T>**: Settings that are genuinely optional (`transcription_sample_rate_hz`)
//! - **anyhow::Result**: Startup paths report readable errors instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Provider variables (HOST, PORT, GROQ_API_KEY, ...)
//! 2. Environment variables (APP_AUDIO__SILENCE_THRESHOLD_S=1.2, APP_SERVER__PORT=3000)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::audio::FrameFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Sample rates the WebRTC voice activity detector accepts.
pub const SUPPORTED_SAMPLE_RATES: [u32; 4] = [8000, 16000, 32000, 48000];

/// Frame durations the WebRTC voice activity detector accepts.
pub const SUPPORTED_FRAME_DURATIONS_MS: [u32; 3] = [10, 20, 30];

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket listener binds
/// - `audio`: frame geometry and segmentation tuning
/// - `services`: credentials and endpoints of the speech, language and search providers
/// - `assistant`: prompt text handed to the language model
/// - `performance`: connection limits and heartbeat timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub services: ServicesConfig,
    pub assistant: AssistantConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio frame geometry and speech segmentation settings.
///
/// ## Fields:
/// - `sample_rate_hz`: capture rate of the incoming PCM (8000, 16000, 32000 or 48000)
/// - `frame_duration_ms`: duration of one binary WebSocket frame (10, 20 or 30)
/// - `bytes_per_sample`: always 2 (little-endian 16-bit mono)
/// - `vad_aggressiveness`: 0 calls the most frames speech, 3 filters non-speech hardest
/// - `silence_threshold_s`: trailing silence that ends an utterance
/// - `pre_speech_padding_ms`: audio kept from before speech onset (0 disables it,
///   at most the silence threshold)
/// - `transcription_sample_rate_hz`: resample segments to this rate before transcription
///
/// With the defaults one frame is `16 * 30 * 2 = 960` bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate_hz: u32,
    pub frame_duration_ms: u32,
    pub bytes_per_sample: u32,
    pub vad_aggressiveness: u8,
    pub silence_threshold_s: f64,
    pub pre_speech_padding_ms: u32,
    pub transcription_sample_rate_hz: Option<u32>,
}

/// Credentials and endpoints for the external collaborators.
///
/// Empty API keys are allowed at startup; calls to a provider without a key fail
/// with that provider's error type, which turns into an error reply for the turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    pub groq_api_key: String,
    pub groq_base_url: String,
    pub llm_model: String,
    pub stt_model: String,
    pub elevenlabs_api_key: String,
    pub elevenlabs_base_url: String,
    pub elevenlabs_voice_id: String,
    pub tts_model: String,
    pub tavily_api_key: String,
    pub tavily_base_url: String,
    pub ip_lookup_url: String,
    /// Upper bound for every single collaborator call, in milliseconds.
    pub request_timeout_ms: u64,
}

/// Text the query router feeds to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub system_prompt: String,
    pub college_info: String,
}

/// Connection limits and WebSocket heartbeat timing.
///
/// ## Tuning guidelines:
/// - Each voice session holds one actor and at most one in-flight turn
/// - `client_timeout_s` must comfortably exceed `heartbeat_interval_s`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_s: u64,
    pub client_timeout_s: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig::default(),
            services: ServicesConfig {
                groq_api_key: String::new(),
                groq_base_url: "https://api.groq.com/openai/v1".to_string(),
                llm_model: "llama-3.1-8b-instant".to_string(),
                stt_model: "whisper-large-v3".to_string(),
                elevenlabs_api_key: String::new(),
                elevenlabs_base_url: "https://api.elevenlabs.io/v1".to_string(),
                elevenlabs_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                tts_model: "eleven_multilingual_v2".to_string(),
                tavily_api_key: String::new(),
                tavily_base_url: "https://api.tavily.com".to_string(),
                ip_lookup_url: "https://api.ipify.org?format=json".to_string(),
                request_timeout_ms: 30_000,
            },
            assistant: AssistantConfig {
                system_prompt: "You are a friendly voice assistant. Answer clearly and \
                                concisely, in plain sentences that read well aloud."
                    .to_string(),
                college_info: "No college information has been configured.".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_s: 30,
                client_timeout_s: 60,
            },
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            frame_duration_ms: 30,
            bytes_per_sample: 2,
            vad_aggressiveness: 3,
            silence_threshold_s: 1.5,
            pre_speech_padding_ms: 0,
            transcription_sample_rate_hz: None,
        }
    }
}

impl AudioConfig {
    /// Frame geometry derived from the capture settings.
    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::new(self.sample_rate_hz, self.frame_duration_ms, self.bytes_per_sample)
    }

    /// Silence threshold in whole milliseconds, rounded to the nearest millisecond.
    ///
    /// Segment emission compares integer milliseconds so that a threshold of 1.5 s
    /// with 30 ms frames triggers on exactly the 50th silent frame.
    pub fn silence_threshold_ms(&self) -> u64 {
        (self.silence_threshold_s * 1000.0).round() as u64
    }

    /// Check that the detector can run with this geometry.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate_hz) {
            return Err(anyhow::anyhow!(
                "Unsupported sample rate {} Hz (expected one of {:?})",
                self.sample_rate_hz,
                SUPPORTED_SAMPLE_RATES
            ));
        }

        if !SUPPORTED_FRAME_DURATIONS_MS.contains(&self.frame_duration_ms) {
            return Err(anyhow::anyhow!(
                "Unsupported frame duration {} ms (expected one of {:?})",
                self.frame_duration_ms,
                SUPPORTED_FRAME_DURATIONS_MS
            ));
        }

        if self.bytes_per_sample != 2 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {} bytes per sample",
                self.bytes_per_sample
            ));
        }

        if self.vad_aggressiveness > 3 {
            return Err(anyhow::anyhow!(
                "VAD aggressiveness must be between 0 and 3, got {}",
                self.vad_aggressiveness
            ));
        }

        if !self.silence_threshold_s.is_finite() || self.silence_threshold_s <= 0.0 {
            return Err(anyhow::anyhow!("Silence threshold must be a positive number of seconds"));
        }

        if u64::from(self.pre_speech_padding_ms) > self.silence_threshold_ms() {
            return Err(anyhow::anyhow!(
                "Pre-speech padding ({} ms) cannot exceed the silence threshold ({} ms)",
                self.pre_speech_padding_ms,
                self.silence_threshold_ms()
            ));
        }

        if let Some(rate) = self.transcription_sample_rate_hz {
            if rate == 0 {
                return Err(anyhow::anyhow!("Transcription sample rate cannot be 0"));
            }
        }

        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__VAD_AGGRESSIVENESS=2`: Less aggressive speech filtering
    /// - `APP_SERVICES__REQUEST_TIMEOUT_MS=10000`: Tighter collaborator timeout
    /// - `HOST` / `PORT`: Special case for deployment platforms
    /// - `GROQ_API_KEY`, `ELEVENLABS_API_KEY`, `ELEVENLABS_VOICE_ID`, `TAVILY_API_KEY`:
    ///   provider credentials under their conventional names
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let overrides = [
            ("HOST", "server.host"),
            ("PORT", "server.port"),
            ("GROQ_API_KEY", "services.groq_api_key"),
            ("ELEVENLABS_API_KEY", "services.elevenlabs_api_key"),
            ("ELEVENLABS_VOICE_ID", "services.elevenlabs_voice_id"),
            ("TAVILY_API_KEY", "services.tavily_api_key"),
        ];
        for (var, key) in overrides {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Audio geometry is one the voice activity detector supports
    /// - Session limit, heartbeat timing and collaborator timeout are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.audio.validate()?;

        if self.services.request_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Collaborator request timeout must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.heartbeat_interval_s == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.performance.client_timeout_s <= self.performance.heartbeat_interval_s {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"audio": {"silence_threshold_s": 1.0}}` touches nothing else.
    /// Provider credentials, endpoints and assistant text are fixed at startup.
    /// The result is validated before returning.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)?;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("sample_rate_hz").and_then(|v| v.as_u64()) {
                self.audio.sample_rate_hz = u32::try_from(rate)?;
            }
            if let Some(frame) = audio.get("frame_duration_ms").and_then(|v| v.as_u64()) {
                self.audio.frame_duration_ms = u32::try_from(frame)?;
            }
            if let Some(level) = audio.get("vad_aggressiveness").and_then(|v| v.as_u64()) {
                self.audio.vad_aggressiveness = u8::try_from(level)?;
            }
            if let Some(threshold) = audio.get("silence_threshold_s").and_then(|v| v.as_f64()) {
                self.audio.silence_threshold_s = threshold;
            }
            if let Some(padding) = audio.get("pre_speech_padding_ms").and_then(|v| v.as_u64()) {
                self.audio.pre_speech_padding_ms = u32::try_from(padding)?;
            }
            match audio.get("transcription_sample_rate_hz") {
                Some(serde_json::Value::Null) => self.audio.transcription_sample_rate_hz = None,
                Some(value) => {
                    if let Some(rate) = value.as_u64() {
                        self.audio.transcription_sample_rate_hz = Some(u32::try_from(rate)?);
                    }
                }
                None => {}
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance
                .get("max_concurrent_sessions")
                .and_then(|v| v.as_u64())
            {
                self.performance.max_concurrent_sessions = usize::try_from(sessions)?;
            }
            if let Some(interval) = performance.get("heartbeat_interval_s").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_s = interval;
            }
            if let Some(timeout) = performance.get("client_timeout_s").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_s = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.vad_aggressiveness, 3);
        assert_eq!(config.audio.silence_threshold_s, 1.5);
        assert!(config.validate().is_ok());
    }

    /// Test that the default geometry produces 960-byte frames.
    #[test]
    fn test_default_frame_size() {
        let config = AppConfig::default();
        assert_eq!(config.audio.frame_format().frame_byte_size(), 960);
        assert_eq!(config.audio.silence_threshold_ms(), 1500);
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.sample_rate_hz = 44_100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.frame_duration_ms = 25;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.vad_aggressiveness = 4;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.silence_threshold_s = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.client_timeout_s = config.performance.heartbeat_interval_s;
        assert!(config.validate().is_err());
    }

    /// Test that runtime configuration updates only touch the given fields.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"silence_threshold_s": 0.9, "vad_aggressiveness": 1}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.silence_threshold_s, 0.9);
        assert_eq!(config.audio.vad_aggressiveness, 1);
        assert_eq!(config.audio.sample_rate_hz, 16_000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    /// Test that an update producing an invalid configuration is rejected.
    #[test]
    fn test_config_update_rejects_invalid_values() {
        let mut config = AppConfig::default();
        assert!(config
            .update_from_json(r#"{"audio": {"vad_aggressiveness": 7}}"#)
            .is_err());
        assert!(config.update_from_json(r#"{"server": {"port": 70000}}"#).is_err());
    }

    /// Test that pre-speech padding is capped by the silence threshold.
    #[test]
    fn test_padding_bounded_by_silence_threshold() {
        let mut config = AppConfig::default();
        assert!(config
            .update_from_json(r#"{"audio": {"pre_speech_padding_ms": 4294967295}}"#)
            .is_err());

        config
            .update_from_json(r#"{"audio": {"pre_speech_padding_ms": 1500}}"#)
            .unwrap();
        assert_eq!(config.audio.pre_speech_padding_ms, 1500);

        // Shrinking the threshold below the padding is refused too.
        assert!(config
            .update_from_json(r#"{"audio": {"silence_threshold_s": 0.3}}"#)
            .is_err());
    }

    /// Test that the transcription resample rate can be set and cleared.
    #[test]
    fn test_transcription_rate_update() {
        let mut config = AppConfig::default();
        config
            .update_from_json(r#"{"audio": {"transcription_sample_rate_hz": 8000}}"#)
            .unwrap();
        assert_eq!(config.audio.transcription_sample_rate_hz, Some(8000));

        config
            .update_from_json(r#"{"audio": {"transcription_sample_rate_hz": null}}"#)
            .unwrap();
        assert_eq!(config.audio.transcription_sample_rate_hz, None);
    }
}
