//! Runtime configuration endpoints.
//!
//! `PUT /api/v1/config` takes a partial JSON document; only the listed server,
//! audio and performance fields can change. New values apply to connections
//! opened afterwards. Provider settings are never returned.

use crate::{config::AppConfig, error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

fn public_view(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": config.server,
        "audio": {
            "sample_rate_hz": config.audio.sample_rate_hz,
            "frame_duration_ms": config.audio.frame_duration_ms,
            "bytes_per_sample": config.audio.bytes_per_sample,
            "frame_bytes": config.audio.frame_format().frame_byte_size(),
            "vad_aggressiveness": config.audio.vad_aggressiveness,
            "silence_threshold_s": config.audio.silence_threshold_s,
            "pre_speech_padding_ms": config.audio.pre_speech_padding_ms,
            "transcription_sample_rate_hz": config.audio.transcription_sample_rate_hz
        },
        "performance": config.performance
    })
}

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": public_view(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut updated = state.get_config();
    updated.update_from_json(&json_str)?;
    state.update_config(updated.clone())?;

    info!(
        frame_bytes = updated.audio.frame_format().frame_byte_size(),
        silence_threshold_ms = updated.audio.silence_threshold_ms(),
        max_sessions = updated.performance.max_concurrent_sessions,
        "Configuration updated"
    );

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": public_view(&updated)
    })))
}
