//! # Health and Metrics Endpoints
//!
//! - `GET /health`, `GET /api/v1/health`: liveness, session load and which
//!   collaborators have credentials configured
//! - `GET /api/v1/metrics`: request, endpoint and turn statistics
//!
//! API keys are never echoed back; only whether each one is set.

use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "voice": {
            "active_sessions": metrics.active_sessions,
            "segments_detected": metrics.segments_detected,
            "turns_completed": metrics.turns_completed,
            "turns_failed": metrics.turns_failed,
            "frame_bytes": config.audio.frame_format().frame_byte_size(),
            "silence_threshold_ms": config.audio.silence_threshold_ms(),
            "vad_aggressiveness": config.audio.vad_aggressiveness
        },
        "collaborators": collaborator_status(&config),
        "memory": get_memory_info(),
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "turns": {
            "segments_detected": metrics.segments_detected,
            "completed": metrics.turns_completed,
            "failed": metrics.turns_failed,
            "failure_rate": metrics.turn_failure_rate()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "rejected": metrics.sessions_rejected,
            "max_concurrent": state.get_config().performance.max_concurrent_sessions
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn collaborator_status(config: &AppConfig) -> serde_json::Value {
    let services = &config.services;
    json!({
        "transcription": {
            "provider": "groq",
            "model": services.stt_model,
            "configured": !services.groq_api_key.is_empty()
        },
        "llm": {
            "provider": "groq",
            "model": services.llm_model,
            "configured": !services.groq_api_key.is_empty()
        },
        "synthesis": {
            "provider": "elevenlabs",
            "model": services.tts_model,
            "configured": !services.elevenlabs_api_key.is_empty()
        },
        "web_search": {
            "provider": "tavily",
            "configured": !services.tavily_api_key.is_empty()
        }
    })
}

/// Resident and virtual memory of this process, read from `/proc` on Linux.
fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let path = format!("/proc/{}/status", process::id());
        if let Ok(status) = std::fs::read_to_string(path) {
            let field_bytes = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map_or(0, |kb| kb * 1024)
            };

            return json!({
                "resident_memory_bytes": field_bytes("VmRSS:"),
                "virtual_memory_bytes": field_bytes("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": format!("Memory info not available for process {}", process::id())
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "high_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage >= 1.0 {
            vec!["New voice connections are being refused - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fakes::{self, EchoResponder, FakeTranscriber, RecordingStore};
    use actix_web::test::{call_and_read_body_json, init_service, TestRequest};
    use actix_web::App;
    use std::sync::Arc;

    fn app_state() -> web::Data<AppState> {
        let services = fakes::services(
            Arc::new(FakeTranscriber::new("hello")),
            Arc::new(EchoResponder),
            Arc::new(RecordingStore::default()),
        );
        let mut config = AppConfig::default();
        config.services.groq_api_key = "gsk-secret".to_string();
        web::Data::new(AppState::new(config, services))
    }

    /// Test that health reports configured providers without leaking keys.
    #[actix_web::test]
    async fn test_health_check() {
        let state = app_state();
        state.record_turn(false);
        let app = init_service(
            App::new()
                .app_data(state.clone())
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["voice"]["frame_bytes"], 960);
        assert_eq!(body["voice"]["turns_failed"], 1);
        assert_eq!(body["collaborators"]["llm"]["configured"], true);
        assert_eq!(body["collaborators"]["synthesis"]["configured"], false);
        assert!(!body.to_string().contains("gsk-secret"));
    }

    #[actix_web::test]
    async fn test_detailed_metrics() {
        let state = app_state();
        state.record_segment();
        state.record_turn(true);
        assert!(state.try_open_session(10));
        let app = init_service(
            App::new()
                .app_data(state.clone())
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = TestRequest::get().uri("/metrics").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;

        assert_eq!(body["turns"]["segments_detected"], 1);
        assert_eq!(body["turns"]["completed"], 1);
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["sessions"]["max_concurrent"], 10);
    }

    #[test]
    fn test_system_status_at_capacity() {
        let config = AppConfig::default();
        let metrics = AppMetrics {
            active_sessions: config.performance.max_concurrent_sessions,
            ..AppMetrics::default()
        };
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "at_capacity");
        assert_eq!(status["session_usage_percent"], 100.0);
    }
}
