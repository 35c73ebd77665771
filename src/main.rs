//! # Voice Turn Backend - Main Application Entry Point
//!
//! Actix-web server for a voice assistant. Clients stream microphone audio
//! over a WebSocket; the server segments it into utterances and answers each
//! one with text plus synthesized speech.
//!
//! ## Application Architecture:
//! - **audio**: frame classification, speech segmentation, PCM/WAV conversion
//! - **pipeline**: one conversational turn (transcribe, respond, synthesize)
//! - **services**: the external collaborators behind traits (Groq, ElevenLabs, Tavily, chat store)
//! - **session**: handshake and per-connection session data
//! - **websocket**: the per-connection actor and the upgrade endpoint
//! - **config** / **state** / **health** / **handlers** / **middleware** / **error**: the HTTP service around it

mod audio;       // Frame classifier, segmenter, format conversion
mod config;      // Configuration management
mod error;       // HTTP error responses
mod handlers;    // Runtime config endpoints
mod health;      // Health and metrics endpoints
mod middleware;  // Request metrics
mod pipeline;    // Turn pipeline
mod services;    // External collaborators
mod session;     // Handshake and session
mod state;       // Shared application state
mod websocket;   // Voice chat WebSocket

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::services::VoiceServices;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once a termination signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup order:
/// 1. `.env`, logging, configuration (file + environment), validation
/// 2. Collaborators (VAD, HTTP clients, chat store), built once and shared
/// 3. HTTP server with CORS, request tracing and metrics middleware
/// 4. Run until the server fails or a SIGTERM/SIGINT arrives, then stop gracefully
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        frame_bytes = config.audio.frame_format().frame_byte_size(),
        silence_threshold_ms = config.audio.silence_threshold_ms(),
        max_sessions = config.performance.max_concurrent_sessions,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let services = VoiceServices::from_config(&config)?;
    let app_state = web::Data::new(AppState::new(config.clone(), services));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            // Middleware runs in reverse registration order for requests
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/voice-chat", web::get().to(websocket::voice_chat)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` overrides the default filter
/// `voice_turn_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_turn_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise [`SHUTDOWN_SIGNAL`].
///
/// If the handlers cannot be installed the server keeps running and only
/// stops when the process is killed.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll [`SHUTDOWN_SIGNAL`] every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
