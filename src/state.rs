//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice connection.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and actors hold the same state
//! - **RwLock**: many readers or one writer; config reads vastly outnumber writes
//! - Locks are never held across an `.await`
//!
//! ### Poisoned locks
//! A panic while a lock is held "poisons" it. Metrics and config stay usable
//! after such a panic, so every accessor recovers the guard with
//! `PoisonError::into_inner` instead of unwrapping.
//!
//! ## What lives here:
//! - **config**: runtime-updatable [`AppConfig`]
//! - **metrics**: HTTP request counters plus voice session and turn counters
//! - **services**: the collaborators every voice connection shares
//! - **start_time**: for uptime reporting

use crate::audio::{FrameClassifier, VadClassifier};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::services::VoiceServices;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the middleware and by voice connections
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Collaborators shared by every voice connection. Only the frame
    /// classifier is ever replaced, when the audio settings change.
    pub services: Arc<RwLock<VoiceServices>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected since server start.
///
/// ## Voice counters:
/// - **active_sessions**: open voice connections (admission is capped by
///   `performance.max_concurrent_sessions`)
/// - **segments_detected**: utterances the segmenter emitted
/// - **turns_completed** / **turns_failed**: replies sent, by outcome
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub active_sessions: usize,
    pub segments_detected: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub sessions_rejected: u64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, services: VoiceServices) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            services: Arc::new(RwLock::new(services)),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate and install a new configuration.
    ///
    /// When the frame geometry or VAD aggressiveness changes, a matching frame
    /// classifier is built and swapped in. The config write lock is held for
    /// the whole swap, so [`voice_snapshot`](Self::voice_snapshot) never pairs
    /// a classifier with the wrong frame size. Connections that are already
    /// open keep the classifier and segmenter they started with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), AppError> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;

        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let audio_changed = config.audio.frame_format() != new_config.audio.frame_format()
            || config.audio.vad_aggressiveness != new_config.audio.vad_aggressiveness;

        if audio_changed {
            let classifier = VadClassifier::new(
                new_config.audio.frame_format(),
                new_config.audio.vad_aggressiveness,
            )
            .map_err(|e| AppError::Internal(e.to_string()))?;

            self.services
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .classifier = Arc::new(classifier) as Arc<dyn FrameClassifier>;

            info!(
                frame_bytes = new_config.audio.frame_format().frame_byte_size(),
                vad_aggressiveness = new_config.audio.vad_aggressiveness,
                "Frame classifier rebuilt for new audio settings"
            );
        }

        *config = new_config;
        Ok(())
    }

    /// Configuration and collaborators taken together, for a new voice connection.
    ///
    /// Lock order is config, then services, the same as in `update_config`.
    pub fn voice_snapshot(&self) -> (AppConfig, VoiceServices) {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        let services = self.services.read().unwrap_or_else(PoisonError::into_inner);
        (config.clone(), services.clone())
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## Parameters:
    /// - **endpoint**: e.g. "GET /api/v1/health"
    /// - **duration_ms**: how long the request took
    /// - **is_error**: whether the response was a 4xx/5xx
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a voice session slot.
    ///
    /// Check and increment happen under one write lock, so concurrent upgrades
    /// cannot overshoot `max_sessions`. Returns `false` when the server is full.
    pub fn try_open_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions >= max_sessions {
            metrics.sessions_rejected += 1;
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Release a slot taken by [`try_open_session`](Self::try_open_session).
    pub fn close_session(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    pub fn record_segment(&self) {
        self.metrics_mut().segments_detected += 1;
    }

    pub fn record_turn(&self, succeeded: bool) {
        let mut metrics = self.metrics_mut();
        if succeeded {
            metrics.turns_completed += 1;
        } else {
            metrics.turns_failed += 1;
        }
    }

    /// Copy of the current metrics, taken so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    /// Failed HTTP requests over all requests, 0.0 when idle.
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }

    /// Failed turns over all finished turns.
    pub fn turn_failure_rate(&self) -> f64 {
        ratio(self.turns_failed, self.turns_completed + self.turns_failed)
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        ratio(self.total_duration_ms, self.request_count)
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        ratio(self.error_count, self.request_count)
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole > 0 {
        part as f64 / whole as f64
    } else {
        0.0
    }
}
