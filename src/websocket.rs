//! # Voice Chat WebSocket
//!
//! One actor per connection at `/api/v1/voice-chat`. The actor owns the
//! connection's [`SpeechSegmenter`] and [`Session`] and runs turns through the
//! shared [`TurnPipeline`].
//!
//! ## Protocol:
//! 1. **Handshake**: first message is text `{"user_id": "...", "mode": "voice"}`
//! 2. **Audio**: binary messages, one fixed-size PCM frame each (960 bytes at the defaults)
//! 3. **Replies**: one text message per utterance,
//!    `{"text": "...", "audio_base64": "..."}` or `{"error": true, "text": "..."}`
//!
//! A malformed handshake, or audio before the handshake, closes the connection
//! with the policy-violation code. Text after the handshake is ignored.
//!
//! ## Half-duplex turns:
//! Opening the chat and running a turn are spawned on the actor context and
//! their `SpawnHandle` is kept. Binary frames that arrive meanwhile are queued
//! and classified in order once the reply has been sent, so a connection never
//! runs two turns at once. A close, a protocol error or a heartbeat timeout
//! cancels the in-flight work at whatever call it is waiting on.

use crate::audio::{FrameClassifier, SpeechSegment, SpeechSegmenter};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::pipeline::TurnPipeline;
use crate::services::{ChatStore, VoiceServices};
use crate::session::{Handshake, Session};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, web::Bytes, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Audio a connection may queue while a turn is in flight.
const MAX_PENDING_AUDIO_MS: u32 = 60_000;

pub struct VoiceChatSocket {
    state: web::Data<AppState>,
    pipeline: Arc<TurnPipeline>,
    classifier: Arc<dyn FrameClassifier>,
    store: Arc<dyn ChatStore>,
    segmenter: SpeechSegmenter,

    /// Set once the chat has been opened
    session: Option<Session>,

    /// Chat opening or turn currently running
    in_flight: Option<SpawnHandle>,
    pending: VecDeque<Bytes>,
    max_pending: usize,

    request_timeout: Duration,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
}

impl VoiceChatSocket {
    /// Build a connection actor from one consistent snapshot of the
    /// configuration and the shared collaborators.
    pub fn new(state: web::Data<AppState>, config: &AppConfig, services: VoiceServices) -> Self {
        let request_timeout = Duration::from_millis(config.services.request_timeout_ms);
        let max_pending = (MAX_PENDING_AUDIO_MS / config.audio.frame_duration_ms.max(1)) as usize;

        Self {
            classifier: services.classifier.clone(),
            store: services.store.clone(),
            pipeline: Arc::new(TurnPipeline::new(services, &config.audio, request_timeout)),
            segmenter: SpeechSegmenter::from_config(&config.audio),
            session: None,
            in_flight: None,
            pending: VecDeque::new(),
            max_pending,
            request_timeout,
            heartbeat_interval: Duration::from_secs(config.performance.heartbeat_interval_s),
            client_timeout: Duration::from_secs(config.performance.client_timeout_s),
            last_heartbeat: Instant::now(),
            state,
        }
    }

    fn reject(&self, reason: &str, ctx: &mut ws::WebsocketContext<Self>) {
        warn!("Closing voice connection: {}", reason);
        ctx.close(Some(ws::CloseReason {
            code: ws::CloseCode::Policy,
            description: Some(reason.to_string()),
        }));
        ctx.stop();
    }

    /// Drop whatever is in flight and stop the actor.
    fn shut_down(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.in_flight.take() {
            ctx.cancel_future(handle);
            debug!(queued_frames = self.pending.len(), "Cancelled in-flight voice work");
        }
        self.pending.clear();
        ctx.stop();
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        if self.session.is_some() || self.in_flight.is_some() {
            warn!("Ignoring text message after handshake");
            return;
        }

        match Handshake::parse(text) {
            Ok(handshake) => self.open_session(handshake, ctx),
            Err(err) => self.reject(&err.to_string(), ctx),
        }
    }

    /// Ask the store for a chat id, then install the session.
    ///
    /// If the store fails or stalls, the conversation still proceeds under a
    /// locally generated chat id.
    fn open_session(&mut self, handshake: Handshake, ctx: &mut ws::WebsocketContext<Self>) {
        let store = self.store.clone();
        let timeout = self.request_timeout;
        let user_id = handshake.user_id.clone();
        let mode = handshake.mode;

        let open_chat = async move {
            match tokio::time::timeout(timeout, store.open_chat(&user_id, mode)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!("open_chat timed out after {}ms", timeout.as_millis())),
            }
        };

        let handle = ctx.spawn(open_chat.into_actor(self).map(move |result, act, ctx| {
            act.in_flight = None;
            let chat_id = result.unwrap_or_else(|err| {
                warn!(user_id = %handshake.user_id, "Could not open chat, using a local id: {}", err);
                Uuid::new_v4().to_string()
            });

            let session = Session::new(handshake, chat_id);
            info!(
                session_id = %session.session_id,
                user_id = %session.user_id,
                chat_id = %session.chat_id,
                mode = %session.mode,
                "Voice session started"
            );
            act.session = Some(session);
            act.drain_pending(ctx);
        }));
        self.in_flight = Some(handle);
    }

    fn handle_binary(&mut self, frame: Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        if self.in_flight.is_some() {
            if self.pending.len() >= self.max_pending {
                warn!(max_pending = self.max_pending, "Voice frame queue full, dropping frame");
            } else {
                self.pending.push_back(frame);
            }
            return;
        }

        if self.session.is_none() {
            self.reject("audio received before handshake", ctx);
            return;
        }

        self.process_frame(&frame, ctx);
    }

    fn process_frame(&mut self, frame: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(session) = &self.session else {
            return;
        };

        if let Some(segment) = self.segmenter.process(frame, self.classifier.as_ref()) {
            debug!(
                session_id = %session.session_id,
                frames = segment.frame_count(),
                bytes = segment.len(),
                "Utterance detected"
            );
            self.state.record_segment();
            let session = session.clone();
            self.run_turn(session, segment, ctx);
        }
    }

    /// Classify queued frames until they run out or one of them ends an utterance.
    fn drain_pending(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        while self.in_flight.is_none() {
            let Some(frame) = self.pending.pop_front() else {
                break;
            };
            self.process_frame(&frame, ctx);
        }
    }

    /// Run one turn, send its reply, reset the segmenter, then resume queued audio.
    fn run_turn(&mut self, session: Session, segment: SpeechSegment, ctx: &mut ws::WebsocketContext<Self>) {
        let pipeline = self.pipeline.clone();
        let turn = async move { pipeline.run(&session, segment).await };

        let handle = ctx.spawn(turn.into_actor(self).map(|reply, act, ctx| {
            act.in_flight = None;
            act.state.record_turn(reply.is_success());
            match serde_json::to_string(&reply) {
                Ok(json) => ctx.text(json),
                Err(err) => error!("Failed to serialize turn reply: {}", err),
            }
            act.segmenter.reset();
            act.drain_pending(ctx);
        }));
        self.in_flight = Some(handle);
    }
}

impl Actor for VoiceChatSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        debug!("Voice connection opened");

        let client_timeout = self.client_timeout;
        ctx.run_interval(self.heartbeat_interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!("Voice connection heartbeat timeout, closing");
                act.shut_down(ctx);
            } else {
                ctx.ping(b"");
            }
        });
    }

    /// The session slot is released exactly once, whatever ended the connection.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.close_session();
        if self.segmenter.is_speaking() {
            let partial = self.segmenter.state();
            debug!(
                frames = partial.accumulated_frames,
                bytes = partial.accumulated_bytes,
                "Discarding partial utterance"
            );
        }

        let Some(session) = self.session.take() else {
            debug!("Voice connection closed before handshake");
            return;
        };
        info!(
            session_id = %session.session_id,
            chat_id = %session.chat_id,
            duration_s = (chrono::Utc::now() - session.started_at).num_seconds(),
            "Voice session ended"
        );

        let store = self.store.clone();
        let timeout = self.request_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, store.close_chat(&session)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(chat_id = %session.chat_id, "{}", err),
                Err(_) => warn!(chat_id = %session.chat_id, "close_chat timed out"),
            }
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceChatSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_binary(data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!("Client closed voice connection: {:?}", reason);
                ctx.close(reason);
                self.shut_down(ctx);
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                self.shut_down(ctx);
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Refuses the upgrade with 503 when `performance.max_concurrent_sessions`
/// connections are already open.
pub async fn voice_chat(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let (config, services) = state.voice_snapshot();
    let max_sessions = config.performance.max_concurrent_sessions;

    if !state.try_open_session(max_sessions) {
        warn!(max_sessions, "Refusing voice connection, session limit reached");
        return Err(AppError::ServiceUnavailable(format!(
            "Maximum concurrent voice sessions ({}) reached",
            max_sessions
        ))
        .into());
    }

    debug!("Voice connection request from {:?}", req.connection_info().peer_addr());
    let socket = VoiceChatSocket::new(state.clone(), &config, services);
    ws::start(socket, &req, stream).map_err(|err| {
        state.close_session();
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::GENERIC_FAILURE_TEXT;
    use crate::services::fakes::{self, EchoResponder, FakeTranscriber, RecordingStore};
    use actix_web::App;
    use awc::ws::{CloseCode, Frame, Message};
    use futures_util::{SinkExt, StreamExt};

    const SPEECH: [u8; 960] = [1u8; 960];
    const SILENCE: [u8; 960] = [0u8; 960];

    fn app_state(
        config: AppConfig,
        transcriber: Arc<FakeTranscriber>,
        store: Arc<RecordingStore>,
    ) -> web::Data<AppState> {
        let services = fakes::services(transcriber, Arc::new(EchoResponder), store);
        web::Data::new(AppState::new(config, services))
    }

    fn serve(state: web::Data<AppState>) -> actix_test::TestServer {
        actix_test::start(move || {
            App::new()
                .app_data(state.clone())
                .route("/api/v1/voice-chat", web::get().to(voice_chat))
        })
    }

    fn test_server(config: AppConfig, transcriber: Arc<FakeTranscriber>) -> actix_test::TestServer {
        serve(app_state(config, transcriber, Arc::new(RecordingStore::default())))
    }

    /// 20 speech frames followed by enough silence to end the utterance.
    fn utterance() -> Vec<Message> {
        let speech = std::iter::repeat(SPEECH).take(20);
        let silence = std::iter::repeat(SILENCE).take(50);
        speech
            .chain(silence)
            .map(|frame| Message::Binary(Bytes::copy_from_slice(&frame)))
            .collect()
    }

    async fn send_all<S>(framed: &mut S, messages: Vec<Message>)
    where
        S: futures_util::Sink<Message> + Unpin,
        S::Error: std::fmt::Debug,
    {
        for message in messages {
            framed.send(message).await.unwrap();
        }
    }

    /// Next text frame as JSON, skipping heartbeat pings.
    async fn next_reply<S>(framed: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<Frame, awc::error::WsProtocolError>> + Unpin,
    {
        loop {
            match framed.next().await.unwrap().unwrap() {
                Frame::Text(text) => return serde_json::from_slice(&text).unwrap(),
                Frame::Ping(_) | Frame::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    /// Test that a failed turn sends an error reply and the next utterance still works.
    #[actix_web::test]
    async fn test_failed_turn_keeps_connection_open() {
        let transcriber = Arc::new(FakeTranscriber::new("hello").failing_first(1));
        let mut srv = test_server(AppConfig::default(), transcriber);
        let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();

        framed
            .send(Message::Text(r#"{"user_id": "u-1", "mode": "voice"}"#.into()))
            .await
            .unwrap();

        send_all(&mut framed, utterance()).await;
        let first = next_reply(&mut framed).await;
        assert_eq!(first["error"], true);
        assert_eq!(first["text"], GENERIC_FAILURE_TEXT);

        // Text after the handshake is ignored.
        framed.send(Message::Text("hello?".into())).await.unwrap();

        send_all(&mut framed, utterance()).await;
        let second = next_reply(&mut framed).await;
        assert_eq!(second["text"], "echo: hello #2");
        assert!(second["audio_base64"].as_str().is_some_and(|a| !a.is_empty()));
        assert!(second.get("error").is_none());
    }

    /// Test that a second utterance sent during a slow turn is answered after the first.
    #[actix_web::test]
    async fn test_turns_are_half_duplex() {
        let transcriber = Arc::new(FakeTranscriber::new("hello").with_delay(Duration::from_millis(200)));
        let mut srv = test_server(AppConfig::default(), transcriber.clone());
        let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();

        framed.send(Message::Text(r#"{"user_id": "u-1"}"#.into())).await.unwrap();
        send_all(&mut framed, utterance()).await;
        send_all(&mut framed, utterance()).await;

        assert_eq!(next_reply(&mut framed).await["text"], "echo: hello #1");
        assert_eq!(next_reply(&mut framed).await["text"], "echo: hello #2");
        assert_eq!(transcriber.calls(), 2);
        assert_eq!(transcriber.max_in_flight(), 1);
    }

    #[actix_web::test]
    async fn test_audio_before_handshake_closes_with_policy() {
        let mut srv = test_server(AppConfig::default(), Arc::new(FakeTranscriber::new("hello")));
        let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();

        framed
            .send(Message::Binary(Bytes::copy_from_slice(&SPEECH)))
            .await
            .unwrap();

        match framed.next().await.unwrap().unwrap() {
            Frame::Close(Some(reason)) => assert_eq!(reason.code, CloseCode::Policy),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_invalid_handshake_closes_with_policy() {
        let mut srv = test_server(AppConfig::default(), Arc::new(FakeTranscriber::new("hello")));

        for handshake in [r#"not json"#, r#"{"mode": "voice"}"#, r#"{"user_id": "u", "mode": "chat"}"#] {
            let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();
            framed.send(Message::Text(handshake.into())).await.unwrap();

            match framed.next().await.unwrap().unwrap() {
                Frame::Close(Some(reason)) => assert_eq!(reason.code, CloseCode::Policy),
                other => panic!("expected close frame for {}, got {:?}", handshake, other),
            }
        }
    }

    #[actix_web::test]
    async fn test_session_limit_refuses_upgrade() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 1;
        let mut srv = test_server(config, Arc::new(FakeTranscriber::new("hello")));

        let _first = srv.ws_at("/api/v1/voice-chat").await.unwrap();
        assert!(srv.ws_at("/api/v1/voice-chat").await.is_err());
    }

    /// Test that closing mid-turn cancels the turn and frees the session slot at once.
    #[actix_web::test]
    async fn test_close_during_turn_cancels_it() {
        let transcriber = Arc::new(FakeTranscriber::new("hello").with_delay(Duration::from_millis(800)));
        let store = Arc::new(RecordingStore::default());
        let state = app_state(AppConfig::default(), transcriber.clone(), store.clone());
        let mut srv = serve(state.clone());
        let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();

        framed.send(Message::Text(r#"{"user_id": "u-1"}"#.into())).await.unwrap();
        send_all(&mut framed, utterance()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        framed.send(Message::Close(None)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let metrics = state.get_metrics_snapshot();
        assert_eq!(transcriber.calls(), 1);
        assert!(store.messages().is_empty());
        assert_eq!(metrics.turns_completed, 0);
        assert_eq!(metrics.turns_failed, 0);
        assert_eq!(store.closed(), vec!["chat-test".to_string()]);
    }

    /// Test that audio sent while the chat is still opening is kept, not rejected.
    #[actix_web::test]
    async fn test_audio_right_after_handshake_is_queued() {
        let transcriber = Arc::new(FakeTranscriber::new("hello"));
        let mut srv = test_server(AppConfig::default(), transcriber.clone());
        let mut framed = srv.ws_at("/api/v1/voice-chat").await.unwrap();

        let mut messages = vec![Message::Text(r#"{"user_id": "u-1"}"#.into())];
        messages.extend(utterance());
        send_all(&mut framed, messages).await;

        assert_eq!(next_reply(&mut framed).await["text"], "echo: hello #1");
        assert_eq!(transcriber.calls(), 1);
    }
}
