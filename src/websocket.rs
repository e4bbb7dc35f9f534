//! # WebSocket Call Streaming Handler
//!
//! Carries one call over a WebSocket at `/ws/calls/{call_id}`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: `?format=alaw&sample_rate=8000` picks the inbound audio format
//! 2. **Start**: the client sends `start_call`, or the call already exists
//!    (started through `POST /api/v1/calls/events`) and the socket attaches to it
//! 3. **Audio In**: binary messages are raw inbound audio frames
//! 4. **Audio Out**: binary messages from the server are paced outbound frames
//!    in the configured telephony codec
//! 5. **Events**: call events (state changes, utterances, agent text) as JSON
//!
//! ## Message Format:
//! - **Client → Server**: binary audio, or JSON `start_call` / `end_call` / `reset_asr` / `ping` / `pong`
//! - **Server → Client**: binary audio, call events, and JSON control replies
//!
//! A call started by this socket is ended when the socket closes.

use crate::audio::processor::InboundFormat;
use crate::audio::AudioChunk;
use crate::call::session::{CallSession, FrameDisposition};
use crate::call::{CallEvent, CallSummary};
use crate::dialogue::CustomerProfile;
use crate::error::AppError;
use crate::handlers::calls::call_options;
use crate::state::AppState;
use crate::synthesis::VoiceParams;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

/// How often the server pings the client
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Silence from the client longer than this closes the connection
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Control messages sent by the client as JSON text frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartCall {
        customer_phone: Option<String>,
        #[serde(default)]
        profile: Option<CustomerProfile>,
        voice: Option<VoiceParams>,
    },
    EndCall {
        reason: Option<String>,
    },
    ResetAsr,
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

/// Control replies sent to the client. Call events go out as `CallEvent` JSON.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The socket is now carrying the call
    CallAttached {
        call_id: String,
        format: String,
        started_here: bool,
    },
    CallEnded {
        summary: CallSummary,
    },
    AsrReset {
        call_id: String,
    },
    Error {
        code: String,
        message: String,
        call_id: Option<String>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
}

#[derive(Debug, Deserialize)]
pub struct CallSocketQuery {
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
}

/// WebSocket actor for one call.
///
/// ## Actor Model:
/// Each connection is an independent actor. Outbound audio and call events
/// arrive as two extra streams added to the actor's context, so the actor
/// never blocks on the call.
pub struct CallWebSocket {
    call_id: String,
    format: InboundFormat,
    state: web::Data<AppState>,

    /// Set once the socket has started or attached to the call
    call: Option<Arc<CallSession>>,

    /// This socket created the call and ends it on disconnect
    owns_call: bool,

    /// `end_call` is in flight; the summary closes the socket
    ending: bool,

    handoff_notified: bool,
    last_heartbeat: Instant,
}

impl CallWebSocket {
    pub fn new(call_id: String, format: InboundFormat, state: web::Data<AppState>) -> Self {
        Self {
            call_id,
            format,
            state,
            call: None,
            owns_call: false,
            ending: false,
            handoff_notified: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json<T: Serialize>(ctx: &mut ws::WebsocketContext<Self>, message: &T) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to serialize WebSocket message: {}", err),
        }
    }

    /// Send error message to client.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        let error_msg = ServerMessage::Error {
            code: code.to_string(),
            message: message.to_string(),
            call_id: Some(self.call_id.clone()),
        };
        Self::send_json(ctx, &error_msg);
        warn!(call_id = %self.call_id, code, "WebSocket error: {}", message);
    }

    /// Start forwarding the call's audio and events to this socket.
    fn attach(&mut self, call: Arc<CallSession>, started_here: bool, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.add_stream(BroadcastStream::new(call.subscribe_audio()));
        ctx.add_stream(BroadcastStream::new(call.subscribe_events()));

        Self::send_json(
            ctx,
            &ServerMessage::CallAttached {
                call_id: call.call_id().to_string(),
                format: call.format().to_string(),
                started_here,
            },
        );
        info!(call_id = %call.call_id(), started_here, "WebSocket attached to call");

        self.owns_call = started_here;
        self.call = Some(call);
    }

    fn handle_start_call(
        &mut self,
        customer_phone: Option<String>,
        profile: Option<CustomerProfile>,
        voice: Option<VoiceParams>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.call.is_some() {
            self.send_error(ctx, "call_active", "This socket already carries a call");
            return;
        }

        let result = call_options(None, None, profile, customer_phone, voice).and_then(|mut options| {
            options.format = self.format;
            self.state
                .start_call(Some(self.call_id.clone()), options)
                .map_err(AppError::from)
        });

        match result {
            Ok(call) => self.attach(call, true, ctx),
            Err(err) => self.send_error(ctx, "start_failed", &err.to_string()),
        }
    }

    fn handle_end_call(&mut self, reason: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        if self.call.is_none() {
            self.send_error(ctx, "call_not_started", "No call to end");
            return;
        }

        self.ending = true;
        let state = self.state.clone();
        let call_id = self.call_id.clone();
        let reason = reason.unwrap_or_else(|| "caller_hangup".to_string());

        async move { state.end_call(&call_id, &reason).await }
            .into_actor(self)
            .map(|result, act, ctx| {
                match result {
                    Ok(summary) => Self::send_json(ctx, &ServerMessage::CallEnded { summary }),
                    Err(err) => act.send_error(ctx, "end_failed", &err.to_string()),
                }
                act.call = None;
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            })
            .wait(ctx);
    }

    fn handle_reset_asr(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(call) = self.call.clone() else {
            self.send_error(ctx, "call_not_started", "No call to reset");
            return;
        };

        async move { call.reset_asr().await }
            .into_actor(self)
            .map(|result, act, ctx| match result {
                Ok(()) => {
                    act.handoff_notified = false;
                    Self::send_json(ctx, &ServerMessage::AsrReset { call_id: act.call_id.clone() });
                }
                Err(err) => act.send_error(ctx, "reset_failed", &err.to_string()),
            })
            .spawn(ctx);
    }

    /// Hand a binary frame to the call.
    fn handle_audio_data(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let Some(call) = &self.call else {
            self.send_error(ctx, "call_not_started", "Send start_call before audio");
            return;
        };

        match call.push_audio(data.to_vec()) {
            Ok(FrameDisposition::Queued) | Ok(FrameDisposition::DroppedQueueFull) => {}
            Ok(FrameDisposition::RefusedHandoff) => {
                if !self.handoff_notified {
                    self.handoff_notified = true;
                    self.send_error(ctx, "handoff_required", "Recognition failed, waiting for an operator");
                }
            }
            Err(err) => self.send_error(ctx, "audio_error", &err.to_string()),
        }
    }

    fn handle_client_message(&mut self, message: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message {
            ClientMessage::StartCall { customer_phone, profile, voice } => {
                self.handle_start_call(customer_phone, profile, voice, ctx)
            }
            ClientMessage::EndCall { reason } => self.handle_end_call(reason, ctx),
            ClientMessage::ResetAsr => self.handle_reset_asr(ctx),
            ClientMessage::Ping { timestamp } => {
                self.last_heartbeat = Instant::now();
                Self::send_json(ctx, &ServerMessage::Pong { timestamp });
            }
            ClientMessage::Pong { .. } => self.last_heartbeat = Instant::now(),
        }
    }
}

/// Implement Actor trait for WebSocket handling.
impl Actor for CallWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, format = %self.format, "WebSocket connection started");

        // A call started over HTTP gets its audio through this socket
        if let Some(call) = self.state.get_call(&self.call_id) {
            self.attach(call, false, ctx);
        }

        // Start heartbeat timer
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(call_id = %act.call_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                let timestamp = chrono::Utc::now().timestamp_millis().max(0) as u64;
                Self::send_json(ctx, &ServerMessage::Ping { timestamp });
            }
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "WebSocket connection stopped");

        let Some(call) = self.call.take() else {
            return;
        };
        if self.owns_call && !self.ending && !call.is_ended() {
            let state = self.state.clone();
            let call_id = self.call_id.clone();
            tokio::spawn(async move {
                if let Err(err) = state.end_call(&call_id, "connection_closed").await {
                    debug!(call_id = %call_id, error = %err, "Call already gone on disconnect");
                }
            });
        }
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CallWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => self.handle_client_message(message, ctx),
                Err(err) => self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio_data(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.call_id, "WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound audio frames, already encoded and paced by the call.
impl StreamHandler<Result<AudioChunk, BroadcastStreamRecvError>> for CallWebSocket {
    fn handle(&mut self, item: Result<AudioChunk, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(chunk) => ctx.binary(chunk.bytes),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(call_id = %self.call_id, skipped, "WebSocket fell behind outbound audio");
            }
        }
    }

    // The call going away must not close the socket on its own
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(call_id = %self.call_id, "Outbound audio stream finished");
    }
}

impl StreamHandler<Result<CallEvent, BroadcastStreamRecvError>> for CallWebSocket {
    fn handle(&mut self, item: Result<CallEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(event) => {
                let ended = matches!(event, CallEvent::Ended { .. });
                Self::send_json(ctx, &event);

                // Ended elsewhere (HTTP, idle sweep): nothing left to carry
                if ended && !self.ending {
                    self.call = None;
                    ctx.close(Some(ws::CloseCode::Normal.into()));
                    ctx.stop();
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(call_id = %self.call_id, skipped, "WebSocket fell behind call events");
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(call_id = %self.call_id, "Call event stream finished");
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Validates the call id and audio format, then upgrades the connection.
/// The actual WebSocket communication is handled by the CallWebSocket actor.
pub async fn call_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let call_id = path.into_inner();
    info!(call_id = %call_id, "New WebSocket connection request from: {:?}", req.connection_info().peer_addr());

    let query = web::Query::<CallSocketQuery>::from_query(req.query_string())
        .map_err(|e| AppError::BadRequest(format!("Invalid query parameters: {}", e)))?;

    let format = match query.format.as_deref() {
        Some(name) => InboundFormat::parse(name, query.sample_rate).map_err(AppError::from)?,
        None => InboundFormat::default(),
    };

    if call_id.trim().is_empty() {
        return Err(AppError::BadRequest("call id cannot be empty".to_string()).into());
    }

    debug!(call_id = %call_id, format = %format, "Upgrading call WebSocket");
    ws::start(CallWebSocket::new(call_id, format, app_state), &req, stream)
}
