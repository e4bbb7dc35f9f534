//! # Call Endpoints
//!
//! HTTP entry points for telephony platforms that push events instead of
//! holding a WebSocket open.
//!
//! ## Event dispatch:
//! `POST /api/v1/calls/events` takes `{"event_type": ..., "call_data": {...}}`:
//! - **inbound_call**: start a call (greeting begins immediately)
//! - **audio_data**: one base64-encoded inbound audio chunk
//! - **call_end**: hang up and return the call summary

use crate::audio::processor::InboundFormat;
use crate::call::CallOptions;
use crate::dialogue::CustomerProfile;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::synthesis::VoiceParams;
use actix_web::{web, HttpResponse};
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

const DEFAULT_RECENT_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "event_type", content = "call_data", rename_all = "snake_case")]
pub enum CallEventRequest {
    InboundCall(InboundCallData),
    AudioData(AudioData),
    CallEnd(CallEndData),
}

#[derive(Debug, Deserialize)]
pub struct InboundCallData {
    /// Assigned by the telephony platform; generated when absent
    pub call_id: Option<String>,
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub profile: Option<CustomerProfile>,
    /// Inbound audio format name, `alaw` when absent
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
    pub voice: Option<VoiceParams>,
}

#[derive(Debug, Deserialize)]
pub struct AudioData {
    pub call_id: String,
    /// Base64-encoded audio bytes
    pub audio: String,
    /// Must match the format the call was started with, if given
    pub format: Option<String>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CallEndData {
    pub call_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

/// Handle one telephony event.
pub async fn call_event(
    state: web::Data<AppState>,
    body: web::Json<CallEventRequest>,
) -> AppResult<HttpResponse> {
    match body.into_inner() {
        CallEventRequest::InboundCall(data) => inbound_call(&state, data),
        CallEventRequest::AudioData(data) => audio_data(&state, data),
        CallEventRequest::CallEnd(data) => call_end(&state, data).await,
    }
}

fn inbound_call(state: &AppState, data: InboundCallData) -> AppResult<HttpResponse> {
    let options = call_options(data.format.as_deref(), data.sample_rate, data.profile, data.customer_phone, data.voice)?;
    let call = state.start_call(data.call_id, options)?;

    info!(call_id = %call.call_id(), format = %call.format(), "Inbound call accepted");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "call_id": call.call_id(),
        "state": call.state(),
        "format": call.format().to_string(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Build the options for a new call from transport-supplied fields.
pub fn call_options(
    format: Option<&str>,
    sample_rate: Option<u32>,
    profile: Option<CustomerProfile>,
    customer_phone: Option<String>,
    voice: Option<VoiceParams>,
) -> AppResult<CallOptions> {
    let format = match format {
        Some(name) => InboundFormat::parse(name, sample_rate)?,
        None => InboundFormat::default(),
    };

    if let Some(voice) = &voice {
        voice.validate().map_err(|e| AppError::ValidationError(e.to_string()))?;
    }

    Ok(CallOptions {
        format,
        profile: profile.unwrap_or_default(),
        customer_phone,
        voice,
    })
}

fn audio_data(state: &AppState, data: AudioData) -> AppResult<HttpResponse> {
    let call = state
        .get_call(&data.call_id)
        .ok_or_else(|| AppError::NotFound(format!("call not found: {}", data.call_id)))?;

    if let Some(name) = data.format.as_deref() {
        let format = InboundFormat::parse(name, data.sample_rate)?;
        if format != call.format() {
            return Err(AppError::BadRequest(format!(
                "call {} was started with {}, got {}",
                data.call_id,
                call.format(),
                format
            )));
        }
    }

    let bytes = base64::engine::general_purpose::STANDARD.decode(data.audio.trim())?;
    if bytes.is_empty() {
        return Err(AppError::BadRequest("audio payload is empty".to_string()));
    }

    let size = bytes.len();
    let disposition = call.push_audio(bytes)?;
    debug!(call_id = %data.call_id, bytes = size, ?disposition, "Audio chunk received");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "call_id": data.call_id,
        "bytes": size,
        "disposition": disposition
    })))
}

async fn call_end(state: &AppState, data: CallEndData) -> AppResult<HttpResponse> {
    let reason = data.reason.unwrap_or_else(|| "caller_hangup".to_string());
    let summary = state.end_call(&data.call_id, &reason).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "summary": summary
    })))
}

/// Live calls plus the most recently ended ones.
pub async fn list_calls(
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> AppResult<HttpResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "summary": state.call_summary(),
        "active": state.calls.snapshots(),
        "recent": state.calls.recent_archive(limit)
    })))
}

/// Status of a live call, or the summary of an ended one.
pub async fn get_call(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();

    if let Some(call) = state.get_call(&call_id) {
        return Ok(HttpResponse::Ok().json(json!({
            "status": "active",
            "call": call.snapshot(),
            "history": call.history()
        })));
    }

    match state.calls.archived(&call_id) {
        Some(summary) => Ok(HttpResponse::Ok().json(json!({
            "status": "ended",
            "summary": summary
        }))),
        None => Err(AppError::NotFound(format!("call not found: {}", call_id))),
    }
}

/// Operator reset after recognition gave up on a call.
pub async fn reset_asr(state: web::Data<AppState>, path: web::Path<String>) -> AppResult<HttpResponse> {
    let call_id = path.into_inner();
    let call = state
        .get_call(&call_id)
        .ok_or_else(|| AppError::NotFound(format!("call not found: {}", call_id)))?;

    call.reset_asr().await?;
    info!(call_id = %call_id, "Recognition reset requested");

    Ok(HttpResponse::Accepted().json(json!({
        "status": "accepted",
        "call_id": call_id,
        "message": "Recognition will reconnect on the next audio frame"
    })))
}
