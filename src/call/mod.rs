//! # Calls
//!
//! One `CallSession` per live call, owned by the process-wide `CallRegistry`.
//!
//! ## Call Lifecycle:
//! 1. **Created**: session built, tasks spawned
//! 2. **Greeting**: the opening line is spoken without waiting for the caller
//! 3. **Listening**: waiting for a complete utterance
//! 4. **Processing**: the dialogue engine is writing the reply
//! 5. **Speaking**: the reply is being streamed out
//! 6. **Ended**: terminal; nothing acts on the call any more
//!
//! Speaking is never interrupted: utterances that complete while the agent is
//! greeting, thinking or talking are logged and dropped.

pub mod registry;
pub mod session;

use crate::audio::processor::{InboundFormat, InboundStats};
use crate::dialogue::{CustomerProfile, DialogueEngine, DialogueTurn};
use crate::recognition::boundary::Utterance;
use crate::recognition::manager::AsrStatus;
use crate::recognition::RecognitionService;
use crate::synthesis::streamer::SpeechReport;
use crate::synthesis::{SynthesisService, VoiceParams};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Created,
    Greeting,
    Listening,
    Processing,
    Speaking,
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Created => "created",
            CallState::Greeting => "greeting",
            CallState::Listening => "listening",
            CallState::Processing => "processing",
            CallState::Speaking => "speaking",
            CallState::Ended => "ended",
        }
    }
}

/// Notifications pushed to whoever is attached to a call.
///
/// Nothing is published after `Ended`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    CustomerUtterance { utterance: Utterance },
    /// Text the agent is about to speak
    AgentText { text: String, fallback: bool },
    SpeechCompleted { report: SpeechReport },
    /// Something went wrong; `handoff_required` means a human must take over
    Failure { error: String, handoff_required: bool },
    Ended { reason: String },
}

/// The external services a call talks to.
///
/// `dialogue` is `None` when no engine is configured: every turn is answered
/// with the fallback text.
#[derive(Clone)]
pub struct CallServices {
    pub recognizer: Arc<dyn RecognitionService>,
    pub synthesizer: Arc<dyn SynthesisService>,
    pub dialogue: Option<Arc<dyn DialogueEngine>>,
}

/// Per-call choices made by the transport that connects the call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub format: InboundFormat,
    pub profile: CustomerProfile,
    pub customer_phone: Option<String>,
    /// Overrides the configured voice for this call
    pub voice: Option<VoiceParams>,
}

/// Process-wide call counters, shared by every session.
#[derive(Debug, Default)]
pub struct CallCounters {
    pub calls_started: AtomicU64,
    pub calls_ended: AtomicU64,
    pub asr_exhaustions: AtomicU64,
    pub fallback_replies: AtomicU64,
    pub speech_failures: AtomicU64,
}

impl CallCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CallCountersSnapshot {
        CallCountersSnapshot {
            calls_started: self.calls_started.load(Ordering::Relaxed),
            calls_ended: self.calls_ended.load(Ordering::Relaxed),
            asr_exhaustions: self.asr_exhaustions.load(Ordering::Relaxed),
            fallback_replies: self.fallback_replies.load(Ordering::Relaxed),
            speech_failures: self.speech_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallCountersSnapshot {
    pub calls_started: u64,
    pub calls_ended: u64,
    pub asr_exhaustions: u64,
    pub fallback_replies: u64,
    pub speech_failures: u64,
}

/// Live view of a call for the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub state: CallState,
    pub customer_phone: Option<String>,
    pub format: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub duration_ms: u64,
    pub turn_count: usize,
    pub handoff_required: bool,
    pub outbound_subscribers: usize,
    /// Frames dropped because the inbound queue was full
    pub inbound_queue_drops: u64,
    /// Recognition status as of the last processed frame
    pub asr: AsrStatus,
    pub inbound: InboundStats,
}

/// What is left of a call once it has ended.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub customer_phone: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub end_reason: String,
    pub turn_count: usize,
    pub customer_turns: usize,
    pub fallback_replies: u64,
    pub handoff_required: bool,
    pub history: Vec<DialogueTurn>,
}
