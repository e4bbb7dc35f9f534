//! # Speech Recognition
//!
//! The recognition side of a call: the contract with the streaming recognizer,
//! the per-call channel manager, and the detector that turns partial results
//! into complete utterances.
//!
//! ## Key Components:
//! - **RecognitionService / RecognitionChannel**: the external recognizer, as traits
//! - **manager**: `AsrSessionManager`, one reconnecting channel per call
//! - **boundary**: `UtteranceBoundaryDetector`, decides when the caller has finished a sentence
//!
//! ## Event delivery:
//! Recognizers push results asynchronously. Every channel a call opens is handed
//! the same `mpsc::UnboundedSender<RecognitionEvent>`, so the single consumer
//! (the call's turn task) keeps one receiver across reconnects.

pub mod boundary;
pub mod manager;

use crate::error::VoiceResult;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Payload encoding a recognition channel is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecognitionEncoding {
    /// PCM16 wrapped in a WAV header per frame
    Wav,
    /// Raw PCM16
    Pcm,
    /// Opus in a container
    Opus,
}

/// Everything a recognizer needs to open a channel for one call.
#[derive(Debug, Clone, Serialize)]
pub struct RecognitionParams {
    /// Equal to the call id
    pub session_id: String,
    pub model: String,
    pub sample_rate: u32,
    pub encoding: RecognitionEncoding,
    pub max_sentence_silence_ms: u64,
    pub semantic_punctuation: bool,
    pub heartbeat: bool,
}

/// One result pushed by the recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionEvent {
    /// Full text of the sentence recognized so far
    pub text: String,
    /// `None` when the recognizer does not report confidence
    pub confidence: Option<f32>,
    /// Set when the recognizer itself marks the sentence as finished
    pub is_final: bool,
}

impl RecognitionEvent {
    pub fn partial(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self { text: text.into(), confidence, is_final: false }
    }

    pub fn final_result(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self { text: text.into(), confidence, is_final: true }
    }
}

/// A streaming speech recognizer.
#[async_trait]
pub trait RecognitionService: Send + Sync {
    /// Open a new channel. Results for this channel are sent to `events`.
    async fn open(
        &self,
        params: &RecognitionParams,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Box<dyn RecognitionChannel>>;
}

/// An open recognition stream.
#[async_trait]
pub trait RecognitionChannel: Send {
    /// Deliver one frame. An error means the channel is no longer usable.
    async fn send(&mut self, frame: &[u8]) -> VoiceResult<()>;

    /// Close the channel; calling it on an already-closed channel is allowed.
    async fn close(&mut self) -> VoiceResult<()>;
}

const MIN_ARRIVAL_LATENCY: Duration = Duration::from_millis(50);
const MAX_ARRIVAL_LATENCY: Duration = Duration::from_millis(3000);
const DEFAULT_ARRIVAL_LATENCY: Duration = Duration::from_millis(200);

/// Shared marker of when audio was last handed to the recognizer.
///
/// The ingestion side marks every delivered frame; the turn side reads it when
/// an utterance completes to estimate how long recognition took.
#[derive(Debug, Clone, Default)]
pub struct LatencyProbe {
    last_sent: Arc<Mutex<Option<Instant>>>,
}

impl LatencyProbe {
    pub fn mark_sent(&self, at: Instant) {
        *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) = Some(at);
    }

    /// Time since the last delivered frame, clamped to 50 ms–3 s; 200 ms if nothing was sent.
    pub fn latency_at(&self, now: Instant) -> Duration {
        match *self.last_sent.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(sent) => now
                .saturating_duration_since(sent)
                .clamp(MIN_ARRIVAL_LATENCY, MAX_ARRIVAL_LATENCY),
            None => DEFAULT_ARRIVAL_LATENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_probe_clamps() {
        let probe = LatencyProbe::default();
        let start = Instant::now();
        assert_eq!(probe.latency_at(start), Duration::from_millis(200));

        probe.mark_sent(start);
        assert_eq!(probe.latency_at(start + Duration::from_millis(10)), Duration::from_millis(50));
        assert_eq!(probe.latency_at(start + Duration::from_millis(420)), Duration::from_millis(420));
        assert_eq!(probe.latency_at(start + Duration::from_secs(9)), Duration::from_secs(3));
    }
}
