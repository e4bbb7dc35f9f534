//! # Utterance Boundary Detection
//!
//! Recognizers stream ever-growing partial results and only sometimes flag the
//! end of a sentence. This detector decides when a partial has become a complete
//! utterance that the dialogue engine should answer.
//!
//! ## State machine:
//! `Idle → Accumulating → Completed`, and back to `Accumulating` whenever new text arrives.
//! - An event with the end flag completes immediately and clears any pending deadline
//! - A partial whose text differs from the last seen text (re)arms the deadline
//! - A partial with unchanged text leaves the deadline where it is
//! - Reaching the deadline with unchanged text completes the utterance
//!
//! ## No timers:
//! The detector never spawns anything. It exposes `deadline()` and the owning
//! task sleeps until then and calls `on_timeout`. Clearing the deadline is how a
//! pending completion is cancelled, so a stale wake-up is always a no-op.

use crate::config::BoundaryConfig;
use crate::recognition::RecognitionEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryState {
    Idle,
    Accumulating,
    Completed,
}

/// How an utterance was completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    /// The recognizer flagged the sentence end
    EndFlag,
    /// The text stayed unchanged for the sentence timeout
    Timeout,
}

/// A complete customer utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Utterance {
    pub text: String,
    pub confidence: f32,
    /// Always true: nothing further will be added to this utterance
    pub is_final: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "arrival_latency_ms", serialize_with = "serialize_millis")]
    pub arrival_latency: Duration,
    pub completion: Completion,
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
}

pub struct UtteranceBoundaryDetector {
    config: BoundaryConfig,
    state: BoundaryState,
    /// Trimmed text of the latest partial in the current cycle
    last_text: String,
    last_confidence: Option<f32>,
    /// When the current text will be considered complete
    deadline: Option<Instant>,
    /// Text of the last completed utterance, to ignore the recognizer repeating it
    completed_text: Option<String>,
}

impl UtteranceBoundaryDetector {
    pub fn new(config: BoundaryConfig) -> Self {
        Self {
            config,
            state: BoundaryState::Idle,
            last_text: String::new(),
            last_confidence: None,
            deadline: None,
            completed_text: None,
        }
    }

    pub fn state(&self) -> BoundaryState {
        self.state
    }

    /// Instant at which `on_timeout` should be called, if a completion is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Feed one recognition event.
    ///
    /// ## Parameters:
    /// - **now**: arrival time of the event
    /// - **latency**: arrival latency to stamp on an utterance completed by this event
    ///
    /// ## Returns:
    /// The completed utterance when this event ends a sentence and passes the
    /// acceptance gate.
    pub fn on_event(&mut self, event: RecognitionEvent, now: Instant, latency: Duration) -> Option<Utterance> {
        let text = event.text.trim();

        if self.state == BoundaryState::Completed {
            if self.completed_text.as_deref() == Some(text) {
                debug!(text = %text, "Ignoring repeat of completed utterance");
                return None;
            }
            self.begin_cycle();
        }

        if event.is_final {
            // A flagged end supersedes any pending timeout
            self.deadline = None;
            if text.is_empty() {
                self.begin_cycle();
                return None;
            }
            self.last_text = text.to_string();
            self.last_confidence = event.confidence;
            return self.complete(Completion::EndFlag, latency);
        }

        if text.is_empty() {
            return None;
        }

        if text != self.last_text {
            self.last_text = text.to_string();
            self.deadline = Some(now + self.config.sentence_timeout());
        }
        if event.confidence.is_some() {
            self.last_confidence = event.confidence;
        }
        self.state = BoundaryState::Accumulating;
        None
    }

    /// Complete the pending utterance if its deadline has passed.
    ///
    /// Calling this without a pending deadline, or before it, does nothing.
    pub fn on_timeout(&mut self, now: Instant, latency: Duration) -> Option<Utterance> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.complete(Completion::Timeout, latency)
            }
            _ => None,
        }
    }

    /// Drop any partial state, e.g. when recognition is restarted.
    pub fn reset(&mut self) {
        self.begin_cycle();
        self.completed_text = None;
    }

    fn begin_cycle(&mut self) {
        self.state = BoundaryState::Idle;
        self.last_text.clear();
        self.last_confidence = None;
        self.deadline = None;
    }

    fn complete(&mut self, completion: Completion, latency: Duration) -> Option<Utterance> {
        let text = std::mem::take(&mut self.last_text);
        let confidence = self.last_confidence.take().unwrap_or(self.config.default_confidence);

        self.state = BoundaryState::Completed;
        self.completed_text = Some(text.clone());

        if text.is_empty() || confidence < self.config.min_confidence {
            info!(
                text = %text,
                confidence = confidence,
                "Utterance rejected by acceptance gate"
            );
            return None;
        }

        Some(Utterance {
            text,
            confidence,
            is_final: true,
            timestamp: Utc::now(),
            arrival_latency: latency,
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LATENCY: Duration = Duration::from_millis(120);

    fn detector() -> UtteranceBoundaryDetector {
        UtteranceBoundaryDetector::new(BoundaryConfig {
            sentence_timeout_ms: 2000,
            min_confidence: 0.3,
            default_confidence: 0.8,
        })
    }

    #[test]
    fn test_end_flag_completes_immediately() {
        let mut detector = detector();
        let now = Instant::now();

        let utterance = detector
            .on_event(RecognitionEvent::final_result("我现在没有钱还款", Some(0.9)), now, LATENCY)
            .unwrap();

        assert_eq!(utterance.text, "我现在没有钱还款");
        assert_eq!(utterance.confidence, 0.9);
        assert_eq!(utterance.completion, Completion::EndFlag);
        assert_eq!(utterance.arrival_latency, LATENCY);
        assert_eq!(detector.state(), BoundaryState::Completed);
        assert!(detector.deadline().is_none());
    }

    #[test]
    fn test_unchanged_partials_fire_exactly_once() {
        let mut detector = detector();
        let start = Instant::now();

        for offset in [0u64, 500, 1000, 1500] {
            let at = start + Duration::from_millis(offset);
            assert!(detector.on_event(RecognitionEvent::partial("你好", Some(0.7)), at, LATENCY).is_none());
        }
        // Identical text does not push the deadline out
        assert_eq!(detector.deadline(), Some(start + Duration::from_millis(2000)));

        assert!(detector.on_timeout(start + Duration::from_millis(1999), LATENCY).is_none());
        let utterance = detector.on_timeout(start + Duration::from_millis(2000), LATENCY).unwrap();
        assert_eq!(utterance.completion, Completion::Timeout);
        assert_eq!(utterance.text, "你好");

        assert!(detector.on_timeout(start + Duration::from_millis(5000), LATENCY).is_none());
    }

    #[test]
    fn test_changed_text_rearms_deadline() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_event(RecognitionEvent::partial("我", None), start, LATENCY);
        let later = start + Duration::from_millis(1500);
        detector.on_event(RecognitionEvent::partial("我想", None), later, LATENCY);

        assert_eq!(detector.deadline(), Some(later + Duration::from_millis(2000)));
        assert!(detector.on_timeout(start + Duration::from_millis(2000), LATENCY).is_none());
        assert!(detector.on_timeout(later + Duration::from_millis(2000), LATENCY).is_some());
    }

    #[test]
    fn test_end_flag_cancels_pending_timeout() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_event(RecognitionEvent::partial("我现在", Some(0.6)), start, LATENCY);
        assert!(detector.deadline().is_some());

        let flagged = start + Duration::from_millis(800);
        assert!(detector
            .on_event(RecognitionEvent::final_result("我现在没有钱", Some(0.9)), flagged, LATENCY)
            .is_some());

        assert!(detector.deadline().is_none());
        assert!(detector.on_timeout(start + Duration::from_secs(10), LATENCY).is_none());
    }

    #[test]
    fn test_missing_confidence_defaults_instead_of_rejecting() {
        let mut detector = detector();
        let utterance = detector
            .on_event(RecognitionEvent::final_result("可以", None), Instant::now(), LATENCY)
            .unwrap();
        assert_eq!(utterance.confidence, 0.8);
    }

    #[test]
    fn test_gate_rejects_low_confidence_and_blank_text() {
        let mut detector = detector();
        let now = Instant::now();

        assert!(detector.on_event(RecognitionEvent::final_result("嗯", Some(0.2)), now, LATENCY).is_none());
        assert!(detector.on_event(RecognitionEvent::final_result("   ", Some(0.9)), now, LATENCY).is_none());

        // Blank partials never arm the timer
        detector.on_event(RecognitionEvent::partial("  ", Some(0.9)), now, LATENCY);
        assert!(detector.deadline().is_none());

        // Exactly at the threshold is accepted
        assert!(detector.on_event(RecognitionEvent::final_result("好的", Some(0.3)), now, LATENCY).is_some());
    }

    #[test]
    fn test_repeat_of_completed_text_is_ignored() {
        let mut detector = detector();
        let start = Instant::now();

        detector.on_event(RecognitionEvent::partial("我明天还", Some(0.9)), start, LATENCY);
        assert!(detector.on_timeout(start + Duration::from_secs(2), LATENCY).is_some());

        // The recognizer confirms the same sentence after our timeout
        let late = start + Duration::from_millis(2300);
        assert!(detector
            .on_event(RecognitionEvent::final_result("我明天还", Some(0.95)), late, LATENCY)
            .is_none());
        assert!(detector.deadline().is_none());

        // A new sentence starts a new cycle
        assert!(detector
            .on_event(RecognitionEvent::final_result("好的谢谢", Some(0.9)), late, LATENCY)
            .is_some());
    }
}
