//! # Call Session
//!
//! Orchestrates one call: audio in, recognized utterances to the dialogue
//! engine, synthesized replies out.
//!
//! ## Tasks per call:
//! - **Ingestion**: drains the bounded inbound queue, converts each frame and
//!   hands it to the `AsrSessionManager` (which may pause to reconnect)
//! - **Turns**: consumes recognition events, drives the boundary detector and
//!   runs the greeting and every reply turn
//!
//! The two never wait on each other, so playback pacing cannot delay frames to
//! the recognizer and a recognizer reconnect cannot stall playback.
//!
//! ## Ending a call:
//! `end_call` marks the call `Ended`, cancels the shared token and waits for both
//! tasks. Cancellation stops frame emission at the next frame, drops any pending
//! boundary deadline and closes the recognition channel.

use crate::audio::processor::{InboundAudioProcessor, InboundFormat, InboundStats};
use crate::audio::AudioChunk;
use crate::call::{
    CallCounters, CallEvent, CallOptions, CallServices, CallSnapshot, CallState, CallSummary,
};
use crate::config::{AppConfig, DialogueConfig};
use crate::dialogue::{build_greeting, CustomerProfile, DialogueEngine, DialogueRequest, DialogueTurn, Speaker};
use crate::error::{VoiceError, VoiceResult};
use crate::recognition::boundary::{Utterance, UtteranceBoundaryDetector};
use crate::recognition::manager::{AsrSessionManager, AsrState, AsrStatus, ReconnectPolicy};
use crate::recognition::{LatencyProbe, RecognitionEvent, RecognitionParams};
use crate::synthesis::streamer::TtsStreamer;
use crate::synthesis::VoiceParams;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum IngestMessage {
    Audio(Vec<u8>),
    ResetAsr,
}

/// What happened to a frame handed to `push_audio`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameDisposition {
    Queued,
    /// The inbound queue was full; the frame was dropped
    DroppedQueueFull,
    /// Recognition has failed permanently and is waiting for an operator reset
    RefusedHandoff,
}

struct IngestSnapshot {
    asr: AsrStatus,
    inbound: InboundStats,
}

struct Activity {
    at: Instant,
    wall: DateTime<Utc>,
}

/// State shared by the session handle and its tasks.
struct CallShared {
    call_id: String,
    customer_phone: Option<String>,
    format: InboundFormat,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<CallState>,
    end_reason: Mutex<Option<String>>,
    last_activity: Mutex<Activity>,
    history: Mutex<Vec<DialogueTurn>>,
    ingest: Mutex<IngestSnapshot>,
    handoff_required: AtomicBool,
    fallback_replies: AtomicU64,
    queue_drops: AtomicU64,
    events: broadcast::Sender<CallEvent>,
    counters: Arc<CallCounters>,
}

impl CallShared {
    fn state(&self) -> CallState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `to`; false once the call has ended.
    fn transition(&self, to: CallState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        if from == CallState::Ended {
            return false;
        }
        if from != to {
            *state = to;
            debug!(call_id = %self.call_id, from = from.as_str(), to = to.as_str(), "Call state changed");
            let _ = self.events.send(CallEvent::StateChanged { from, to });
        }
        drop(state);
        self.touch();
        true
    }

    /// Publish an event unless the call has ended.
    fn publish(&self, event: CallEvent) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != CallState::Ended {
            let _ = self.events.send(event);
        }
    }

    /// Enter `Ended`, publishing the final event. False if already ended.
    fn end(&self, reason: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == CallState::Ended {
            return false;
        }
        *state = CallState::Ended;
        *self.end_reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.to_string());
        let _ = self.events.send(CallEvent::Ended { reason: reason.to_string() });
        true
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) =
            Activity { at: Instant::now(), wall: Utc::now() };
    }

    fn history(&self) -> Vec<DialogueTurn> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn append_turn(&self, turn: DialogueTurn) {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != CallState::Ended {
            self.history.lock().unwrap_or_else(PoisonError::into_inner).push(turn);
        }
    }

    fn record_ingest(&self, asr: AsrStatus, inbound: InboundStats) {
        *self.ingest.lock().unwrap_or_else(PoisonError::into_inner) = IngestSnapshot { asr, inbound };
    }

    fn flag_handoff(&self, cause: &VoiceError) {
        if self.handoff_required.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(call_id = %self.call_id, error = %cause, "Recognition exhausted, call needs a human agent");
        CallCounters::bump(&self.counters.asr_exhaustions);
        self.publish(CallEvent::Failure { error: cause.to_string(), handoff_required: true });
    }
}

/// Handle to one live call.
pub struct CallSession {
    shared: Arc<CallShared>,
    inbound: mpsc::Sender<IngestMessage>,
    audio_out: broadcast::Sender<AudioChunk>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CallSession {
    /// Start a call: spawn its ingestion and turn tasks and begin the greeting.
    ///
    /// ## Parameters:
    /// - **config**: snapshot used for the whole call; later config updates do not affect it
    /// - **counters**: process-wide counters this call reports into
    pub fn start(
        call_id: String,
        options: CallOptions,
        services: &CallServices,
        config: &AppConfig,
        counters: Arc<CallCounters>,
    ) -> Self {
        let performance = &config.performance;
        let (events, _) = broadcast::channel(performance.event_queue_size.max(1));
        let (audio_out, _) = broadcast::channel(performance.outbound_queue_frames.max(1));
        let (inbound, inbound_rx) = mpsc::channel(performance.inbound_queue_frames.max(1));
        let (recognition_tx, recognition_rx) = mpsc::unbounded_channel();

        let format = options.format;
        let params = RecognitionParams {
            session_id: call_id.clone(),
            model: config.asr.model.clone(),
            sample_rate: format.recognition_sample_rate(),
            encoding: format.recognition_encoding(),
            max_sentence_silence_ms: config.asr.max_sentence_silence_ms,
            semantic_punctuation: config.asr.semantic_punctuation,
            heartbeat: config.asr.heartbeat,
        };
        let probe = LatencyProbe::default();
        let asr = AsrSessionManager::new(
            services.recognizer.clone(),
            params,
            ReconnectPolicy::from(&config.asr),
            recognition_tx,
            probe.clone(),
        );
        let processor = InboundAudioProcessor::new(format);

        let shared = Arc::new(CallShared {
            call_id: call_id.clone(),
            customer_phone: options.customer_phone.clone(),
            format,
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(CallState::Created),
            end_reason: Mutex::new(None),
            last_activity: Mutex::new(Activity { at: Instant::now(), wall: Utc::now() }),
            history: Mutex::new(Vec::new()),
            ingest: Mutex::new(IngestSnapshot { asr: asr.status(), inbound: processor.stats() }),
            handoff_required: AtomicBool::new(false),
            fallback_replies: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            events,
            counters,
        });
        CallCounters::bump(&shared.counters.calls_started);

        let cancel = CancellationToken::new();
        let context = Arc::new(TurnContext {
            shared: shared.clone(),
            dialogue: services.dialogue.clone(),
            config: config.dialogue.clone(),
            voice: options.voice.unwrap_or_else(|| config.voice.clone()),
            profile: options.profile,
            audio_out: audio_out.clone(),
            cancel: cancel.clone(),
        });
        let streamer = TtsStreamer::new(services.synthesizer.clone(), config.tts.clone());
        let detector = UtteranceBoundaryDetector::new(config.boundary.clone());

        let ingestion = tokio::spawn(run_ingestion(shared.clone(), asr, processor, inbound_rx, cancel.clone()));
        let turns = tokio::spawn(run_turns(context, streamer, detector, recognition_rx, probe));

        info!(
            call_id = %call_id,
            format = %format,
            outbound = %config.tts.target_encoding.as_str(),
            "Call started"
        );

        Self {
            shared,
            inbound,
            audio_out,
            cancel,
            tasks: Mutex::new(vec![ingestion, turns]),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.shared.call_id
    }

    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    pub fn format(&self) -> InboundFormat {
        self.shared.format
    }

    pub fn is_ended(&self) -> bool {
        self.state() == CallState::Ended
    }

    /// Time since the last inbound frame or state change.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let activity = self.shared.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(activity.at)
    }

    /// Outbound frames in the configured telephony codec.
    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioChunk> {
        self.audio_out.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.shared.events.subscribe()
    }

    /// Queue one inbound frame without waiting.
    ///
    /// ## Returns:
    /// - **Ok(disposition)**: whether the frame was queued or dropped
    /// - **Err(CallEnded)**: the call is over
    pub fn push_audio(&self, frame: Vec<u8>) -> VoiceResult<FrameDisposition> {
        if self.is_ended() {
            return Err(VoiceError::CallEnded(self.shared.call_id.clone()));
        }
        if self.shared.handoff_required.load(Ordering::SeqCst) {
            return Ok(FrameDisposition::RefusedHandoff);
        }

        match self.inbound.try_send(IngestMessage::Audio(frame)) {
            Ok(()) => Ok(FrameDisposition::Queued),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let drops = self.shared.queue_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if drops.is_power_of_two() {
                    warn!(call_id = %self.shared.call_id, drops, "Inbound audio queue full, dropping frames");
                }
                Ok(FrameDisposition::DroppedQueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(VoiceError::CallEnded(self.shared.call_id.clone())),
        }
    }

    /// Clear the recognition failure budget and re-enable inbound audio.
    pub async fn reset_asr(&self) -> VoiceResult<()> {
        if self.is_ended() {
            return Err(VoiceError::CallEnded(self.shared.call_id.clone()));
        }
        self.inbound
            .send(IngestMessage::ResetAsr)
            .await
            .map_err(|_| VoiceError::CallEnded(self.shared.call_id.clone()))
    }

    /// End the call and wait for its tasks to stop.
    ///
    /// Calling it again returns the same summary without side effects.
    pub async fn end_call(&self, reason: &str) -> CallSummary {
        if self.shared.end(reason) {
            CallCounters::bump(&self.shared.counters.calls_ended);
            info!(call_id = %self.shared.call_id, reason, "Call ended");
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                error!(call_id = %self.shared.call_id, error = %err, "Call task failed");
            }
        }

        self.summary()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let shared = &self.shared;
        let (last_activity, ingest) = {
            let activity = shared.last_activity.lock().unwrap_or_else(PoisonError::into_inner);
            let ingest = shared.ingest.lock().unwrap_or_else(PoisonError::into_inner);
            (activity.wall, IngestSnapshot { asr: ingest.asr.clone(), inbound: ingest.inbound.clone() })
        };

        CallSnapshot {
            call_id: shared.call_id.clone(),
            state: shared.state(),
            customer_phone: shared.customer_phone.clone(),
            format: shared.format.to_string(),
            started_at: shared.started_at,
            last_activity,
            duration_ms: shared.started.elapsed().as_millis() as u64,
            turn_count: shared.history.lock().unwrap_or_else(PoisonError::into_inner).len(),
            handoff_required: shared.handoff_required.load(Ordering::SeqCst),
            outbound_subscribers: self.audio_out.receiver_count(),
            inbound_queue_drops: shared.queue_drops.load(Ordering::Relaxed),
            asr: ingest.asr,
            inbound: ingest.inbound,
        }
    }

    pub fn history(&self) -> Vec<DialogueTurn> {
        self.shared.history()
    }

    fn summary(&self) -> CallSummary {
        let shared = &self.shared;
        let history = shared.history();
        CallSummary {
            call_id: shared.call_id.clone(),
            customer_phone: shared.customer_phone.clone(),
            started_at: shared.started_at,
            ended_at: Utc::now(),
            duration_ms: shared.started.elapsed().as_millis() as u64,
            end_reason: shared
                .end_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default(),
            turn_count: history.len(),
            customer_turns: history.iter().filter(|t| t.speaker == Speaker::Customer).count(),
            fallback_replies: shared.fallback_replies.load(Ordering::Relaxed),
            handoff_required: shared.handoff_required.load(Ordering::SeqCst),
            history,
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        // Tasks must not outlive an abandoned handle
        self.cancel.cancel();
    }
}

async fn run_ingestion(
    shared: Arc<CallShared>,
    mut asr: AsrSessionManager,
    mut processor: InboundAudioProcessor,
    mut inbound: mpsc::Receiver<IngestMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = inbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        match message {
            IngestMessage::Audio(frame) => {
                shared.touch();
                match processor.prepare(&frame) {
                    Ok(payload) => {
                        let result = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            result = asr.send_frame(&payload) => result,
                        };
                        if let Err(err) = result {
                            debug!(call_id = %shared.call_id, error = %err, "Frame not delivered to recognizer");
                            if asr.state() == AsrState::Failed {
                                shared.flag_handoff(&err);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(call_id = %shared.call_id, error = %err, "Dropping malformed audio frame");
                    }
                }
            }
            IngestMessage::ResetAsr => {
                asr.reset().await;
                shared.handoff_required.store(false, Ordering::SeqCst);
                info!(call_id = %shared.call_id, "Recognition re-enabled");
            }
        }

        shared.record_ingest(asr.status(), processor.stats());
    }

    asr.stop().await;
    shared.record_ingest(asr.status(), processor.stats());
    debug!(call_id = %shared.call_id, "Ingestion stopped");
}

type TurnFuture = BoxFuture<'static, TtsStreamer>;

/// Everything a greeting or reply turn needs.
struct TurnContext {
    shared: Arc<CallShared>,
    dialogue: Option<Arc<dyn DialogueEngine>>,
    config: DialogueConfig,
    voice: VoiceParams,
    profile: CustomerProfile,
    audio_out: broadcast::Sender<AudioChunk>,
    cancel: CancellationToken,
}

/// Feed recognition events to the detector and run one turn at a time.
///
/// The turn in flight owns the streamer and hands it back when done; while it
/// runs, events keep flowing into the detector but completed utterances are dropped.
async fn run_turns(
    context: Arc<TurnContext>,
    streamer: TtsStreamer,
    mut detector: UtteranceBoundaryDetector,
    mut recognition: mpsc::UnboundedReceiver<RecognitionEvent>,
    probe: LatencyProbe,
) {
    let mut turn: Option<TurnFuture> = Some(greet(context.clone(), streamer).boxed());
    let mut idle: Option<TtsStreamer> = None;

    loop {
        let deadline = detector.deadline();
        let utterance = tokio::select! {
            biased;
            _ = context.cancel.cancelled() => break,
            streamer = async {
                match turn.as_mut() {
                    Some(running) => running.await,
                    None => std::future::pending().await,
                }
            }, if turn.is_some() => {
                turn = None;
                idle = Some(streamer);
                None
            }
            event = recognition.recv() => {
                let Some(event) = event else { break };
                let now = Instant::now();
                detector.on_event(event, now, probe.latency_at(now))
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let now = Instant::now();
                detector.on_timeout(now, probe.latency_at(now))
            }
        };

        let Some(utterance) = utterance else { continue };
        let state = context.shared.state();
        match idle.take() {
            Some(streamer) if turn.is_none() && state == CallState::Listening => {
                turn = Some(respond(context.clone(), streamer, utterance).boxed());
            }
            other => {
                idle = other;
                info!(
                    call_id = %context.shared.call_id,
                    state = state.as_str(),
                    text = %utterance.text,
                    "Agent is busy, dropping utterance"
                );
            }
        }
    }

    // Dropping the turn stops any speech in progress
    drop(turn);
    debug!(call_id = %context.shared.call_id, "Turn loop stopped");
}

async fn greet(context: Arc<TurnContext>, mut streamer: TtsStreamer) -> TtsStreamer {
    if !context.shared.transition(CallState::Greeting) {
        return streamer;
    }

    let greeting = build_greeting(&context.config.greeting_template, &context.profile);
    context
        .say(&mut streamer, greeting, false, &context.config.unavailable_text)
        .await;

    context.shared.transition(CallState::Listening);
    streamer
}

async fn respond(context: Arc<TurnContext>, mut streamer: TtsStreamer, utterance: Utterance) -> TtsStreamer {
    let shared = &context.shared;
    if !shared.transition(CallState::Processing) {
        return streamer;
    }

    info!(
        call_id = %shared.call_id,
        text = %utterance.text,
        confidence = utterance.confidence,
        latency_ms = utterance.arrival_latency.as_millis() as u64,
        "Customer utterance"
    );
    shared.publish(CallEvent::CustomerUtterance { utterance: utterance.clone() });

    let history = shared.history();
    shared.append_turn(DialogueTurn::customer(utterance.text.clone()));

    let Some((text, fallback)) = context.reply_to(utterance.text, history).await else {
        return streamer;
    };

    if !shared.transition(CallState::Speaking) {
        return streamer;
    }
    let alternative = if fallback { &context.config.unavailable_text } else { &context.config.fallback_text };
    context.say(&mut streamer, text, fallback, alternative).await;

    shared.transition(CallState::Listening);
    streamer
}

impl TurnContext {
    /// Ask the dialogue engine for a reply, falling back on failure or timeout.
    ///
    /// `None` means the call ended while waiting.
    async fn reply_to(&self, utterance: String, history: Vec<DialogueTurn>) -> Option<(String, bool)> {
        let Some(engine) = &self.dialogue else {
            return Some(self.fallback("no dialogue engine configured"));
        };

        let request = DialogueRequest {
            call_id: self.shared.call_id.clone(),
            utterance,
            history,
            profile: self.profile.clone(),
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            outcome = tokio::time::timeout(self.config.timeout(), engine.respond(&request)) => outcome,
        };

        match outcome {
            Ok(Ok(reply)) if !reply.text.trim().is_empty() => {
                info!(
                    call_id = %self.shared.call_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Dialogue reply received"
                );
                Some((reply.text.trim().to_string(), false))
            }
            Ok(Ok(_)) => Some(self.fallback("empty dialogue reply")),
            Ok(Err(err)) => Some(self.fallback(&err.to_string())),
            Err(_) => Some(self.fallback(&VoiceError::Timeout("dialogue reply".to_string()).to_string())),
        }
    }

    fn fallback(&self, reason: &str) -> (String, bool) {
        warn!(call_id = %self.shared.call_id, reason, "Answering with fallback text");
        self.shared.fallback_replies.fetch_add(1, Ordering::Relaxed);
        CallCounters::bump(&self.shared.counters.fallback_replies);
        (self.config.fallback_text.clone(), true)
    }

    /// Speak `text`; if it cannot be synthesized, try `alternative` once.
    async fn say(&self, streamer: &mut TtsStreamer, text: String, fallback: bool, alternative: &str) {
        self.shared.append_turn(DialogueTurn::agent(text.clone()));
        self.shared.publish(CallEvent::AgentText { text: text.clone(), fallback });

        let err = match streamer.speak(&text, &self.voice, &self.audio_out, &self.cancel).await {
            Ok(report) => {
                self.shared.publish(CallEvent::SpeechCompleted { report });
                return;
            }
            Err(VoiceError::Cancelled) => return,
            Err(err) => err,
        };

        warn!(call_id = %self.shared.call_id, error = %err, "Reply could not be spoken");
        CallCounters::bump(&self.shared.counters.speech_failures);
        self.shared.publish(CallEvent::Failure { error: err.to_string(), handoff_required: false });

        if alternative.trim().is_empty() || alternative == text {
            return;
        }

        self.shared.append_turn(DialogueTurn::agent(alternative));
        self.shared.publish(CallEvent::AgentText { text: alternative.to_string(), fallback: true });
        match streamer.speak(alternative, &self.voice, &self.audio_out, &self.cancel).await {
            Ok(report) => self.shared.publish(CallEvent::SpeechCompleted { report }),
            Err(VoiceError::Cancelled) => {}
            Err(err) => {
                error!(call_id = %self.shared.call_id, error = %err, "Fallback speech failed as well");
                CallCounters::bump(&self.shared.counters.speech_failures);
                self.shared.publish(CallEvent::Failure { error: err.to_string(), handoff_required: false });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        pcm_tone, wait_for, DialogueScript, ScriptedDialogue, ScriptedRecognizer, ScriptedSynthesizer,
        SynthesisScript, DEFAULT_REPLY,
    };

    const ALAW_FRAME: [u8; 160] = [0xD5; 160];

    struct Harness {
        session: CallSession,
        recognizer: ScriptedRecognizer,
        synthesizer: ScriptedSynthesizer,
        dialogue: ScriptedDialogue,
        counters: Arc<CallCounters>,
    }

    fn harness(synthesizer: ScriptedSynthesizer, dialogue: ScriptedDialogue) -> Harness {
        let recognizer = ScriptedRecognizer::new();
        let services = CallServices {
            recognizer: Arc::new(recognizer.clone()),
            synthesizer: Arc::new(synthesizer.clone()),
            dialogue: Some(Arc::new(dialogue.clone())),
        };
        let counters = Arc::new(CallCounters::default());
        let session = CallSession::start(
            "call-1".to_string(),
            CallOptions::default(),
            &services,
            &AppConfig::default(),
            counters.clone(),
        );
        Harness { session, recognizer, synthesizer, dialogue, counters }
    }

    fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    async fn wait_listening(session: &CallSession) {
        assert!(wait_for(|| session.state() == CallState::Listening, Duration::from_secs(10)).await);
    }

    /// Push one frame so the recognition channel opens.
    async fn open_recognition(h: &Harness) {
        assert_eq!(h.session.push_audio(ALAW_FRAME.to_vec()).unwrap(), FrameDisposition::Queued);
        assert!(wait_for(|| h.recognizer.frames().len() == 1, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_is_spoken_then_listening() {
        let h = harness(ScriptedSynthesizer::new(), ScriptedDialogue::new());
        let mut audio = h.session.subscribe_audio();

        wait_listening(&h.session).await;

        let greeting = &h.synthesizer.requests()[0];
        assert!(greeting.starts_with("客户您好"));
        assert!(greeting.contains("1万5000元"));
        assert_eq!(drain(&mut audio).len(), 10);

        let history = h.session.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].speaker, Speaker::Agent);
        assert!(h.dialogue.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_utterance_drives_one_full_turn() {
        let h = harness(ScriptedSynthesizer::new(), ScriptedDialogue::new());
        let mut events = h.session.subscribe_events();
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        let mut audio = h.session.subscribe_audio();
        assert!(h.recognizer.emit(RecognitionEvent::final_result("我现在没有钱还款", Some(0.9))));

        assert!(wait_for(|| h.synthesizer.requests().len() == 2, Duration::from_secs(5)).await);
        wait_listening(&h.session).await;

        let requests = h.dialogue.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].utterance, "我现在没有钱还款");
        assert_eq!(requests[0].history.len(), 1);
        assert_eq!(h.synthesizer.requests()[1], DEFAULT_REPLY);
        assert!(!drain(&mut audio).is_empty());

        let transitions: Vec<(CallState, CallState)> = drain(&mut events)
            .into_iter()
            .filter_map(|event| match event {
                CallEvent::StateChanged { from, to } => Some((from, to)),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                (CallState::Created, CallState::Greeting),
                (CallState::Greeting, CallState::Listening),
                (CallState::Listening, CallState::Processing),
                (CallState::Processing, CallState::Speaking),
                (CallState::Speaking, CallState::Listening),
            ]
        );

        let history = h.session.history();
        let speakers: Vec<Speaker> = history.iter().map(|turn| turn.speaker).collect();
        assert_eq!(speakers, vec![Speaker::Agent, Speaker::Customer, Speaker::Agent]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dialogue_timeout_speaks_fallback() {
        let dialogue = ScriptedDialogue::new();
        dialogue.push_script(DialogueScript::Slow(Duration::from_secs(30), "太晚了".to_string()));
        let h = harness(ScriptedSynthesizer::new(), dialogue);
        let mut events = h.session.subscribe_events();
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        h.recognizer.emit(RecognitionEvent::final_result("我现在没有钱还款", Some(0.9)));
        assert!(wait_for(|| h.synthesizer.requests().len() == 2, Duration::from_secs(15)).await);
        wait_listening(&h.session).await;

        let fallback = AppConfig::default().dialogue.fallback_text;
        assert_eq!(h.synthesizer.requests()[1], fallback);
        assert_eq!(h.dialogue.requests().len(), 1);
        assert_eq!(h.counters.snapshot().fallback_replies, 1);
        assert!(drain(&mut events)
            .iter()
            .any(|event| matches!(event, CallEvent::AgentText { text, fallback: true } if *text == fallback)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unspeakable_reply_falls_back_once() {
        let synthesizer = ScriptedSynthesizer::new();
        // Greeting, then three empty attempts for the reply
        synthesizer.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));
        for _ in 0..3 {
            synthesizer.push_script(SynthesisScript::Empty);
        }
        let h = harness(synthesizer, ScriptedDialogue::new());
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        h.recognizer.emit(RecognitionEvent::final_result("可以分期吗", Some(0.9)));
        assert!(wait_for(|| h.synthesizer.requests().len() == 5, Duration::from_secs(15)).await);
        wait_listening(&h.session).await;

        let requests = h.synthesizer.requests();
        assert_eq!(requests[4], AppConfig::default().dialogue.fallback_text);
        assert_eq!(h.counters.snapshot().speech_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_while_speaking_stops_everything() {
        let synthesizer = ScriptedSynthesizer::new();
        synthesizer.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));
        // A four second reply
        synthesizer.push_script(SynthesisScript::Chunks(vec![pcm_tone(96000)]));
        let h = harness(synthesizer, ScriptedDialogue::new());
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        let mut events = h.session.subscribe_events();
        let mut audio = h.session.subscribe_audio();
        h.recognizer.emit(RecognitionEvent::final_result("我现在没有钱还款", Some(0.9)));
        assert!(wait_for(|| h.session.state() == CallState::Speaking, Duration::from_secs(5)).await);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let summary = h.session.end_call("caller_hangup").await;
        assert_eq!(summary.end_reason, "caller_hangup");
        assert_eq!(summary.customer_turns, 1);
        assert_eq!(h.session.state(), CallState::Ended);
        assert_eq!(h.recognizer.close_count(), 1);

        let spoken = drain(&mut audio).len();
        assert!(spoken > 0 && spoken < 200, "{}", spoken);
        let before_end = drain(&mut events);
        assert!(matches!(before_end.last(), Some(CallEvent::Ended { .. })));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut audio).is_empty());
        assert!(drain(&mut events).is_empty());
        assert!(matches!(h.session.push_audio(ALAW_FRAME.to_vec()), Err(VoiceError::CallEnded(_))));

        // Ending twice is harmless
        let again = h.session.end_call("operator").await;
        assert_eq!(again.end_reason, "caller_hangup");
        assert_eq!(h.counters.snapshot().calls_ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_while_speaking_is_dropped() {
        let synthesizer = ScriptedSynthesizer::new();
        synthesizer.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));
        synthesizer.push_script(SynthesisScript::Chunks(vec![pcm_tone(48000)]));
        let h = harness(synthesizer, ScriptedDialogue::new());
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        h.recognizer.emit(RecognitionEvent::final_result("我现在没有钱还款", Some(0.9)));
        assert!(wait_for(|| h.session.state() == CallState::Speaking, Duration::from_secs(5)).await);
        h.recognizer.emit(RecognitionEvent::final_result("喂，你听得到吗", Some(0.9)));

        wait_listening(&h.session).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.dialogue.requests().len(), 1);
        assert_eq!(h.synthesizer.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_completes_after_sentence_timeout() {
        let h = harness(ScriptedSynthesizer::new(), ScriptedDialogue::new());
        wait_listening(&h.session).await;
        open_recognition(&h).await;

        h.recognizer.emit(RecognitionEvent::partial("下个月", Some(0.8)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.recognizer.emit(RecognitionEvent::partial("下个月还", Some(0.8)));

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(h.dialogue.requests().is_empty());

        assert!(wait_for(|| h.dialogue.requests().len() == 1, Duration::from_secs(1)).await);
        assert_eq!(h.dialogue.requests()[0].utterance, "下个月还");
    }

    #[tokio::test(start_paused = true)]
    async fn test_recognition_exhaustion_requires_handoff_until_reset() {
        let h = harness(ScriptedSynthesizer::new(), ScriptedDialogue::new());
        let mut events = h.session.subscribe_events();
        h.recognizer.fail_next_opens(3);

        for _ in 0..3 {
            h.session.push_audio(ALAW_FRAME.to_vec()).unwrap();
            tokio::time::sleep(Duration::from_secs(8)).await;
        }

        assert!(wait_for(|| h.session.snapshot().handoff_required, Duration::from_secs(1)).await);
        assert_eq!(h.session.snapshot().asr.state, AsrState::Failed);
        assert_eq!(h.session.push_audio(ALAW_FRAME.to_vec()).unwrap(), FrameDisposition::RefusedHandoff);
        assert_eq!(h.counters.snapshot().asr_exhaustions, 1);
        assert!(drain(&mut events)
            .iter()
            .any(|event| matches!(event, CallEvent::Failure { handoff_required: true, .. })));

        h.session.reset_asr().await.unwrap();
        assert!(wait_for(|| !h.session.snapshot().handoff_required, Duration::from_secs(1)).await);
        assert_eq!(h.session.push_audio(ALAW_FRAME.to_vec()).unwrap(), FrameDisposition::Queued);
        assert!(wait_for(|| h.recognizer.frames().len() == 1, Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_dropped() {
        let recognizer = ScriptedRecognizer::new();
        let services = CallServices {
            recognizer: Arc::new(recognizer.clone()),
            synthesizer: Arc::new(ScriptedSynthesizer::new()),
            dialogue: None,
        };
        let options = CallOptions {
            format: InboundFormat::Pcm16 { sample_rate: 16000 },
            ..CallOptions::default()
        };
        let session = CallSession::start(
            "call-pcm".to_string(),
            options,
            &services,
            &AppConfig::default(),
            Arc::new(CallCounters::default()),
        );

        session.push_audio(vec![1, 2, 3]).unwrap();
        session.push_audio(vec![1, 2, 3, 4]).unwrap();
        assert!(wait_for(|| recognizer.frames().len() == 1, Duration::from_secs(1)).await);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.inbound.frames_rejected, 1);
        assert_eq!(snapshot.inbound.frames_accepted, 1);
        assert_eq!(snapshot.format, "pcm16/16000");
        session.end_call("test").await;
    }
}
