//! Scripted stand-ins for the recognition, synthesis and dialogue services.

use crate::call::CallServices;
use crate::dialogue::{DialogueEngine, DialogueReply, DialogueRequest};
use crate::error::{VoiceError, VoiceResult};
use crate::recognition::{
    RecognitionChannel, RecognitionEncoding, RecognitionEvent, RecognitionParams, RecognitionService,
};
use crate::synthesis::{PcmStream, SynthesisService, VoiceParams};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// PCM16 little-endian sawtooth, `samples` long.
pub fn pcm_tone(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| (((i % 40) as i16 - 20) * 500).to_le_bytes())
        .collect()
}

/// Poll `condition` on the (usually paused) clock until it holds or `limit` passes.
pub async fn wait_for(condition: impl Fn() -> bool, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Services that never leave the process.
pub fn scripted_services() -> CallServices {
    CallServices {
        recognizer: Arc::new(ScriptedRecognizer::new()),
        synthesizer: Arc::new(ScriptedSynthesizer::new()),
        dialogue: Some(Arc::new(ScriptedDialogue::new())),
    }
}

#[derive(Default)]
struct RecognizerState {
    opens: usize,
    closes: usize,
    frames: Vec<Vec<u8>>,
    fail_sends: usize,
    fail_opens: usize,
    events: Option<mpsc::UnboundedSender<RecognitionEvent>>,
}

#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    state: Arc<Mutex<RecognizerState>>,
}

impl ScriptedRecognizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(call_id: &str) -> RecognitionParams {
        RecognitionParams {
            session_id: call_id.to_string(),
            model: "paraformer-realtime-v2".to_string(),
            sample_rate: 8000,
            encoding: RecognitionEncoding::Wav,
            max_sentence_silence_ms: 1500,
            semantic_punctuation: true,
            heartbeat: true,
        }
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.state.lock().unwrap().fail_sends = count;
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().fail_opens = count;
    }

    /// Push a result as the recognizer would; false if no channel was ever opened.
    pub fn emit(&self, event: RecognitionEvent) -> bool {
        match &self.state.lock().unwrap().events {
            Some(events) => events.send(event).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RecognitionService for ScriptedRecognizer {
    async fn open(
        &self,
        _params: &RecognitionParams,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Box<dyn RecognitionChannel>> {
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(VoiceError::Transport("scripted open failure".to_string()));
        }
        state.events = Some(events);
        Ok(Box::new(ScriptedChannel { state: self.state.clone() }))
    }
}

struct ScriptedChannel {
    state: Arc<Mutex<RecognizerState>>,
}

#[async_trait]
impl RecognitionChannel for ScriptedChannel {
    async fn send(&mut self, frame: &[u8]) -> VoiceResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends > 0 {
            state.fail_sends -= 1;
            return Err(VoiceError::Transport("scripted send failure".to_string()));
        }
        state.frames.push(frame.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> VoiceResult<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// What the scripted synthesizer does for one request.
pub enum SynthesisScript {
    Chunks(Vec<Vec<u8>>),
    /// A stream that ends without any audio
    Empty,
    /// The request itself is rejected
    Fail,
    /// The chunks, then a stream error
    FailAfter(Vec<Vec<u8>>),
    /// A stream that never yields
    Stall,
}

#[derive(Default)]
struct SynthesizerState {
    scripts: VecDeque<SynthesisScript>,
    requests: Vec<String>,
}

/// Unscripted requests get 200 ms of audio.
#[derive(Clone, Default)]
pub struct ScriptedSynthesizer {
    state: Arc<Mutex<SynthesizerState>>,
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: SynthesisScript) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl SynthesisService for ScriptedSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &VoiceParams) -> VoiceResult<PcmStream> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(text.to_string());
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| SynthesisScript::Chunks(vec![pcm_tone(4800)]))
        };

        match script {
            SynthesisScript::Chunks(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok)).boxed()),
            SynthesisScript::Empty => Ok(stream::empty().boxed()),
            SynthesisScript::Fail => Err(VoiceError::Transport("scripted synthesis failure".to_string())),
            SynthesisScript::FailAfter(chunks) => Ok(stream::iter(chunks.into_iter().map(Ok))
                .chain(stream::once(async {
                    Err(VoiceError::Transport("scripted stream failure".to_string()))
                }))
                .boxed()),
            SynthesisScript::Stall => Ok(stream::pending().boxed()),
        }
    }
}

pub enum DialogueScript {
    Reply(String),
    Fail,
    /// Reply after a delay
    Slow(Duration, String),
}

#[derive(Default)]
struct DialogueState {
    scripts: VecDeque<DialogueScript>,
    requests: Vec<DialogueRequest>,
}

/// Unscripted requests get a fixed reply.
#[derive(Clone, Default)]
pub struct ScriptedDialogue {
    state: Arc<Mutex<DialogueState>>,
}

pub const DEFAULT_REPLY: &str = "理解您的情况，我们可以商量一个分期还款方案。";

impl ScriptedDialogue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: DialogueScript) {
        self.state.lock().unwrap().scripts.push_back(script);
    }

    pub fn requests(&self) -> Vec<DialogueRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

#[async_trait]
impl DialogueEngine for ScriptedDialogue {
    async fn respond(&self, request: &DialogueRequest) -> VoiceResult<DialogueReply> {
        let script = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(request.clone());
            state
                .scripts
                .pop_front()
                .unwrap_or_else(|| DialogueScript::Reply(DEFAULT_REPLY.to_string()))
        };

        match script {
            DialogueScript::Reply(text) => Ok(DialogueReply { text }),
            DialogueScript::Fail => Err(VoiceError::Dialogue("scripted failure".to_string())),
            DialogueScript::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(DialogueReply { text })
            }
        }
    }
}
