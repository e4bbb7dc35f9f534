//! # Offline Providers
//!
//! Stand-ins for the cloud recognition and synthesis services so the server can
//! run end to end without vendor credentials. Calls connect, audio flows in and
//! out with the right framing and pacing, but nothing is actually recognized
//! and replies are spoken as silence.

use crate::call::CallServices;
use crate::config::AppConfig;
use crate::dialogue::http::HttpDialogueEngine;
use crate::dialogue::DialogueEngine;
use crate::error::VoiceResult;
use crate::recognition::{RecognitionChannel, RecognitionEvent, RecognitionParams, RecognitionService};
use crate::synthesis::{PcmStream, SynthesisService, VoiceParams};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Services used by calls started on this server.
///
/// Recognition and synthesis run offline; the dialogue engine is the HTTP one
/// when an endpoint is configured.
pub fn build_services(config: &AppConfig) -> CallServices {
    let dialogue = HttpDialogueEngine::from_config(&config.dialogue)
        .map(|engine| Arc::new(engine) as Arc<dyn DialogueEngine>);

    match &dialogue {
        Some(_) => info!(model = %config.dialogue.model, "Dialogue engine configured"),
        None => warn!("No dialogue endpoint configured, every reply will be the fallback text"),
    }

    CallServices {
        recognizer: Arc::new(OfflineRecognizer),
        synthesizer: Arc::new(SilenceSynthesizer::new(config.tts.source_sample_rate)),
        dialogue,
    }
}

/// Accepts every frame and never produces a result.
#[derive(Debug, Default, Clone)]
pub struct OfflineRecognizer;

#[async_trait]
impl RecognitionService for OfflineRecognizer {
    async fn open(
        &self,
        params: &RecognitionParams,
        _events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> VoiceResult<Box<dyn RecognitionChannel>> {
        debug!(
            session_id = %params.session_id,
            sample_rate = params.sample_rate,
            "Opening offline recognition channel"
        );
        Ok(Box::new(OfflineChannel { frames: 0 }))
    }
}

struct OfflineChannel {
    frames: u64,
}

#[async_trait]
impl RecognitionChannel for OfflineChannel {
    async fn send(&mut self, _frame: &[u8]) -> VoiceResult<()> {
        self.frames += 1;
        Ok(())
    }

    async fn close(&mut self) -> VoiceResult<()> {
        debug!(frames = self.frames, "Offline recognition channel closed");
        Ok(())
    }
}

/// Time spent per character of text
const SPEECH_PER_CHAR: Duration = Duration::from_millis(200);
const MAX_SPEECH: Duration = Duration::from_secs(15);
const CHUNK: Duration = Duration::from_millis(100);

/// Produces silence lasting roughly as long as the text would take to say.
#[derive(Debug, Clone)]
pub struct SilenceSynthesizer {
    sample_rate: u32,
}

impl SilenceSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn speech_duration(text: &str) -> Duration {
        (SPEECH_PER_CHAR * text.chars().count() as u32).min(MAX_SPEECH)
    }
}

#[async_trait]
impl SynthesisService for SilenceSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> VoiceResult<PcmStream> {
        let duration = Self::speech_duration(text);
        let chunk_bytes = (self.sample_rate as u128 * CHUNK.as_millis() / 1000) as usize * 2;
        let chunks = (duration.as_millis() / CHUNK.as_millis()) as usize;

        debug!(voice = %voice.voice, chars = text.chars().count(), chunks, "Synthesizing offline silence");
        Ok(stream::iter((0..chunks).map(move |_| Ok(vec![0u8; chunk_bytes]))).boxed())
    }
}
