//! # TTS Streamer
//!
//! Speaks one reply: requests synthesis, converts each PCM chunk to the
//! transport codec and emits fixed frames paced to real time.
//!
//! ## Per chunk:
//! 1. Re-join a byte left over from an odd-length previous chunk
//! 2. Resample from the synthesizer rate to the transport rate (state carried
//!    across chunks, reset for every utterance)
//! 3. Encode (PCM16, A-law or µ-law) and cut into frames
//! 4. Wait until each frame is due, keeping a small lead over playback
//!
//! ## Retries:
//! An attempt that yields no audio (empty stream, error, or no first chunk
//! within the timeout) is retried after a fixed backoff, up to `max_attempts`.
//! Once audio has been emitted the stream is never restarted: a failure mid-way
//! ends the utterance and is reported as truncated.

use crate::audio::buffer::OutboundFrameBuffer;
use crate::audio::codec::{self, G711Law, ResampleState};
use crate::audio::{AudioChunk, AudioEncoding};
use crate::config::TtsConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::synthesis::{PcmStream, SynthesisService, VoiceParams};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of speaking one utterance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpeechReport {
    /// Synthesis requests made, including the successful one
    pub attempts: u32,
    pub chunks_received: u64,
    pub frames_emitted: u64,
    pub audio_duration_ms: u64,
    /// From the start of `speak` to the first audio chunk, retries included
    pub time_to_first_chunk_ms: Option<u64>,
    pub total_time_ms: u64,
    /// The synthesizer failed after audio had already been emitted
    pub truncated: bool,
}

pub struct TtsStreamer {
    service: Arc<dyn SynthesisService>,
    config: TtsConfig,
    encoding: AudioEncoding,
    /// Sequence number of the next outbound frame of this call
    next_sequence: u64,
    last_time_to_first_chunk: Option<Duration>,
}

impl TtsStreamer {
    pub fn new(service: Arc<dyn SynthesisService>, config: TtsConfig) -> Self {
        let encoding = match config.target_encoding {
            AudioEncoding::Alaw => AudioEncoding::Alaw,
            AudioEncoding::Mulaw => AudioEncoding::Mulaw,
            _ => AudioEncoding::Pcm16,
        };
        Self {
            service,
            config,
            encoding,
            next_sequence: 0,
            last_time_to_first_chunk: None,
        }
    }

    pub fn encoding(&self) -> AudioEncoding {
        self.encoding
    }

    /// Time to first chunk of the most recent successful `speak`.
    pub fn last_time_to_first_chunk(&self) -> Option<Duration> {
        self.last_time_to_first_chunk
    }

    /// Synthesize `text` and emit its frames to `sink`.
    ///
    /// ## Returns:
    /// - **Ok(report)**: audio was emitted (possibly truncated)
    /// - **Err(SynthesisUnavailable)**: every attempt produced no audio
    /// - **Err(Cancelled)**: `cancel` fired; nothing further is emitted
    pub async fn speak(
        &mut self,
        text: &str,
        voice: &VoiceParams,
        sink: &broadcast::Sender<AudioChunk>,
        cancel: &CancellationToken,
    ) -> VoiceResult<SpeechReport> {
        if text.trim().is_empty() {
            return Ok(SpeechReport::default());
        }

        let started = Instant::now();
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(VoiceError::Cancelled);
            }

            match self.first_chunk(text, voice, cancel).await {
                Ok(Some((first, rest))) => {
                    let ttfc = started.elapsed();
                    self.last_time_to_first_chunk = Some(ttfc);
                    debug!(attempt, ttfc_ms = ttfc.as_millis() as u64, "First synthesis chunk received");

                    let mut report = self.stream_out(first, rest, sink, cancel).await?;
                    report.attempts = attempt;
                    report.time_to_first_chunk_ms = Some(ttfc.as_millis() as u64);
                    report.total_time_ms = started.elapsed().as_millis() as u64;

                    info!(
                        attempts = attempt,
                        frames = report.frames_emitted,
                        audio_ms = report.audio_duration_ms,
                        ttfc_ms = ttfc.as_millis() as u64,
                        truncated = report.truncated,
                        "Utterance spoken"
                    );
                    return Ok(report);
                }
                Ok(None) => {
                    warn!(attempt, max_attempts, "Synthesis produced no audio");
                }
                Err(VoiceError::Cancelled) => return Err(VoiceError::Cancelled),
                Err(err) => {
                    warn!(attempt, max_attempts, error = %err, "Synthesis attempt failed");
                }
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_backoff()) => {}
                }
            }
        }

        Err(VoiceError::SynthesisUnavailable { attempts: max_attempts })
    }

    /// Request synthesis and wait for its first non-empty chunk.
    ///
    /// `Ok(None)` covers an empty stream and a first-chunk timeout.
    async fn first_chunk(
        &self,
        text: &str,
        voice: &VoiceParams,
        cancel: &CancellationToken,
    ) -> VoiceResult<Option<(Vec<u8>, PcmStream)>> {
        let attempt = async {
            let mut stream = self.service.synthesize(text, voice).await?;
            while let Some(item) = stream.next().await {
                let chunk = item?;
                if !chunk.is_empty() {
                    return Ok(Some((chunk, stream)));
                }
            }
            Ok(None)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            result = tokio::time::timeout(self.config.first_chunk_timeout(), attempt) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.first_chunk_timeout_ms,
                        "Timed out waiting for first synthesis chunk"
                    );
                    Ok(None)
                }
            },
        }
    }

    async fn stream_out(
        &mut self,
        first: Vec<u8>,
        mut rest: PcmStream,
        sink: &broadcast::Sender<AudioChunk>,
        cancel: &CancellationToken,
    ) -> VoiceResult<SpeechReport> {
        let mut emission = Emission {
            frames: OutboundFrameBuffer::new(
                self.encoding,
                self.config.target_sample_rate,
                self.config.frame_duration(),
                self.next_sequence,
            ),
            encoding: self.encoding,
            source_rate: self.config.source_sample_rate,
            target_rate: self.config.target_sample_rate,
            resample: ResampleState::default(),
            carry: None,
            pace_start: Instant::now(),
            lead: self.config.pacing_lead(),
            emitted: Duration::ZERO,
            frames_emitted: 0,
            sink,
            cancel,
        };

        let mut report = SpeechReport::default();
        report.chunks_received = 1;
        let mut outcome = emission.push(&first).await;

        while outcome.is_ok() {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    outcome = Err(VoiceError::Cancelled);
                    break;
                }
                next = rest.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    report.chunks_received += 1;
                    outcome = emission.push(&chunk).await;
                }
                Some(Err(err)) => {
                    warn!(error = %err, "Synthesis stream failed mid-utterance, ending early");
                    report.truncated = true;
                    break;
                }
                None => break,
            }
        }

        if outcome.is_ok() {
            outcome = emission.finish().await;
        }
        self.next_sequence = emission.frames.next_sequence();
        outcome?;

        report.frames_emitted = emission.frames_emitted;
        report.audio_duration_ms = emission.emitted.as_millis() as u64;
        Ok(report)
    }
}

/// Conversion and pacing state of one utterance.
struct Emission<'a> {
    frames: OutboundFrameBuffer,
    encoding: AudioEncoding,
    source_rate: u32,
    target_rate: u32,
    resample: ResampleState,
    /// Odd trailing byte of the previous chunk
    carry: Option<u8>,
    pace_start: Instant,
    lead: Duration,
    emitted: Duration,
    frames_emitted: u64,
    sink: &'a broadcast::Sender<AudioChunk>,
    cancel: &'a CancellationToken,
}

impl Emission<'_> {
    async fn push(&mut self, chunk: &[u8]) -> VoiceResult<()> {
        let mut bytes = Vec::with_capacity(chunk.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(chunk);
        if bytes.len() % 2 != 0 {
            self.carry = bytes.pop();
        }

        let samples = codec::pcm_bytes_to_samples(&bytes)?;
        let (resampled, next) = codec::resample(&samples, self.source_rate, self.target_rate, self.resample);
        self.resample = next;

        let encoded = match self.encoding {
            AudioEncoding::Alaw => codec::encode_g711(&resampled, G711Law::ALaw),
            AudioEncoding::Mulaw => codec::encode_g711(&resampled, G711Law::MuLaw),
            _ => codec::samples_to_pcm_bytes(&resampled),
        };

        for frame in self.frames.push(&encoded) {
            self.emit(frame).await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> VoiceResult<()> {
        match self.frames.flush() {
            Some(frame) => self.emit(frame).await,
            None => Ok(()),
        }
    }

    /// Send one frame once it is due, `lead` ahead of real-time playback.
    async fn emit(&mut self, frame: AudioChunk) -> VoiceResult<()> {
        let due = (self.pace_start + self.emitted)
            .checked_sub(self.lead)
            .unwrap_or(self.pace_start);

        if due > Instant::now() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = tokio::time::sleep_until(due) => {}
            }
        }
        if self.cancel.is_cancelled() {
            return Err(VoiceError::Cancelled);
        }

        self.emitted += frame.duration();
        self.frames_emitted += 1;
        if self.sink.send(frame).is_err() {
            // No transport attached; playback is simply lost
            debug!("No outbound audio subscribers");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::{pcm_tone, SynthesisScript, ScriptedSynthesizer};

    fn streamer(synth: &ScriptedSynthesizer) -> TtsStreamer {
        TtsStreamer::new(Arc::new(synth.clone()), AppConfig::default().tts)
    }

    fn drain(rx: &mut broadcast::Receiver<AudioChunk>) -> Vec<AudioChunk> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_converts_frames_and_paces_output() {
        let synth = ScriptedSynthesizer::new();
        // 480 ms of 24 kHz PCM in three uneven chunks, one of odd length
        let pcm = pcm_tone(11520);
        synth.push_script(SynthesisScript::Chunks(vec![
            pcm[..7001].to_vec(),
            pcm[7001..15000].to_vec(),
            pcm[15000..].to_vec(),
        ]));

        let (tx, mut rx) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let mut streamer = streamer(&synth);
        let started = Instant::now();

        let report = streamer.speak("您好", &VoiceParams::default(), &tx, &cancel).await.unwrap();
        let elapsed = started.elapsed();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 24);
        assert!(frames.iter().all(|f| f.bytes.len() == 160 && f.encoding == AudioEncoding::Alaw));
        assert_eq!(frames.iter().map(|f| f.sequence).collect::<Vec<_>>(), (0..24).collect::<Vec<_>>());
        assert_eq!(report.frames_emitted, 24);
        assert_eq!(report.audio_duration_ms, 480);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.chunks_received, 3);
        assert!(!report.truncated);

        // Real-time pacing with a 100 ms lead
        assert!(elapsed >= Duration::from_millis(350), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(480), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_continues_across_utterances() {
        let synth = ScriptedSynthesizer::new();
        synth.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));
        synth.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));

        let (tx, mut rx) = broadcast::channel(64);
        let cancel = CancellationToken::new();
        let mut streamer = streamer(&synth);

        streamer.speak("一", &VoiceParams::default(), &tx, &cancel).await.unwrap();
        streamer.speak("二", &VoiceParams::default(), &tx, &cancel).await.unwrap();

        let sequences: Vec<u64> = drain(&mut rx).iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_attempts_are_retried_with_backoff() {
        let synth = ScriptedSynthesizer::new();
        synth.push_script(SynthesisScript::Empty);
        synth.push_script(SynthesisScript::Fail);
        synth.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));

        let (tx, _rx) = broadcast::channel(64);
        let mut streamer = streamer(&synth);
        let started = Instant::now();

        let report = streamer
            .speak("请稍等", &VoiceParams::default(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(synth.requests().len(), 3);
        assert!(report.time_to_first_chunk_ms.unwrap() >= 2000);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_report_failure() {
        let synth = ScriptedSynthesizer::new();
        for _ in 0..3 {
            synth.push_script(SynthesisScript::Empty);
        }

        let (tx, mut rx) = broadcast::channel(64);
        let mut streamer = streamer(&synth);
        let result = streamer
            .speak("您好", &VoiceParams::default(), &tx, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(VoiceError::SynthesisUnavailable { attempts: 3 })));
        assert_eq!(synth.requests().len(), 3);
        assert!(drain(&mut rx).is_empty());
        assert!(streamer.last_time_to_first_chunk().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_first_chunk_times_out_and_retries() {
        let synth = ScriptedSynthesizer::new();
        synth.push_script(SynthesisScript::Stall);
        synth.push_script(SynthesisScript::Chunks(vec![pcm_tone(2400)]));

        let (tx, _rx) = broadcast::channel(64);
        let mut streamer = streamer(&synth);
        let report = streamer
            .speak("您好", &VoiceParams::default(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.attempts, 2);
        assert!(report.time_to_first_chunk_ms.unwrap() >= 6000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_failure_truncates_without_retry() {
        let synth = ScriptedSynthesizer::new();
        synth.push_script(SynthesisScript::FailAfter(vec![pcm_tone(2400)]));

        let (tx, mut rx) = broadcast::channel(64);
        let mut streamer = streamer(&synth);
        let report = streamer
            .speak("您好", &VoiceParams::default(), &tx, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.truncated);
        assert_eq!(report.frames_emitted, 5);
        assert_eq!(drain(&mut rx).len(), 5);
        assert_eq!(synth.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_emission() {
        let synth = ScriptedSynthesizer::new();
        // Two seconds of audio
        synth.push_script(SynthesisScript::Chunks(vec![pcm_tone(48000)]));

        let (tx, mut rx) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let mut streamer = streamer(&synth);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            canceller.cancel();
        });

        let result = streamer.speak("很长的回复", &VoiceParams::default(), &tx, &cancel).await;
        assert!(matches!(result, Err(VoiceError::Cancelled)));

        let emitted = drain(&mut rx).len();
        assert!(emitted > 0 && emitted < 100, "{}", emitted);
    }
}
