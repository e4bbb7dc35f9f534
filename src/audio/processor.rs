//! # Inbound Audio Preparation
//!
//! Turns transport frames into the payload the recognition channel expects.
//! Each call declares its source format once; every frame of that call is then
//! validated and converted the same way.
//!
//! ## Conversions:
//! - **G.711 (A-law, µ-law, or unknown law)**: decoded to PCM16 at 8 kHz and
//!   wrapped in a WAV container per frame
//! - **Opus in a container**: passed through untouched at 48 kHz
//! - **PCM16**: validated and passed through at the declared rate
//! - **WAV**: unwrapped to raw PCM16 after checking the header matches the declared rate

use crate::audio::codec::{self, G711Law};
use crate::error::{VoiceError, VoiceResult};
use crate::recognition::RecognitionEncoding;
use serde::Serialize;
use std::fmt;

/// Telephony sample rate for every G.711 source.
pub const G711_SAMPLE_RATE: u32 = 8000;

/// Browser Opus capture rate.
pub const OPUS_SAMPLE_RATE: u32 = 48000;

/// Format of the audio a transport delivers for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "codec", rename_all = "snake_case")]
pub enum InboundFormat {
    #[default]
    G711Alaw,
    G711Mulaw,
    /// G.711 of unknown law: A-law first, µ-law as fallback
    G711,
    Opus,
    Pcm16 { sample_rate: u32 },
    Wav { sample_rate: u32 },
}

impl InboundFormat {
    /// Parse the format names used by transports (`alaw`, `pcma`, `mulaw`, `pcmu`,
    /// `g711`, `opus`, `webm`, `pcm16`, `pcm`, `wav`).
    ///
    /// `sample_rate` only matters for PCM and WAV, where it defaults to 16 kHz.
    pub fn parse(name: &str, sample_rate: Option<u32>) -> VoiceResult<Self> {
        let rate = sample_rate.unwrap_or(16000);
        let format = match name.trim().to_ascii_lowercase().as_str() {
            "alaw" | "pcma" | "g711a" | "g711_alaw" => InboundFormat::G711Alaw,
            "mulaw" | "ulaw" | "pcmu" | "g711u" | "g711_mulaw" => InboundFormat::G711Mulaw,
            "g711" => InboundFormat::G711,
            "opus" | "webm" | "ogg" => InboundFormat::Opus,
            "pcm" | "pcm16" | "s16le" => InboundFormat::Pcm16 { sample_rate: rate },
            "wav" => InboundFormat::Wav { sample_rate: rate },
            other => return Err(VoiceError::Format(format!("unsupported audio format '{}'", other))),
        };

        if let InboundFormat::Pcm16 { sample_rate: 0 } | InboundFormat::Wav { sample_rate: 0 } = format {
            return Err(VoiceError::Format("sample rate must be greater than 0".to_string()));
        }
        Ok(format)
    }

    /// Sample rate the recognizer must be opened with.
    pub fn recognition_sample_rate(&self) -> u32 {
        match self {
            InboundFormat::G711Alaw | InboundFormat::G711Mulaw | InboundFormat::G711 => G711_SAMPLE_RATE,
            InboundFormat::Opus => OPUS_SAMPLE_RATE,
            InboundFormat::Pcm16 { sample_rate } | InboundFormat::Wav { sample_rate } => *sample_rate,
        }
    }

    /// Encoding of the payloads produced by `InboundAudioProcessor::prepare`.
    pub fn recognition_encoding(&self) -> RecognitionEncoding {
        match self {
            InboundFormat::G711Alaw | InboundFormat::G711Mulaw | InboundFormat::G711 => RecognitionEncoding::Wav,
            InboundFormat::Opus => RecognitionEncoding::Opus,
            InboundFormat::Pcm16 { .. } | InboundFormat::Wav { .. } => RecognitionEncoding::Pcm,
        }
    }
}

impl fmt::Display for InboundFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundFormat::G711Alaw => write!(f, "alaw/8000"),
            InboundFormat::G711Mulaw => write!(f, "mulaw/8000"),
            InboundFormat::G711 => write!(f, "g711/8000"),
            InboundFormat::Opus => write!(f, "opus/48000"),
            InboundFormat::Pcm16 { sample_rate } => write!(f, "pcm16/{}", sample_rate),
            InboundFormat::Wav { sample_rate } => write!(f, "wav/{}", sample_rate),
        }
    }
}

/// Per-call converter from transport frames to recognizer payloads.
///
/// ## Statistics:
/// Tracks frames accepted and rejected so the call status endpoint can show
/// whether the transport is sending something sensible.
#[derive(Debug)]
pub struct InboundAudioProcessor {
    format: InboundFormat,
    frames_accepted: u64,
    frames_rejected: u64,
    bytes_received: u64,
}

impl InboundAudioProcessor {
    pub fn new(format: InboundFormat) -> Self {
        Self {
            format,
            frames_accepted: 0,
            frames_rejected: 0,
            bytes_received: 0,
        }
    }

    pub fn format(&self) -> InboundFormat {
        self.format
    }

    /// Validate and convert one inbound frame.
    ///
    /// ## Returns:
    /// - **Ok(bytes)**: payload ready for `RecognitionChannel::send`
    /// - **Err(VoiceError::Format)**: the frame must be dropped; the call continues
    pub fn prepare(&mut self, frame: &[u8]) -> VoiceResult<Vec<u8>> {
        self.bytes_received += frame.len() as u64;
        match self.convert(frame) {
            Ok(payload) => {
                self.frames_accepted += 1;
                Ok(payload)
            }
            Err(err) => {
                self.frames_rejected += 1;
                Err(err)
            }
        }
    }

    fn convert(&self, frame: &[u8]) -> VoiceResult<Vec<u8>> {
        if frame.is_empty() {
            return Err(VoiceError::Format("empty audio frame".to_string()));
        }

        match self.format {
            InboundFormat::G711Alaw => {
                let samples = codec::decode_g711(frame, G711Law::ALaw)?;
                Ok(codec::wrap_container(&samples, G711_SAMPLE_RATE, 1))
            }
            InboundFormat::G711Mulaw => {
                let samples = codec::decode_g711(frame, G711Law::MuLaw)?;
                Ok(codec::wrap_container(&samples, G711_SAMPLE_RATE, 1))
            }
            InboundFormat::G711 => {
                let (samples, _law) = codec::decode_g711_auto(frame)?;
                Ok(codec::wrap_container(&samples, G711_SAMPLE_RATE, 1))
            }
            InboundFormat::Opus => Ok(frame.to_vec()),
            InboundFormat::Pcm16 { .. } => {
                // Parsing proves the frame is whole samples
                codec::pcm_bytes_to_samples(frame)?;
                Ok(frame.to_vec())
            }
            InboundFormat::Wav { sample_rate } => {
                let (info, samples) = codec::unwrap_container(frame)?;
                if info.sample_rate != sample_rate {
                    return Err(VoiceError::Format(format!(
                        "WAV sample rate mismatch: expected {}, got {}",
                        sample_rate, info.sample_rate
                    )));
                }
                if info.channels != 1 {
                    return Err(VoiceError::Format(format!(
                        "WAV must be mono, got {} channels",
                        info.channels
                    )));
                }
                Ok(codec::samples_to_pcm_bytes(&samples))
            }
        }
    }

    pub fn stats(&self) -> InboundStats {
        InboundStats {
            format: self.format.to_string(),
            frames_accepted: self.frames_accepted,
            frames_rejected: self.frames_rejected,
            bytes_received: self.bytes_received,
        }
    }
}

/// Snapshot of inbound frame counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundStats {
    pub format: String,
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub bytes_received: u64,
}
