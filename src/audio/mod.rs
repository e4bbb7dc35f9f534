//! # Audio Processing Module
//!
//! Format conversion between what telephony/browser transports carry and what
//! the recognition and synthesis services speak.
//!
//! ## Key Components:
//! - **codec**: G.711 A-law/µ-law ↔ PCM16, linear resampling, RIFF/WAVE framing
//! - **processor**: turns inbound transport frames into recognizer payloads
//! - **buffer**: cuts synthesized audio into fixed-duration outbound frames
//!
//! ## Audio Format Conventions:
//! - **PCM16**: signed 16-bit little-endian, mono
//! - **G.711**: one byte per sample, 8 kHz
//! - **Opus**: container bytes passed through untouched

pub mod buffer;       // Fixed-duration outbound framing
pub mod codec;        // Codec, resampler and WAV container
pub mod processor;    // Inbound frame preparation

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Encoding of a block of audio bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    Pcm16,
    /// G.711 A-law
    Alaw,
    /// G.711 µ-law
    Mulaw,
    /// Opus inside a container (WebM/Ogg), opaque to us
    Opus,
    /// PCM16 inside a RIFF/WAVE container
    Wav,
}

impl AudioEncoding {
    /// Bytes per mono sample, `None` for compressed or containerised encodings.
    pub fn bytes_per_sample(&self) -> Option<usize> {
        match self {
            AudioEncoding::Pcm16 => Some(2),
            AudioEncoding::Alaw | AudioEncoding::Mulaw => Some(1),
            AudioEncoding::Opus | AudioEncoding::Wav => None,
        }
    }

    /// Byte value that decodes to (near) silence.
    pub fn silence_byte(&self) -> u8 {
        match self {
            AudioEncoding::Alaw => 0xD5,
            AudioEncoding::Mulaw => 0xFF,
            _ => 0x00,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Pcm16 => "pcm16",
            AudioEncoding::Alaw => "alaw",
            AudioEncoding::Mulaw => "mulaw",
            AudioEncoding::Opus => "opus",
            AudioEncoding::Wav => "wav",
        }
    }
}

/// One block of audio travelling through the pipeline.
///
/// Chunks are immutable once built; `sequence` increases monotonically per call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioChunk {
    #[serde(skip_serializing)]
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bit_depth: u16,
    pub sequence: u64,
    pub encoding: AudioEncoding,
}

impl AudioChunk {
    /// Playback duration of this chunk; zero when the encoding is opaque.
    pub fn duration(&self) -> Duration {
        match self.encoding.bytes_per_sample() {
            Some(width) if self.sample_rate > 0 && self.channel_count > 0 => {
                let samples = self.bytes.len() / (width * self.channel_count as usize);
                Duration::from_micros(samples as u64 * 1_000_000 / self.sample_rate as u64)
            }
            _ => Duration::ZERO,
        }
    }
}
