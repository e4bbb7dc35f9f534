//! # Outbound Frame Buffer
//!
//! Telephony transports play audio in fixed-duration frames. Synthesized audio
//! arrives in arbitrarily sized chunks, so this buffer collects encoded bytes
//! and releases them as whole frames.
//!
//! ## Key Features:
//! - **Fixed frames**: `sample_rate × frame_duration × bytes_per_sample` bytes each
//!   (160 bytes for 20 ms of G.711 at 8 kHz, 320 bytes for PCM16)
//! - **Silence padding**: the final partial frame is padded with the codec's silence value
//! - **Sequencing**: every frame gets the next sequence number of the call

use crate::audio::{AudioChunk, AudioEncoding};
use std::collections::VecDeque;
use std::time::Duration;

/// Collects encoded audio and emits fixed-size `AudioChunk` frames.
pub struct OutboundFrameBuffer {
    /// Encoded bytes not yet released as a frame
    pending: VecDeque<u8>,

    encoding: AudioEncoding,
    sample_rate: u32,
    bit_depth: u16,

    /// Size of one frame in bytes
    frame_bytes: usize,

    /// Sequence number given to the next frame
    next_sequence: u64,
}

impl OutboundFrameBuffer {
    /// Create a buffer for one utterance.
    ///
    /// ## Parameters:
    /// - **encoding**: must have a fixed sample width (PCM16 or G.711)
    /// - **first_sequence**: sequence number of the first emitted frame, so numbering
    ///   continues across the utterances of a call
    pub fn new(encoding: AudioEncoding, sample_rate: u32, frame_duration: Duration, first_sequence: u64) -> Self {
        let width = encoding.bytes_per_sample().unwrap_or(1);
        let samples_per_frame = (sample_rate as u128 * frame_duration.as_micros() / 1_000_000) as usize;
        let frame_bytes = samples_per_frame.max(1) * width;

        Self {
            pending: VecDeque::with_capacity(frame_bytes * 2),
            encoding,
            sample_rate,
            bit_depth: (width * 8) as u16,
            frame_bytes,
            next_sequence: first_sequence,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Number of bytes waiting for a complete frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Append encoded bytes and return every frame that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioChunk> {
        self.pending.extend(bytes.iter().copied());

        let mut frames = Vec::with_capacity(self.pending.len() / self.frame_bytes);
        while self.pending.len() >= self.frame_bytes {
            let frame: Vec<u8> = self.pending.drain(..self.frame_bytes).collect();
            frames.push(self.make_chunk(frame));
        }
        frames
    }

    /// Release the remaining bytes as one frame padded with silence.
    ///
    /// Returns `None` when nothing is pending.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }

        let mut frame: Vec<u8> = self.pending.drain(..).collect();
        frame.resize(self.frame_bytes, self.encoding.silence_byte());
        Some(self.make_chunk(frame))
    }

    fn make_chunk(&mut self, bytes: Vec<u8>) -> AudioChunk {
        let chunk = AudioChunk {
            bytes,
            sample_rate: self.sample_rate,
            channel_count: 1,
            bit_depth: self.bit_depth,
            sequence: self.next_sequence,
            encoding: self.encoding,
        };
        self.next_sequence += 1;
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_sizes() {
        let alaw = OutboundFrameBuffer::new(AudioEncoding::Alaw, 8000, Duration::from_millis(20), 0);
        assert_eq!(alaw.frame_bytes(), 160);

        let pcm = OutboundFrameBuffer::new(AudioEncoding::Pcm16, 8000, Duration::from_millis(20), 0);
        assert_eq!(pcm.frame_bytes(), 320);

        let wideband = OutboundFrameBuffer::new(AudioEncoding::Pcm16, 16000, Duration::from_millis(20), 0);
        assert_eq!(wideband.frame_bytes(), 640);
    }

    #[test]
    fn test_push_emits_whole_frames_in_sequence() {
        let mut buffer = OutboundFrameBuffer::new(AudioEncoding::Alaw, 8000, Duration::from_millis(20), 7);

        assert!(buffer.push(&[1u8; 100]).is_empty());
        let frames = buffer.push(&[2u8; 300]);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 7);
        assert_eq!(frames[1].sequence, 8);
        assert!(frames.iter().all(|f| f.bytes.len() == 160));
        assert_eq!(&frames[0].bytes[..100], &[1u8; 100][..]);
        assert_eq!(buffer.pending_len(), 80);
        assert_eq!(buffer.next_sequence(), 9);
    }

    #[test]
    fn test_flush_pads_with_codec_silence() {
        let mut buffer = OutboundFrameBuffer::new(AudioEncoding::Mulaw, 8000, Duration::from_millis(20), 0);
        buffer.push(&[0x10; 10]);

        let tail = buffer.flush().unwrap();
        assert_eq!(tail.bytes.len(), 160);
        assert_eq!(&tail.bytes[..10], &[0x10; 10][..]);
        assert!(tail.bytes[10..].iter().all(|&b| b == 0xFF));
        assert_eq!(tail.duration(), Duration::from_millis(20));

        assert!(buffer.flush().is_none());
    }
}
