//! # Speech Synthesis
//!
//! The contract with the text-to-speech service and the streamer that turns
//! its output into paced telephony frames.

pub mod streamer;

use crate::error::VoiceResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stream of raw PCM16 little-endian chunks at the synthesizer's source rate.
///
/// Finite and not restartable: a retry means a new `synthesize` call.
pub type PcmStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

/// Voice used to speak a reply.
///
/// `tone` and `emotion` are passed to the synthesizer as-is; the value
/// `"neutral"` means "no preference" and is omitted from requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
    pub pitch: f32,
    pub volume: f32,
    pub tone: String,
    pub emotion: String,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "Cherry".to_string(),
            speed: 1.0,
            pitch: 1.0,
            volume: 0.8,
            tone: "professional".to_string(),
            emotion: "professional".to_string(),
        }
    }
}

impl VoiceParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Voice name cannot be empty"));
        }
        if !(0.5..=2.0).contains(&self.speed) || !(0.5..=2.0).contains(&self.pitch) {
            return Err(anyhow::anyhow!("Voice speed and pitch must be between 0.5 and 2.0"));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(anyhow::anyhow!("Voice volume must be between 0 and 1"));
        }
        Ok(())
    }

    /// Style hints worth sending, skipping the neutral defaults.
    pub fn style_hints(&self) -> Vec<(&'static str, &str)> {
        [("tone", self.tone.as_str()), ("emotion", self.emotion.as_str())]
            .into_iter()
            .filter(|(_, value)| !value.is_empty() && *value != "neutral")
            .collect()
    }
}

/// A streaming text-to-speech service.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    /// Start synthesizing `text`; audio is produced lazily as the stream is polled.
    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> VoiceResult<PcmStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_voice_is_valid() {
        let voice = VoiceParams::default();
        assert!(voice.validate().is_ok());
        assert_eq!(voice.style_hints(), vec![("tone", "professional"), ("emotion", "professional")]);
    }

    #[test]
    fn test_neutral_style_is_omitted() {
        let voice = VoiceParams { emotion: "neutral".to_string(), ..VoiceParams::default() };
        assert_eq!(voice.style_hints(), vec![("tone", "professional")]);

        let loud = VoiceParams { volume: 1.5, ..VoiceParams::default() };
        assert!(loud.validate().is_err());
    }
}
