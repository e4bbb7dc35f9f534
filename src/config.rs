//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__TTS__MAX_ATTEMPTS`, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Durations
//! All durations are stored as plain integers (`*_ms`, `*_secs`) so they survive
//! TOML, environment variables and JSON unchanged. Each section exposes
//! `Duration` helpers for the code that consumes it.

use crate::audio::AudioEncoding;         // Outbound codec selection
use crate::synthesis::VoiceParams;       // Default voice for every call
use anyhow::Result;                      // Better error handling with context
use serde::{Deserialize, Serialize};     // For converting to/from TOML, JSON, etc.
use std::env;                            // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each component of the call pipeline (recognition, boundary detection,
/// synthesis, dialogue) gets its own section so it can be tuned on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub asr: AsrConfig,
    pub boundary: BoundaryConfig,
    pub tts: TtsConfig,
    pub dialogue: DialogueConfig,
    pub voice: VoiceParams,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Speech recognition channel settings.
///
/// ## Fields:
/// - `model`: recognizer model requested when a channel is opened
/// - `max_sentence_silence_ms`: silence the recognizer waits before flagging a sentence end
/// - `restart_cooldown_ms`: minimum spacing between reconnect attempts
/// - `max_consecutive_failures`: failures tolerated before recognition is refused
/// - `settle_delay_ms`: pause between closing a stale channel and opening a new one
/// - `max_channel_age_secs`: channels older than this are rotated proactively
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    pub model: String,
    pub max_sentence_silence_ms: u64,
    pub semantic_punctuation: bool,
    pub heartbeat: bool,
    pub restart_cooldown_ms: u64,
    pub max_consecutive_failures: u32,
    pub settle_delay_ms: u64,
    pub max_channel_age_secs: u64,
}

/// Utterance boundary detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Time a partial must stay unchanged before it counts as a complete utterance
    pub sentence_timeout_ms: u64,
    /// Utterances below this confidence are discarded
    pub min_confidence: f32,
    /// Confidence assumed when the recognizer omits it
    pub default_confidence: f32,
}

/// Speech synthesis and outbound audio settings.
///
/// ## Fields:
/// - `source_sample_rate`: rate of the PCM chunks produced by the synthesizer
/// - `target_sample_rate` / `target_encoding`: what the transport plays back
/// - `frame_duration_ms`: size of each outbound frame
/// - `max_attempts` / `retry_backoff_ms`: retry budget when no audio arrives
/// - `first_chunk_timeout_ms`: how long one attempt may wait for its first chunk
/// - `pacing_lead_ms`: how far emission may run ahead of real time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    pub source_sample_rate: u32,
    pub target_sample_rate: u32,
    pub target_encoding: AudioEncoding,
    pub frame_duration_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub first_chunk_timeout_ms: u64,
    pub pacing_lead_ms: u64,
}

/// Dialogue engine settings.
///
/// An empty `endpoint` means no engine is configured: every turn speaks
/// `fallback_text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Spoken when the engine fails or times out
    pub fallback_text: String,
    /// Spoken when nothing else could be synthesized
    pub unavailable_text: String,
    /// Greeting with `{name}`, `{amount}` and `{days}` placeholders
    pub greeting_template: String,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Larger inbound queues absorb recognizer reconnect pauses at the cost of latency
/// - Larger outbound queues tolerate slower transports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_calls: usize,
    pub inbound_queue_frames: usize,
    pub outbound_queue_frames: usize,
    pub event_queue_size: usize,
    pub idle_call_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub call_archive_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            asr: AsrConfig {
                model: "paraformer-realtime-v2".to_string(),
                max_sentence_silence_ms: 1500,  // Phone callers pause longer
                semantic_punctuation: true,
                heartbeat: true,
                restart_cooldown_ms: 5000,
                max_consecutive_failures: 3,
                settle_delay_ms: 2000,
                max_channel_age_secs: 300,
            },
            boundary: BoundaryConfig {
                sentence_timeout_ms: 2000,
                min_confidence: 0.3,
                default_confidence: 0.8,
            },
            tts: TtsConfig {
                source_sample_rate: 24000,
                target_sample_rate: 8000,       // Telephony standard
                target_encoding: AudioEncoding::Alaw,
                frame_duration_ms: 20,
                max_attempts: 3,
                retry_backoff_ms: 1000,
                first_chunk_timeout_ms: 5000,
                pacing_lead_ms: 100,
            },
            dialogue: DialogueConfig {
                endpoint: String::new(),
                api_key: String::new(),
                model: "qwen-plus".to_string(),
                system_prompt: "你是平安银行的专业催收专员。请用礼貌、专业、简洁的中文回复客户，\
                                每次回复控制在两到三句话以内，引导客户说明还款计划。"
                    .to_string(),
                temperature: 0.7,
                max_tokens: 500,
                timeout_ms: 8000,
                fallback_text: "很抱歉，请您重复一下刚才的问题。".to_string(),
                unavailable_text: "系统暂时无法处理，请稍后再试。".to_string(),
                greeting_template: "{name}您好，我是平安银行催收专员，工号888888。\
                                    根据我行记录，您有一笔{amount}的逾期本金，逾期了{days}天，\
                                    已上报征信系统。请问您现在方便谈论还款安排吗？"
                    .to_string(),
            },
            voice: VoiceParams::default(),
            performance: PerformanceConfig {
                max_concurrent_calls: 100,
                inbound_queue_frames: 256,      // ~5s of 20ms frames
                outbound_queue_frames: 512,
                event_queue_size: 64,
                idle_call_timeout_secs: 600,
                cleanup_interval_secs: 30,
                call_archive_size: 100,
            },
        }
    }
}

impl AsrConfig {
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.restart_cooldown_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn max_channel_age(&self) -> Duration {
        Duration::from_secs(self.max_channel_age_secs)
    }
}

impl BoundaryConfig {
    pub fn sentence_timeout(&self) -> Duration {
        Duration::from_millis(self.sentence_timeout_ms)
    }
}

impl TtsConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn first_chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.first_chunk_timeout_ms)
    }

    pub fn pacing_lead(&self) -> Duration {
        Duration::from_millis(self.pacing_lead_ms)
    }
}

impl DialogueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl PerformanceConfig {
    pub fn idle_call_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_call_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP__
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__DIALOGUE__ENDPOINT=https://...`: Point at a chat-completions API
    /// - `APP__TTS__TARGET_ENCODING=mulaw`: Switch outbound codec
    ///
    /// The double underscore separator keeps field names such as
    /// `max_concurrent_calls` intact.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        // Deployment platforms set these without the APP prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Boundary timeout stays within 1.5–2.0 s and confidences are within 0–1
    /// - Reconnect policy allows at least one failure and settles for at least 2 s
    /// - Synthesis retries at least once and G.711 output is 8 kHz
    /// - Voice parameters are in range
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(1500..=2000).contains(&self.boundary.sentence_timeout_ms) {
            return Err(anyhow::anyhow!("Sentence timeout must be between 1500 and 2000 ms"));
        }

        for (name, value) in [
            ("min_confidence", self.boundary.min_confidence),
            ("default_confidence", self.boundary.default_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be between 0 and 1", name));
            }
        }

        if self.asr.max_consecutive_failures == 0 {
            return Err(anyhow::anyhow!("ASR max consecutive failures must be greater than 0"));
        }

        if self.asr.settle_delay_ms < 2000 {
            return Err(anyhow::anyhow!("ASR settle delay must be at least 2000 ms"));
        }

        if self.tts.max_attempts == 0 {
            return Err(anyhow::anyhow!("TTS max attempts must be greater than 0"));
        }

        if self.tts.frame_duration_ms == 0 || self.tts.source_sample_rate == 0 || self.tts.target_sample_rate == 0 {
            return Err(anyhow::anyhow!("TTS frame duration and sample rates must be greater than 0"));
        }

        match self.tts.target_encoding {
            AudioEncoding::Alaw | AudioEncoding::Mulaw if self.tts.target_sample_rate != 8000 => {
                return Err(anyhow::anyhow!("G.711 output requires an 8000 Hz target sample rate"));
            }
            AudioEncoding::Opus | AudioEncoding::Wav => {
                return Err(anyhow::anyhow!("TTS target encoding must be pcm16, alaw or mulaw"));
            }
            _ => {}
        }

        if self.dialogue.timeout_ms == 0 {
            return Err(anyhow::anyhow!("Dialogue timeout must be greater than 0"));
        }

        if self.dialogue.fallback_text.trim().is_empty() {
            return Err(anyhow::anyhow!("Dialogue fallback text cannot be empty"));
        }

        self.voice.validate()?;

        if self.performance.max_concurrent_calls == 0 {
            return Err(anyhow::anyhow!("Max concurrent calls must be greater than 0"));
        }

        if self.performance.inbound_queue_frames == 0
            || self.performance.outbound_queue_frames == 0
            || self.performance.event_queue_size == 0
        {
            return Err(anyhow::anyhow!("Queue sizes must be greater than 0"));
        }

        if self.performance.cleanup_interval_secs == 0 || self.performance.idle_call_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle call timeout and cleanup interval must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## What this does:
    /// 1. Serialize the current configuration into a JSON tree
    /// 2. Merge the partial JSON on top of it, section by section
    /// 3. Deserialize the result back and validate it
    ///
    /// ## Partial updates:
    /// Only the provided fields change. For example `{"tts": {"max_attempts": 2}}`
    /// leaves every other setting untouched. Running calls keep the snapshot they
    /// started with; new calls pick up the change.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;
        if !partial_config.is_object() {
            return Err(anyhow::anyhow!("Configuration update must be a JSON object"));
        }

        let mut merged = serde_json::to_value(&*self)?;
        merge_json(&mut merged, partial_config);

        let updated: AppConfig = serde_json::from_value(merged)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}

/// Recursively overlay `patch` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.asr.restart_cooldown(), Duration::from_secs(5));
        assert_eq!(config.boundary.sentence_timeout(), Duration::from_secs(2));
        assert_eq!(config.tts.target_encoding, AudioEncoding::Alaw);
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.boundary.sentence_timeout_ms = 500;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.asr.settle_delay_ms = 1000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.tts.target_sample_rate = 16000;
        assert!(config.validate().is_err());
    }

    /// Test that runtime configuration updates work correctly.
    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "tts": {"max_attempts": 2}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.tts.max_attempts, 2);
        // Other fields should remain unchanged
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.tts.retry_backoff_ms, 1000);
    }

    #[test]
    fn test_invalid_update_leaves_config_untouched() {
        let mut config = AppConfig::default();
        let json = r#"{"boundary": {"min_confidence": 1.5}}"#;
        assert!(config.update_from_json(json).is_err());
        assert_eq!(config.boundary.min_confidence, 0.3);

        assert!(config.update_from_json("[1, 2]").is_err());
    }
}
