//! # ASR Session Manager
//!
//! Owns the single recognition channel of one call and keeps it alive.
//!
//! ## Lifecycle:
//! `Closed → Starting → Active`, with `Failed` as the absorbing state once the
//! reconnect budget is spent.
//!
//! ## Reconnect protocol:
//! 1. A frame the channel rejects tears the channel down, counts a failure,
//!    stamps the restart time and is dropped
//! 2. The next frame may reconnect, but only after the cooldown has passed and
//!    while the failure count is below the cap
//! 3. Reconnecting closes the stale channel (errors ignored), waits the settle
//!    delay, then opens a fresh channel
//! 4. Once the cap is reached every frame is refused until `reset()`
//!
//! Channels older than `max_channel_age` are rotated before the next frame;
//! rotation is routine maintenance and does not count as a failure.

use crate::config::AsrConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::recognition::{LatencyProbe, RecognitionChannel, RecognitionEvent, RecognitionParams, RecognitionService};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Timing and budget of the reconnect protocol.
///
/// One policy covers every transport and audio format.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub cooldown: Duration,
    pub max_failures: u32,
    pub settle_delay: Duration,
    pub max_channel_age: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(5),
            max_failures: 3,
            settle_delay: Duration::from_secs(2),
            max_channel_age: Duration::from_secs(300),
        }
    }
}

impl From<&AsrConfig> for ReconnectPolicy {
    fn from(config: &AsrConfig) -> Self {
        Self {
            cooldown: config.restart_cooldown(),
            max_failures: config.max_consecutive_failures,
            settle_delay: config.settle_delay(),
            max_channel_age: config.max_channel_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AsrState {
    Closed,
    Starting,
    Active,
    Failed,
}

impl AsrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AsrState::Closed => "closed",
            AsrState::Starting => "starting",
            AsrState::Active => "active",
            AsrState::Failed => "failed",
        }
    }
}

/// Point-in-time view of a call's recognition channel.
#[derive(Debug, Clone, Serialize)]
pub struct AsrStatus {
    pub session_id: String,
    pub state: AsrState,
    pub is_active: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: u64,
    pub channel_age_ms: Option<u64>,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub reconnects: u64,
    pub rotations: u64,
}

pub struct AsrSessionManager {
    service: Arc<dyn RecognitionService>,
    params: RecognitionParams,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    probe: LatencyProbe,

    state: AsrState,
    channel: Option<Box<dyn RecognitionChannel>>,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    last_restart: Option<Instant>,
    /// The first open happens on the first frame, without the settle delay
    started_once: bool,

    frames_sent: u64,
    frames_dropped: u64,
    reconnects: u64,
    rotations: u64,
}

impl AsrSessionManager {
    /// Create a manager; no channel is opened until the first frame or `start()`.
    pub fn new(
        service: Arc<dyn RecognitionService>,
        params: RecognitionParams,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<RecognitionEvent>,
        probe: LatencyProbe,
    ) -> Self {
        Self {
            service,
            params,
            policy,
            events,
            probe,
            state: AsrState::Closed,
            channel: None,
            opened_at: None,
            consecutive_failures: 0,
            last_restart: None,
            started_once: false,
            frames_sent: 0,
            frames_dropped: 0,
            reconnects: 0,
            rotations: 0,
        }
    }

    pub fn state(&self) -> AsrState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Open the recognition channel with this call's parameters.
    ///
    /// ## State Transition:
    /// Closed → Starting → Active on success, back to Closed on failure.
    /// A failed open is not counted here; callers on the frame path count it.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.state == AsrState::Failed {
            return Err(VoiceError::ExhaustedRetry { attempts: self.consecutive_failures });
        }
        if self.state == AsrState::Active {
            return Ok(());
        }

        self.started_once = true;
        self.state = AsrState::Starting;
        debug!(
            session_id = %self.params.session_id,
            sample_rate = self.params.sample_rate,
            encoding = ?self.params.encoding,
            "Opening recognition channel"
        );

        match self.service.open(&self.params, self.events.clone()).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.opened_at = Some(Instant::now());
                self.state = AsrState::Active;
                info!(session_id = %self.params.session_id, "Recognition channel active");
                Ok(())
            }
            Err(err) => {
                self.state = AsrState::Closed;
                warn!(session_id = %self.params.session_id, error = %err, "Recognition channel failed to open");
                Err(err)
            }
        }
    }

    /// Deliver one prepared frame, reconnecting first if the channel is down.
    ///
    /// ## Returns:
    /// - **Ok(())**: the frame reached the recognizer
    /// - **Err(Cooldown)**: the channel is down and may not be reopened yet; frame dropped
    /// - **Err(ExhaustedRetry)**: recognition is refused until `reset()`; frame dropped
    /// - **Err(Transport)**: the channel rejected the frame or could not be reopened; frame dropped
    pub async fn send_frame(&mut self, frame: &[u8]) -> VoiceResult<()> {
        if self.state == AsrState::Failed {
            self.frames_dropped += 1;
            return Err(VoiceError::ExhaustedRetry { attempts: self.consecutive_failures });
        }

        if self.state == AsrState::Active && self.channel_expired() {
            self.rotate().await;
        }

        if self.state != AsrState::Active {
            if let Err(err) = self.ensure_channel().await {
                self.frames_dropped += 1;
                return Err(err);
            }
        }

        let Some(channel) = self.channel.as_mut() else {
            self.frames_dropped += 1;
            return Err(VoiceError::Transport("recognition channel missing".to_string()));
        };

        match channel.send(frame).await {
            Ok(()) => {
                self.probe.mark_sent(Instant::now());
                self.frames_sent += 1;
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(err) => {
                self.frames_dropped += 1;
                warn!(
                    session_id = %self.params.session_id,
                    error = %err,
                    "Recognition channel rejected frame, tearing down"
                );
                self.teardown().await;
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Reopen after the cooldown, or open for the first time.
    async fn ensure_channel(&mut self) -> VoiceResult<()> {
        if !self.started_once {
            return match self.start().await {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.record_failure();
                    Err(err)
                }
            };
        }

        if self.consecutive_failures >= self.policy.max_failures {
            self.state = AsrState::Failed;
            return Err(VoiceError::ExhaustedRetry { attempts: self.consecutive_failures });
        }

        let remaining = self.cooldown_remaining(Instant::now());
        if !remaining.is_zero() {
            return Err(VoiceError::Cooldown { remaining_ms: remaining.as_millis() as u64 });
        }

        self.try_reconnect().await
    }

    /// Close whatever is left, settle, and open a fresh channel.
    async fn try_reconnect(&mut self) -> VoiceResult<()> {
        info!(
            session_id = %self.params.session_id,
            consecutive_failures = self.consecutive_failures,
            "Reconnecting recognition channel"
        );
        self.last_restart = Some(Instant::now());
        self.teardown().await;
        tokio::time::sleep(self.policy.settle_delay).await;

        match self.start().await {
            Ok(()) => {
                self.reconnects += 1;
                Ok(())
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    async fn rotate(&mut self) {
        info!(session_id = %self.params.session_id, "Rotating long-lived recognition channel");
        self.rotations += 1;
        self.teardown().await;
        tokio::time::sleep(self.policy.settle_delay).await;
        if let Err(err) = self.start().await {
            // Leaves the channel Closed; the frame path reconnects after the cooldown
            self.record_failure();
            warn!(session_id = %self.params.session_id, error = %err, "Rotation failed to reopen channel");
        }
    }

    fn channel_expired(&self) -> bool {
        self.opened_at
            .map(|opened| opened.elapsed() >= self.policy.max_channel_age)
            .unwrap_or(false)
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_restart = Some(Instant::now());
        if self.consecutive_failures >= self.policy.max_failures {
            self.state = AsrState::Failed;
            error!(
                session_id = %self.params.session_id,
                consecutive_failures = self.consecutive_failures,
                "Recognition failed permanently"
            );
        }
    }

    /// Close the channel, ignoring errors from an already-broken stream.
    async fn teardown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!(session_id = %self.params.session_id, error = %err, "Ignoring close error on stale channel");
            }
        }
        self.opened_at = None;
        if self.state != AsrState::Failed {
            self.state = AsrState::Closed;
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.last_restart {
            Some(at) => self.policy.cooldown.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    /// Clear the failure budget so recognition may be attempted again.
    pub async fn reset(&mut self) {
        info!(session_id = %self.params.session_id, "Resetting recognition failure budget");
        self.teardown().await;
        self.state = AsrState::Closed;
        self.consecutive_failures = 0;
        self.last_restart = None;
        self.started_once = false;
    }

    /// Close the channel for good. Safe to call on a closed or failed manager.
    pub async fn stop(&mut self) {
        self.teardown().await;
        debug!(session_id = %self.params.session_id, "Recognition stopped");
    }

    pub fn status(&self) -> AsrStatus {
        let now = Instant::now();
        AsrStatus {
            session_id: self.params.session_id.clone(),
            state: self.state,
            is_active: self.state == AsrState::Active,
            consecutive_failures: self.consecutive_failures,
            cooldown_remaining_ms: self.cooldown_remaining(now).as_millis() as u64,
            channel_age_ms: self
                .opened_at
                .map(|opened| now.saturating_duration_since(opened).as_millis() as u64),
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            reconnects: self.reconnects,
            rotations: self.rotations,
        }
    }
}
