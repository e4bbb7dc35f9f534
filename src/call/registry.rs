//! # Call Registry
//!
//! The process-wide `call_id → CallSession` map. Calls are only ever created,
//! looked up and ended through it.
//!
//! ## Resource Management:
//! - Enforces the maximum number of concurrent calls
//! - Rejects a second session for a call id that is still live
//! - Keeps a bounded archive of summaries of ended calls
//! - Ends calls that have gone quiet (`cleanup_idle`)

use crate::call::session::CallSession;
use crate::call::{CallCounters, CallCountersSnapshot, CallOptions, CallServices, CallSnapshot, CallSummary};
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;
use uuid::Uuid;

pub struct CallRegistry {
    /// Live calls mapped by call id
    calls: RwLock<HashMap<String, Arc<CallSession>>>,

    /// Most recent summaries last
    archive: RwLock<VecDeque<CallSummary>>,

    services: CallServices,
    counters: Arc<CallCounters>,
    max_concurrent_calls: usize,
    archive_size: usize,
}

impl CallRegistry {
    pub fn new(services: CallServices, max_concurrent_calls: usize, archive_size: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            archive: RwLock::new(VecDeque::with_capacity(archive_size)),
            services,
            counters: Arc::new(CallCounters::default()),
            max_concurrent_calls,
            archive_size,
        }
    }

    /// Start a new call.
    ///
    /// ## Parameters:
    /// - **call_id**: id assigned by the telephony side; a UUID is generated when absent
    /// - **config**: configuration snapshot the call keeps for its whole lifetime
    ///
    /// ## Returns:
    /// - **Err(CapacityReached)**: too many live calls
    /// - **Err(CallExists)**: a live call already uses this id
    pub fn create(
        &self,
        call_id: Option<String>,
        options: CallOptions,
        config: &AppConfig,
    ) -> VoiceResult<Arc<CallSession>> {
        let mut calls = self.calls.write().unwrap_or_else(PoisonError::into_inner);

        if calls.len() >= self.max_concurrent_calls {
            return Err(VoiceError::CapacityReached(self.max_concurrent_calls));
        }

        let call_id = call_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if calls.contains_key(&call_id) {
            return Err(VoiceError::CallExists(call_id));
        }

        let session = Arc::new(CallSession::start(
            call_id.clone(),
            options,
            &self.services,
            config,
            self.counters.clone(),
        ));
        calls.insert(call_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallSession>> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.get(call_id).cloned()
    }

    /// End a call, wait for it to wind down and archive its summary.
    pub async fn end(&self, call_id: &str, reason: &str) -> VoiceResult<CallSummary> {
        let session = self
            .calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(call_id)
            .ok_or_else(|| VoiceError::CallNotFound(call_id.to_string()))?;

        let summary = session.end_call(reason).await;
        self.archive_summary(summary.clone());
        Ok(summary)
    }

    fn archive_summary(&self, summary: CallSummary) {
        if self.archive_size == 0 {
            return;
        }
        let mut archive = self.archive.write().unwrap_or_else(PoisonError::into_inner);
        while archive.len() >= self.archive_size {
            archive.pop_front();
        }
        archive.push_back(summary);
    }

    pub fn active_count(&self) -> usize {
        self.calls.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
        calls.keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let calls: Vec<Arc<CallSession>> = self
            .calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<CallSnapshot> = calls.iter().map(|call| call.snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    /// Archived summary of an ended call, newest match first.
    pub fn archived(&self, call_id: &str) -> Option<CallSummary> {
        let archive = self.archive.read().unwrap_or_else(PoisonError::into_inner);
        archive.iter().rev().find(|summary| summary.call_id == call_id).cloned()
    }

    /// The most recent `limit` summaries, newest first.
    pub fn recent_archive(&self, limit: usize) -> Vec<CallSummary> {
        let archive = self.archive.read().unwrap_or_else(PoisonError::into_inner);
        archive.iter().rev().take(limit).cloned().collect()
    }

    /// End calls with no activity for longer than `max_idle`.
    ///
    /// Calls that already ended on their own (without going through `end`) are
    /// removed as well. Returns how many calls were ended.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = {
            let calls = self.calls.read().unwrap_or_else(PoisonError::into_inner);
            calls
                .iter()
                .filter(|(_, call)| call.is_ended() || call.idle_for(now) > max_idle)
                .map(|(call_id, _)| call_id.clone())
                .collect()
        };

        let mut removed = 0;
        for call_id in stale {
            if self.end(&call_id, "idle_timeout").await.is_ok() {
                info!(call_id = %call_id, "Ended idle call");
                removed += 1;
            }
        }
        removed
    }

    /// End every live call, e.g. on shutdown.
    pub async fn end_all(&self, reason: &str) -> usize {
        let mut ended = 0;
        for call_id in self.active_ids() {
            if self.end(&call_id, reason).await.is_ok() {
                ended += 1;
            }
        }
        ended
    }

    pub fn counters(&self) -> CallCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut state_counts = HashMap::new();
        let mut handoffs = 0;
        for snapshot in self.snapshots() {
            *state_counts.entry(snapshot.state.as_str().to_string()).or_insert(0) += 1;
            if snapshot.handoff_required {
                handoffs += 1;
            }
        }

        RegistrySummary {
            active_calls: state_counts.values().sum(),
            max_calls: self.max_concurrent_calls,
            state_counts,
            calls_awaiting_handoff: handoffs,
            archived_calls: self.archive.read().unwrap_or_else(PoisonError::into_inner).len(),
            counters: self.counters(),
        }
    }
}

/// Summary of the registry for health and metrics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_calls: usize,
    pub max_calls: usize,
    pub state_counts: HashMap<String, usize>,
    pub calls_awaiting_handoff: usize,
    pub archived_calls: usize,
    pub counters: CallCountersSnapshot,
}
