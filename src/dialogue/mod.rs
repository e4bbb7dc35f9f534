//! # Dialogue
//!
//! Conversation records and the contract with the engine that writes the
//! agent's replies. Prompt wording and business rules live in the engine;
//! this module only carries the turn history and the customer profile to it.

pub mod http;

use crate::error::VoiceResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Customer,
    Agent,
}

/// One entry of a call's conversation history. Never modified once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueTurn {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl DialogueTurn {
    pub fn customer(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::Customer, text: text.into(), timestamp: Utc::now() }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self { speaker: Speaker::Agent, text: text.into(), timestamp: Utc::now() }
    }
}

/// Who the agent is talking to. Passed to the dialogue engine as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    #[serde(default = "default_name")]
    pub name: String,
    /// Overdue principal in yuan
    #[serde(default = "default_balance")]
    pub balance: u64,
    #[serde(default = "default_days_overdue")]
    pub days_overdue: u32,
    #[serde(default = "default_previous_contacts")]
    pub previous_contacts: u32,
    #[serde(default = "default_risk_level")]
    pub risk_level: String,
}

fn default_name() -> String {
    "客户".to_string()
}

fn default_balance() -> u64 {
    15000
}

fn default_days_overdue() -> u32 {
    30
}

fn default_previous_contacts() -> u32 {
    2
}

fn default_risk_level() -> String {
    "中等".to_string()
}

impl Default for CustomerProfile {
    fn default() -> Self {
        Self {
            name: default_name(),
            balance: default_balance(),
            days_overdue: default_days_overdue(),
            previous_contacts: default_previous_contacts(),
            risk_level: default_risk_level(),
        }
    }
}

/// Everything the engine sees for one customer utterance.
#[derive(Debug, Clone, Serialize)]
pub struct DialogueRequest {
    pub call_id: String,
    pub utterance: String,
    /// Turns before `utterance`, oldest first
    pub history: Vec<DialogueTurn>,
    pub profile: CustomerProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueReply {
    pub text: String,
}

/// Writes the agent's next line.
///
/// Called at most once per completed utterance; the caller bounds it with a timeout.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    async fn respond(&self, request: &DialogueRequest) -> VoiceResult<DialogueReply>;
}

/// Spoken form of an amount in yuan: 15000 → "1万5000元", 20000 → "2万元".
pub fn format_chinese_amount(amount: u64) -> String {
    if amount < 10_000 {
        return format!("{}元", amount);
    }
    let wan = amount / 10_000;
    match amount % 10_000 {
        0 => format!("{}万元", wan),
        rest => format!("{}万{}元", wan, rest),
    }
}

/// Fill the greeting template's `{name}`, `{amount}` and `{days}` placeholders.
pub fn build_greeting(template: &str, profile: &CustomerProfile) -> String {
    template
        .replace("{name}", &profile.name)
        .replace("{amount}", &format_chinese_amount(profile.balance))
        .replace("{days}", &profile.days_overdue.to_string())
}
