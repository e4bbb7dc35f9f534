//! # HTTP Dialogue Engine
//!
//! Dialogue engine backed by an OpenAI-compatible `chat/completions` endpoint
//! (DashScope compatible mode, OpenRouter, a local server...).
//!
//! ## Message layout:
//! 1. `system`: configured prompt followed by the customer profile
//! 2. History turns: customer → `user`, agent → `assistant`
//! 3. `user`: the utterance being answered

use crate::config::DialogueConfig;
use crate::dialogue::{CustomerProfile, DialogueEngine, DialogueReply, DialogueRequest, Speaker};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

pub struct HttpDialogueEngine {
    client: reqwest::Client,
    url: String,
    config: DialogueConfig,
}

impl HttpDialogueEngine {
    /// Returns `None` when no endpoint is configured.
    pub fn from_config(config: &DialogueConfig) -> Option<Self> {
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty() {
            return None;
        }

        // The caller applies the turn timeout; this one only stops leaked requests
        let client = reqwest::Client::builder()
            .timeout(config.timeout() * 2)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Some(Self {
            client,
            url: format!("{}/chat/completions", endpoint.trim_end_matches('/')),
            config: config.clone(),
        })
    }

    fn messages(&self, request: &DialogueRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: format!("{}\n\n{}", self.config.system_prompt, profile_context(&request.profile)),
        });

        messages.extend(request.history.iter().map(|turn| ChatMessage {
            role: match turn.speaker {
                Speaker::Customer => "user",
                Speaker::Agent => "assistant",
            },
            content: turn.text.clone(),
        }));

        messages.push(ChatMessage { role: "user", content: request.utterance.clone() });
        messages
    }
}

fn profile_context(profile: &CustomerProfile) -> String {
    format!(
        "客户信息：姓名{}，逾期本金{}，逾期{}天，历史联系{}次，风险等级{}。",
        profile.name,
        crate::dialogue::format_chinese_amount(profile.balance),
        profile.days_overdue,
        profile.previous_contacts,
        profile.risk_level
    )
}

#[async_trait]
impl DialogueEngine for HttpDialogueEngine {
    async fn respond(&self, request: &DialogueRequest) -> VoiceResult<DialogueReply> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: self.messages(request),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        debug!(call_id = %request.call_id, turns = request.history.len(), "Requesting dialogue reply");

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Dialogue(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(call_id = %request.call_id, status = %status, "Dialogue engine returned an error");
            return Err(VoiceError::Dialogue(format!("engine error {}: {}", status, detail)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Dialogue(format!("invalid response: {}", e)))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| VoiceError::Dialogue("empty reply".to_string()))?;

        Ok(DialogueReply { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::dialogue::DialogueTurn;

    fn engine() -> HttpDialogueEngine {
        let mut config = AppConfig::default().dialogue;
        config.endpoint = "https://dashscope.example.com/compatible-mode/v1/".to_string();
        HttpDialogueEngine::from_config(&config).unwrap()
    }

    #[test]
    fn test_unconfigured_endpoint_yields_no_engine() {
        assert!(HttpDialogueEngine::from_config(&AppConfig::default().dialogue).is_none());
        assert_eq!(engine().url, "https://dashscope.example.com/compatible-mode/v1/chat/completions");
    }

    #[test]
    fn test_history_maps_to_chat_roles() {
        let request = DialogueRequest {
            call_id: "call-1".to_string(),
            utterance: "我现在没有钱还款".to_string(),
            history: vec![DialogueTurn::agent("您好"), DialogueTurn::customer("你好")],
            profile: CustomerProfile::default(),
        };

        let messages = engine().messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "assistant", "user", "user"]);
        assert!(messages[0].content.contains("1万5000元"));
        assert_eq!(messages[3].content, "我现在没有钱还款");
    }
}
