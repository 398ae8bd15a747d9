//! OpenAI chat-completions backend (primary provider)
//!
//! The request and response types here are the OpenAI-compatible chat shape,
//! also spoken by the Atoma backend.

use super::{empty_completion, send_json, CompletionBackend, ProviderSettings};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4";
const CHAT_PATH: &str = "/v1/chat/completions";

pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(client: Client, settings: &ProviderSettings) -> Self {
        Self {
            client,
            api_key: settings.credential.clone(),
            base_url: settings.base_url_or(DEFAULT_BASE_URL),
            model: settings.model_or(DEFAULT_MODEL),
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, CHAT_PATH)
    }

    async fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let request = ChatRequest::new(&self.model, prompt, system_prompt);

        info!(model = %self.model, "Calling OpenAI chat completions");

        let response: ChatResponse = send_json(
            self.name(),
            self.client
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(&request),
        )
        .await?;

        response
            .into_text()
            .ok_or_else(|| empty_completion(self.name()))
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
}

impl ChatRequest {
    pub fn new(model: &str, prompt: &str, system_prompt: Option<&str>) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatTurn {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        messages.push(ChatTurn {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        Self {
            model: model.to_string(),
            messages,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ChatTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    /// Text of the first choice, if it carries any
    pub fn into_text(self) -> Option<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|text| !text.is_empty())
    }
}
