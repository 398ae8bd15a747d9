//! Atoma backend (confidential-capable provider)
//!
//! The same OpenAI-compatible chat shape is posted either to the standard
//! route or to the confidential compute route, depending on private mode.

use super::openai::{ChatRequest, ChatResponse};
use super::{empty_completion, send_json, CompletionBackend, ProviderSettings};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

pub const DEFAULT_BASE_URL: &str = "https://api.atoma.network";
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct";
const STANDARD_PATH: &str = "/v1/chat/completions";
const CONFIDENTIAL_PATH: &str = "/v1/confidential/chat/completions";

pub struct AtomaBackend {
    client: Client,
    bearer_auth: String,
    base_url: String,
    model: String,
    private_mode: bool,
}

impl AtomaBackend {
    pub fn new(client: Client, settings: &ProviderSettings) -> Self {
        Self {
            client,
            bearer_auth: settings.credential.clone(),
            base_url: settings.base_url_or(DEFAULT_BASE_URL),
            model: settings.model_or(DEFAULT_MODEL),
            private_mode: settings.private_mode_enabled,
        }
    }

    pub fn is_confidential(&self) -> bool {
        self.private_mode
    }
}

#[async_trait]
impl CompletionBackend for AtomaBackend {
    fn name(&self) -> &'static str {
        "atoma"
    }

    fn endpoint(&self) -> String {
        let path = if self.private_mode {
            CONFIDENTIAL_PATH
        } else {
            STANDARD_PATH
        };
        format!("{}{}", self.base_url, path)
    }

    async fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String> {
        let request = ChatRequest::new(&self.model, prompt, system_prompt);

        info!(
            model = %self.model,
            confidential = self.private_mode,
            "Calling Atoma chat completions"
        );

        let response: ChatResponse = send_json(
            self.name(),
            self.client
                .post(self.endpoint())
                .bearer_auth(&self.bearer_auth)
                .json(&request),
        )
        .await?;

        response
            .into_text()
            .ok_or_else(|| empty_completion(self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;

    #[test]
    fn test_endpoint_follows_private_mode() {
        let settings = ProviderSettings::new(Provider::ConfidentialCapable, "k")
            .with_base_url("http://atoma.local/");

        let standard = AtomaBackend::new(Client::new(), &settings);
        assert!(!standard.is_confidential());
        assert_eq!(standard.endpoint(), "http://atoma.local/v1/chat/completions");

        let private = AtomaBackend::new(Client::new(), &settings.with_private_mode(true));
        assert_eq!(
            private.endpoint(),
            "http://atoma.local/v1/confidential/chat/completions"
        );
    }
}
