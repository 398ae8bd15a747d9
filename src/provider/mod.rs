//! Completion provider abstraction
//!
//! Maps a prompt onto exactly one backend AI provider chosen at construction.
//! Callers see a single `generate_completion` call; request shapes, endpoints
//! and model identifiers stay inside the backends.

use crate::error::AgentError;
use crate::retry::{self, RetryPolicy};
use crate::Result;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub mod atoma;
pub mod gemini;
pub mod openai;

pub use atoma::AtomaBackend;
pub use gemini::GeminiBackend;
pub use openai::OpenAiBackend;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Closed set of supported providers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// OpenAI chat completions
    Primary,
    /// Atoma, with an optional confidential compute mode
    ConfidentialCapable,
    /// Gemini generateContent
    Secondary,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Primary => "openai",
            Provider::ConfidentialCapable => "atoma",
            Provider::Secondary => "gemini",
        }
    }
}

impl FromStr for Provider {
    type Err = AgentError;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.trim().to_lowercase().as_str() {
            "openai" | "primary" => Ok(Provider::Primary),
            "atoma" | "confidential" | "confidential-capable" | "confidential_capable" => {
                Ok(Provider::ConfidentialCapable)
            }
            "gemini" | "secondary" => Ok(Provider::Secondary),
            other => Err(AgentError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider configuration. Never mutated after the service is built.
#[derive(Clone)]
pub struct ProviderSettings {
    pub provider: Provider,
    pub credential: String,
    pub private_mode_enabled: bool,
    /// Overrides the provider's public base URL
    pub base_url: Option<String>,
    /// Overrides the provider's fixed model identifier
    pub model: Option<String>,
    pub request_timeout: Duration,
}

impl ProviderSettings {
    pub fn new(provider: Provider, credential: impl Into<String>) -> Self {
        Self {
            provider,
            credential: credential.into(),
            private_mode_enabled: false,
            base_url: None,
            model: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_private_mode(mut self, enabled: bool) -> Self {
        self.private_mode_enabled = enabled;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    fn base_url_or(&self, default: &str) -> String {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
            .to_string()
    }

    fn model_or(&self, default: &str) -> String {
        self.model.clone().unwrap_or_else(|| default.to_string())
    }
}

// The credential must never reach the logs.
impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("credential", &"<redacted>")
            .field("private_mode_enabled", &self.private_mode_enabled)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// One backend provider client
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Endpoint the next call will hit
    fn endpoint(&self) -> String;

    async fn complete(&self, prompt: &str, system_prompt: Option<&str>) -> Result<String>;
}

/// Uniform completion entry point shared read-only across tasks
pub struct CompletionService {
    settings: ProviderSettings,
    backend: Box<dyn CompletionBackend>,
}

impl CompletionService {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        if settings.credential.trim().is_empty() {
            return Err(AgentError::Config(format!(
                "No API key configured for provider {}",
                settings.provider
            )));
        }

        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let backend: Box<dyn CompletionBackend> = match settings.provider {
            Provider::Primary => Box::new(OpenAiBackend::new(client, &settings)),
            Provider::ConfidentialCapable => Box::new(AtomaBackend::new(client, &settings)),
            Provider::Secondary => Box::new(GeminiBackend::new(client, &settings)),
        };

        info!(
            provider = %settings.provider,
            private_mode = settings.private_mode_enabled,
            endpoint = %backend.endpoint(),
            "Completion provider initialized"
        );

        Ok(Self { settings, backend })
    }

    pub fn provider(&self) -> Provider {
        self.settings.provider
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn endpoint(&self) -> String {
        self.backend.endpoint()
    }

    /// Raw completion text for a single user prompt
    pub async fn generate_completion(&self, prompt: &str) -> Result<String> {
        self.generate_completion_with_system(prompt, None).await
    }

    pub async fn generate_completion_with_system(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Result<String> {
        debug!(provider = self.backend.name(), "Requesting completion");
        self.backend.complete(prompt, system_prompt).await
    }

    /// Aborts the wait with `AgentError::Cancelled` when `token` fires.
    pub async fn generate_completion_cancellable(
        &self,
        prompt: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(provider = self.backend.name(), "Completion cancelled");
                Err(AgentError::Cancelled)
            }
            result = self.generate_completion(prompt) => result,
        }
    }

    /// Completion wrapped in the backoff executor
    pub async fn generate_completion_with_retry(
        &self,
        prompt: &str,
        policy: &RetryPolicy,
    ) -> Result<String> {
        retry::execute(policy, || self.generate_completion(prompt)).await
    }
}

/// Send a provider request and decode its JSON body, classifying failures.
pub(crate) async fn send_json<R: DeserializeOwned>(
    provider: &'static str,
    request: RequestBuilder,
) -> Result<R> {
    let response = request.send().await.map_err(|e| {
        error!(provider, "Provider request failed: {}", e);
        if e.is_timeout() || e.is_connect() {
            AgentError::TransientProvider(format!("{} unreachable: {}", provider, e))
        } else {
            AgentError::ProviderCallFailed {
                provider: provider.to_string(),
                status: None,
                message: e.to_string(),
            }
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!(provider, status = status.as_u16(), "Provider error response: {}", body);
        return Err(AgentError::from_provider_status(provider, status.as_u16(), body));
    }

    response.json::<R>().await.map_err(|e| {
        error!(provider, "Failed to parse provider response: {}", e);
        AgentError::ProviderCallFailed {
            provider: provider.to_string(),
            status: Some(status.as_u16()),
            message: format!("Invalid response body: {}", e),
        }
    })
}

pub(crate) fn empty_completion(provider: &'static str) -> AgentError {
    AgentError::ProviderCallFailed {
        provider: provider.to_string(),
        status: None,
        message: "Empty completion".to_string(),
    }
}
