//! Environment-driven configuration
//!
//! Values come from the process environment after `.env` is loaded. Parsing
//! goes through a lookup closure so tests never touch the real environment.

use crate::error::AgentError;
use crate::provider::{Provider, ProviderSettings};
use crate::retry::RetryPolicy;
use crate::scheduler::DEFAULT_SCAN_INTERVAL;
use crate::Result;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_CHAIN_ID: &str = "43114";
pub const DEFAULT_SCAN_TICK: Duration = Duration::from_secs(60);
pub const DEFAULT_AGENT_WS_URL: &str = "ws://127.0.0.1:8080/ws";

#[derive(Debug, Clone)]
pub struct GlacierConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub chain_id: String,
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Both the scheduler and the balance lookup are disabled without it.
    pub wallet_address: Option<String>,
    pub min_interval: Duration,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider: ProviderSettings,
    pub retry: RetryPolicy,
    pub port: u16,
    pub database_url: Option<String>,
    pub glacier: GlacierConfig,
    pub scan: ScanConfig,
}

impl AppConfig {
    /// Load `.env` and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match get("AI_PROVIDER") {
            Some(tag) => Provider::from_str(&tag)?,
            None => Provider::Primary,
        };

        let credential = get("AI_API_KEY")
            .or_else(|| get(provider_key_var(provider)))
            .ok_or_else(|| {
                AgentError::Config(format!(
                    "No API key for provider {} (set AI_API_KEY or {})",
                    provider,
                    provider_key_var(provider)
                ))
            })?;

        let mut settings = ProviderSettings::new(provider, credential)
            .with_private_mode(parse_flag(get("ENABLE_PRIVATE_COMPUTE").as_deref()));
        if let Some(base_url) = get("AI_BASE_URL") {
            settings = settings.with_base_url(base_url);
        }
        if let Some(model) = get("AI_MODEL") {
            settings = settings.with_model(model);
        }

        let defaults = RetryPolicy::default();
        let max_elapsed = match get("RETRY_MAX_ELAPSED_MS") {
            Some(raw) => match parse::<u64>("RETRY_MAX_ELAPSED_MS", &raw)? {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
            None => defaults.max_elapsed,
        };
        let retry = RetryPolicy::new(
            parse_or(&get, "RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
            millis_or(&get, "RETRY_INITIAL_DELAY_MS", defaults.initial_delay)?,
            parse_or(&get, "RETRY_MULTIPLIER", defaults.backoff_multiplier)?,
            defaults.on_failure_message.clone(),
        )
        .with_max_delay(millis_or(&get, "RETRY_MAX_DELAY_MS", defaults.max_delay)?)
        .with_max_elapsed(max_elapsed);

        if !(retry.backoff_multiplier.is_finite() && retry.backoff_multiplier >= 1.0) {
            return Err(AgentError::Config(format!(
                "RETRY_MULTIPLIER must be >= 1.0, got {}",
                retry.backoff_multiplier
            )));
        }

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(raw) => parse::<u16>("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let glacier = GlacierConfig {
            api_key: get("GLACIER_API_KEY"),
            base_url: get("GLACIER_BASE_URL"),
            chain_id: get("CHAIN_ID").unwrap_or_else(|| DEFAULT_CHAIN_ID.to_string()),
        };

        let scan = ScanConfig {
            wallet_address: get("WALLET_ADDRESS"),
            min_interval: secs_or(&get, "SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL)?,
            tick: secs_or(&get, "SCAN_TICK_SECS", DEFAULT_SCAN_TICK)?,
        };
        if scan.tick.is_zero() {
            return Err(AgentError::Config("SCAN_TICK_SECS must be positive".into()));
        }

        Ok(Self {
            provider: settings,
            retry,
            port,
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            glacier,
            scan,
        })
    }
}

/// WebSocket URL for the terminal chat client
pub fn agent_ws_url() -> String {
    std::env::var("AGENT_WS_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_AGENT_WS_URL.to_string())
}

fn provider_key_var(provider: Provider) -> &'static str {
    match provider {
        Provider::Primary => "OPENAI_API_KEY",
        Provider::ConfidentialCapable => "ATOMA_API_KEY",
        Provider::Secondary => "GEMINI_API_KEY",
    }
}

fn parse_flag(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AgentError::Config(format!("Invalid {}={:?}: {}", key, raw, e)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse::<u64>(key, &raw).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse::<u64>(key, &raw).map(Duration::from_secs),
        None => Ok(default),
    }
}
