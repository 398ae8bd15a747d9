//! Balance data source
//!
//! Read-only, paginated ERC-20 balance lookup. The Glacier (AvaCloud) client
//! follows `nextPageToken` until the listing ends or the page cap is hit.

use crate::error::AgentError;
use crate::models::{BalanceSet, TokenBalance};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info};

pub const DEFAULT_GLACIER_URL: &str = "https://glacier-api.avax.network";
pub const DEFAULT_CHAIN_ID: &str = "43114";
const MAX_PAGES: usize = 10;

#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn list_balances(&self, address: &str, page_size: u32) -> Result<BalanceSet>;
}

pub struct GlacierBalanceSource {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    chain_id: String,
}

impl GlacierBalanceSource {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<String>,
        chain_id: impl Into<String>,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(4)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url
                .as_deref()
                .unwrap_or(DEFAULT_GLACIER_URL)
                .trim_end_matches('/')
                .to_string(),
            chain_id: chain_id.into(),
        })
    }

    fn url(&self, address: &str) -> String {
        format!(
            "{}/v1/chains/{}/addresses/{}/balances:listErc20",
            self.base_url, self.chain_id, address
        )
    }

    async fn fetch_page(
        &self,
        address: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<Erc20Page> {
        let mut request = self
            .client
            .get(self.url(address))
            .query(&[("pageSize", page_size.to_string())]);

        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        if let Some(key) = &self.api_key {
            request = request.header("x-glacier-api-key", key);
        }

        let response = request.send().await.map_err(|e| {
            error!("Balance request failed: {}", e);
            AgentError::BalanceSource(format!("Glacier request failed: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::BalanceSource(format!(
                "Glacier returned {}: {}",
                status.as_u16(),
                body
            )));
        }

        response.json::<Erc20Page>().await.map_err(|e| {
            AgentError::BalanceSource(format!("Invalid Glacier response: {}", e))
        })
    }
}

#[async_trait]
impl BalanceSource for GlacierBalanceSource {
    async fn list_balances(&self, address: &str, page_size: u32) -> Result<BalanceSet> {
        let mut balances = Vec::new();
        let mut page_token: Option<String> = None;

        for page in 0..MAX_PAGES {
            let result = self
                .fetch_page(address, page_size, page_token.as_deref())
                .await?;

            debug!(page, count = result.erc20_token_balances.len(), "Fetched balance page");
            balances.extend(result.erc20_token_balances);

            match result.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        info!(address, tokens = balances.len(), "Balances loaded");

        Ok(BalanceSet {
            address: address.to_string(),
            chain_id: self.chain_id.clone(),
            balances,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Erc20Page {
    #[serde(default)]
    erc20_token_balances: Vec<TokenBalance>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::routing::get;
    use axum::{Json, Router};
    use std::collections::HashMap;

    fn token(symbol: &str, usd: f64) -> serde_json::Value {
        serde_json::json!({
            "address": format!("0x{}", symbol.to_lowercase()),
            "name": symbol,
            "symbol": symbol,
            "decimals": 18,
            "balance": "1000000000000000000",
            "balanceValueUsd": usd
        })
    }

    async fn glacier_mock() -> String {
        let app = Router::new().route(
            "/v1/chains/:chain/addresses/*rest",
            get(
                |Path((chain, _rest)): Path<(String, String)>,
                 Query(params): Query<HashMap<String, String>>| async move {
                    assert_eq!(chain, "43114");
                    match params.get("pageToken").map(String::as_str) {
                        None => Json(serde_json::json!({
                            "erc20TokenBalances": [token("USDC", 1200.0)],
                            "nextPageToken": "p2"
                        })),
                        Some(_) => Json(serde_json::json!({
                            "erc20TokenBalances": [token("WAVAX", 300.0)]
                        })),
                    }
                },
            ),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_follows_page_tokens() {
        let base = glacier_mock().await;
        let source =
            GlacierBalanceSource::new(Some("key".into()), Some(base), DEFAULT_CHAIN_ID).unwrap();

        let set = source.list_balances("0xwallet", 100).await.unwrap();
        assert_eq!(set.balances.len(), 2);
        assert_eq!(set.balances[0].symbol, "USDC");
        assert_eq!(set.balances[1].symbol, "WAVAX");
        assert_eq!(set.total_value_usd(), 1500.0);
    }

    #[test]
    fn test_blank_api_key_is_dropped() {
        let source = GlacierBalanceSource::new(Some("  ".into()), None, "43114").unwrap();
        assert!(source.api_key.is_none());
        assert_eq!(
            source.url("0xabc"),
            "https://glacier-api.avax.network/v1/chains/43114/addresses/0xabc/balances:listErc20"
        );
    }
}
