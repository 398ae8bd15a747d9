use portfolio_agent::{
    agent::{AgentInvoker, CompletionAgent},
    api::{start_server, ApiState},
    balances::{BalanceSource, GlacierBalanceSource},
    config::AppConfig,
    persistence::build_sink,
    provider::CompletionService,
    scheduler::{spawn_periodic, ScanScheduler},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    info!("🚀 Portfolio Agent - API Server");
    info!("📍 Port: {}", config.port);
    info!("🤖 Provider: {:?}", config.provider);

    // Create components
    let completions = Arc::new(CompletionService::new(config.provider.clone())?);
    info!("🔗 Completion endpoint: {}", completions.endpoint());

    let agent: Arc<dyn AgentInvoker> = Arc::new(CompletionAgent::new(
        Arc::clone(&completions),
        config.retry.clone(),
    ));
    let sink = build_sink(config.database_url.as_deref());

    let shutdown = CancellationToken::new();
    let scheduler = match config.scan.wallet_address.clone() {
        Some(wallet) => {
            let balances: Arc<dyn BalanceSource> = Arc::new(GlacierBalanceSource::new(
                config.glacier.api_key.clone(),
                config.glacier.base_url.clone(),
                config.glacier.chain_id.clone(),
            )?);
            let scheduler = Arc::new(ScanScheduler::new(
                Some(Arc::clone(&agent)),
                Some(balances),
                wallet,
                config.scan.min_interval,
            ));
            spawn_periodic(Arc::clone(&scheduler), config.scan.tick, shutdown.clone());
            info!("⏱️  Portfolio scans every {:?}", config.scan.min_interval);
            Some(scheduler)
        }
        None => {
            warn!("WALLET_ADDRESS not set, portfolio scans disabled");
            None
        }
    };

    let state = ApiState {
        completions,
        agent,
        scheduler,
        sink,
        retry_policy: config.retry,
    };

    info!("✅ Agent initialized");
    info!("📡 Starting API server...");

    let result = start_server(state, config.port).await;
    shutdown.cancel();
    result
}
