//! Scan scheduler
//!
//! Rate-limited, single-flight portfolio scan: fetch balances, ask the agent
//! to analyze yield opportunities, then ask it to execute the best strategy
//! under fixed allocation constraints.
//!
//! Idle → (interval elapsed?) → Running → Idle

use crate::agent::AgentInvoker;
use crate::balances::BalanceSource;
use crate::error::AgentError;
use crate::models::{BalanceSet, ExecutionOutcome};
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Constraints handed to the agent with the execute instruction
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPolicy {
    pub max_protocol_allocation_pct: u8,
    pub min_pool_liquidity_usd: u64,
    pub min_protocol_age_days: u32,
    pub page_size: u32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            max_protocol_allocation_pct: 70,
            min_pool_liquidity_usd: 1000,
            min_protocol_age_days: 30,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScanState {
    /// `None` until the first completed run
    pub last_run_at: Option<Instant>,
    pub min_interval: Duration,
}

impl ScanState {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_run_at {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    fn record_run(&mut self, at: Instant) {
        self.last_run_at = Some(match self.last_run_at {
            Some(previous) => previous.max(at),
            None => at,
        });
    }
}

/// Why a trigger did not start a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotConfigured,
    InFlight,
    NotDue,
}

/// What one trigger of the scheduler did
#[derive(Debug)]
pub enum ScanReport {
    Completed(ExecutionOutcome),
    Skipped(SkipReason),
    /// The run started and failed; `last_run_at` was left alone.
    Failed(AgentError),
}

impl ScanReport {
    pub fn into_outcome(self) -> Option<ExecutionOutcome> {
        match self {
            ScanReport::Completed(outcome) => Some(outcome),
            ScanReport::Skipped(_) | ScanReport::Failed(_) => None,
        }
    }
}

pub struct ScanScheduler {
    agent: Option<Arc<dyn AgentInvoker>>,
    balances: Option<Arc<dyn BalanceSource>>,
    wallet_address: String,
    policy: ScanPolicy,
    // Single-flight guard, held for the whole run.
    run_guard: Mutex<()>,
    state: watch::Sender<ScanState>,
}

impl ScanScheduler {
    pub fn new(
        agent: Option<Arc<dyn AgentInvoker>>,
        balances: Option<Arc<dyn BalanceSource>>,
        wallet_address: impl Into<String>,
        min_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ScanState {
            last_run_at: None,
            min_interval,
        });
        Self {
            agent,
            balances,
            wallet_address: wallet_address.into(),
            policy: ScanPolicy::default(),
            run_guard: Mutex::new(()),
            state,
        }
    }

    pub fn with_policy(mut self, policy: ScanPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ScanPolicy {
        &self.policy
    }

    /// Start of the last completed run, readable while another run is in flight.
    pub fn last_run_at(&self) -> Option<Instant> {
        self.state.borrow().last_run_at
    }

    /// Receiver that observes every recorded run
    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    /// Run one scan if it is due.
    ///
    /// `Ok(None)` covers both a skipped trigger and a failed run; failures are
    /// logged and leave `last_run_at` untouched so the next qualifying tick
    /// tries again. Use [`run_scan`](Self::run_scan) to tell them apart.
    pub async fn scan_and_optimize(&self) -> Result<Option<ExecutionOutcome>> {
        Ok(self.run_scan().await.into_outcome())
    }

    pub async fn run_scan(&self) -> ScanReport {
        let (Some(agent), Some(balances)) = (&self.agent, &self.balances) else {
            debug!("Scan skipped: agent or balance source not configured");
            return ScanReport::Skipped(SkipReason::NotConfigured);
        };

        let Ok(_running) = self.run_guard.try_lock() else {
            debug!("Scan skipped: a run is already in flight");
            return ScanReport::Skipped(SkipReason::InFlight);
        };

        let now = Instant::now();
        if !self.state.borrow().is_due(now) {
            debug!("Scan skipped: minimum interval not elapsed");
            return ScanReport::Skipped(SkipReason::NotDue);
        }

        info!(address = %self.wallet_address, "Portfolio scan starting");

        match self.run(agent.as_ref(), balances.as_ref()).await {
            Ok(outcome) => {
                self.state.send_modify(|state| state.record_run(now));
                info!("Portfolio scan completed");
                ScanReport::Completed(outcome)
            }
            Err(e) => {
                error!("Portfolio optimization failed: {}", e);
                ScanReport::Failed(e)
            }
        }
    }

    async fn run(
        &self,
        agent: &dyn AgentInvoker,
        balances: &dyn BalanceSource,
    ) -> Result<ExecutionOutcome> {
        let portfolio = balances
            .list_balances(&self.wallet_address, self.policy.page_size)
            .await?;

        let analysis = agent.invoke(&analysis_instruction(&portfolio)?).await?;
        debug!(analysis_len = analysis.output.len(), "Yield analysis received");

        agent
            .invoke(&execution_instruction(&self.policy, &analysis.output))
            .await
    }
}

fn analysis_instruction(portfolio: &BalanceSet) -> Result<String> {
    Ok(format!(
        "Analyze yield opportunities on Avalanche with these balances: {}",
        serde_json::to_string(portfolio)?
    ))
}

fn execution_instruction(policy: &ScanPolicy, analysis: &str) -> String {
    format!(
        "Based on the analysis below, execute the most profitable yield strategy with:\n\
         - Max {}% allocation per protocol\n\
         - Min ${} liquidity per pool\n\
         - Avoid new protocols (<{} days)\n\n\
         Analysis:\n{}",
        policy.max_protocol_allocation_pct,
        policy.min_pool_liquidity_usd,
        policy.min_protocol_age_days,
        analysis
    )
}

/// Drive `scan_and_optimize` from a timer until `shutdown` fires.
pub fn spawn_periodic(
    scheduler: Arc<ScanScheduler>,
    tick: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_secs = tick.as_secs(), "Scan driver started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scan driver stopped");
                    break;
                }
                _ = interval.tick() => {
                    match scheduler.run_scan().await {
                        ScanReport::Completed(outcome) => {
                            info!(output_len = outcome.output.len(), "Scheduled scan executed");
                        }
                        ScanReport::Skipped(reason) => debug!(?reason, "Scheduled scan skipped"),
                        ScanReport::Failed(e) => {
                            warn!("Scheduled scan failed, will retry on next tick: {}", e)
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TokenBalance;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedBalances {
        calls: AtomicU32,
        fail: AtomicBool,
    }

    impl FixedBalances {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BalanceSource for FixedBalances {
        async fn list_balances(&self, address: &str, _page_size: u32) -> Result<BalanceSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::BalanceSource("glacier down".into()));
            }
            Ok(BalanceSet {
                address: address.to_string(),
                chain_id: "43114".into(),
                balances: vec![TokenBalance {
                    address: "0xusdc".into(),
                    name: "USD Coin".into(),
                    symbol: "USDC".into(),
                    decimals: 6,
                    balance: "5000000000".into(),
                    balance_value_usd: Some(5000.0),
                }],
            })
        }
    }

    struct ScriptedAgent {
        instructions: StdMutex<Vec<String>>,
        delay: Duration,
    }

    impl ScriptedAgent {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                instructions: StdMutex::new(Vec::new()),
                delay,
            })
        }

        fn instructions(&self) -> Vec<String> {
            self.instructions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentInvoker for ScriptedAgent {
        async fn invoke(&self, instruction: &str) -> Result<ExecutionOutcome> {
            self.instructions.lock().unwrap().push(instruction.to_string());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if instruction.starts_with("Analyze") {
                Ok(ExecutionOutcome::new("Pool A yields 12%"))
            } else {
                Ok(ExecutionOutcome::new("Moved 60% into pool A"))
            }
        }
    }

    fn scheduler(agent: Arc<ScriptedAgent>, balances: Arc<FixedBalances>) -> ScanScheduler {
        ScanScheduler::new(Some(agent), Some(balances), "0xwallet", DEFAULT_SCAN_INTERVAL)
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sequences_analyze_then_execute() {
        let agent = ScriptedAgent::new(Duration::ZERO);
        let balances = FixedBalances::new();
        let scheduler = scheduler(Arc::clone(&agent), Arc::clone(&balances));

        let outcome = scheduler.scan_and_optimize().await.unwrap().unwrap();
        assert_eq!(outcome.output, "Moved 60% into pool A");

        let instructions = agent.instructions();
        assert_eq!(instructions.len(), 2);
        assert!(instructions[0].contains("\"symbol\":\"USDC\""));
        assert!(instructions[1].contains("Max 70% allocation per protocol"));
        assert!(instructions[1].contains("Min $1000 liquidity per pool"));
        assert!(instructions[1].contains("(<30 days)"));
        assert!(instructions[1].contains("Pool A yields 12%"));
        assert!(scheduler.last_run_at().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_within_interval_is_noop() {
        let agent = ScriptedAgent::new(Duration::ZERO);
        let balances = FixedBalances::new();
        let scheduler = scheduler(Arc::clone(&agent), Arc::clone(&balances));

        assert!(scheduler.scan_and_optimize().await.unwrap().is_some());
        let first = scheduler.last_run_at();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(scheduler.scan_and_optimize().await.unwrap().is_none());

        assert_eq!(scheduler.last_run_at(), first);
        assert_eq!(balances.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_again_after_interval_and_never_moves_backwards() {
        let agent = ScriptedAgent::new(Duration::ZERO);
        let balances = FixedBalances::new();
        let scheduler = scheduler(Arc::clone(&agent), Arc::clone(&balances));

        let mut previous = None;
        for _ in 0..3 {
            assert!(scheduler.scan_and_optimize().await.unwrap().is_some());
            let current = scheduler.last_run_at();
            assert!(current >= previous);
            previous = current;
            tokio::time::advance(DEFAULT_SCAN_INTERVAL).await;
        }
        assert_eq!(balances.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_leaves_last_run_unchanged() {
        let agent = ScriptedAgent::new(Duration::ZERO);
        let balances = FixedBalances::new();
        balances.fail.store(true, Ordering::SeqCst);
        let scheduler = scheduler(Arc::clone(&agent), Arc::clone(&balances));

        assert!(matches!(scheduler.scan_and_optimize().await, Ok(None)));
        assert!(scheduler.last_run_at().is_none());
        assert!(matches!(
            scheduler.run_scan().await,
            ScanReport::Failed(AgentError::BalanceSource(_))
        ));
        assert!(agent.instructions().is_empty());

        // Next tick retries immediately because nothing was recorded.
        balances.fail.store(false, Ordering::SeqCst);
        assert!(scheduler.scan_and_optimize().await.unwrap().is_some());
    }

    struct FailingAgent;

    #[async_trait]
    impl AgentInvoker for FailingAgent {
        async fn invoke(&self, _instruction: &str) -> Result<ExecutionOutcome> {
            Err(AgentError::Agent("model refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_failure_yields_none_and_reports_failure() {
        let balances = FixedBalances::new();
        let scheduler = ScanScheduler::new(
            Some(Arc::new(FailingAgent)),
            Some(balances),
            "0xwallet",
            DEFAULT_SCAN_INTERVAL,
        );

        assert!(matches!(scheduler.scan_and_optimize().await, Ok(None)));
        assert!(scheduler.last_run_at().is_none());
        assert!(matches!(
            scheduler.run_scan().await,
            ScanReport::Failed(AgentError::Agent(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_run_visible_during_later_run() {
        let agent = ScriptedAgent::new(Duration::from_secs(5));
        let balances = FixedBalances::new();
        let scheduler = Arc::new(scheduler(Arc::clone(&agent), Arc::clone(&balances)));

        assert!(scheduler.scan_and_optimize().await.unwrap().is_some());
        let before = scheduler.last_run_at();
        assert!(before.is_some());

        tokio::time::advance(DEFAULT_SCAN_INTERVAL).await;
        let running = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.scan_and_optimize().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(
            scheduler.run_scan().await,
            ScanReport::Skipped(SkipReason::InFlight)
        ));
        let during = scheduler.last_run_at();
        assert!(during >= before);

        assert!(running.await.unwrap().unwrap().is_some());
        assert!(scheduler.last_run_at() > during);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_scheduler_is_noop() {
        let scheduler = ScanScheduler::new(None, None, "0xwallet", DEFAULT_SCAN_INTERVAL);
        assert!(scheduler.scan_and_optimize().await.unwrap().is_none());
        assert!(scheduler.last_run_at().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_triggers_run_once() {
        let agent = ScriptedAgent::new(Duration::from_secs(5));
        let balances = FixedBalances::new();
        let scheduler = Arc::new(scheduler(Arc::clone(&agent), Arc::clone(&balances)));

        let first = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.scan_and_optimize().await }
        });
        let second = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            async move { scheduler.scan_and_optimize().await }
        });

        let results = [first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(balances.calls.load(Ordering::SeqCst), 1);
        assert_eq!(agent.instructions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_driver_stops_on_shutdown() {
        let agent = ScriptedAgent::new(Duration::ZERO);
        let balances = FixedBalances::new();
        let scheduler = Arc::new(scheduler(Arc::clone(&agent), Arc::clone(&balances)));
        let shutdown = CancellationToken::new();

        let handle = spawn_periodic(
            Arc::clone(&scheduler),
            Duration::from_secs(60),
            shutdown.clone(),
        );

        // First tick fires immediately, the next four fall inside the interval.
        tokio::time::sleep(Duration::from_secs(250)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(balances.calls.load(Ordering::SeqCst), 1);
    }
}
