//! Portfolio Agent
//!
//! Interaction and resilience layer of an autonomous DeFi portfolio agent:
//! - Retries flaky calls with exponential backoff
//! - Routes completions to one configured AI provider
//! - Runs rate-limited, single-flight portfolio scans
//! - Keeps a client-side chat session with the agent over a WebSocket
//!
//! SCAN LOOP:
//! TICK → DUE? → BALANCES → ANALYZE → EXECUTE → RECORD

pub mod agent;
pub mod api;
pub mod balances;
pub mod config;
pub mod error;
pub mod models;
pub mod persistence;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use provider::{CompletionService, Provider, ProviderSettings};
pub use retry::RetryPolicy;
pub use scheduler::ScanScheduler;
pub use session::{SessionChannel, SessionConfig};
