//! Core data models for the agent interaction layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Agent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed,
}

//
// ================= Chat =================
//

/// A single chat turn. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>, sender: Sender) -> Self {
        Self {
            text: text.into(),
            sender,
            timestamp: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text, Sender::User)
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(text, Sender::Agent)
    }
}

/// Observable state of one session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub connection_status: ConnectionStatus,
    pub is_agent_thinking: bool,
    pub transcript: Vec<ChatMessage>,
}

impl SessionState {
    pub fn connecting() -> Self {
        Self {
            connection_status: ConnectionStatus::Connecting,
            is_agent_thinking: false,
            transcript: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.connection_status == ConnectionStatus::Open
    }
}

//
// ================= Wire Events =================
//

pub const AGENT_RESPONSE: &str = "agent_response";
pub const AGENT_ERROR: &str = "agent_error";

/// Structured event carried as a text frame: `{type, message?, ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl InboundEvent {
    pub fn agent_response(message: impl Into<String>) -> Self {
        Self {
            kind: AGENT_RESPONSE.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn agent_error(message: impl Into<String>) -> Self {
        Self {
            kind: AGENT_ERROR.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn is_agent_response(&self) -> bool {
        self.kind == AGENT_RESPONSE
    }
}

//
// ================= Portfolio =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenBalance {
    pub address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u32,
    /// Raw integer amount as reported by the chain, kept as a string.
    pub balance: String,
    #[serde(default)]
    pub balance_value_usd: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BalanceSet {
    pub address: String,
    pub chain_id: String,
    pub balances: Vec<TokenBalance>,
}

impl BalanceSet {
    pub fn total_value_usd(&self) -> f64 {
        self.balances
            .iter()
            .filter_map(|b| b.balance_value_usd)
            .sum()
    }
}

/// Opaque result of an agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            completed_at: Utc::now(),
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Sender::User => "user",
            Sender::Agent => "agent",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}
