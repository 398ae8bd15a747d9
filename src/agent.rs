//! Agent invocation target
//!
//! The scheduler and the chat server hand natural-language instructions to an
//! agent and get back an opaque outcome. `CompletionAgent` is the
//! provider-backed implementation; anything else that can reason and act can
//! stand in behind the same trait.

use crate::models::ExecutionOutcome;
use crate::provider::CompletionService;
use crate::retry::RetryPolicy;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

const SYSTEM_PROMPT: &str = r#"You are an autonomous DeFi portfolio agent.

Guidelines:
- Reason step by step about yields, liquidity and protocol risk
- Respect every constraint given in the instruction
- State clearly which actions you would take and why
- Never invent balances that were not provided

Format: concise, structured answers suitable for execution review."#;

/// Opaque natural-language action executor
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, instruction: &str) -> Result<ExecutionOutcome>;
}

/// Agent backed by the completion provider, with backoff around every call
pub struct CompletionAgent {
    completions: Arc<CompletionService>,
    retry_policy: RetryPolicy,
    system_prompt: String,
}

impl CompletionAgent {
    pub fn new(completions: Arc<CompletionService>, retry_policy: RetryPolicy) -> Self {
        Self {
            completions,
            retry_policy,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

#[async_trait]
impl AgentInvoker for CompletionAgent {
    async fn invoke(&self, instruction: &str) -> Result<ExecutionOutcome> {
        info!(
            provider = %self.completions.provider(),
            instruction_len = instruction.len(),
            "Invoking agent"
        );

        let system = self.system_prompt.as_str();
        let output = crate::retry::execute(&self.retry_policy, || {
            self.completions
                .generate_completion_with_system(instruction, Some(system))
        })
        .await?;

        Ok(ExecutionOutcome::new(output))
    }
}
