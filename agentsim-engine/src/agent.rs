// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Target Agent Contract
//!
//! The engine treats the agent under test as a black box reachable through
//! [`TargetAgent`]. Adapters are provided for:
//! - Local async closures ([`FnAgent`])
//! - HTTP webhook workflows ([`crate::webhook::WebhookAgent`])
//!
//! Every simulation gets a fresh agent from an [`AgentFactory`], so agents
//! may keep per-conversation state without synchronizing across runs.

use agentsim_core::{AgentOutput, Attachment, SimulationError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during agent invocation
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent invocation failed: {0}")]
    InvocationFailed(String),

    #[error("Agent timeout after {0:?}")]
    Timeout(Duration),

    #[error("Agent returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Agent rate limited, retry after {0:?}")]
    RateLimited(Option<Duration>),

    #[error("Agent authentication failed")]
    AuthenticationFailed,
}

impl From<AgentError> for SimulationError {
    fn from(e: AgentError) -> Self {
        match e {
            AgentError::Timeout(d) => SimulationError::Timeout(d),
            other => SimulationError::AgentInvocation(other.to_string()),
        }
    }
}

/// One earlier exchange of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub user: String,
    pub agent: String,
}

/// What the agent receives for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    /// Simulated-user message for this turn
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Persona user context plus test-case context and goal
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Prior exchanges, oldest first
    #[serde(default)]
    pub history: Vec<Exchange>,
    pub turn_index: usize,
    /// Per-call credentials from the batch configuration
    #[serde(default, skip_serializing)]
    pub credentials: BTreeMap<String, String>,
}

impl AgentInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }
}

/// Agent under test
#[async_trait]
pub trait TargetAgent: Send + Sync {
    /// Produce a response for one turn
    async fn invoke(&self, input: AgentInput) -> Result<AgentOutput, AgentError>;

    /// Identifier used in logs
    fn agent_id(&self) -> &str {
        "target-agent"
    }
}

/// Builds a fresh agent for every simulation
pub type AgentFactory = Arc<dyn Fn() -> Arc<dyn TargetAgent> + Send + Sync>;

/// Text of a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Adapter for local async closures
pub struct FnAgent<F> {
    id: String,
    func: F,
}

impl<F, Fut> FnAgent<F>
where
    F: Fn(AgentInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentOutput, AgentError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self {
            id: "fn-agent".to_string(),
            func,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Box into a shareable trait object
    pub fn shared(func: F) -> Arc<dyn TargetAgent> {
        Arc::new(Self::new(func))
    }
}

#[async_trait]
impl<F, Fut> TargetAgent for FnAgent<F>
where
    F: Fn(AgentInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentOutput, AgentError>> + Send + 'static,
{
    async fn invoke(&self, input: AgentInput) -> Result<AgentOutput, AgentError> {
        (self.func)(input).await
    }

    fn agent_id(&self) -> &str {
        &self.id
    }
}

/// Wrapper that adds retry logic to any agent
pub struct RetryingAgent {
    inner: Arc<dyn TargetAgent>,
    max_retries: u32,
    base_delay: Duration,
}

impl RetryingAgent {
    pub fn new(inner: Arc<dyn TargetAgent>) -> Self {
        Self {
            inner,
            max_retries: 2,
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base delay for exponential backoff
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

#[async_trait]
impl TargetAgent for RetryingAgent {
    async fn invoke(&self, input: AgentInput) -> Result<AgentOutput, AgentError> {
        let mut attempt = 0;
        loop {
            match self.inner.invoke(input.clone()).await {
                Ok(output) => return Ok(output),
                Err(AgentError::RateLimited(retry_after)) if attempt < self.max_retries => {
                    let delay = retry_after.unwrap_or_else(|| self.backoff(attempt));
                    tracing::debug!(agent = self.agent_id(), ?delay, "rate limited, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(AgentError::NetworkError(e)) if attempt < self.max_retries => {
                    tracing::debug!(agent = self.agent_id(), error = %e, "network error, retrying");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                Err(e) => return Err(e),
            }
            attempt += 1;
        }
    }

    fn agent_id(&self) -> &str {
        self.inner.agent_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_fn_agent_sees_input() {
        let agent = FnAgent::new(|input: AgentInput| async move {
            Ok::<_, AgentError>(AgentOutput::text(format!(
                "turn {} echo {}",
                input.turn_index, input.prompt
            )))
        })
        .with_id("echo");

        let mut input = AgentInput::new("hello");
        input.turn_index = 2;
        let output = agent.invoke(input).await.unwrap();

        assert_eq!(output.text, "turn 2 echo hello");
        assert_eq!(agent.agent_id(), "echo");
    }

    #[tokio::test]
    async fn test_retrying_agent_recovers_from_network_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = FnAgent::shared(move |_input: AgentInput| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(AgentError::NetworkError("reset".to_string()))
                } else {
                    Ok(AgentOutput::text("recovered"))
                }
            }
        });

        let agent = RetryingAgent::new(flaky).with_base_delay(Duration::from_millis(1));
        let output = agent.invoke(AgentInput::new("hi")).await.unwrap();

        assert_eq!(output.text, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_saturates() {
        let agent = RetryingAgent::new(FnAgent::shared(|_input: AgentInput| async {
            Ok::<_, AgentError>(AgentOutput::text("ok"))
        }));
        assert_eq!(agent.backoff(3), Duration::from_millis(800));
        assert!(agent.backoff(64) >= agent.backoff(31));
    }

    #[tokio::test]
    async fn test_retrying_agent_does_not_retry_auth_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let denied = FnAgent::shared(move |_input: AgentInput| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<AgentOutput, _>(AgentError::AuthenticationFailed) }
        });

        let agent = RetryingAgent::new(denied).with_base_delay(Duration::from_millis(1));
        assert!(matches!(
            agent.invoke(AgentInput::new("hi")).await,
            Err(AgentError::AuthenticationFailed)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_agent_timeout_maps_to_simulation_timeout() {
        let err: SimulationError = AgentError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, SimulationError::Timeout(_)));
        let err: SimulationError = AgentError::InvalidResponse("bad".into()).into();
        assert!(matches!(err, SimulationError::AgentInvocation(_)));
    }
}
