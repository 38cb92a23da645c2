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

//! # Agentsim Simulation Engine
//!
//! Drives simulated multi-turn conversations against a caller-supplied agent
//! and evaluates every turn and every conversation.
//!
//! ## Features
//!
//! - **Persona generation**: attribute axes or uploaded records, with
//!   sequential, seeded random and round-robin assignment
//! - **Conversation orchestration**: per-run state machine with per-invocation
//!   and per-run timeouts
//! - **Rule evaluation**: binary verdicts for natural-language rules
//! - **Hallucination detection**: claims verified against a knowledge base
//! - **Autonomous judge**: rule-independent issue investigation
//! - **Batch execution**: bounded concurrency, failure isolation, cancellation
//! - **Export**: evaluation JSON, RLHF trajectories, compliance reports
//!
//! ## Example
//!
//! ```rust,ignore
//! use agentsim_core::{AgentOutput, SimulationConfig};
//! use agentsim_engine::{AgentError, AgentFactory, FnAgent, SimulationBatchRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SimulationConfig {
//!         num_simulations: 3,
//!         max_turns: 2,
//!         rules: vec!["Must not exceed 10 words".to_string()],
//!         ..Default::default()
//!     };
//!
//!     let factory: AgentFactory = Arc::new(|| {
//!         FnAgent::shared(|_input| async { Ok::<_, AgentError>(AgentOutput::text("OK")) })
//!     });
//!     let results = SimulationBatchRunner::new(config, factory).run().await.unwrap();
//!     println!("pass rate: {}", results.summary.pass_rate);
//! }
//! ```

use thiserror::Error;

pub mod agent;
pub mod aggregate;
pub mod export;
pub mod hallucination;
pub mod judge;
pub mod knowledge_base;
pub mod llm_client;
pub mod orchestrator;
pub mod persona;
pub mod rules;
pub mod runner;
pub mod simulator;
pub mod text;
pub mod trace;
pub mod webhook;

pub use agent::{AgentError, AgentFactory, AgentInput, FnAgent, RetryingAgent, TargetAgent};
pub use aggregate::ResultAggregator;
pub use export::{parse_evaluation_json, ExportError, ExportFormat, Exporter};
pub use hallucination::{ClaimVerifier, HallucinationDetector, LlmClaimVerifier, RetrievalVerifier};
pub use judge::{AutonomousJudge, HeuristicInvestigator, Investigator, LlmInvestigator, Transcript};
pub use knowledge_base::{InMemoryKnowledgeBase, KnowledgeBase, Passage};
pub use llm_client::{LLMClient, OpenAIClient};
pub use orchestrator::{ConversationOrchestrator, EvaluationSuite};
pub use persona::{PersonaGenerator, PersonaStream};
pub use rules::{HeuristicRuleJudge, LlmRuleJudge, RuleEvaluator, RuleJudge};
pub use runner::SimulationBatchRunner;
pub use simulator::{LlmUserSimulator, PersonaSimulator, SimulatorContext, UserSimulator, UserTurn};
pub use trace::{traced, RecorderCallbacks, StepCallbacks, TraceHandle, TraceRecorder};
pub use webhook::WebhookAgent;

/// Errors raised by evaluation sub-steps (rules, claims, judge, simulator)
#[derive(Debug, Error)]
pub enum EvalError {
    /// The rule or check references context this scope does not have
    #[error("Missing context: {0}")]
    MissingContext(String),

    #[error("LLM client error: {0}")]
    LLMClientError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Evaluation timeout")]
    Timeout,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EvalError> for agentsim_core::SimulationError {
    fn from(e: EvalError) -> Self {
        agentsim_core::SimulationError::Evaluation(e.to_string())
    }
}

impl From<llm_client::LLMError> for EvalError {
    fn from(e: llm_client::LLMError) -> Self {
        EvalError::LLMClientError(e.to_string())
    }
}
