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

//! Simulation Batch Runner
//!
//! Fans a batch out into independent conversations:
//! - Configuration is validated and every template resolved before the
//!   first dispatch; only these errors fail the batch
//! - At most `max_concurrency` conversations are in flight
//! - A failing, timed-out or panicking conversation is recorded on its own
//!   run and never affects its siblings
//! - Cancellation stops dispatch and propagates to in-flight runs; runs
//!   already aggregated are kept

use crate::agent::{panic_message, AgentFactory};
use crate::aggregate::ResultAggregator;
use crate::hallucination::{ClaimVerifier, HallucinationDetector, LlmClaimVerifier, RetrievalVerifier};
use crate::judge::{AutonomousJudge, HeuristicInvestigator, Investigator, LlmInvestigator};
use crate::knowledge_base::{InMemoryKnowledgeBase, KnowledgeBase};
use crate::llm_client::LLMClient;
use crate::orchestrator::{ConversationOrchestrator, EvaluationSuite};
use crate::persona::PersonaGenerator;
use crate::rules::{HeuristicRuleJudge, LlmRuleJudge, RuleEvaluator, RuleJudge};
use crate::simulator::{LlmUserSimulator, PersonaSimulator, UserSimulator};
use agentsim_core::{
    EvaluationResultSet, Persona, SimulationConfig, SimulationResult, SimulationRun,
    TerminationReason, TestCase,
};
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SimulationBatchRunner {
    config: SimulationConfig,
    factory: AgentFactory,
    knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    rule_judge: Arc<dyn RuleJudge>,
    verifier: Arc<dyn ClaimVerifier>,
    investigator: Arc<dyn Investigator>,
    simulator: Arc<dyn UserSimulator>,
    cancel: CancellationToken,
}

impl SimulationBatchRunner {
    /// Runner with the deterministic heuristic evaluators
    pub fn new(config: SimulationConfig, factory: AgentFactory) -> Self {
        Self {
            config,
            factory,
            knowledge_base: None,
            rule_judge: Arc::new(HeuristicRuleJudge),
            verifier: Arc::new(RetrievalVerifier::default()),
            investigator: Arc::new(HeuristicInvestigator::default()),
            simulator: Arc::new(PersonaSimulator::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Use a pre-indexed knowledge base instead of `config.knowledge_base`
    pub fn with_knowledge_base(mut self, kb: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge_base = Some(kb);
        self
    }

    pub fn with_rule_judge(mut self, judge: Arc<dyn RuleJudge>) -> Self {
        self.rule_judge = judge;
        self
    }

    pub fn with_claim_verifier(mut self, verifier: Arc<dyn ClaimVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_investigator(mut self, investigator: Arc<dyn Investigator>) -> Self {
        self.investigator = investigator;
        self
    }

    pub fn with_simulator(mut self, simulator: Arc<dyn UserSimulator>) -> Self {
        self.simulator = simulator;
        self
    }

    /// Back rule judging, investigation and user simulation with an LLM;
    /// claim verification too when `verify_claims` is set
    pub fn with_llm(mut self, llm: Arc<dyn LLMClient>, verify_claims: bool) -> Self {
        self.rule_judge = Arc::new(LlmRuleJudge::new(llm.clone()));
        self.investigator = Arc::new(LlmInvestigator::new(llm.clone()));
        self.simulator = Arc::new(LlmUserSimulator::new(llm.clone()));
        if verify_claims {
            self.verifier = Arc::new(LlmClaimVerifier::new(llm));
        }
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels this batch
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolve everything a conversation needs; any error here is a
    /// configuration error
    fn prepare(&self) -> SimulationResult<(Arc<EvaluationSuite>, PersonaGenerator, Vec<TestCase>)> {
        let config = &self.config;
        config.validate()?;
        let rules = config.parsed_rules()?;

        let generator =
            PersonaGenerator::from_template(&config.persona.template, config.persona.context.clone())?;

        let knowledge_base = match (&self.knowledge_base, &config.knowledge_base) {
            (Some(kb), _) => Some(kb.clone()),
            (None, Some(kb_config)) => {
                Some(Arc::new(InMemoryKnowledgeBase::from_config(kb_config)?) as Arc<dyn KnowledgeBase>)
            }
            (None, None) => None,
        };

        let suite = EvaluationSuite {
            rules: rules.into(),
            rule_evaluator: RuleEvaluator::new(self.rule_judge.clone()),
            hallucination: Arc::new(
                HallucinationDetector::new(self.verifier.clone()).with_config(&config.hallucination),
            ),
            knowledge_base,
            judge: AutonomousJudge::new(self.investigator.clone()).with_config(&config.judge),
            simulator: self.simulator.clone(),
            context: config.context.clone(),
            goal: config.goal.clone(),
            credentials: config.credentials.clone(),
            max_turns: config.max_turns,
            agent_timeout: config.agent_timeout(),
            run_timeout: config.run_timeout(),
        };

        Ok((Arc::new(suite), generator, config.effective_test_cases()))
    }

    /// Run the batch. Fails only on configuration errors; every dispatched
    /// conversation is in the result set with its terminal status.
    pub async fn run(&self) -> SimulationResult<EvaluationResultSet> {
        let (suite, generator, test_cases) = self.prepare()?;
        let config = &self.config;
        let batch_id = Uuid::new_v4();

        tracing::info!(
            batch_id = %batch_id,
            simulations = config.num_simulations,
            max_turns = config.max_turns,
            concurrency = config.max_concurrency,
            personas = generator.available(),
            rules = suite.rules.len(),
            "batch started"
        );

        let personas = generator.stream(
            config.persona.strategy,
            config.num_simulations,
            config.persona.seed,
        );
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let aggregator = ResultAggregator::new();
        let mut tasks = JoinSet::new();
        let mut dispatched = 0;

        for (index, persona) in personas.enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let test_case = test_cases[index % test_cases.len()].clone();
            let factory = self.factory.clone();
            let suite = suite.clone();
            let cancel = self.cancel.child_token();
            let aggregator = aggregator.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let fallback = (persona.clone(), test_case.clone(), suite.max_turns);
                let conversation = AssertUnwindSafe(async move {
                    let agent = factory();
                    ConversationOrchestrator::new(index, persona, test_case, agent, suite)
                        .with_cancellation(cancel)
                        .run()
                        .await
                });
                let run = match conversation.catch_unwind().await {
                    Ok(run) => run,
                    Err(panic) => panicked_run(index, fallback, panic),
                };
                aggregator.append(run);
            });
            dispatched += 1;
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(batch_id = %batch_id, error = %e, "conversation task aborted");
            }
        }

        let cancelled = self.cancel.is_cancelled();
        if cancelled {
            tracing::warn!(
                batch_id = %batch_id,
                dispatched,
                requested = config.num_simulations,
                "batch cancelled"
            );
        }

        let results = aggregator.finish(
            batch_id,
            config.num_simulations,
            cancelled,
            suite.rules.to_vec(),
        );
        tracing::info!(
            batch_id = %batch_id,
            runs = results.summary.total_runs,
            completed = results.summary.completed,
            failed = results.summary.failed,
            timed_out = results.summary.timed_out,
            pass_rate = results.summary.pass_rate,
            "batch finished"
        );
        Ok(results)
    }
}

/// Failed run standing in for a conversation that panicked outside the
/// agent invocation
fn panicked_run(
    index: usize,
    (persona, test_case, max_turns): (Persona, TestCase, usize),
    panic: Box<dyn Any + Send>,
) -> SimulationRun {
    let message = panic_message(panic.as_ref());
    tracing::error!(index, error = %message, "conversation panicked");
    let now = Utc::now();
    SimulationRun {
        run_id: Uuid::new_v4(),
        index,
        persona,
        test_case,
        max_turns,
        turns: Vec::new(),
        conversation_verdicts: Vec::new(),
        issues: Vec::new(),
        status: TerminationReason::AgentError.status(),
        termination: TerminationReason::AgentError,
        error: Some(format!("agent panicked: {}", message)),
        diagnostics: Vec::new(),
        started_at: now,
        finished_at: now,
    }
}
