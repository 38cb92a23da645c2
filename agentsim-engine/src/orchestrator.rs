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

//! Conversation Orchestrator
//!
//! Drives one simulated conversation through the [`ConversationState`]
//! machine:
//!
//! 1. Bind persona, test case and rules; the test-case query is the first
//!    user message
//! 2. Invoke the agent with the current message (per-invocation timeout,
//!    tool events captured by a conversation-scoped [`TraceRecorder`])
//! 3. Evaluate the turn: tool-event rules, turn rules, hallucination claims
//! 4. Stop on max turns, goal satisfied or a terminal agent response, in that
//!    priority order; otherwise ask the simulated user for the next message
//!
//! When the conversation ends, conversation rules and the autonomous judge
//! run once over the full transcript. A run-level timeout or cancellation
//! keeps every turn completed before it fired.

use crate::agent::{panic_message, AgentError, AgentInput, Exchange, TargetAgent};
use crate::hallucination::HallucinationDetector;
use crate::judge::{AutonomousJudge, Transcript};
use crate::knowledge_base::KnowledgeBase;
use crate::rules::RuleEvaluator;
use crate::simulator::{PersonaSimulator, SimulatorContext, UserSimulator};
use crate::trace::TraceRecorder;
use crate::EvalError;
use agentsim_core::{
    AgentOutput, ConversationEvent, ConversationState, Persona, Rule, SimulationRun, TestCase,
    TerminationReason, ToolEvent, Turn,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Evaluators and limits shared by every conversation of a batch
#[derive(Clone)]
pub struct EvaluationSuite {
    pub rules: Arc<[Rule]>,
    pub rule_evaluator: RuleEvaluator,
    pub hallucination: Arc<HallucinationDetector>,
    /// Read-only; claims are skipped when unset
    pub knowledge_base: Option<Arc<dyn KnowledgeBase>>,
    pub judge: AutonomousJudge,
    pub simulator: Arc<dyn UserSimulator>,
    pub context: Option<String>,
    pub goal: Option<String>,
    pub credentials: BTreeMap<String, String>,
    pub max_turns: usize,
    /// Budget for one agent invocation and for each evaluation sub-step
    pub agent_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for EvaluationSuite {
    fn default() -> Self {
        Self {
            rules: Arc::from(Vec::new()),
            rule_evaluator: RuleEvaluator::default(),
            hallucination: Arc::new(HallucinationDetector::default()),
            knowledge_base: None,
            judge: AutonomousJudge::default(),
            simulator: Arc::new(PersonaSimulator::default()),
            context: None,
            goal: None,
            credentials: BTreeMap::new(),
            max_turns: 5,
            agent_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(600),
        }
    }
}

impl EvaluationSuite {
    pub fn with_rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules.into();
        self
    }

    pub fn with_knowledge_base(mut self, kb: Arc<dyn KnowledgeBase>) -> Self {
        self.knowledge_base = Some(kb);
        self
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_timeouts(mut self, agent: Duration, run: Duration) -> Self {
        self.agent_timeout = agent;
        self.run_timeout = run;
        self
    }
}

/// How the conversation loop ended
#[derive(Debug)]
struct Ending {
    reason: TerminationReason,
    error: Option<String>,
}

impl Ending {
    fn new(reason: TerminationReason) -> Self {
        Self {
            reason,
            error: None,
        }
    }

    fn with_error(reason: TerminationReason, error: impl Into<String>) -> Self {
        Self {
            reason,
            error: Some(error.into()),
        }
    }
}

/// Mutable conversation state, outliving the loop future so a timeout or
/// cancellation keeps what was recorded
#[derive(Debug)]
struct Progress {
    state: ConversationState,
    turns: Vec<Turn>,
    diagnostics: Vec<String>,
}

impl Progress {
    fn advance(&mut self, event: ConversationEvent) -> Result<(), Ending> {
        match self.state.transition(event) {
            Ok(next) => {
                self.state = next;
                Ok(())
            }
            Err(e) => Err(Ending::with_error(
                TerminationReason::AgentError,
                format!("internal state error: {}", e),
            )),
        }
    }

    /// Final transition; an already-terminated conversation stays as is
    fn close(&mut self, event: ConversationEvent) {
        if self.state.is_live() {
            if let Ok(next) = self.state.transition(event) {
                self.state = next;
            }
        }
    }
}

/// One simulated conversation
pub struct ConversationOrchestrator {
    run_id: Uuid,
    index: usize,
    persona: Persona,
    test_case: TestCase,
    agent: Arc<dyn TargetAgent>,
    suite: Arc<EvaluationSuite>,
    cancel: CancellationToken,
    recorder: TraceRecorder,
}

impl ConversationOrchestrator {
    pub fn new(
        index: usize,
        persona: Persona,
        test_case: TestCase,
        agent: Arc<dyn TargetAgent>,
        suite: Arc<EvaluationSuite>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            index,
            persona,
            test_case,
            agent,
            suite,
            cancel: CancellationToken::new(),
            recorder: TraceRecorder::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Drive the conversation to a terminal state. Never fails: every
    /// outcome is recorded on the returned run.
    pub async fn run(self) -> SimulationRun {
        let started_at = Utc::now();
        let mut progress = Progress {
            state: ConversationState::Init,
            turns: Vec::new(),
            diagnostics: Vec::new(),
        };

        tracing::debug!(
            run_id = %self.run_id,
            persona = %self.persona.user_id,
            test_case = %self.test_case.id,
            "conversation started"
        );

        let ending = {
            let deadline = tokio::time::sleep(self.suite.run_timeout);
            tokio::pin!(deadline);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Ending::new(TerminationReason::Cancelled),
                _ = &mut deadline => Ending::with_error(
                    TerminationReason::Timeout,
                    format!("run exceeded {:?}", self.suite.run_timeout),
                ),
                ending = self.drive(&mut progress) => ending,
            }
        };

        match ending.reason {
            TerminationReason::Timeout => progress.close(ConversationEvent::Timeout),
            TerminationReason::Cancelled => progress.close(ConversationEvent::Cancel),
            _ => progress.close(ConversationEvent::Finish),
        }

        self.finalize(progress, ending, started_at).await
    }

    async fn drive(&self, progress: &mut Progress) -> Ending {
        match self.converse(progress).await {
            Ok(ending) | Err(ending) => ending,
        }
    }

    async fn converse(&self, progress: &mut Progress) -> Result<Ending, Ending> {
        use ConversationEvent::*;

        progress.advance(Bound)?;
        let mut message = self.test_case.query.clone();

        loop {
            let index = progress.turns.len();
            let started_at = Utc::now();
            let input = self.agent_input(&message, &progress.turns, index);

            let clock = Instant::now();
            let invocation = AssertUnwindSafe(tokio::time::timeout(
                self.suite.agent_timeout,
                self.agent.invoke(input),
            ));
            let invoked = self
                .recorder
                .scope(invocation.catch_unwind())
                .await
                .unwrap_or_else(|panic| {
                    Ok(Err(AgentError::InvocationFailed(format!(
                        "agent panicked: {}",
                        panic_message(panic.as_ref())
                    ))))
                });
            let latency_ms = clock.elapsed().as_millis() as u64;
            let tool_events = self.recorder.drain();

            let output = match invoked {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    tracing::warn!(run_id = %self.run_id, turn = index, error = %e, "agent invocation failed");
                    progress.advance(AgentFailed)?;
                    return Ok(Ending::with_error(TerminationReason::AgentError, e.to_string()));
                }
                Err(_) => {
                    let e = AgentError::Timeout(self.suite.agent_timeout);
                    tracing::warn!(run_id = %self.run_id, turn = index, error = %e, "agent invocation timed out");
                    progress.advance(Timeout)?;
                    return Ok(Ending::with_error(TerminationReason::Timeout, e.to_string()));
                }
            };
            progress.advance(AgentResponded)?;

            let turn = self
                .evaluate_turn(index, message, output, tool_events, started_at, latency_ms)
                .await;
            let terminal = turn.agent_output.terminal;
            tracing::debug!(
                run_id = %self.run_id,
                turn = index,
                violations = turn.violations().count(),
                claims = turn.claims.len(),
                "turn recorded"
            );
            progress.turns.push(turn);

            if progress.turns.len() >= self.suite.max_turns {
                progress.advance(Finish)?;
                return Ok(Ending::new(TerminationReason::MaxTurns));
            }
            progress.advance(TurnRecorded)?;

            let ctx = SimulatorContext {
                persona: &self.persona,
                test_case: &self.test_case,
                goal: self.goal(),
                turns: &progress.turns,
            };
            let reply = self.suite.simulator.next_turn(&ctx).await;
            match reply {
                Ok(user) if user.goal_satisfied => {
                    progress.advance(Finish)?;
                    return Ok(Ending::new(TerminationReason::GoalSatisfied));
                }
                _ if terminal => {
                    progress.advance(Finish)?;
                    return Ok(Ending::new(TerminationReason::AgentTerminated));
                }
                Ok(user) => {
                    progress.advance(UserMessage)?;
                    message = user.message;
                }
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, turn = index, error = %e, "user simulator failed");
                    progress.advance(Finish)?;
                    return Ok(Ending::with_error(
                        TerminationReason::SimulatorError,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    fn agent_input(&self, message: &str, turns: &[Turn], index: usize) -> AgentInput {
        let mut context = self.persona.context.clone();
        context.insert("user_id".into(), Value::String(self.persona.user_id.clone()));
        context.insert("persona".into(), Value::String(self.persona.describe()));
        if let Some(c) = self.test_case.context.as_ref().or(self.suite.context.as_ref()) {
            context.insert("context".into(), Value::String(c.clone()));
        }
        if let Some(g) = self.goal() {
            context.insert("goal".into(), Value::String(g.to_string()));
        }

        AgentInput {
            prompt: message.to_string(),
            attachments: Vec::new(),
            context,
            history: turns
                .iter()
                .map(|t| Exchange {
                    user: t.user_message.clone(),
                    agent: t.agent_output.text.clone(),
                })
                .collect(),
            turn_index: index,
            credentials: self.suite.credentials.clone(),
        }
    }

    fn goal(&self) -> Option<&str> {
        self.test_case
            .goal
            .as_deref()
            .or(self.suite.goal.as_deref())
    }

    /// Bound an evaluation sub-step by the per-invocation budget
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, EvalError>>,
    ) -> Result<T, EvalError> {
        tokio::time::timeout(self.suite.agent_timeout, fut)
            .await
            .unwrap_or(Err(EvalError::Timeout))
    }

    async fn evaluate_turn(
        &self,
        index: usize,
        user_message: String,
        agent_output: AgentOutput,
        mut tool_events: Vec<ToolEvent>,
        started_at: DateTime<Utc>,
        agent_latency_ms: u64,
    ) -> Turn {
        let suite = &self.suite;
        let mut diagnostics = Vec::new();

        let verdicts = match self
            .bounded(async {
                suite
                    .rule_evaluator
                    .evaluate_tool_events(index, &mut tool_events)
                    .await;
                Ok(suite
                    .rule_evaluator
                    .evaluate_turn(
                        &suite.rules,
                        index,
                        &user_message,
                        &agent_output,
                        &tool_events,
                        agent_latency_ms,
                    )
                    .await)
            })
            .await
        {
            Ok(verdicts) => verdicts,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, turn = index, error = %e, "rule evaluation failed");
                diagnostics.push(format!("rule evaluation failed: {}", e));
                for event in tool_events.iter_mut() {
                    event.verdicts.clear();
                }
                Vec::new()
            }
        };

        let claims = match self
            .bounded(
                suite
                    .hallucination
                    .detect(&agent_output.text, suite.knowledge_base.as_deref()),
            )
            .await
        {
            Ok(claims) => claims,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, turn = index, error = %e, "hallucination check failed");
                diagnostics.push(format!("hallucination check failed: {}", e));
                Vec::new()
            }
        };

        Turn {
            index,
            user_message,
            agent_output,
            tool_events,
            verdicts,
            claims,
            diagnostics,
            started_at,
            agent_latency_ms,
        }
    }

    async fn finalize(
        self,
        mut progress: Progress,
        ending: Ending,
        started_at: DateTime<Utc>,
    ) -> SimulationRun {
        let suite = &self.suite;
        let mut conversation_verdicts = Vec::new();
        let mut issues = Vec::new();

        // A cancelled batch stops without further evaluation
        if ending.reason != TerminationReason::Cancelled && !progress.turns.is_empty() {
            let turns = &progress.turns;
            match self
                .bounded(async {
                    Ok(suite
                        .rule_evaluator
                        .evaluate_conversation(&suite.rules, turns)
                        .await)
                })
                .await
            {
                Ok(v) => conversation_verdicts = v,
                Err(e) => progress
                    .diagnostics
                    .push(format!("conversation rules failed: {}", e)),
            }

            let transcript = Transcript {
                turns,
                goal: self.goal(),
                context: self
                    .test_case
                    .context
                    .as_deref()
                    .or(suite.context.as_deref()),
            };
            match self.bounded(suite.judge.investigate(&transcript)).await {
                Ok(found) => issues = found,
                Err(e) => {
                    tracing::warn!(run_id = %self.run_id, error = %e, "autonomous judge failed");
                    progress.diagnostics.push(format!("judge failed: {}", e));
                }
            }
        }

        let status = ending.reason.status();
        tracing::info!(
            run_id = %self.run_id,
            index = self.index,
            ?status,
            termination = ?ending.reason,
            turns = progress.turns.len(),
            "conversation finished"
        );

        SimulationRun {
            run_id: self.run_id,
            index: self.index,
            persona: self.persona,
            test_case: self.test_case,
            max_turns: suite.max_turns,
            turns: progress.turns,
            conversation_verdicts,
            issues,
            status,
            termination: ending.reason,
            error: ending.error,
            diagnostics: progress.diagnostics,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::FnAgent;
    use crate::hallucination::{ClaimVerifier, Verification};
    use crate::knowledge_base::InMemoryKnowledgeBase;
    use crate::rules::{Judgment, RuleJudge, RuleTarget};
    use crate::simulator::UserTurn;
    use crate::trace;
    use agentsim_core::{RunStatus, ToolEventStatus};
    use async_trait::async_trait;
    use serde_json::json;

    fn orchestrator(agent: Arc<dyn TargetAgent>, suite: EvaluationSuite) -> ConversationOrchestrator {
        ConversationOrchestrator::new(
            0,
            Persona::new("1"),
            TestCase::new("t1", "How do I reset my password?"),
            agent,
            Arc::new(suite),
        )
    }

    fn ok_agent() -> Arc<dyn TargetAgent> {
        FnAgent::shared(|_input| async { Ok::<_, AgentError>(AgentOutput::text("OK")) })
    }

    #[tokio::test]
    async fn test_runs_to_max_turns() {
        let run = orchestrator(ok_agent(), EvaluationSuite::default().with_max_turns(2))
            .run()
            .await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.termination, TerminationReason::MaxTurns);
        assert_eq!(run.turns.len(), 2);
        assert_eq!(run.turns[0].user_message, "How do I reset my password?");
        assert!(run.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_agent_error_preserves_earlier_turns() {
        let agent = FnAgent::shared(|input: AgentInput| async move {
            if input.turn_index == 1 {
                Err(AgentError::InvocationFailed("crashed".into()))
            } else {
                Ok(AgentOutput::text("Let me check that for you."))
            }
        });
        let run = orchestrator(agent, EvaluationSuite::default()).run().await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.termination, TerminationReason::AgentError);
        assert_eq!(run.turns.len(), 1);
        assert!(run.error.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn test_run_timeout_keeps_completed_turns() {
        let agent = FnAgent::shared(|input: AgentInput| async move {
            if input.turn_index >= 1 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok::<_, AgentError>(AgentOutput::text("Working on it."))
        });
        let suite = EvaluationSuite::default()
            .with_timeouts(Duration::from_secs(10), Duration::from_millis(200));
        let run = orchestrator(agent, suite).run().await;

        assert_eq!(run.status, RunStatus::TimedOut);
        assert_eq!(run.turns.len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_response_ends_conversation() {
        let agent = FnAgent::shared(|_input| async {
            Ok::<_, AgentError>(AgentOutput::text("Goodbye and take care.").terminal())
        });
        let run = orchestrator(agent, EvaluationSuite::default()).run().await;

        assert_eq!(run.termination, TerminationReason::AgentTerminated);
        assert_eq!(run.turns.len(), 1);
    }

    struct SatisfiedAfterFirst;

    #[async_trait]
    impl UserSimulator for SatisfiedAfterFirst {
        async fn next_turn(&self, _ctx: &SimulatorContext<'_>) -> Result<UserTurn, EvalError> {
            Ok(UserTurn {
                message: "thanks".into(),
                goal_satisfied: true,
            })
        }
    }

    #[tokio::test]
    async fn test_goal_satisfaction_outranks_terminal_signal() {
        let agent = FnAgent::shared(|_input| async {
            Ok::<_, AgentError>(AgentOutput::text("All done.").terminal())
        });
        let mut suite = EvaluationSuite::default();
        suite.simulator = Arc::new(SatisfiedAfterFirst);
        let run = orchestrator(agent, suite).run().await;

        assert_eq!(run.termination, TerminationReason::GoalSatisfied);
    }

    #[tokio::test]
    async fn test_tool_events_and_rules_attach_to_turn() {
        let agent = FnAgent::shared(|_input| async {
            trace::record(
                "lookup_account",
                json!({"id": 1}),
                Err("not found".into()),
                vec![Rule::new("tool-ok", "Tool call must succeed")],
            );
            Ok::<_, AgentError>(AgentOutput::text(
                "I could not find your account, sorry about that.",
            ))
        });
        let suite = EvaluationSuite::default()
            .with_max_turns(1)
            .with_rules(vec![Rule::new("short", "Must not exceed 5 words")]);
        let run = orchestrator(agent, suite).run().await;

        let turn = &run.turns[0];
        assert_eq!(turn.tool_events.len(), 1);
        assert_eq!(turn.tool_events[0].status, ToolEventStatus::Failed);
        assert!(turn.tool_events[0].verdicts[0].violated);
        assert!(turn.verdicts[0].violated);
        assert_eq!(run.violation_count(), 2);
        assert!(run.check_invariants().is_ok());
    }

    #[tokio::test]
    async fn test_claims_only_with_knowledge_base() {
        let agent = FnAgent::shared(|_input| async {
            Ok::<_, AgentError>(AgentOutput::text("Refunds are issued within 90 days."))
        });

        let without = orchestrator(agent.clone(), EvaluationSuite::default().with_max_turns(1))
            .run()
            .await;
        assert!(without.turns[0].claims.is_empty());

        let kb = InMemoryKnowledgeBase::new()
            .with_document("policy", "Refunds are issued within 14 days.");
        let with = orchestrator(
            agent,
            EvaluationSuite::default()
                .with_max_turns(1)
                .with_knowledge_base(Arc::new(kb)),
        )
        .run()
        .await;
        let claims = &with.turns[0].claims;
        assert_eq!(claims.len(), 1);
        assert!(claims[0].flagged);
        assert!(claims[0].sources.is_empty());
    }

    #[tokio::test]
    async fn test_agent_panic_keeps_completed_turns() {
        let agent = FnAgent::shared(|input: AgentInput| async move {
            if input.turn_index == 2 {
                panic!("agent exploded");
            }
            Ok::<_, AgentError>(AgentOutput::text("Let me look into that for you."))
        });
        let run = orchestrator(agent, EvaluationSuite::default().with_max_turns(4))
            .run()
            .await;

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.termination, TerminationReason::AgentError);
        assert_eq!(run.turns.len(), 2);
        let error = run.error.unwrap();
        assert!(error.contains("agent panicked"));
        assert!(error.contains("agent exploded"));
    }

    #[tokio::test]
    async fn test_batch_goal_reaches_simulator() {
        let agent = FnAgent::shared(|_input| async {
            Ok::<_, AgentError>(AgentOutput::text("I have reset your password now."))
        });
        let mut suite = EvaluationSuite::default();
        suite.goal = Some("reset password".to_string());
        let run = ConversationOrchestrator::new(
            0,
            Persona::new("1"),
            TestCase::new("tc-1", "I cannot log in"),
            agent,
            Arc::new(suite),
        )
        .run()
        .await;

        assert_eq!(run.termination, TerminationReason::GoalSatisfied);
        assert_eq!(run.turns.len(), 1);
    }

    struct OfflineJudge;

    #[async_trait]
    impl RuleJudge for OfflineJudge {
        async fn judge(&self, _rule: &Rule, _target: &RuleTarget<'_>) -> Result<Judgment, EvalError> {
            Err(EvalError::LLMClientError("judge offline".into()))
        }
    }

    struct StalledVerifier;

    #[async_trait]
    impl ClaimVerifier for StalledVerifier {
        async fn verify(
            &self,
            _claim: &str,
            _knowledge_base: &dyn KnowledgeBase,
        ) -> Result<Verification, EvalError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Verification {
                support: 1.0,
                evidence: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_failed_evaluation_degrades_turn_without_stopping_run() {
        let agent = FnAgent::shared(|_input| async {
            Ok::<_, AgentError>(AgentOutput::text("Refunds are issued within 14 days."))
        });
        let kb = InMemoryKnowledgeBase::new()
            .with_document("policy", "Refunds are issued within 14 days.");
        let mut suite = EvaluationSuite::default()
            .with_max_turns(2)
            .with_rules(vec![Rule::new("polite", "Be polite")])
            .with_knowledge_base(Arc::new(kb))
            .with_timeouts(Duration::from_millis(200), Duration::from_secs(10));
        suite.rule_evaluator = RuleEvaluator::new(Arc::new(OfflineJudge));
        suite.hallucination = Arc::new(HallucinationDetector::new(Arc::new(StalledVerifier)));
        let run = orchestrator(agent, suite).run().await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.termination, TerminationReason::MaxTurns);
        assert_eq!(run.turns.len(), 2);
        for turn in &run.turns {
            assert!(turn.is_degraded());
            assert!(turn
                .diagnostics
                .iter()
                .any(|d| d.starts_with("hallucination check failed")));
            assert!(turn.claims.is_empty());
            let verdict = &turn.verdicts[0];
            assert!(!verdict.violated);
            assert!(verdict.diagnostic.as_deref().unwrap().contains("judge offline"));
        }

        let summary = crate::aggregate::summarize(std::slice::from_ref(&run));
        assert_eq!(summary.degraded_turns, 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_run() {
        let agent = FnAgent::shared(|_input| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, AgentError>(AgentOutput::text("late"))
        });
        let cancel = CancellationToken::new();
        let conversation = orchestrator(agent, EvaluationSuite::default())
            .with_cancellation(cancel.clone());
        let handle = tokio::spawn(conversation.run());
        cancel.cancel();
        let run = handle.await.unwrap();

        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.turns.is_empty());
    }
}
