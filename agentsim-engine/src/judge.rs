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

//! Autonomous judge
//!
//! Rule-independent investigation of a finished conversation. The
//! [`Investigator`] is an opaque oracle; [`AutonomousJudge`] only filters
//! its findings by usefulness and attaches turn context for rendering.

use crate::llm_client::LLMClient;
use crate::text;
use crate::EvalError;
use agentsim_core::{InvestigationIssue, JudgeConfig, ToolEventStatus, Turn, Usefulness};
use async_trait::async_trait;
use std::sync::Arc;

/// Everything an investigator sees: the ordered transcript (tool traces
/// ride on each turn) and the batch goal
#[derive(Debug, Clone, Copy)]
pub struct Transcript<'a> {
    pub turns: &'a [Turn],
    pub goal: Option<&'a str>,
    pub context: Option<&'a str>,
}

#[async_trait]
pub trait Investigator: Send + Sync {
    async fn investigate(
        &self,
        transcript: &Transcript<'_>,
    ) -> Result<Vec<InvestigationIssue>, EvalError>;
}

const REFUSALS: &[&str] = &[
    "i can't help",
    "i cannot help",
    "i'm unable to",
    "i am unable to",
    "i can't assist",
    "i cannot assist",
    "as an ai",
];

/// Deterministic investigator for common conversational failures
#[derive(Debug, Clone, Copy)]
pub struct HeuristicInvestigator {
    slow_response_ms: u64,
}

impl Default for HeuristicInvestigator {
    fn default() -> Self {
        Self {
            slow_response_ms: 10_000,
        }
    }
}

impl HeuristicInvestigator {
    fn issue(turn: usize, category: &str, description: String, usefulness: Usefulness) -> InvestigationIssue {
        InvestigationIssue {
            turn_index: Some(turn),
            category: category.to_string(),
            description,
            usefulness,
            context: None,
        }
    }
}

#[async_trait]
impl Investigator for HeuristicInvestigator {
    async fn investigate(
        &self,
        transcript: &Transcript<'_>,
    ) -> Result<Vec<InvestigationIssue>, EvalError> {
        let mut issues = Vec::new();
        let mut previous: Option<String> = None;

        for turn in transcript.turns {
            let output = &turn.agent_output;
            let normalized = output.text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

            if normalized.is_empty() && output.structured.is_none() && output.attachments.is_empty() {
                issues.push(Self::issue(
                    turn.index,
                    "empty_response",
                    "agent returned an empty response".to_string(),
                    Usefulness::High,
                ));
            } else if previous.as_deref() == Some(normalized.as_str()) {
                issues.push(Self::issue(
                    turn.index,
                    "repetition",
                    "agent repeated its previous response verbatim".to_string(),
                    Usefulness::Medium,
                ));
            }

            if let Some(phrase) = REFUSALS.iter().find(|p| normalized.contains(*p)) {
                issues.push(Self::issue(
                    turn.index,
                    "refusal",
                    format!("agent declined the request (\"{}\")", phrase),
                    Usefulness::Medium,
                ));
            }

            for event in &turn.tool_events {
                match event.status {
                    ToolEventStatus::Failed => issues.push(Self::issue(
                        turn.index,
                        "tool_error",
                        format!(
                            "tool '{}' failed: {}",
                            event.name,
                            event.error.as_deref().unwrap_or("unknown error")
                        ),
                        Usefulness::High,
                    )),
                    ToolEventStatus::Open => issues.push(Self::issue(
                        turn.index,
                        "unfinished_tool_call",
                        format!("tool '{}' was started but never finished", event.name),
                        Usefulness::Medium,
                    )),
                    ToolEventStatus::Succeeded => {}
                }
            }

            let asked = text::content_words(&turn.user_message);
            let answered = text::content_words(&output.text);
            if asked.len() >= 3 && answered.len() >= 3 && asked.is_disjoint(&answered) {
                issues.push(Self::issue(
                    turn.index,
                    "off_topic",
                    "response shares no content with the user's message".to_string(),
                    Usefulness::Low,
                ));
            }

            if turn.agent_latency_ms > self.slow_response_ms {
                issues.push(Self::issue(
                    turn.index,
                    "latency",
                    format!("agent took {} ms to respond", turn.agent_latency_ms),
                    Usefulness::Low,
                ));
            }

            previous = Some(normalized);
        }

        Ok(issues)
    }
}

/// LLM investigator reading the full transcript and tool traces
pub struct LlmInvestigator {
    llm_client: Arc<dyn LLMClient>,
    prompt_template: String,
}

impl LlmInvestigator {
    pub fn new(llm_client: Arc<dyn LLMClient>) -> Self {
        Self {
            llm_client,
            prompt_template: Self::default_prompt(),
        }
    }

    fn default_prompt() -> String {
        r#"You are an expert QA analyst reviewing a conversation between a user and an AI agent.
Find problems a product team would want to fix: wrong or unsafe answers, ignored requests,
broken tool usage, confusing replies. Do not report stylistic nitpicks.

GOAL OF THE USER:
{goal}

CONTEXT:
{context}

TRANSCRIPT (with tool calls per turn):
{transcript}

Respond in JSON format:
{
  "issues": [
    {
      "turn_index": <integer or null>,
      "category": "short_snake_case_label",
      "description": "what went wrong",
      "usefulness": "low" | "medium" | "high" | "critical",
      "context": "short quote from the transcript"
    }
  ]
}"#
        .to_string()
    }

    fn render(turns: &[Turn]) -> String {
        turns
            .iter()
            .map(|t| {
                let mut block = format!(
                    "[turn {}]\nUSER: {}\nAGENT: {}",
                    t.index, t.user_message, t.agent_output.text
                );
                for e in &t.tool_events {
                    block.push_str(&format!(
                        "\nTOOL {}({}) -> {:?} {}",
                        e.name,
                        e.input,
                        e.status,
                        e.error
                            .clone()
                            .or_else(|| e.output.as_ref().map(|o| o.to_string()))
                            .unwrap_or_default()
                    ));
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

#[async_trait]
impl Investigator for LlmInvestigator {
    async fn investigate(
        &self,
        transcript: &Transcript<'_>,
    ) -> Result<Vec<InvestigationIssue>, EvalError> {
        let prompt = self
            .prompt_template
            .replace("{goal}", transcript.goal.unwrap_or("(not stated)"))
            .replace("{context}", transcript.context.unwrap_or("(none)"))
            .replace("{transcript}", &Self::render(transcript.turns));

        let response = self.llm_client.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse issues JSON: {}", e))
        })?;
        let issues = json
            .get("issues")
            .cloned()
            .ok_or_else(|| EvalError::LLMClientError("Missing issues array".to_string()))?;
        Ok(serde_json::from_value(issues)?)
    }
}

/// Runs an investigator over every finished conversation
#[derive(Clone)]
pub struct AutonomousJudge {
    investigator: Arc<dyn Investigator>,
    min_usefulness: Usefulness,
    enabled: bool,
}

impl Default for AutonomousJudge {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicInvestigator::default()))
    }
}

impl AutonomousJudge {
    pub fn new(investigator: Arc<dyn Investigator>) -> Self {
        let defaults = JudgeConfig::default();
        Self {
            investigator,
            min_usefulness: defaults.min_usefulness,
            enabled: defaults.enabled,
        }
    }

    pub fn with_config(mut self, config: &JudgeConfig) -> Self {
        self.min_usefulness = config.min_usefulness;
        self.enabled = config.enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Useful issues in the transcript, with turn context attached
    pub async fn investigate(
        &self,
        transcript: &Transcript<'_>,
    ) -> Result<Vec<InvestigationIssue>, EvalError> {
        if !self.enabled {
            return Ok(Vec::new());
        }

        let issues = self.investigator.investigate(transcript).await?;
        let turns = transcript.turns;

        Ok(issues
            .into_iter()
            .filter(|issue| issue.usefulness >= self.min_usefulness)
            .map(|mut issue| {
                match issue.turn_index {
                    Some(i) if i >= turns.len() => {
                        tracing::debug!(turn = i, "judge issue references a missing turn");
                        issue.turn_index = None;
                    }
                    Some(i) if issue.context.is_none() => {
                        let turn = &turns[i];
                        issue.context = Some(text::excerpt(
                            &format!(
                                "USER: {} | AGENT: {}",
                                turn.user_message, turn.agent_output.text
                            ),
                            240,
                        ));
                    }
                    _ => {}
                }
                issue
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::mock::ScriptedLLM;
    use agentsim_core::{AgentOutput, ToolEvent};
    use chrono::Utc;

    fn turn(index: usize, user: &str, agent: &str) -> Turn {
        Turn {
            index,
            user_message: user.to_string(),
            agent_output: AgentOutput::text(agent),
            tool_events: Vec::new(),
            verdicts: Vec::new(),
            claims: Vec::new(),
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            agent_latency_ms: 10,
        }
    }

    fn transcript(turns: &[Turn]) -> Transcript<'_> {
        Transcript {
            turns,
            goal: None,
            context: None,
        }
    }

    #[tokio::test]
    async fn test_heuristic_finds_repetition_and_tool_errors() {
        let mut second = turn(1, "That did not work", "Please try again later.");
        second.tool_events.push(ToolEvent {
            id: uuid::Uuid::new_v4(),
            name: "reset_password".to_string(),
            input: serde_json::json!({}),
            output: None,
            error: Some("503".to_string()),
            status: ToolEventStatus::Failed,
            started_at: Utc::now(),
            finished_at: Some(Utc::now()),
            rules: Vec::new(),
            verdicts: Vec::new(),
        });
        let turns = vec![turn(0, "Reset my password", "Please try again later."), second];

        let issues = AutonomousJudge::default()
            .investigate(&transcript(&turns))
            .await
            .unwrap();

        let categories: Vec<_> = issues.iter().map(|i| i.category.as_str()).collect();
        assert_eq!(categories, vec!["repetition", "tool_error"]);
        assert!(issues.iter().all(|i| i.turn_index == Some(1)));
        assert!(issues[0].context.as_deref().unwrap().contains("That did not work"));
    }

    #[tokio::test]
    async fn test_usefulness_threshold_filters_low_issues() {
        let turns = vec![turn(
            0,
            "What are your store opening hours downtown?",
            "Bananas contain potassium naturally.",
        )];

        let judge = AutonomousJudge::default();
        assert!(judge.investigate(&transcript(&turns)).await.unwrap().is_empty());

        let lenient = AutonomousJudge::default().with_config(&JudgeConfig {
            enabled: true,
            min_usefulness: Usefulness::Low,
        });
        let issues = lenient.investigate(&transcript(&turns)).await.unwrap();
        assert_eq!(issues[0].category, "off_topic");
    }

    #[tokio::test]
    async fn test_llm_investigator_issues_pass_through() {
        let llm = Arc::new(ScriptedLLM::new(vec![(
            "QA analyst",
            r#"{"issues": [
                {"turn_index": 0, "category": "wrong_answer", "description": "Quoted the wrong fee",
                 "usefulness": "critical", "context": null},
                {"turn_index": 7, "category": "tone", "description": "Curt",
                 "usefulness": "high", "context": "ok."}
            ]}"#
            .to_string(),
        )]));
        let judge = AutonomousJudge::new(Arc::new(LlmInvestigator::new(llm)));
        let turns = vec![turn(0, "What is the fee?", "It is 50 dollars.")];

        let issues = judge.investigate(&transcript(&turns)).await.unwrap();

        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].usefulness, Usefulness::Critical);
        assert!(issues[0].context.as_deref().unwrap().contains("50 dollars"));
        assert_eq!(issues[1].turn_index, None);
    }

    #[tokio::test]
    async fn test_disabled_judge_reports_nothing() {
        let turns = vec![turn(0, "hi", "")];
        let judge = AutonomousJudge::default().with_config(&JudgeConfig {
            enabled: false,
            min_usefulness: Usefulness::Low,
        });
        assert!(judge.investigate(&transcript(&turns)).await.unwrap().is_empty());
    }
}
