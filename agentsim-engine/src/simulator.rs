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

//! Simulated user side of a conversation

use crate::llm_client::LLMClient;
use crate::text;
use crate::EvalError;
use agentsim_core::{Level, Persona, TestCase, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The simulated user's reaction to the latest agent response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTurn {
    pub message: String,
    /// The user considers the goal reached and stops the conversation
    #[serde(default)]
    pub goal_satisfied: bool,
}

/// What the simulator sees when producing the next message
#[derive(Debug, Clone, Copy)]
pub struct SimulatorContext<'a> {
    pub persona: &'a Persona,
    pub test_case: &'a TestCase,
    /// Test-case goal, else the batch goal
    pub goal: Option<&'a str>,
    /// Completed turns, never empty
    pub turns: &'a [Turn],
}

impl SimulatorContext<'_> {
    fn last_response(&self) -> &str {
        self.turns
            .last()
            .map(|t| t.agent_output.text.as_str())
            .unwrap_or_default()
    }
}

/// Produces simulated-user messages and judges goal satisfaction
#[async_trait]
pub trait UserSimulator: Send + Sync {
    async fn next_turn(&self, ctx: &SimulatorContext<'_>) -> Result<UserTurn, EvalError>;
}

const FOLLOW_UPS: &[&str] = &[
    "Can you explain that in more detail?",
    "What should I do next?",
    "Is there anything else I need to know?",
    "Are there any costs or limits I should be aware of?",
];

/// Deterministic persona-driven simulator.
///
/// The goal counts as satisfied once the latest response covers at least
/// `goal_coverage` of the goal's content words. Follow-ups are shaped by the
/// persona's urgency, patience and intensity.
#[derive(Debug, Clone, Copy)]
pub struct PersonaSimulator {
    goal_coverage: f64,
}

impl Default for PersonaSimulator {
    fn default() -> Self {
        Self { goal_coverage: 0.6 }
    }
}

impl PersonaSimulator {
    pub fn with_goal_coverage(mut self, coverage: f64) -> Self {
        self.goal_coverage = coverage;
        self
    }

    fn answer_question(persona: &Persona) -> String {
        let mut facts = Vec::new();
        if let Some(occupation) = &persona.occupation {
            facts.push(format!("I work as a {}", occupation));
        }
        if let Some(residence) = &persona.demographics.residence {
            facts.push(format!("I live in {}", residence));
        }
        if let Some(age) = &persona.demographics.age_range {
            facts.push(format!("I'm in the {} age range", age));
        }
        for (k, v) in persona.attributes.iter().take(2) {
            facts.push(format!("my {} is {}", k.replace('_', " "), v));
        }
        if facts.is_empty() {
            "Sure, happy to answer. Please go ahead.".to_string()
        } else {
            format!("Sure: {}.", facts.join(", "))
        }
    }
}

#[async_trait]
impl UserSimulator for PersonaSimulator {
    async fn next_turn(&self, ctx: &SimulatorContext<'_>) -> Result<UserTurn, EvalError> {
        let response = ctx.last_response();
        let goal = ctx.goal.filter(|g| !g.trim().is_empty());

        if let Some(goal) = goal {
            if text::coverage(goal, response) >= self.goal_coverage {
                return Ok(UserTurn {
                    message: "Thanks, that's what I needed.".to_string(),
                    goal_satisfied: true,
                });
            }
        }

        let psychology = &ctx.persona.psychology;
        let mut message = if response.split_whitespace().count() < 3 {
            match psychology.patience {
                Level::Low => format!("That doesn't answer my question. {}", ctx.test_case.query),
                _ => "Could you say a bit more than that?".to_string(),
            }
        } else if response.trim_end().ends_with('?') {
            Self::answer_question(ctx.persona)
        } else if let Some(goal) = goal {
            format!("I still need help with this: {}", goal.trim_end_matches('.'))
        } else {
            FOLLOW_UPS[ctx.turns.len().saturating_sub(1) % FOLLOW_UPS.len()].to_string()
        };

        if psychology.urgency == Level::High {
            message = format!("I need this sorted quickly. {}", message);
        }
        if ctx.persona.communication.intensity == Level::High {
            message = message.replace('?', "?!");
        }

        Ok(UserTurn {
            message,
            goal_satisfied: false,
        })
    }
}

/// LLM role-playing the persona
pub struct LlmUserSimulator {
    llm_client: Arc<dyn LLMClient>,
    prompt_template: String,
}

impl LlmUserSimulator {
    pub fn new(llm_client: Arc<dyn LLMClient>) -> Self {
        Self {
            llm_client,
            prompt_template: Self::default_prompt(),
        }
    }

    fn default_prompt() -> String {
        r#"You are role-playing a user talking to an AI assistant. Stay in character.

PERSONA:
{persona}

YOUR GOAL:
{goal}

CONVERSATION SO FAR:
{transcript}

Write the user's next message. If the assistant has fully achieved your goal,
set goal_satisfied to true.

Respond in JSON format:
{
  "message": "<next user message>",
  "goal_satisfied": true | false
}"#
        .to_string()
    }
}

#[async_trait]
impl UserSimulator for LlmUserSimulator {
    async fn next_turn(&self, ctx: &SimulatorContext<'_>) -> Result<UserTurn, EvalError> {
        let transcript = ctx
            .turns
            .iter()
            .map(|t| format!("USER: {}\nASSISTANT: {}", t.user_message, t.agent_output.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self
            .prompt_template
            .replace("{persona}", &ctx.persona.describe())
            .replace("{goal}", ctx.goal.unwrap_or(&ctx.test_case.query))
            .replace("{transcript}", &transcript);

        let response = self.llm_client.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse simulator JSON: {}", e))
        })?;
        let turn: UserTurn = serde_json::from_value(json)?;
        if turn.message.trim().is_empty() && !turn.goal_satisfied {
            return Err(EvalError::InvalidInput(
                "simulator produced an empty message".to_string(),
            ));
        }
        Ok(turn)
    }
}
