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

//! Per-turn records: agent output, tool events and verdicts

use crate::rule::{Rule, RuleCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// File produced by a multimodal agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub size: usize,
    #[serde(default)]
    pub content: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size: content.len(),
            content,
        }
    }
}

/// What the target agent returned for one prompt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub text: String,
    /// Optional JSON-like payload
    pub structured: Option<serde_json::Value>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Agent signalled that the conversation is over
    #[serde(default)]
    pub terminal: bool,
}

impl AgentOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_structured(mut self, value: serde_json::Value) -> Self {
        self.structured = Some(value);
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }
}

impl From<String> for AgentOutput {
    fn from(text: String) -> Self {
        AgentOutput::text(text)
    }
}

impl From<&str> for AgentOutput {
    fn from(text: &str) -> Self {
        AgentOutput::text(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventStatus {
    Open,
    Succeeded,
    Failed,
}

/// Recorded invocation of a function, tool or external call made by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub id: Uuid,
    pub name: String,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub status: ToolEventStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Rules supplied by the caller at `start`/`record`
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Verdicts for `rules`, filled in during turn evaluation
    #[serde(default)]
    pub verdicts: Vec<Violation>,
}

impl ToolEvent {
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn is_error(&self) -> bool {
        self.status == ToolEventStatus::Failed
    }
}

/// What a verdict was computed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerdictScope {
    Turn { index: usize },
    ToolEvent { turn: usize, event: usize },
    Conversation,
}

impl VerdictScope {
    pub fn turn_index(&self) -> Option<usize> {
        match self {
            VerdictScope::Turn { index } => Some(*index),
            VerdictScope::ToolEvent { turn, .. } => Some(*turn),
            VerdictScope::Conversation => None,
        }
    }
}

/// Binary rule verdict. `violated == false` records a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: String,
    pub rule_text: String,
    pub category: Option<RuleCategory>,
    pub scope: VerdictScope,
    pub violated: bool,
    pub explanation: String,
    /// Set when the rule could not be evaluated against this scope
    pub diagnostic: Option<String>,
}

impl Violation {
    pub fn verdict(rule: &Rule, scope: VerdictScope, violated: bool, explanation: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_text: rule.text.clone(),
            category: rule.category,
            scope,
            violated,
            explanation,
            diagnostic: None,
        }
    }

    /// Non-violation carrying the reason the rule could not be evaluated
    pub fn undetermined(rule: &Rule, scope: VerdictScope, diagnostic: String) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_text: rule.text.clone(),
            category: rule.category,
            scope,
            violated: false,
            explanation: "rule could not be evaluated".to_string(),
            diagnostic: Some(diagnostic),
        }
    }
}

/// Factual assertion checked against the knowledge base.
///
/// `confidence` is in `[0, 100]` and measures how confidently the claim is
/// unsupported: `100 * (1 - support)` where `support` is the best
/// knowledge-base match score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationClaim {
    pub claim: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub confidence: f64,
    pub flagged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Usefulness {
    Low,
    Medium,
    High,
    Critical,
}

/// Problem detected by the autonomous judge, independent of any rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationIssue {
    pub turn_index: Option<usize>,
    pub category: String,
    pub description: String,
    pub usefulness: Usefulness,
    /// Supporting excerpt, filled from the transcript when the judge omits it
    pub context: Option<String>,
}

/// One user-message / agent-response exchange. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub index: usize,
    pub user_message: String,
    pub agent_output: AgentOutput,
    #[serde(default)]
    pub tool_events: Vec<ToolEvent>,
    #[serde(default)]
    pub verdicts: Vec<Violation>,
    #[serde(default)]
    pub claims: Vec<HallucinationClaim>,
    /// Evaluation sub-step failures; non-empty marks a degraded turn
    #[serde(default)]
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub agent_latency_ms: u64,
}

impl Turn {
    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Turn-scoped and tool-event verdicts that were violated
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.verdicts
            .iter()
            .chain(self.tool_events.iter().flat_map(|e| e.verdicts.iter()))
            .filter(|v| v.violated)
    }

    pub fn flagged_claims(&self) -> usize {
        self.claims.iter().filter(|c| c.flagged).count()
    }
}
