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

//! Result set export
//!
//! Pure transformations of a finished [`EvaluationResultSet`]:
//! - `evaluation_json`: the full result set, transcripts and traces included
//! - `rlhf`: JSONL, one trajectory per run with per-turn rewards from rule
//!   compliance and a positive/negative label
//! - `compliance_report`: violation summary, pass/fail rates, performance
//!   and an audit trail of every violated verdict
//! - `compliance_csv`: the audit trail as a table

use crate::text;
use agentsim_core::{
    EvaluationResultSet, RuleCategory, RunStatus, SimulationError, SimulationRun, Turn,
    VerdictScope, Violation,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    /// The result set breaks a structural invariant
    #[error("Incomplete result set: {0}")]
    Incomplete(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ExportError {
    fn from(e: serde_json::Error) -> Self {
        ExportError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(e: csv::Error) -> Self {
        ExportError::Serialization(e.to_string())
    }
}

impl From<ExportError> for SimulationError {
    fn from(e: ExportError) -> Self {
        SimulationError::Export(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    EvaluationJson,
    Rlhf,
    ComplianceReport,
    ComplianceCsv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::EvaluationJson | ExportFormat::ComplianceReport => "json",
            ExportFormat::Rlhf => "jsonl",
            ExportFormat::ComplianceCsv => "csv",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExportFormat::EvaluationJson => "evaluation",
            ExportFormat::Rlhf => "rlhf",
            ExportFormat::ComplianceReport => "compliance",
            ExportFormat::ComplianceCsv => "compliance",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "json" | "evaluation" | "evaluation_json" => Ok(ExportFormat::EvaluationJson),
            "rlhf" | "jsonl" => Ok(ExportFormat::Rlhf),
            "compliance" | "compliance_report" => Ok(ExportFormat::ComplianceReport),
            "csv" | "compliance_csv" => Ok(ExportFormat::ComplianceCsv),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// One chat message of an RLHF trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub turn: usize,
    pub prompt: String,
    pub response: String,
    /// Fraction of determined verdicts on this turn that passed
    pub reward: f64,
    pub violated_rules: Vec<String>,
    pub tool_calls: usize,
    pub flagged_claims: usize,
}

/// Ground-truth annotations for a trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruth {
    pub goal: Option<String>,
    pub rules_passed: Vec<String>,
    pub rules_failed: Vec<String>,
    pub flagged_claims: Vec<String>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub run_id: Uuid,
    pub persona_id: String,
    pub test_case_id: String,
    pub status: RunStatus,
    pub messages: Vec<ChatMessage>,
    pub steps: Vec<TrajectoryStep>,
    /// Compliance across every determined verdict of the run
    pub reward: f64,
    /// `positive` for completed runs with zero violations
    pub label: String,
    pub ground_truth: GroundTruth,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleViolationSummary {
    pub rule_id: String,
    pub rule_text: String,
    pub category: Option<RuleCategory>,
    pub violations: usize,
    pub runs_affected: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_turns: usize,
    pub degraded_turns: usize,
    pub mean_agent_latency_ms: f64,
    pub p95_agent_latency_ms: u64,
    pub mean_run_duration_ms: f64,
    pub hallucination_flag_rate: f64,
}

/// One violated verdict, traceable back to its run, turn and response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: Uuid,
    pub run_index: usize,
    pub persona_id: String,
    pub turn: Option<usize>,
    pub tool_event: Option<usize>,
    pub rule_id: String,
    pub rule_text: String,
    pub explanation: String,
    pub agent_response: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub batch_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub total_runs: usize,
    pub passed_runs: usize,
    pub pass_rate: f64,
    pub fail_rate: f64,
    pub status_counts: BTreeMap<String, usize>,
    pub violations: Vec<RuleViolationSummary>,
    pub performance: PerformanceMetrics,
    pub audit_trail: Vec<AuditEntry>,
}

/// Serializes result sets; never mutates them
#[derive(Debug, Clone, Copy, Default)]
pub struct Exporter {
    pretty: bool,
}

impl Exporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub fn export(
        &self,
        results: &EvaluationResultSet,
        format: ExportFormat,
    ) -> Result<String, ExportError> {
        validate(results)?;
        match format {
            ExportFormat::EvaluationJson => self.to_json(results),
            ExportFormat::Rlhf => {
                let lines = results
                    .runs
                    .iter()
                    .map(|run| serde_json::to_string(&trajectory(run)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(lines.join("\n"))
            }
            ExportFormat::ComplianceReport => self.to_json(&compliance_report(results)),
            ExportFormat::ComplianceCsv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                for entry in audit_trail(results) {
                    writer.serialize(entry)?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| ExportError::Serialization(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| ExportError::Serialization(e.to_string()))
            }
        }
    }

    /// Export into `dir`, named `<name>.<extension>`; returns the written path
    pub fn write(
        &self,
        results: &EvaluationResultSet,
        format: ExportFormat,
        dir: &Path,
    ) -> Result<std::path::PathBuf, ExportError> {
        let body = self.export(results, format)?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}", format.name(), format.extension()));
        std::fs::write(&path, body)?;
        tracing::info!(?format, path = %path.display(), "results exported");
        Ok(path)
    }

    fn to_json<T: Serialize>(&self, value: &T) -> Result<String, ExportError> {
        Ok(if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        })
    }
}

/// Parse an evaluation-JSON export back into a result set
pub fn parse_evaluation_json(input: &str) -> Result<EvaluationResultSet, ExportError> {
    let results: EvaluationResultSet = serde_json::from_str(input)?;
    validate(&results)?;
    Ok(results)
}

fn validate(results: &EvaluationResultSet) -> Result<(), ExportError> {
    if results.summary.total_runs != results.runs.len() {
        return Err(ExportError::Incomplete(format!(
            "summary covers {} runs, result set holds {}",
            results.summary.total_runs,
            results.runs.len()
        )));
    }
    for run in &results.runs {
        run.check_invariants().map_err(ExportError::Incomplete)?;
    }
    Ok(())
}

/// Determined verdicts of a turn, including its tool events
fn turn_verdicts(turn: &Turn) -> impl Iterator<Item = &Violation> {
    turn.verdicts
        .iter()
        .chain(turn.tool_events.iter().flat_map(|e| e.verdicts.iter()))
        .filter(|v| v.diagnostic.is_none())
}

fn compliance(verdicts: impl Iterator<Item = bool>) -> f64 {
    let (mut total, mut passed) = (0usize, 0usize);
    for violated in verdicts {
        total += 1;
        if !violated {
            passed += 1;
        }
    }
    if total == 0 {
        1.0
    } else {
        passed as f64 / total as f64
    }
}

pub fn trajectory(run: &SimulationRun) -> Trajectory {
    let mut messages = Vec::with_capacity(run.turns.len() * 2);
    let mut steps = Vec::with_capacity(run.turns.len());

    for turn in &run.turns {
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: turn.user_message.clone(),
        });
        messages.push(ChatMessage {
            role: "assistant".to_string(),
            content: turn.agent_output.text.clone(),
        });
        steps.push(TrajectoryStep {
            turn: turn.index,
            prompt: turn.user_message.clone(),
            response: turn.agent_output.text.clone(),
            reward: compliance(turn_verdicts(turn).map(|v| v.violated)),
            violated_rules: turn.violations().map(|v| v.rule_id.clone()).collect(),
            tool_calls: turn.tool_events.len(),
            flagged_claims: turn.flagged_claims(),
        });
    }

    let determined: Vec<&Violation> = run
        .turns
        .iter()
        .flat_map(turn_verdicts)
        .chain(
            run.conversation_verdicts
                .iter()
                .filter(|v| v.diagnostic.is_none()),
        )
        .collect();
    let failed: BTreeSet<String> = determined
        .iter()
        .filter(|v| v.violated)
        .map(|v| v.rule_id.clone())
        .collect();
    let passed: BTreeSet<String> = determined
        .iter()
        .map(|v| v.rule_id.clone())
        .filter(|id| !failed.contains(id))
        .collect();

    let positive = run.status == RunStatus::Completed && run.passed();

    Trajectory {
        run_id: run.run_id,
        persona_id: run.persona.user_id.clone(),
        test_case_id: run.test_case.id.clone(),
        status: run.status,
        messages,
        steps,
        reward: compliance(determined.iter().map(|v| v.violated)),
        label: if positive { "positive" } else { "negative" }.to_string(),
        ground_truth: GroundTruth {
            goal: run.test_case.goal.clone(),
            rules_passed: passed.into_iter().collect(),
            rules_failed: failed.into_iter().collect(),
            flagged_claims: run
                .turns
                .iter()
                .flat_map(|t| t.claims.iter().filter(|c| c.flagged))
                .map(|c| c.claim.clone())
                .collect(),
            issues: run
                .issues
                .iter()
                .map(|i| format!("{}: {}", i.category, i.description))
                .collect(),
        },
    }
}

pub fn audit_trail(results: &EvaluationResultSet) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    for run in &results.runs {
        let entry = |v: &Violation, response: &str, recorded_at: DateTime<Utc>| {
            let (turn, tool_event) = match v.scope {
                VerdictScope::Turn { index } => (Some(index), None),
                VerdictScope::ToolEvent { turn, event } => (Some(turn), Some(event)),
                VerdictScope::Conversation => (None, None),
            };
            AuditEntry {
                run_id: run.run_id,
                run_index: run.index,
                persona_id: run.persona.user_id.clone(),
                turn,
                tool_event,
                rule_id: v.rule_id.clone(),
                rule_text: v.rule_text.clone(),
                explanation: v.explanation.clone(),
                agent_response: text::excerpt(response, 200),
                recorded_at,
            }
        };

        for turn in &run.turns {
            for v in turn.violations() {
                entries.push(entry(v, &turn.agent_output.text, turn.started_at));
            }
        }
        for v in run.conversation_verdicts.iter().filter(|v| v.violated) {
            entries.push(entry(v, "", run.finished_at));
        }
    }
    entries
}

pub fn compliance_report(results: &EvaluationResultSet) -> ComplianceReport {
    let summary = &results.summary;

    let mut per_rule: BTreeMap<&str, (usize, BTreeSet<Uuid>)> = BTreeMap::new();
    for run in &results.runs {
        for v in run.violations() {
            let slot = per_rule.entry(v.rule_id.as_str()).or_default();
            slot.0 += 1;
            slot.1.insert(run.run_id);
        }
    }
    let violations = results
        .rules
        .iter()
        .map(|rule| {
            let (count, runs) = per_rule.remove(rule.id.as_str()).unwrap_or_default();
            RuleViolationSummary {
                rule_id: rule.id.clone(),
                rule_text: rule.text.clone(),
                category: rule.category,
                violations: count,
                runs_affected: runs.len(),
            }
        })
        .collect();

    let mut latencies: Vec<u64> = results
        .runs
        .iter()
        .flat_map(|r| r.turns.iter().map(|t| t.agent_latency_ms))
        .collect();
    latencies.sort_unstable();
    let p95 = if latencies.is_empty() {
        0
    } else {
        let rank = ((latencies.len() as f64) * 0.95).ceil() as usize;
        latencies[rank.saturating_sub(1).min(latencies.len() - 1)]
    };

    let mut status_counts = BTreeMap::new();
    for (name, count) in [
        ("completed", summary.completed),
        ("failed", summary.failed),
        ("timed_out", summary.timed_out),
        ("cancelled", summary.cancelled),
    ] {
        status_counts.insert(name.to_string(), count);
    }

    ComplianceReport {
        batch_id: results.batch_id,
        generated_at: results.created_at,
        total_runs: summary.total_runs,
        passed_runs: summary.passed_runs,
        pass_rate: summary.pass_rate,
        fail_rate: if summary.total_runs == 0 {
            0.0
        } else {
            1.0 - summary.pass_rate
        },
        status_counts,
        violations,
        performance: PerformanceMetrics {
            total_turns: summary.total_turns,
            degraded_turns: summary.degraded_turns,
            mean_agent_latency_ms: summary.mean_agent_latency_ms,
            p95_agent_latency_ms: p95,
            mean_run_duration_ms: summary.mean_run_duration_ms,
            hallucination_flag_rate: summary.hallucination_flag_rate,
        },
        audit_trail: audit_trail(results),
    }
}
