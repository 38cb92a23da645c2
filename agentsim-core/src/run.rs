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

//! Simulation runs and the batch result set

use crate::persona::Persona;
use crate::rule::Rule;
use crate::test_case::TestCase;
use crate::turn::{InvestigationIssue, Turn, VerdictScope, Violation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Terminal status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Why a conversation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    MaxTurns,
    GoalSatisfied,
    AgentTerminated,
    AgentError,
    SimulatorError,
    Timeout,
    Cancelled,
}

impl TerminationReason {
    pub fn status(self) -> RunStatus {
        match self {
            TerminationReason::MaxTurns
            | TerminationReason::GoalSatisfied
            | TerminationReason::AgentTerminated => RunStatus::Completed,
            TerminationReason::AgentError | TerminationReason::SimulatorError => RunStatus::Failed,
            TerminationReason::Timeout => RunStatus::TimedOut,
            TerminationReason::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// One complete simulated conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRun {
    pub run_id: Uuid,
    /// Dispatch order within the batch
    pub index: usize,
    pub persona: Persona,
    pub test_case: TestCase,
    pub max_turns: usize,
    pub turns: Vec<Turn>,
    /// Conversation-scoped rule verdicts
    #[serde(default)]
    pub conversation_verdicts: Vec<Violation>,
    #[serde(default)]
    pub issues: Vec<InvestigationIssue>,
    pub status: RunStatus,
    pub termination: TerminationReason,
    pub error: Option<String>,
    /// Run-level sub-step failures (conversation rules, judge)
    #[serde(default)]
    pub diagnostics: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SimulationRun {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    /// All violated verdicts: turn, tool-event and conversation scoped
    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.turns
            .iter()
            .flat_map(|t| t.violations())
            .chain(self.conversation_verdicts.iter().filter(|v| v.violated))
    }

    pub fn violation_count(&self) -> usize {
        self.violations().count()
    }

    pub fn passed(&self) -> bool {
        self.violation_count() == 0
    }

    /// Check the structural invariants of a finalized run.
    ///
    /// Turn indices are gap-free from 0, the turn count respects `max_turns`,
    /// and every verdict or issue points at a turn that exists.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.turns.len() > self.max_turns {
            return Err(format!(
                "run {} has {} turns, max is {}",
                self.run_id,
                self.turns.len(),
                self.max_turns
            ));
        }
        for (expected, turn) in self.turns.iter().enumerate() {
            if turn.index != expected {
                return Err(format!(
                    "run {} turn at position {} has index {}",
                    self.run_id, expected, turn.index
                ));
            }
            for v in turn
                .verdicts
                .iter()
                .chain(turn.tool_events.iter().flat_map(|e| e.verdicts.iter()))
            {
                if v.scope.turn_index() != Some(turn.index) {
                    return Err(format!(
                        "run {} turn {} holds verdict for {:?}",
                        self.run_id, turn.index, v.scope
                    ));
                }
                if let VerdictScope::ToolEvent { event, .. } = v.scope {
                    if event >= turn.tool_events.len() {
                        return Err(format!(
                            "run {} turn {} verdict references missing tool event {}",
                            self.run_id, turn.index, event
                        ));
                    }
                }
            }
        }
        for v in &self.conversation_verdicts {
            if v.scope != VerdictScope::Conversation {
                return Err(format!(
                    "run {} conversation verdict has scope {:?}",
                    self.run_id, v.scope
                ));
            }
        }
        for issue in &self.issues {
            if let Some(idx) = issue.turn_index {
                if idx >= self.turns.len() {
                    return Err(format!(
                        "run {} issue references missing turn {}",
                        self.run_id, idx
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Summary statistics over all runs of a batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total_runs: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    /// Runs with zero violations
    pub passed_runs: usize,
    pub pass_rate: f64,
    pub total_turns: usize,
    pub degraded_turns: usize,
    pub total_violations: usize,
    /// Violated verdicts per rule id
    pub violation_counts: BTreeMap<String, usize>,
    pub total_claims: usize,
    pub flagged_claims: usize,
    pub hallucination_flag_rate: f64,
    pub issue_count: usize,
    pub mean_agent_latency_ms: f64,
    pub mean_run_duration_ms: f64,
}

/// Terminal artifact of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResultSet {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Simulations requested by the configuration
    pub requested: usize,
    /// Batch was cancelled before every run was dispatched
    pub cancelled: bool,
    pub rules: Vec<Rule>,
    pub runs: Vec<SimulationRun>,
    pub summary: ResultSummary,
}

impl EvaluationResultSet {
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn turn_count(&self) -> usize {
        self.runs.iter().map(|r| r.turns.len()).sum()
    }

    pub fn violation_count(&self) -> usize {
        self.runs.iter().map(|r| r.violation_count()).sum()
    }
}
