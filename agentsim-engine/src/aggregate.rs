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

//! Merge point for finished runs

use agentsim_core::{EvaluationResultSet, ResultSummary, Rule, RunStatus, SimulationRun};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Accumulates completed runs from concurrent conversations.
///
/// Runs carry disjoint data, so a single lock around the append is the only
/// synchronization.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    runs: Arc<Mutex<Vec<SimulationRun>>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, run: SimulationRun) {
        self.runs.lock().push(run);
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freeze the accumulated runs, in dispatch order, into a result set
    pub fn finish(
        &self,
        batch_id: Uuid,
        requested: usize,
        cancelled: bool,
        rules: Vec<Rule>,
    ) -> EvaluationResultSet {
        let mut runs = std::mem::take(&mut *self.runs.lock());
        runs.sort_by_key(|r| r.index);
        let summary = summarize(&runs);
        EvaluationResultSet {
            batch_id,
            created_at: Utc::now(),
            requested,
            cancelled,
            rules,
            runs,
            summary,
        }
    }
}

fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Summary statistics over a set of runs
pub fn summarize(runs: &[SimulationRun]) -> ResultSummary {
    let mut summary = ResultSummary {
        total_runs: runs.len(),
        ..Default::default()
    };
    let mut latency_total = 0u64;
    let mut duration_total = 0i64;

    for run in runs {
        match run.status {
            RunStatus::Completed => summary.completed += 1,
            RunStatus::Failed => summary.failed += 1,
            RunStatus::TimedOut => summary.timed_out += 1,
            RunStatus::Cancelled => summary.cancelled += 1,
        }

        let mut violated = 0;
        for v in run.violations() {
            violated += 1;
            *summary.violation_counts.entry(v.rule_id.clone()).or_insert(0) += 1;
        }
        summary.total_violations += violated;
        if violated == 0 {
            summary.passed_runs += 1;
        }

        for turn in &run.turns {
            summary.total_turns += 1;
            if turn.is_degraded() {
                summary.degraded_turns += 1;
            }
            summary.total_claims += turn.claims.len();
            summary.flagged_claims += turn.flagged_claims();
            latency_total += turn.agent_latency_ms;
        }

        summary.issue_count += run.issues.len();
        duration_total += run.duration_ms().max(0);
    }

    summary.pass_rate = ratio(summary.passed_runs, summary.total_runs);
    summary.hallucination_flag_rate = ratio(summary.flagged_claims, summary.total_claims);
    summary.mean_agent_latency_ms = ratio(latency_total as usize, summary.total_turns);
    summary.mean_run_duration_ms = ratio(duration_total as usize, summary.total_runs);
    summary
}

#[cfg(test)]
pub(crate) mod fixtures {
    use agentsim_core::{
        AgentOutput, HallucinationClaim, Persona, Rule, SimulationRun, TerminationReason,
        TestCase, Turn, VerdictScope, Violation,
    };
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    pub fn turn(index: usize, text: &str) -> Turn {
        Turn {
            index,
            user_message: format!("question {}", index),
            agent_output: AgentOutput::text(text),
            tool_events: Vec::new(),
            verdicts: Vec::new(),
            claims: Vec::new(),
            diagnostics: Vec::new(),
            started_at: Utc::now(),
            agent_latency_ms: 100,
        }
    }

    /// Run with `turns` turns; `violated` marks turn 0 as breaking `rule`
    pub fn run(index: usize, turns: usize, rule: &Rule, violated: bool) -> SimulationRun {
        let started_at = Utc::now();
        let mut turns: Vec<Turn> = (0..turns).map(|i| turn(i, "OK")).collect();
        if let Some(first) = turns.first_mut() {
            first.verdicts.push(Violation::verdict(
                rule,
                VerdictScope::Turn { index: 0 },
                violated,
                if violated { "too long" } else { "fine" }.to_string(),
            ));
            first.claims.push(HallucinationClaim {
                claim: "Refunds take 90 days.".to_string(),
                sources: Vec::new(),
                confidence: 80.0,
                flagged: violated,
            });
        }
        SimulationRun {
            run_id: Uuid::new_v4(),
            index,
            persona: Persona::new(format!("{}", index + 1)),
            test_case: TestCase::new("t1", "question 0"),
            max_turns: 5,
            turns,
            conversation_verdicts: Vec::new(),
            issues: Vec::new(),
            status: TerminationReason::MaxTurns.status(),
            termination: TerminationReason::MaxTurns,
            error: None,
            diagnostics: Vec::new(),
            started_at,
            finished_at: started_at + Duration::milliseconds(400),
        }
    }
}
