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

//! Agentsim Core
//!
//! Data contracts shared by the simulation engine, its exporters and callers:
//! personas, test cases, rules, turns, runs, batch configuration and errors.

pub mod config;
pub mod error;
pub mod persona;
pub mod rule;
pub mod run;
pub mod state_machine;
pub mod test_case;
pub mod turn;

pub use config::{
    HallucinationConfig, JudgeConfig, KnowledgeBaseConfig, KnowledgeDocument, LlmConfig,
    PersonaConfig, SimulationConfig, WebhookTargetConfig,
};
pub use error::{SimulationError, SimulationResult};
pub use persona::{
    default_id_column, AssignmentStrategy, Communication, Demographics, Level, Persona,
    PersonaAxes, PersonaTemplate, Psychology,
};
pub use rule::{Rule, RuleCategory, RuleScope};
pub use run::{EvaluationResultSet, ResultSummary, RunStatus, SimulationRun, TerminationReason};
pub use state_machine::{ConversationEvent, ConversationState, InvalidTransition};
pub use test_case::TestCase;
pub use turn::{
    AgentOutput, Attachment, HallucinationClaim, InvestigationIssue, ToolEvent, ToolEventStatus,
    Turn, Usefulness, VerdictScope, Violation,
};
