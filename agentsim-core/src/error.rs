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

//! Simulation error taxonomy
//!
//! Only [`SimulationError::Configuration`] aborts a batch. Agent and timeout
//! errors end a single run, evaluation errors are attached to the affected
//! turn, and export errors surface to the caller of the exporter.

use std::time::Duration;
use thiserror::Error;

/// Result type for simulation operations
pub type SimulationResult<T> = Result<T, SimulationError>;

/// Errors that can occur while preparing, running or exporting a batch
#[derive(Debug, Error)]
pub enum SimulationError {
    /// Malformed template, rule or persona input
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Target agent raised or returned malformed output
    #[error("Agent invocation failed: {0}")]
    AgentInvocation(String),

    /// A run or one of its sub-steps exceeded its budget
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A rule or hallucination check could not be computed
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Unsupported export target or incomplete result set
    #[error("Export error: {0}")]
    Export(String),

    /// Batch-level cancellation was requested
    #[error("Simulation cancelled")]
    Cancelled,
}

impl SimulationError {
    /// Shorthand for configuration errors raised during validation
    pub fn config(msg: impl Into<String>) -> Self {
        SimulationError::Configuration(msg.into())
    }

    /// Whether this error aborts the whole batch rather than a single run
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, SimulationError::Configuration(_))
    }
}

impl From<toml::de::Error> for SimulationError {
    fn from(e: toml::de::Error) -> Self {
        SimulationError::Configuration(e.to_string())
    }
}

impl From<std::io::Error> for SimulationError {
    fn from(e: std::io::Error) -> Self {
        SimulationError::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_configuration_is_batch_fatal() {
        assert!(SimulationError::config("missing user_id").is_batch_fatal());
        assert!(!SimulationError::AgentInvocation("boom".into()).is_batch_fatal());
        assert!(!SimulationError::Timeout(Duration::from_secs(1)).is_batch_fatal());
        assert!(!SimulationError::Cancelled.is_batch_fatal());
    }
}
