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

use serde::{Deserialize, Serialize};

/// Seed scenario for one conversation. Selected, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    /// First simulated-user message
    pub query: String,
    pub context: Option<String>,
    /// What the simulated user is trying to achieve
    pub goal: Option<String>,
    pub category: Option<String>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
            context: None,
            goal: None,
            category: None,
        }
    }

    /// Test case used when a batch configures none: the batch goal becomes
    /// the opening request.
    pub fn from_batch(context: Option<&str>, goal: Option<&str>) -> Self {
        let query = goal
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| "Hi, can you help me?".to_string());
        Self {
            id: "default".to_string(),
            query,
            context: context.map(str::to_string),
            goal: goal.map(str::to_string),
            category: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = Some(goal.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_case_without_goal_opens_with_greeting() {
        let case = TestCase::from_batch(None, None);
        assert_eq!(case.id, "default");
        assert_eq!(case.query, "Hi, can you help me?");
        assert_eq!(case.goal, None);
    }

    #[test]
    fn test_batch_goal_becomes_opening_request() {
        let case = TestCase::from_batch(Some("Acme support"), Some("  reset password "));
        assert_eq!(case.query, "reset password");
        assert_eq!(case.context.as_deref(), Some("Acme support"));
        assert_eq!(case.goal.as_deref(), Some("  reset password "));
    }

    #[test]
    fn test_blank_goal_falls_back_to_greeting() {
        let case = TestCase::from_batch(None, Some("   "));
        assert_eq!(case.query, "Hi, can you help me?");
    }
}
