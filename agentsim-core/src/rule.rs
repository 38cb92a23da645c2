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

//! Natural-language behavior rules
//!
//! Rules are plain strings. Leading bracketed tags select the scope and
//! category, e.g. `"[conversation][safety] Never share account numbers"`.
//! Untagged rules are turn-scoped.

use crate::error::SimulationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    #[default]
    Turn,
    Conversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Safety,
    Accuracy,
    Compliance,
    Tone,
}

impl RuleCategory {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "safety" => Some(RuleCategory::Safety),
            "accuracy" => Some(RuleCategory::Accuracy),
            "compliance" => Some(RuleCategory::Compliance),
            "tone" => Some(RuleCategory::Tone),
            _ => None,
        }
    }
}

/// A statement of expected agent behavior, immutable once a batch starts
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub scope: RuleScope,
    pub category: Option<RuleCategory>,
}

fn tag_pattern() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"^\s*\[([A-Za-z_-]+)\]").expect("static regex"))
}

impl Rule {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            scope: RuleScope::Turn,
            category: None,
        }
    }

    pub fn with_scope(mut self, scope: RuleScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_category(mut self, category: RuleCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Parse a raw rule string with optional leading tags
    pub fn parse(id: impl Into<String>, raw: &str) -> Result<Self, SimulationError> {
        let id = id.into();
        let mut rest = raw;
        let mut scope = RuleScope::Turn;
        let mut category = None;

        while let Some(caps) = tag_pattern().captures(rest) {
            let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
            let tag = caps[1].to_ascii_lowercase();
            match tag.as_str() {
                "turn" => scope = RuleScope::Turn,
                "conversation" => scope = RuleScope::Conversation,
                other => match RuleCategory::from_tag(other) {
                    Some(c) => category = Some(c),
                    None => {
                        return Err(SimulationError::config(format!(
                            "rule {}: unknown tag [{}]",
                            id, other
                        )))
                    }
                },
            }
            rest = &rest[whole..];
        }

        let text = rest.trim();
        if text.is_empty() {
            return Err(SimulationError::config(format!("rule {} is empty", id)));
        }

        Ok(Self {
            id,
            text: text.to_string(),
            scope,
            category,
        })
    }

    /// Parse a flat list of rule strings, assigning ids `rule-1`, `rule-2`, ...
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Rule>, SimulationError> {
        raw.iter()
            .enumerate()
            .map(|(i, r)| Rule::parse(format!("rule-{}", i + 1), r.as_ref()))
            .collect()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.text)
    }
}
