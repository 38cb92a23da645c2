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

//! Synthetic user personas and the templates they are generated from

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Coarse intensity scale used for urgency, patience and tone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub age_range: Option<String>,
    pub gender: Option<String>,
    pub residence: Option<String>,
    pub income_range: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Psychology {
    pub personality: Option<String>,
    pub emotional_baseline: Option<String>,
    pub urgency: Level,
    pub patience: Level,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Communication {
    pub language_proficiency: Option<String>,
    pub intensity: Level,
}

/// Synthetic user profile driving the simulated side of a conversation.
///
/// Immutable for the lifetime of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub user_id: String,
    #[serde(default)]
    pub demographics: Demographics,
    #[serde(default)]
    pub psychology: Psychology,
    #[serde(default)]
    pub communication: Communication,
    pub occupation: Option<String>,
    pub notes: Option<String>,
    /// Free-form attributes (every non-identifier column of an uploaded record)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Caller-supplied user context (wearable data, questionnaires, ...)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl Persona {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            demographics: Demographics::default(),
            psychology: Psychology::default(),
            communication: Communication::default(),
            occupation: None,
            notes: None,
            attributes: BTreeMap::new(),
            context: serde_json::Map::new(),
        }
    }

    /// One-line description used in prompts and logs
    pub fn describe(&self) -> String {
        let mut parts = vec![format!("user {}", self.user_id)];
        let d = &self.demographics;
        for value in [&d.age_range, &d.gender, &d.residence, &d.income_range]
            .into_iter()
            .flatten()
        {
            parts.push(value.clone());
        }
        if let Some(occupation) = &self.occupation {
            parts.push(occupation.clone());
        }
        if let Some(personality) = &self.psychology.personality {
            parts.push(format!("{} personality", personality));
        }
        parts.push(format!(
            "urgency {:?}, patience {:?}, intensity {:?}",
            self.psychology.urgency, self.psychology.patience, self.communication.intensity
        ));
        for (k, v) in &self.attributes {
            parts.push(format!("{}={}", k, v));
        }
        parts.join(", ")
    }
}

/// Enumerated attribute values a synthetic persona is drawn from.
///
/// An empty axis leaves the corresponding persona field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaAxes {
    pub age_ranges: Vec<String>,
    pub genders: Vec<String>,
    pub residences: Vec<String>,
    pub income_ranges: Vec<String>,
    pub personalities: Vec<String>,
    pub emotional_baselines: Vec<String>,
    pub urgency: Vec<Level>,
    pub patience: Vec<Level>,
    pub language_proficiency: Vec<String>,
    pub intensity: Vec<Level>,
    pub occupations: Vec<String>,
}

impl Default for PersonaAxes {
    fn default() -> Self {
        let s = |xs: &[&str]| xs.iter().map(|x| x.to_string()).collect::<Vec<_>>();
        Self {
            age_ranges: s(&["18-24", "25-34", "35-49", "50-64", "65+"]),
            genders: s(&["female", "male", "non-binary"]),
            residences: s(&["urban", "suburban", "rural"]),
            income_ranges: s(&["low", "middle", "high"]),
            personalities: s(&["analytical", "friendly", "skeptical", "impatient"]),
            emotional_baselines: s(&["calm", "anxious", "frustrated"]),
            urgency: vec![Level::Low, Level::Medium, Level::High],
            patience: vec![Level::Low, Level::Medium, Level::High],
            language_proficiency: s(&["native", "fluent", "basic"]),
            intensity: vec![Level::Low, Level::Medium, Level::High],
            occupations: Vec::new(),
        }
    }
}

/// Source of personas for a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersonaTemplate {
    /// Synthesize personas from attribute axes
    Axes(PersonaAxes),
    /// Uploaded per-user rows; `id_column` must be present and unique
    Records {
        #[serde(default = "default_id_column")]
        id_column: String,
        rows: Vec<BTreeMap<String, String>>,
    },
    /// Tabular file with a header row, loaded into `Records` before dispatch
    Csv {
        path: PathBuf,
        #[serde(default = "default_id_column")]
        id_column: String,
    },
}

impl Default for PersonaTemplate {
    fn default() -> Self {
        PersonaTemplate::Axes(PersonaAxes::default())
    }
}

pub fn default_id_column() -> String {
    "user_id".to_string()
}

/// How personas are assigned to dispatched conversations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Fixed input order, cycling: conversation `i` gets record `i mod K`
    #[default]
    Sequential,
    /// Seeded independent draws
    Random,
    /// Every record once per cycle, in a seeded order that changes per cycle
    RoundRobin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_deserializes_tagged() {
        let toml_src = r#"
            kind = "records"
            rows = [{ user_id = "1", plan = "gold" }]
        "#;
        let template: PersonaTemplate = toml::from_str(toml_src).unwrap();
        match template {
            PersonaTemplate::Records { id_column, rows } => {
                assert_eq!(id_column, "user_id");
                assert_eq!(rows[0]["plan"], "gold");
            }
            other => panic!("unexpected template {:?}", other),
        }
    }

    #[test]
    fn test_describe_includes_attributes() {
        let mut persona = Persona::new("42");
        persona.occupation = Some("nurse".to_string());
        persona.attributes.insert("plan".into(), "gold".into());
        let text = persona.describe();
        assert!(text.contains("user 42"));
        assert!(text.contains("nurse"));
        assert!(text.contains("plan=gold"));
    }
}
