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

//! Batch configuration
//!
//! Loaded from TOML with environment overrides. Priority: env > file > defaults.

use crate::error::{SimulationError, SimulationResult};
use crate::persona::{AssignmentStrategy, PersonaTemplate};
use crate::rule::Rule;
use crate::test_case::TestCase;
use crate::turn::Usefulness;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything a batch needs besides the target agent itself
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default = "default_num_simulations")]
    pub num_simulations: usize,

    /// Upper bound on turns per conversation
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Conversations in flight at once (target-agent rate limit)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Whole-run budget in seconds
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,

    /// Per agent invocation budget in seconds
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,

    /// Free-form description of what is being tested
    #[serde(default)]
    pub context: Option<String>,

    /// What a successful conversation achieves
    #[serde(default)]
    pub goal: Option<String>,

    #[serde(default)]
    pub persona: PersonaConfig,

    /// Flat natural-language rules, optionally tagged
    #[serde(default)]
    pub rules: Vec<String>,

    #[serde(default)]
    pub test_cases: Vec<TestCase>,

    #[serde(default)]
    pub knowledge_base: Option<KnowledgeBaseConfig>,

    #[serde(default)]
    pub hallucination: HallucinationConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    /// Webhook/workflow target agent (CLI runs)
    #[serde(default)]
    pub target: Option<WebhookTargetConfig>,

    /// OpenAI-compatible model for LLM-backed judges and simulator
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Per-call credentials forwarded to adapters
    #[serde(default)]
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PersonaConfig {
    #[serde(default)]
    pub template: PersonaTemplate,

    #[serde(default)]
    pub strategy: AssignmentStrategy,

    /// Seed for random and round-robin strategies
    #[serde(default)]
    pub seed: Option<u64>,

    /// User context merged into every persona
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KnowledgeDocument {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KnowledgeBaseConfig {
    #[serde(default)]
    pub documents: Vec<KnowledgeDocument>,

    /// Plain-text files, one document each (id = file name)
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HallucinationConfig {
    /// Claims whose best knowledge-base support is below this are flagged
    #[serde(default = "default_support_threshold")]
    pub support_threshold: f64,

    #[serde(default = "default_max_claims")]
    pub max_claims_per_turn: usize,
}

impl Default for HallucinationConfig {
    fn default() -> Self {
        Self {
            support_threshold: default_support_threshold(),
            max_claims_per_turn: default_max_claims(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct JudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Issues below this usefulness are dropped
    #[serde(default = "default_min_usefulness")]
    pub min_usefulness: Usefulness,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_usefulness: default_min_usefulness(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct WebhookTargetConfig {
    pub base_url: String,
    pub workflow_id: String,
    #[serde(default)]
    pub credential: Option<String>,
    /// Extra JSON merged into every webhook payload
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Verify claims with the model instead of lexical retrieval
    #[serde(default)]
    pub verify_claims: bool,
}

fn default_num_simulations() -> usize {
    1
}

fn default_max_turns() -> usize {
    5
}

fn default_max_concurrency() -> usize {
    4
}

fn default_run_timeout() -> u64 {
    600
}

fn default_agent_timeout() -> u64 {
    60
}

fn default_support_threshold() -> f64 {
    0.5
}

fn default_max_claims() -> usize {
    20
}

fn default_true() -> bool {
    true
}

fn default_min_usefulness() -> Usefulness {
    Usefulness::Medium
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_simulations: default_num_simulations(),
            max_turns: default_max_turns(),
            max_concurrency: default_max_concurrency(),
            run_timeout_secs: default_run_timeout(),
            agent_timeout_secs: default_agent_timeout(),
            context: None,
            goal: None,
            persona: PersonaConfig::default(),
            rules: Vec::new(),
            test_cases: Vec::new(),
            knowledge_base: None,
            hallucination: HallucinationConfig::default(),
            judge: JudgeConfig::default(),
            target: None,
            llm: None,
            credentials: BTreeMap::new(),
        }
    }
}

impl SimulationConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SimulationResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Supported environment variables:
    /// - AGENTSIM_NUM_SIMULATIONS
    /// - AGENTSIM_MAX_TURNS
    /// - AGENTSIM_MAX_CONCURRENCY
    /// - AGENTSIM_RUN_TIMEOUT: seconds
    /// - AGENTSIM_AGENT_TIMEOUT: seconds
    /// - AGENTSIM_PERSONA_SEED
    /// - AGENTSIM_WEBHOOK_CREDENTIAL: overrides `target.credential`
    /// - OPENAI_API_KEY: fills `llm.api_key` when unset
    pub fn merge_with_env(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(var: &str) -> Option<T> {
            let raw = std::env::var(var).ok()?;
            match raw.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring {}: cannot parse {:?}", var, raw);
                    None
                }
            }
        }

        if let Some(v) = parsed("AGENTSIM_NUM_SIMULATIONS") {
            self.num_simulations = v;
        }
        if let Some(v) = parsed("AGENTSIM_MAX_TURNS") {
            self.max_turns = v;
        }
        if let Some(v) = parsed("AGENTSIM_MAX_CONCURRENCY") {
            self.max_concurrency = v;
        }
        if let Some(v) = parsed("AGENTSIM_RUN_TIMEOUT") {
            self.run_timeout_secs = v;
        }
        if let Some(v) = parsed("AGENTSIM_AGENT_TIMEOUT") {
            self.agent_timeout_secs = v;
        }
        if let Some(v) = parsed("AGENTSIM_PERSONA_SEED") {
            self.persona.seed = Some(v);
        }
        if let Ok(credential) = std::env::var("AGENTSIM_WEBHOOK_CREDENTIAL") {
            if let Some(target) = self.target.as_mut() {
                target.credential = Some(credential);
            }
        }
        if let Some(llm) = self.llm.as_mut() {
            if llm.api_key.is_none() {
                llm.api_key = std::env::var("OPENAI_API_KEY").ok();
            }
        }

        self
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> SimulationResult<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                return Err(SimulationError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        } else {
            Self::default()
        };

        Ok(config.merge_with_env())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    /// Parsed rule set
    pub fn parsed_rules(&self) -> SimulationResult<Vec<Rule>> {
        Rule::parse_all(&self.rules)
    }

    /// Configured test cases, or one derived from `context`/`goal`
    pub fn effective_test_cases(&self) -> Vec<TestCase> {
        if self.test_cases.is_empty() {
            vec![TestCase::from_batch(
                self.context.as_deref(),
                self.goal.as_deref(),
            )]
        } else {
            self.test_cases.clone()
        }
    }

    /// Reject configurations that cannot be dispatched
    pub fn validate(&self) -> SimulationResult<()> {
        if self.num_simulations == 0 {
            return Err(SimulationError::config("num_simulations must be at least 1"));
        }
        if self.max_turns == 0 {
            return Err(SimulationError::config("max_turns must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(SimulationError::config("max_concurrency must be at least 1"));
        }
        if self.run_timeout_secs == 0 || self.agent_timeout_secs == 0 {
            return Err(SimulationError::config("timeouts must be positive"));
        }
        let threshold = self.hallucination.support_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(SimulationError::config(format!(
                "hallucination.support_threshold must be in [0, 1], got {}",
                threshold
            )));
        }

        self.parsed_rules()?;

        let mut ids = HashSet::new();
        for tc in &self.test_cases {
            if tc.query.trim().is_empty() {
                return Err(SimulationError::config(format!(
                    "test case {} has an empty query",
                    tc.id
                )));
            }
            if !ids.insert(tc.id.as_str()) {
                return Err(SimulationError::config(format!(
                    "duplicate test case id {}",
                    tc.id
                )));
            }
        }

        if let Some(target) = &self.target {
            if target.base_url.trim().is_empty() || target.workflow_id.trim().is_empty() {
                return Err(SimulationError::config(
                    "target.base_url and target.workflow_id are required",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = SimulationConfig::default();
        assert_eq!(config.num_simulations, 1);
        assert_eq!(config.max_turns, 5);
        assert!(config.judge.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
num_simulations = 3
max_turns = 2
goal = "Get a refund"
rules = ["Must not exceed 10 words", "[conversation] Must greet the user"]

[persona]
strategy = "round_robin"
seed = 7

[persona.template]
kind = "records"
rows = [{{ user_id = "1" }}, {{ user_id = "2" }}]

[persona.context]
stress = 8
"#
        )
        .unwrap();

        let config = SimulationConfig::from_file(file.path()).unwrap();
        assert_eq!(config.num_simulations, 3);
        assert_eq!(config.max_turns, 2);
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.persona.strategy, AssignmentStrategy::RoundRobin);
        assert_eq!(config.persona.context["stress"], serde_json::json!(8));
        assert_eq!(config.parsed_rules().unwrap().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_effective_test_case_uses_goal() {
        let config = SimulationConfig {
            goal: Some("Book a table for two".to_string()),
            ..Default::default()
        };
        let cases = config.effective_test_cases();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].query, "Book a table for two");
    }

    #[test]
    fn test_validate_rejects_zero_turns() {
        let config = SimulationConfig {
            max_turns: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SimulationError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_malformed_rule() {
        let config = SimulationConfig {
            rules: vec!["[bogus] whatever".to_string()],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_test_cases() {
        let config = SimulationConfig {
            test_cases: vec![TestCase::new("a", "hi"), TestCase::new("a", "hello")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = SimulationConfig::load(Some(PathBuf::from("/nonexistent/agentsim.toml")))
            .unwrap_err();
        assert!(err.is_batch_fatal());
    }
}
