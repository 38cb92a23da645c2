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

//! Webhook workflow adapter
//!
//! Triggers `POST {base_url}/{workflow_id}` with the configured JSON payload
//! merged with the turn input:
//! ```json
//! {
//!     "message": "user message",
//!     "context": { ... },
//!     "history": [{ "user": "...", "agent": "..." }],
//!     "turn_index": 0
//! }
//! ```
//! The response may be plain text or a JSON object carrying the reply in one
//! of `response`, `output`, `text` or `message`.

use crate::agent::{AgentError, AgentInput, TargetAgent};
use agentsim_core::{AgentOutput, WebhookTargetConfig};
use async_trait::async_trait;
use std::time::Duration;

const REPLY_KEYS: [&str; 4] = ["response", "output", "text", "message"];

#[derive(Clone)]
pub struct WebhookAgent {
    endpoint: String,
    workflow_id: String,
    client: reqwest::Client,
    credential: Option<String>,
    payload: serde_json::Map<String, serde_json::Value>,
    timeout: Duration,
}

impl WebhookAgent {
    pub fn new(base_url: &str, workflow_id: &str) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| AgentError::InvocationFailed(format!("Failed to create client: {}", e)))?;

        Ok(Self {
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), workflow_id),
            workflow_id: workflow_id.to_string(),
            client,
            credential: None,
            payload: serde_json::Map::new(),
            timeout: Duration::from_secs(60),
        })
    }

    pub fn from_config(config: &WebhookTargetConfig) -> Result<Self, AgentError> {
        let mut agent = Self::new(&config.base_url, &config.workflow_id)?;
        agent.credential = config.credential.clone();
        agent.payload = config.payload.clone();
        Ok(agent)
    }

    /// Bearer credential sent with every trigger
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Map<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn body(&self, input: &AgentInput) -> serde_json::Value {
        let mut body = self.payload.clone();
        body.insert("message".to_string(), input.prompt.clone().into());
        body.insert(
            "context".to_string(),
            serde_json::Value::Object(input.context.clone()),
        );
        body.insert(
            "history".to_string(),
            serde_json::to_value(&input.history).unwrap_or_default(),
        );
        body.insert("turn_index".to_string(), input.turn_index.into());
        serde_json::Value::Object(body)
    }
}

fn parse_reply(body: &str) -> Result<AgentOutput, AgentError> {
    let json = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(json) => json,
        Err(_) => return Ok(AgentOutput::text(body.trim())),
    };

    match json {
        serde_json::Value::String(s) => Ok(AgentOutput::text(s)),
        serde_json::Value::Object(map) => {
            let text = REPLY_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str()))
                .ok_or_else(|| {
                    AgentError::InvalidResponse(format!(
                        "expected one of {:?} in webhook response",
                        REPLY_KEYS
                    ))
                })?
                .to_string();
            let mut output = AgentOutput::text(text);
            if let Some(structured) = map.get("structured") {
                output = output.with_structured(structured.clone());
            }
            if let Some(serde_json::Value::Object(meta)) = map.get("metadata") {
                for (k, v) in meta {
                    output = output.with_metadata(k.clone(), v.clone());
                }
            }
            if map.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                output = output.terminal();
            }
            Ok(output)
        }
        serde_json::Value::Array(items) => {
            // Workflow engines often wrap single results in a list
            let first = items
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::InvalidResponse("empty webhook response".into()))?;
            parse_reply(&first.to_string())
        }
        other => Ok(AgentOutput::text(other.to_string())),
    }
}

#[async_trait]
impl TargetAgent for WebhookAgent {
    async fn invoke(&self, input: AgentInput) -> Result<AgentOutput, AgentError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&self.body(&input))
            .timeout(self.timeout);

        if let Some(credential) = &self.credential {
            request = request.header("Authorization", format!("Bearer {}", credential));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(self.timeout)
            } else {
                AgentError::NetworkError(e.to_string())
            }
        })?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(AgentError::RateLimited(retry_after));
        }

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AgentError::AuthenticationFailed);
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::InvocationFailed(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
        parse_reply(&body)
    }

    fn agent_id(&self) -> &str {
        &self.workflow_id
    }
}
