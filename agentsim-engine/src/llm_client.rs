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

//! LLM client abstraction for LLM-backed judges and the simulated user

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trait for LLM clients used by judges, verifiers and the user simulator
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Send a prompt and get a JSON response body
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Response from LLM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMResponse {
    pub content: String,
    pub usage: TokenUsage,
    pub model: String,
}

impl LLMResponse {
    /// Parse response as JSON, tolerating a fenced code block around it
    pub fn as_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let trimmed = self.content.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|s| s.strip_suffix("```"))
            .unwrap_or(trimmed);
        serde_json::from_str(body.trim())
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Errors from LLM clients
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// OpenAI-compatible chat completions client
pub struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are an expert evaluator. Respond only with valid JSON."
                },
                {
                    "role": "user",
                    "content": prompt
                }
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LLMError::RateLimitExceeded);
        }
        if !response.status().is_success() {
            let error_text = response.text().await?;
            return Err(LLMError::ApiError(error_text));
        }

        let response_data: serde_json::Value = response.json().await?;

        let content = response_data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(LLMError::InvalidResponse("Missing content".to_string()))?
            .to_string();

        let usage_data = &response_data["usage"];
        let usage = TokenUsage {
            prompt_tokens: usage_data["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage_data["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage_data["total_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(LLMResponse {
            content,
            usage,
            model: self.model.clone(),
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;

    /// Scripted client: each prompt is answered by the first matcher whose
    /// needle occurs in it.
    pub struct ScriptedLLM {
        pub answers: Vec<(&'static str, String)>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl ScriptedLLM {
        pub fn new(answers: Vec<(&'static str, String)>) -> Self {
            Self {
                answers,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedLLM {
        async fn evaluate(&self, prompt: String) -> Result<LLMResponse, LLMError> {
            self.prompts.lock().push(prompt.clone());
            let content = self
                .answers
                .iter()
                .find(|(needle, _)| prompt.contains(needle))
                .map(|(_, a)| a.clone())
                .ok_or_else(|| LLMError::ApiError("no scripted answer".to_string()))?;
            Ok(LLMResponse {
                content,
                usage: TokenUsage::default(),
                model: "mock-model".to_string(),
            })
        }

        fn model_name(&self) -> &str {
            "mock-model"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_json_strips_fences() {
        let response = LLMResponse {
            content: "```json\n{\"ok\": true}\n```".to_string(),
            usage: TokenUsage::default(),
            model: "m".to_string(),
        };
        assert_eq!(response.as_json().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn test_openai_client_parses_completion() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"content":"{\"violated\": false}"}}],
                    "usage":{"prompt_tokens":10,"completion_tokens":3,"total_tokens":13}}"#,
            )
            .create_async()
            .await;

        let client = OpenAIClient::new("sk-test".to_string(), "gpt-4o-mini".to_string())
            .with_base_url(server.url());
        let response = client.evaluate("judge this".to_string()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.usage.total_tokens, 13);
        assert_eq!(response.as_json().unwrap()["violated"], false);
    }

    #[tokio::test]
    async fn test_openai_client_rate_limit() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .create_async()
            .await;

        let client = OpenAIClient::new("k".to_string(), "m".to_string()).with_base_url(server.url());
        let err = client.evaluate("x".to_string()).await.unwrap_err();
        assert!(matches!(err, LLMError::RateLimitExceeded));
    }
}
