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

//! Hallucination detection against a knowledge base
//!
//! Claims are extracted from agent output, then each is verified against
//! the knowledge base. Scores are fixed as follows:
//! - `support` in `[0, 1]` is the verifier's best evidence for the claim
//! - `confidence = round(100 * (1 - support))`, so 0 = fully supported and
//!   100 = certainly unsupported
//! - a claim is flagged when `support < support_threshold`
//!
//! With no knowledge base bound the detector produces no claims.

use crate::knowledge_base::{KnowledgeBase, Passage};
use crate::llm_client::LLMClient;
use crate::text;
use crate::EvalError;
use agentsim_core::{HallucinationClaim, HallucinationConfig};
use async_trait::async_trait;
use futures::future::join_all;
use moka::future::Cache;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Evidence gathered for one claim
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    /// Best support score in `[0, 1]`
    pub support: f64,
    pub evidence: Vec<Passage>,
}

/// Scores one claim against the knowledge base
#[async_trait]
pub trait ClaimVerifier: Send + Sync {
    async fn verify(
        &self,
        claim: &str,
        knowledge_base: &dyn KnowledgeBase,
    ) -> Result<Verification, EvalError>;
}

/// Support = best lexical retrieval score.
///
/// Word overlap alone cannot tell "within 90 days" from "within 14 days",
/// so a passage keeps only the share of its score matching the numbers the
/// claim states.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalVerifier {
    top_k: usize,
}

impl Default for RetrievalVerifier {
    fn default() -> Self {
        Self { top_k: 3 }
    }
}

#[async_trait]
impl ClaimVerifier for RetrievalVerifier {
    async fn verify(
        &self,
        claim: &str,
        knowledge_base: &dyn KnowledgeBase,
    ) -> Result<Verification, EvalError> {
        let mut evidence = knowledge_base.search(claim, self.top_k).await?;
        let claimed = numbers(claim);
        if !claimed.is_empty() {
            for passage in evidence.iter_mut() {
                let stated = numbers(&passage.text);
                let matched = claimed.iter().filter(|n| stated.contains(*n)).count();
                passage.score *= matched as f64 / claimed.len() as f64;
            }
            evidence.sort_by(|a, b| b.score.total_cmp(&a.score));
        }
        let support = evidence.first().map(|p| p.score).unwrap_or(0.0);
        Ok(Verification { support, evidence })
    }
}

/// Numbers stated in `text`, e.g. `14` or `2.5`
fn numbers(text: &str) -> HashSet<&str> {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|t| t.trim_matches('.'))
        .filter(|t| t.chars().any(|c| c.is_ascii_digit()))
        .collect()
}

/// LLM fact-checker over retrieved passages
pub struct LlmClaimVerifier {
    llm_client: Arc<dyn LLMClient>,
    verification_prompt: String,
    top_k: usize,
}

impl LlmClaimVerifier {
    pub fn new(llm_client: Arc<dyn LLMClient>) -> Self {
        Self {
            llm_client,
            verification_prompt: Self::default_verification_prompt(),
            top_k: 5,
        }
    }

    pub fn with_prompt(mut self, prompt: String) -> Self {
        self.verification_prompt = prompt;
        self
    }

    fn default_verification_prompt() -> String {
        r#"You are an expert fact-checker. Verify the claim against the provided context.

CONTEXT:
{context}

CLAIM:
{claim}

Determine its status:
- Supported: The claim is explicitly supported by the context.
- Contradicted: The claim contradicts the context.
- Unsupported: The claim is not mentioned in the context.
- Unverifiable: The context is insufficient to verify the claim.

Respond in JSON format:
{
  "status": "Supported" | "Contradicted" | "Unsupported" | "Unverifiable",
  "evidence": "quote from context supporting the verdict",
  "confidence": <float 0-1>
}"#
        .to_string()
    }
}

#[async_trait]
impl ClaimVerifier for LlmClaimVerifier {
    async fn verify(
        &self,
        claim: &str,
        knowledge_base: &dyn KnowledgeBase,
    ) -> Result<Verification, EvalError> {
        let evidence = knowledge_base.search(claim, self.top_k).await?;
        if evidence.is_empty() {
            return Ok(Verification {
                support: 0.0,
                evidence,
            });
        }

        let context = evidence
            .iter()
            .map(|p| format!("[{}] {}", p.document_id, p.text))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self
            .verification_prompt
            .replace("{context}", &context)
            .replace("{claim}", claim);

        let response = self.llm_client.evaluate(prompt).await?;
        let json = response.as_json().map_err(|e| {
            EvalError::LLMClientError(format!("Failed to parse verification JSON: {}", e))
        })?;

        let status = json["status"]
            .as_str()
            .ok_or_else(|| EvalError::LLMClientError("Missing status".to_string()))?;
        let confidence = json["confidence"].as_f64().unwrap_or(0.8).clamp(0.0, 1.0);

        let support = match status {
            "Supported" => confidence,
            "Contradicted" | "Unsupported" => 1.0 - confidence,
            _ => 0.0,
        };

        Ok(Verification { support, evidence })
    }
}

const HEDGES: &[&str] = &[
    "i think",
    "i believe",
    "maybe",
    "perhaps",
    "might",
    "let me",
    "i can help",
    "i'd be happy",
    "i would be happy",
    "please",
    "feel free",
    "thank you",
    "thanks",
];

const ASSERTIVE: &[&str] = &[
    "is", "are", "was", "were", "has", "have", "had", "will", "costs", "cost", "takes", "includes",
    "offers", "provides", "requires", "supports", "allows", "opens", "closes", "ships",
];

/// Split a response into declarative sentences that assert something
/// checkable: questions, pleasantries and hedged statements are skipped.
pub fn extract_claims(response: &str, max_claims: usize) -> Vec<String> {
    text::sentences(response)
        .into_iter()
        .filter(|s| !s.ends_with('?'))
        .filter(|s| s.split_whitespace().count() >= 4)
        .filter(|s| {
            let lower = s.to_lowercase();
            !HEDGES.iter().any(|h| lower.starts_with(h) || lower.contains(&format!(" {}", h)))
        })
        .filter(|s| {
            let tokens = text::tokenize(s);
            s.chars().any(|c| c.is_ascii_digit())
                || tokens.iter().any(|t| ASSERTIVE.contains(&t.as_str()))
        })
        .take(max_claims)
        .collect()
}

/// Extracts and verifies claims; one instance is shared by every run
pub struct HallucinationDetector {
    verifier: Arc<dyn ClaimVerifier>,
    support_threshold: f64,
    max_claims: usize,
    cache: Cache<String, Verification>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
}

impl Default for HallucinationDetector {
    fn default() -> Self {
        Self::new(Arc::new(RetrievalVerifier::default()))
    }
}

impl HallucinationDetector {
    pub fn new(verifier: Arc<dyn ClaimVerifier>) -> Self {
        let defaults = HallucinationConfig::default();
        Self {
            verifier,
            support_threshold: defaults.support_threshold,
            max_claims: defaults.max_claims_per_turn,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_config(mut self, config: &HallucinationConfig) -> Self {
        self.support_threshold = config.support_threshold;
        self.max_claims = config.max_claims_per_turn;
        self
    }

    /// Claims in `response`, each scored against `knowledge_base`.
    ///
    /// Returns no claims when no knowledge base is bound. Any verification
    /// failure fails the whole call so the caller can mark the turn degraded.
    pub async fn detect(
        &self,
        response: &str,
        knowledge_base: Option<&dyn KnowledgeBase>,
    ) -> Result<Vec<HallucinationClaim>, EvalError> {
        let Some(kb) = knowledge_base else {
            return Ok(Vec::new());
        };

        let claims = extract_claims(response, self.max_claims);
        let verified = join_all(claims.iter().map(|c| self.verify_cached(c, kb))).await;

        claims
            .into_iter()
            .zip(verified)
            .map(|(claim, verification)| {
                let verification = verification?;
                Ok(self.score(claim, verification))
            })
            .collect()
    }

    async fn verify_cached(
        &self,
        claim: &str,
        kb: &dyn KnowledgeBase,
    ) -> Result<Verification, EvalError> {
        let key = claim.trim().to_lowercase();
        if let Some(hit) = self.cache.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let verification = self.verifier.verify(claim, kb).await?;
        self.cache.insert(key, verification.clone()).await;
        Ok(verification)
    }

    fn score(&self, claim: String, verification: Verification) -> HallucinationClaim {
        let support = if verification.support.is_finite() {
            verification.support.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let flagged = support < self.support_threshold;
        let mut sources: Vec<String> = Vec::new();
        if !flagged {
            for p in verification
                .evidence
                .iter()
                .filter(|p| p.score >= self.support_threshold)
            {
                if !sources.contains(&p.document_id) {
                    sources.push(p.document_id.clone());
                }
            }
        }
        HallucinationClaim {
            claim,
            sources,
            confidence: (100.0 * (1.0 - support)).round(),
            flagged,
        }
    }

    /// (hits, misses) of the verification cache
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_base::InMemoryKnowledgeBase;
    use crate::llm_client::mock::ScriptedLLM;

    fn kb() -> InMemoryKnowledgeBase {
        InMemoryKnowledgeBase::new().with_document(
            "refund-policy",
            "Refunds are issued within 14 days of purchase. Store credit never expires.",
        )
    }

    #[test]
    fn test_extract_claims_skips_questions_and_pleasantries() {
        let claims = extract_claims(
            "Thanks for reaching out! Refunds are issued within 14 days. \
             Would you like me to start one? I think it might rain later today.",
            10,
        );
        assert_eq!(claims, vec!["Refunds are issued within 14 days."]);
    }

    #[tokio::test]
    async fn test_detect_flags_unsupported_claims() {
        let kb = kb();
        let detector = HallucinationDetector::default();
        let claims = detector
            .detect(
                "Refunds are issued within 14 days of purchase. Premium members are given free flights to Paris.",
                Some(&kb),
            )
            .await
            .unwrap();

        assert_eq!(claims.len(), 2);
        assert!(!claims[0].flagged);
        assert_eq!(claims[0].confidence, 0.0);
        assert_eq!(claims[0].sources, vec!["refund-policy"]);
        assert!(claims[1].flagged);
        assert!(claims[1].confidence > 50.0 && claims[1].confidence <= 100.0);
        assert!(claims[1].sources.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_number_is_flagged() {
        let claims = HallucinationDetector::default()
            .detect("Refunds are issued within 90 days of purchase.", Some(&kb()))
            .await
            .unwrap();

        assert_eq!(claims.len(), 1);
        assert!(claims[0].flagged);
        assert_eq!(claims[0].confidence, 100.0);
        assert!(claims[0].sources.is_empty());
    }

    struct NanVerifier;

    #[async_trait]
    impl ClaimVerifier for NanVerifier {
        async fn verify(
            &self,
            _claim: &str,
            _knowledge_base: &dyn KnowledgeBase,
        ) -> Result<Verification, EvalError> {
            Ok(Verification {
                support: f64::NAN,
                evidence: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_non_finite_support_counts_as_unsupported() {
        let detector = HallucinationDetector::new(Arc::new(NanVerifier));
        let claims = detector
            .detect("Refunds are issued within 14 days.", Some(&kb()))
            .await
            .unwrap();

        assert_eq!(claims[0].confidence, 100.0);
        assert!(claims[0].flagged);
    }

    #[tokio::test]
    async fn test_no_knowledge_base_yields_no_claims() {
        let detector = HallucinationDetector::default();
        let claims = detector
            .detect("The moon is made of cheese and costs 5 dollars.", None)
            .await
            .unwrap();
        assert!(claims.is_empty());
    }

    #[tokio::test]
    async fn test_repeated_claims_hit_cache() {
        let kb = kb();
        let detector = HallucinationDetector::default();
        let text = "Store credit is valid forever.";
        detector.detect(text, Some(&kb)).await.unwrap();
        detector.detect(text, Some(&kb)).await.unwrap();
        assert_eq!(detector.cache_stats(), (1, 1));
    }

    #[tokio::test]
    async fn test_llm_verifier_contradiction() {
        let llm = Arc::new(ScriptedLLM::new(vec![(
            "CLAIM:",
            r#"{"status": "Contradicted", "evidence": "within 14 days", "confidence": 0.9}"#
                .to_string(),
        )]));
        let detector = HallucinationDetector::new(Arc::new(LlmClaimVerifier::new(llm)));
        let claims = detector
            .detect("Refunds are issued within 90 days of purchase.", Some(&kb()))
            .await
            .unwrap();

        assert_eq!(claims.len(), 1);
        assert!(claims[0].flagged);
        assert_eq!(claims[0].confidence, 90.0);
    }
}
