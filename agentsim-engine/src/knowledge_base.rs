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

//! Read-only knowledge base used to verify claims

use crate::text;
use crate::EvalError;
use agentsim_core::{KnowledgeBaseConfig, KnowledgeDocument, SimulationError, SimulationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A retrieved span of knowledge-base content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub document_id: String,
    pub text: String,
    /// Retrieval score in `[0, 1]`
    pub score: f64,
}

/// Already-indexed, queryable content shared by every run of a batch
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    /// Best `k` passages for `query`, highest score first
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, EvalError>;
}

#[derive(Debug, Clone)]
struct Chunk {
    document_id: String,
    text: String,
    words: HashSet<String>,
}

/// Lexical in-memory knowledge base. Documents are split into sentences
/// and a claim is scored by the fraction of its content words a sentence
/// contains.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKnowledgeBase {
    chunks: Vec<Chunk>,
}

impl InMemoryKnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(mut self, id: impl Into<String>, body: &str) -> Self {
        self.add_document(id, body);
        self
    }

    pub fn add_document(&mut self, id: impl Into<String>, body: &str) {
        let id = id.into();
        for sentence in text::sentences(body) {
            let words = text::content_words(&sentence);
            if words.is_empty() {
                continue;
            }
            self.chunks.push(Chunk {
                document_id: id.clone(),
                text: sentence,
                words,
            });
        }
    }

    /// Inline documents plus one document per configured text file
    pub fn from_config(config: &KnowledgeBaseConfig) -> SimulationResult<Self> {
        let mut kb = Self::new();
        for KnowledgeDocument { id, text } in &config.documents {
            kb.add_document(id.clone(), text);
        }
        for path in &config.paths {
            let body = std::fs::read_to_string(path).map_err(|e| {
                SimulationError::config(format!("knowledge base {}: {}", path.display(), e))
            })?;
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            kb.add_document(id, &body);
        }
        tracing::info!(passages = kb.chunks.len(), "knowledge base loaded");
        Ok(kb)
    }

    pub fn passage_count(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl KnowledgeBase for InMemoryKnowledgeBase {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<Passage>, EvalError> {
        let wanted = text::content_words(query);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Passage> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let hit = wanted.iter().filter(|w| chunk.words.contains(*w)).count();
                (hit > 0).then(|| Passage {
                    document_id: chunk.document_id.clone(),
                    text: chunk.text.clone(),
                    score: hit as f64 / wanted.len() as f64,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }
}
