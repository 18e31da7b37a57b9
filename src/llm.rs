//! LLM chat client and the concept-extraction / overview contracts.
//!
//! The engine never talks HTTP directly for enrichment; it goes through the
//! [`ChatClient`] trait so tests can install a mock and so the resilience
//! layer can wrap one seam. [`HttpChatClient`] implements the trait against
//! any OpenAI-compatible `/chat/completions` endpoint.
//!
//! [`ConceptExtractor`] and [`OverviewGenerator`] own prompt construction
//! and response parsing. Extraction output is the stage-cache record shape:
//! primary concepts (bare names or name + one-sentence summary) plus
//! category labels. Oversize documents are split into windows; the split
//! constitutes one logical extraction call and the partial results are
//! merged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmConfig;
use crate::error::{EngineError, Result};

/// Documents above this many characters are extracted in windows.
const LARGE_DOC_CHARS: usize = 400_000;
/// Prompt corpus cap for the content overview call.
pub const OVERVIEW_CORPUS_CHARS: usize = 10_000;

// ============ Chat contract ============

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ChatUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<ChatUsage>,
}

/// The LLM collaborator. Errors surface as engine kinds: rate limits carry
/// `retry_after_ms`, transport problems are dependency failures, auth and
/// content-policy refusals are terminal.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;
}

// ============ HTTP implementation ============

/// OpenAI-compatible chat client.
pub struct HttpChatClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| EngineError::Validation("llm.api_key required".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Dependency(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(0)
                } else {
                    EngineError::Dependency(format!("llm transport: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let text = response.text().await.unwrap_or_default();

            return Err(if status.as_u16() == 429 {
                EngineError::RateLimited {
                    message: format!("llm API 429: {}", text),
                    retry_after_ms,
                }
            } else if status.is_server_error() {
                EngineError::Dependency(format!("llm API {}: {}", status, text))
            } else {
                // Auth and other client errors are terminal.
                EngineError::Validation(format!("llm API {}: {}", status, text))
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        let choice = json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| EngineError::Parse("chat response has no choices".to_string()))?;

        if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("content_filter") {
            return Err(EngineError::Validation(
                "llm refused content".to_string(),
            ));
        }

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| EngineError::Parse("chat response missing content".to_string()))?
            .to_string();

        let usage = json.get("usage").map(|u| ChatUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(|x| x.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|x| x.as_u64())
                .unwrap_or(0) as u32,
        });

        Ok(ChatResponse { text, usage })
    }
}

// ============ Extraction output ============

/// A concept from the extractor: bare name, or name plus one-sentence
/// summary. Merges prefer the summarized variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConceptSeed {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_type: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub synonyms: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub broader_terms: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub narrower_terms: Vec<String>,
}

impl ConceptSeed {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            summary: None,
            concept_type: None,
            synonyms: Vec::new(),
            broader_terms: Vec::new(),
            narrower_terms: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConceptSeedRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default, rename = "type")]
        concept_type: Option<String>,
        #[serde(default)]
        synonyms: Vec<String>,
        #[serde(default)]
        broader_terms: Vec<String>,
        #[serde(default)]
        narrower_terms: Vec<String>,
    },
}

impl<'de> Deserialize<'de> for ConceptSeed {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match ConceptSeedRepr::deserialize(deserializer)? {
            ConceptSeedRepr::Name(name) => ConceptSeed::named(name),
            ConceptSeedRepr::Full {
                name,
                summary,
                concept_type,
                synonyms,
                broader_terms,
                narrower_terms,
            } => ConceptSeed {
                name,
                summary,
                concept_type,
                synonyms,
                broader_terms,
                narrower_terms,
            },
        })
    }
}

/// Parsed extraction output, the shape persisted in the stage cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedConcepts {
    #[serde(default)]
    pub primary_concepts: Vec<ConceptSeed>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl ExtractedConcepts {
    /// Merge another window's output into this one. Duplicate names keep
    /// the first summarized variant seen.
    pub fn merge(&mut self, other: ExtractedConcepts) {
        for seed in other.primary_concepts {
            match self
                .primary_concepts
                .iter_mut()
                .find(|s| s.name.eq_ignore_ascii_case(&seed.name))
            {
                Some(existing) => {
                    if existing.summary.is_none() {
                        existing.summary = seed.summary;
                    }
                    if existing.concept_type.is_none() {
                        existing.concept_type = seed.concept_type;
                    }
                    union_terms(&mut existing.synonyms, seed.synonyms);
                    union_terms(&mut existing.broader_terms, seed.broader_terms);
                    union_terms(&mut existing.narrower_terms, seed.narrower_terms);
                }
                None => self.primary_concepts.push(seed),
            }
        }
        for category in other.categories {
            if !self
                .categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&category))
            {
                self.categories.push(category);
            }
        }
    }
}

/// Case-insensitive union used while merging extraction windows.
fn union_terms(into: &mut Vec<String>, from: Vec<String>) {
    for term in from {
        if !into.iter().any(|t| t.eq_ignore_ascii_case(&term)) {
            into.push(term);
        }
    }
}

/// Strip a Markdown code fence if the model wrapped its JSON in one.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches(['\r', '\n']);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Parse the extractor's JSON reply.
pub fn parse_concepts_json(text: &str) -> Result<ExtractedConcepts> {
    let cleaned = strip_code_fence(text);
    serde_json::from_str(cleaned)
        .map_err(|e| EngineError::Parse(format!("concept extraction JSON: {}", e)))
}

// ============ Concept extractor ============

const EXTRACTION_SYSTEM_PROMPT: &str = "You extract the primary concepts from a document. \
Respond with JSON only: {\"primary_concepts\": [{\"name\": \"...\", \"summary\": \"one sentence\", \
\"type\": \"thematic\" or \"terminology\"}], \"categories\": [\"...\"]}. \
Name 10 to 30 concepts and 1 to 5 high-level categories.";

/// Calls the concept model at most once per document under normal
/// operation (the stage cache absorbs repeats). A windowed pass over an
/// oversize document is one logical call.
pub struct ConceptExtractor {
    chat: Arc<dyn ChatClient>,
    model: String,
}

impl ConceptExtractor {
    pub fn new(chat: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }

    pub async fn extract(&self, document_text: &str) -> Result<ExtractedConcepts> {
        let windows = split_windows(document_text, LARGE_DOC_CHARS);
        debug!(windows = windows.len(), "extracting concepts");

        let mut merged = ExtractedConcepts::default();
        for window in windows {
            let request = ChatRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage::system(EXTRACTION_SYSTEM_PROMPT),
                    ChatMessage::user(window),
                ],
                max_tokens: 2048,
                temperature: 0.2,
            };
            let response = self.chat.chat(request).await?;
            merged.merge(parse_concepts_json(&response.text)?);
        }
        Ok(merged)
    }
}

/// Cut a document into extraction windows at word boundaries.
fn split_windows(text: &str, window_chars: usize) -> Vec<String> {
    let total = text.chars().count();
    if total <= window_chars {
        return vec![text.to_string()];
    }
    let mut windows = Vec::new();
    let mut current = String::with_capacity(window_chars);
    let mut count = 0usize;
    for word in text.split_whitespace() {
        let len = word.chars().count() + 1;
        if count + len > window_chars && !current.is_empty() {
            windows.push(std::mem::take(&mut current));
            count = 0;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
        count += len;
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

// ============ Overview generator ============

const OVERVIEW_SYSTEM_PROMPT: &str = "Summarize the document in 3 to 5 sentences: what it covers, \
its approach, and who it is for. Respond with the summary only.";

/// One short content-overview call per document.
pub struct OverviewGenerator {
    chat: Arc<dyn ChatClient>,
    model: String,
}

impl OverviewGenerator {
    pub fn new(chat: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        Self {
            chat,
            model: model.into(),
        }
    }

    pub async fn generate(&self, document_text: &str) -> Result<String> {
        let corpus = prompt_corpus(document_text, OVERVIEW_CORPUS_CHARS);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(OVERVIEW_SYSTEM_PROMPT),
                ChatMessage::user(corpus),
            ],
            max_tokens: 512,
            temperature: 0.3,
        };
        let response = self.chat.chat(request).await?;
        Ok(response.text.trim().to_string())
    }
}

/// Take the opening of the document up to `max_chars`, cut at a word
/// boundary.
pub fn prompt_corpus(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out = String::with_capacity(max_chars);
    let mut count = 0usize;
    for word in text.split_whitespace() {
        let len = word.chars().count() + 1;
        if count + len > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
        count += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_concept_shapes() {
        let json = r#"{
            "primary_concepts": [
                "innovation",
                {"name": "disruption theory", "summary": "How entrants unseat incumbents.", "type": "thematic"},
                {"name": "jobs to be done"}
            ],
            "categories": ["Business Strategy"]
        }"#;
        let parsed = parse_concepts_json(json).unwrap();
        assert_eq!(parsed.primary_concepts.len(), 3);
        assert_eq!(parsed.primary_concepts[0].name, "innovation");
        assert!(parsed.primary_concepts[0].summary.is_none());
        assert_eq!(
            parsed.primary_concepts[1].summary.as_deref(),
            Some("How entrants unseat incumbents.")
        );
        assert_eq!(parsed.categories, vec!["Business Strategy"]);
    }

    #[test]
    fn parses_fenced_json() {
        let fenced = "```json\n{\"primary_concepts\": [\"alpha\"], \"categories\": []}\n```";
        let parsed = parse_concepts_json(fenced).unwrap();
        assert_eq!(parsed.primary_concepts[0].name, "alpha");
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let err = parse_concepts_json("{ truncated").unwrap_err();
        assert_eq!(err.kind(), "parse_error");
        assert!(err.is_retryable());
    }

    #[test]
    fn merge_prefers_summarized_variant() {
        let mut a = parse_concepts_json(
            r#"{"primary_concepts": ["innovation"], "categories": ["Business"]}"#,
        )
        .unwrap();
        let b = parse_concepts_json(
            r#"{"primary_concepts": [{"name": "Innovation", "summary": "New things."}],
                "categories": ["business", "Strategy"]}"#,
        )
        .unwrap();
        a.merge(b);
        assert_eq!(a.primary_concepts.len(), 1);
        assert_eq!(a.primary_concepts[0].summary.as_deref(), Some("New things."));
        assert_eq!(a.categories, vec!["Business", "Strategy"]);
    }

    #[test]
    fn windows_cover_whole_text() {
        let text = "word ".repeat(1000);
        let windows = split_windows(&text, 100);
        assert!(windows.len() > 1);
        let rejoined: Vec<&str> = windows.iter().flat_map(|w| w.split_whitespace()).collect();
        assert_eq!(rejoined.len(), 1000);
        for w in &windows {
            assert!(w.chars().count() <= 100);
        }
    }

    #[test]
    fn prompt_corpus_respects_cap() {
        let text = "alpha bravo charlie delta".repeat(100);
        let corpus = prompt_corpus(&text, 50);
        assert!(corpus.chars().count() <= 50);
        assert!(!corpus.is_empty());
    }
}
