//! RAG reranking and prompt injection
//!
//! Retrieval candidates arrive with an upstream vector score; the reranker
//! combines that with a BM25-style lexical score against the user's query,
//! keeps the top-k, and injects the survivors into the prompt. The ranked
//! set also feeds the transparency trail: previews and scores end up in the
//! RAG log and the UI sources panel.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::{ChatMessage, MessageContent};

const PREVIEW_CHARS: usize = 400;

/// A retrieved chunk as handed to the gateway (vector search happens
/// upstream of the core).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagChunk {
    pub doc_id: String,
    pub doc_title: Option<String>,
    pub doc_path: Option<String>,
    pub chunk_id: String,
    pub content: String,
    pub vector_score: f64,
    pub metadata: Option<HashMap<String, Value>>,
}

/// A chunk after reranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedChunk {
    pub chunk: RagChunk,
    pub vector_score: f64,
    pub rerank_score: f64,
    pub final_score: f64,
    pub preview: String,
}

/// Reranker output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankerResult {
    pub ranked_chunks: Vec<RankedChunk>,
    pub reranker_type: String,
    pub rerank_latency_ms: f64,
}

impl RerankerResult {
    fn empty() -> Self {
        Self {
            ranked_chunks: vec![],
            reranker_type: "none".to_string(),
            rerank_latency_ms: 0.0,
        }
    }
}

/// Where the retrieval context lands in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStrategy {
    /// Prepend a synthetic system message (default).
    #[default]
    System,
    /// Prefix the first user message with the context block.
    User,
}

/// One row of the UI sources panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub rank: usize,
    pub doc_id: String,
    pub doc_title: String,
    pub doc_path: Option<String>,
    pub chunk_id: String,
    pub preview: String,
    pub vector_score: f64,
    pub rerank_score: f64,
    pub final_score: f64,
    pub metadata: Option<HashMap<String, Value>>,
}

/// BM25 tuning and score blending parameters.
#[derive(Debug, Clone)]
pub struct RerankerParams {
    /// Term-frequency saturation.
    pub k1: f64,
    /// Length normalization strength.
    pub b: f64,
    pub vector_weight: f64,
    pub lexical_weight: f64,
}

impl Default for RerankerParams {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            vector_weight: 0.3,
            lexical_weight: 0.7,
        }
    }
}

/// Lexical reranker combining BM25 scores with upstream vector scores.
#[derive(Debug, Clone, Default)]
pub struct LexicalReranker {
    params: RerankerParams,
}

impl LexicalReranker {
    pub fn new(params: RerankerParams) -> Self {
        Self { params }
    }

    /// Rerank `chunks` against `query`, keeping the top `top_k` (all when
    /// `None`). Same inputs always produce the same ordering.
    pub fn rerank(&self, query: &str, chunks: &[RagChunk], top_k: Option<usize>) -> RerankerResult {
        if chunks.is_empty() {
            return RerankerResult::empty();
        }
        let started = Instant::now();

        let query_terms = tokenize(query);
        let mut query_term_freq: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            *query_term_freq.entry(term.as_str()).or_default() += 1;
        }

        let doc_tokens: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.content)).collect();
        let doc_lengths: Vec<usize> = doc_tokens.iter().map(Vec::len).collect();
        let avg_doc_length = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<usize>() as f64 / doc_lengths.len() as f64
        };

        let idf = self.idf_scores(query_term_freq.keys().copied(), &doc_tokens);

        let mut ranked: Vec<RankedChunk> = chunks
            .iter()
            .zip(doc_tokens.iter())
            .zip(doc_lengths.iter())
            .map(|((chunk, tokens), &doc_length)| {
                let lexical = self.bm25_score(&query_term_freq, tokens, doc_length, avg_doc_length, &idf);
                let final_score = self.params.vector_weight * chunk.vector_score
                    + self.params.lexical_weight * lexical;
                RankedChunk {
                    chunk: chunk.clone(),
                    vector_score: chunk.vector_score,
                    rerank_score: lexical,
                    final_score,
                    preview: preview(&chunk.content),
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(k) = top_k {
            ranked.truncate(k);
        }

        RerankerResult {
            ranked_chunks: ranked,
            reranker_type: "lexical_bm25".to_string(),
            rerank_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
        }
    }

    /// IDF per query term, lower-bounded Lucene style:
    /// ln(1 + (N − df + 0.5) / (df + 0.5)). The raw log form degenerates to
    /// 0 for tiny candidate sets (N = 2, df = 1), which would erase the
    /// lexical signal exactly where reranking matters most; the 1 + x form
    /// keeps it strictly positive for present terms with the same ordering.
    /// A term absent from every candidate scores 0.
    fn idf_scores<'a>(
        &self,
        terms: impl Iterator<Item = &'a str>,
        doc_tokens: &[Vec<String>],
    ) -> HashMap<String, f64> {
        let n = doc_tokens.len() as f64;
        terms
            .map(|term| {
                let df = doc_tokens
                    .iter()
                    .filter(|tokens| tokens.iter().any(|t| t == term))
                    .count() as f64;
                let idf = if df > 0.0 {
                    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
                } else {
                    0.0
                };
                (term.to_string(), idf)
            })
            .collect()
    }

    fn bm25_score(
        &self,
        query_term_freq: &HashMap<&str, usize>,
        doc_tokens: &[String],
        doc_length: usize,
        avg_doc_length: f64,
        idf: &HashMap<String, f64>,
    ) -> f64 {
        let mut doc_term_freq: HashMap<&str, usize> = HashMap::new();
        for token in doc_tokens {
            *doc_term_freq.entry(token.as_str()).or_default() += 1;
        }

        let mut score = 0.0;
        for term in query_term_freq.keys() {
            let Some(&tf) = doc_term_freq.get(term) else {
                continue;
            };
            let tf = tf as f64;
            let norm = if avg_doc_length > 0.0 {
                1.0 - self.params.b + self.params.b * (doc_length as f64 / avg_doc_length)
            } else {
                1.0
            };
            let term_idf = idf.get(*term).copied().unwrap_or(0.0);
            score += term_idf * (tf * (self.params.k1 + 1.0)) / (tf + self.params.k1 * norm);
        }

        // Normalize into [0,1]: the ceiling is every query term at full
        // saturation. Absent terms contribute 0 on both sides.
        let max_score = idf.values().sum::<f64>() * (self.params.k1 + 1.0);
        if max_score > 0.0 {
            (score / max_score).min(1.0)
        } else {
            score
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn preview(content: &str) -> String {
    let mut out: String = content.chars().take(PREVIEW_CHARS).collect();
    if content.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}

/// Inject the ranked chunks into the conversation. The caller's messages
/// are never mutated; an empty ranked set returns them unchanged.
pub fn inject_chunks(
    messages: &[ChatMessage],
    ranked_chunks: &[RankedChunk],
    strategy: InjectionStrategy,
) -> Vec<ChatMessage> {
    if ranked_chunks.is_empty() {
        return messages.to_vec();
    }

    let context = ranked_chunks
        .iter()
        .enumerate()
        .map(|(i, ranked)| {
            let title = ranked
                .chunk
                .doc_title
                .as_deref()
                .unwrap_or(&ranked.chunk.doc_id);
            format!("[Source {}: {}]\n{}\n", i + 1, title, ranked.chunk.content)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let injection = format!(
        "You have access to the following relevant information from the knowledge base. \
         Use this context to provide accurate and grounded responses:\n\n{context}"
    );

    let mut modified = messages.to_vec();
    match strategy {
        InjectionStrategy::System => {
            modified.insert(0, ChatMessage::text("system", injection));
        }
        InjectionStrategy::User => {
            let target = modified
                .iter_mut()
                .find(|m| m.role == "user" && !m.content.is_structured());
            match target {
                Some(message) => {
                    let original = message.content.as_text().to_string();
                    message.content = MessageContent::Text(format!(
                        "{injection}\n\n---\n\nUser question: {original}"
                    ));
                }
                // No textual user message to prefix; fall back to a system
                // message so the context is not dropped.
                None => modified.insert(0, ChatMessage::text("system", injection)),
            }
        }
    }

    modified
}

/// Format ranked chunks for the UI sources panel.
pub fn format_sources(ranked_chunks: &[RankedChunk]) -> Vec<SourceEntry> {
    ranked_chunks
        .iter()
        .enumerate()
        .map(|(i, ranked)| SourceEntry {
            rank: i + 1,
            doc_id: ranked.chunk.doc_id.clone(),
            doc_title: ranked
                .chunk
                .doc_title
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            doc_path: ranked.chunk.doc_path.clone(),
            chunk_id: ranked.chunk.chunk_id.clone(),
            preview: ranked.preview.clone(),
            vector_score: round3(ranked.vector_score),
            rerank_score: round3(ranked.rerank_score),
            final_score: round3(ranked.final_score),
            metadata: ranked.chunk.metadata.clone(),
        })
        .collect()
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, content: &str, vector_score: f64) -> RagChunk {
        RagChunk {
            doc_id: format!("doc-{id}"),
            doc_title: Some(format!("Title {id}")),
            doc_path: None,
            chunk_id: id.to_string(),
            content: content.to_string(),
            vector_score,
            metadata: None,
        }
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let result = LexicalReranker::default().rerank("query", &[], Some(5));
        assert!(result.ranked_chunks.is_empty());
        assert_eq!(result.reranker_type, "none");
        assert_eq!(result.rerank_latency_ms, 0.0);
    }

    #[test]
    fn lexical_weight_flips_vector_ordering() {
        let chunks = vec![
            chunk("c1", "exact query match here", 0.5),
            chunk("c2", "completely different text", 0.9),
        ];

        let lexical_heavy = LexicalReranker::new(RerankerParams {
            vector_weight: 0.1,
            lexical_weight: 0.9,
            ..Default::default()
        });
        let result = lexical_heavy.rerank("exact query match", &chunks, Some(1));
        assert_eq!(result.ranked_chunks[0].chunk.chunk_id, "c1");
        assert_eq!(result.reranker_type, "lexical_bm25");

        let vector_heavy = LexicalReranker::new(RerankerParams {
            vector_weight: 0.9,
            lexical_weight: 0.1,
            ..Default::default()
        });
        let result = vector_heavy.rerank("exact query match", &chunks, Some(1));
        assert_eq!(result.ranked_chunks[0].chunk.chunk_id, "c2");
    }

    #[test]
    fn output_is_sorted_descending_and_capped() {
        let chunks: Vec<_> = (0..8)
            .map(|i| chunk(&i.to_string(), "the quick brown fox", i as f64 / 10.0))
            .collect();
        let result = LexicalReranker::default().rerank("quick fox", &chunks, Some(5));

        assert_eq!(result.ranked_chunks.len(), 5);
        for pair in result.ranked_chunks.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
    }

    #[test]
    fn reranking_is_deterministic() {
        let chunks = vec![
            chunk("a", "rust async runtime internals", 0.4),
            chunk("b", "tokio runtime scheduling", 0.6),
            chunk("c", "garden watering schedule", 0.5),
        ];
        let reranker = LexicalReranker::default();
        let first = reranker.rerank("tokio runtime", &chunks, None);
        let second = reranker.rerank("tokio runtime", &chunks, None);

        let ids = |r: &RerankerResult| {
            r.ranked_chunks
                .iter()
                .map(|c| c.chunk.chunk_id.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn single_candidate_survives_zero_idf() {
        let chunks = vec![chunk("only", "some text about things", 0.7)];
        let result = LexicalReranker::default().rerank("text", &chunks, Some(5));
        assert_eq!(result.ranked_chunks.len(), 1);
        assert!(result.ranked_chunks[0].final_score.is_finite());
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let chunks = vec![
            chunk("a", &"match ".repeat(200), 1.0),
            chunk("b", "match", 0.0),
        ];
        let result = LexicalReranker::default().rerank("match", &chunks, None);
        for ranked in &result.ranked_chunks {
            assert!((0.0..=1.0).contains(&ranked.rerank_score));
            assert!((0.0..=1.0).contains(&ranked.final_score));
        }
    }

    #[test]
    fn preview_truncates_with_ellipsis() {
        let long = "x".repeat(500);
        let result = LexicalReranker::default().rerank("x", &[chunk("long", &long, 0.5)], None);
        let preview = &result.ranked_chunks[0].preview;
        assert_eq!(preview.chars().count(), 403);
        assert!(preview.ends_with("..."));

        let short = LexicalReranker::default().rerank("y", &[chunk("s", "short", 0.5)], None);
        assert_eq!(short.ranked_chunks[0].preview, "short");
    }

    fn ranked(content: &str) -> RankedChunk {
        RankedChunk {
            chunk: chunk("r1", content, 0.5),
            vector_score: 0.5,
            rerank_score: 0.8,
            final_score: 0.71,
            preview: preview(content),
        }
    }

    #[test]
    fn empty_ranked_set_leaves_messages_unchanged() {
        let messages = vec![
            ChatMessage::text("system", "be nice"),
            ChatMessage::text("user", "hello"),
        ];
        let injected = inject_chunks(&messages, &[], InjectionStrategy::System);
        assert_eq!(injected, messages);
    }

    #[test]
    fn system_strategy_prepends_context_message() {
        let messages = vec![ChatMessage::text("user", "what is bm25?")];
        let injected = inject_chunks(&messages, &[ranked("BM25 is a ranking function")], InjectionStrategy::System);

        assert_eq!(injected.len(), 2);
        assert_eq!(injected[0].role, "system");
        let text = injected[0].content.as_text();
        assert!(text.contains("[Source 1: Title r1]"));
        assert!(text.contains("BM25 is a ranking function"));
        // Caller's list untouched.
        assert_eq!(messages.len(), 1);
        assert_eq!(injected[1], messages[0]);
    }

    #[test]
    fn user_strategy_prefixes_first_user_message() {
        let messages = vec![
            ChatMessage::text("system", "be nice"),
            ChatMessage::text("user", "what is bm25?"),
            ChatMessage::text("user", "second question"),
        ];
        let injected = inject_chunks(&messages, &[ranked("ctx")], InjectionStrategy::User);

        assert_eq!(injected.len(), 3);
        let text = injected[1].content.as_text();
        assert!(text.contains("---\n\nUser question: what is bm25?"));
        // Only the first user message changes.
        assert_eq!(injected[2], messages[2]);
        assert_eq!(messages[1].content.as_text(), "what is bm25?");
    }

    #[test]
    fn sources_are_ranked_and_rounded() {
        let sources = format_sources(&[ranked("content")]);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].rank, 1);
        assert_eq!(sources[0].final_score, 0.71);
        assert_eq!(sources[0].doc_title, "Title r1");
    }
}
