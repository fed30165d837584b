//! Knowledge Retrieval Client: pre-warmed local-index-first document retrieval with a
//! hybrid reranker (§4.5).
//!
//! `original_source/apps/super/super/core/memory/search/reranker.py::hybrid_rerank` is
//! authoritative for the scoring constants and stop-word list reproduced here verbatim:
//! weights `dense=0.5, lexical=0.35, intent=0.15, generic_penalty=0.4`; lexical score is
//! `sum(1 + ln(1+count))` over matched keywords divided by the matched-keyword count;
//! intent score is `0.6*bigram_overlap + 0.4*trigram_overlap` (or an exact substring match
//! when the query has fewer than two words); the generic-document penalty fires only when
//! the query contains an intentful marker word *and* the document contains at least two of
//! five contact markers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tokio::sync::RwLock;

/// A single retrievable document (§4.5). Mirrors the fields of the original `SearchDoc`
/// that the reranker and callers actually consult; presentation-only fields (owners,
/// highlights, recency bias) are out of scope per spec.md's Non-goals around KB internals.
#[derive(Debug, Clone, PartialEq)]
pub struct Doc {
    pub document_id: String,
    pub semantic_identifier: String,
    pub content: String,
    pub source_type: String,
    pub score: f64,
}

/// Per-call caller state consulted by a retrieval client (e.g. which knowledge-base tokens
/// are bound to the active agent). Threading this through separately from `AgentConfig`
/// keeps the client decoupled from the config-resolution data model.
#[derive(Debug, Clone, Default)]
pub struct UserState {
    pub knowledge_base_tokens: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RerankerWeights {
    pub dense: f64,
    pub lexical: f64,
    pub intent: f64,
    pub generic_penalty: f64,
}

impl Default for RerankerWeights {
    fn default() -> Self {
        RerankerWeights {
            dense: 0.5,
            lexical: 0.35,
            intent: 0.15,
            generic_penalty: 0.4,
        }
    }
}

const CONTACT_DOC_MARKERS: &[&str] = &["phone:", "email:", "contact", "new delhi", "@"];
const INTENTFUL_QUERY_MARKERS: &[&str] = &["why", "join", "process", "services", "fees", "timings"];

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // English
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "have", "has",
        "had", "do", "does", "did", "will", "would", "shall", "should", "may", "might", "can",
        "could", "i", "me", "my", "we", "our", "you", "your", "he", "she", "it", "they", "them",
        "this", "that", "these", "those", "am", "if", "or", "but", "not", "no", "so", "at", "by",
        "for", "with", "about", "to", "from", "in", "on", "of", "and", "how", "what", "which",
        "who", "whom", "when", "where", "why", "all", "each", "every", "both", "few", "more",
        "most", "some", "any", "into", "through", "during", "before", "after", "above", "below",
        "up", "down", "out", "off", "over", "under", "again", "further", "then", "once", "here",
        "there", "just", "also", "very", "too", "only", "own", "same", "than", "tell", "know",
        "get",
        // Romanized Hindi / Hinglish
        "ke", "ka", "ki", "hai", "hain", "aur", "se", "ko", "me", "mein", "par", "liye", "tha",
        "the", "thi", "ho", "hota", "hoti", "hote", "yeh", "woh", "kya", "nahi", "na", "ya",
        "bhi", "toh", "jo", "jab", "tak", "koi", "kuch", "sab", "bahut", "ek", "ye", "wo",
        "apna", "apni", "apne", "unka", "unki", "uske", "iske", "jaise",
    ]
    .into_iter()
    .collect()
});

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn query_keywords(query: &str) -> Vec<String> {
    tokenize(query)
        .into_iter()
        .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t.as_str()))
        .collect()
}

fn lexical_score(keywords: &[String], doc_text: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let doc_lower = doc_text.to_lowercase();
    let mut total = 0.0;
    let mut matched = 0u32;
    for keyword in keywords {
        let count = doc_lower.matches(keyword.as_str()).count();
        if count > 0 {
            matched += 1;
            total += 1.0 + ((1 + count) as f64).ln();
        }
    }
    if matched == 0 {
        return 0.0;
    }
    total / matched as f64
}

fn intent_score(query: &str, doc_content: &str) -> f64 {
    let query_lower = query.to_lowercase();
    let doc_lower = doc_content.to_lowercase();
    let query_words = tokenize(&query_lower);

    if query_words.len() < 2 {
        return if doc_lower.contains(query_lower.trim()) { 1.0 } else { 0.0 };
    }

    let bigrams: Vec<String> = (0..query_words.len() - 1)
        .map(|i| format!("{} {}", query_words[i], query_words[i + 1]))
        .collect();
    let matched_bigrams = bigrams.iter().filter(|bg| doc_lower.contains(bg.as_str())).count();
    let bigram_score = if bigrams.is_empty() { 0.0 } else { matched_bigrams as f64 / bigrams.len() as f64 };

    let trigram_score = if query_words.len() >= 3 {
        let trigrams: Vec<String> = (0..query_words.len() - 2)
            .map(|i| format!("{} {} {}", query_words[i], query_words[i + 1], query_words[i + 2]))
            .collect();
        let matched_trigrams = trigrams.iter().filter(|tg| doc_lower.contains(tg.as_str())).count();
        if trigrams.is_empty() { 0.0 } else { matched_trigrams as f64 / trigrams.len() as f64 }
    } else {
        0.0
    };

    0.6 * bigram_score + 0.4 * trigram_score
}

fn generic_doc_penalty(query: &str, doc_content: &str) -> f64 {
    let query_lower = query.to_lowercase();
    if !INTENTFUL_QUERY_MARKERS.iter().any(|m| query_lower.contains(m)) {
        return 0.0;
    }
    let doc_lower = doc_content.to_lowercase();
    let hits = CONTACT_DOC_MARKERS.iter().filter(|m| doc_lower.contains(*m)).count();
    if hits >= 2 {
        1.0
    } else {
        0.0
    }
}

/// Re-ranks `docs` in place of their `score` field, combining each doc's existing (dense)
/// score with lexical, intent, and generic-document-penalty signals. No-ops for 0 or 1 docs.
pub fn hybrid_rerank(query: &str, mut docs: Vec<Doc>, weights: RerankerWeights) -> Vec<Doc> {
    if docs.len() <= 1 {
        return docs;
    }
    let keywords = query_keywords(query);

    for doc in &mut docs {
        let dense = doc.score;
        let lexical = lexical_score(&keywords, &doc.content);
        let intent = intent_score(query, &doc.content);
        let penalty = generic_doc_penalty(query, &doc.content);
        doc.score = weights.dense * dense + weights.lexical * lexical + weights.intent * intent
            - weights.generic_penalty * penalty;
    }

    docs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    docs
}

/// The external search service consulted on pre-warm and on local-index misses (§4.5).
#[async_trait]
pub trait SearchServiceClient: Send + Sync {
    async fn search(&self, kb_tokens: &[String], query: &str, limit: usize) -> Vec<Doc>;
}

/// A local vector store. The real deployment backs this with FAISS or Chroma (§6
/// `VECTOR_BACKEND`); embeddings and ANN search are external concerns per spec.md's
/// Non-goals, so this trait only models the insert/query contract the retrieval client
/// depends on.
#[async_trait]
pub trait LocalIndex: Send + Sync {
    async fn insert(&self, docs: Vec<Doc>);
    async fn query(&self, query: &str, limit: usize) -> Vec<Doc>;
}

/// An in-process [`LocalIndex`] that scores by token-overlap similarity against indexed
/// content. Suitable for tests and for small single-process deployments.
#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<Vec<Doc>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalIndex for InMemoryIndex {
    async fn insert(&self, new_docs: Vec<Doc>) {
        let mut docs = self.docs.write().await;
        for doc in new_docs {
            if let Some(existing) = docs.iter_mut().find(|d| d.document_id == doc.document_id) {
                *existing = doc;
            } else {
                docs.push(doc);
            }
        }
    }

    async fn query(&self, query: &str, limit: usize) -> Vec<Doc> {
        let query_tokens: HashSet<String> = tokenize(query).into_iter().collect();
        let docs = self.docs.read().await;
        let mut scored: Vec<Doc> = docs
            .iter()
            .map(|d| {
                let doc_tokens: HashSet<String> = tokenize(&d.content).into_iter().collect();
                let overlap = query_tokens.intersection(&doc_tokens).count() as f64;
                let denom = query_tokens.len().max(1) as f64;
                let mut doc = d.clone();
                doc.score = overlap / denom;
                doc
            })
            .filter(|d| d.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }
}

/// Bounded page size fetched from the search service on pre-warm and on local-index misses.
const DEFAULT_PAGE_SIZE: usize = 20;

/// Orchestrates pre-warm, local-first retrieval with remote fallback, and reranking (§4.5).
pub struct KnowledgeClient {
    local_index: Arc<dyn LocalIndex>,
    search_service: Arc<dyn SearchServiceClient>,
    /// Minimum number of local hits before a query skips the remote fallback.
    local_result_threshold: usize,
    weights: RerankerWeights,
}

impl KnowledgeClient {
    pub fn new(
        local_index: Arc<dyn LocalIndex>,
        search_service: Arc<dyn SearchServiceClient>,
        local_result_threshold: usize,
    ) -> Self {
        KnowledgeClient {
            local_index,
            search_service,
            local_result_threshold,
            weights: RerankerWeights::default(),
        }
    }

    /// Fetches a bounded page from the search service and indexes it locally. Called once
    /// at session start when the agent config names knowledge-base tokens.
    pub async fn prewarm(&self, kb_tokens: &[String]) {
        if kb_tokens.is_empty() {
            return;
        }
        let docs = self.search_service.search(kb_tokens, "", DEFAULT_PAGE_SIZE).await;
        self.local_index.insert(docs).await;
    }

    /// Returns reranked documents for `query`. Consults the local index first; if it
    /// returns fewer than `local_result_threshold` hits, issues a remote query, inserts
    /// the results locally, and merges them before reranking.
    pub async fn get_docs(&self, query: &str, user_state: &UserState, limit: usize) -> Vec<Doc> {
        let mut docs = self.local_index.query(query, limit).await;

        if docs.len() < self.local_result_threshold {
            let remote = self
                .search_service
                .search(&user_state.knowledge_base_tokens, query, DEFAULT_PAGE_SIZE)
                .await;
            if !remote.is_empty() {
                self.local_index.insert(remote.clone()).await;
                for doc in remote {
                    if !docs.iter().any(|d| d.document_id == doc.document_id) {
                        docs.push(doc);
                    }
                }
            }
        }

        let reranked = hybrid_rerank(query, docs, self.weights);
        reranked.into_iter().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, dense: f64) -> Doc {
        Doc {
            document_id: id.to_string(),
            semantic_identifier: id.to_string(),
            content: content.to_string(),
            source_type: "file".to_string(),
            score: dense,
        }
    }

    #[test]
    fn lexical_score_averages_over_matched_keywords_only() {
        let keywords = vec!["refund".to_string(), "process".to_string()];
        // "refund" appears twice, "process" not at all: averaged over 1 matched keyword.
        let score = lexical_score(&keywords, "the refund refund is quick");
        assert!((score - (1.0 + (3.0_f64).ln())).abs() < 1e-9);
    }

    #[test]
    fn intent_score_uses_substring_match_for_short_queries() {
        assert_eq!(intent_score("fees", "our fees are listed below"), 1.0);
        assert_eq!(intent_score("fees", "pricing is not mentioned"), 0.0);
    }

    #[test]
    fn intent_score_combines_bigram_and_trigram_overlap() {
        let score = intent_score("what are the fees today", "what are the fees for this service today");
        assert!(score > 0.0);
    }

    #[test]
    fn generic_penalty_requires_intentful_query_and_two_contact_markers() {
        let doc_text = "Contact us at phone: 555-1234 or email: hi@example.com";
        assert_eq!(generic_doc_penalty("why do people join", doc_text), 1.0);
        assert_eq!(generic_doc_penalty("what is the weather", doc_text), 0.0);

        let thin_contact_doc = "email: hi@example.com";
        assert_eq!(generic_doc_penalty("why do people join", thin_contact_doc), 1.0);
    }

    #[test]
    fn hybrid_rerank_reorders_by_combined_score() {
        let docs = vec![
            doc("a", "a short mostly irrelevant document", 0.9),
            doc("b", "this document explains the refund process in detail", 0.3),
        ];
        let reranked = hybrid_rerank("refund process", docs, RerankerWeights::default());
        assert_eq!(reranked[0].document_id, "b");
    }

    #[test]
    fn hybrid_rerank_is_noop_for_zero_or_one_docs() {
        let docs = vec![doc("a", "solo document", 0.5)];
        let reranked = hybrid_rerank("anything", docs.clone(), RerankerWeights::default());
        assert_eq!(reranked, docs);
    }

    #[tokio::test]
    async fn in_memory_index_scores_by_token_overlap() {
        let index = InMemoryIndex::new();
        index
            .insert(vec![
                doc("a", "refund policy and process", 0.0),
                doc("b", "completely unrelated content", 0.0),
            ])
            .await;
        let results = index.query("refund process", 10).await;
        assert_eq!(results[0].document_id, "a");
    }

    struct FakeSearchService {
        docs: Vec<Doc>,
    }

    #[async_trait]
    impl SearchServiceClient for FakeSearchService {
        async fn search(&self, _kb_tokens: &[String], _query: &str, _limit: usize) -> Vec<Doc> {
            self.docs.clone()
        }
    }

    #[tokio::test]
    async fn get_docs_falls_back_to_remote_when_local_is_thin() {
        let local = Arc::new(InMemoryIndex::new());
        let remote = Arc::new(FakeSearchService {
            docs: vec![doc("r1", "refund process explained here", 0.8)],
        });
        let client = KnowledgeClient::new(local.clone(), remote, 1);

        let results = client.get_docs("refund process", &UserState::default(), 5).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "r1");

        // The remote hit should now also be present in the local index.
        let local_results = local.query("refund process", 5).await;
        assert_eq!(local_results.len(), 1);
    }

    #[tokio::test]
    async fn prewarm_is_a_noop_without_kb_tokens() {
        let local = Arc::new(InMemoryIndex::new());
        let remote = Arc::new(FakeSearchService { docs: vec![doc("x", "content", 0.5)] });
        let client = KnowledgeClient::new(local.clone(), remote, 1);
        client.prewarm(&[]).await;
        assert!(local.query("content", 5).await.is_empty());
    }
}
