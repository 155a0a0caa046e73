//! Knowledge retrieval seam.
//!
//! The core does not define a retrieval backend; it consumes an abstract
//! "rank documents for a query" capability. Agents wrap every `rank` call in
//! the recovery handler, treating any backend error as an opaque [`Fault`].
//!
//! [`KeywordKnowledgeBase`] is a small in-memory FAQ implementation for the
//! reference deployment: token-overlap scoring, no embedding model.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::recovery::Fault;

/// One retrievable document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: u64,
    pub question: String,
    pub answer: String,
    pub category: String,
}

/// A document with its relevance score, higher is better.
#[derive(Debug, Clone)]
pub struct Scored {
    pub document: Document,
    pub score: f64,
}

/// Abstract retrieval capability consumed by agents.
#[async_trait]
pub trait Retrieval: Send + Sync {
    /// The `k` most relevant documents for `query`, best first.
    async fn rank(&self, query: &str, k: usize) -> Result<Vec<Scored>, Fault>;
}

/// In-memory FAQ store with bag-of-words overlap scoring.
#[derive(Debug, Clone, Default)]
pub struct KeywordKnowledgeBase {
    entries: Vec<Document>,
}

impl KeywordKnowledgeBase {
    pub fn new(entries: Vec<Document>) -> Self {
        Self { entries }
    }

    /// A starter FAQ set for demos and tests.
    pub fn with_default_faq() -> Self {
        let faq = [
            (
                "How do I reset my password?",
                "Open the account page, choose 'Forgot password' and follow the prompts.",
                "account",
            ),
            (
                "How do I check my order status?",
                "Sign in and open 'My orders' to see the status of every order.",
                "orders",
            ),
            (
                "Which payment methods are supported?",
                "We accept credit cards, bank transfer and major mobile wallets.",
                "payments",
            ),
            (
                "How do I contact support?",
                "The 'Contact us' page lists the support phone line and live chat.",
                "support",
            ),
            (
                "What is the refund policy?",
                "Orders can be returned within 7 days, no questions asked.",
                "refunds",
            ),
        ];
        Self::new(
            faq.iter()
                .enumerate()
                .map(|(i, (question, answer, category))| Document {
                    id: i as u64 + 1,
                    question: question.to_string(),
                    answer: answer.to_string(),
                    category: category.to_string(),
                })
                .collect(),
        )
    }

    pub fn add(&mut self, document: Document) {
        self.entries.push(document);
    }

    fn tokens(text: &str) -> HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect()
    }

    /// Jaccard-style overlap between the query and question tokens.
    fn score(query: &HashSet<String>, question: &str) -> f64 {
        let question = Self::tokens(question);
        if query.is_empty() || question.is_empty() {
            return 0.0;
        }
        let overlap = query.intersection(&question).count();
        overlap as f64 / query.union(&question).count() as f64
    }
}

#[async_trait]
impl Retrieval for KeywordKnowledgeBase {
    async fn rank(&self, query: &str, k: usize) -> Result<Vec<Scored>, Fault> {
        let query_tokens = Self::tokens(query);
        let mut scored: Vec<Scored> = self
            .entries
            .iter()
            .map(|doc| Scored {
                score: Self::score(&query_tokens, &doc.question),
                document: doc.clone(),
            })
            .filter(|s| s.score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rank_orders_by_relevance() {
        let kb = KeywordKnowledgeBase::with_default_faq();
        let results = kb.rank("how do I reset my password", 3).await.unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].document.category, "account");
        assert!(results
            .windows(2)
            .all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_rank_truncates_to_k() {
        let kb = KeywordKnowledgeBase::with_default_faq();
        let results = kb.rank("how do I contact support about my order", 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_unrelated_query_ranks_nothing() {
        let kb = KeywordKnowledgeBase::with_default_faq();
        let results = kb.rank("zzz qqq xxx", 5).await.unwrap();
        assert!(results.is_empty());
    }
}
