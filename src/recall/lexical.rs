//! Tier 3: in-process lexical fallback over a bounded corpus of recent pairs.
//!
//! Score is the mean of word-set Jaccard and per-word character-trigram Dice,
//! so it tolerates reordering ("Judge home runs" vs "home runs by Judge") and
//! light misspellings. Needs neither the database nor an embedding.

use std::collections::{HashSet, VecDeque};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entries::RecallEntry;
use super::{parse_stored_at, RecallBackend, RecallHit, RecallQuery, RecallTier};
use crate::error::RecallBackendError;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "by", "did", "do", "does", "for", "has", "have", "how", "in", "is",
    "many", "me", "of", "on", "show", "the", "to", "was", "were", "what", "which", "who", "with",
];

#[derive(Debug, Clone)]
struct LexicalEntry {
    question: String,
    query: String,
    stored_at: DateTime<Utc>,
    words: HashSet<String>,
    trigrams: HashSet<String>,
}

impl LexicalEntry {
    fn new(question: String, query: String, stored_at: DateTime<Utc>) -> Self {
        let words = content_words(&question);
        let trigrams = trigrams(&words);
        Self { question, query, stored_at, words, trigrams }
    }

    /// Mean of word Jaccard and trigram Dice, in `[0, 1]`.
    fn similarity(&self, words: &HashSet<String>, grams: &HashSet<String>) -> f64 {
        0.5 * jaccard(words, &self.words) + 0.5 * dice(grams, &self.trigrams)
    }
}

pub struct LexicalBackend {
    corpus: RwLock<VecDeque<LexicalEntry>>,
    capacity: usize,
}

fn content_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn trigrams(words: &HashSet<String>) -> HashSet<String> {
    words
        .iter()
        .flat_map(|w| {
            let padded: Vec<char> = format!(" {w} ").chars().collect();
            padded
                .windows(3)
                .map(|t| t.iter().collect::<String>())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn dice(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    2.0 * a.intersection(b).count() as f64 / total as f64
}

impl LexicalBackend {
    pub fn new(capacity: usize) -> Self {
        Self {
            corpus: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    /// Seed from stored entries (newest first, as [`list_recent`](super::entries::list_recent) returns them).
    pub fn from_entries(entries: Vec<RecallEntry>, capacity: usize) -> Self {
        let backend = Self::new(capacity);
        for entry in entries.into_iter().take(capacity).rev() {
            let stored_at = parse_stored_at(&entry.created_at);
            backend.push_at(entry.question, entry.query, stored_at);
        }
        backend
    }

    pub fn push(&self, question: &str, query: &str) {
        self.push_at(question.to_string(), query.to_string(), Utc::now());
    }

    /// Put a stored entry back, e.g. after it was marked helpful again.
    pub fn restore(&self, entry: &RecallEntry) {
        if self.contains(&entry.question, &entry.query) {
            return;
        }
        let stored_at = parse_stored_at(&entry.created_at);
        self.push_at(entry.question.clone(), entry.query.clone(), stored_at);
    }

    fn contains(&self, question: &str, query: &str) -> bool {
        self.corpus
            .read()
            .map(|c| c.iter().any(|e| e.question == question && e.query == query))
            .unwrap_or(false)
    }

    /// Drop a pair. Returns whether it was present.
    pub fn remove(&self, question: &str, query: &str) -> bool {
        let mut corpus = self
            .corpus
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = corpus.len();
        corpus.retain(|e| !(e.question == question && e.query == query));
        corpus.len() != before
    }

    /// Drop pairs stored before `cutoff`. Returns how many went.
    pub fn retain_newer(&self, cutoff: DateTime<Utc>) -> usize {
        let mut corpus = self
            .corpus
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = corpus.len();
        corpus.retain(|e| e.stored_at >= cutoff);
        before - corpus.len()
    }

    fn push_at(&self, question: String, query: String, stored_at: DateTime<Utc>) {
        let mut corpus = self
            .corpus
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if corpus.len() == self.capacity {
            corpus.pop_front();
        }
        corpus.push_back(LexicalEntry::new(question, query, stored_at));
    }

    pub fn len(&self) -> usize {
        self.corpus.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecallBackend for LexicalBackend {
    fn tier(&self) -> RecallTier {
        RecallTier::Lexical
    }

    async fn search(&self, query: RecallQuery<'_>) -> Result<Vec<RecallHit>, RecallBackendError> {
        let corpus = self
            .corpus
            .read()
            .map_err(|_| RecallBackendError::Unavailable("lexical corpus lock poisoned".into()))?;
        if corpus.is_empty() {
            return Err(RecallBackendError::Unavailable("lexical corpus is empty".into()));
        }

        let words = content_words(query.text);
        let grams = trigrams(&words);
        let mut hits: Vec<RecallHit> = corpus
            .iter()
            .map(|entry| RecallHit {
                question: entry.question.clone(),
                query: entry.query.clone(),
                similarity: entry.similarity(&words, &grams),
                stored_at: entry.stored_at,
            })
            .filter(|hit| hit.similarity > 0.0)
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(query.top_k);
        Ok(hits)
    }
}
