//! Product catalog and its inverted word index.
//!
//! The index is rebuilt wholesale from a [`CatalogSource`] and published as
//! an immutable [`CatalogSnapshot`]. Readers clone the current `Arc` and
//! never observe a half-built index; a rebuild swaps the pointer in one
//! step.

mod source;

pub use source::{CatalogSource, HttpCatalogSource, StaticCatalogSource};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A product as served by the catalog source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Product id (the ledger's resource id).
    pub id: u64,
    /// Title.
    pub title: String,
    /// Category.
    #[serde(default)]
    pub category: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Every other field of the source record, passed to the analysis untouched.
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl CatalogEntry {
    /// Entry with only the indexed fields set.
    #[must_use]
    pub fn new(id: u64, title: &str, category: &str, description: &str) -> Self {
        Self {
            id,
            title: title.to_string(),
            category: category.to_string(),
            description: description.to_string(),
            attributes: serde_json::Map::new(),
        }
    }

    fn indexed_text(&self) -> String {
        format!("{} {} {}", self.title, self.category, self.description)
    }
}

/// Lowercase, replace anything outside `[a-z0-9]` with a space, collapse runs of spaces.
#[must_use]
pub fn normalize(text: &str) -> String {
    let replaced: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalized, non-empty tokens of `text`.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split(' ')
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// One immutable build of the catalog.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    entries: HashMap<u64, CatalogEntry>,
    postings: BTreeMap<String, Vec<u64>>,
}

impl CatalogSnapshot {
    /// Index `entries`. Later duplicates of an id replace earlier ones.
    #[must_use]
    pub fn build(entries: Vec<CatalogEntry>) -> Self {
        let mut postings: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        let mut by_id = HashMap::with_capacity(entries.len());

        for entry in entries {
            for token in tokenize(&entry.indexed_text()) {
                let ids = postings.entry(token).or_default();
                if !ids.contains(&entry.id) {
                    ids.push(entry.id);
                }
            }
            by_id.insert(entry.id, entry);
        }

        Self {
            entries: by_id,
            postings,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of distinct indexed words.
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.postings.len()
    }

    /// Entry with `id`.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&CatalogEntry> {
        self.entries.get(&id)
    }

    /// Ids ranked by how many (indexed word, query token) pairs match.
    ///
    /// An indexed word matches a query token when it contains it. Ties keep
    /// the order in which ids were first hit while walking the words in
    /// sorted order, so results are deterministic for a given build.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<u64> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut scores: Vec<(u64, usize)> = Vec::new();
        let mut slot: HashMap<u64, usize> = HashMap::new();

        for (word, ids) in &self.postings {
            let hits = tokens.iter().filter(|t| word.contains(t.as_str())).count();
            if hits == 0 {
                continue;
            }
            for id in ids {
                let index = *slot.entry(*id).or_insert_with(|| {
                    scores.push((*id, 0));
                    scores.len() - 1
                });
                scores[index].1 += hits;
            }
        }

        scores.sort_by(|a, b| b.1.cmp(&a.1));
        scores.into_iter().map(|(id, _)| id).collect()
    }

    /// Top-ranked id for `query`, or `fallback` when nothing matches.
    #[must_use]
    pub fn best_match(&self, query: &str, fallback: Option<u64>) -> Option<u64> {
        self.search(query).first().copied().or(fallback)
    }
}

/// Shared catalog index with atomic snapshot replacement.
#[derive(Debug, Default)]
pub struct CatalogIndex {
    current: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Holders keep it alive across rebuilds.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Replace the index with a fresh build of `entries`.
    pub fn rebuild(&self, entries: Vec<CatalogEntry>) -> Arc<CatalogSnapshot> {
        let snapshot = Arc::new(CatalogSnapshot::build(entries));
        *self.current.write() = Arc::clone(&snapshot);
        info!(
            "Catalog indexed: {} entries, {} words",
            snapshot.len(),
            snapshot.word_count()
        );
        snapshot
    }

    /// Fetch everything from `source` and rebuild.
    ///
    /// The current snapshot stays in place if the fetch fails.
    ///
    /// # Errors
    ///
    /// Returns the source's error.
    pub async fn refresh_from(
        &self,
        source: &dyn CatalogSource,
    ) -> crate::Result<Arc<CatalogSnapshot>> {
        let entries = source.fetch_all().await?;
        debug!("Fetched {} catalog entries", entries.len());
        Ok(self.rebuild(entries))
    }

    /// Ranked ids for `query` against the current snapshot.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<u64> {
        self.snapshot().search(query)
    }

    /// Top id for `query`, or `fallback`.
    #[must_use]
    pub fn best_match(&self, query: &str, fallback: Option<u64>) -> Option<u64> {
        self.snapshot().best_match(query, fallback)
    }
}
