//! Hybrid search
//!
//! Dense vector KNN plus BM25 keyword search over the same store, blended
//! with a tunable alpha. Either source may be missing; hybrid degrades to
//! whatever is available, down to a plain substring scan for bootstrap
//! databases with neither index.

mod keyword;
mod vector;

pub use keyword::sanitize_fts_query;
pub use vector::{
    VectorIndex, VectorIndexConfig, VectorIndexError, DEFAULT_CONNECTIVITY, DEFAULT_DIMENSIONS,
    DEFAULT_EXPANSION_ADD, DEFAULT_EXPANSION_SEARCH,
};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::memory::{Memory, MemoryFilter};
use crate::storage::{Store, StoreError};

/// Search failures.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Vector index failed.
    #[error(transparent)]
    Vector(#[from] VectorIndexError),
    /// Engine lock poisoned.
    #[error("vector index lock poisoned")]
    LockPoisoned,
}

/// Search result type.
pub type Result<T> = std::result::Result<T, SearchError>;

/// Which index produced a result's score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    /// Vector similarity only.
    Vector,
    /// Keyword BM25 only.
    Keyword,
    /// Blended from both.
    Hybrid,
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// The enriched memory row.
    pub memory: Memory,
    /// Final blended score in [0, 1].
    pub score: f64,
    /// Which source(s) produced the score.
    pub source: ScoreSource,
}

/// Tunable knobs for a hybrid query.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    /// Candidates fetched per source before blending.
    pub top_k: usize,
    /// Final result cap.
    pub limit: usize,
    /// Weight of the vector score; keyword gets `1 - alpha`.
    pub alpha: f64,
    /// Results scoring below this are dropped.
    pub min_score: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: 50,
            limit: 10,
            alpha: 0.7,
            min_score: 0.1,
        }
    }
}

/// Score used by the last-resort substring fallback.
const SUBSTRING_FALLBACK_SCORE: f64 = 0.3;

/// Oversampling factor when the vector KNN has to post-filter.
const FILTER_OVERSAMPLE: usize = 4;

/// Hybrid search engine over a store and its in-memory vector index.
pub struct SearchEngine {
    store: Arc<Store>,
    vector: Mutex<VectorIndex>,
}

impl SearchEngine {
    /// Engine for the given vector dimensionality.
    pub fn new(store: Arc<Store>, dimensions: usize) -> Result<Self> {
        Ok(Self {
            store,
            vector: Mutex::new(VectorIndex::with_dimensions(dimensions)?),
        })
    }

    /// Warm the vector index from stored embeddings. Vectors whose
    /// dimensionality does not match the index are skipped with a warning.
    pub fn load_from_store(&self) -> Result<usize> {
        let embeddings = self.store.live_embeddings()?;
        let mut index = self.vector.lock().map_err(|_| SearchError::LockPoisoned)?;
        let mut loaded = 0;
        for (id, vector) in embeddings {
            if vector.len() != index.dimensions() {
                tracing::warn!(
                    memory = %id,
                    got = vector.len(),
                    expected = index.dimensions(),
                    "skipping embedding with mismatched dimensions"
                );
                continue;
            }
            index.add(&id, &vector)?;
            loaded += 1;
        }
        tracing::info!(loaded, "vector index warmed from store");
        Ok(loaded)
    }

    /// Index (or replace) a memory's vector.
    pub fn index_memory(&self, id: &str, vector: &[f32]) -> Result<()> {
        let mut index = self.vector.lock().map_err(|_| SearchError::LockPoisoned)?;
        index.add(id, vector)?;
        Ok(())
    }

    /// Drop a memory from the vector index (soft-delete path).
    pub fn remove_memory(&self, id: &str) -> Result<()> {
        let mut index = self.vector.lock().map_err(|_| SearchError::LockPoisoned)?;
        index.remove(id);
        Ok(())
    }

    /// Number of indexed vectors.
    pub fn indexed_vectors(&self) -> usize {
        self.vector.lock().map(|index| index.len()).unwrap_or(0)
    }

    /// Hybrid recall.
    ///
    /// 1. Vector KNN (when a query vector is supplied), post-filtered.
    /// 2. BM25 keyword search (when query text is non-empty), normalized as
    ///    `1 / (1 + |raw|)`.
    /// 3. Candidates in both sources blend as `alpha·s_v + (1-alpha)·s_k`.
    ///    When both sources were queried, a single-source candidate keeps
    ///    its weighted share (`alpha·s_v` or `(1-alpha)·s_k`), so moving
    ///    alpha re-ranks vector-only hits against keyword-only hits. When
    ///    only one source was queried its scores pass through unweighted.
    /// 4. `min_score` cutoff, sort, `limit`, enrich preserving order.
    pub fn hybrid(
        &self,
        query_text: &str,
        query_vector: Option<&[f32]>,
        filter: &MemoryFilter,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        let allowed = self.allowed_ids(filter)?;

        let vector_queried = query_vector.is_some();
        let keyword_queried = !query_text.trim().is_empty();

        let vector_hits = match query_vector {
            Some(query) => self.vector_candidates(query, &allowed, opts.top_k)?,
            None => Vec::new(),
        };
        let keyword_hits: Vec<(String, f64)> =
            keyword::keyword_candidates(&self.store, query_text, filter, opts.top_k)?
                .into_iter()
                .map(|(id, raw)| (id, keyword::normalize_bm25(raw)))
                .collect();

        let vector_weight = if keyword_queried { opts.alpha } else { 1.0 };
        let keyword_weight = if vector_queried { 1.0 - opts.alpha } else { 1.0 };

        let mut blended: HashMap<String, (Option<f64>, Option<f64>)> = HashMap::new();
        for (id, score) in &vector_hits {
            blended.entry(id.clone()).or_default().0 = Some(*score);
        }
        for (id, score) in &keyword_hits {
            blended.entry(id.clone()).or_default().1 = Some(*score);
        }

        let mut scored: Vec<(String, f64, ScoreSource)> = blended
            .into_iter()
            .map(|(id, (vector_score, keyword_score))| match (vector_score, keyword_score) {
                (Some(v), Some(k)) => {
                    (id, opts.alpha * v + (1.0 - opts.alpha) * k, ScoreSource::Hybrid)
                }
                (Some(v), None) => (id, vector_weight * v, ScoreSource::Vector),
                (None, Some(k)) => (id, keyword_weight * k, ScoreSource::Keyword),
                (None, None) => (id, 0.0, ScoreSource::Keyword),
            })
            .filter(|(_, score, _)| *score >= opts.min_score)
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(opts.limit);

        if scored.is_empty() && !query_text.trim().is_empty() {
            return self.substring_fallback(query_text, opts.limit);
        }

        self.enrich_scored(scored)
    }

    /// Last-resort substring scan for databases with neither index.
    fn substring_fallback(&self, query_text: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let pattern = format!("%{}%", crate::storage::escape_like(query_text.trim()));
        let ids = self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM memories
                 WHERE is_deleted = 0 AND content LIKE ?1 ESCAPE '\\'
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![pattern, limit as i64],
                |row| row.get::<_, String>(0),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        let scored = ids
            .into_iter()
            .map(|id| (id, SUBSTRING_FALLBACK_SCORE, ScoreSource::Keyword))
            .collect();
        self.enrich_scored(scored)
    }

    fn enrich_scored(
        &self,
        scored: Vec<(String, f64, ScoreSource)>,
    ) -> Result<Vec<SearchResult>> {
        let ids: Vec<String> = scored.iter().map(|(id, _, _)| id.clone()).collect();
        let by_id: HashMap<String, (f64, ScoreSource)> = scored
            .into_iter()
            .map(|(id, score, source)| (id, (score, source)))
            .collect();

        let memories = self.store.enrich(&ids)?;
        Ok(memories
            .into_iter()
            .filter_map(|memory| {
                by_id.get(&memory.id).map(|(score, source)| SearchResult {
                    score: *score,
                    source: *source,
                    memory,
                })
            })
            .collect())
    }

    /// Id allow-list for a restrictive filter, `None` when the filter
    /// matches everything live.
    fn allowed_ids(&self, filter: &MemoryFilter) -> Result<Option<HashSet<String>>> {
        let restrictive = filter.memory_type.is_some()
            || filter.category.is_some()
            || !filter.tags.is_empty()
            || filter.who.is_some()
            || filter.pinned.is_some()
            || filter.importance_min.is_some()
            || filter.created_since.is_some();
        if !restrictive {
            return Ok(None);
        }
        let rows = self.store.list(filter)?;
        Ok(Some(rows.into_iter().map(|m| m.id).collect()))
    }

    fn vector_candidates(
        &self,
        query: &[f32],
        allowed: &Option<HashSet<String>>,
        top_k: usize,
    ) -> Result<Vec<(String, f64)>> {
        let index = self.vector.lock().map_err(|_| SearchError::LockPoisoned)?;
        let k = if allowed.is_some() {
            top_k * FILTER_OVERSAMPLE
        } else {
            top_k
        };
        let mut hits = index.search(query, k)?;
        if let Some(allowed) = allowed {
            hits.retain(|(id, _)| allowed.contains(id));
        }
        hits.truncate(top_k);
        Ok(hits)
    }
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("indexed_vectors", &self.indexed_vectors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChangeContext, MemoryInput, MemoryType};
    use crate::storage::Store;
    use tempfile::TempDir;

    const DIMS: usize = 4;

    fn engine() -> (Arc<Store>, SearchEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path().join("memories.db")).unwrap());
        let engine = SearchEngine::new(store.clone(), DIMS).unwrap();
        (store, engine, dir)
    }

    fn insert(
        store: &Store,
        engine: &SearchEngine,
        content: &str,
        vector: Option<Vec<f32>>,
        tags: Vec<String>,
    ) -> String {
        let input = MemoryInput {
            content: content.to_string(),
            tags,
            importance: Some(0.8),
            embedding: vector.clone(),
            ..Default::default()
        };
        let outcome = store
            .insert_memory(&input, &ChangeContext::default(), None)
            .unwrap();
        if let Some(v) = vector {
            engine.index_memory(&outcome.id, &v).unwrap();
        }
        outcome.id
    }

    #[test]
    fn vector_only_recall() {
        let (store, engine, _dir) = engine();
        let id = insert(
            &store,
            &engine,
            "API runs on port 3000",
            Some(vec![1.0, 0.0, 0.0, 0.0]),
            vec![],
        );

        let hits = engine
            .hybrid(
                "",
                Some(&[1.0, 0.0, 0.0, 0.0]),
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, id);
        assert!(hits[0].score > 0.5);
        assert_eq!(hits[0].source, ScoreSource::Vector);
    }

    #[test]
    fn hybrid_marks_dual_source_hits() {
        let (store, engine, _dir) = engine();
        let id = insert(
            &store,
            &engine,
            "API runs on port 3000",
            Some(vec![1.0, 0.0, 0.0, 0.0]),
            vec![],
        );

        let hits = engine
            .hybrid(
                "port",
                Some(&[1.0, 0.0, 0.0, 0.0]),
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits[0].memory.id, id);
        assert_eq!(hits[0].source, ScoreSource::Hybrid);
        assert!(hits[0].score > 0.5);
    }

    #[test]
    fn alpha_flip_inverts_ranking() {
        let (store, engine, _dir) = engine();
        // Vector aligns with one memory, text matches a different one.
        let vector_id = insert(
            &store,
            &engine,
            "alpha beta gamma",
            Some(vec![1.0, 0.0, 0.0, 0.0]),
            vec![],
        );
        let keyword_id = insert(&store, &engine, "delta epsilon zeta", None, vec![]);

        let query = [1.0f32, 0.0, 0.0, 0.0];

        let vector_heavy = engine
            .hybrid(
                "delta",
                Some(&query),
                &MemoryFilter::default(),
                &SearchOptions {
                    alpha: 0.7,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(vector_heavy[0].memory.id, vector_id);

        let keyword_heavy = engine
            .hybrid(
                "delta",
                Some(&query),
                &MemoryFilter::default(),
                &SearchOptions {
                    alpha: 0.3,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(keyword_heavy[0].memory.id, keyword_id);
    }

    #[test]
    fn filters_restrict_both_sources() {
        let (store, engine, _dir) = engine();
        insert(
            &store,
            &engine,
            "tagged networking fact",
            Some(vec![1.0, 0.0, 0.0, 0.0]),
            vec!["net".to_string()],
        );
        insert(
            &store,
            &engine,
            "untagged networking fact",
            Some(vec![0.9, 0.1, 0.0, 0.0]),
            vec![],
        );

        let filter = MemoryFilter {
            tags: vec!["net".to_string()],
            ..Default::default()
        };
        let hits = engine
            .hybrid(
                "networking",
                Some(&[1.0, 0.0, 0.0, 0.0]),
                &filter,
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.content, "tagged networking fact");
    }

    #[test]
    fn deleted_rows_never_surface() {
        let (store, engine, _dir) = engine();
        let id = insert(
            &store,
            &engine,
            "soon deleted",
            Some(vec![1.0, 0.0, 0.0, 0.0]),
            vec![],
        );
        store
            .soft_delete(&id, "cleanup", &ChangeContext::default())
            .unwrap();
        engine.remove_memory(&id).unwrap();

        let hits = engine
            .hybrid(
                "deleted",
                Some(&[1.0, 0.0, 0.0, 0.0]),
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn keyword_only_when_no_vector() {
        let (store, engine, _dir) = engine();
        insert(&store, &engine, "searchable by words alone", None, vec![]);

        let hits = engine
            .hybrid(
                "searchable",
                None,
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, ScoreSource::Keyword);
    }

    #[test]
    fn substring_fallback_when_fts_missing() {
        let (store, engine, _dir) = engine();
        insert(&store, &engine, "fallback findable row", None, vec![]);

        // Simulate a bootstrap database without a keyword index.
        store
            .read(|conn| {
                conn.execute_batch(
                    "DROP TRIGGER memories_fts_ai;
                     DROP TRIGGER memories_fts_ad;
                     DROP TRIGGER memories_fts_au_remove;
                     DROP TRIGGER memories_fts_au_add;
                     DROP TABLE memories_fts;",
                )
            })
            .unwrap();

        let hits = engine
            .hybrid(
                "findable",
                None,
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, SUBSTRING_FALLBACK_SCORE);
    }

    #[test]
    fn min_score_drops_weak_hits() {
        let (store, engine, _dir) = engine();
        insert(
            &store,
            &engine,
            "orthogonal memory",
            Some(vec![0.0, 1.0, 0.0, 0.0]),
            vec![],
        );

        let hits = engine
            .hybrid(
                "",
                Some(&[1.0, 0.0, 0.0, 0.0]),
                &MemoryFilter::default(),
                &SearchOptions {
                    min_score: 0.5,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn load_from_store_warms_index() {
        let (store, engine, _dir) = engine();
        insert(
            &store,
            &engine,
            "persisted vector",
            Some(vec![0.0, 0.0, 1.0, 0.0]),
            vec![],
        );

        // Fresh engine over the same store starts cold, then warms.
        let fresh = SearchEngine::new(store.clone(), DIMS).unwrap();
        assert_eq!(fresh.indexed_vectors(), 0);
        assert_eq!(fresh.load_from_store().unwrap(), 1);
        let hits = fresh
            .hybrid(
                "",
                Some(&[0.0, 0.0, 1.0, 0.0]),
                &MemoryFilter::default(),
                &SearchOptions::default(),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
