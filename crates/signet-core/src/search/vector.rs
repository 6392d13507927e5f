//! Vector index
//!
//! HNSW index (USearch) over memory embeddings, cosine metric. Keys are
//! memory ids; the index owns a bidirectional id map so removals and
//! re-adds keep working across soft-delete/recover cycles.

use std::collections::HashMap;

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Default embedding dimensionality.
pub const DEFAULT_DIMENSIONS: usize = 768;

/// HNSW connectivity parameter (higher = better recall, more memory).
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building.
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search.
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// Initial capacity reserved at construction.
const INITIAL_CAPACITY: usize = 1024;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector index error types.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorIndexError {
    /// Failed to create the index.
    #[error("index creation failed: {0}")]
    Creation(String),
    /// Failed to add a vector.
    #[error("failed to add vector: {0}")]
    Add(String),
    /// Failed to search.
    #[error("search failed: {0}")]
    Search(String),
    /// Vector has the wrong dimensionality.
    #[error("invalid dimensions: expected {expected}, got {got}")]
    InvalidDimensions {
        /// Configured dimensionality.
        expected: usize,
        /// Supplied dimensionality.
        got: usize,
    },
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index.
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions.
    pub dimensions: usize,
    /// HNSW connectivity parameter.
    pub connectivity: usize,
    /// Expansion factor for adding vectors.
    pub expansion_add: usize,
    /// Expansion factor for searching.
    pub expansion_search: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_DIMENSIONS,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// Cosine-metric HNSW index keyed by memory id.
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    key_to_id: HashMap<String, u64>,
    id_to_key: HashMap<u64, String>,
    next_id: u64,
}

impl VectorIndex {
    /// Index with default configuration (768 dimensions).
    pub fn new() -> Result<Self, VectorIndexError> {
        Self::with_config(VectorIndexConfig::default())
    }

    /// Index for a specific dimensionality.
    pub fn with_dimensions(dimensions: usize) -> Result<Self, VectorIndexError> {
        Self::with_config(VectorIndexConfig {
            dimensions,
            ..Default::default()
        })
    }

    /// Index with explicit configuration.
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorIndexError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| VectorIndexError::Creation(e.to_string()))?;
        index
            .reserve(INITIAL_CAPACITY)
            .map_err(|e| VectorIndexError::Creation(e.to_string()))?;
        Ok(Self {
            index,
            config,
            key_to_id: HashMap::new(),
            id_to_key: HashMap::new(),
            next_id: 0,
        })
    }

    /// Configured dimensionality.
    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.key_to_id.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.key_to_id.is_empty()
    }

    /// Add or replace the vector for a key.
    pub fn add(&mut self, key: &str, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions {
                expected: self.config.dimensions,
                got: vector.len(),
            });
        }

        // Replace semantics: drop an existing vector for the key first.
        if let Some(existing) = self.key_to_id.get(key).copied() {
            let _ = self.index.remove(existing);
            self.id_to_key.remove(&existing);
            self.key_to_id.remove(key);
        }

        if self.index.size() + 1 > self.index.capacity() {
            self.index
                .reserve(self.index.capacity() * 2)
                .map_err(|e| VectorIndexError::Add(e.to_string()))?;
        }

        let id = self.next_id;
        self.index
            .add(id, vector)
            .map_err(|e| VectorIndexError::Add(e.to_string()))?;
        self.next_id += 1;
        self.key_to_id.insert(key.to_string(), id);
        self.id_to_key.insert(id, key.to_string());
        Ok(())
    }

    /// Remove a key's vector. Unknown keys are a no-op.
    pub fn remove(&mut self, key: &str) {
        if let Some(id) = self.key_to_id.remove(key) {
            let _ = self.index.remove(id);
            self.id_to_key.remove(&id);
        }
    }

    /// K-nearest search; returns `(key, cosine_similarity)` best-first with
    /// similarity clamped into [0, 1].
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f64)>, VectorIndexError> {
        if query.len() != self.config.dimensions {
            return Err(VectorIndexError::InvalidDimensions {
                expected: self.config.dimensions,
                got: query.len(),
            });
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let matches = self
            .index
            .search(query, k)
            .map_err(|e| VectorIndexError::Search(e.to_string()))?;

        let mut results = Vec::with_capacity(matches.keys.len());
        for (id, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            if let Some(key) = self.id_to_key.get(id) {
                // Cos metric reports distance = 1 - similarity.
                let similarity = (1.0 - *distance as f64).clamp(0.0, 1.0);
                results.push((key.clone(), similarity));
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimensions", &self.config.dimensions)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dim: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn nearest_neighbor_is_exact_match() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        index.add("a", &unit(4, 0)).unwrap();
        index.add("b", &unit(4, 1)).unwrap();

        let hits = index.search(&unit(4, 0), 2).unwrap();
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1 > 0.99);
        assert!(hits[1].1 < 0.1);
    }

    #[test]
    fn remove_then_search_skips_key() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        index.add("a", &unit(4, 0)).unwrap();
        index.add("b", &unit(4, 1)).unwrap();
        index.remove("a");

        let hits = index.search(&unit(4, 0), 2).unwrap();
        assert!(hits.iter().all(|(k, _)| k != "a"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn re_add_replaces_vector() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        index.add("a", &unit(4, 0)).unwrap();
        index.add("a", &unit(4, 2)).unwrap();
        assert_eq!(index.len(), 1);

        let hits = index.search(&unit(4, 2), 1).unwrap();
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = VectorIndex::with_dimensions(4).unwrap();
        assert!(matches!(
            index.add("a", &[1.0, 0.0]),
            Err(VectorIndexError::InvalidDimensions { expected: 4, got: 2 })
        ));
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = VectorIndex::with_dimensions(4).unwrap();
        assert!(index.search(&unit(4, 0), 5).unwrap().is_empty());
    }
}
