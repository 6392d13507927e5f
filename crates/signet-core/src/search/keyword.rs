//! Keyword search
//!
//! BM25 over the FTS5 index, with query sanitization and the same filter
//! conditions the rest of the store uses. FTS being unavailable is treated
//! as "no keyword hits", never as an error.

use rusqlite::params_from_iter;

use crate::memory::MemoryFilter;
use crate::storage::{Result, Store};

/// Sanitize free text into an FTS5 query.
///
/// Each token is stripped of FTS syntax characters and double-quoted, then
/// tokens are joined with OR so any matching term produces a hit. Returns
/// `None` when nothing queryable remains.
pub fn sanitize_fts_query(raw: &str) -> Option<String> {
    let tokens: Vec<String> = raw
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect();

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

/// Run BM25 keyword search. Returns `(memory_id, raw_bm25)` best-first;
/// FTS5's bm25 is lower-is-better (negative for matches).
pub(crate) fn keyword_candidates(
    store: &Store,
    query_text: &str,
    filter: &MemoryFilter,
    top_k: usize,
) -> Result<Vec<(String, f64)>> {
    let Some(fts_query) = sanitize_fts_query(query_text) else {
        return Ok(Vec::new());
    };

    let mut conditions = vec!["m.is_deleted = 0".to_string()];
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(memory_type) = filter.memory_type {
        conditions.push("m.type = ?".to_string());
        params.push(Box::new(memory_type.as_str().to_string()));
    }
    if let Some(category) = &filter.category {
        conditions.push("m.category = ?".to_string());
        params.push(Box::new(category.clone()));
    }
    for tag in &filter.tags {
        conditions.push("(',' || m.tags || ',') LIKE ? ESCAPE '\\'".to_string());
        params.push(Box::new(format!(
            "%,{},%",
            crate::storage::escape_like(tag)
        )));
    }
    if let Some(who) = &filter.who {
        conditions.push("m.who = ?".to_string());
        params.push(Box::new(who.clone()));
    }
    if let Some(pinned) = filter.pinned {
        conditions.push("m.pinned = ?".to_string());
        params.push(Box::new(pinned as i64));
    }
    if let Some(min) = filter.importance_min {
        conditions.push("m.importance >= ?".to_string());
        params.push(Box::new(min));
    }
    if let Some(since) = filter.created_since {
        conditions.push("m.created_at > ?".to_string());
        params.push(Box::new(since));
    }

    let sql = format!(
        "SELECT m.id, bm25(memories_fts) AS rank
         FROM memories_fts
         JOIN memories m ON m.id = memories_fts.id
         WHERE memories_fts MATCH ? AND {}
         ORDER BY rank ASC
         LIMIT ?",
        conditions.join(" AND ")
    );

    let mut all_params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(fts_query)];
    all_params.extend(params);
    all_params.push(Box::new(top_k as i64));

    let result = store.read(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params_from_iter(all_params.iter().map(|p| p.as_ref())),
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    });

    match result {
        Ok(hits) => Ok(hits),
        Err(e) => {
            // Degradation, not failure: a missing or corrupt FTS table means
            // hybrid search continues on vectors alone.
            tracing::warn!("keyword search unavailable: {e}");
            Ok(Vec::new())
        }
    }
}

/// Normalize a raw BM25 rank into (0, 1]: `1 / (1 + |raw|)`.
pub(crate) fn normalize_bm25(raw: f64) -> f64 {
    1.0 / (1.0 + raw.abs())
}
