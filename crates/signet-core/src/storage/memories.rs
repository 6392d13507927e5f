//! Memory row operations
//!
//! Insert/update/soft-delete with history, access and rehearsal counters,
//! embedding rows and pending-embedding jobs, and the Merkle snapshot rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::query::{filter_conditions, SelectBuilder};
use super::{join_tags, split_tags, Result, Store, StoreError};
use crate::hash::{content_hash, normalize_content};
use crate::identity::Signer;
use crate::memory::{
    ChangeContext, EmbeddingRecord, HistoryEntry, HistoryEvent, InsertOutcome, Memory,
    MemoryFilter, MemoryInput, MemoryPatch, MemoryType, MerkleRootRecord,
};
use crate::temporal::{strength, StrengthInputs};

/// Column list shared by every memory SELECT.
pub(crate) const MEMORY_COLUMNS: &str = "id, content_hash, content, normalized_content, type, category, \
     tags, source_type, source_id, who, signature, signer_did, confidence, importance, pinned, \
     created_at, updated_at, last_accessed, last_rehearsed, rehearsal_count, access_count, \
     strength, is_deleted, deleted_at";

pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let tags: String = row.get(6)?;
    let memory_type: String = row.get(4)?;
    Ok(Memory {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        content: row.get(2)?,
        normalized_content: row.get(3)?,
        memory_type: MemoryType::parse_name(&memory_type),
        category: row.get(5)?,
        tags: split_tags(&tags),
        source_type: row.get(7)?,
        source_id: row.get(8)?,
        who: row.get(9)?,
        signature: row.get(10)?,
        signer_did: row.get(11)?,
        confidence: row.get(12)?,
        importance: row.get(13)?,
        pinned: row.get::<_, i64>(14)? != 0,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
        last_accessed: row.get(17)?,
        last_rehearsed: row.get(18)?,
        rehearsal_count: row.get(19)?,
        access_count: row.get(20)?,
        strength: row.get(21)?,
        is_deleted: row.get::<_, i64>(22)? != 0,
        deleted_at: row.get(23)?,
    })
}

fn append_history(
    conn: &Connection,
    memory_id: &str,
    event: HistoryEvent,
    old_content: Option<&str>,
    new_content: Option<&str>,
    ctx: &ChangeContext,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO memory_history
            (memory_id, event, old_content, new_content, changed_by, reason,
             session_id, request_id, actor_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            memory_id,
            event.as_str(),
            old_content,
            new_content,
            ctx.changed_by,
            ctx.reason,
            ctx.session_id,
            ctx.request_id,
            ctx.actor_type,
            now,
        ],
    )?;
    Ok(())
}

impl Store {
    // ========================================================================
    // WRITE API
    // ========================================================================

    /// Insert a new memory.
    ///
    /// Content is hashed over its normalized form; if a live row already
    /// holds the same hash the existing id comes back with
    /// `duplicate = true` and nothing is written. A supplied embedding is
    /// stored immediately; otherwise a pending-embeddings job row is queued
    /// for the external embedder.
    pub fn insert_memory(
        &self,
        input: &MemoryInput,
        ctx: &ChangeContext,
        signer: Option<&Signer>,
    ) -> Result<InsertOutcome> {
        if input.content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }

        let normalized = normalize_content(&input.content);
        let hash = content_hash(&input.content);
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let (signature, signer_did) = match (input.sign, signer) {
            (true, Some(signer)) => (
                Some(signer.sign(input.content.as_bytes())),
                Some(signer.did().to_string()),
            ),
            _ => (None, None),
        };

        self.write_tx(|tx| {
            // Dedup against live rows only.
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM memories WHERE content_hash = ?1 AND is_deleted = 0",
                    [&hash],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing_id) = existing {
                return Ok(InsertOutcome {
                    id: existing_id,
                    duplicate: true,
                });
            }

            tx.execute(
                "INSERT INTO memories (
                    id, content_hash, content, normalized_content, type, category, tags,
                    source_type, source_id, who, signature, signer_did,
                    confidence, importance, pinned,
                    created_at, updated_at, rehearsal_count, access_count, strength,
                    is_deleted
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    ?8, ?9, ?10, ?11, ?12,
                    ?13, ?14, ?15,
                    ?16, ?17, 0, 0, ?18,
                    0
                )",
                params![
                    id,
                    hash,
                    input.content,
                    normalized,
                    input.memory_type.as_str(),
                    input.category,
                    join_tags(&input.tags),
                    input.source_type,
                    input.source_id,
                    input.who,
                    signature,
                    signer_did,
                    input.confidence.unwrap_or(1.0),
                    input.importance.unwrap_or(0.5),
                    input.pinned as i64,
                    now,
                    now,
                    1.0f64,
                ],
            )?;

            append_history(
                tx,
                &id,
                HistoryEvent::Created,
                None,
                Some(&input.content),
                ctx,
                now,
            )?;

            match &input.embedding {
                Some(vector) => {
                    upsert_embedding_row(tx, &hash, vector, Some("memory"), Some(&id), now)?;
                }
                None => {
                    tx.execute(
                        "INSERT OR IGNORE INTO pending_embeddings (memory_id, content, queued_at)
                         VALUES (?1, ?2, ?3)",
                        params![id, input.content, now],
                    )?;
                }
            }

            Ok(InsertOutcome {
                id: id.clone(),
                duplicate: false,
            })
        })
    }

    /// Apply a patch to an existing memory.
    ///
    /// The previous row is copied to history as `updated`. A content change
    /// recomputes the hash and, when the row was signed and a signer is
    /// available, re-signs the new content.
    pub fn update_memory(
        &self,
        id: &str,
        patch: &MemoryPatch,
        ctx: &ChangeContext,
        signer: Option<&Signer>,
    ) -> Result<Memory> {
        let existing = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let now = Utc::now();

        let new_content = patch.content.clone().unwrap_or_else(|| existing.content.clone());
        if new_content.trim().is_empty() {
            return Err(StoreError::EmptyContent);
        }
        let content_changed = new_content != existing.content;
        let (hash, normalized) = if content_changed {
            (content_hash(&new_content), normalize_content(&new_content))
        } else {
            (
                existing.content_hash.clone(),
                existing
                    .normalized_content
                    .clone()
                    .unwrap_or_else(|| normalize_content(&existing.content)),
            )
        };

        let (signature, signer_did) = if content_changed && existing.signature.is_some() {
            match signer {
                Some(signer) => (
                    Some(signer.sign(new_content.as_bytes())),
                    Some(signer.did().to_string()),
                ),
                // Content changed but we cannot re-sign: drop the stale
                // signature rather than keep one that no longer verifies.
                None => (None, None),
            }
        } else {
            (existing.signature.clone(), existing.signer_did.clone())
        };

        let memory_type = patch.memory_type.unwrap_or(existing.memory_type);
        let category = patch
            .category
            .clone()
            .unwrap_or_else(|| existing.category.clone());
        let tags = patch.tags.clone().unwrap_or_else(|| existing.tags.clone());
        let confidence = patch.confidence.unwrap_or(existing.confidence);
        let importance = patch.importance.unwrap_or(existing.importance);
        let pinned = patch.pinned.unwrap_or(existing.pinned);

        self.write_tx(|tx| {
            append_history(
                tx,
                id,
                HistoryEvent::Updated,
                Some(&existing.content),
                Some(&new_content),
                ctx,
                now,
            )?;
            tx.execute(
                "UPDATE memories SET
                    content = ?1, normalized_content = ?2, content_hash = ?3,
                    type = ?4, category = ?5, tags = ?6,
                    confidence = ?7, importance = ?8, pinned = ?9,
                    signature = ?10, signer_did = ?11,
                    updated_at = ?12
                 WHERE id = ?13",
                params![
                    new_content,
                    normalized,
                    hash,
                    memory_type.as_str(),
                    category,
                    join_tags(&tags),
                    confidence,
                    importance,
                    pinned as i64,
                    signature,
                    signer_did,
                    now,
                    id,
                ],
            )?;
            Ok(())
        })?;

        self.get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Soft-delete a memory: the row stays, but drops out of search,
    /// publish, and Merkle commitments.
    pub fn soft_delete(&self, id: &str, reason: &str, ctx: &ChangeContext) -> Result<()> {
        let existing = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if existing.is_deleted {
            return Ok(());
        }
        let now = Utc::now();
        let ctx = ChangeContext {
            reason: Some(reason.to_string()),
            ..ctx.clone()
        };

        self.write_tx(|tx| {
            tx.execute(
                "UPDATE memories SET is_deleted = 1, deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            append_history(
                tx,
                id,
                HistoryEvent::Deleted,
                Some(&existing.content),
                None,
                &ctx,
                now,
            )?;
            Ok(())
        })
    }

    /// Invert a soft-delete. Fails with a constraint error if another live
    /// row now holds the same content hash.
    pub fn recover(&self, id: &str, ctx: &ChangeContext) -> Result<()> {
        let existing = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if !existing.is_deleted {
            return Ok(());
        }
        let now = Utc::now();

        self.write_tx(|tx| {
            // The partial unique index does not cover deleted rows, so probe
            // for a live twin before flipping the flag back.
            let clash: Option<String> = tx
                .query_row(
                    "SELECT id FROM memories
                     WHERE content_hash = ?1 AND is_deleted = 0 AND id != ?2",
                    params![existing.content_hash, id],
                    |row| row.get(0),
                )
                .optional()?;
            if clash.is_some() {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE),
                    Some("live row with same content hash exists".to_string()),
                ));
            }

            tx.execute(
                "UPDATE memories SET is_deleted = 0, deleted_at = NULL, updated_at = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;
            append_history(
                tx,
                id,
                HistoryEvent::Recovered,
                None,
                Some(&existing.content),
                ctx,
                now,
            )?;
            Ok(())
        })
    }

    /// Bump the access counter and `last_accessed`.
    pub fn record_access(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1
                 WHERE id = ?2",
                params![now, id],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Record an explicit rehearsal: bumps both counters and recomputes the
    /// row's strength in place.
    pub fn record_rehearsal(&self, id: &str) -> Result<f64> {
        let now = Utc::now();
        self.write_tx(|tx| {
            tx.execute(
                "UPDATE memories SET
                    access_count = access_count + 1,
                    last_accessed = ?1,
                    rehearsal_count = rehearsal_count + 1,
                    last_rehearsed = ?1
                 WHERE id = ?2",
                params![now, id],
            )?;

            let memory = tx
                .query_row(
                    &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                    [id],
                    memory_from_row,
                )
                .optional()?
                .ok_or(rusqlite::Error::QueryReturnedNoRows)?;

            let new_strength = strength(&StrengthInputs::from(&memory), now);
            tx.execute(
                "UPDATE memories SET strength = ?1 WHERE id = ?2",
                params![new_strength, id],
            )?;
            Ok(new_strength)
        })
        .map_err(|e| match e {
            StoreError::Database(rusqlite::Error::QueryReturnedNoRows) => {
                StoreError::NotFound(id.to_string())
            }
            other => other,
        })
    }

    // ========================================================================
    // READ API
    // ========================================================================

    /// Fetch a memory by id, deleted or not.
    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                [id],
                memory_from_row,
            )
            .optional()
        })
    }

    /// Fetch a live memory by content hash.
    pub fn get_by_hash(&self, hash: &str) -> Result<Option<Memory>> {
        self.read(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories
                     WHERE content_hash = ?1 AND is_deleted = 0"
                ),
                [hash],
                memory_from_row,
            )
            .optional()
        })
    }

    /// List memories matching a filter, newest first.
    pub fn list(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let mut builder = SelectBuilder::new();
        filter_conditions(filter, &mut builder);
        let suffix = match filter.limit {
            Some(limit) => format!("ORDER BY created_at DESC LIMIT {limit}"),
            None => "ORDER BY created_at DESC".to_string(),
        };
        let sql = builder.build(
            &format!("SELECT {MEMORY_COLUMNS} FROM memories"),
            &suffix,
        );
        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(builder.params()), memory_from_row)?;
            rows.collect()
        })
    }

    /// Fetch rows for a list of ids, preserving the input order. Unknown
    /// ids are skipped.
    pub fn enrich(&self, ids: &[String]) -> Result<Vec<Memory>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE id IN ({placeholders})"
        );
        let fetched = self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(ids.iter()), memory_from_row)?;
            rows.collect::<rusqlite::Result<Vec<Memory>>>()
        })?;

        let mut by_id: std::collections::HashMap<String, Memory> = fetched
            .into_iter()
            .map(|m| (m.id.clone(), m))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    /// Full audit history for a memory, oldest first.
    pub fn history_of(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, memory_id, event, old_content, new_content, changed_by, reason,
                        session_id, request_id, actor_type, created_at
                 FROM memory_history WHERE memory_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([id], |row| {
                let event: String = row.get(2)?;
                Ok(HistoryEntry {
                    id: row.get(0)?,
                    memory_id: row.get(1)?,
                    event: HistoryEvent::parse_name(&event),
                    old_content: row.get(3)?,
                    new_content: row.get(4)?,
                    changed_by: row.get(5)?,
                    reason: row.get(6)?,
                    session_id: row.get(7)?,
                    request_id: row.get(8)?,
                    actor_type: row.get(9)?,
                    created_at: row.get(10)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Import a full memory row, preserving ids, hashes, and timestamps.
    ///
    /// Used by bundle import. Returns true when a row was written. With
    /// `overwrite` the row replaces an existing one with the same id;
    /// otherwise rows whose id or live content hash already exist are
    /// skipped.
    pub fn import_memory_row(&self, memory: &Memory, overwrite: bool) -> Result<bool> {
        self.write_tx(|tx| {
            let id_exists: Option<String> = tx
                .query_row("SELECT id FROM memories WHERE id = ?1", [&memory.id], |r| {
                    r.get(0)
                })
                .optional()?;
            if id_exists.is_some() && !overwrite {
                return Ok(false);
            }
            if id_exists.is_none() && !memory.is_deleted {
                let hash_clash: Option<String> = tx
                    .query_row(
                        "SELECT id FROM memories WHERE content_hash = ?1 AND is_deleted = 0",
                        [&memory.content_hash],
                        |r| r.get(0),
                    )
                    .optional()?;
                if hash_clash.is_some() {
                    return Ok(false);
                }
            }
            if id_exists.is_some() {
                tx.execute("DELETE FROM memories WHERE id = ?1", [&memory.id])?;
            }

            tx.execute(
                "INSERT INTO memories (
                    id, content_hash, content, normalized_content, type, category, tags,
                    source_type, source_id, who, signature, signer_did,
                    confidence, importance, pinned,
                    created_at, updated_at, last_accessed, last_rehearsed,
                    rehearsal_count, access_count, strength, is_deleted, deleted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                          ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                params![
                    memory.id,
                    memory.content_hash,
                    memory.content,
                    memory.normalized_content,
                    memory.memory_type.as_str(),
                    memory.category,
                    join_tags(&memory.tags),
                    memory.source_type,
                    memory.source_id,
                    memory.who,
                    memory.signature,
                    memory.signer_did,
                    memory.confidence,
                    memory.importance,
                    memory.pinned as i64,
                    memory.created_at,
                    memory.updated_at,
                    memory.last_accessed,
                    memory.last_rehearsed,
                    memory.rehearsal_count,
                    memory.access_count,
                    memory.strength,
                    memory.is_deleted as i64,
                    memory.deleted_at,
                ],
            )?;
            Ok(true)
        })
    }

    // ========================================================================
    // EMBEDDINGS
    // ========================================================================

    /// Store (or replace) the vector for a content hash.
    pub fn store_embedding(
        &self,
        hash: &str,
        vector: &[f32],
        source_type: Option<&str>,
        source_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        self.write(|conn| upsert_embedding_row(conn, hash, vector, source_type, source_id, now))
    }

    /// Fetch the vector for a content hash.
    pub fn embedding_for_hash(&self, hash: &str) -> Result<Option<EmbeddingRecord>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, content_hash, dimensions, vector, source_type, source_id, created_at
                 FROM embeddings WHERE content_hash = ?1",
                [hash],
                embedding_from_row,
            )
            .optional()
        })
    }

    /// All stored embeddings joined with their live memory ids, for index
    /// warm-up at startup.
    pub fn live_embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, e.vector, e.dimensions
                 FROM memories m JOIN embeddings e ON e.content_hash = m.content_hash
                 WHERE m.is_deleted = 0",
            )?;
            let rows = stmt.query_map([], |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                let dimensions: i64 = row.get(2)?;
                Ok((id, vector_from_blob(&blob, dimensions as usize)))
            })?;
            rows.collect()
        })
    }

    /// Drop embedding rows whose content hash no longer has a live memory.
    pub fn gc_orphan_embeddings(&self) -> Result<usize> {
        self.write(|conn| {
            conn.execute(
                "DELETE FROM embeddings WHERE content_hash NOT IN
                    (SELECT content_hash FROM memories WHERE is_deleted = 0)",
                [],
            )
        })
    }

    /// Pending embedding jobs, oldest first.
    pub fn pending_embeddings(&self, limit: usize) -> Result<Vec<(String, String)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT memory_id, content FROM pending_embeddings
                 ORDER BY queued_at ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
    }

    /// Complete a pending embedding job: store the vector and drop the job.
    pub fn complete_pending_embedding(&self, memory_id: &str, vector: &[f32]) -> Result<()> {
        let memory = self
            .get(memory_id)?
            .ok_or_else(|| StoreError::NotFound(memory_id.to_string()))?;
        let now = Utc::now();
        self.write_tx(|tx| {
            upsert_embedding_row(
                tx,
                &memory.content_hash,
                vector,
                Some("memory"),
                Some(memory_id),
                now,
            )?;
            tx.execute(
                "DELETE FROM pending_embeddings WHERE memory_id = ?1",
                [memory_id],
            )?;
            Ok(())
        })
    }

    // ========================================================================
    // STRENGTH BATCHES (used by the temporal scorer)
    // ========================================================================

    /// One page of non-pinned live rows for strength recomputation.
    pub(crate) fn strength_batch(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(String, f64, StrengthInputs)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, strength, pinned, importance, rehearsal_count,
                        created_at, last_accessed, last_rehearsed
                 FROM memories WHERE is_deleted = 0 AND pinned = 0
                 ORDER BY id ASC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    StrengthInputs {
                        pinned: row.get::<_, i64>(2)? != 0,
                        importance: row.get(3)?,
                        rehearsal_count: row.get(4)?,
                        created_at: row.get(5)?,
                        last_accessed: row.get(6)?,
                        last_rehearsed: row.get(7)?,
                    },
                ))
            })?;
            rows.collect()
        })
    }

    /// Write a batch of recomputed strengths.
    pub(crate) fn write_strengths(&self, changes: &[(String, f64)]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.write_tx(|tx| {
            for (id, value) in changes {
                tx.execute(
                    "UPDATE memories SET strength = ?1 WHERE id = ?2",
                    params![value, id],
                )?;
            }
            Ok(())
        })
    }

    // ========================================================================
    // MERKLE SNAPSHOTS
    // ========================================================================

    /// Content hashes of all live memories, ascending — the canonical leaf
    /// order for the Merkle commitment.
    pub fn live_content_hashes(&self) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT content_hash FROM memories WHERE is_deleted = 0
                 ORDER BY content_hash ASC",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Persist a computed Merkle root row.
    pub fn insert_merkle_root(&self, record: &MerkleRootRecord) -> Result<()> {
        let leaf_hashes = record
            .leaf_hashes
            .as_ref()
            .map(|hashes| serde_json::to_string(hashes).unwrap_or_else(|_| "[]".to_string()));
        self.write(|conn| {
            conn.execute(
                "INSERT INTO merkle_roots
                    (id, root_hash, memory_count, leaf_hashes, computed_at,
                     signature, signer_did, anchor_chain, anchor_tx, anchor_block,
                     anchor_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.root_hash,
                    record.memory_count,
                    leaf_hashes,
                    record.computed_at,
                    record.signature,
                    record.signer_did,
                    record.anchor_chain,
                    record.anchor_tx,
                    record.anchor_block,
                    record.anchor_timestamp,
                ],
            )?;
            Ok(())
        })
    }

    /// Most recently computed Merkle root row.
    pub fn latest_merkle_root(&self) -> Result<Option<MerkleRootRecord>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, root_hash, memory_count, leaf_hashes, computed_at,
                        signature, signer_did, anchor_chain, anchor_tx, anchor_block,
                        anchor_timestamp
                 FROM merkle_roots ORDER BY computed_at DESC LIMIT 1",
                [],
                merkle_root_from_row,
            )
            .optional()
        })
    }

    /// Record an anchor receipt on an existing root row.
    pub fn record_anchor(
        &self,
        root_id: &str,
        chain: &str,
        tx_id: &str,
        block: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE merkle_roots SET anchor_chain = ?1, anchor_tx = ?2,
                        anchor_block = ?3, anchor_timestamp = ?4
                 WHERE id = ?5",
                params![chain, tx_id, block, now, root_id],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(root_id.to_string()));
        }
        Ok(())
    }
}

fn upsert_embedding_row(
    conn: &Connection,
    hash: &str,
    vector: &[f32],
    source_type: Option<&str>,
    source_id: Option<&str>,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let blob = vector_to_blob(vector);
    conn.execute(
        "INSERT INTO embeddings (id, content_hash, dimensions, vector, source_type, source_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (content_hash) DO UPDATE SET
            dimensions = excluded.dimensions,
            vector = excluded.vector",
        params![
            Uuid::new_v4().to_string(),
            hash,
            vector.len() as i64,
            blob,
            source_type,
            source_id,
            now,
        ],
    )?;
    Ok(())
}

fn embedding_from_row(row: &Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    let blob: Vec<u8> = row.get(3)?;
    let dimensions: i64 = row.get(2)?;
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        dimensions: dimensions as usize,
        vector: vector_from_blob(&blob, dimensions as usize),
        source_type: row.get(4)?,
        source_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn merkle_root_from_row(row: &Row<'_>) -> rusqlite::Result<MerkleRootRecord> {
    let leaf_hashes: Option<String> = row.get(3)?;
    Ok(MerkleRootRecord {
        id: row.get(0)?,
        root_hash: row.get(1)?,
        memory_count: row.get(2)?,
        leaf_hashes: leaf_hashes.and_then(|raw| serde_json::from_str(&raw).ok()),
        computed_at: row.get(4)?,
        signature: row.get(5)?,
        signer_did: row.get(6)?,
        anchor_chain: row.get(7)?,
        anchor_tx: row.get(8)?,
        anchor_block: row.get(9)?,
        anchor_timestamp: row.get(10)?,
    })
}

/// Serialize a vector as little-endian f32 bytes.
pub(crate) fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserialize little-endian f32 bytes, truncating to `dimensions`.
pub(crate) fn vector_from_blob(blob: &[u8], dimensions: usize) -> Vec<f32> {
    blob.chunks_exact(4)
        .take(dimensions)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
