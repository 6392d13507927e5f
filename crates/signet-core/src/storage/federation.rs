//! Federation persistence
//!
//! Peers with their trust labels, publish rules, and the shared/received
//! bookkeeping the sync protocol relies on. Received memories are
//! quarantined: nothing here writes into `memories` except the explicit
//! promotion call.

use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use uuid::Uuid;

use super::query::escape_like;
use super::{join_tags, split_tags, Result, Store, StoreError};
use crate::memory::{
    ChangeContext, InsertOutcome, Memory, MemoryInput, MemoryType, Peer, PublishRule,
    ReceivedMemory, TrustLevel,
};

const PEER_COLUMNS: &str = "id, did, display_name, url, public_key, trust_level, chain_address, \
     memories_shared, memories_received, last_sync, created_at";

fn peer_from_row(row: &Row<'_>) -> rusqlite::Result<Peer> {
    let trust: String = row.get(5)?;
    Ok(Peer {
        id: row.get(0)?,
        did: row.get(1)?,
        display_name: row.get(2)?,
        url: row.get(3)?,
        public_key: row.get(4)?,
        trust_level: TrustLevel::parse_name(&trust),
        chain_address: row.get(6)?,
        memories_shared: row.get(7)?,
        memories_received: row.get(8)?,
        last_sync: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<PublishRule> {
    let tags: String = row.get(3)?;
    let types: String = row.get(4)?;
    let peer_ids: Option<String> = row.get(6)?;
    Ok(PublishRule {
        id: row.get(0)?,
        name: row.get(1)?,
        query: row.get(2)?,
        tags: split_tags(&tags),
        types: split_tags(&types)
            .iter()
            .map(|t| MemoryType::parse_name(t))
            .collect(),
        min_importance: row.get(5)?,
        peer_ids: peer_ids.and_then(|raw| serde_json::from_str(&raw).ok()),
        auto_publish: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
    })
}

fn received_from_row(row: &Row<'_>) -> rusqlite::Result<ReceivedMemory> {
    let memory_type: Option<String> = row.get(3)?;
    Ok(ReceivedMemory {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        original_content: row.get(2)?,
        memory_type: memory_type.map(|t| MemoryType::parse_name(&t)),
        signature: row.get(4)?,
        signer_did: row.get(5)?,
        verified: row.get::<_, i64>(6)? != 0,
        received_at: row.get(7)?,
        promoted_memory_id: row.get(8)?,
    })
}

impl Store {
    // ========================================================================
    // PEERS
    // ========================================================================

    /// Insert a peer, or refresh the mutable metadata of an existing one.
    /// Trust is never changed here.
    pub fn upsert_peer(
        &self,
        did: &str,
        display_name: Option<&str>,
        url: Option<&str>,
        public_key: Option<&str>,
        chain_address: Option<&str>,
    ) -> Result<Peer> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.write(|conn| {
            conn.execute(
                "INSERT INTO peers (id, did, display_name, url, public_key, chain_address, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (did) DO UPDATE SET
                    display_name = COALESCE(excluded.display_name, peers.display_name),
                    url = COALESCE(excluded.url, peers.url),
                    public_key = COALESCE(excluded.public_key, peers.public_key),
                    chain_address = COALESCE(excluded.chain_address, peers.chain_address)",
                params![id, did, display_name, url, public_key, chain_address, now],
            )?;
            conn.query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE did = ?1"),
                [did],
                peer_from_row,
            )
        })
    }

    /// Look up a peer by DID.
    pub fn peer_by_did(&self, did: &str) -> Result<Option<Peer>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE did = ?1"),
                [did],
                peer_from_row,
            )
            .optional()
        })
    }

    /// Look up a peer by row id.
    pub fn peer_by_id(&self, id: &str) -> Result<Option<Peer>> {
        self.read(|conn| {
            conn.query_row(
                &format!("SELECT {PEER_COLUMNS} FROM peers WHERE id = ?1"),
                [id],
                peer_from_row,
            )
            .optional()
        })
    }

    /// All peers.
    pub fn list_peers(&self) -> Result<Vec<Peer>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {PEER_COLUMNS} FROM peers ORDER BY created_at"))?;
            let rows = stmt.query_map([], peer_from_row)?;
            rows.collect()
        })
    }

    /// Set a peer's trust level. This is the only way trust changes.
    pub fn set_peer_trust(&self, peer_id: &str, trust: TrustLevel) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE peers SET trust_level = ?1 WHERE id = ?2",
                params![trust.as_str(), peer_id],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(peer_id.to_string()));
        }
        tracing::info!(peer = peer_id, trust = trust.as_str(), "peer trust updated");
        Ok(())
    }

    // ========================================================================
    // PUBLISH RULES
    // ========================================================================

    /// Create a publish rule. Names are unique.
    #[allow(clippy::too_many_arguments)]
    pub fn create_publish_rule(
        &self,
        name: &str,
        query: Option<&str>,
        tags: &[String],
        types: &[MemoryType],
        min_importance: f64,
        peer_ids: Option<&[String]>,
        auto_publish: bool,
    ) -> Result<PublishRule> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let types_joined = types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect::<Vec<_>>();
        let peer_ids_json = peer_ids
            .map(|ids| serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string()));

        self.write(|conn| {
            conn.execute(
                "INSERT INTO publish_rules
                    (id, name, query, tags, types, min_importance, peer_ids, auto_publish, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    name,
                    query,
                    join_tags(tags),
                    types_joined.join(","),
                    min_importance,
                    peer_ids_json,
                    auto_publish as i64,
                    now,
                ],
            )?;
            conn.query_row(
                "SELECT id, name, query, tags, types, min_importance, peer_ids, auto_publish, created_at
                 FROM publish_rules WHERE id = ?1",
                [&id],
                rule_from_row,
            )
        })
    }

    /// All publish rules.
    pub fn list_publish_rules(&self) -> Result<Vec<PublishRule>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, query, tags, types, min_importance, peer_ids, auto_publish, created_at
                 FROM publish_rules ORDER BY created_at",
            )?;
            let rows = stmt.query_map([], rule_from_row)?;
            rows.collect()
        })
    }

    /// Delete a rule by name.
    pub fn delete_publish_rule(&self, name: &str) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute("DELETE FROM publish_rules WHERE name = ?1", [name])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    /// Live memories matching a single rule, excluding rows already shared
    /// with the peer. Ordered by `created_at` ascending.
    pub(crate) fn rule_matches(&self, rule: &PublishRule, peer_id: &str) -> Result<Vec<Memory>> {
        let mut conditions = vec!["is_deleted = 0".to_string(), "importance >= ?".to_string()];
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(rule.min_importance)];

        if let Some(query) = &rule.query {
            conditions.push("content LIKE ? ESCAPE '\\'".to_string());
            params.push(Box::new(format!("%{}%", escape_like(query))));
        }

        // Any-of tag match.
        if !rule.tags.is_empty() {
            let clause = vec!["(',' || tags || ',') LIKE ? ESCAPE '\\'"; rule.tags.len()]
                .join(" OR ");
            conditions.push(format!("({clause})"));
            for tag in &rule.tags {
                params.push(Box::new(format!("%,{},%", escape_like(tag))));
            }
        }

        // Any-of type match.
        if !rule.types.is_empty() {
            let placeholders = vec!["?"; rule.types.len()].join(", ");
            conditions.push(format!("type IN ({placeholders})"));
            for memory_type in &rule.types {
                params.push(Box::new(memory_type.as_str().to_string()));
            }
        }

        conditions
            .push("id NOT IN (SELECT memory_id FROM shared_memories WHERE peer_id = ?)".to_string());
        params.push(Box::new(peer_id.to_string()));

        let sql = format!(
            "SELECT {} FROM memories WHERE {} ORDER BY created_at ASC",
            super::memories::MEMORY_COLUMNS,
            conditions.join(" AND ")
        );

        self.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params_from_iter(params.iter().map(|p| p.as_ref())),
                super::memories::memory_from_row,
            )?;
            rows.collect()
        })
    }

    // ========================================================================
    // SHARED / RECEIVED
    // ========================================================================

    /// Record that a batch of memories was shipped to a peer: inserts
    /// `shared_memories` rows (ON CONFLICT IGNORE), bumps the peer's shared
    /// counter by the number of new rows, and stamps `last_sync`.
    pub fn record_shared(&self, peer_id: &str, memory_ids: &[String]) -> Result<usize> {
        if memory_ids.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        self.write_tx(|tx| {
            let mut inserted = 0;
            for memory_id in memory_ids {
                inserted += tx.execute(
                    "INSERT OR IGNORE INTO shared_memories (memory_id, peer_id, shared_at)
                     VALUES (?1, ?2, ?3)",
                    params![memory_id, peer_id, now],
                )?;
            }
            tx.execute(
                "UPDATE peers SET memories_shared = memories_shared + ?1, last_sync = ?2
                 WHERE id = ?3",
                params![inserted as i64, now, peer_id],
            )?;
            Ok(inserted)
        })
    }

    /// Ids already shared with a peer.
    pub fn shared_memory_ids(&self, peer_id: &str) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT memory_id FROM shared_memories WHERE peer_id = ?1")?;
            let rows = stmt.query_map([peer_id], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Quarantine a memory received from a peer. Deduplicated on
    /// `(peer_id, original_content)`; returns the row and whether it was
    /// newly inserted. The peer's received counter moves only on insert.
    pub fn insert_received(
        &self,
        peer_id: &str,
        original_content: &str,
        memory_type: Option<MemoryType>,
        signature: Option<&str>,
        signer_did: Option<&str>,
        verified: bool,
    ) -> Result<(ReceivedMemory, bool)> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.write_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO received_memories
                    (id, peer_id, original_content, type, signature, signer_did, verified, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    peer_id,
                    original_content,
                    memory_type.map(|t| t.as_str()),
                    signature,
                    signer_did,
                    verified as i64,
                    now,
                ],
            )?;
            if inserted > 0 {
                tx.execute(
                    "UPDATE peers SET memories_received = memories_received + 1 WHERE id = ?1",
                    [peer_id],
                )?;
            }
            let row = tx.query_row(
                "SELECT id, peer_id, original_content, type, signature, signer_did, verified,
                        received_at, promoted_memory_id
                 FROM received_memories WHERE peer_id = ?1 AND original_content = ?2",
                params![peer_id, original_content],
                received_from_row,
            )?;
            Ok((row, inserted > 0))
        })
    }

    /// Received memories for a peer, oldest first.
    pub fn received_for(&self, peer_id: &str) -> Result<Vec<ReceivedMemory>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, peer_id, original_content, type, signature, signer_did, verified,
                        received_at, promoted_memory_id
                 FROM received_memories WHERE peer_id = ?1 ORDER BY received_at ASC",
            )?;
            let rows = stmt.query_map([peer_id], received_from_row)?;
            rows.collect()
        })
    }

    /// Promote a quarantined received memory into the main store.
    ///
    /// This is the explicit operator action; federation never calls it. The
    /// new row carries federation provenance and the original signature so
    /// the chain of custody survives promotion.
    pub fn promote_received(
        &self,
        received_id: &str,
        ctx: &ChangeContext,
    ) -> Result<InsertOutcome> {
        let received = self.read(|conn| {
            conn.query_row(
                "SELECT id, peer_id, original_content, type, signature, signer_did, verified,
                        received_at, promoted_memory_id
                 FROM received_memories WHERE id = ?1",
                [received_id],
                received_from_row,
            )
            .optional()
        })?;
        let received = received.ok_or_else(|| StoreError::NotFound(received_id.to_string()))?;

        if let Some(existing) = received.promoted_memory_id {
            return Ok(InsertOutcome {
                id: existing,
                duplicate: true,
            });
        }

        let input = MemoryInput {
            content: received.original_content.clone(),
            memory_type: received.memory_type.unwrap_or_default(),
            source_type: Some("federation".to_string()),
            source_id: Some(received.peer_id.clone()),
            who: received.signer_did.clone(),
            ..Default::default()
        };
        let outcome = self.insert_memory(&input, ctx, None)?;

        // Carry the original signature onto the promoted row so provenance
        // still verifies against the sender's DID.
        if received.verified {
            self.write(|conn| {
                conn.execute(
                    "UPDATE memories SET signature = ?1, signer_did = ?2 WHERE id = ?3",
                    params![received.signature, received.signer_did, outcome.id],
                )
            })?;
        }

        self.write(|conn| {
            conn.execute(
                "UPDATE received_memories SET promoted_memory_id = ?1 WHERE id = ?2",
                params![outcome.id, received_id],
            )
        })?;
        Ok(outcome)
    }
}
