//! Database migrations
//!
//! Pending migrations apply in strict integer order, each inside its own
//! SAVEPOINT. Success stamps `schema_migrations (version, applied_at,
//! checksum)` and appends a `migration_audit` row with the duration; failure
//! rolls back only that savepoint. Every migration is idempotent
//! (`CREATE ... IF NOT EXISTS` throughout), which makes the stamp repair
//! path safe: a stamped version whose probe column is missing is unstamped
//! and replayed.

use rusqlite::Connection;

use crate::hash::blake2b_256;

/// A schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number, applied in ascending order.
    pub version: u32,
    /// Human description for the audit trail.
    pub description: &'static str,
    /// SQL to apply.
    pub up: &'static str,
    /// Probe used by stamp repair: this column must exist after the
    /// migration ran. `None` skips the probe.
    pub probe: Option<(&'static str, &'static str)>,
}

/// Migration definitions.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Core memory tables, history, embeddings, FTS5",
        up: MIGRATION_V1_UP,
        probe: Some(("memories", "content_hash")),
    },
    Migration {
        version: 2,
        description: "Knowledge graph: entities, relations, mentions",
        up: MIGRATION_V2_UP,
        probe: Some(("entities", "canonical_name")),
    },
    Migration {
        version: 3,
        description: "Decision and contradiction records",
        up: MIGRATION_V3_UP,
        probe: Some(("decisions", "conclusion")),
    },
    Migration {
        version: 4,
        description: "Federation: peers, publish rules, shared/received memories",
        up: MIGRATION_V4_UP,
        probe: Some(("peers", "trust_level")),
    },
    Migration {
        version: 5,
        description: "Merkle root snapshots with anchor fields",
        up: MIGRATION_V5_UP,
        probe: Some(("merkle_roots", "root_hash")),
    },
];

/// V1: memories, history, embeddings, pending jobs, FTS5 + sync triggers
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    content TEXT NOT NULL,
    normalized_content TEXT,
    type TEXT NOT NULL DEFAULT 'fact',
    category TEXT,
    tags TEXT NOT NULL DEFAULT '',

    -- Provenance
    source_type TEXT,
    source_id TEXT,
    who TEXT,
    signature TEXT,
    signer_did TEXT,

    -- Quality
    confidence REAL NOT NULL DEFAULT 1.0,
    importance REAL NOT NULL DEFAULT 0.5,
    pinned INTEGER NOT NULL DEFAULT 0,

    -- Temporal strength model
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    last_accessed TEXT,
    last_rehearsed TEXT,
    rehearsal_count INTEGER NOT NULL DEFAULT 0,
    access_count INTEGER NOT NULL DEFAULT 0,
    strength REAL NOT NULL DEFAULT 1.0,

    -- Lifecycle
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT
);

-- Dedup key: one live row per content hash
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_live_hash
    ON memories(content_hash) WHERE is_deleted = 0;

CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(type);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_importance ON memories(importance);
CREATE INDEX IF NOT EXISTS idx_memories_deleted ON memories(is_deleted);

-- Append-only audit trail
CREATE TABLE IF NOT EXISTS memory_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id TEXT NOT NULL,
    event TEXT NOT NULL,
    old_content TEXT,
    new_content TEXT,
    changed_by TEXT,
    reason TEXT,
    session_id TEXT,
    request_id TEXT,
    actor_type TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_memory ON memory_history(memory_id);
CREATE INDEX IF NOT EXISTS idx_history_created ON memory_history(created_at);

-- One dense vector per content hash
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL UNIQUE,
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL,
    source_type TEXT,
    source_id TEXT,
    created_at TEXT NOT NULL
);

-- Rows waiting for an external embedder
CREATE TABLE IF NOT EXISTS pending_embeddings (
    memory_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    queued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0
);

-- FTS5 keyword index over live rows
CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    id,
    content,
    tags,
    content='memories',
    content_rowid='rowid',
    tokenize='porter ascii'
);

-- Sync triggers. Soft-delete is an UPDATE, so the update triggers are split:
-- the remove half fires when the old row was live, the add half when the new
-- row is live. A soft-deleted row therefore drops out of FTS and a recovered
-- row re-enters it.
CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories
WHEN NEW.is_deleted = 0 BEGIN
    INSERT INTO memories_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories
WHEN OLD.is_deleted = 0 BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au_remove AFTER UPDATE ON memories
WHEN OLD.is_deleted = 0 BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, id, content, tags)
    VALUES ('delete', OLD.rowid, OLD.id, OLD.content, OLD.tags);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au_add AFTER UPDATE ON memories
WHEN NEW.is_deleted = 0 BEGIN
    INSERT INTO memories_fts(rowid, id, content, tags)
    VALUES (NEW.rowid, NEW.id, NEW.content, NEW.tags);
END;
"#;

/// V2: knowledge graph layer
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    canonical_name TEXT NOT NULL UNIQUE,
    entity_type TEXT,
    mentions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(entity_type);

CREATE TABLE IF NOT EXISTS relations (
    id TEXT PRIMARY KEY,
    from_entity_id TEXT NOT NULL,
    to_entity_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    confidence REAL NOT NULL DEFAULT 1.0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (from_entity_id) REFERENCES entities(id) ON DELETE CASCADE,
    FOREIGN KEY (to_entity_id) REFERENCES entities(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_relations_from ON relations(from_entity_id);
CREATE INDEX IF NOT EXISTS idx_relations_to ON relations(to_entity_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_relations_edge
    ON relations(from_entity_id, to_entity_id, relation_type);

CREATE TABLE IF NOT EXISTS memory_entity_mentions (
    memory_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    PRIMARY KEY (memory_id, entity_id),
    FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
    FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_mentions_entity ON memory_entity_mentions(entity_id);
"#;

/// V3: structured decision and contradiction metadata
const MIGRATION_V3_UP: &str = r#"
CREATE TABLE IF NOT EXISTS decisions (
    id TEXT PRIMARY KEY,
    memory_id TEXT NOT NULL,
    conclusion TEXT NOT NULL,
    reasoning TEXT NOT NULL DEFAULT '[]',
    alternatives TEXT NOT NULL DEFAULT '[]',
    confidence REAL NOT NULL DEFAULT 1.0,
    revisitable INTEGER NOT NULL DEFAULT 0,
    outcome TEXT,
    outcome_at TEXT,
    reviewed_at TEXT,
    created_at TEXT NOT NULL,
    FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_decisions_memory ON decisions(memory_id);

CREATE TABLE IF NOT EXISTS contradictions (
    id TEXT PRIMARY KEY,
    new_memory_id TEXT NOT NULL,
    old_memory_id TEXT NOT NULL,
    resolution TEXT,
    reasoning TEXT,
    resolved_by TEXT NOT NULL DEFAULT 'auto',
    created_at TEXT NOT NULL,
    FOREIGN KEY (new_memory_id) REFERENCES memories(id) ON DELETE CASCADE,
    FOREIGN KEY (old_memory_id) REFERENCES memories(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_contradictions_new ON contradictions(new_memory_id);
CREATE INDEX IF NOT EXISTS idx_contradictions_old ON contradictions(old_memory_id);
"#;

/// V4: federation layer
const MIGRATION_V4_UP: &str = r#"
CREATE TABLE IF NOT EXISTS peers (
    id TEXT PRIMARY KEY,
    did TEXT NOT NULL UNIQUE,
    display_name TEXT,
    url TEXT,
    public_key TEXT,
    trust_level TEXT NOT NULL DEFAULT 'pending',
    chain_address TEXT,
    memories_shared INTEGER NOT NULL DEFAULT 0,
    memories_received INTEGER NOT NULL DEFAULT 0,
    last_sync TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS publish_rules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    query TEXT,
    tags TEXT NOT NULL DEFAULT '',
    types TEXT NOT NULL DEFAULT '',
    min_importance REAL NOT NULL DEFAULT 0.0,
    peer_ids TEXT,
    auto_publish INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS shared_memories (
    memory_id TEXT NOT NULL,
    peer_id TEXT NOT NULL,
    shared_at TEXT NOT NULL,
    PRIMARY KEY (memory_id, peer_id),
    FOREIGN KEY (memory_id) REFERENCES memories(id) ON DELETE CASCADE,
    FOREIGN KEY (peer_id) REFERENCES peers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_shared_peer ON shared_memories(peer_id);

CREATE TABLE IF NOT EXISTS received_memories (
    id TEXT PRIMARY KEY,
    peer_id TEXT NOT NULL,
    original_content TEXT NOT NULL,
    type TEXT,
    signature TEXT,
    signer_did TEXT,
    verified INTEGER NOT NULL DEFAULT 0,
    received_at TEXT NOT NULL,
    promoted_memory_id TEXT,
    UNIQUE (peer_id, original_content),
    FOREIGN KEY (peer_id) REFERENCES peers(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_received_peer ON received_memories(peer_id);
"#;

/// V5: merkle snapshots
const MIGRATION_V5_UP: &str = r#"
CREATE TABLE IF NOT EXISTS merkle_roots (
    id TEXT PRIMARY KEY,
    root_hash TEXT NOT NULL,
    memory_count INTEGER NOT NULL,
    leaf_hashes TEXT,
    computed_at TEXT NOT NULL,
    signature TEXT,
    signer_did TEXT,
    anchor_chain TEXT,
    anchor_tx TEXT,
    anchor_block TEXT,
    anchor_timestamp TEXT
);

CREATE INDEX IF NOT EXISTS idx_merkle_computed ON merkle_roots(computed_at);
"#;

/// Bootstrap tables the runner itself needs.
const RUNNER_BOOTSTRAP: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL,
    checksum TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    description TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    applied_at TEXT NOT NULL
);
"#;

/// Checksum of a migration's SQL text, stored with the stamp.
fn migration_checksum(up: &str) -> String {
    hex::encode(blake2b_256(up.as_bytes()))
}

/// Highest stamped version, 0 when none.
pub fn current_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Detect and remove bogus stamps: a version marked applied whose probe
/// column is missing gets unstamped so the migration replays.
fn repair_stamps(conn: &Connection) -> rusqlite::Result<u32> {
    let stamped = current_version(conn)?;
    let mut repaired = 0;
    for migration in MIGRATIONS {
        if migration.version > stamped {
            continue;
        }
        if let Some((table, column)) = migration.probe {
            if !column_exists(conn, table, column)? {
                tracing::warn!(
                    version = migration.version,
                    table,
                    column,
                    "migration stamped but column missing; forcing replay"
                );
                conn.execute(
                    "DELETE FROM schema_migrations WHERE version >= ?1",
                    [migration.version],
                )?;
                repaired += 1;
            }
        }
    }
    Ok(repaired)
}

/// Apply all pending migrations. Returns how many were applied.
pub fn apply_migrations(conn: &Connection) -> Result<u32, rusqlite::Error> {
    conn.execute_batch(RUNNER_BOOTSTRAP)?;
    repair_stamps(conn)?;

    let from_version = current_version(conn)?;
    let mut applied = 0;

    for migration in MIGRATIONS {
        if migration.version <= from_version {
            continue;
        }
        tracing::info!(
            version = migration.version,
            "applying migration: {}",
            migration.description
        );

        let savepoint = format!("migration_{}", migration.version);
        conn.execute_batch(&format!("SAVEPOINT {savepoint}"))?;
        let started = std::time::Instant::now();

        let result = conn.execute_batch(migration.up).and_then(|_| {
            let now = chrono::Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    now,
                    migration_checksum(migration.up)
                ],
            )?;
            conn.execute(
                "INSERT INTO migration_audit (version, description, duration_ms, applied_at)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    started.elapsed().as_millis() as i64,
                    now
                ],
            )?;
            Ok(())
        });

        match result {
            Ok(()) => {
                conn.execute_batch(&format!("RELEASE {savepoint}"))?;
                applied += 1;
            }
            Err(e) => {
                // Roll back this migration only; earlier ones stay applied.
                conn.execute_batch(&format!("ROLLBACK TO {savepoint}; RELEASE {savepoint}"))?;
                return Err(e);
            }
        }
    }

    Ok(applied)
}
