//! Knowledge graph and decision/contradiction persistence

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{Result, Store, StoreError};
use crate::memory::{
    Contradiction, ContradictionResolution, Decision, Entity, EntityMention, Relation, ResolvedBy,
};

/// Reasoning recorded when the external judge was unavailable.
pub const DETECTION_SKIPPED: &str = "detection skipped";

fn canonicalize(name: &str) -> String {
    name.trim().to_lowercase()
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        name: row.get(1)?,
        canonical_name: row.get(2)?,
        entity_type: row.get(3)?,
        mentions: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        id: row.get(0)?,
        from_entity_id: row.get(1)?,
        to_entity_id: row.get(2)?,
        relation_type: row.get(3)?,
        weight: row.get(4)?,
        confidence: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn decision_from_row(row: &Row<'_>) -> rusqlite::Result<Decision> {
    let reasoning: String = row.get(3)?;
    let alternatives: String = row.get(4)?;
    Ok(Decision {
        id: row.get(0)?,
        memory_id: row.get(1)?,
        conclusion: row.get(2)?,
        reasoning: serde_json::from_str(&reasoning).unwrap_or_default(),
        alternatives: serde_json::from_str(&alternatives).unwrap_or_default(),
        confidence: row.get(5)?,
        revisitable: row.get::<_, i64>(6)? != 0,
        outcome: row.get(7)?,
        outcome_at: row.get(8)?,
        reviewed_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

fn contradiction_from_row(row: &Row<'_>) -> rusqlite::Result<Contradiction> {
    let resolution: Option<String> = row.get(3)?;
    let resolved_by: String = row.get(5)?;
    Ok(Contradiction {
        id: row.get(0)?,
        new_memory_id: row.get(1)?,
        old_memory_id: row.get(2)?,
        resolution: resolution.as_deref().and_then(ContradictionResolution::parse_name),
        reasoning: row.get(4)?,
        resolved_by: if resolved_by == "manual" {
            ResolvedBy::Manual
        } else {
            ResolvedBy::Auto
        },
        created_at: row.get(6)?,
    })
}

impl Store {
    // ========================================================================
    // ENTITIES & RELATIONS
    // ========================================================================

    /// Insert an entity or return the existing row for its canonical name.
    pub fn upsert_entity(&self, name: &str, entity_type: Option<&str>) -> Result<Entity> {
        let canonical = canonicalize(name);
        if canonical.is_empty() {
            return Err(StoreError::InvalidInput("entity name is empty".to_string()));
        }
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.write(|conn| {
            conn.execute(
                "INSERT INTO entities (id, name, canonical_name, entity_type, mentions, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)
                 ON CONFLICT (canonical_name) DO UPDATE SET
                    entity_type = COALESCE(excluded.entity_type, entities.entity_type)",
                params![id, name, canonical, entity_type, now],
            )?;
            conn.query_row(
                "SELECT id, name, canonical_name, entity_type, mentions, created_at
                 FROM entities WHERE canonical_name = ?1",
                [&canonical],
                entity_from_row,
            )
        })
    }

    /// Look up an entity by name (canonicalized).
    pub fn entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        let canonical = canonicalize(name);
        self.read(|conn| {
            conn.query_row(
                "SELECT id, name, canonical_name, entity_type, mentions, created_at
                 FROM entities WHERE canonical_name = ?1",
                [&canonical],
                entity_from_row,
            )
            .optional()
        })
    }

    /// Link a memory to an entity it mentions; bumps the entity's mention
    /// counter on first link only.
    pub fn link_mention(&self, memory_id: &str, entity_id: &str) -> Result<EntityMention> {
        self.write_tx(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO memory_entity_mentions (memory_id, entity_id)
                 VALUES (?1, ?2)",
                params![memory_id, entity_id],
            )?;
            if inserted > 0 {
                tx.execute(
                    "UPDATE entities SET mentions = mentions + 1 WHERE id = ?1",
                    [entity_id],
                )?;
            }
            Ok(EntityMention {
                memory_id: memory_id.to_string(),
                entity_id: entity_id.to_string(),
            })
        })
    }

    /// Memory ids mentioning an entity.
    pub fn memories_mentioning(&self, entity_id: &str) -> Result<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT memory_id FROM memory_entity_mentions WHERE entity_id = ?1",
            )?;
            let rows = stmt.query_map([entity_id], |row| row.get(0))?;
            rows.collect()
        })
    }

    /// Insert or refresh a directed relation between two entities.
    pub fn upsert_relation(
        &self,
        from_entity_id: &str,
        to_entity_id: &str,
        relation_type: &str,
        weight: f64,
        confidence: f64,
    ) -> Result<Relation> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.write(|conn| {
            conn.execute(
                "INSERT INTO relations
                    (id, from_entity_id, to_entity_id, relation_type, weight, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (from_entity_id, to_entity_id, relation_type) DO UPDATE SET
                    weight = excluded.weight,
                    confidence = excluded.confidence",
                params![id, from_entity_id, to_entity_id, relation_type, weight, confidence, now],
            )?;
            conn.query_row(
                "SELECT id, from_entity_id, to_entity_id, relation_type, weight, confidence, created_at
                 FROM relations
                 WHERE from_entity_id = ?1 AND to_entity_id = ?2 AND relation_type = ?3",
                params![from_entity_id, to_entity_id, relation_type],
                relation_from_row,
            )
        })
    }

    /// All relations touching an entity, either direction.
    pub fn relations_for(&self, entity_id: &str) -> Result<Vec<Relation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_entity_id, to_entity_id, relation_type, weight, confidence, created_at
                 FROM relations WHERE from_entity_id = ?1 OR to_entity_id = ?1",
            )?;
            let rows = stmt.query_map([entity_id], relation_from_row)?;
            rows.collect()
        })
    }

    /// All entities, for export.
    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, canonical_name, entity_type, mentions, created_at
                 FROM entities ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], entity_from_row)?;
            rows.collect()
        })
    }

    /// All relations, for export.
    pub fn list_relations(&self) -> Result<Vec<Relation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, from_entity_id, to_entity_id, relation_type, weight, confidence, created_at
                 FROM relations ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], relation_from_row)?;
            rows.collect()
        })
    }

    /// All decisions, for export.
    pub fn list_decisions(&self) -> Result<Vec<Decision>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, memory_id, conclusion, reasoning, alternatives, confidence,
                        revisitable, outcome, outcome_at, reviewed_at, created_at
                 FROM decisions ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], decision_from_row)?;
            rows.collect()
        })
    }

    /// Import a full entity row (bundle import); skips existing ids and
    /// canonical names.
    pub fn import_entity_row(&self, entity: &Entity) -> Result<bool> {
        self.write(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO entities
                    (id, name, canonical_name, entity_type, mentions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entity.id,
                    entity.name,
                    entity.canonical_name,
                    entity.entity_type,
                    entity.mentions,
                    entity.created_at,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Import a full relation row (bundle import); skips existing edges.
    pub fn import_relation_row(&self, relation: &Relation) -> Result<bool> {
        self.write(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO relations
                    (id, from_entity_id, to_entity_id, relation_type, weight, confidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    relation.id,
                    relation.from_entity_id,
                    relation.to_entity_id,
                    relation.relation_type,
                    relation.weight,
                    relation.confidence,
                    relation.created_at,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    /// Import a full decision row (bundle import); skips existing ids.
    pub fn import_decision_row(&self, decision: &Decision) -> Result<bool> {
        let reasoning_json =
            serde_json::to_string(&decision.reasoning).unwrap_or_else(|_| "[]".to_string());
        let alternatives_json =
            serde_json::to_string(&decision.alternatives).unwrap_or_else(|_| "[]".to_string());
        self.write(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO decisions
                    (id, memory_id, conclusion, reasoning, alternatives, confidence,
                     revisitable, outcome, outcome_at, reviewed_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    decision.id,
                    decision.memory_id,
                    decision.conclusion,
                    reasoning_json,
                    alternatives_json,
                    decision.confidence,
                    decision.revisitable as i64,
                    decision.outcome,
                    decision.outcome_at,
                    decision.reviewed_at,
                    decision.created_at,
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    // ========================================================================
    // DECISIONS
    // ========================================================================

    /// Record a structured decision attached to a memory row.
    #[allow(clippy::too_many_arguments)]
    pub fn record_decision(
        &self,
        memory_id: &str,
        conclusion: &str,
        reasoning: &[String],
        alternatives: &[String],
        confidence: f64,
        revisitable: bool,
    ) -> Result<Decision> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let reasoning_json =
            serde_json::to_string(reasoning).unwrap_or_else(|_| "[]".to_string());
        let alternatives_json =
            serde_json::to_string(alternatives).unwrap_or_else(|_| "[]".to_string());

        self.write(|conn| {
            conn.execute(
                "INSERT INTO decisions
                    (id, memory_id, conclusion, reasoning, alternatives, confidence,
                     revisitable, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    memory_id,
                    conclusion,
                    reasoning_json,
                    alternatives_json,
                    confidence,
                    revisitable as i64,
                    now,
                ],
            )?;
            conn.query_row(
                "SELECT id, memory_id, conclusion, reasoning, alternatives, confidence,
                        revisitable, outcome, outcome_at, reviewed_at, created_at
                 FROM decisions WHERE id = ?1",
                [&id],
                decision_from_row,
            )
        })
    }

    /// Decisions attached to a memory.
    pub fn decisions_for(&self, memory_id: &str) -> Result<Vec<Decision>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, memory_id, conclusion, reasoning, alternatives, confidence,
                        revisitable, outcome, outcome_at, reviewed_at, created_at
                 FROM decisions WHERE memory_id = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([memory_id], decision_from_row)?;
            rows.collect()
        })
    }

    /// Record the observed outcome of a decision.
    pub fn record_decision_outcome(&self, decision_id: &str, outcome: &str) -> Result<()> {
        let now = Utc::now();
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE decisions SET outcome = ?1, outcome_at = ?2, reviewed_at = ?2
                 WHERE id = ?3",
                params![outcome, now, decision_id],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(decision_id.to_string()));
        }
        Ok(())
    }

    // ========================================================================
    // CONTRADICTIONS
    // ========================================================================

    /// Record a contradiction between two memory rows.
    pub fn record_contradiction(
        &self,
        new_memory_id: &str,
        old_memory_id: &str,
        resolution: Option<ContradictionResolution>,
        reasoning: Option<&str>,
        resolved_by: ResolvedBy,
    ) -> Result<Contradiction> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.write(|conn| {
            conn.execute(
                "INSERT INTO contradictions
                    (id, new_memory_id, old_memory_id, resolution, reasoning, resolved_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id,
                    new_memory_id,
                    old_memory_id,
                    resolution.map(|r| r.as_str()),
                    reasoning,
                    resolved_by.as_str(),
                    now,
                ],
            )?;
            conn.query_row(
                "SELECT id, new_memory_id, old_memory_id, resolution, reasoning, resolved_by, created_at
                 FROM contradictions WHERE id = ?1",
                [&id],
                contradiction_from_row,
            )
        })
    }

    /// Record that contradiction detection was skipped (judge unavailable).
    /// Degradation, not failure: the memory write itself already succeeded.
    pub fn record_contradiction_skipped(
        &self,
        new_memory_id: &str,
        old_memory_id: &str,
    ) -> Result<Contradiction> {
        self.record_contradiction(
            new_memory_id,
            old_memory_id,
            None,
            Some(DETECTION_SKIPPED),
            ResolvedBy::Auto,
        )
    }

    /// Contradictions with no resolution yet.
    pub fn open_contradictions(&self) -> Result<Vec<Contradiction>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, new_memory_id, old_memory_id, resolution, reasoning, resolved_by, created_at
                 FROM contradictions WHERE resolution IS NULL ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], contradiction_from_row)?;
            rows.collect()
        })
    }

    /// Resolve an open contradiction.
    pub fn resolve_contradiction(
        &self,
        contradiction_id: &str,
        resolution: ContradictionResolution,
        reasoning: Option<&str>,
        resolved_by: ResolvedBy,
    ) -> Result<()> {
        let changed = self.write(|conn| {
            conn.execute(
                "UPDATE contradictions SET resolution = ?1, reasoning = COALESCE(?2, reasoning),
                        resolved_by = ?3
                 WHERE id = ?4",
                params![
                    resolution.as_str(),
                    reasoning,
                    resolved_by.as_str(),
                    contradiction_id,
                ],
            )
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(contradiction_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_store;
    use super::*;
    use crate::memory::{ChangeContext, MemoryInput};

    fn seeded_memory(store: &Store, content: &str) -> String {
        store
            .insert_memory(
                &MemoryInput {
                    content: content.to_string(),
                    ..Default::default()
                },
                &ChangeContext::default(),
                None,
            )
            .unwrap()
            .id
    }

    #[test]
    fn entity_upsert_dedupes_on_canonical_name() {
        let (store, _dir) = temp_store();
        let first = store.upsert_entity("Postgres", Some("tool")).unwrap();
        let second = store.upsert_entity("  postgres ", None).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.entity_type.as_deref(), Some("tool"));
    }

    #[test]
    fn mentions_count_once_per_memory() {
        let (store, _dir) = temp_store();
        let memory_id = seeded_memory(&store, "postgres is our database");
        let entity = store.upsert_entity("postgres", None).unwrap();

        store.link_mention(&memory_id, &entity.id).unwrap();
        store.link_mention(&memory_id, &entity.id).unwrap();

        let refreshed = store.entity_by_name("postgres").unwrap().unwrap();
        assert_eq!(refreshed.mentions, 1);
        assert_eq!(store.memories_mentioning(&entity.id).unwrap(), vec![memory_id]);
    }

    #[test]
    fn relation_upsert_refreshes_weight() {
        let (store, _dir) = temp_store();
        let a = store.upsert_entity("alpha", None).unwrap();
        let b = store.upsert_entity("beta", None).unwrap();

        let first = store
            .upsert_relation(&a.id, &b.id, "depends_on", 0.5, 0.9)
            .unwrap();
        let second = store
            .upsert_relation(&a.id, &b.id, "depends_on", 0.8, 0.9)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.weight, 0.8);

        assert_eq!(store.relations_for(&a.id).unwrap().len(), 1);
        assert_eq!(store.relations_for(&b.id).unwrap().len(), 1);
    }

    #[test]
    fn decision_roundtrip_with_outcome() {
        let (store, _dir) = temp_store();
        let memory_id = seeded_memory(&store, "we chose sqlite");
        let decision = store
            .record_decision(
                &memory_id,
                "use sqlite",
                &["local-first".to_string(), "zero ops".to_string()],
                &["postgres".to_string()],
                0.9,
                true,
            )
            .unwrap();
        assert_eq!(decision.reasoning.len(), 2);
        assert!(decision.outcome.is_none());

        store
            .record_decision_outcome(&decision.id, "worked well")
            .unwrap();
        let stored = store.decisions_for(&memory_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].outcome.as_deref(), Some("worked well"));
        assert!(stored[0].outcome_at.is_some());
    }

    #[test]
    fn contradiction_lifecycle() {
        let (store, _dir) = temp_store();
        let old_id = seeded_memory(&store, "port is 3000");
        let new_id = seeded_memory(&store, "port is 4000");

        let skipped = store
            .record_contradiction_skipped(&new_id, &old_id)
            .unwrap();
        assert_eq!(skipped.reasoning.as_deref(), Some(DETECTION_SKIPPED));
        assert!(skipped.resolution.is_none());

        assert_eq!(store.open_contradictions().unwrap().len(), 1);

        store
            .resolve_contradiction(
                &skipped.id,
                ContradictionResolution::Update,
                Some("newer wins"),
                ResolvedBy::Manual,
            )
            .unwrap();
        assert!(store.open_contradictions().unwrap().is_empty());
    }
}
