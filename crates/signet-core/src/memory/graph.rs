//! Knowledge graph and decision records
//!
//! Entities, typed relations, memory mentions, plus the structured
//! decision/contradiction metadata that wraps memory rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named entity extracted from memory content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Row id.
    pub id: String,
    /// Surface name as observed.
    pub name: String,
    /// Canonicalized (lowercased, trimmed) name used for dedup.
    pub canonical_name: String,
    /// Entity kind (person, project, tool, ...).
    pub entity_type: Option<String>,
    /// How many memories mention this entity.
    pub mentions: i64,
    /// First seen.
    pub created_at: DateTime<Utc>,
}

/// A directed, typed, weighted edge between two entities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Row id.
    pub id: String,
    /// Source entity.
    pub from_entity_id: String,
    /// Target entity.
    pub to_entity_id: String,
    /// Relation kind.
    pub relation_type: String,
    /// Edge weight.
    pub weight: f64,
    /// Confidence in the relation, 0..=1.
    pub confidence: f64,
    /// When the relation was recorded.
    pub created_at: DateTime<Utc>,
}

/// Link between a memory row and an entity it mentions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMention {
    /// The mentioning memory.
    pub memory_id: String,
    /// The mentioned entity.
    pub entity_id: String,
}

/// Structured decision metadata attached to a memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Row id.
    pub id: String,
    /// The memory row this decision annotates.
    pub memory_id: String,
    /// What was decided.
    pub conclusion: String,
    /// Reasoning steps.
    pub reasoning: Vec<String>,
    /// Alternatives that were considered.
    pub alternatives: Vec<String>,
    /// Confidence in the decision, 0..=1.
    pub confidence: f64,
    /// Whether the decision should be revisited later.
    pub revisitable: bool,
    /// Observed outcome, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// When the outcome was observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome_at: Option<DateTime<Utc>>,
    /// When the decision was last reviewed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    /// When the decision was recorded.
    pub created_at: DateTime<Utc>,
}

/// How a contradiction between two memories was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContradictionResolution {
    /// The old memory was updated to match the new one.
    Update,
    /// Both memories were kept.
    KeepBoth,
    /// The new memory was discarded.
    IgnoreNew,
}

impl ContradictionResolution {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContradictionResolution::Update => "update",
            ContradictionResolution::KeepBoth => "keep_both",
            ContradictionResolution::IgnoreNew => "ignore_new",
        }
    }

    /// Parse from the stored string.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "update" => Some(ContradictionResolution::Update),
            "keep_both" => Some(ContradictionResolution::KeepBoth),
            "ignore_new" => Some(ContradictionResolution::IgnoreNew),
            _ => None,
        }
    }
}

/// Who resolved a contradiction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    /// Resolved by the automatic judge.
    Auto,
    /// Resolved by an operator.
    Manual,
}

impl ResolvedBy {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolvedBy::Auto => "auto",
            ResolvedBy::Manual => "manual",
        }
    }
}

/// A recorded contradiction between a new and an old memory.
///
/// `resolution` stays `None` while the contradiction is open; when the
/// external judge is unavailable the row is still written with
/// `reasoning = "detection skipped"` so the write never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    /// Row id.
    pub id: String,
    /// The incoming memory.
    pub new_memory_id: String,
    /// The memory it contradicts.
    pub old_memory_id: String,
    /// Resolution, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ContradictionResolution>,
    /// Judge or operator reasoning.
    pub reasoning: Option<String>,
    /// Who resolved it.
    pub resolved_by: ResolvedBy,
    /// When the contradiction was recorded.
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_roundtrip() {
        for r in [
            ContradictionResolution::Update,
            ContradictionResolution::KeepBoth,
            ContradictionResolution::IgnoreNew,
        ] {
            assert_eq!(ContradictionResolution::parse_name(r.as_str()), Some(r));
        }
        assert_eq!(ContradictionResolution::parse_name("bogus"), None);
    }
}
