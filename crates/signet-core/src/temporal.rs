//! Temporal strength model
//!
//! Memories decay exponentially from their last touch, earn a bonus for
//! rehearsals, and never fall below an importance-derived floor. Pinned
//! rows are always at full strength.

use chrono::{DateTime, Utc};

use crate::memory::Memory;
use crate::storage::{Result, Store};

/// Exponential decay rate per day.
pub const DECAY_RATE: f64 = 0.03;

/// Weight of the log-rehearsal bonus.
pub const REHEARSAL_WEIGHT: f64 = 0.3;

/// Fraction of importance that forms the strength floor.
pub const IMPORTANCE_FLOOR: f64 = 0.2;

/// Default batch size for full recomputation.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Writes are skipped when the change is below this threshold.
const WRITE_EPSILON: f64 = 0.001;

/// Inputs to the strength function, detached from the full row.
#[derive(Debug, Clone, Copy)]
pub struct StrengthInputs {
    /// Pinned rows short-circuit to 1.0.
    pub pinned: bool,
    /// Importance in [0, 1]; scales the floor.
    pub importance: f64,
    /// Rehearsal counter.
    pub rehearsal_count: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last read access, if any.
    pub last_accessed: Option<DateTime<Utc>>,
    /// Last rehearsal, if any.
    pub last_rehearsed: Option<DateTime<Utc>>,
}

impl From<&Memory> for StrengthInputs {
    fn from(memory: &Memory) -> Self {
        Self {
            pinned: memory.pinned,
            importance: memory.importance,
            rehearsal_count: memory.rehearsal_count,
            created_at: memory.created_at,
            last_accessed: memory.last_accessed,
            last_rehearsed: memory.last_rehearsed,
        }
    }
}

/// Compute a memory's strength at `now`, rounded to 3 decimals.
///
/// `strength = clamp(exp(-0.03·days) + ln(1+rehearsals)·0.3,
///                   importance·0.2, 1.0)`
/// where `days` counts from the most recent of rehearsal, access, and
/// creation.
pub fn strength(inputs: &StrengthInputs, now: DateTime<Utc>) -> f64 {
    if inputs.pinned {
        return 1.0;
    }

    let last_touch = [
        Some(inputs.created_at),
        inputs.last_accessed,
        inputs.last_rehearsed,
    ]
    .into_iter()
    .flatten()
    .max()
    .unwrap_or(inputs.created_at);

    let days = (now - last_touch).num_seconds().max(0) as f64 / 86_400.0;
    let decay = (-DECAY_RATE * days).exp();
    let rehearsal_bonus = (1.0 + inputs.rehearsal_count as f64).ln() * REHEARSAL_WEIGHT;
    let floor = inputs.importance * IMPORTANCE_FLOOR;

    let raw = (decay + rehearsal_bonus).clamp(floor, 1.0);
    (raw * 1000.0).round() / 1000.0
}

/// Periodic strength recomputation over the whole store.
pub struct TemporalScorer {
    batch_size: usize,
}

impl Default for TemporalScorer {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl TemporalScorer {
    /// Scorer with an explicit batch size.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Recompute strength for every non-pinned, non-deleted row, writing
    /// only rows whose strength moved by more than 0.001. Idempotent.
    /// Returns the number of rows updated.
    pub fn recompute_all(&self, store: &Store) -> Result<usize> {
        let now = Utc::now();
        let mut updated = 0;
        let mut offset = 0;

        loop {
            let batch = store.strength_batch(offset, self.batch_size)?;
            if batch.is_empty() {
                break;
            }
            offset += batch.len();

            let mut changes = Vec::new();
            for (id, old_strength, inputs) in &batch {
                let new_strength = strength(inputs, now);
                if (new_strength - old_strength).abs() > WRITE_EPSILON {
                    changes.push((id.clone(), new_strength));
                }
            }
            updated += changes.len();
            store.write_strengths(&changes)?;
        }

        if updated > 0 {
            tracing::info!(updated, "temporal strength recomputation complete");
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn inputs(days_old: i64, rehearsals: i64, importance: f64, pinned: bool) -> StrengthInputs {
        let created = Utc::now() - Duration::days(days_old);
        StrengthInputs {
            pinned,
            importance,
            rehearsal_count: rehearsals,
            created_at: created,
            last_accessed: None,
            last_rehearsed: None,
        }
    }

    #[test]
    fn fresh_memory_is_full_strength() {
        let s = strength(&inputs(0, 0, 0.5, false), Utc::now());
        assert!(s > 0.99, "fresh strength {s}");
    }

    #[test]
    fn pinned_is_always_one() {
        let s = strength(&inputs(10_000, 0, 0.0, true), Utc::now());
        assert_eq!(s, 1.0);
    }

    #[test]
    fn importance_floor_holds() {
        // Ancient memory, no rehearsals: decay ~ 0, floor = 0.8 * 0.2.
        let s = strength(&inputs(10_000, 0, 0.8, false), Utc::now());
        assert_eq!(s, 0.16);
    }

    #[test]
    fn rehearsal_bonus_lifts_strength() {
        let now = Utc::now();
        let without = strength(&inputs(60, 0, 0.0, false), now);
        let with = strength(&inputs(60, 5, 0.0, false), now);
        assert!(with > without);
    }

    #[test]
    fn last_touch_prefers_rehearsal() {
        let now = Utc::now();
        let mut old = inputs(100, 1, 0.0, false);
        old.last_rehearsed = Some(now - Duration::days(1));
        let recent = strength(&old, now);
        let stale = strength(&inputs(100, 1, 0.0, false), now);
        assert!(recent > stale);
    }

    proptest! {
        #[test]
        fn monotone_nonincreasing_in_days(
            days_a in 0i64..2000,
            days_b in 0i64..2000,
            rehearsals in 0i64..50,
            importance in 0.0f64..1.0,
        ) {
            prop_assume!(days_a <= days_b);
            let now = Utc::now();
            let younger = strength(&inputs(days_a, rehearsals, importance, false), now);
            let older = strength(&inputs(days_b, rehearsals, importance, false), now);
            prop_assert!(younger >= older);
        }

        #[test]
        fn always_in_unit_range(
            days in 0i64..5000,
            rehearsals in 0i64..1000,
            importance in 0.0f64..1.0,
            pinned in any::<bool>(),
        ) {
            let s = strength(&inputs(days, rehearsals, importance, pinned), Utc::now());
            prop_assert!((0.0..=1.0).contains(&s));
        }

        #[test]
        fn pinned_dominates_everything(
            days in 0i64..5000,
            rehearsals in 0i64..1000,
            importance in 0.0f64..1.0,
        ) {
            prop_assert_eq!(strength(&inputs(days, rehearsals, importance, true), Utc::now()), 1.0);
        }
    }
}
