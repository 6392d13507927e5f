//! Memory data model
//!
//! The row types shared by the store, search, publish, and federation
//! layers. The store owns persistence; everything here is plain data.

mod graph;
mod peer;
mod record;

pub use graph::{
    Contradiction, ContradictionResolution, Decision, Entity, EntityMention, Relation, ResolvedBy,
};
pub use peer::{Peer, PublishRule, ReceivedMemory, SharedMemory, TrustLevel};
pub use record::{
    ChangeContext, EmbeddingRecord, HistoryEntry, HistoryEvent, InsertOutcome, Memory,
    MemoryFilter, MemoryInput, MemoryPatch, MemoryType, MerkleRootRecord,
};
