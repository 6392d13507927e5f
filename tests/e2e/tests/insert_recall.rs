//! Insert/recall journeys: dedup, soft-delete, and hybrid recall against a
//! full node.

use signet_core::memory::{ChangeContext, HistoryEvent, MemoryFilter, MemoryType};
use signet_core::{ScoreSource, SearchOptions};
use signet_e2e::{unit_vector, MemorySpec, TestNode};

#[test]
fn insert_then_recall_hybrid() {
    let node = TestNode::new(1, "recall-node");
    let id = node.insert(MemorySpec {
        content: "API runs on port 3000",
        importance: 0.8,
        vector: Some(unit_vector(0)),
        ..Default::default()
    });

    let hits = node
        .search
        .hybrid(
            "port",
            Some(&unit_vector(0)),
            &MemoryFilter::default(),
            &SearchOptions::default(),
        )
        .expect("hybrid search");

    assert_eq!(hits[0].memory.id, id);
    assert!(hits[0].score > 0.5, "score {}", hits[0].score);
    assert!(matches!(
        hits[0].source,
        ScoreSource::Hybrid | ScoreSource::Vector
    ));
}

#[test]
fn duplicate_insert_returns_first_id() {
    let node = TestNode::new(2, "dedup-node");
    let first = node.insert(MemorySpec {
        content: "API runs on port 3000",
        ..Default::default()
    });

    // Same content modulo whitespace/case: one row, one created event.
    let input = signet_core::MemoryInput {
        content: "  api RUNS on port 3000 ".to_string(),
        ..Default::default()
    };
    let second = node
        .store
        .insert_memory(&input, &ChangeContext::default(), None)
        .unwrap();
    assert!(second.duplicate);
    assert_eq!(second.id, first);

    let history = node.store.history_of(&first).unwrap();
    let created: Vec<_> = history
        .iter()
        .filter(|entry| entry.event == HistoryEvent::Created)
        .collect();
    assert_eq!(created.len(), 1);

    let all = node
        .store
        .list(&MemoryFilter {
            include_deleted: true,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[test]
fn soft_delete_hides_from_search_but_not_get() {
    let node = TestNode::new(3, "delete-node");
    let id = node.insert(MemorySpec {
        content: "mistaken fact",
        vector: Some(unit_vector(1)),
        ..Default::default()
    });

    node.store
        .soft_delete(&id, "wrong", &ChangeContext::default())
        .unwrap();
    node.search.remove_memory(&id).unwrap();

    let row = node.store.get(&id).unwrap().unwrap();
    assert!(row.is_deleted);
    assert!(row.deleted_at.is_some());

    let hits = node
        .search
        .hybrid(
            "mistaken",
            Some(&unit_vector(1)),
            &MemoryFilter::default(),
            &SearchOptions::default(),
        )
        .unwrap();
    assert!(hits.is_empty());

    let events: Vec<_> = node
        .store
        .history_of(&id)
        .unwrap()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert_eq!(events, vec![HistoryEvent::Created, HistoryEvent::Deleted]);
}

#[test]
fn rehearsal_keeps_memories_strong() {
    let node = TestNode::new(4, "rehearse-node");
    let id = node.insert(MemorySpec {
        content: "rehearsed knowledge",
        importance: 0.6,
        ..Default::default()
    });

    let strength = node.store.record_rehearsal(&id).unwrap();
    assert!(strength >= 0.99);

    let memory = node.store.get(&id).unwrap().unwrap();
    assert_eq!(memory.rehearsal_count, 1);
    assert_eq!(memory.access_count, 1);
}

#[test]
fn signed_memories_carry_verifiable_provenance() {
    let node = TestNode::new(5, "signed-node");
    let id = node.insert(MemorySpec {
        content: "a signed statement",
        sign: true,
        ..Default::default()
    });

    let memory = node.store.get(&id).unwrap().unwrap();
    assert_eq!(memory.signer_did.as_deref(), Some(node.did()));
    signet_core::verify_with_did(
        node.did(),
        memory.content.as_bytes(),
        memory.signature.as_deref().unwrap(),
    )
    .expect("stored signature verifies");
}

#[test]
fn filters_narrow_recall() {
    let node = TestNode::new(6, "filter-node");
    node.insert(MemorySpec {
        content: "deploy checklist item",
        memory_type: MemoryType::Procedural,
        tags: vec!["ops"],
        importance: 0.9,
        vector: Some(unit_vector(2)),
        ..Default::default()
    });
    node.insert(MemorySpec {
        content: "deploy gossip",
        memory_type: MemoryType::DailyLog,
        importance: 0.2,
        vector: Some(unit_vector(2)),
        ..Default::default()
    });

    let filter = MemoryFilter {
        memory_type: Some(MemoryType::Procedural),
        importance_min: Some(0.5),
        ..Default::default()
    };
    let hits = node
        .search
        .hybrid(
            "deploy",
            Some(&unit_vector(2)),
            &filter,
            &SearchOptions::default(),
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.memory_type, MemoryType::Procedural);
}
