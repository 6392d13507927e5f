//! Selective publish policy
//!
//! Decides which memories may leave the boundary to which peers. Rules are
//! declarative filters stored next to the peers; selection excludes deleted
//! rows and anything already shared with the target, so a select/record
//! cycle is idempotent.

use std::collections::HashSet;

use crate::memory::{Memory, Peer, PublishRule, TrustLevel};
use crate::storage::{Result, Store, StoreError};

/// Evaluates publish rules against the store.
pub struct PublishPolicy;

impl PublishPolicy {
    /// Whether a rule applies to a peer: `peer_ids` of `None` means all
    /// trusted peers, otherwise the peer must be listed.
    pub fn rule_applies(rule: &PublishRule, peer: &Peer) -> bool {
        match &rule.peer_ids {
            None => true,
            Some(ids) => ids.iter().any(|id| id == &peer.id),
        }
    }

    /// Union of rule matches for a peer, in `created_at` order.
    ///
    /// Returns empty for peers that are not trusted; selection never widens
    /// trust. Rows already in `shared_memories` for this peer are excluded,
    /// so two successive calls with no intervening state change return
    /// disjoint sets (the second is empty modulo new content).
    pub fn select_publishable(store: &Store, peer_id: &str) -> Result<Vec<Memory>> {
        let peer = store
            .peer_by_id(peer_id)?
            .ok_or_else(|| StoreError::NotFound(peer_id.to_string()))?;
        if peer.trust_level != TrustLevel::Trusted {
            return Ok(Vec::new());
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut selected: Vec<Memory> = Vec::new();
        for rule in store.list_publish_rules()? {
            if !Self::rule_applies(&rule, &peer) {
                continue;
            }
            for memory in store.rule_matches(&rule, peer_id)? {
                if seen.insert(memory.id.clone()) {
                    selected.push(memory);
                }
            }
        }

        selected.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(selected)
    }

    /// Peers with at least one applicable `auto_publish` rule, for the
    /// publish heartbeat.
    pub fn auto_publish_targets(store: &Store) -> Result<Vec<Peer>> {
        let auto_rules: Vec<PublishRule> = store
            .list_publish_rules()?
            .into_iter()
            .filter(|rule| rule.auto_publish)
            .collect();
        if auto_rules.is_empty() {
            return Ok(Vec::new());
        }

        Ok(store
            .list_peers()?
            .into_iter()
            .filter(|peer| peer.trust_level == TrustLevel::Trusted)
            .filter(|peer| auto_rules.iter().any(|rule| Self::rule_applies(rule, peer)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ChangeContext, MemoryInput, MemoryType};
    use crate::storage::Store;
    use tempfile::TempDir;

    fn setup() -> (Store, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("memories.db")).unwrap();
        (store, dir)
    }

    fn insert_tagged(store: &Store, content: &str, tags: &[&str], importance: f64) -> String {
        store
            .insert_memory(
                &MemoryInput {
                    content: content.to_string(),
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    importance: Some(importance),
                    ..Default::default()
                },
                &ChangeContext::default(),
                None,
            )
            .unwrap()
            .id
    }

    fn trusted_peer(store: &Store, did: &str) -> String {
        let peer = store.upsert_peer(did, None, None, None, None).unwrap();
        store
            .set_peer_trust(&peer.id, TrustLevel::Trusted)
            .unwrap();
        peer.id
    }

    #[test]
    fn untrusted_peers_get_nothing() {
        let (store, _dir) = setup();
        let peer = store
            .upsert_peer("did:key:zPending", None, None, None, None)
            .unwrap();
        insert_tagged(&store, "a shareable fact", &["shareable"], 0.9);
        store
            .create_publish_rule("all", None, &[], &[], 0.0, None, false)
            .unwrap();

        assert!(PublishPolicy::select_publishable(&store, &peer.id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn rules_filter_by_tags_types_and_importance() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zTrusted");
        insert_tagged(&store, "high importance net fact", &["net"], 0.9);
        insert_tagged(&store, "low importance net fact", &["net"], 0.1);
        insert_tagged(&store, "untagged fact", &[], 0.9);

        store
            .create_publish_rule(
                "net-only",
                None,
                &["net".to_string()],
                &[MemoryType::Fact],
                0.5,
                None,
                false,
            )
            .unwrap();

        let selected = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].content, "high importance net fact");
    }

    #[test]
    fn query_substring_filters_content() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zQ");
        insert_tagged(&store, "the port is 3000", &[], 0.9);
        insert_tagged(&store, "unrelated note", &[], 0.9);

        store
            .create_publish_rule("ports", Some("port"), &[], &[], 0.0, None, false)
            .unwrap();

        let selected = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert_eq!(selected.len(), 1);
        assert!(selected[0].content.contains("port"));
    }

    #[test]
    fn peer_scoped_rules_skip_other_peers() {
        let (store, _dir) = setup();
        let peer_a = trusted_peer(&store, "did:key:zA");
        let peer_b = trusted_peer(&store, "did:key:zB");
        insert_tagged(&store, "for peer a only", &[], 0.9);

        store
            .create_publish_rule(
                "a-only",
                None,
                &[],
                &[],
                0.0,
                Some(&[peer_a.clone()]),
                false,
            )
            .unwrap();

        assert_eq!(
            PublishPolicy::select_publishable(&store, &peer_a)
                .unwrap()
                .len(),
            1
        );
        assert!(PublishPolicy::select_publishable(&store, &peer_b)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn select_then_record_is_idempotent() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zIdem");
        insert_tagged(&store, "publish once", &["shareable"], 0.9);
        store
            .create_publish_rule("share", None, &["shareable".to_string()], &[], 0.0, None, true)
            .unwrap();

        let first = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert_eq!(first.len(), 1);

        let ids: Vec<String> = first.iter().map(|m| m.id.clone()).collect();
        store.record_shared(&peer_id, &ids).unwrap();

        let second = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert!(second.is_empty());

        // New content becomes selectable again.
        insert_tagged(&store, "publish later", &["shareable"], 0.9);
        let third = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].content, "publish later");
    }

    #[test]
    fn deleted_memories_never_publish() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zDel");
        let memory_id = insert_tagged(&store, "retracted", &["shareable"], 0.9);
        store
            .create_publish_rule("share", None, &["shareable".to_string()], &[], 0.0, None, false)
            .unwrap();
        store
            .soft_delete(&memory_id, "retract", &ChangeContext::default())
            .unwrap();

        assert!(PublishPolicy::select_publishable(&store, &peer_id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn union_across_rules_dedupes() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zUnion");
        insert_tagged(&store, "matches both rules", &["a", "b"], 0.9);
        store
            .create_publish_rule("rule-a", None, &["a".to_string()], &[], 0.0, None, false)
            .unwrap();
        store
            .create_publish_rule("rule-b", None, &["b".to_string()], &[], 0.0, None, false)
            .unwrap();

        let selected = PublishPolicy::select_publishable(&store, &peer_id).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn auto_publish_targets_need_auto_rules() {
        let (store, _dir) = setup();
        let peer_id = trusted_peer(&store, "did:key:zAuto");
        store
            .create_publish_rule("manual", None, &[], &[], 0.0, None, false)
            .unwrap();
        assert!(PublishPolicy::auto_publish_targets(&store).unwrap().is_empty());

        store
            .create_publish_rule("auto", None, &[], &[], 0.0, None, true)
            .unwrap();
        let targets = PublishPolicy::auto_publish_targets(&store).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, peer_id);
    }
}
