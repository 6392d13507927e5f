//! End-to-end test harness
//!
//! Builds complete Signet nodes on temp directories: store + signer +
//! search engine + federation context, with helpers for seeding memories
//! and wiring two nodes together over a real WebSocket listener.

use std::sync::Arc;

use tempfile::TempDir;

use signet_core::config::FederationConfig;
use signet_core::identity::Signer;
use signet_core::memory::{ChangeContext, MemoryInput, MemoryType, TrustLevel};
use signet_core::{SearchEngine, Store};
use signet_daemon::federation::{FederationContext, FederationServer};

/// Vector dimensionality used across the e2e suite (small on purpose).
pub const TEST_DIMENSIONS: usize = 8;

/// A complete node: store, identity, search, federation context.
pub struct TestNode {
    /// The node's store.
    pub store: Arc<Store>,
    /// The node's signing identity.
    pub signer: Arc<Signer>,
    /// The node's search engine.
    pub search: Arc<SearchEngine>,
    /// Federation dependencies, ready for server or client use.
    pub ctx: Arc<FederationContext>,
    _dir: TempDir,
}

impl TestNode {
    /// Node with a deterministic identity derived from `seed`.
    pub fn new(seed: u8, name: &str) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(Store::open(dir.path().join("memories.db")).expect("open store"));
        let signer = Arc::new(Signer::from_bytes(&[seed; 32]));
        let search =
            Arc::new(SearchEngine::new(store.clone(), TEST_DIMENSIONS).expect("search engine"));

        let config = FederationConfig {
            listen: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        let ctx = FederationContext::new(
            store.clone(),
            signer.clone(),
            config,
            Some(name.to_string()),
        );

        Self {
            store,
            signer,
            search,
            ctx,
            _dir: dir,
        }
    }

    /// The node's DID.
    pub fn did(&self) -> &str {
        self.signer.did()
    }

    /// Start this node's federation listener and return it (the bound
    /// address is on the server handle).
    pub async fn serve(&self) -> FederationServer {
        FederationServer::bind(self.ctx.clone())
            .await
            .expect("bind federation server")
    }

    /// Insert a memory; optionally signed and/or vectorized.
    pub fn insert(&self, spec: MemorySpec) -> String {
        let input = MemoryInput {
            content: spec.content.to_string(),
            memory_type: spec.memory_type,
            tags: spec.tags.iter().map(|t| t.to_string()).collect(),
            importance: Some(spec.importance),
            sign: spec.sign,
            embedding: spec.vector.clone(),
            ..Default::default()
        };
        let signer = spec.sign.then(|| self.signer.clone());
        let outcome = self
            .store
            .insert_memory(&input, &ChangeContext::default(), signer.as_deref())
            .expect("insert memory");
        if let Some(vector) = &spec.vector {
            self.search
                .index_memory(&outcome.id, vector)
                .expect("index vector");
        }
        outcome.id
    }

    /// Register `other` as a peer of this node at the given trust level.
    pub fn add_peer(&self, other: &TestNode, trust: TrustLevel) -> String {
        let peer = self
            .store
            .upsert_peer(other.did(), None, None, None, None)
            .expect("upsert peer");
        self.store
            .set_peer_trust(&peer.id, trust)
            .expect("set trust");
        peer.id
    }
}

/// Declarative memory fixture.
pub struct MemorySpec {
    /// Content text.
    pub content: &'static str,
    /// Classification.
    pub memory_type: MemoryType,
    /// Tags.
    pub tags: Vec<&'static str>,
    /// Importance.
    pub importance: f64,
    /// Sign with the node's key.
    pub sign: bool,
    /// Embedding vector.
    pub vector: Option<Vec<f32>>,
}

impl Default for MemorySpec {
    fn default() -> Self {
        Self {
            content: "a fact",
            memory_type: MemoryType::Fact,
            tags: Vec::new(),
            importance: 0.5,
            sign: false,
            vector: None,
        }
    }
}

/// A unit vector along `axis` in the test dimensionality.
pub fn unit_vector(axis: usize) -> Vec<f32> {
    let mut vector = vec![0.0; TEST_DIMENSIONS];
    vector[axis % TEST_DIMENSIONS] = 1.0;
    vector
}
