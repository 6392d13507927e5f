//! Daemon assembly
//!
//! A `Daemon` value owns every long-lived resource: vault, signer, store,
//! search engine, federation server, outbound clients, and the background
//! tasks. Teardown is explicit; there is no global state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;

use signet_core::config::{AgentConfig, Layout};
use signet_core::identity::{DidDocument, KeyVault, Signer};
use signet_core::{provenance, PublishPolicy, SearchEngine, Store, TemporalScorer};

use crate::federation::{
    ClientError, FederationClient, FederationContext, FederationServer, WireMemory,
};

/// Strength recomputation cadence.
const STRENGTH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Merkle snapshot cadence.
const MERKLE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Auto-publish heartbeat cadence.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The assembled daemon.
pub struct Daemon {
    config: AgentConfig,
    vault: KeyVault,
    store: Arc<Store>,
    signer: Arc<Signer>,
    search: Arc<SearchEngine>,
    server: FederationServer,
    background: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bring the daemon up under the given layout root.
    ///
    /// Generates identity on first run (keypair, `did.json`, pinned DID in
    /// `agent.yaml`), opens the store, warms the vector index, binds the
    /// federation listener, and spawns the periodic tasks.
    pub async fn start(layout: Layout) -> anyhow::Result<Self> {
        Self::start_with(layout, None).await
    }

    /// Like [`Daemon::start`], with an in-memory listen address override
    /// (the config file is not touched).
    pub async fn start_with(
        layout: Layout,
        listen_override: Option<String>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(layout.root())
            .with_context(|| format!("creating root {}", layout.root().display()))?;

        let mut config = AgentConfig::load(&layout.agent_yaml()).context("loading agent.yaml")?;
        if let Some(listen) = listen_override {
            config.federation.listen = listen;
        }

        // Identity: load or generate.
        let vault = KeyVault::new(layout.keys_file());
        let signer = if vault.exists() {
            vault.load().context("loading signing key")?
        } else {
            let signer = vault.generate().context("generating signing key")?;
            let document = DidDocument::for_public_key(&signer.public_key_bytes());
            std::fs::write(
                layout.did_json(),
                serde_json::to_string_pretty(&document).context("rendering did.json")?,
            )?;
            config.did = Some(signer.did().to_string());
            config.save(&layout.agent_yaml()).context("pinning did in agent.yaml")?;
            tracing::info!(did = signer.did(), "identity generated");
            signer
        };

        if let Some(pinned) = &config.did {
            if pinned != signer.did() {
                anyhow::bail!(
                    "agent.yaml pins {pinned} but the vault holds {}",
                    signer.did()
                );
            }
        }

        // Store + search.
        let store = Arc::new(
            Store::open(layout.database(&config)).context("opening memory store")?,
        );
        let search = Arc::new(
            SearchEngine::new(store.clone(), config.embedding.dimensions)
                .context("creating search engine")?,
        );
        search.load_from_store().context("warming vector index")?;

        let stats = store.stats()?;
        tracing::info!(
            did = signer.did(),
            live = stats.live_memories,
            peers = stats.peers,
            rules = stats.publish_rules,
            "signet daemon starting"
        );

        // Federation.
        let ctx = FederationContext::new(
            store.clone(),
            signer.clone(),
            config.federation.clone(),
            Some(config.agent.name.clone()),
        );
        let server = FederationServer::bind(ctx.clone())
            .await
            .context("binding federation listener")?;

        // Background tasks.
        let background = vec![
            spawn_strength_task(store.clone()),
            spawn_merkle_task(store.clone(), signer.clone(), config.signing.sign_roots),
            spawn_publish_task(ctx.clone()),
        ];

        Ok(Self {
            config,
            vault,
            store,
            signer,
            search,
            server,
            background,
        })
    }

    /// The store handle.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The search engine.
    pub fn search(&self) -> &Arc<SearchEngine> {
        &self.search
    }

    /// The daemon's signer.
    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    /// The active config.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Address the federation server bound.
    pub fn federation_addr(&self) -> std::net::SocketAddr {
        self.server.local_addr()
    }

    /// Explicit teardown: stop the listener and background tasks, then
    /// drop cached key material.
    pub async fn shutdown(self) {
        for task in &self.background {
            task.abort();
        }
        self.server.shutdown();
        self.vault.clear();
        tracing::info!("signet daemon stopped");
    }
}

fn spawn_strength_task(store: Arc<Store>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STRENGTH_INTERVAL);
        loop {
            ticker.tick().await;
            let store = store.clone();
            let result = tokio::task::spawn_blocking(move || {
                TemporalScorer::default().recompute_all(&store)
            })
            .await;
            match result {
                Ok(Ok(updated)) => {
                    tracing::debug!(updated, "strength recomputation tick");
                }
                Ok(Err(e)) => tracing::warn!("strength recomputation failed: {e}"),
                Err(e) => tracing::warn!("strength task panicked: {e}"),
            }
        }
    })
}

fn spawn_merkle_task(store: Arc<Store>, signer: Arc<Signer>, sign_roots: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MERKLE_INTERVAL);
        loop {
            ticker.tick().await;
            let store = store.clone();
            let signer = signer.clone();
            let result = tokio::task::spawn_blocking(move || {
                let signer_ref = sign_roots.then_some(signer.as_ref());
                provenance::compute_memory_root(&store, signer_ref)
            })
            .await;
            match result {
                Ok(Ok(record)) => {
                    tracing::debug!(root = %record.root_hash, "merkle snapshot tick");
                }
                Ok(Err(e)) => tracing::warn!("merkle snapshot failed: {e}"),
                Err(e) => tracing::warn!("merkle task panicked: {e}"),
            }
        }
    })
}

/// Auto-publish heartbeat: for each trusted peer covered by an
/// `auto_publish` rule and carrying a dial URL, push selected memories and
/// record the ones the peer accepted.
fn spawn_publish_task(ctx: Arc<FederationContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut clients: HashMap<String, FederationClient> = HashMap::new();
        let mut ticker = tokio::time::interval(PUBLISH_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = publish_heartbeat(&ctx, &mut clients).await {
                tracing::warn!("publish heartbeat failed: {e}");
            }
        }
    })
}

async fn publish_heartbeat(
    ctx: &Arc<FederationContext>,
    clients: &mut HashMap<String, FederationClient>,
) -> anyhow::Result<()> {
    let targets = PublishPolicy::auto_publish_targets(&ctx.store)?;
    for peer in targets {
        let Some(url) = peer.url.clone() else {
            continue;
        };
        let selected = PublishPolicy::select_publishable(&ctx.store, &peer.id)?;
        if selected.is_empty() {
            continue;
        }
        tracing::info!(peer = %peer.did, count = selected.len(), "auto-publishing");

        let client = clients
            .entry(peer.id.clone())
            .or_insert_with(|| FederationClient::connect(ctx.clone(), url));

        for memory in selected {
            match client.push_memory(WireMemory::from_memory(&memory)).await {
                Ok(ack) if ack.accepted => {
                    ctx.store.record_shared(&peer.id, &[memory.id.clone()])?;
                }
                Ok(ack) => {
                    // Rejected pushes wait for the next heartbeat; never
                    // hot-retry a peer that said no.
                    tracing::debug!(
                        peer = %peer.did,
                        reason = ack.reason.as_deref().unwrap_or("unspecified"),
                        "push rejected"
                    );
                    break;
                }
                Err(ClientError::Busy) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer.did, "push failed: {e}");
                    break;
                }
            }
        }
    }
    Ok(())
}
