//! signetd - the Signet memory daemon CLI
//!
//! `signetd run` starts the daemon; the remaining verbs are local admin
//! operations against the same root directory (peer trust, export/import,
//! status). Logging goes to stderr, filtered by `RUST_LOG`.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use signet_core::config::{AgentConfig, Layout};
use signet_core::export::{export_bundle, import_bundle, MergeStrategy};
use signet_core::identity::KeyVault;
use signet_core::memory::TrustLevel;
use signet_core::Store;

use signet_daemon::Daemon;

#[derive(Parser)]
#[command(name = "signetd", version, about = "Signet agent memory daemon")]
struct Cli {
    /// Root directory (default: ~/.agents)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default)
    Run {
        /// Override the federation listen address
        #[arg(long)]
        listen: Option<String>,
    },
    /// Generate identity and default config without starting the daemon
    Init,
    /// Print store statistics
    Status,
    /// Export the memory set as a signed bundle
    Export {
        /// Output path
        #[arg(long, default_value = "agent.signet-bundle.json.gz")]
        output: PathBuf,
        /// Skip signing the bundle
        #[arg(long)]
        no_sign: bool,
    },
    /// Import a bundle
    Import {
        /// Bundle path
        #[arg(long)]
        input: PathBuf,
        /// Merge strategy
        #[arg(long, value_enum, default_value = "skip-existing")]
        strategy: StrategyArg,
        /// Skip signature verification
        #[arg(long)]
        skip_signature: bool,
    },
    /// Peer administration
    Peer {
        #[command(subcommand)]
        action: PeerCommand,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Replace,
    Merge,
    SkipExisting,
}

impl From<StrategyArg> for MergeStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Replace => MergeStrategy::Replace,
            StrategyArg::Merge => MergeStrategy::Merge,
            StrategyArg::SkipExisting => MergeStrategy::SkipExisting,
        }
    }
}

#[derive(Subcommand)]
enum PeerCommand {
    /// Record a peer by DID
    Add {
        /// The peer's did:key identifier
        did: String,
        /// WebSocket URL for dialing out
        #[arg(long)]
        url: Option<String>,
        /// Display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Mark a peer trusted
    Trust {
        /// The peer's DID
        did: String,
    },
    /// Block a peer
    Block {
        /// The peer's DID
        did: String,
    },
    /// List known peers
    List,
}

fn open_store(layout: &Layout) -> anyhow::Result<(AgentConfig, Store)> {
    let config = AgentConfig::load(&layout.agent_yaml()).context("loading agent.yaml")?;
    let store = Store::open(layout.database(&config)).context("opening store")?;
    Ok((config, store))
}

fn resolve_peer_trust(layout: &Layout, did: &str, trust: TrustLevel) -> anyhow::Result<()> {
    let (_, store) = open_store(layout)?;
    let peer = store
        .peer_by_did(did)?
        .or_else(|| store.upsert_peer(did, None, None, None, None).ok());
    let peer = peer.with_context(|| format!("no peer row for {did}"))?;
    store.set_peer_trust(&peer.id, trust)?;
    println!("{did} -> {}", trust.as_str());
    Ok(())
}

async fn run_daemon(layout: Layout, listen: Option<String>) -> anyhow::Result<()> {
    let daemon = Daemon::start_with(layout, listen).await?;
    info!(addr = %daemon.federation_addr(), "daemon ready");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown signal received");
    daemon.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let layout = match &cli.root {
        Some(root) => Layout::at(root.clone()),
        None => match Layout::default_root() {
            Ok(layout) => layout,
            Err(e) => {
                error!("cannot resolve root directory: {e}");
                std::process::exit(1);
            }
        },
    };

    let result = match cli.command.unwrap_or(Command::Run { listen: None }) {
        Command::Run { listen } => run_daemon(layout, listen).await,
        Command::Init => init(layout),
        Command::Status => status(layout),
        Command::Export { output, no_sign } => export(layout, output, no_sign),
        Command::Import {
            input,
            strategy,
            skip_signature,
        } => import(layout, input, strategy.into(), skip_signature),
        Command::Peer { action } => peer(layout, action),
    };

    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init(layout: Layout) -> anyhow::Result<()> {
    std::fs::create_dir_all(layout.root())?;
    let mut config = AgentConfig::load(&layout.agent_yaml())?;

    let vault = KeyVault::new(layout.keys_file());
    if vault.exists() {
        println!("identity already exists at {}", vault.path().display());
        return Ok(());
    }
    let signer = vault.generate()?;
    let document = signet_core::DidDocument::for_public_key(&signer.public_key_bytes());
    std::fs::write(layout.did_json(), serde_json::to_string_pretty(&document)?)?;
    config.did = Some(signer.did().to_string());
    config.save(&layout.agent_yaml())?;

    println!("did: {}", signer.did());
    println!("keys: {}", layout.keys_file().display());
    Ok(())
}

fn status(layout: Layout) -> anyhow::Result<()> {
    let (config, store) = open_store(&layout)?;
    let stats = store.stats()?;

    println!("agent:    {}", config.agent.name);
    if let Some(did) = &config.did {
        println!("did:      {did}");
    }
    println!("memories: {} live / {} total", stats.live_memories, stats.total_memories);
    println!("pinned:   {}", stats.pinned_memories);
    for (memory_type, count) in &stats.by_type {
        println!("  {memory_type}: {count}");
    }
    println!("peers:    {}", stats.peers);
    println!("rules:    {}", stats.publish_rules);
    println!("received: {} awaiting promotion", stats.received_pending);
    if let Some(root) = &stats.last_merkle_root {
        println!("merkle:   {root}");
    }
    Ok(())
}

fn export(layout: Layout, output: PathBuf, no_sign: bool) -> anyhow::Result<()> {
    let (_, store) = open_store(&layout)?;
    let vault = KeyVault::new(layout.keys_file());
    let signer = if no_sign || !vault.exists() {
        None
    } else {
        Some(vault.load()?)
    };

    let metadata = export_bundle(&store, signer.as_deref(), &output)?;
    println!(
        "exported {} memories to {} (checksum {})",
        metadata.counts.memories,
        output.display(),
        &metadata.checksum[..16]
    );
    Ok(())
}

fn import(
    layout: Layout,
    input: PathBuf,
    strategy: MergeStrategy,
    skip_signature: bool,
) -> anyhow::Result<()> {
    let (_, store) = open_store(&layout)?;
    let report = import_bundle(&store, &input, strategy, skip_signature)?;
    println!(
        "imported {} memories ({} skipped), {} decisions, {} entities, {} relations",
        report.memories_imported,
        report.memories_skipped,
        report.decisions_imported,
        report.entities_imported,
        report.relations_imported
    );
    Ok(())
}

fn peer(layout: Layout, action: PeerCommand) -> anyhow::Result<()> {
    match action {
        PeerCommand::Add { did, url, name } => {
            signet_core::validate_did(&did).context("invalid did")?;
            let (_, store) = open_store(&layout)?;
            let peer = store.upsert_peer(&did, name.as_deref(), url.as_deref(), None, None)?;
            println!("added {} ({})", peer.did, peer.trust_level.as_str());
            Ok(())
        }
        PeerCommand::Trust { did } => resolve_peer_trust(&layout, &did, TrustLevel::Trusted),
        PeerCommand::Block { did } => resolve_peer_trust(&layout, &did, TrustLevel::Blocked),
        PeerCommand::List => {
            let (_, store) = open_store(&layout)?;
            for peer in store.list_peers()? {
                println!(
                    "{}  {}  shared={} received={}{}",
                    peer.trust_level.as_str(),
                    peer.did,
                    peer.memories_shared,
                    peer.memories_received,
                    peer.display_name
                        .map(|n| format!("  ({n})"))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}
