//! Export bundle
//!
//! `.signet-bundle.json.gz`: a gzip-compressed JSON document carrying the
//! memory set, decisions, and knowledge graph, with a SHA-256 checksum over
//! the canonical serialization of `data` and an optional Ed25519 signature
//! over the checksum string. Canonical means the serde struct field order
//! with no whitespace, which is stable for a fixed schema version.

use std::io::{Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{verify_with_did, Signer};
use crate::memory::{Decision, Entity, Memory, MemoryFilter, Relation};
use crate::storage::{Store, StoreError};

/// Bundle format version.
pub const BUNDLE_VERSION: u32 = 1;

/// Bundle format tag.
pub const BUNDLE_FORMAT: &str = "signet-bundle";

/// Export/import failures.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Filesystem error.
    #[error("bundle io error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON (de)serialization error.
    #[error("bundle serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The recomputed checksum does not match the metadata.
    #[error("bundle checksum mismatch")]
    ChecksumMismatch,
    /// The metadata signature does not verify.
    #[error("bundle signature invalid")]
    BadSignature,
    /// The file is not a signet bundle.
    #[error("unrecognized bundle format: {0}")]
    UnknownFormat(String),
}

/// How import treats rows that already exist locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    /// Incoming rows replace local rows with the same id.
    Replace,
    /// Incoming rows fill gaps; same-id rows are replaced only if newer.
    Merge,
    /// Only rows absent locally are written.
    SkipExisting,
}

/// Row counts recorded in the metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleCounts {
    /// Exported memories.
    pub memories: usize,
    /// Exported decisions.
    pub decisions: usize,
    /// Exported entities.
    pub entities: usize,
    /// Exported relations.
    pub relations: usize,
}

/// Bundle metadata envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleMetadata {
    /// Format version.
    pub version: u32,
    /// Format tag.
    pub format: String,
    /// Export time.
    pub exported_at: DateTime<Utc>,
    /// Exporter's DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    /// Exporter's base64 public key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Row counts.
    pub counts: BundleCounts,
    /// SHA-256 hex of the canonical `data` serialization.
    pub checksum: String,
    /// Ed25519 signature over the checksum string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Bundle payload. Field order is the canonical serialization order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleData {
    /// Memory rows (live only).
    pub memories: Vec<Memory>,
    /// Decision rows.
    pub decisions: Vec<Decision>,
    /// Entity rows.
    pub entities: Vec<Entity>,
    /// Relation rows.
    pub relations: Vec<Relation>,
    /// Latest Merkle root at export time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_root: Option<String>,
    /// Leaf count of that root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merkle_leaf_count: Option<i64>,
}

/// The whole bundle document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    /// Envelope.
    pub metadata: BundleMetadata,
    /// Payload.
    pub data: BundleData,
}

/// What an import actually did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// Memories written.
    pub memories_imported: usize,
    /// Memories skipped (already present).
    pub memories_skipped: usize,
    /// Decisions written.
    pub decisions_imported: usize,
    /// Entities written.
    pub entities_imported: usize,
    /// Relations written.
    pub relations_imported: usize,
}

fn data_checksum(data: &BundleData) -> Result<String, BundleError> {
    let canonical = serde_json::to_vec(data)?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

/// Export the store into a bundle file. Returns the metadata written.
pub fn export_bundle(
    store: &Store,
    signer: Option<&Signer>,
    path: &Path,
) -> Result<BundleMetadata, BundleError> {
    let memories = store.list(&MemoryFilter::default())?;
    let decisions = store.list_decisions()?;
    let entities = store.list_entities()?;
    let relations = store.list_relations()?;
    let latest_root = store.latest_merkle_root()?;

    let data = BundleData {
        memories,
        decisions,
        entities,
        relations,
        merkle_root: latest_root.as_ref().map(|r| r.root_hash.clone()),
        merkle_leaf_count: latest_root.as_ref().map(|r| r.memory_count),
    };

    let checksum = data_checksum(&data)?;
    let metadata = BundleMetadata {
        version: BUNDLE_VERSION,
        format: BUNDLE_FORMAT.to_string(),
        exported_at: Utc::now(),
        did: signer.map(|s| s.did().to_string()),
        public_key: signer.map(|s| {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(s.public_key_bytes())
        }),
        counts: BundleCounts {
            memories: data.memories.len(),
            decisions: data.decisions.len(),
            entities: data.entities.len(),
            relations: data.relations.len(),
        },
        checksum: checksum.clone(),
        signature: signer.map(|s| s.sign(checksum.as_bytes())),
    };

    let bundle = Bundle {
        metadata: metadata.clone(),
        data,
    };

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&serde_json::to_vec(&bundle)?)?;
    encoder.finish()?;

    tracing::info!(
        path = %path.display(),
        memories = metadata.counts.memories,
        "bundle exported"
    );
    Ok(metadata)
}

/// Read and verify a bundle file without applying it.
pub fn read_bundle(path: &Path, skip_signature: bool) -> Result<Bundle, BundleError> {
    let file = std::fs::File::open(path)?;
    let mut decoder = GzDecoder::new(file);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;

    let bundle: Bundle = serde_json::from_slice(&raw)?;
    if bundle.metadata.format != BUNDLE_FORMAT {
        return Err(BundleError::UnknownFormat(bundle.metadata.format.clone()));
    }

    if data_checksum(&bundle.data)? != bundle.metadata.checksum {
        return Err(BundleError::ChecksumMismatch);
    }

    if !skip_signature {
        if let (Some(did), Some(signature)) =
            (&bundle.metadata.did, &bundle.metadata.signature)
        {
            verify_with_did(did, bundle.metadata.checksum.as_bytes(), signature)
                .map_err(|_| BundleError::BadSignature)?;
        }
    }

    Ok(bundle)
}

/// Import a bundle file with the chosen merge strategy.
pub fn import_bundle(
    store: &Store,
    path: &Path,
    strategy: MergeStrategy,
    skip_signature: bool,
) -> Result<ImportReport, BundleError> {
    let bundle = read_bundle(path, skip_signature)?;
    let mut report = ImportReport::default();

    for memory in &bundle.data.memories {
        let overwrite = match strategy {
            MergeStrategy::Replace => true,
            MergeStrategy::SkipExisting => false,
            MergeStrategy::Merge => {
                // Replace only when the incoming row is newer.
                match store.get(&memory.id)? {
                    Some(existing) => memory.updated_at > existing.updated_at,
                    None => false,
                }
            }
        };
        if store.import_memory_row(memory, overwrite)? {
            report.memories_imported += 1;
        } else {
            report.memories_skipped += 1;
        }
    }

    for entity in &bundle.data.entities {
        if store.import_entity_row(entity)? {
            report.entities_imported += 1;
        }
    }
    for relation in &bundle.data.relations {
        if store.import_relation_row(relation)? {
            report.relations_imported += 1;
        }
    }
    for decision in &bundle.data.decisions {
        if store.import_decision_row(decision)? {
            report.decisions_imported += 1;
        }
    }

    tracing::info!(
        imported = report.memories_imported,
        skipped = report.memories_skipped,
        "bundle import complete"
    );
    Ok(report)
}
