//! Bundle export/import across two independent agents.

use tempfile::TempDir;

use signet_core::export::{export_bundle, import_bundle, read_bundle, BundleError, MergeStrategy};
use signet_core::memory::MemoryFilter;
use signet_e2e::{MemorySpec, TestNode};

#[test]
fn signed_bundle_travels_between_agents() {
    let exporter = TestNode::new(30, "exporter");
    for content in ["portable fact one", "portable fact two"] {
        exporter.insert(MemorySpec {
            content,
            sign: true,
            importance: 0.8,
            ..Default::default()
        });
    }
    signet_core::compute_memory_root(&exporter.store, Some(exporter.signer.as_ref())).unwrap();

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.signet-bundle.json.gz");
    let metadata =
        export_bundle(&exporter.store, Some(exporter.signer.as_ref()), &path).unwrap();
    assert_eq!(metadata.counts.memories, 2);
    assert_eq!(metadata.did.as_deref(), Some(exporter.did()));

    // A different agent verifies the signature and imports everything.
    let importer = TestNode::new(31, "importer");
    let bundle = read_bundle(&path, false).unwrap();
    assert_eq!(bundle.data.merkle_leaf_count, Some(2));

    let report = import_bundle(
        &importer.store,
        &path,
        MergeStrategy::SkipExisting,
        false,
    )
    .unwrap();
    assert_eq!(report.memories_imported, 2);

    // Imported rows keep the exporter's provenance.
    let imported = importer.store.list(&MemoryFilter::default()).unwrap();
    assert_eq!(imported.len(), 2);
    for memory in &imported {
        assert_eq!(memory.signer_did.as_deref(), Some(exporter.did()));
        signet_core::verify_with_did(
            exporter.did(),
            memory.content.as_bytes(),
            memory.signature.as_deref().unwrap(),
        )
        .expect("imported signature verifies");
    }

    // Re-import is a no-op under skip-existing.
    let again = import_bundle(
        &importer.store,
        &path,
        MergeStrategy::SkipExisting,
        false,
    )
    .unwrap();
    assert_eq!(again.memories_imported, 0);
    assert_eq!(again.memories_skipped, 2);
}

#[test]
fn corrupted_bundle_is_rejected() {
    let node = TestNode::new(32, "corruption-node");
    node.insert(MemorySpec {
        content: "will be tampered",
        ..Default::default()
    });

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tampered.signet-bundle.json.gz");
    export_bundle(&node.store, None, &path).unwrap();

    // Flip a byte in the compressed stream.
    let mut raw = std::fs::read(&path).unwrap();
    let mid = raw.len() / 2;
    raw[mid] ^= 0xff;
    std::fs::write(&path, raw).unwrap();

    let other = TestNode::new(33, "victim");
    let result = import_bundle(&other.store, &path, MergeStrategy::SkipExisting, true);
    assert!(matches!(
        result,
        Err(BundleError::Io(_)) | Err(BundleError::Serde(_)) | Err(BundleError::ChecksumMismatch)
    ));
    assert!(other.store.list(&MemoryFilter::default()).unwrap().is_empty());
}
