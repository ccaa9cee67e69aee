//! Storage integration tests.
//!
//! Exercises the document store and the SRDI local index through their
//! background workers rather than direct sweeps.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ember_core::PeerId;
use ember_store::{Document, DocumentStore, SrdiLocalIndex, StoreConfig};
use ember_tests::harness::wait_for;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn peer_document(name: &str) -> Document {
    Document::new(Bytes::copy_from_slice(name.as_bytes())).with_attribute("Name", name)
}

#[tokio::test]
async fn test_lifetime_and_expiration_reported() {
    let dir = TempDir::new().unwrap();
    let store = DocumentStore::open(&StoreConfig::new(dir.path()), "cm").unwrap();

    store
        .save(
            "Peers",
            "p1",
            &peer_document("p1"),
            Duration::from_millis(10_000),
            Duration::from_millis(5_000),
        )
        .unwrap();

    let lifetime = store.lifetime("Peers", "p1").unwrap().unwrap();
    let expiration = store.expiration_time("Peers", "p1").unwrap().unwrap();
    assert!(lifetime <= Duration::from_millis(10_000));
    assert!(expiration <= Duration::from_millis(5_000));
    assert!(expiration <= lifetime);
}

#[tokio::test]
async fn test_srdi_claim_expires_and_is_collected() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        srdi_gc_interval: Duration::from_millis(100),
        ..StoreConfig::new(dir.path())
    };
    let index = Arc::new(SrdiLocalIndex::open(&config, "index").unwrap());
    let cancel = CancellationToken::new();
    let worker = index.spawn_gc(cancel.clone());

    let peer_a = PeerId::random();
    index
        .add("pk", "attr", "val", peer_a, Duration::from_millis(1000))
        .unwrap();
    assert_eq!(
        index.query("pk", Some("attr"), Some("val"), 10).unwrap(),
        vec![peer_a]
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(index
        .query("pk", Some("attr"), Some("val"), 10)
        .unwrap()
        .is_empty());
    assert!(
        wait_for(Duration::from_secs(2), || index.stats().claims == 0).await,
        "GC worker should reclaim the expired claim"
    );

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_gc_worker_purges_expired_documents() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig {
        gc_interval: Duration::from_millis(100),
        ..StoreConfig::new(dir.path())
    };
    let store = Arc::new(DocumentStore::open(&config, "cm").unwrap());
    let cancel = CancellationToken::new();
    let worker = store.spawn_gc(cancel.clone());

    store
        .save(
            "Peers",
            "short",
            &peer_document("short"),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
        .unwrap();
    store
        .save(
            "Peers",
            "long",
            &peer_document("long"),
            Duration::from_secs(60),
            Duration::from_secs(60),
        )
        .unwrap();

    assert!(wait_for(Duration::from_secs(2), || store.stats().records == 1).await);
    assert_eq!(
        store.search("Peers", "Name", "*o*", 10).unwrap(),
        vec![("long".to_string(), Bytes::from_static(b"long"))]
    );

    cancel.cancel();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::new(dir.path());

    {
        let store = DocumentStore::open(&config, "cm").unwrap();
        for name in ["alpha", "alpine", "beta"] {
            store
                .save(
                    "Peers",
                    name,
                    &peer_document(name),
                    Duration::from_secs(60),
                    Duration::from_secs(30),
                )
                .unwrap();
        }
    }

    let store = DocumentStore::open(&config, "cm").unwrap();
    assert_eq!(store.directories(), vec!["Peers".to_string()]);
    assert_eq!(
        store.restore("Peers", "beta").unwrap(),
        Some(Bytes::from_static(b"beta"))
    );

    let mut names: Vec<String> = store
        .search("Peers", "Name", "alp*", 10)
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["alpha".to_string(), "alpine".to_string()]);

    // Deltas are not persisted; a full snapshot still covers every entry.
    assert_eq!(store.stats().pending_deltas, 0);
    assert_eq!(store.entries("Peers", false).unwrap().len(), 3);
}
