//! Integration test: directory service over QUIC.
//!
//! Exercises registration and lookup:
//! 1. Query an empty directory
//! 2. Register relays and see them in the answer
//! 3. Re-register the same endpoint without duplicating it
//! 4. Restart a persistent directory and keep its registry

use veil_directory::Registry;
use veil_integration_tests::{spawn_directory, spawn_relays};
use veil_transport::{QuicNode, StopFlag};
use veil_types::NodeRegistration;

fn quic() -> QuicNode {
    QuicNode::client(veil_integration_tests::loopback()).expect("client endpoint")
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_is_idempotent_per_endpoint() {
    let directory = spawn_directory(None).expect("directory");
    let client = directory.client();
    let quic = quic();

    // =========================================================
    // Step 1: Empty directory
    // =========================================================
    let registry = client.query(&quic).await.expect("query");
    assert!(registry.is_empty());

    // =========================================================
    // Step 2: Register an endpoint twice
    // =========================================================
    let first = NodeRegistration::new("127.0.0.1", 9101, [1u8; 32]);
    let registry = client.update(&quic, &first).await.expect("update");
    assert_eq!(registry, vec![first.clone()]);
    let registry = client.update(&quic, &first).await.expect("repeat update");
    assert_eq!(registry, vec![first.clone()]);

    // =========================================================
    // Step 3: Same endpoint, new key replaces the entry
    // =========================================================
    let rekeyed = NodeRegistration::new("127.0.0.1", 9101, [2u8; 32]);
    let registry = client.update(&quic, &rekeyed).await.expect("rekey");
    assert_eq!(registry, vec![rekeyed.clone()]);

    let other = NodeRegistration::new("127.0.0.1", 9102, [3u8; 32]);
    let registry = client.update(&quic, &other).await.expect("second endpoint");
    assert_eq!(registry.len(), 2);
    assert_eq!(client.query(&quic).await.expect("query"), registry);

    directory.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn relays_appear_in_the_registry() {
    let directory = spawn_directory(None).expect("directory");
    let stop = StopFlag::new();
    let relays = spawn_relays(3, &directory, &stop).await.expect("relays");

    let registry = directory.client().query(&quic()).await.expect("query");
    assert_eq!(registry.len(), 3);
    for relay in &relays {
        assert!(registry.contains(&relay.registration()));
    }

    stop.stop();
    directory.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn persistent_registry_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("registry.json");
    let entry = NodeRegistration::new("127.0.0.1", 9201, [7u8; 32]);

    let directory = spawn_directory(Some(path.clone())).expect("directory");
    directory
        .client()
        .update(&quic(), &entry)
        .await
        .expect("update");
    directory.shutdown().await;

    let on_disk = Registry::load(&path).expect("load");
    assert_eq!(on_disk.entries(), &[entry.clone()]);

    let restarted = spawn_directory(Some(path)).expect("restarted directory");
    let registry = restarted.client().query(&quic()).await.expect("query");
    assert_eq!(registry, vec![entry]);
    restarted.shutdown().await;
}
