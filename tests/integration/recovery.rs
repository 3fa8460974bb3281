//! Integration test: recovering entries the append policy refused.

use std::sync::Arc;

use reef_integration_tests::{SETTLE, TestCluster, eventually};
use reef_log::{CanAppend, Entry, LogOptions};
use reef_shared::SharedLogError;
use reef_store::BlockStore;
use reef_types::Role;

fn refuse_blocked() -> CanAppend {
    Arc::new(|entry: &Entry| entry.data(None).as_deref() != Some(b"blocked".as_slice()))
}

/// A refused entry is kept in the block store; once the policy is relaxed,
/// `recover` materializes it.
#[tokio::test]
async fn test_recover_admits_previously_refused_entry() {
    let mut c = TestCluster::new(1).await;
    let strict = c
        .add_node_with(
            Role::default(),
            LogOptions {
                can_append: Some(refuse_blocked()),
                ..Default::default()
            },
        )
        .await;
    assert!(c.wait_for_ranges(&[0, strict], 2).await);

    let blocked = c.node(0).append("blocked").await;
    let hash = blocked.hash();
    let node = c.node(strict);
    assert!(eventually(SETTLE, || async move { node.store.has(&hash).await.unwrap() }).await);
    assert!(!node.has(&hash).await);

    node.log().set_can_append(None).await.unwrap();
    let outcome = node.shared.recover().await.unwrap();
    assert_eq!(outcome.added_hashes(), vec![hash]);
    assert!(node.has(&hash).await);

    // Nothing left to recover.
    assert!(node.shared.recover().await.unwrap().added.is_empty());

    c.shutdown().await;
}

/// Recovery needs an open shared log.
#[tokio::test]
async fn test_recover_after_close_fails() {
    let c = TestCluster::new(1).await;
    c.node(0).shared.close().await.unwrap();
    assert!(matches!(
        c.node(0).shared.recover().await,
        Err(SharedLogError::Closed)
    ));
}
