//! Integration test: replicas converge.
//!
//! Peers append concurrently and join late; every replica ends up with the
//! same entries and the same heads.

use std::collections::BTreeSet;

use reef_integration_tests::{SETTLE, TestCluster, eventually};
use reef_types::{Hash, Role};

/// Two peers append concurrently; both end with the union and equal heads.
#[tokio::test]
async fn test_concurrent_appends_converge() {
    let c = TestCluster::new(2).await;
    assert!(c.wait_for_ranges(&[0, 1], 2).await);
    let (a, b) = (c.node(0), c.node(1));

    let a1 = a.append("a1").await;
    let b1 = b.append("b1").await;
    let a2 = a.append("a2").await;

    let expected: BTreeSet<Hash> = [a1.hash(), a2.hash(), b1.hash()].into();
    assert!(c.wait_for_entries(&[0, 1], &expected).await);
    assert!(eventually(SETTLE, || async move { a.head_set().await == b.head_set().await }).await);

    c.shutdown().await;
}

/// Three peers each grow their own branch; every replica materializes all
/// of them.
#[tokio::test]
async fn test_three_peers_converge_on_branches() {
    let c = TestCluster::new(3).await;
    assert!(c.wait_for_ranges(&[0, 1, 2], 3).await);

    let mut expected = BTreeSet::new();
    for round in 0..4 {
        for i in 0..c.len() {
            let data = format!("node{i}-round{round}");
            let entry = if round == 0 {
                c.node(i).append_root(&data).await
            } else {
                c.node(i).append(&data).await
            };
            expected.insert(entry.hash());
        }
    }

    assert!(c.wait_for_entries(&[0, 1, 2], &expected).await);
    let (a, b, d) = (c.node(0), c.node(1), c.node(2));
    assert!(
        eventually(SETTLE, || async move {
            let heads = a.head_set().await;
            heads == b.head_set().await && heads == d.head_set().await
        })
        .await
    );

    c.shutdown().await;
}

/// A peer that joins after history was written fetches all of it.
#[tokio::test]
async fn test_late_joiner_catches_up_history() {
    let mut c = TestCluster::new(1).await;

    let mut expected = BTreeSet::new();
    for i in 0..20 {
        expected.insert(c.node(0).append(&format!("e{i}")).await.hash());
    }

    let joiner = c.add_node(Role::default()).await;
    assert!(c.wait_for_entries(&[0, joiner], &expected).await);
    assert_eq!(c.node(joiner).log().pending_count().await.unwrap(), 0);

    c.shutdown().await;
}
