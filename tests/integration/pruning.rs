//! Integration test: pruning entries held elsewhere.

use std::time::Duration;

use reef_integration_tests::TestCluster;
use reef_shared::{Persist, ReplicationStatus, SharedAppendOptions};
use reef_types::{Hash, Role};

fn persisted(min: usize) -> SharedAppendOptions {
    SharedAppendOptions {
        persist: Some(Persist {
            min,
            timeout: Some(Duration::from_secs(5)),
        }),
        ..Default::default()
    }
}

async fn append_chain(c: &TestCluster, node: usize, n: usize, min: usize) -> Vec<Hash> {
    let mut hashes = Vec::new();
    for i in 0..n {
        let appended = c
            .node(node)
            .shared
            .append(format!("e{i}").into_bytes(), persisted(min))
            .await
            .unwrap();
        assert!(
            matches!(appended.status, ReplicationStatus::Acknowledged { .. }),
            "entry {i} not acknowledged: {:?}",
            appended.status
        );
        hashes.push(appended.entry.hash());
    }
    hashes
}

/// A peer that stops replicating drops history two others hold, but keeps
/// its head.
#[tokio::test]
async fn test_observer_prunes_replicated_history() {
    let c = TestCluster::new(3).await;
    assert!(c.wait_for_ranges(&[0, 1, 2], 3).await);
    let hashes = append_chain(&c, 0, 3, 2).await;

    let a = c.node(0);
    a.shared.update_role(Role::Observer).await.unwrap();

    assert_eq!(a.log().length().await.unwrap(), 1);
    assert!(a.has(&hashes[2]).await, "head is kept");
    assert!(!a.has(&hashes[0]).await);
    assert!(!a.has(&hashes[1]).await);
    assert!(a.shared.prune().await.unwrap().is_empty());

    for i in [1, 2] {
        assert_eq!(c.node(i).log().length().await.unwrap(), 3);
    }

    c.shutdown().await;
}

/// A peer responsible for an entry never prunes it.
#[tokio::test]
async fn test_responsible_replicator_keeps_entries() {
    let c = TestCluster::new(2).await;
    assert!(c.wait_for_ranges(&[0, 1], 2).await);
    append_chain(&c, 0, 3, 1).await;

    assert!(c.node(0).shared.prune().await.unwrap().is_empty());
    assert_eq!(c.node(0).log().length().await.unwrap(), 3);

    c.shutdown().await;
}

/// Fewer acknowledgements than copies required: nothing is pruned.
#[tokio::test]
async fn test_under_replicated_entries_are_kept() {
    let c = TestCluster::new(2).await;
    assert!(c.wait_for_ranges(&[0, 1], 2).await);
    append_chain(&c, 0, 3, 1).await;

    c.node(0).shared.update_role(Role::Observer).await.unwrap();
    assert!(c.node(0).shared.prune().await.unwrap().is_empty());
    assert_eq!(c.node(0).log().length().await.unwrap(), 3);

    c.shutdown().await;
}
