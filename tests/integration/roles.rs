//! Integration test: roles and membership.

use std::time::Duration;

use reef_integration_tests::{SETTLE, TestCluster, eventually};
use reef_shared::{Persist, ReplicationStatus, SharedAppendOptions};
use reef_types::{COORDINATE_SPACE, Role};

/// Observers store their own appends but nothing on behalf of others, and
/// their appends still reach a replicator.
#[tokio::test]
async fn test_observer_stores_only_its_own_entries() {
    let c = TestCluster::with_roles(&[Role::Observer, Role::default()], 2).await;
    assert!(c.wait_for_ranges(&[0, 1], 1).await);
    let (observer, replicator) = (c.node(0), c.node(1));
    assert!(observer.shared.my_range().await.is_none());
    assert_eq!(
        observer.shared.replicators().await[0].owner,
        replicator.peer
    );

    let remote = replicator.append("from replicator").await;

    let options = SharedAppendOptions {
        persist: Some(Persist {
            min: 1,
            timeout: Some(Duration::from_secs(5)),
        }),
        ..Default::default()
    };
    let own = observer
        .shared
        .append(b"from observer".to_vec(), options)
        .await
        .unwrap();
    assert_eq!(
        own.status,
        ReplicationStatus::Acknowledged {
            peers: vec![replicator.peer]
        }
    );
    assert!(replicator.has(&own.entry.hash()).await);

    assert!(!observer.has(&remote.hash()).await);
    assert_eq!(observer.log().length().await.unwrap(), 1);

    c.shutdown().await;
}

/// A departing peer's range is dropped by the others.
#[tokio::test]
async fn test_departed_peer_is_forgotten() {
    let c = TestCluster::new(3).await;
    assert!(c.wait_for_ranges(&[0, 1, 2], 3).await);

    c.node(2).shared.close().await.unwrap();
    assert!(c.wait_for_ranges(&[0, 1], 2).await);
    let owners: Vec<_> = c.node(0).shared.replicators().await.iter().map(|r| r.owner).collect();
    assert!(!owners.contains(&c.node(2).peer));

    c.node(0).shared.close().await.unwrap();
    c.node(1).shared.close().await.unwrap();
}

/// A lowered factor is advertised and adopted by the other peers.
#[tokio::test]
async fn test_factor_change_is_advertised() {
    let c = TestCluster::new(2).await;
    assert!(c.wait_for_ranges(&[0, 1], 2).await);
    let (a, b) = (c.node(0), c.node(1));

    b.shared
        .update_role(Role::Replicator { factor: 0.25 })
        .await
        .unwrap();
    assert_eq!(b.shared.factor().await, 0.25);

    let b_peer = b.peer;
    assert!(
        eventually(SETTLE, || async move {
            a.shared
                .replicators()
                .await
                .iter()
                .any(|r| r.owner == b_peer && r.width == COORDINATE_SPACE / 4)
        })
        .await
    );

    c.shutdown().await;
}
