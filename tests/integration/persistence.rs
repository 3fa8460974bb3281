//! Integration test: waiting for remote replication.

use std::time::Duration;

use reef_integration_tests::{SETTLE, TestCluster, eventually};
use reef_shared::{Persist, ReplicationStatus, SharedAppendOptions, SharedLogError, topic_for};
use reef_types::Role;

fn persist(min: usize, timeout: Duration) -> SharedAppendOptions {
    SharedAppendOptions {
        persist: Some(Persist {
            min,
            timeout: Some(timeout),
        }),
        ..Default::default()
    }
}

/// An append with `persist.min = 1` returns once the other replicator holds
/// the entry.
#[tokio::test]
async fn test_append_waits_for_remote_ack() {
    let c = TestCluster::new(2).await;
    assert!(c.wait_for_ranges(&[0, 1], 2).await);

    let appended = c
        .node(0)
        .shared
        .append(b"durable".to_vec(), persist(1, Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(
        appended.status,
        ReplicationStatus::Acknowledged {
            peers: vec![c.node(1).peer]
        }
    );
    assert!(c.node(1).has(&appended.entry.hash()).await);
    assert_eq!(
        c.node(0).shared.acknowledgements(&appended.entry.hash()),
        vec![c.node(1).peer]
    );

    c.shutdown().await;
}

/// With nobody else on the topic the wait fails at once, but the entry is
/// kept locally.
#[tokio::test]
async fn test_persist_without_peers_raises_no_peers() {
    let c = TestCluster::new(1).await;

    let started = tokio::time::Instant::now();
    let err = c
        .node(0)
        .shared
        .append(b"lonely".to_vec(), persist(1, Duration::from_secs(30)))
        .await
        .unwrap_err();

    assert!(matches!(err, SharedLogError::NoPeers { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(c.node(0).log().length().await.unwrap(), 1);

    c.shutdown().await;
}

/// Peers are present but none acknowledges: the wait ends softly.
#[tokio::test]
async fn test_unacknowledged_append_times_out_softly() {
    let c = TestCluster::with_roles(&[Role::default(), Role::Observer], 2).await;
    let network = c.network.clone();
    let topic = topic_for(reef_integration_tests::LOG_ID);
    assert!(eventually(SETTLE, || {
        let network = network.clone();
        let topic = topic.clone();
        async move { network.subscribers(&topic).len() == 2 }
    })
    .await);

    let appended = c
        .node(0)
        .shared
        .append(b"unheard".to_vec(), persist(1, Duration::from_millis(300)))
        .await
        .unwrap();

    assert_eq!(
        appended.status,
        ReplicationStatus::TimedOut {
            acknowledged: 0,
            required: 1
        }
    );
    assert!(c.node(0).has(&appended.entry.hash()).await);
    assert!(!c.node(1).has(&appended.entry.hash()).await);

    c.shutdown().await;
}
