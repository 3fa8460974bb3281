//! Integration test: fetching missing history.
//!
//! Raw network peers (no shared log) announce heads whose parents the
//! subject lacks, and optionally serve those parents.

use std::sync::Arc;
use std::time::Duration;

use reef_integration_tests::{SETTLE, TestCluster, eventually, identity};
use reef_log::{CreateEntry, Entry, EntryType, Identity};
use reef_shared::{LogMessage, MemoryPeer, NetEvent, PubSub, PublishOptions, Subscription, topic_for};
use reef_types::PeerId;

/// Two linked entries authored outside the cluster: `(parent, child)`.
fn foreign_chain() -> (Entry, Entry) {
    let author = identity(42);
    let signers: [&dyn Identity; 1] = [author.as_ref()];
    let parent = Entry::create(CreateEntry {
        data: b"parent".to_vec(),
        meta_data: None,
        next: &[],
        kind: EntryType::Append,
        local_time: 0,
        signers: &signers,
        seal: None,
    })
    .unwrap();
    let child = Entry::create(CreateEntry {
        data: b"child".to_vec(),
        meta_data: None,
        next: std::slice::from_ref(&parent),
        kind: EntryType::Append,
        local_time: 1,
        signers: &signers,
        seal: None,
    })
    .unwrap();
    (parent, child)
}

fn topic() -> String {
    topic_for(reef_integration_tests::LOG_ID)
}

async fn raw_peer(c: &TestCluster, seed: u8) -> (Arc<MemoryPeer>, Subscription) {
    let peer = c.network.peer(PeerId::from([seed; 32]));
    let sub = peer.subscribe(&topic()).await.unwrap();
    (peer, sub)
}

async fn broadcast(peer: &MemoryPeer, message: &LogMessage) {
    peer.publish(message.encode().unwrap(), PublishOptions::broadcast(topic()))
        .await
        .unwrap();
}

/// Answer entry requests for `served` until the subscription ends.
fn serve(peer: Arc<MemoryPeer>, mut sub: Subscription, served: Entry) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            if let NetEvent::Message { from, data } = event
                && let Ok(LogMessage::EntryRequest { request_id, hashes, .. }) =
                    LogMessage::decode(&data)
                && hashes.contains(&served.hash())
            {
                let response = LogMessage::EntryResponse {
                    request_id,
                    entries: vec![served.to_bytes().unwrap()],
                };
                peer.publish(
                    response.encode().unwrap(),
                    PublishOptions::direct(topic(), vec![from]),
                )
                .await
                .unwrap();
            }
        }
    })
}

/// Wait for an entry request on `sub`.
async fn next_request(sub: &mut Subscription) -> Option<LogMessage> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = sub.recv().await {
            if let NetEvent::Message { data, .. } = event
                && let Ok(message @ LogMessage::EntryRequest { .. }) = LogMessage::decode(&data)
            {
                return Some(message);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

/// The announcer never answers; the fetch falls back to a peer known from
/// an earlier acknowledgement.
#[tokio::test]
async fn test_fetch_falls_back_to_hinted_peer() {
    let c = TestCluster::new(1).await;
    let subject = c.node(0);
    let (parent, child) = foreign_chain();

    let (silent, mut silent_sub) = raw_peer(&c, 0xA1).await;
    let (server, server_sub) = raw_peer(&c, 0xB2).await;

    broadcast(
        &server,
        &LogMessage::ReplicationAck {
            hashes: vec![parent.hash()],
        },
    )
    .await;
    let responder = serve(server.clone(), server_sub, parent.clone());

    broadcast(&silent, &LogMessage::heads(std::slice::from_ref(&child)).unwrap()).await;

    // The announcer is asked first.
    match next_request(&mut silent_sub).await {
        Some(LogMessage::EntryRequest { hashes, .. }) => assert_eq!(hashes, vec![parent.hash()]),
        other => panic!("expected an entry request, got {other:?}"),
    }

    let child_hash = child.hash();
    assert!(eventually(SETTLE, || async move { subject.has(&child_hash).await }).await);
    assert!(subject.has(&parent.hash()).await);
    assert_eq!(subject.log().pending_count().await.unwrap(), 0);

    responder.abort();
    c.shutdown().await;
}

/// Nobody serves the parent: the child stays parked until a later
/// announcement supplies it.
#[tokio::test]
async fn test_gap_stays_open_until_parent_arrives() {
    let c = TestCluster::new(1).await;
    let subject = c.node(0);
    let (parent, child) = foreign_chain();
    let (silent, _silent_sub) = raw_peer(&c, 0xC3).await;

    let (parent_hash, child_hash) = (parent.hash(), child.hash());

    broadcast(&silent, &LogMessage::heads(std::slice::from_ref(&child)).unwrap()).await;
    assert!(
        eventually(SETTLE, || async move {
            subject.log().missing().await.unwrap() == vec![parent_hash]
        })
        .await
    );
    assert!(!subject.has(&child_hash).await);
    assert_eq!(subject.log().length().await.unwrap(), 0);

    broadcast(&silent, &LogMessage::heads(std::slice::from_ref(&parent)).unwrap()).await;
    assert!(eventually(SETTLE, || async move { subject.has(&child_hash).await }).await);
    assert_eq!(subject.log().length().await.unwrap(), 2);

    c.shutdown().await;
}
