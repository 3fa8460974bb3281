//! In-process [`PubSub`] for tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reef_types::PeerId;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::SharedLogError;
use crate::network::{NetEvent, PubSub, PublishOptions, Subscription};

struct Subscriber {
    id: u64,
    events: mpsc::UnboundedSender<NetEvent>,
}

#[derive(Default)]
struct Hub {
    topics: HashMap<String, HashMap<PeerId, Subscriber>>,
    offline: HashSet<PeerId>,
    next_id: u64,
}

impl Hub {
    fn reachable(&self, peer: &PeerId) -> bool {
        !self.offline.contains(peer)
    }
}

/// A shared in-memory message bus. Each [`MemoryNetwork::peer`] is one node.
///
/// Delivery is immediate and ordered per sender. Peers can be taken
/// offline to drop everything sent to or from them.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node.
    pub fn peer(&self, id: PeerId) -> Arc<MemoryPeer> {
        Arc::new(MemoryPeer {
            id,
            hub: self.hub.clone(),
        })
    }

    /// Drop all traffic to and from `peer` while `offline` is set.
    pub fn set_offline(&self, peer: PeerId, offline: bool) {
        let mut hub = self.hub.lock().expect("lock poisoned");
        if offline {
            hub.offline.insert(peer);
        } else {
            hub.offline.remove(&peer);
        }
    }

    /// All peers subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<PeerId> {
        let hub = self.hub.lock().expect("lock poisoned");
        hub.topics
            .get(topic)
            .map(|subs| subs.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// One node's handle on a [`MemoryNetwork`].
pub struct MemoryPeer {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
}

#[async_trait]
impl PubSub for MemoryPeer {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, SharedLogError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = {
            let mut hub = self.hub.lock().expect("lock poisoned");
            hub.next_id += 1;
            let sub_id = hub.next_id;

            let subs = hub.topics.entry(topic.to_string()).or_default();
            for (peer, other) in subs.iter() {
                if *peer == self.id {
                    continue;
                }
                let _ = other.events.send(NetEvent::PeerJoined(self.id));
                let _ = tx.send(NetEvent::PeerJoined(*peer));
            }
            subs.insert(
                self.id,
                Subscriber {
                    id: sub_id,
                    events: tx,
                },
            );
            sub_id
        };
        trace!(peer = %self.id.short(), topic, "subscribed");

        let hub = self.hub.clone();
        let me = self.id;
        let topic_name = topic.to_string();
        Ok(Subscription::new(topic, rx, move || {
            let mut hub = hub.lock().expect("lock poisoned");
            let Some(subs) = hub.topics.get_mut(&topic_name) else {
                return;
            };
            if subs.get(&me).is_some_and(|s| s.id == sub_id) {
                subs.remove(&me);
                for other in subs.values() {
                    let _ = other.events.send(NetEvent::PeerLeft(me));
                }
            }
        }))
    }

    async fn publish(&self, data: Bytes, options: PublishOptions) -> Result<(), SharedLogError> {
        let hub = self.hub.lock().expect("lock poisoned");
        if !hub.reachable(&self.id) {
            return Ok(());
        }
        for topic in &options.topics {
            let Some(subs) = hub.topics.get(topic) else {
                continue;
            };
            for (peer, sub) in subs {
                if *peer == self.id || !hub.reachable(peer) {
                    continue;
                }
                if options.to.as_ref().is_some_and(|to| !to.contains(peer)) {
                    continue;
                }
                let _ = sub.events.send(NetEvent::Message {
                    from: self.id,
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    async fn get_subscribers(&self, topic: &str) -> Result<Vec<PeerId>, SharedLogError> {
        let hub = self.hub.lock().expect("lock poisoned");
        Ok(hub
            .topics
            .get(topic)
            .map(|subs| {
                subs.keys()
                    .filter(|p| **p != self.id && hub.reachable(p))
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn request_subscribers(&self, _topic: &str) -> Result<(), SharedLogError> {
        // Membership is always current in memory.
        Ok(())
    }
}
