//! The pub/sub collaborator a shared log talks through.
//!
//! Transport, peer discovery and the gossip overlay are out of scope; a
//! [`PubSub`] implementation provides topic-scoped delivery and membership
//! events. [`crate::memory::MemoryNetwork`] is the in-process implementation
//! used by tests.

use async_trait::async_trait;
use bytes::Bytes;
use reef_types::PeerId;
use tokio::sync::mpsc;

use crate::error::SharedLogError;

/// Something that happened on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A message published by another peer.
    Message {
        /// Publishing peer.
        from: PeerId,
        /// Framed payload.
        data: Bytes,
    },
    /// A peer subscribed to the topic.
    PeerJoined(PeerId),
    /// A peer unsubscribed or disconnected.
    PeerLeft(PeerId),
}

/// Where a publish goes.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Topics to publish on.
    pub topics: Vec<String>,
    /// Restrict delivery to these subscribers. `None` means everyone.
    pub to: Option<Vec<PeerId>>,
}

impl PublishOptions {
    /// Publish to every subscriber of `topic`.
    pub fn broadcast(topic: impl Into<String>) -> Self {
        Self {
            topics: vec![topic.into()],
            to: None,
        }
    }

    /// Publish on `topic` to `peers` only.
    pub fn direct(topic: impl Into<String>, peers: Vec<PeerId>) -> Self {
        Self {
            topics: vec![topic.into()],
            to: Some(peers),
        }
    }
}

type Release = Box<dyn FnOnce() + Send + Sync>;

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    pub(crate) events: mpsc::UnboundedReceiver<NetEvent>,
    release: Option<Release>,
}

impl Subscription {
    /// Wrap an event receiver; `release` runs once when the subscription
    /// is closed or dropped.
    pub fn new(
        topic: impl Into<String>,
        events: mpsc::UnboundedReceiver<NetEvent>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            events,
            release: Some(Box::new(release)),
        }
    }

    /// Subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next event, or `None` once the network has gone away.
    pub async fn recv(&mut self) -> Option<NetEvent> {
        self.events.recv().await
    }

    /// Unsubscribe now.
    pub fn close(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Topic-scoped publish/subscribe with membership.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// This node's identity on the network.
    fn local_peer(&self) -> PeerId;

    /// Subscribe to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, SharedLogError>;

    /// Publish framed bytes.
    async fn publish(&self, data: Bytes, options: PublishOptions) -> Result<(), SharedLogError>;

    /// Peers currently known to subscribe to `topic`, excluding ourselves.
    async fn get_subscribers(&self, topic: &str) -> Result<Vec<PeerId>, SharedLogError>;

    /// Ask the network to refresh its view of `topic`'s subscribers.
    async fn request_subscribers(&self, topic: &str) -> Result<(), SharedLogError>;
}
