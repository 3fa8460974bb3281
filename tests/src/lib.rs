//! Shared test harness for Reef integration tests.
//!
//! Provides [`TestCluster`]: N peers, each with its own block store, log and
//! [`SharedLog`], wired together through a [`MemoryNetwork`].

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reef_log::{AppendOptions, Ed25519Identity, Entry, Identity, Log, LogOptions};
use reef_shared::{
    MemoryNetwork, SharedAppendOptions, SharedLog, SharedLogConfig, SharedLogOptions,
};
use reef_store::MemoryBlockStore;
use reef_types::{Hash, PeerId, Role};

/// Log id every test node opens.
pub const LOG_ID: &str = "integration";

/// How long [`eventually`] polls by default.
pub const SETTLE: Duration = Duration::from_secs(10);

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with short timers so tests settle quickly.
pub fn fast_config() -> SharedLogConfig {
    let mut config = SharedLogConfig::default();
    config.sync.debounce_ms = 5;
    config.sync.max_debounce_ms = 25;
    config.sync.fetch_timeout_ms = 150;
    config.sync.fetch_retries = 2;
    config.sync.fetch_backoff_ms = 10;
    config.sync.max_backoff_ms = 40;
    config.persist.ack_timeout_ms = 5_000;
    config
}

/// Deterministic identity from a one-byte seed.
pub fn identity(seed: u8) -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([seed; 32]))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// One peer of a [`TestCluster`].
pub struct Node {
    /// Network identity (the log's signing key).
    pub peer: PeerId,
    /// The peer's block store.
    pub store: Arc<MemoryBlockStore>,
    /// The coordinated log.
    pub shared: SharedLog,
}

impl Node {
    /// The underlying log.
    pub fn log(&self) -> &Arc<Log> {
        self.shared.log()
    }

    /// Append `data` with default options.
    pub async fn append(&self, data: &str) -> Entry {
        self.shared
            .append(data.as_bytes().to_vec(), SharedAppendOptions::default())
            .await
            .unwrap()
            .entry
    }

    /// Append `data` on a fresh branch.
    pub async fn append_root(&self, data: &str) -> Entry {
        let options = SharedAppendOptions {
            log: AppendOptions {
                next: Some(vec![]),
                ..Default::default()
            },
            persist: None,
        };
        self.shared
            .append(data.as_bytes().to_vec(), options)
            .await
            .unwrap()
            .entry
    }

    /// Materialized entry hashes.
    pub async fn entry_set(&self) -> BTreeSet<Hash> {
        self.log()
            .entries()
            .await
            .unwrap()
            .iter()
            .map(Entry::hash)
            .collect()
    }

    /// Head hashes.
    pub async fn head_set(&self) -> BTreeSet<Hash> {
        self.log().head_hashes().await.unwrap().into_iter().collect()
    }

    /// Whether `hash` is materialized here.
    pub async fn has(&self, hash: &Hash) -> bool {
        self.log().has(hash).await.unwrap()
    }
}

/// N peers sharing one log over an in-memory network.
pub struct TestCluster {
    /// The network every node is attached to.
    pub network: MemoryNetwork,
    nodes: Vec<Node>,
    min_replicas: usize,
    config: SharedLogConfig,
}

impl TestCluster {
    /// `n` full replicators, two copies per entry.
    pub async fn new(n: usize) -> Self {
        Self::with_roles(&vec![Role::default(); n], 2).await
    }

    /// One node per role.
    pub async fn with_roles(roles: &[Role], min_replicas: usize) -> Self {
        init_tracing();
        let mut cluster = Self {
            network: MemoryNetwork::new(),
            nodes: Vec::new(),
            min_replicas,
            config: fast_config(),
        };
        for role in roles {
            cluster.add_node(*role).await;
        }
        cluster
    }

    /// Attach another node; returns its index.
    pub async fn add_node(&mut self, role: Role) -> usize {
        self.add_node_with(role, LogOptions::default()).await
    }

    /// Attach another node whose log uses `options`; returns its index.
    pub async fn add_node_with(&mut self, role: Role, options: LogOptions) -> usize {
        let index = self.nodes.len();
        let identity = identity(index as u8 + 1);
        let peer = identity.public_key();
        let store = Arc::new(MemoryBlockStore::new());

        let log = Arc::new(Log::new(LOG_ID));
        log.open(store.clone(), identity, options).await.unwrap();

        let shared = SharedLog::open(
            log,
            self.network.peer(peer),
            SharedLogOptions {
                role,
                min_replicas: Some(self.min_replicas),
                config: self.config.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        self.nodes.push(Node {
            peer,
            store,
            shared,
        });
        index
    }

    /// Node `i`.
    pub fn node(&self, i: usize) -> &Node {
        &self.nodes[i]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Wait until every node in `indices` knows `count` replicator ranges.
    pub async fn wait_for_ranges(&self, indices: &[usize], count: usize) -> bool {
        eventually(SETTLE, || async move {
            for &i in indices {
                if self.nodes[i].shared.replicators().await.len() != count {
                    return false;
                }
            }
            true
        })
        .await
    }

    /// Wait until every node in `indices` materializes exactly `expected`.
    pub async fn wait_for_entries(&self, indices: &[usize], expected: &BTreeSet<Hash>) -> bool {
        eventually(SETTLE, || async move {
            for &i in indices {
                if self.nodes[i].entry_set().await != *expected {
                    return false;
                }
            }
            true
        })
        .await
    }

    /// Close every node.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.shared.close().await.unwrap();
        }
    }
}
