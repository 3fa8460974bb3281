//! Replication coordinator for one log.
//!
//! A [`SharedLog`] binds a [`Log`] to a pub/sub topic. It advertises the
//! local capacity, keeps the [`ReplicatorSet`] in sync with remote
//! advertisements, pushes new heads to the peers responsible for them,
//! pulls missing history from peers that announce heads, and prunes
//! entries that are held elsewhere.
//!
//! Three background loops run while the shared log is open: one handling
//! network events, one flushing debounced head announcements and, when
//! enabled, one adapting the advertised capacity to timer lag. All stop
//! through a `watch` shutdown channel on [`SharedLog::close`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reef_log::{AppendOptions, Appended, Entry, JoinOutcome, Log, LogChange};
use reef_placement::{
    CapacityStrategy, HashDomain, IntervalLagTracker, PeerCapacity, PlacementError,
    ReplicationDomain, ReplicationRange, ReplicatorSet, Selection,
};
use reef_types::{Coordinate, Hash, PeerId, Role};
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::ack::{AckRegistry, ReplicationStatus};
use crate::config::SharedLogConfig;
use crate::debounce::DebounceAccumulator;
use crate::error::SharedLogError;
use crate::fetch::{PendingRequests, RetryPolicy, RouteHints, fetch_candidates};
use crate::message::{LogMessage, deserialize_entries, serialize_entries};
use crate::network::{NetEvent, PubSub, PublishOptions, Subscription};

type Result<T> = std::result::Result<T, SharedLogError>;

/// Topic a log's peers meet on.
pub fn topic_for(log_id: &str) -> String {
    format!("reef/log/{log_id}")
}

/// Options for [`SharedLog::open`].
pub struct SharedLogOptions {
    /// Replicator or observer.
    pub role: Role,
    /// Where peers and entries land in the coordinate space.
    pub domain: Arc<dyn ReplicationDomain>,
    /// Overrides `config.replication.min_replicas`.
    pub min_replicas: Option<usize>,
    /// Tuning.
    pub config: SharedLogConfig,
    /// Lag curve for adaptive capacity. Defaults to the one described by
    /// `config.adaptive`.
    pub capacity_strategy: Option<Arc<dyn CapacityStrategy>>,
}

impl Default for SharedLogOptions {
    fn default() -> Self {
        Self::from_config(SharedLogConfig::default())
    }
}

impl SharedLogOptions {
    /// Replicator with the configured factor over the [`HashDomain`].
    pub fn from_config(config: SharedLogConfig) -> Self {
        Self {
            role: Role::Replicator {
                factor: config.replication.factor,
            },
            domain: Arc::new(HashDomain),
            min_replicas: None,
            config,
            capacity_strategy: None,
        }
    }
}

/// Wait for remote acknowledgements after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persist {
    /// Remote peers that must hold the entry.
    pub min: usize,
    /// How long to wait. Defaults to `config.persist`.
    pub timeout: Option<Duration>,
}

/// Options for [`SharedLog::append`].
#[derive(Clone, Default)]
pub struct SharedAppendOptions {
    /// Passed through to [`Log::append`].
    pub log: AppendOptions,
    /// Optional acknowledgement wait.
    pub persist: Option<Persist>,
}

/// Result of [`SharedLog::append`].
#[derive(Debug, Clone)]
pub struct SharedAppended {
    /// The new entry.
    pub entry: Entry,
    /// Heads it superseded.
    pub removed: Vec<Hash>,
    /// Coordinate of the entry.
    pub coordinate: Coordinate,
    /// Peers the entry was pushed to. Empty means it was broadcast.
    pub recipients: Vec<PeerId>,
    /// Outcome of the acknowledgement wait.
    pub status: ReplicationStatus,
}

struct Placement {
    replicators: ReplicatorSet,
    role: Role,
    /// Factor currently advertised; below the declared one under load.
    factor: f64,
    timestamp: u64,
}

impl Placement {
    fn capacity(&self, peer: PeerId) -> PeerCapacity {
        PeerCapacity {
            peer,
            factor: self.factor,
            timestamp: self.timestamp,
        }
    }

    fn select(&self, entry: &Entry, min_replicas: usize) -> (Coordinate, Selection) {
        let coordinate = self.replicators.domain().from_entry(entry);
        let selection = self
            .replicators
            .responsible_replicators(coordinate, min_replicas);
        (coordinate, selection)
    }

    fn is_responsible(&self, peer: &PeerId, entry: &Entry, min_replicas: usize) -> bool {
        self.select(entry, min_replicas).1.peers.contains(peer)
    }

    fn ranges_by_owner(&self) -> HashMap<PeerId, ReplicationRange> {
        self.replicators
            .ranges()
            .iter()
            .map(|r| (r.owner, *r))
            .collect()
    }
}

/// Advertisement version: wall-clock millis, strictly increasing.
fn next_timestamp(previous: u64) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    now.max(previous.saturating_add(1))
}

struct Shared {
    log: Arc<Log>,
    network: Arc<dyn PubSub>,
    topic: String,
    local: PeerId,
    min_replicas: usize,
    config: SharedLogConfig,
    placement: RwLock<Placement>,
    acks: AckRegistry,
    requests: PendingRequests,
    hints: std::sync::Mutex<RouteHints>,
    incoming: std::sync::Mutex<DebounceAccumulator<PeerId, Entry>>,
    open: AtomicBool,
}

/// A [`Log`] replicated across the peers of a topic.
pub struct SharedLog {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SharedLog {
    /// Start coordinating `log`, which must already be open.
    ///
    /// Subscribes to the log's topic, advertises the local role, asks the
    /// other subscribers for theirs and spawns the background loops.
    pub async fn open(
        log: Arc<Log>,
        network: Arc<dyn PubSub>,
        options: SharedLogOptions,
    ) -> Result<Self> {
        if !log.is_open().await {
            return Err(SharedLogError::Closed);
        }

        let config = options.config;
        let topic = topic_for(log.id());
        let local = network.local_peer();
        let min_replicas = options
            .min_replicas
            .unwrap_or(config.replication.min_replicas)
            .max(1);

        let mut placement = Placement {
            replicators: ReplicatorSet::new(options.domain, config.replication.epoch),
            role: options.role,
            factor: options.role.factor(),
            timestamp: next_timestamp(0),
        };
        let capacity = placement.capacity(local);
        placement.replicators.advertise(capacity)?;

        let subscription = network.subscribe(&topic).await?;

        let shared = Arc::new(Shared {
            incoming: std::sync::Mutex::new(DebounceAccumulator::new(
                config.sync.debounce(),
                config.sync.max_debounce(),
            )),
            hints: std::sync::Mutex::new(RouteHints::new(config.sync.route_hint_capacity)),
            log,
            network,
            topic,
            local,
            min_replicas,
            placement: RwLock::new(placement),
            acks: AckRegistry::new(config.persist.ack_capacity),
            requests: PendingRequests::default(),
            open: AtomicBool::new(true),
            config,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            tokio::spawn(message_loop(
                shared.clone(),
                subscription,
                shutdown_rx.clone(),
            )),
            tokio::spawn(flush_loop(shared.clone(), shutdown_rx.clone())),
        ];
        if shared.config.adaptive.enabled && options.role.is_replicator() {
            let strategy: Arc<dyn CapacityStrategy> = match options.capacity_strategy {
                Some(strategy) => strategy,
                None => Arc::new(shared.config.adaptive.backoff()),
            };
            tasks.push(tokio::spawn(adaptive_loop(
                shared.clone(),
                strategy,
                shutdown_rx,
            )));
        }

        shared.advertise(None).await;
        shared
            .send(&LogMessage::RequestReplicationInfo, None)
            .await;
        if let Err(e) = shared.network.request_subscribers(&shared.topic).await {
            warn!(topic = %shared.topic, error = %e, "subscriber refresh failed");
        }

        info!(
            topic = %shared.topic,
            peer = %local.short(),
            role = ?options.role,
            min_replicas,
            "shared log opened"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    /// Stop the background loops, unsubscribe and close the log. Closing a
    /// closed shared log is a no-op.
    pub async fn close(&self) -> Result<()> {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_tasks().await;
        self.shared.log.close().await?;
        info!(topic = %self.shared.topic, "shared log closed");
        Ok(())
    }

    /// Close and delete the log's persisted state.
    pub async fn destroy(&self) -> Result<()> {
        self.close().await?;
        self.shared.log.destroy().await?;
        Ok(())
    }

    async fn stop_tasks(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            // Joined entries are never rolled back, so cutting a flush short
            // only delays convergence.
            task.abort();
            let _ = task.await;
        }
    }

    /// Whether the shared log is open.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(SharedLogError::Closed)
        }
    }

    /// The coordinated log.
    pub fn log(&self) -> &Arc<Log> {
        &self.shared.log
    }

    /// Topic this shared log publishes on.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Local peer identity on the network.
    pub fn local_peer(&self) -> PeerId {
        self.shared.local
    }

    /// Copies each entry should have.
    pub fn min_replicas(&self) -> usize {
        self.shared.min_replicas
    }

    /// Changes to the underlying log, local and remote.
    pub fn subscribe(&self) -> broadcast::Receiver<LogChange> {
        self.shared.log.subscribe()
    }

    /// Append locally and push the entry to the peers responsible for it.
    ///
    /// With `persist.min > 0`, waits for that many remote acknowledgements;
    /// see [`SharedLog::wait_for_replicators`].
    pub async fn append(&self, data: Vec<u8>, options: SharedAppendOptions) -> Result<SharedAppended> {
        self.ensure_open()?;
        let Appended { entry, removed } = self.shared.log.append(data, options.log).await?;

        let (coordinate, recipients) = self.shared.recipients_for(&entry).await;
        let message = LogMessage::heads(std::slice::from_ref(&entry))?;
        let to = (!recipients.is_empty()).then(|| recipients.clone());
        debug!(
            hash = %entry.hash(),
            coordinate,
            recipients = recipients.len(),
            "announcing appended entry"
        );
        self.shared.send(&message, to).await;

        let status = match options.persist {
            Some(persist) if persist.min > 0 => {
                let timeout = persist
                    .timeout
                    .unwrap_or_else(|| self.shared.config.persist.ack_timeout());
                self.wait_for_replicators(&entry.hash(), persist.min, timeout)
                    .await?
            }
            _ => ReplicationStatus::NotRequested,
        };

        Ok(SharedAppended {
            entry,
            removed,
            coordinate,
            recipients,
            status,
        })
    }

    /// Wait until `min` remote peers acknowledge `hash`.
    ///
    /// Fails with [`SharedLogError::NoPeers`] right away when nobody else
    /// subscribes to the topic. Running out of time is not an error: the
    /// entry stays durable locally and the status says how far it got.
    pub async fn wait_for_replicators(
        &self,
        hash: &Hash,
        min: usize,
        timeout: Duration,
    ) -> Result<ReplicationStatus> {
        self.ensure_open()?;
        let subscribers = self
            .shared
            .network
            .get_subscribers(&self.shared.topic)
            .await?;
        if subscribers.iter().all(|p| *p == self.shared.local) {
            return Err(SharedLogError::NoPeers {
                topic: self.shared.topic.clone(),
            });
        }

        let status = self.shared.acks.wait_for(hash, min, timeout).await;
        if let ReplicationStatus::TimedOut {
            acknowledged,
            required,
        } = status
        {
            warn!(
                %hash,
                acknowledged,
                required,
                "replication not confirmed in time; entry is durable locally"
            );
        }
        Ok(status)
    }

    /// Remote peers known to hold `hash`.
    pub fn acknowledgements(&self, hash: &Hash) -> Vec<PeerId> {
        self.shared.acks.peers(hash)
    }

    /// Drop entries this peer is not responsible for and that enough remote
    /// peers hold. Heads are kept. Returns the pruned hashes.
    pub async fn prune(&self) -> Result<Vec<Hash>> {
        self.ensure_open()?;
        self.shared.prune().await
    }

    /// Re-attempt entries stranded in the block store, then re-announce the
    /// heads.
    pub async fn recover(&self) -> Result<JoinOutcome> {
        self.ensure_open()?;
        let outcome = self.shared.log.recover().await?;
        info!(
            topic = %self.shared.topic,
            added = outcome.added.len(),
            rejected = outcome.rejected.len(),
            "recovered entries"
        );
        self.shared.announce_heads(None).await;
        Ok(outcome)
    }

    /// Current ranges, in layout order.
    pub async fn replicators(&self) -> Vec<ReplicationRange> {
        self.shared.placement.read().await.replicators.ranges().to_vec()
    }

    /// The local peer's range; `None` for observers.
    pub async fn my_range(&self) -> Option<ReplicationRange> {
        self.shared
            .placement
            .read()
            .await
            .replicators
            .range_of(&self.shared.local)
            .copied()
    }

    /// The declared role.
    pub async fn role(&self) -> Role {
        self.shared.placement.read().await.role
    }

    /// Factor currently advertised.
    pub async fn factor(&self) -> f64 {
        self.shared.placement.read().await.factor
    }

    /// Peers that should hold `entry`.
    pub async fn responsible_for(&self, entry: &Entry) -> Selection {
        self.shared
            .placement
            .read()
            .await
            .select(entry, self.shared.min_replicas)
            .1
    }

    /// Switch role, re-advertise and prune whatever the new range no
    /// longer covers.
    pub async fn update_role(&self, role: Role) -> Result<()> {
        self.ensure_open()?;
        info!(topic = %self.shared.topic, ?role, "updating role");
        self.shared.set_capacity(Some(role), role.factor()).await
    }
}

impl Drop for SharedLog {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Shared {
    /// Best-effort publish on the log's topic. Failures are logged.
    async fn send(&self, message: &LogMessage, to: Option<Vec<PeerId>>) {
        if to.as_ref().is_some_and(Vec::is_empty) {
            return;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        let options = PublishOptions {
            topics: vec![self.topic.clone()],
            to,
        };
        if let Err(e) = self.network.publish(frame, options).await {
            warn!(kind = message.kind(), error = %e, "publish failed");
        }
    }

    async fn advertise(&self, to: Option<Vec<PeerId>>) {
        let capacity = self.placement.read().await.capacity(self.local);
        self.send(&LogMessage::Replicating(capacity), to).await;
    }

    async fn announce_heads(&self, to: Option<Vec<PeerId>>) {
        let heads = match self.log.heads().await {
            Ok(heads) => heads,
            Err(e) => {
                warn!(error = %e, "cannot read heads to announce");
                return;
            }
        };
        if heads.is_empty() {
            return;
        }
        match LogMessage::heads(&heads) {
            Ok(message) => self.send(&message, to).await,
            Err(e) => warn!(error = %e, "cannot serialize heads"),
        }
    }

    async fn recipients_for(&self, entry: &Entry) -> (Coordinate, Vec<PeerId>) {
        let placement = self.placement.read().await;
        let (coordinate, selection) = placement.select(entry, self.min_replicas);

        let mut recipients = selection.peers;
        if let Some(range) = placement.replicators.range_of(&self.local) {
            for peer in placement.replicators.discovery_group(range) {
                if !recipients.contains(&peer) {
                    recipients.push(peer);
                }
            }
        }
        recipients.retain(|p| *p != self.local);
        (coordinate, recipients)
    }

    async fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::Message { from, data } => {
                if from == self.local {
                    return;
                }
                match LogMessage::decode(&data) {
                    Ok(message) => {
                        let kind = message.kind();
                        trace!(peer = %from.short(), kind, "received message");
                        if let Err(e) = self.handle_message(from, message).await {
                            warn!(peer = %from.short(), kind, error = %e, "failed to handle message");
                        }
                    }
                    Err(e) => {
                        warn!(peer = %from.short(), error = %e, "dropping undecodable message");
                    }
                }
            }
            NetEvent::PeerJoined(peer) => {
                debug!(peer = %peer.short(), "peer joined");
                self.advertise(Some(vec![peer])).await;
                self.announce_heads(Some(vec![peer])).await;
            }
            NetEvent::PeerLeft(peer) => {
                debug!(peer = %peer.short(), "peer left");
                self.acks.remove_peer(&peer);
                self.hints.lock().expect("lock poisoned").remove_peer(&peer);
                if let Err(e) = self
                    .update_placement(false, |p| Ok(p.replicators.remove(&peer)))
                    .await
                {
                    warn!(peer = %peer.short(), error = %e, "failed to rebalance after departure");
                }
            }
        }
    }

    async fn handle_message(&self, from: PeerId, message: LogMessage) -> Result<()> {
        match message {
            LogMessage::Heads { entries } => {
                let (entries, invalid) = deserialize_entries(&entries);
                if invalid > 0 {
                    warn!(peer = %from.short(), invalid, "dropping malformed announced entries");
                }
                {
                    let mut hints = self.hints.lock().expect("lock poisoned");
                    for entry in &entries {
                        hints.add(entry.hash(), from);
                        for parent in entry.next() {
                            hints.add(*parent, from);
                        }
                    }
                }
                self.incoming
                    .lock()
                    .expect("lock poisoned")
                    .push(from, entries, Instant::now());
            }
            LogMessage::EntryRequest {
                request_id,
                hashes,
                max_depth,
            } => {
                let depth = max_depth.min(self.config.sync.max_ancestor_depth) as usize;
                let found = self
                    .log
                    .fetch_with_ancestors(&hashes, depth, self.config.sync.max_response_entries)
                    .await?;
                debug!(
                    peer = %from.short(),
                    request_id,
                    wanted = hashes.len(),
                    found = found.len(),
                    "serving entry request"
                );
                let response = LogMessage::EntryResponse {
                    request_id,
                    entries: serialize_entries(&found)?,
                };
                self.send(&response, Some(vec![from])).await;
            }
            LogMessage::EntryResponse {
                request_id,
                entries,
            } => {
                let (entries, invalid) = deserialize_entries(&entries);
                if invalid > 0 {
                    warn!(peer = %from.short(), invalid, "dropping malformed fetched entries");
                }
                if !self.requests.complete(request_id, entries) {
                    trace!(peer = %from.short(), request_id, "late or unsolicited response");
                }
            }
            LogMessage::ReplicationAck { hashes } => {
                let mut hints = self.hints.lock().expect("lock poisoned");
                for hash in hashes {
                    self.acks.record(hash, from);
                    hints.add(hash, from);
                }
            }
            LogMessage::Replicating(capacity) => {
                if capacity.peer != from {
                    warn!(
                        peer = %from.short(),
                        claimed = %capacity.peer.short(),
                        "ignoring advertisement for another peer"
                    );
                    return Ok(());
                }
                self.update_placement(false, |p| p.replicators.advertise(capacity))
                    .await?;
            }
            LogMessage::RequestReplicationInfo => {
                self.advertise(Some(vec![from])).await;
            }
        }
        Ok(())
    }

    /// Apply a placement change and react to it: re-advertise if asked,
    /// push heads to peers whose ranges moved, and prune if the local range
    /// shrank.
    async fn update_placement<F>(&self, readvertise: bool, change: F) -> Result<bool>
    where
        F: FnOnce(&mut Placement) -> std::result::Result<bool, PlacementError>,
    {
        let (moved, shrank) = {
            let mut placement = self.placement.write().await;
            let before = placement.ranges_by_owner();
            if !change(&mut placement)? {
                return Ok(false);
            }
            let after = placement.ranges_by_owner();

            let moved: Vec<PeerId> = after
                .iter()
                .filter(|(peer, range)| **peer != self.local && before.get(*peer) != Some(*range))
                .map(|(peer, _)| *peer)
                .collect();
            let shrank = match (before.get(&self.local), after.get(&self.local)) {
                (Some(old), Some(new)) => !new.contains(old),
                (Some(_), None) => true,
                _ => false,
            };
            (moved, shrank)
        };

        if readvertise {
            self.advertise(None).await;
        }
        if !moved.is_empty() {
            self.announce_heads(Some(moved)).await;
        }
        if shrank {
            debug!(topic = %self.topic, "local range shrank; pruning");
            self.prune().await?;
        }
        Ok(true)
    }

    async fn set_capacity(&self, role: Option<Role>, factor: f64) -> Result<()> {
        let local = self.local;
        self.update_placement(true, |p| {
            if let Some(role) = role {
                p.role = role;
            }
            p.factor = factor;
            p.timestamp = next_timestamp(p.timestamp);
            let capacity = p.capacity(local);
            p.replicators.advertise(capacity)
        })
        .await?;
        Ok(())
    }

    async fn prune(&self) -> Result<Vec<Hash>> {
        let placement = self.placement.read().await;
        let pruned = self
            .log
            .prune(|entry| {
                !placement.is_responsible(&self.local, entry, self.min_replicas)
                    && self.acks.count(&entry.hash()) >= self.min_replicas
            })
            .await?;
        drop(placement);

        for hash in &pruned {
            self.acks.forget(hash);
        }
        Ok(pruned)
    }

    /// Join a flushed batch of announced heads, fetching whatever history
    /// is missing, and acknowledge what is now held.
    async fn process_heads(&self, from: PeerId, entries: Vec<Entry>) -> Result<()> {
        let mut seen = HashSet::new();
        let wanted: Vec<Entry> = {
            let placement = self.placement.read().await;
            entries
                .into_iter()
                .filter(|e| seen.insert(e.hash()))
                .filter(|e| placement.is_responsible(&self.local, e, self.min_replicas))
                .collect()
        };
        if wanted.is_empty() {
            trace!(peer = %from.short(), "no announced entries in our range");
            return Ok(());
        }

        let announced: Vec<Hash> = wanted.iter().map(Entry::hash).collect();
        let outcome = self.log.join(wanted).await?;
        if !outcome.rejected.is_empty() {
            warn!(
                peer = %from.short(),
                rejected = outcome.rejected.len(),
                "announced entries rejected"
            );
        }
        let mut added = outcome.added_hashes();
        let mut missing = outcome.missing;

        let mut rounds = 0;
        while !missing.is_empty() && rounds < self.config.sync.max_fetch_rounds {
            rounds += 1;
            let fetched = self.fetch(&missing, Some(from)).await;
            if fetched.is_empty() {
                warn!(
                    peer = %from.short(),
                    missing = missing.len(),
                    "could not fetch missing ancestors; gap left open"
                );
                break;
            }
            let next = self.log.join(fetched).await?;
            added.extend(next.added_hashes());
            missing = next.missing;
        }

        let mut ack = added;
        for hash in announced {
            if !ack.contains(&hash) && self.log.has(&hash).await? {
                ack.push(hash);
            }
        }
        if !ack.is_empty() {
            debug!(peer = %from.short(), count = ack.len(), "acknowledging entries");
            self.send(&LogMessage::ReplicationAck { hashes: ack }, None)
                .await;
        }
        Ok(())
    }

    /// Ask peers for `missing` (and their ancestors), the announcer first,
    /// then hinted peers in turn. Returns nothing if every attempt fails.
    async fn fetch(&self, missing: &[Hash], preferred: Option<PeerId>) -> Vec<Entry> {
        let policy = RetryPolicy::from(&self.config.sync);
        let hinted = self.hints.lock().expect("lock poisoned").lookup(missing);
        let candidates = fetch_candidates(preferred, hinted, self.local);
        if candidates.is_empty() {
            return Vec::new();
        }

        for attempt in 0..policy.attempts() {
            let peer = candidates[attempt as usize % candidates.len()];
            let (request_id, response) = self.requests.register();
            let request = LogMessage::EntryRequest {
                request_id,
                hashes: missing.to_vec(),
                max_depth: self.config.sync.max_ancestor_depth,
            };
            self.send(&request, Some(vec![peer])).await;

            match tokio::time::timeout(policy.timeout, response).await {
                Ok(Ok(entries)) if !entries.is_empty() => {
                    debug!(peer = %peer.short(), attempt, count = entries.len(), "fetched entries");
                    return entries;
                }
                Ok(_) => debug!(peer = %peer.short(), attempt, "peer had none of the wanted entries"),
                Err(_) => {
                    self.requests.cancel(request_id);
                    debug!(peer = %peer.short(), attempt, "fetch attempt timed out");
                }
            }

            if attempt + 1 < policy.attempts() {
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }
        Vec::new()
    }
}

async fn message_loop(
    shared: Arc<Shared>,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = subscription.recv() => match event {
                Some(event) => shared.handle_event(event).await,
                None => {
                    warn!(topic = %shared.topic, "subscription ended");
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
    subscription.close();
}

async fn flush_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let period = (shared.config.sync.debounce() / 2).max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let ready = shared
                    .incoming
                    .lock()
                    .expect("lock poisoned")
                    .take_ready(Instant::now());
                for (peer, entries) in ready {
                    if let Err(e) = shared.process_heads(peer, entries).await {
                        warn!(peer = %peer.short(), error = %e, "failed to process announced heads");
                    }
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

async fn adaptive_loop(
    shared: Arc<Shared>,
    strategy: Arc<dyn CapacityStrategy>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let settings = shared.config.adaptive.clone();
    let interval = settings.interval();
    let mut tracker = IntervalLagTracker::new(settings.window());
    let mut last = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => break,
        }
        let now = std::time::Instant::now();
        tracker.record(interval, now - last);
        last = now;
        let lag = tracker.average();

        let (current, declared, replicating) = {
            let placement = shared.placement.read().await;
            (placement.factor, placement.role.factor(), placement.role.is_replicator())
        };
        if !replicating {
            continue;
        }
        let next = strategy.next_factor(current, declared, lag);
        if (next - current).abs() >= settings.min_change {
            debug!(
                lag_ms = lag.as_millis() as u64,
                from = current,
                to = next,
                "adapting replication factor"
            );
            if let Err(e) = shared.set_capacity(None, next).await {
                warn!(error = %e, "failed to re-advertise capacity");
            }
        }
    }
}
