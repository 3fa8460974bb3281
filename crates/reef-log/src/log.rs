//! The log: a hash-linked, causally ordered CRDT over signed entries.
//!
//! Entry bytes live in a shared [`BlockStore`]; per-log metadata lives in
//! an [`Indexer`]; the current frontier is cached in a [`HeadsIndex`].
//! Every mutation runs under a single async mutex so head updates never
//! interleave.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use reef_store::{BlockStore, StoreError};
use reef_types::{Hash, PeerId};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, trace, warn};

use crate::clock::LamportClock;
use crate::dag::topological_order;
use crate::entry::{CreateEntry, Entry, EntryCipher, EntryType, Seal};
use crate::error::LogError;
use crate::heads::HeadsIndex;
use crate::identity::Identity;
use crate::index::{EntryIndex, IndexQuery, IndexedEntry, Indexer};
use crate::pending::PendingEntries;

type Result<T> = std::result::Result<T, LogError>;

/// Append policy: returns `false` to reject an entry.
pub type CanAppend = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Collaborators and policy bound at [`Log::open`].
pub struct LogOptions {
    /// Per-log index.
    pub indexer: Arc<dyn Indexer>,
    /// Policy applied to every appended and joined entry.
    pub can_append: Option<CanAppend>,
    /// Cipher for sealed payloads.
    pub cipher: Option<Arc<dyn EntryCipher>>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            indexer: Arc::new(EntryIndex::in_memory()),
            can_append: None,
            cipher: None,
        }
    }
}

/// Options for a single [`Log::append`].
#[derive(Clone, Default)]
pub struct AppendOptions {
    /// Metadata carried in the clear.
    pub meta_data: Option<Vec<u8>>,
    /// Explicit parents. `None` links the current heads; `Some(vec![])`
    /// starts a new branch with a fresh gid.
    pub next: Option<Vec<Hash>>,
    /// Append or cut.
    pub kind: EntryType,
    /// Extra policy for this append only.
    pub can_append: Option<CanAppend>,
    /// Seal the payload for these recipients with the log's cipher.
    pub seal: Option<Vec<PeerId>>,
    /// Co-signers in addition to the log identity.
    pub signers: Vec<Arc<dyn Identity>>,
}

/// Options for [`Log::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Forget the materialized set first, emitting `removed` for it.
    pub reset: bool,
    /// Heads to walk from. Defaults to the current heads.
    pub heads: Option<Vec<Hash>>,
}

/// Result of [`Log::append`].
#[derive(Debug, Clone)]
pub struct Appended {
    /// The new entry.
    pub entry: Entry,
    /// Heads it superseded.
    pub removed: Vec<Hash>,
}

/// Result of [`Log::join`], [`Log::load`] and [`Log::recover`].
#[derive(Debug, Clone, Default)]
pub struct JoinOutcome {
    /// Entries materialized by this call, parents first.
    pub added: Vec<Entry>,
    /// Parents that are known nowhere locally and must be fetched.
    pub missing: Vec<Hash>,
    /// Entries that failed verification or were refused by policy.
    pub rejected: Vec<Hash>,
}

impl JoinOutcome {
    /// Hashes of the added entries.
    pub fn added_hashes(&self) -> Vec<Hash> {
        self.added.iter().map(|e| e.hash()).collect()
    }
}

/// Change notification: what one operation added and removed.
#[derive(Debug, Clone, Default)]
pub struct LogChange {
    /// Newly materialized entries.
    pub added: Vec<Entry>,
    /// Entries that stopped being heads, were pruned, or were dropped.
    pub removed: Vec<Hash>,
}

impl LogChange {
    fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct OpenState {
    store: Arc<dyn BlockStore>,
    indexer: Arc<dyn Indexer>,
    identity: Arc<dyn Identity>,
    can_append: Option<CanAppend>,
    cipher: Option<Arc<dyn EntryCipher>>,
    heads: HeadsIndex,
    pending: PendingEntries,
    clock: LamportClock,
}

#[derive(Default)]
struct Inner {
    state: Option<OpenState>,
    /// Collaborators of the last open, kept so `destroy` works when closed.
    /// The indexer is released while the log is closed.
    last: Option<(Arc<dyn BlockStore>, Arc<dyn Indexer>)>,
}

impl Inner {
    fn open_ref(&self) -> Result<&OpenState> {
        self.state.as_ref().ok_or(LogError::Closed)
    }

    fn open_mut(&mut self) -> Result<&mut OpenState> {
        self.state.as_mut().ok_or(LogError::Closed)
    }
}

/// An append-only, hash-linked, causally ordered log.
///
/// Lifecycle is `Closed -> Open -> Closed`. Every operation except
/// [`Log::open`], [`Log::close`] and [`Log::destroy`] fails with
/// [`LogError::Closed`] when the log is not open.
pub struct Log {
    id: String,
    inner: Mutex<Inner>,
    changes: broadcast::Sender<LogChange>,
}

impl Log {
    /// Create a closed log with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Log id (used for topic naming).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Receive a [`LogChange`] for every mutation. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<LogChange> {
        self.changes.subscribe()
    }

    fn emit(&self, change: LogChange) {
        if !change.is_empty() {
            let _ = self.changes.send(change);
        }
    }

    /// Bind collaborators and replay persisted heads.
    ///
    /// With an append policy, every persisted entry is checked against it
    /// first. Refused entries and their descendants stop being materialized
    /// and wait for [`Log::recover`].
    pub async fn open(
        &self,
        store: Arc<dyn BlockStore>,
        identity: Arc<dyn Identity>,
        options: LogOptions,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_some() {
            return Err(LogError::AlreadyOpen);
        }

        if let Some(policy) = &options.can_append {
            let demoted =
                demote_refused(store.as_ref(), options.indexer.as_ref(), policy).await?;
            if demoted > 0 {
                info!(log = %self.id, demoted, "persisted entries refused by append policy");
            }
        }

        let mut heads = HeadsIndex::new();
        for row in options.indexer.query(&IndexQuery::Heads)? {
            match read_entry(store.as_ref(), &row.hash).await? {
                Some(entry) => {
                    heads.insert(entry);
                }
                None => warn!(log = %self.id, hash = %row.hash, "indexed head has no block"),
            }
        }

        let clock = LamportClock::new(heads.max_timestamp());
        info!(log = %self.id, heads = heads.len(), "log opened");

        inner.last = Some((store.clone(), options.indexer.clone()));
        inner.state = Some(OpenState {
            store,
            indexer: options.indexer,
            identity,
            can_append: options.can_append,
            cipher: options.cipher,
            heads,
            pending: PendingEntries::default(),
            clock,
        });
        Ok(())
    }

    /// Release in-memory state and the indexer's resources. Closing a
    /// closed log is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(state) = inner.state.take() {
            state.indexer.release()?;
            info!(log = %self.id, "log closed");
        }
        Ok(())
    }

    /// Whether the log is open.
    pub async fn is_open(&self) -> bool {
        self.inner.lock().await.state.is_some()
    }

    /// Public key entries are signed with.
    pub async fn public_key(&self) -> Result<PeerId> {
        Ok(self.inner.lock().await.open_ref()?.identity.public_key())
    }

    /// Replace the global append policy.
    pub async fn set_can_append(&self, policy: Option<CanAppend>) -> Result<()> {
        self.inner.lock().await.open_mut()?.can_append = policy;
        Ok(())
    }

    /// Create, sign and persist a new entry on top of the heads.
    pub async fn append(&self, data: Vec<u8>, options: AppendOptions) -> Result<Appended> {
        let mut inner = self.inner.lock().await;
        let state = inner.open_mut()?;

        let parents = match &options.next {
            None => state.heads.entries(),
            Some(hashes) => {
                let mut parents = Vec::with_capacity(hashes.len());
                for hash in hashes {
                    match state.materialized(hash).await? {
                        Some(entry) => parents.push(entry),
                        None => {
                            return Err(LogError::Validation(format!("unknown parent {hash}")));
                        }
                    }
                }
                parents
            }
        };

        let mut signers: Vec<&dyn Identity> = vec![state.identity.as_ref()];
        signers.extend(options.signers.iter().map(|s| s.as_ref()));

        let seal = match options.seal {
            Some(recipients) => {
                let Some(cipher) = state.cipher.as_ref() else {
                    return Err(LogError::Validation(
                        "sealed append requires a cipher".into(),
                    ));
                };
                Some(Seal {
                    cipher: cipher.as_ref(),
                    recipients,
                })
            }
            None => None,
        };

        let entry = Entry::create(CreateEntry {
            data,
            meta_data: options.meta_data,
            next: &parents,
            kind: options.kind,
            local_time: state.clock.current(),
            signers: &signers,
            seal,
        })?;

        let local_ok = options.can_append.as_ref().is_none_or(|f| f(&entry));
        if !local_ok || !state.allows(&entry) {
            debug!(log = %self.id, hash = %entry.hash(), "append rejected by policy");
            return Err(LogError::Validation("entry rejected by append policy".into()));
        }

        let removed = state.insert(&entry).await?;
        debug!(
            log = %self.id,
            hash = %entry.hash(),
            timestamp = entry.clock().timestamp,
            superseded = removed.len(),
            "appended entry"
        );

        drop(inner);
        self.emit(LogChange {
            added: vec![entry.clone()],
            removed: removed.clone(),
        });
        Ok(Appended { entry, removed })
    }

    /// Merge foreign entries.
    ///
    /// Invalid entries are dropped and reported in `rejected`. Entries whose
    /// parents cannot be resolved locally are parked until a later join
    /// supplies them; the unresolved parents are reported in `missing`.
    pub async fn join(&self, entries: Vec<Entry>) -> Result<JoinOutcome> {
        let mut inner = self.inner.lock().await;
        let state = inner.open_mut()?;
        let (outcome, removed) = state.join(entries).await?;
        drop(inner);

        if !outcome.added.is_empty() || !outcome.missing.is_empty() {
            debug!(
                log = %self.id,
                added = outcome.added.len(),
                missing = outcome.missing.len(),
                rejected = outcome.rejected.len(),
                "joined entries"
            );
        }
        self.emit(LogChange {
            added: outcome.added.clone(),
            removed,
        });
        Ok(outcome)
    }

    /// Rebuild the materialized set by walking ancestry from a head set.
    pub async fn load(&self, options: LoadOptions) -> Result<JoinOutcome> {
        let mut inner = self.inner.lock().await;
        let state = inner.open_mut()?;

        let targets = match options.heads {
            Some(heads) => heads,
            None => state.heads.hashes().to_vec(),
        };

        let mut dropped = Vec::new();
        if options.reset {
            for row in state.indexer.query(&IndexQuery::Materialized)? {
                state.indexer.delete(&row.hash)?;
                dropped.push(row.hash);
            }
            state.heads.clear();
            state.pending.clear();
        }

        let mut entries = Vec::with_capacity(targets.len());
        for hash in &targets {
            match read_entry(state.store.as_ref(), hash).await? {
                Some(entry) => entries.push(entry),
                None => warn!(log = %self.id, %hash, "load target has no block"),
            }
        }

        let (outcome, removed) = state.join(entries).await?;
        drop(inner);

        if !dropped.is_empty() {
            self.emit(LogChange {
                added: Vec::new(),
                removed: dropped,
            });
        }
        self.emit(LogChange {
            added: outcome.added.clone(),
            removed,
        });
        Ok(outcome)
    }

    /// Prune non-head entries.
    ///
    /// An entry is pruned when `predicate` accepts it (its replication is
    /// confirmed elsewhere) or when it is an ancestor of a `Cut` entry. Its
    /// block is deleted; a shallow index row stays so descendants remain
    /// causally complete. Returns the pruned hashes.
    pub async fn prune<F>(&self, predicate: F) -> Result<Vec<Hash>>
    where
        F: Fn(&Entry) -> bool,
    {
        let mut inner = self.inner.lock().await;
        let state = inner.open_mut()?;

        let rows = state.indexer.query(&IndexQuery::All)?;
        let by_hash: HashMap<Hash, &IndexedEntry> = rows.iter().map(|r| (r.hash, r)).collect();

        let mut cut_ancestors = HashSet::new();
        for row in rows.iter().filter(|r| r.kind == EntryType::Cut && !r.pruned) {
            let mut stack = row.next.clone();
            while let Some(hash) = stack.pop() {
                if let Some(parent) = by_hash.get(&hash)
                    && cut_ancestors.insert(hash)
                {
                    stack.extend(parent.next.iter().copied());
                }
            }
        }

        let mut candidates: Vec<&IndexedEntry> =
            rows.iter().filter(|r| !r.head && !r.pruned).collect();
        candidates.sort_by(|a, b| a.clock.cmp(&b.clock));

        let mut pruned = Vec::new();
        for row in candidates {
            let Some(entry) = read_entry(state.store.as_ref(), &row.hash).await? else {
                warn!(log = %self.id, hash = %row.hash, "materialized entry has no block");
                continue;
            };
            if cut_ancestors.contains(&row.hash) || predicate(&entry) {
                state.store.rm(&row.hash).await?;
                let mut shallow = row.clone();
                shallow.pruned = true;
                state.indexer.put(&shallow)?;
                pruned.push(row.hash);
            }
        }
        drop(inner);

        if !pruned.is_empty() {
            info!(log = %self.id, count = pruned.len(), "pruned entries");
        }
        self.emit(LogChange {
            added: Vec::new(),
            removed: pruned.clone(),
        });
        Ok(pruned)
    }

    /// Re-attempt the entries this log stored but did not materialize:
    /// those refused by the append policy and those still waiting on
    /// parents, e.g. after relaxing the policy.
    ///
    /// Blocks of other logs sharing the store are never touched;
    /// materialized entries are never duplicated.
    pub async fn recover(&self) -> Result<JoinOutcome> {
        let mut inner = self.inner.lock().await;
        let state = inner.open_mut()?;

        let mut orphans = Vec::new();
        for hash in state.indexer.stranded()? {
            if state.indexer.get(&hash)?.is_some() {
                state.indexer.remove_stranded(&hash)?;
                continue;
            }
            match read_entry(state.store.as_ref(), &hash).await {
                Ok(Some(entry)) => orphans.push(entry),
                Ok(None) => {
                    trace!(log = %self.id, %hash, "stranded entry has no block");
                    state.indexer.remove_stranded(&hash)?;
                }
                Err(e) => warn!(log = %self.id, %hash, error = %e, "unreadable stranded entry"),
            }
        }

        let candidates = orphans.len();
        let (outcome, removed) = state.join(orphans).await?;
        drop(inner);

        info!(
            log = %self.id,
            candidates,
            recovered = outcome.added.len(),
            "recover finished"
        );
        self.emit(LogChange {
            added: outcome.added.clone(),
            removed,
        });
        Ok(outcome)
    }

    /// Wipe every block and index row this log holds and close it.
    ///
    /// Valid whether the log is open or closed.
    pub async fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some((store, indexer)) = inner.last.take() else {
            return Ok(());
        };

        let rows = indexer.query(&IndexQuery::All)?;
        let mut removed = Vec::with_capacity(rows.len());
        for row in &rows {
            store.rm(&row.hash).await?;
            if !row.pruned {
                removed.push(row.hash);
            }
        }
        for hash in indexer.stranded()? {
            store.rm(&hash).await?;
        }
        indexer.clear()?;
        indexer.release()?;

        let was_open = inner.state.take().is_some();
        drop(inner);

        info!(log = %self.id, entries = rows.len(), "log destroyed");
        if was_open {
            self.emit(LogChange {
                added: Vec::new(),
                removed,
            });
        }
        Ok(())
    }

    /// Number of materialized (non-pruned) entries.
    pub async fn length(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        inner.open_ref()?.indexer.count(&IndexQuery::Materialized)
    }

    /// Current heads, newest first.
    pub async fn heads(&self) -> Result<Vec<Entry>> {
        Ok(self.inner.lock().await.open_mut()?.heads.entries())
    }

    /// Current head hashes, newest first.
    pub async fn head_hashes(&self) -> Result<Vec<Hash>> {
        Ok(self.inner.lock().await.open_mut()?.heads.hashes().to_vec())
    }

    /// A materialized entry by hash.
    pub async fn get(&self, hash: &Hash) -> Result<Option<Entry>> {
        self.inner.lock().await.open_ref()?.materialized(hash).await
    }

    /// Whether `hash` is materialized in this log.
    pub async fn has(&self, hash: &Hash) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .open_ref()?
            .indexer
            .get(hash)?
            .is_some_and(|row| !row.pruned))
    }

    /// Every known ancestor of `hash` (pruned ones included).
    pub async fn ancestors(&self, hash: &Hash) -> Result<HashSet<Hash>> {
        let inner = self.inner.lock().await;
        let state = inner.open_ref()?;

        let mut seen = HashSet::new();
        let mut stack = match state.indexer.get(hash)? {
            Some(row) => row.next,
            None => return Ok(seen),
        };
        while let Some(h) = stack.pop() {
            if seen.contains(&h) {
                continue;
            }
            if let Some(row) = state.indexer.get(&h)? {
                seen.insert(h);
                stack.extend(row.next);
            }
        }
        Ok(seen)
    }

    /// Every materialized entry in clock order.
    pub async fn entries(&self) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().await;
        let state = inner.open_ref()?;

        let mut rows = state.indexer.query(&IndexQuery::Materialized)?;
        rows.sort_by(|a, b| a.clock.cmp(&b.clock));

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(entry) = read_entry(state.store.as_ref(), &row.hash).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Materialized entries a peer whose heads are `known_heads` is missing,
    /// parents first.
    pub async fn delta(&self, known_heads: &[Hash]) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().await;
        let state = inner.open_ref()?;

        let rows = state.indexer.query(&IndexQuery::All)?;
        let by_hash: HashMap<Hash, &IndexedEntry> = rows.iter().map(|r| (r.hash, r)).collect();

        let mut known = HashSet::new();
        let mut stack: Vec<Hash> = known_heads.to_vec();
        while let Some(hash) = stack.pop() {
            if let Some(row) = by_hash.get(&hash)
                && known.insert(hash)
            {
                stack.extend(row.next.iter().copied());
            }
        }

        let mut missing = HashMap::new();
        for row in rows.iter().filter(|r| !r.pruned && !known.contains(&r.hash)) {
            if let Some(entry) = read_entry(state.store.as_ref(), &row.hash).await? {
                missing.insert(row.hash, entry);
            }
        }
        Ok(topological_order(missing))
    }

    /// Materialized entries for `wanted` plus their ancestors up to
    /// `max_depth` generations, at most `limit` entries, parents first.
    pub async fn fetch_with_ancestors(
        &self,
        wanted: &[Hash],
        max_depth: usize,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let inner = self.inner.lock().await;
        let state = inner.open_ref()?;

        let mut found = HashMap::new();
        let mut queue: VecDeque<(Hash, usize)> = wanted.iter().map(|h| (*h, 0)).collect();
        while let Some((hash, depth)) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            if found.contains_key(&hash) {
                continue;
            }
            let Some(entry) = state.materialized(&hash).await? else {
                continue;
            };
            if depth < max_depth {
                queue.extend(entry.next().iter().map(|p| (*p, depth + 1)));
            }
            found.insert(hash, entry);
        }
        Ok(topological_order(found))
    }

    /// Number of entries parked for missing parents.
    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.inner.lock().await.open_ref()?.pending.len())
    }

    /// Parents that parked entries are still waiting for.
    pub async fn missing(&self) -> Result<Vec<Hash>> {
        let inner = self.inner.lock().await;
        let state = inner.open_ref()?;
        let mut missing = Vec::new();
        for hash in state.pending.frontier() {
            if state.indexer.get(&hash)?.is_none() {
                missing.push(hash);
            }
        }
        Ok(missing)
    }

    /// Current Lamport counter.
    pub async fn clock(&self) -> Result<u64> {
        Ok(self.inner.lock().await.open_ref()?.clock.current())
    }
}

impl OpenState {
    fn allows(&self, entry: &Entry) -> bool {
        self.can_append.as_ref().is_none_or(|f| f(entry))
    }

    /// A materialized entry of this log, read from the block store.
    async fn materialized(&self, hash: &Hash) -> Result<Option<Entry>> {
        match self.indexer.get(hash)? {
            Some(row) if !row.pruned => read_entry(self.store.as_ref(), hash).await,
            _ => Ok(None),
        }
    }

    /// Keep the block of an entry that is not materialized, so a later
    /// recover can re-evaluate it.
    async fn strand(&self, entry: &Entry) -> Result<()> {
        self.store.put(Bytes::from(entry.to_bytes()?)).await?;
        self.indexer.put_stranded(&entry.hash())
    }

    /// Persist an accepted entry and make it a head. Returns the heads it
    /// superseded.
    async fn insert(&mut self, entry: &Entry) -> Result<Vec<Hash>> {
        self.store.put(Bytes::from(entry.to_bytes()?)).await?;

        let mut removed = Vec::new();
        for parent in entry.next() {
            if let Some(mut row) = self.indexer.get(parent)?
                && row.head
            {
                row.head = false;
                self.indexer.put(&row)?;
            }
            if self.heads.remove(parent).is_some() {
                removed.push(*parent);
            }
        }

        // Children are only ever inserted after their parents, so a fresh
        // entry has no materialized child yet.
        self.indexer.put(&IndexedEntry::from_entry(entry, true))?;
        self.indexer.remove_stranded(&entry.hash())?;
        self.heads.insert(entry.clone());
        self.clock.witness(entry.clock().timestamp);
        Ok(removed)
    }

    async fn join(&mut self, entries: Vec<Entry>) -> Result<(JoinOutcome, Vec<Hash>)> {
        let mut outcome = JoinOutcome::default();
        let mut candidates: HashMap<Hash, Entry> = HashMap::new();

        let parked = self.pending.drain();
        for entry in entries.into_iter().chain(parked) {
            let hash = entry.hash();
            if candidates.contains_key(&hash) || self.indexer.get(&hash)?.is_some() {
                continue;
            }
            if !entry.verify() {
                warn!(%hash, "dropping entry that failed verification");
                outcome.rejected.push(hash);
                continue;
            }
            candidates.insert(hash, entry);
        }

        // Pull ancestry that is already in the block store.
        let mut missing = BTreeSet::new();
        let mut queue: VecDeque<Hash> = candidates
            .values()
            .flat_map(|e| e.next().iter().copied())
            .collect();
        while let Some(parent) = queue.pop_front() {
            if candidates.contains_key(&parent)
                || missing.contains(&parent)
                || self.indexer.get(&parent)?.is_some()
            {
                continue;
            }
            match read_entry(self.store.as_ref(), &parent).await {
                Ok(Some(entry)) if entry.verify() => {
                    queue.extend(entry.next().iter().copied());
                    candidates.insert(parent, entry);
                }
                Ok(Some(_)) => {
                    warn!(hash = %parent, "stored ancestor failed verification");
                    missing.insert(parent);
                }
                Ok(None) => {
                    missing.insert(parent);
                }
                Err(e) => {
                    warn!(hash = %parent, error = %e, "could not read ancestor");
                    missing.insert(parent);
                }
            }
        }

        let mut accepted = HashSet::new();
        let mut removed = Vec::new();
        for entry in topological_order(candidates) {
            let hash = entry.hash();

            let mut complete = true;
            for parent in entry.next() {
                if !accepted.contains(parent) && self.indexer.get(parent)?.is_none() {
                    complete = false;
                    break;
                }
            }
            if !complete {
                self.strand(&entry).await?;
                self.pending.insert(entry);
                continue;
            }

            if !self.allows(&entry) {
                debug!(%hash, "entry rejected by append policy");
                self.strand(&entry).await?;
                outcome.rejected.push(hash);
                continue;
            }

            for superseded in self.insert(&entry).await? {
                if !accepted.contains(&superseded) {
                    removed.push(superseded);
                }
            }
            accepted.insert(hash);
            outcome.added.push(entry);
        }

        outcome.missing = missing.into_iter().collect();
        Ok((outcome, removed))
    }
}

/// Check every materialized row against `policy`, parents first. Refused
/// rows and their descendants lose their rows and become stranded; heads
/// are recomputed over what remains. Returns how many rows were demoted.
async fn demote_refused(
    store: &dyn BlockStore,
    indexer: &dyn Indexer,
    policy: &CanAppend,
) -> Result<usize> {
    let mut rows = indexer.query(&IndexQuery::Materialized)?;
    rows.sort_by(|a, b| a.clock.cmp(&b.clock));

    let mut refused = HashSet::new();
    for row in &rows {
        if row.next.iter().any(|p| refused.contains(p)) {
            refused.insert(row.hash);
            continue;
        }
        match read_entry(store, &row.hash).await? {
            Some(entry) if !policy(&entry) => {
                refused.insert(row.hash);
            }
            Some(_) => {}
            None => warn!(hash = %row.hash, "materialized entry has no block"),
        }
    }
    if refused.is_empty() {
        return Ok(0);
    }

    for hash in &refused {
        indexer.delete(hash)?;
        indexer.put_stranded(hash)?;
    }

    let remaining = indexer.query(&IndexQuery::All)?;
    let referenced: HashSet<Hash> = remaining
        .iter()
        .flat_map(|r| r.next.iter().copied())
        .collect();
    for mut row in remaining {
        let head = !row.pruned && !referenced.contains(&row.hash);
        if row.head != head {
            row.head = head;
            indexer.put(&row)?;
        }
    }
    Ok(refused.len())
}

/// Read and decode an entry block, checking its address.
async fn read_entry(store: &dyn BlockStore, hash: &Hash) -> Result<Option<Entry>> {
    let Some(bytes) = store.get(hash).await? else {
        return Ok(None);
    };
    let entry = Entry::from_bytes(&bytes)?;
    if entry.hash() != *hash {
        return Err(StoreError::Corrupt {
            expected: *hash,
            actual: entry.hash(),
        }
        .into());
    }
    Ok(Some(entry))
}
