//! Tests for the reef-log crate.

mod prune_tests;

use std::collections::BTreeSet;
use std::sync::Arc;

use reef_store::{BlockStore, MemoryBlockStore};
use reef_types::{Hash, PeerId};

use crate::entry::{CreateEntry, Entry, EntryCipher, EntryType};
use crate::error::LogError;
use crate::identity::{Ed25519Identity, Identity};
use crate::log::{AppendOptions, Log, LogOptions};

/// Deterministic identity from a one-byte seed.
fn test_identity(seed: u8) -> Arc<Ed25519Identity> {
    Arc::new(Ed25519Identity::from_seed([seed; 32]))
}

/// Open a log on its own in-memory block store.
async fn test_log(seed: u8) -> (Log, Arc<MemoryBlockStore>) {
    let store = Arc::new(MemoryBlockStore::new());
    let log = open_on(store.clone(), seed, LogOptions::default()).await;
    (log, store)
}

/// Open a log on an existing store.
async fn open_on(store: Arc<dyn BlockStore>, seed: u8, options: LogOptions) -> Log {
    let log = Log::new("test-log");
    log.open(store, test_identity(seed), options).await.unwrap();
    log
}

/// Append with default linking.
async fn append(log: &Log, data: &str) -> Entry {
    log.append(data.as_bytes().to_vec(), AppendOptions::default())
        .await
        .unwrap()
        .entry
}

/// Append on a fresh branch (`next: []`).
async fn append_root(log: &Log, data: &str) -> Entry {
    let options = AppendOptions {
        next: Some(vec![]),
        ..Default::default()
    };
    log.append(data.as_bytes().to_vec(), options)
        .await
        .unwrap()
        .entry
}

/// Build an entry without a log.
fn make_entry(identity: &Ed25519Identity, data: &str, next: &[Entry], time: u64) -> Entry {
    let signers: [&dyn Identity; 1] = [identity];
    Entry::create(CreateEntry {
        data: data.as_bytes().to_vec(),
        meta_data: None,
        next,
        kind: EntryType::Append,
        local_time: time,
        signers: &signers,
        seal: None,
    })
    .unwrap()
}

/// Materialized hashes of a log.
async fn entry_set(log: &Log) -> BTreeSet<Hash> {
    log.entries()
        .await
        .unwrap()
        .iter()
        .map(|e| e.hash())
        .collect()
}

/// Head hashes of a log.
async fn head_set(log: &Log) -> BTreeSet<Hash> {
    log.head_hashes().await.unwrap().into_iter().collect()
}

/// XOR "cipher": opens only when the local peer is a recipient.
struct XorCipher {
    key: u8,
    me: PeerId,
}

impl EntryCipher for XorCipher {
    fn seal(&self, plaintext: &[u8], recipients: &[PeerId]) -> Result<Vec<u8>, LogError> {
        if recipients.is_empty() {
            return Err(LogError::Validation("no recipients".into()));
        }
        Ok(plaintext.iter().map(|b| b ^ self.key).collect())
    }

    fn open(&self, ciphertext: &[u8], recipients: &[PeerId]) -> Option<Vec<u8>> {
        recipients
            .contains(&self.me)
            .then(|| ciphertext.iter().map(|b| b ^ self.key).collect())
    }
}
