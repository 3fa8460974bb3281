//! Per-log entry index (Fjall disk or pure in-memory).
//!
//! The block store holds entry bytes shared by every log on a peer; the
//! index holds one shallow row per entry known to a single log: its causal
//! metadata, whether it is a head, and whether its block was pruned.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::Hash;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::entry::{Entry, EntryType};
use crate::error::LogError;

type Result<T> = std::result::Result<T, LogError>;

/// Shallow index row for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEntry {
    /// Content address.
    pub hash: Hash,
    /// Entry clock.
    pub clock: Clock,
    /// Graph id.
    pub gid: String,
    /// Parent hashes.
    pub next: Vec<Hash>,
    /// Append or cut.
    pub kind: EntryType,
    /// No materialized entry references this one.
    pub head: bool,
    /// The block was pruned; only this row remains.
    pub pruned: bool,
}

impl IndexedEntry {
    /// Build a materialized row for an entry.
    pub fn from_entry(entry: &Entry, head: bool) -> Self {
        Self {
            hash: entry.hash(),
            clock: *entry.clock(),
            gid: entry.gid().to_string(),
            next: entry.next().to_vec(),
            kind: entry.meta().kind,
            head,
            pruned: false,
        }
    }
}

/// Row filter for [`Indexer::query`] and [`Indexer::count`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexQuery {
    /// Every row, pruned or not.
    All,
    /// Rows whose block is still held.
    Materialized,
    /// Current heads.
    Heads,
    /// Pruned rows.
    Pruned,
    /// Materialized rows with the given gid.
    Gid(String),
}

impl IndexQuery {
    fn matches(&self, row: &IndexedEntry) -> bool {
        match self {
            IndexQuery::All => true,
            IndexQuery::Materialized => !row.pruned,
            IndexQuery::Heads => row.head && !row.pruned,
            IndexQuery::Pruned => row.pruned,
            IndexQuery::Gid(gid) => !row.pruned && row.gid == *gid,
        }
    }
}

/// Indexer collaborator: per-log shallow entry rows, plus the set of
/// entries held back from materialization (refused by policy or waiting on
/// parents) that [`crate::Log::recover`] re-attempts.
pub trait Indexer: Send + Sync {
    /// Insert or replace a row.
    fn put(&self, row: &IndexedEntry) -> Result<()>;

    /// Fetch a row.
    fn get(&self, hash: &Hash) -> Result<Option<IndexedEntry>>;

    /// Delete a row.
    fn delete(&self, hash: &Hash) -> Result<()>;

    /// Rows matching `query`, in no particular order.
    fn query(&self, query: &IndexQuery) -> Result<Vec<IndexedEntry>>;

    /// Remember an entry whose block is stored but which is not
    /// materialized.
    fn put_stranded(&self, hash: &Hash) -> Result<()>;

    /// Forget a stranded entry.
    fn remove_stranded(&self, hash: &Hash) -> Result<()>;

    /// Every stranded entry.
    fn stranded(&self) -> Result<Vec<Hash>>;

    /// Drop every row and stranded entry.
    fn clear(&self) -> Result<()>;

    /// Release files and locks held between uses. The next call reopens
    /// them.
    fn release(&self) -> Result<()> {
        Ok(())
    }

    /// Number of rows matching `query`.
    fn count(&self, query: &IndexQuery) -> Result<usize> {
        Ok(self.query(query)?.len())
    }

    /// Materialized rows that list `hash` as a parent.
    fn children(&self, hash: &Hash) -> Result<Vec<Hash>> {
        Ok(self
            .query(&IndexQuery::Materialized)?
            .into_iter()
            .filter(|row| row.next.contains(hash))
            .map(|row| row.hash)
            .collect())
    }
}

/// Open Fjall handles.
struct FjallHandle {
    _db: Database,
    rows: Keyspace,
    stranded: Keyspace,
}

/// Fjall database opened on first use and dropped on release.
struct FjallBackend {
    path: PathBuf,
    temporary: bool,
    handle: Mutex<Option<FjallHandle>>,
}

impl FjallBackend {
    fn new(path: PathBuf, temporary: bool) -> Result<Self> {
        let backend = Self {
            path,
            temporary,
            handle: Mutex::new(None),
        };
        backend.keyspaces()?;
        Ok(backend)
    }

    fn keyspaces(&self) -> Result<(Keyspace, Keyspace)> {
        let mut handle = self.handle.lock().map_err(index_err)?;
        if handle.is_none() {
            let db = Database::builder(&self.path)
                .temporary(self.temporary)
                .open()
                .map_err(index_err)?;
            let rows = db
                .keyspace("log_rows", KeyspaceCreateOptions::default)
                .map_err(index_err)?;
            let stranded = db
                .keyspace("log_stranded", KeyspaceCreateOptions::default)
                .map_err(index_err)?;
            *handle = Some(FjallHandle {
                _db: db,
                rows,
                stranded,
            });
        }
        let Some(open) = handle.as_ref() else {
            return Err(LogError::Index("fjall handle missing".into()));
        };
        Ok((open.rows.clone(), open.stranded.clone()))
    }

    fn rows(&self) -> Result<Keyspace> {
        Ok(self.keyspaces()?.0)
    }

    fn stranded(&self) -> Result<Keyspace> {
        Ok(self.keyspaces()?.1)
    }

    fn release(&self) -> Result<()> {
        // A temporary database is deleted when dropped.
        if !self.temporary {
            self.handle.lock().map_err(index_err)?.take();
        }
        Ok(())
    }
}

fn keys(keyspace: &Keyspace) -> Result<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    for guard in keyspace.iter() {
        let key = guard.key().map_err(index_err)?;
        keys.push(key.to_vec());
    }
    Ok(keys)
}

#[derive(Default)]
struct MemoryBackend {
    rows: RwLock<HashMap<Hash, IndexedEntry>>,
    stranded: RwLock<HashSet<Hash>>,
}

/// Inner backend: either Fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall(FjallBackend),
    Memory(MemoryBackend),
}

/// The provided [`Indexer`].
pub struct EntryIndex {
    backend: Backend,
}

fn index_err(e: impl std::fmt::Display) -> LogError {
    LogError::Index(e.to_string())
}

impl EntryIndex {
    /// Open a persistent index at the given path (Fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            backend: Backend::Fjall(FjallBackend::new(path.as_ref().to_path_buf(), false)?),
        })
    }

    /// Open a temporary index backed by Fjall (cleaned up on drop).
    pub fn open_temporary(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            backend: Backend::Fjall(FjallBackend::new(path.as_ref().to_path_buf(), true)?),
        })
    }

    /// Create a pure in-memory index.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryBackend::default()),
        }
    }
}

impl Indexer for EntryIndex {
    fn put(&self, row: &IndexedEntry) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => {
                let bytes = postcard::to_allocvec(row)?;
                f.rows()?
                    .insert(row.hash.as_bytes().as_slice(), bytes)
                    .map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.rows
                    .write()
                    .map_err(index_err)?
                    .insert(row.hash, row.clone());
            }
        }
        Ok(())
    }

    fn get(&self, hash: &Hash) -> Result<Option<IndexedEntry>> {
        match &self.backend {
            Backend::Fjall(f) => match f.rows()?.get(hash.as_bytes()).map_err(index_err)? {
                Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
                None => Ok(None),
            },
            Backend::Memory(m) => Ok(m.rows.read().map_err(index_err)?.get(hash).cloned()),
        }
    }

    fn delete(&self, hash: &Hash) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => {
                f.rows()?
                    .remove(hash.as_bytes().as_slice())
                    .map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.rows.write().map_err(index_err)?.remove(hash);
            }
        }
        Ok(())
    }

    fn query(&self, query: &IndexQuery) -> Result<Vec<IndexedEntry>> {
        match &self.backend {
            Backend::Fjall(f) => {
                let mut result = Vec::new();

                for guard in f.rows()?.iter() {
                    let (_, value) = guard.into_inner().map_err(index_err)?;
                    let row: IndexedEntry = postcard::from_bytes(&value)?;
                    if query.matches(&row) {
                        result.push(row);
                    }
                }

                Ok(result)
            }
            Backend::Memory(m) => Ok(m
                .rows
                .read()
                .map_err(index_err)?
                .values()
                .filter(|row| query.matches(row))
                .cloned()
                .collect()),
        }
    }

    fn put_stranded(&self, hash: &Hash) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => {
                f.stranded()?
                    .insert(hash.as_bytes().as_slice(), Vec::<u8>::new())
                    .map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.stranded.write().map_err(index_err)?.insert(*hash);
            }
        }
        Ok(())
    }

    fn remove_stranded(&self, hash: &Hash) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => {
                f.stranded()?
                    .remove(hash.as_bytes().as_slice())
                    .map_err(index_err)?;
            }
            Backend::Memory(m) => {
                m.stranded.write().map_err(index_err)?.remove(hash);
            }
        }
        Ok(())
    }

    fn stranded(&self) -> Result<Vec<Hash>> {
        match &self.backend {
            Backend::Fjall(f) => {
                let mut hashes = Vec::new();
                for key in keys(&f.stranded()?)? {
                    let bytes: [u8; 32] = key
                        .as_slice()
                        .try_into()
                        .map_err(|_| LogError::Index("malformed stranded key".into()))?;
                    hashes.push(Hash::from(bytes));
                }
                Ok(hashes)
            }
            Backend::Memory(m) => Ok(m.stranded.read().map_err(index_err)?.iter().copied().collect()),
        }
    }

    fn clear(&self) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => {
                let (rows, stranded) = f.keyspaces()?;
                for keyspace in [rows, stranded] {
                    for key in keys(&keyspace)? {
                        keyspace.remove(key.as_slice()).map_err(index_err)?;
                    }
                }
            }
            Backend::Memory(m) => {
                m.rows.write().map_err(index_err)?.clear();
                m.stranded.write().map_err(index_err)?.clear();
            }
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        match &self.backend {
            Backend::Fjall(f) => f.release(),
            Backend::Memory(_) => Ok(()),
        }
    }
}
