//! Key-value storage behind the escrow and registry ledgers.
//!
//! Provides a `KvStore` trait with per-key compare-and-swap, a sled-backed
//! implementation for persistence and an in-memory one for tests. Ledgers
//! only ever mutate state through [`update_record`], so two writers racing on
//! the same key can never both apply a transition.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::CAS_RETRY_LIMIT;

/// Errors from storage operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("write contention on key {0}: gave up after {1} attempts")]
    Contention(String, usize),
}

/// Logical trees inside one ledger namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tree {
    /// Registry entries keyed by agent address.
    Agents,
    /// Escrow entries keyed by task id.
    Escrows,
}

impl Tree {
    pub fn name(&self) -> &'static str {
        match self {
            Tree::Agents => "agents",
            Tree::Escrows => "escrows",
        }
    }
}

/// Result of a compare-and-swap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Swap {
    Applied,
    /// The stored value was not the expected one; carries the current value.
    Conflict(Option<Vec<u8>>),
}

/// Trait for key-value backends with compare-and-swap semantics.
pub trait KvStore: Send + Sync {
    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value at `key` with `new` only if it currently equals
    /// `expected` (`None` meaning absent).
    fn compare_and_swap(
        &self,
        tree: Tree,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<Swap, StoreError>;

    /// All entries of a tree in key order.
    fn scan(&self, tree: Tree) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    fn len(&self, tree: Tree) -> Result<usize, StoreError>;

    fn flush(&self) -> Result<(), StoreError>;
}

/// Read and decode a record.
pub fn get_record<T, S>(store: &S, tree: Tree, key: &[u8]) -> Result<Option<T>, StoreError>
where
    T: DeserializeOwned,
    S: KvStore + ?Sized,
{
    match store.get(tree, key)? {
        Some(bytes) => Ok(Some(decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Atomically transform the record at `key`.
///
/// `f` sees the current value (if any) and returns the replacement or a
/// domain error. On a concurrent write the record is re-read and `f` runs
/// again against the fresh value, so a transition guarded inside `f` is
/// applied at most once no matter how many callers race.
pub fn update_record<T, E, S, F>(store: &S, tree: Tree, key: &[u8], mut f: F) -> Result<T, E>
where
    T: Serialize + DeserializeOwned,
    E: From<StoreError>,
    S: KvStore + ?Sized,
    F: FnMut(Option<T>) -> Result<T, E>,
{
    let mut current = store.get(tree, key)?;
    for _ in 0..CAS_RETRY_LIMIT {
        let decoded = match &current {
            Some(bytes) => Some(decode::<T>(bytes)?),
            None => None,
        };
        let next = f(decoded)?;
        let encoded = encode(&next)?;
        match store.compare_and_swap(tree, key, current.as_deref(), Some(encoded.as_slice()))? {
            Swap::Applied => return Ok(next),
            Swap::Conflict(fresh) => {
                tracing::debug!(tree = tree.name(), "CAS conflict, retrying");
                current = fresh;
            }
        }
    }
    Err(StoreError::Contention(hex::encode(key), CAS_RETRY_LIMIT).into())
}

fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, StoreError> {
    crate::serialize(val).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    crate::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Open (or create) the sled database shared by all ledger namespaces.
pub fn open_db(path: &Path) -> Result<sled::Db, StoreError> {
    sled::open(path).map_err(|e| StoreError::Io(e.to_string()))
}

/// Sled-backed storage for one ledger namespace.
///
/// Each namespace gets its own set of sled trees (`<namespace>/agents`, ...)
/// so the escrow and registry ledgers can share a database file.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    agents: sled::Tree,
    escrows: sled::Tree,
}

impl SledStore {
    /// Open a namespace inside an already-open database.
    pub fn with_db(db: sled::Db, namespace: &str) -> Result<Self, StoreError> {
        let open = |tree: Tree| {
            db.open_tree(format!("{}/{}", namespace, tree.name()))
                .map_err(|e| StoreError::Io(e.to_string()))
        };
        let agents = open(Tree::Agents)?;
        let escrows = open(Tree::Escrows)?;
        Ok(SledStore {
            db,
            agents,
            escrows,
        })
    }

    /// Open or create a sled database at the given path with a single namespace.
    pub fn open(path: &Path, namespace: &str) -> Result<Self, StoreError> {
        Self::with_db(open_db(path)?, namespace)
    }

    /// Open a temporary sled database (for testing).
    pub fn open_temporary(namespace: &str) -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config.open().map_err(|e| StoreError::Io(e.to_string()))?;
        Self::with_db(db, namespace)
    }

    fn tree(&self, tree: Tree) -> &sled::Tree {
        match tree {
            Tree::Agents => &self.agents,
            Tree::Escrows => &self.escrows,
        }
    }
}

impl KvStore for SledStore {
    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .tree(tree)
            .get(key)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(value.map(|v| v.to_vec()))
    }

    fn compare_and_swap(
        &self,
        tree: Tree,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<Swap, StoreError> {
        match self
            .tree(tree)
            .compare_and_swap(key, expected, new)
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            Ok(()) => Ok(Swap::Applied),
            Err(conflict) => Ok(Swap::Conflict(conflict.current.map(|v| v.to_vec()))),
        }
    }

    fn scan(&self, tree: Tree) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        for entry in self.tree(tree).iter() {
            let (key, value) = entry.map_err(|e| StoreError::Io(e.to_string()))?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn len(&self, tree: Tree) -> Result<usize, StoreError> {
        Ok(self.tree(tree).len())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<(Tree, Vec<u8>), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, BTreeMap<(Tree, Vec<u8>), Vec<u8>>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Io("memory store lock poisoned".into()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, tree: Tree, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock()?.get(&(tree, key.to_vec())).cloned())
    }

    fn compare_and_swap(
        &self,
        tree: Tree,
        key: &[u8],
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> Result<Swap, StoreError> {
        let mut entries = self.lock()?;
        let slot = (tree, key.to_vec());
        let current = entries.get(&slot);
        if current.map(Vec::as_slice) != expected {
            return Ok(Swap::Conflict(current.cloned()));
        }
        match new {
            Some(value) => entries.insert(slot, value.to_vec()),
            None => entries.remove(&slot),
        };
        Ok(Swap::Applied)
    }

    fn scan(&self, tree: Tree) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|((t, _), _)| *t == tree)
            .map(|((_, k), v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self, tree: Tree) -> Result<usize, StoreError> {
        Ok(self.lock()?.keys().filter(|(t, _)| *t == tree).count())
    }

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
