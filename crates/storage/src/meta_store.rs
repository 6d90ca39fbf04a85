//! Sled-backed metadata store.
//!
//! Every pile is a sled tree ("namespace") mapping entry ids to encoded
//! [`EntryMeta`](crate::EntryMeta) records. All mutations go through
//! [`MetaStore::write`], which holds the store-wide write lock, buffers the
//! changes and commits them in a single multi-tree sled transaction: either
//! every change of the closure becomes visible or none does. Readers share
//! the lock and never observe a half-applied write.

use parking_lot::RwLock;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionResult};
use sled::{Batch, Db, Transactional, Tree};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;
use std::path::Path;
use tracing::{info, warn};

const SLED_DEFAULT_TREE: &[u8] = b"__sled__default";

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("namespace {0} does not exist")]
    NoSuchNamespace(String),
    #[error("write transaction aborted")]
    Aborted,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read-only view of one namespace.
#[derive(Clone, Copy)]
pub struct Namespace<'a> {
    name: &'a str,
    tree: &'a Tree,
}

impl<'a> Namespace<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    pub fn contains(&self, key: &str) -> StoreResult<bool> {
        Ok(self.tree.contains_key(key.as_bytes())?)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Visit every `(key, record)` pair. The visitor stops the walk with
    /// `ControlFlow::Break` or fails it with an error, which is returned
    /// as-is so an enclosing [`MetaStore::write`] aborts.
    pub fn for_each<E, F>(&self, mut visit: F) -> Result<(), E>
    where
        E: From<StoreError>,
        F: FnMut(&str, &[u8]) -> Result<ControlFlow<()>, E>,
    {
        for item in self.tree.iter() {
            let (key, value) = item.map_err(|err| E::from(StoreError::from(err)))?;
            let key = String::from_utf8_lossy(&key);
            if visit(&key, &value)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

/// Shared read scope handed to [`MetaStore::read`] closures.
pub struct ReadTxn<'a> {
    namespaces: &'a BTreeMap<String, Tree>,
}

impl<'a> ReadTxn<'a> {
    pub fn namespace(&self, name: &str) -> Option<Namespace<'a>> {
        self.namespaces
            .get_key_value(name)
            .map(|(name, tree)| Namespace { name, tree })
    }

    pub fn namespace_names(&self) -> impl Iterator<Item = &'a str> {
        self.namespaces.keys().map(String::as_str)
    }
}

/// Exclusive write scope handed to [`MetaStore::write`] closures.
///
/// Reads see the last committed state; buffered changes become visible only
/// when the closure returns `Ok`.
pub struct WriteTxn<'a> {
    namespaces: &'a BTreeMap<String, Tree>,
    created: BTreeSet<String>,
    dropped: BTreeSet<String>,
    pending: BTreeMap<String, Batch>,
}

impl<'a> WriteTxn<'a> {
    fn new(namespaces: &'a BTreeMap<String, Tree>) -> Self {
        Self {
            namespaces,
            created: BTreeSet::new(),
            dropped: BTreeSet::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn namespace(&self, name: &str) -> Option<Namespace<'a>> {
        self.namespaces
            .get_key_value(name)
            .map(|(name, tree)| Namespace { name, tree })
    }

    pub fn namespace_names(&self) -> impl Iterator<Item = &'a str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Create the namespace unless it exists. Idempotent.
    pub fn ensure_namespace(&mut self, name: &str) {
        self.dropped.remove(name);
        if !self.namespaces.contains_key(name) {
            self.created.insert(name.to_string());
        }
    }

    /// Drop the namespace and everything in it. Returns whether it existed.
    pub fn delete_namespace(&mut self, name: &str) -> bool {
        let existed = self.is_live(name);
        self.created.remove(name);
        self.pending.remove(name);
        if self.namespaces.contains_key(name) {
            self.dropped.insert(name.to_string());
        }
        existed
    }

    pub fn put(&mut self, namespace: &str, key: &str, record: &[u8]) -> StoreResult<()> {
        self.batch(namespace)?.insert(key.as_bytes(), record);
        Ok(())
    }

    pub fn delete(&mut self, namespace: &str, key: &str) -> StoreResult<()> {
        self.batch(namespace)?.remove(key.as_bytes());
        Ok(())
    }

    fn is_live(&self, name: &str) -> bool {
        !self.dropped.contains(name)
            && (self.namespaces.contains_key(name) || self.created.contains(name))
    }

    fn batch(&mut self, namespace: &str) -> StoreResult<&mut Batch> {
        if !self.is_live(namespace) {
            return Err(StoreError::NoSuchNamespace(namespace.to_string()));
        }
        Ok(self.pending.entry(namespace.to_string()).or_default())
    }

    fn into_write_set(self) -> WriteSet {
        WriteSet {
            created: self.created,
            dropped: self.dropped,
            pending: self.pending,
        }
    }
}

struct WriteSet {
    created: BTreeSet<String>,
    dropped: BTreeSet<String>,
    pending: BTreeMap<String, Batch>,
}

/// Transactional key/value store with one namespace per pile.
pub struct MetaStore {
    db: Db,
    namespaces: RwLock<BTreeMap<String, Tree>>,
}

impl MetaStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path.as_ref())?;
        let mut namespaces = BTreeMap::new();
        for name in db.tree_names() {
            if &*name == SLED_DEFAULT_TREE {
                continue;
            }
            let tree = db.open_tree(&name)?;
            namespaces.insert(String::from_utf8_lossy(&name).into_owned(), tree);
        }
        info!(
            path = %path.as_ref().display(),
            namespaces = namespaces.len(),
            "Opened metadata store"
        );
        Ok(Self {
            db,
            namespaces: RwLock::new(namespaces),
        })
    }

    /// Run `f` in a shared read scope. Concurrent readers proceed together;
    /// writers wait.
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T, E>,
    {
        let namespaces = self.namespaces.read();
        f(&ReadTxn {
            namespaces: &*namespaces,
        })
    }

    /// Run `f` in the exclusive write scope and commit its buffered changes
    /// atomically. Nothing is applied when `f` or the record commit fails.
    /// Dropped namespaces are removed after the records are committed.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, E>,
    {
        let mut namespaces = self.namespaces.write();
        let (value, write_set) = {
            let mut txn = WriteTxn::new(&namespaces);
            let value = f(&mut txn)?;
            (value, txn.into_write_set())
        };
        self.commit(&mut namespaces, write_set).map_err(E::from)?;
        Ok(value)
    }

    fn commit(
        &self,
        namespaces: &mut BTreeMap<String, Tree>,
        write_set: WriteSet,
    ) -> StoreResult<()> {
        let WriteSet {
            created,
            dropped,
            pending,
        } = write_set;

        let mut fresh = BTreeMap::new();
        for name in created {
            match self.db.open_tree(name.as_bytes()) {
                Ok(tree) => {
                    fresh.insert(name, tree);
                }
                Err(err) => {
                    self.discard(fresh);
                    return Err(StoreError::Database(err));
                }
            }
        }

        if let Err(err) = self.apply_batches(namespaces, &fresh, pending) {
            self.discard(fresh);
            return Err(err);
        }

        namespaces.extend(fresh);
        for name in dropped {
            if namespaces.remove(&name).is_some() {
                self.db.drop_tree(name.as_bytes())?;
            }
        }

        self.db.flush()?;
        Ok(())
    }

    fn apply_batches(
        &self,
        namespaces: &BTreeMap<String, Tree>,
        fresh: &BTreeMap<String, Tree>,
        pending: BTreeMap<String, Batch>,
    ) -> StoreResult<()> {
        let mut trees = Vec::with_capacity(pending.len());
        let mut batches = Vec::with_capacity(pending.len());
        for (name, batch) in pending {
            let tree = namespaces
                .get(&name)
                .or_else(|| fresh.get(&name))
                .ok_or_else(|| StoreError::NoSuchNamespace(name.clone()))?;
            trees.push(tree.clone());
            batches.push(batch);
        }
        if trees.is_empty() {
            return Ok(());
        }

        let outcome: TransactionResult<(), ()> = trees.as_slice().transaction(|txs| {
            for (index, batch) in batches.iter().enumerate() {
                txs[index].apply_batch(batch)?;
            }
            Ok::<(), ConflictableTransactionError<()>>(())
        });
        match outcome {
            Ok(()) => Ok(()),
            Err(TransactionError::Storage(err)) => Err(StoreError::Database(err)),
            Err(TransactionError::Abort(())) => Err(StoreError::Aborted),
        }
    }

    /// Drop trees opened for a commit that did not go through.
    fn discard(&self, fresh: BTreeMap<String, Tree>) {
        for name in fresh.keys() {
            if let Err(err) = self.db.drop_tree(name.as_bytes()) {
                warn!(namespace = %name, error = %err, "Failed to drop namespace of aborted commit");
            }
        }
    }

    /// Create the namespace if it is absent. Idempotent.
    pub fn ensure_namespace(&self, name: &str) -> StoreResult<()> {
        self.write(|txn| {
            txn.ensure_namespace(name);
            Ok(())
        })
    }

    pub fn put(&self, namespace: &str, key: &str, record: &[u8]) -> StoreResult<()> {
        self.write(|txn| txn.put(namespace, key, record))
    }

    pub fn delete(&self, namespace: &str, key: &str) -> StoreResult<()> {
        self.write(|txn| txn.delete(namespace, key))
    }

    pub fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.read(|txn| {
            txn.namespace(namespace)
                .ok_or_else(|| StoreError::NoSuchNamespace(namespace.to_string()))?
                .get(key)
        })
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.read().contains_key(name)
    }

    pub fn namespace_names(&self) -> Vec<String> {
        self.namespaces.read().keys().cloned().collect()
    }

    /// Bring the namespace set in line with the configured pile names:
    /// create the missing ones, then drop every namespace that is not
    /// configured. Runs as one write transaction. Returns the dropped
    /// namespaces with the number of records discarded from each.
    pub fn reconcile<'n, I>(&self, configured: I) -> StoreResult<Vec<(String, usize)>>
    where
        I: IntoIterator<Item = &'n str>,
    {
        let configured: BTreeSet<&str> = configured.into_iter().collect();
        self.write(|txn| {
            for name in &configured {
                txn.ensure_namespace(name);
            }
            let stale: Vec<(String, usize)> = txn
                .namespace_names()
                .filter(|name| !configured.contains(name))
                .filter_map(|name| txn.namespace(name))
                .map(|ns| (ns.name().to_string(), ns.len()))
                .collect();
            for (name, keys) in &stale {
                warn!(pile = %name, keys, "Not in configuration, so removed");
                txn.delete_namespace(name);
            }
            Ok(stale)
        })
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
