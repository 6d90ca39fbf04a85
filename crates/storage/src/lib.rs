//! Entry storage for pilestore.
//!
//! An entry is a blob file under `<data_dir>/piles/<pile>/<entry>` plus a
//! metadata record in the sled-backed [`MetaStore`]. [`EntryStore`] is the
//! only component that writes either side and keeps them consistent.

pub mod blob_store;
pub mod config;
pub mod entry_meta;
pub mod error;
pub mod expire;
pub mod meta_store;
pub mod sniff;
pub mod startup;

pub use blob_store::{BlobError, BlobStore};
pub use config::{Config, ConfigError, Lifetime, PileConfig};
pub use entry_meta::{format_timestamp, EntryMeta, MetaError};
pub use error::{StorageError, StorageResult};
pub use expire::{ExpirySweeper, SweepReport, SweepSettings, SweeperHandle, SweeperState};
pub use meta_store::{MetaStore, StoreError};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// File name of the metadata database inside the data directory.
pub const META_DB_NAME: &str = "pilestore.db";
/// Directory holding one sub-directory of blobs per pile.
pub const BLOB_DIR_NAME: &str = "piles";

/// Streams an upload into the sink it is given and reports the byte count.
pub type WriteCallback<'a> = &'a mut dyn FnMut(&mut dyn Write) -> io::Result<u64>;

/// Receives the metadata, sniffed content type and a reader over the blob.
pub type ReadCallback<'a> = &'a mut dyn FnMut(&EntryMeta, &str, &mut dyn Read) -> io::Result<()>;

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedEntry {
    pub entry: String,
    pub size: u64,
}

pub trait EntryCreator: Send + Sync {
    fn create_entry(
        &self,
        pile: &str,
        filename: &str,
        write: WriteCallback<'_>,
    ) -> StorageResult<CreatedEntry>;
}

pub trait EntryGetter: Send + Sync {
    fn get_entry(&self, pile: &str, entry: &str, read: ReadCallback<'_>) -> StorageResult<()>;
}

pub trait PileGetter: Send + Sync {
    fn get_pile_entries(&self, pile: &str) -> StorageResult<HashMap<String, EntryMeta>>;
}

/// Everything the HTTP layer needs from storage.
pub trait PileStorage: EntryCreator + EntryGetter + PileGetter {}

impl<T: EntryCreator + EntryGetter + PileGetter> PileStorage for T {}

pub struct EntryStore {
    meta: MetaStore,
    blobs: BlobStore,
    data_dir: PathBuf,
}

impl EntryStore {
    /// Open (or create) the metadata database and blob directory under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let meta = MetaStore::open(data_dir.join(META_DB_NAME))?;
        let blobs = BlobStore::new(data_dir.join(BLOB_DIR_NAME));
        Ok(Self::with_parts(meta, blobs, data_dir))
    }

    pub fn with_parts(meta: MetaStore, blobs: BlobStore, data_dir: PathBuf) -> Self {
        Self {
            meta,
            blobs,
            data_dir,
        }
    }

    pub fn meta(&self) -> &MetaStore {
        &self.meta
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn ensure_pile(&self, pile: &str) -> StorageResult<()> {
        self.meta.read(|txn| {
            txn.namespace(pile)
                .map(|_| ())
                .ok_or_else(|| StorageError::NoSuchPile {
                    pile: pile.to_string(),
                })
        })
    }
}

fn make_entry_id(pile: &str) -> StorageResult<String> {
    let mut bytes = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|source| StorageError::FailedMakingId {
            pile: pile.to_string(),
            source,
        })?;
    Ok(uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .to_string())
}

fn blob_write_error(pile: &str, entry: &str, err: BlobError) -> StorageError {
    match err {
        BlobError::CreateDir { .. } => StorageError::FailedCreatingPileDirectory {
            pile: pile.to_string(),
            source: err,
        },
        BlobError::Create { .. } => StorageError::FailedCreatingEntryFile {
            pile: pile.to_string(),
            entry: entry.to_string(),
            source: err,
        },
        BlobError::Write { source, .. } => StorageError::DuringFileOperation {
            pile: pile.to_string(),
            entry: entry.to_string(),
            source,
        },
        other => StorageError::Blob {
            pile: pile.to_string(),
            source: other,
        },
    }
}

impl EntryCreator for EntryStore {
    fn create_entry(
        &self,
        pile: &str,
        filename: &str,
        write: WriteCallback<'_>,
    ) -> StorageResult<CreatedEntry> {
        let entry = make_entry_id(pile)?;
        self.ensure_pile(pile)?;

        let size = self
            .blobs
            .create_and_write(pile, &entry, |sink| write(sink))
            .map_err(|err| {
                info!(pile, entry = %entry, operation = "write", error = %err, "Upload failed");
                blob_write_error(pile, &entry, err)
            })?;

        let record = EntryMeta::new(filename, Utc::now()).to_bytes();
        self.meta
            .write(|txn| txn.put(pile, &entry, &record))
            .map_err(|source| {
                error!(
                    pile,
                    entry = %entry,
                    operation = "write",
                    error = %source,
                    "Blob written but metadata not stored; blob is orphaned"
                );
                StorageError::FailedStoringMetadata {
                    pile: pile.to_string(),
                    entry: entry.clone(),
                    source,
                }
            })?;

        metrics::counter!("pilestore_entries_created_total", "pile" => pile.to_string())
            .increment(1);
        info!(pile, entry = %entry, operation = "write", size, filename, "Entry created");
        Ok(CreatedEntry { entry, size })
    }
}

impl EntryGetter for EntryStore {
    fn get_entry(&self, pile: &str, entry: &str, read: ReadCallback<'_>) -> StorageResult<()> {
        // The lock is released before the blob is opened; sweeps may run while
        // a large body streams out.
        let meta = self.meta.read(|txn| {
            let namespace = txn
                .namespace(pile)
                .ok_or_else(|| StorageError::NoSuchPile {
                    pile: pile.to_string(),
                })?;
            let raw = namespace
                .get(entry)?
                .ok_or_else(|| StorageError::NoSuchEntry {
                    pile: pile.to_string(),
                    entry: entry.to_string(),
                })?;
            EntryMeta::from_bytes(&raw).map_err(|source| StorageError::UnparsableMetadata {
                pile: pile.to_string(),
                entry: entry.to_string(),
                source,
            })
        })?;

        let (content_type, mut file) =
            self.blobs
                .open_for_read(pile, entry)
                .map_err(|err| match err {
                    BlobError::NotFound { .. } => StorageError::NoSuchEntry {
                        pile: pile.to_string(),
                        entry: entry.to_string(),
                    },
                    other => StorageError::Blob {
                        pile: pile.to_string(),
                        source: other,
                    },
                })?;

        read(&meta, content_type, &mut file).map_err(|source| {
            StorageError::DuringFileOperation {
                pile: pile.to_string(),
                entry: entry.to_string(),
                source,
            }
        })?;
        debug!(pile, entry, operation = "read", content_type, "Entry served");
        Ok(())
    }
}

impl PileGetter for EntryStore {
    fn get_pile_entries(&self, pile: &str) -> StorageResult<HashMap<String, EntryMeta>> {
        self.meta.read(|txn| {
            let namespace = txn
                .namespace(pile)
                .ok_or_else(|| StorageError::NoSuchPile {
                    pile: pile.to_string(),
                })?;
            let mut entries = HashMap::with_capacity(namespace.len());
            namespace.for_each(|entry, raw| {
                let meta =
                    EntryMeta::from_bytes(raw).map_err(|source| StorageError::UnparsableMetadata {
                        pile: pile.to_string(),
                        entry: entry.to_string(),
                        source,
                    })?;
                entries.insert(entry.to_string(), meta);
                Ok::<_, StorageError>(ControlFlow::Continue(()))
            })?;
            Ok(entries)
        })
    }
}
