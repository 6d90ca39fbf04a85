use crate::blob_store::BlobError;
use crate::entry_meta::MetaError;
use crate::meta_store::StoreError;

/// Failures reported by the entry storage engine. Each one names the pile and,
/// where there is one, the entry it concerns.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("{pile}: no such pile")]
    NoSuchPile { pile: String },
    #[error("{pile}/{entry}: no such entry")]
    NoSuchEntry { pile: String, entry: String },
    #[error("{pile}/{entry}: unparsable metadata: {source}")]
    UnparsableMetadata {
        pile: String,
        entry: String,
        #[source]
        source: MetaError,
    },
    #[error("{pile}: failed making an entry id: {source}")]
    FailedMakingId {
        pile: String,
        #[source]
        source: rand::Error,
    },
    #[error("{pile}: failed creating pile directory: {source}")]
    FailedCreatingPileDirectory {
        pile: String,
        #[source]
        source: BlobError,
    },
    #[error("{pile}/{entry}: failed creating entry file: {source}")]
    FailedCreatingEntryFile {
        pile: String,
        entry: String,
        #[source]
        source: BlobError,
    },
    #[error("{pile}/{entry}: during file operation: {source}")]
    DuringFileOperation {
        pile: String,
        entry: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{pile}/{entry}: failed storing metadata: {source}")]
    FailedStoringMetadata {
        pile: String,
        entry: String,
        #[source]
        source: StoreError,
    },
    #[error("{pile}: blob store failure: {source}")]
    Blob {
        pile: String,
        #[source]
        source: BlobError,
    },
    #[error("sweep task failed: {0}")]
    SweepTask(String),
    #[error("no piles configured")]
    NoPiles,
    #[error("Database error: {0}")]
    Database(#[from] StoreError),
}

impl StorageError {
    /// Whether this is a "not there" failure rather than a fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoSuchPile { .. } | Self::NoSuchEntry { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
