//! Filesystem blob storage.
//!
//! Layout: `<root>/<pile>/<entry>`, one plain file per entry. The store does
//! no locking of its own; entry ids are fresh per create and never reused.

use crate::sniff::{detect_content_type, SNIFF_LEN};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("failed to make a directory for pile {pile}: {source}")]
    CreateDir {
        pile: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to make file for entry {pile}/{entry}: {source}")]
    Create {
        pile: String,
        entry: String,
        #[source]
        source: io::Error,
    },
    #[error("failed writing entry {pile}/{entry}: {source}")]
    Write {
        pile: String,
        entry: String,
        #[source]
        source: io::Error,
    },
    #[error("{pile}/{entry}: no such blob")]
    NotFound { pile: String, entry: String },
    #[error("failed reading entry {pile}/{entry}: {source}")]
    Read {
        pile: String,
        entry: String,
        #[source]
        source: io::Error,
    },
    #[error("failed deleting entry {pile}/{entry}: {source}")]
    Delete {
        pile: String,
        entry: String,
        #[source]
        source: io::Error,
    },
    #[error("failed scanning pile directory {pile}: {source}")]
    Scan {
        pile: String,
        #[source]
        source: io::Error,
    },
}

/// A blob file found while scanning a pile directory.
#[derive(Debug, Clone)]
pub struct BlobFile {
    pub entry: String,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pile_dir(&self, pile: &str) -> PathBuf {
        self.root.join(pile)
    }

    pub fn entry_path(&self, pile: &str, entry: &str) -> PathBuf {
        self.pile_dir(pile).join(entry)
    }

    /// Create `<pile>/<entry>` and let `write` fill it. The file is closed on
    /// every exit path; when `write` fails the partial file is removed.
    pub fn create_and_write<F>(&self, pile: &str, entry: &str, write: F) -> Result<u64, BlobError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<u64>,
    {
        let dir = self.pile_dir(pile);
        fs::create_dir_all(&dir).map_err(|source| BlobError::CreateDir {
            pile: pile.to_string(),
            source,
        })?;

        let path = dir.join(entry);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| BlobError::Create {
                pile: pile.to_string(),
                entry: entry.to_string(),
                source,
            })?;

        let written = {
            let mut sink = BufWriter::new(file);
            write(&mut sink)
                .and_then(|written| {
                    sink.flush()?;
                    sink.get_ref().sync_all()?;
                    Ok(written)
                })
        };

        match written {
            Ok(written) => {
                debug!(pile, entry, bytes = written, "Blob written");
                Ok(written)
            }
            Err(source) => {
                if let Err(err) = fs::remove_file(&path) {
                    warn!(pile, entry, error = %err, "Failed to remove partial blob");
                }
                Err(BlobError::Write {
                    pile: pile.to_string(),
                    entry: entry.to_string(),
                    source,
                })
            }
        }
    }

    /// Open a blob for reading. Returns the sniffed content type and a file
    /// positioned at offset 0.
    pub fn open_for_read(&self, pile: &str, entry: &str) -> Result<(&'static str, File), BlobError> {
        let read_err = |source: io::Error| BlobError::Read {
            pile: pile.to_string(),
            entry: entry.to_string(),
            source,
        };

        let mut file = File::open(self.entry_path(pile, entry)).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                BlobError::NotFound {
                    pile: pile.to_string(),
                    entry: entry.to_string(),
                }
            } else {
                read_err(source)
            }
        })?;

        let mut head = Vec::with_capacity(SNIFF_LEN);
        (&mut file)
            .take(SNIFF_LEN as u64)
            .read_to_end(&mut head)
            .map_err(read_err)?;
        let content_type = detect_content_type(&head);
        file.seek(SeekFrom::Start(0)).map_err(read_err)?;

        Ok((content_type, file))
    }

    /// Remove a blob. An already missing file is not an error; returns
    /// whether a file was actually removed.
    pub fn delete(&self, pile: &str, entry: &str) -> Result<bool, BlobError> {
        match fs::remove_file(self.entry_path(pile, entry)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(pile, entry, "Blob already doesn't exist");
                Ok(false)
            }
            Err(source) => Err(BlobError::Delete {
                pile: pile.to_string(),
                entry: entry.to_string(),
                source,
            }),
        }
    }

    /// Every regular file in a pile directory. A missing directory is empty.
    pub fn list(&self, pile: &str) -> Result<Vec<BlobFile>, BlobError> {
        let scan_err = |source: io::Error| BlobError::Scan {
            pile: pile.to_string(),
            source,
        };
        let dir = match fs::read_dir(self.pile_dir(pile)) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(scan_err(err)),
        };

        let mut files = Vec::new();
        for item in dir {
            let item = item.map_err(scan_err)?;
            let metadata = item.metadata().map_err(scan_err)?;
            if !metadata.is_file() {
                continue;
            }
            let Ok(entry) = item.file_name().into_string() else {
                continue;
            };
            files.push(BlobFile {
                entry,
                modified: metadata.modified().map_err(scan_err)?,
            });
        }
        Ok(files)
    }

    /// Names of the pile directories currently on disk.
    pub fn pile_names(&self) -> Result<Vec<String>, BlobError> {
        let scan_err = |source: io::Error| BlobError::Scan {
            pile: String::new(),
            source,
        };
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(scan_err(err)),
        };
        let mut names = Vec::new();
        for item in dir {
            let item = item.map_err(scan_err)?;
            if !item.file_type().map_err(scan_err)?.is_dir() {
                continue;
            }
            if let Ok(name) = item.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Remove a whole pile directory. Returns whether it existed.
    pub fn remove_pile(&self, pile: &str) -> Result<bool, BlobError> {
        match fs::remove_dir_all(self.pile_dir(pile)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(BlobError::Scan {
                pile: pile.to_string(),
                source,
            }),
        }
    }
}
