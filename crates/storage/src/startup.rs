//! Bringing stored state in line with the pile configuration.

use crate::config::Config;
use crate::error::{StorageError, StorageResult};
use crate::EntryStore;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Piles that were forgotten during reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Dropped namespaces with the number of entries discarded from each.
    pub dropped: Vec<(String, usize)>,
    /// Blob directories removed because no configured pile owns them.
    pub removed_dirs: Vec<String>,
}

impl EntryStore {
    /// Create a namespace for every configured pile and forget every pile that
    /// is no longer configured, blobs included. Must run before any traffic.
    pub fn startup(&self, config: &Config) -> StorageResult<ReconcileReport> {
        if config.piles.is_empty() {
            return Err(StorageError::NoPiles);
        }

        let dropped = self.meta().reconcile(config.pile_names())?;

        let configured: BTreeSet<&str> = config.pile_names().collect();
        let mut removed_dirs = Vec::new();
        let on_disk = self
            .blobs()
            .pile_names()
            .map_err(|source| StorageError::Blob {
                pile: String::new(),
                source,
            })?;
        for pile in on_disk {
            if configured.contains(pile.as_str()) {
                continue;
            }
            let removed = self
                .blobs()
                .remove_pile(&pile)
                .map_err(|source| StorageError::Blob {
                    pile: pile.clone(),
                    source,
                })?;
            if removed {
                warn!(pile = %pile, operation = "startup", "Removed blob directory of unconfigured pile");
                removed_dirs.push(pile);
            }
        }

        self.meta().read(|txn| {
            for (name, pile) in &config.piles {
                let entries = txn.namespace(name).map(|ns| ns.len()).unwrap_or(0);
                info!(
                    pile = %name,
                    operation = "startup",
                    entries,
                    read_key = !pile.read_key.is_empty(),
                    write_key = !pile.write_key.is_empty(),
                    list_key = !pile.list_key.is_empty(),
                    lifetime = %pile.lifetime,
                    origin = %pile.origin,
                    "Pile ready"
                );
            }
            Ok::<_, StorageError>(())
        })?;

        Ok(ReconcileReport {
            dropped,
            removed_dirs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PileConfig;
    use crate::{EntryCreator, PileGetter};
    use std::io::Write;
    use tempfile::TempDir;

    fn config(piles: &[&str]) -> Config {
        let mut config = Config::default();
        for pile in piles {
            config.piles.insert(pile.to_string(), PileConfig::default());
        }
        config
    }

    #[test]
    fn empty_table_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = EntryStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.startup(&Config::default()),
            Err(StorageError::NoPiles)
        ));
    }

    #[test]
    fn unconfigured_piles_are_forgotten() {
        let dir = TempDir::new().unwrap();
        let store = EntryStore::open(dir.path()).unwrap();
        store.startup(&config(&["a", "b", "c"])).unwrap();
        for pile in ["a", "b", "c"] {
            store
                .create_entry(pile, "f", &mut |sink: &mut dyn Write| {
                    sink.write_all(b"x")?;
                    Ok(1)
                })
                .unwrap();
        }

        let report = store.startup(&config(&["a", "c"])).unwrap();
        assert_eq!(report.dropped, vec![("b".to_string(), 1)]);
        assert_eq!(report.removed_dirs, vec!["b".to_string()]);
        assert!(store.get_pile_entries("b").is_err());
        assert_eq!(store.get_pile_entries("a").unwrap().len(), 1);
        assert!(!store.blobs().pile_dir("b").exists());
        assert!(store.blobs().pile_dir("a").exists());
    }
}
