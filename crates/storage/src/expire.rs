//! Expiration sweeper.
//!
//! A sweep walks every pile with a finite lifetime, deletes the metadata of
//! expired entries in one write transaction per pile and then removes their
//! blobs. Blob files without a metadata record that are older than the
//! orphan grace period are reclaimed in the same pass.

use crate::config::Config;
use crate::entry_meta::EntryMeta;
use crate::error::{StorageError, StorageResult};
use crate::EntryStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    /// Minimum age of an unreferenced blob before it is reclaimed. Keeps
    /// in-flight uploads, whose metadata is not committed yet, safe.
    pub orphan_grace: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
        }
    }
}

/// What one sweep did to one pile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pile: String,
    pub scanned: usize,
    pub expired: Vec<String>,
    pub orphans: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweeperState {
    Idle,
    Sweeping,
}

impl EntryStore {
    /// Run one sweep at `now` over every configured pile.
    pub fn void_expired(
        &self,
        config: &Config,
        now: DateTime<Utc>,
        orphan_grace: Duration,
    ) -> StorageResult<Vec<SweepReport>> {
        let mut reports = Vec::with_capacity(config.piles.len());
        for (pile, settings) in &config.piles {
            let mut report = SweepReport {
                pile: pile.clone(),
                ..SweepReport::default()
            };
            if !settings.lifetime.is_forever() {
                let (scanned, expired) = self.expire_pile(pile, settings.lifetime, now)?;
                report.scanned = scanned;
                report.expired = expired;
            }
            report.orphans = self.reclaim_orphans(pile, now, orphan_grace)?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn expire_pile(
        &self,
        pile: &str,
        lifetime: crate::config::Lifetime,
        now: DateTime<Utc>,
    ) -> StorageResult<(usize, Vec<String>)> {
        let (scanned, expired) = self.meta().write(|txn| {
            let Some(namespace) = txn.namespace(pile) else {
                return Err(StorageError::NoSuchPile {
                    pile: pile.to_string(),
                });
            };
            let mut scanned = 0;
            let mut expired = Vec::new();
            namespace.for_each(|entry, raw| {
                scanned += 1;
                match EntryMeta::from_bytes(raw) {
                    Ok(meta) if lifetime.is_expired(meta.created(), now) => {
                        expired.push(entry.to_string());
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(pile, entry, operation = "expire", error = %err, "Skipping unparsable metadata");
                    }
                }
                Ok::<_, StorageError>(ControlFlow::Continue(()))
            })?;
            for entry in &expired {
                txn.delete(pile, entry)?;
            }
            Ok((scanned, expired))
        })?;

        for entry in &expired {
            self.blobs()
                .delete(pile, entry)
                .map_err(|source| StorageError::Blob {
                    pile: pile.to_string(),
                    source,
                })?;
            info!(pile, entry = %entry, operation = "expire", "Expired entry removed");
        }
        if !expired.is_empty() {
            metrics::counter!("pilestore_entries_expired_total", "pile" => pile.to_string())
                .increment(expired.len() as u64);
        }
        Ok((scanned, expired))
    }

    fn reclaim_orphans(
        &self,
        pile: &str,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> StorageResult<Vec<String>> {
        let blob_err = |source| StorageError::Blob {
            pile: pile.to_string(),
            source,
        };
        let cutoff = SystemTime::from(now)
            .checked_sub(grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let candidates: Vec<String> = self
            .blobs()
            .list(pile)
            .map_err(blob_err)?
            .into_iter()
            .filter(|file| file.modified <= cutoff)
            .map(|file| file.entry)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let orphans = self.meta().read(|txn| {
            let Some(namespace) = txn.namespace(pile) else {
                return Ok::<_, StorageError>(Vec::new());
            };
            let mut orphans = Vec::new();
            for entry in candidates {
                if !namespace.contains(&entry)? {
                    orphans.push(entry);
                }
            }
            Ok(orphans)
        })?;

        for entry in &orphans {
            self.blobs().delete(pile, entry).map_err(blob_err)?;
            warn!(pile, entry = %entry, operation = "expire", "Reclaimed orphaned blob");
        }
        if !orphans.is_empty() {
            metrics::counter!("pilestore_orphans_reclaimed_total", "pile" => pile.to_string())
                .increment(orphans.len() as u64);
        }
        Ok(orphans)
    }
}

/// Periodic driver around [`EntryStore::void_expired`].
#[derive(Clone)]
pub struct ExpirySweeper {
    store: Arc<EntryStore>,
    config: Arc<Config>,
    settings: SweepSettings,
    state: Arc<RwLock<SweeperState>>,
}

impl ExpirySweeper {
    pub fn new(store: Arc<EntryStore>, config: Arc<Config>, settings: SweepSettings) -> Self {
        Self {
            store,
            config,
            settings,
            state: Arc::new(RwLock::new(SweeperState::Idle)),
        }
    }

    pub fn state(&self) -> SweeperState {
        *self.state.read()
    }

    /// One sweep on the blocking pool.
    pub async fn sweep_once(&self) -> StorageResult<Vec<SweepReport>> {
        let store = Arc::clone(&self.store);
        let config = Arc::clone(&self.config);
        let grace = self.settings.orphan_grace;

        *self.state.write() = SweeperState::Sweeping;
        let outcome =
            tokio::task::spawn_blocking(move || store.void_expired(&config, Utc::now(), grace))
                .await;
        *self.state.write() = SweeperState::Idle;

        let reports = outcome.map_err(|err| StorageError::SweepTask(err.to_string()))??;
        let expired: usize = reports.iter().map(|r| r.expired.len()).sum();
        let orphans: usize = reports.iter().map(|r| r.orphans.len()).sum();
        debug!(operation = "expire", piles = reports.len(), expired, orphans, "Sweep finished");
        Ok(reports)
    }

    /// Sweep on every interval tick until stopped. The first tick is one
    /// interval from now; run [`sweep_once`](Self::sweep_once) beforehand for
    /// the startup sweep.
    pub fn spawn(self) -> SweeperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let state = Arc::clone(&self.state);
        let period = self.settings.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.sweep_once().await {
                            error!(operation = "expire", error = %err, "Sweep failed; retrying next tick");
                        }
                    }
                }
            }
            debug!(operation = "expire", "Sweeper stopped");
        });

        SweeperHandle {
            stop: Some(stop_tx),
            task,
            state,
        }
    }
}

pub struct SweeperHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    state: Arc<RwLock<SweeperState>>,
}

impl SweeperHandle {
    pub fn state(&self) -> SweeperState {
        *self.state.read()
    }

    /// Signal the sweeper and wait for it. A sweep in progress finishes first.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "Sweeper task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Lifetime, PileConfig};
    use crate::{EntryCreator, PileGetter};
    use std::io::Write;
    use tempfile::TempDir;

    fn setup(piles: &[(&str, u64)]) -> (TempDir, EntryStore, Config) {
        let dir = TempDir::new().unwrap();
        let store = EntryStore::open(dir.path()).unwrap();
        let mut config = Config::default();
        for (name, secs) in piles {
            config.piles.insert(
                name.to_string(),
                PileConfig {
                    lifetime: Lifetime::new(Duration::from_secs(*secs)),
                    ..PileConfig::default()
                },
            );
        }
        store.startup(&config).unwrap();
        (dir, store, config)
    }

    fn upload(store: &EntryStore, pile: &str) -> String {
        store
            .create_entry(pile, "f.bin", &mut |sink: &mut dyn Write| {
                sink.write_all(b"payload")?;
                Ok(7)
            })
            .unwrap()
            .entry
    }

    #[test]
    fn removes_only_expired_entries() {
        let (_dir, store, config) = setup(&[("short", 60), ("forever", 0)]);
        let doomed = upload(&store, "short");
        let kept = upload(&store, "forever");

        let now = Utc::now();
        let reports = store
            .void_expired(&config, now, DEFAULT_ORPHAN_GRACE)
            .unwrap();
        assert!(reports.iter().all(|r| r.expired.is_empty()));

        let later = now + chrono::Duration::seconds(120);
        let reports = store
            .void_expired(&config, later, DEFAULT_ORPHAN_GRACE)
            .unwrap();
        let short = reports.iter().find(|r| r.pile == "short").unwrap();
        assert_eq!(short.expired, vec![doomed.clone()]);
        assert_eq!(short.scanned, 1);

        assert!(store.get_pile_entries("short").unwrap().is_empty());
        assert!(!store.blobs().entry_path("short", &doomed).exists());
        assert!(store.get_pile_entries("forever").unwrap().contains_key(&kept));
        assert!(store.blobs().entry_path("forever", &kept).exists());
    }

    #[test]
    fn sweep_is_idempotent() {
        let (_dir, store, config) = setup(&[("short", 1)]);
        upload(&store, "short");
        let later = Utc::now() + chrono::Duration::seconds(10);
        store.void_expired(&config, later, DEFAULT_ORPHAN_GRACE).unwrap();
        let again = store.void_expired(&config, later, DEFAULT_ORPHAN_GRACE).unwrap();
        assert!(again[0].expired.is_empty());
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let (_dir, store, config) = setup(&[("short", 1)]);
        let good = upload(&store, "short");
        store.meta().put("short", "broken", b"").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        let reports = store.void_expired(&config, later, DEFAULT_ORPHAN_GRACE).unwrap();
        assert_eq!(reports[0].expired, vec![good]);
        assert_eq!(reports[0].scanned, 2);
        assert!(store.meta().get("short", "broken").unwrap().is_some());
    }

    #[test]
    fn old_orphans_are_reclaimed_young_ones_kept() {
        let (_dir, store, config) = setup(&[("forever", 0)]);
        let referenced = upload(&store, "forever");
        store
            .blobs()
            .create_and_write("forever", "stray", |sink| {
                sink.write_all(b"x")?;
                Ok(1)
            })
            .unwrap();

        let reports = store
            .void_expired(&config, Utc::now(), Duration::from_secs(3600))
            .unwrap();
        assert!(reports[0].orphans.is_empty());
        assert!(store.blobs().entry_path("forever", "stray").exists());

        let later = Utc::now() + chrono::Duration::hours(2);
        let reports = store
            .void_expired(&config, later, Duration::from_secs(3600))
            .unwrap();
        assert_eq!(reports[0].orphans, vec!["stray".to_string()]);
        assert!(!store.blobs().entry_path("forever", "stray").exists());
        assert!(store.blobs().entry_path("forever", &referenced).exists());
    }

    #[tokio::test]
    async fn sweeper_runs_on_interval_and_stops() {
        let (_dir, store, config) = setup(&[("short", 1)]);
        let store = Arc::new(store);
        upload(&store, "short");

        let sweeper = ExpirySweeper::new(
            Arc::clone(&store),
            Arc::new(config),
            SweepSettings {
                interval: Duration::from_millis(200),
                orphan_grace: DEFAULT_ORPHAN_GRACE,
            },
        );
        assert!(sweeper.sweep_once().await.unwrap()[0].expired.is_empty());
        assert_eq!(sweeper.state(), SweeperState::Idle);

        let handle = sweeper.spawn();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.stop().await;

        assert!(store.get_pile_entries("short").unwrap().is_empty());
    }
}
