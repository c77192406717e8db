//! In-memory gallery cache.
//!
//! Publishes an immutable snapshot of the persistent gallery. Recognition
//! requests read the snapshot without blocking on concurrent refreshes; a
//! refresh swaps the published `Arc` under a short exclusive section after
//! all store I/O and decoding is done.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};

use faceid_core::Embedding;

use crate::store::{GalleryStore, StoreError};

/// Immutable point-in-time copy of the gallery.
///
/// Row position `i` associates `identities[i]` with `embeddings[i]`; the two
/// sequences are always the same length.
#[derive(Debug, Default)]
pub struct GallerySnapshot {
    pub identities: Vec<String>,
    pub embeddings: Vec<Embedding>,
}

impl GallerySnapshot {
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

/// Counters from one refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshStats {
    /// Records decoded into the new snapshot.
    pub loaded: usize,
    /// Records skipped because their embedding blob failed to decode.
    pub skipped: usize,
}

/// Atomically-swappable snapshot of the gallery, refreshed from the store.
pub struct GalleryCache {
    store: Arc<dyn GalleryStore>,
    snapshot: RwLock<Arc<GallerySnapshot>>,
    /// Serializes refresh passes. The periodic tick skips when it is held;
    /// forced refreshes (register/delete) queue on it.
    refresh_lock: Mutex<()>,
    degraded: AtomicBool,
    refresh_task_started: AtomicBool,
}

impl GalleryCache {
    pub fn new(store: Arc<dyn GalleryStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(GallerySnapshot::default())),
            refresh_lock: Mutex::new(()),
            degraded: AtomicBool::new(false),
            refresh_task_started: AtomicBool::new(false),
        }
    }

    /// The most recently published snapshot.
    ///
    /// Never blocks longer than a concurrent publish swap; the returned
    /// snapshot stays coherent for as long as the caller holds it.
    pub async fn current(&self) -> Arc<GallerySnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Whether the last refresh attempt failed to read the store.
    pub fn degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Rebuild the snapshot from the store and publish it.
    ///
    /// On store failure the previously published snapshot is left untouched
    /// and the error goes to this caller only; readers of [`current`](Self::current)
    /// keep the last-known-good view.
    pub async fn refresh(&self) -> Result<RefreshStats, StoreError> {
        let _guard = self.refresh_lock.lock().await;
        self.load_and_publish().await
    }

    async fn load_and_publish(&self) -> Result<RefreshStats, StoreError> {
        // Store I/O and decoding happen with no snapshot lock held.
        let rows = match self.store.get_all().await {
            Ok(rows) => rows,
            Err(error) => {
                self.degraded.store(true, Ordering::SeqCst);
                tracing::error!(%error, "gallery refresh failed; keeping last-known-good snapshot");
                return Err(error);
            }
        };

        let mut identities = Vec::with_capacity(rows.len());
        let mut embeddings = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;

        for (identity_id, blob) in rows {
            match Embedding::from_le_bytes(&blob) {
                Ok(embedding) => {
                    identities.push(identity_id);
                    embeddings.push(embedding);
                }
                Err(error) => {
                    skipped += 1;
                    tracing::warn!(identity = %identity_id, %error, "skipping undecodable gallery record");
                }
            }
        }

        let stats = RefreshStats {
            loaded: identities.len(),
            skipped,
        };
        let next = Arc::new(GallerySnapshot {
            identities,
            embeddings,
        });

        // Publish: the only exclusive section, a pointer swap.
        *self.snapshot.write().await = next;
        self.degraded.store(false, Ordering::SeqCst);

        tracing::debug!(loaded = stats.loaded, skipped = stats.skipped, "gallery snapshot published");
        Ok(stats)
    }

    /// Spawn the periodic refresh task.
    ///
    /// Singleton per cache: a second call is a no-op. The task runs for the
    /// process lifetime; a tick that finds a refresh already in flight is
    /// skipped, not queued, and failures never escape the task.
    pub fn spawn_refresh_task(self: Arc<Self>, interval: Duration) -> bool {
        if self.refresh_task_started.swap(true, Ordering::SeqCst) {
            tracing::warn!("gallery refresh task already running; not spawning another");
            return false;
        }

        let cache = self;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match cache.refresh_lock.try_lock() {
                    Ok(_guard) => {
                        if let Err(error) = cache.load_and_publish().await {
                            tracing::warn!(%error, "scheduled gallery refresh failed");
                        }
                    }
                    Err(_) => {
                        tracing::debug!("refresh in progress, skipping scheduled tick");
                    }
                }
            }
        });

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    use crate::store::Upsert;

    /// Store stub with programmable rows and failure injection.
    #[derive(Default)]
    struct StubStore {
        rows: StdMutex<Vec<(String, Vec<u8>)>>,
        fail_reads: AtomicBool,
    }

    impl StubStore {
        fn set_rows(&self, rows: Vec<(String, Vec<u8>)>) {
            *self.rows.lock().unwrap() = rows;
        }

        fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl GalleryStore for StubStore {
        async fn get_all(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Io(std::io::Error::other("disk gone")));
            }
            Ok(self.rows.lock().unwrap().clone())
        }

        async fn upsert(&self, identity_id: &str, embedding: &Embedding) -> Result<Upsert, StoreError> {
            let mut rows = self.rows.lock().unwrap();
            let blob = embedding.to_le_bytes();
            if let Some(row) = rows.iter_mut().find(|(id, _)| id == identity_id) {
                row.1 = blob;
                Ok(Upsert::Updated)
            } else {
                rows.push((identity_id.to_string(), blob));
                Ok(Upsert::Inserted)
            }
        }

        async fn delete(&self, identity_id: &str) -> Result<bool, StoreError> {
            let mut rows = self.rows.lock().unwrap();
            let before = rows.len();
            rows.retain(|(id, _)| id != identity_id);
            Ok(rows.len() != before)
        }

        async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
            Ok(self.rows.lock().unwrap().iter().map(|(id, _)| id.clone()).collect())
        }
    }

    fn blob(values: &[f32]) -> Vec<u8> {
        Embedding::new(values.to_vec()).to_le_bytes()
    }

    #[tokio::test]
    async fn test_refresh_publishes_aligned_snapshot() {
        let store = Arc::new(StubStore::default());
        store.set_rows(vec![
            ("alice".into(), blob(&[1.0, 0.0])),
            ("bob".into(), blob(&[0.0, 1.0])),
        ]);
        let cache = GalleryCache::new(store);

        let stats = cache.refresh().await.unwrap();
        assert_eq!(stats, RefreshStats { loaded: 2, skipped: 0 });

        let snapshot = cache.current().await;
        assert_eq!(snapshot.identities.len(), snapshot.embeddings.len());
        assert_eq!(snapshot.identities, vec!["alice", "bob"]);
        assert!(!cache.degraded());
    }

    #[tokio::test]
    async fn test_empty_store_yields_valid_empty_snapshot() {
        let cache = GalleryCache::new(Arc::new(StubStore::default()));
        cache.refresh().await.unwrap();
        let snapshot = cache.current().await;
        assert!(snapshot.is_empty());
        assert_eq!(snapshot.len(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_record_is_skipped_not_fatal() {
        let store = Arc::new(StubStore::default());
        store.set_rows(vec![
            ("alice".into(), blob(&[1.0, 0.0])),
            ("mangled".into(), vec![1, 2, 3]), // not a multiple of 4
            ("bob".into(), blob(&[0.0, 1.0])),
        ]);
        let cache = GalleryCache::new(store);

        let stats = cache.refresh().await.unwrap();
        assert_eq!(stats, RefreshStats { loaded: 2, skipped: 1 });

        let snapshot = cache.current().await;
        assert_eq!(snapshot.identities, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_degraded_refresh_keeps_last_known_good() {
        let store = Arc::new(StubStore::default());
        store.set_rows(vec![("alice".into(), blob(&[1.0]))]);
        let cache = GalleryCache::new(Arc::clone(&store) as Arc<dyn GalleryStore>);

        cache.refresh().await.unwrap();
        let before = cache.current().await;

        store.fail_reads(true);
        assert!(cache.refresh().await.is_err());
        assert!(cache.degraded());

        // Readers still see the pre-failure snapshot, unchanged.
        let after = cache.current().await;
        assert!(Arc::ptr_eq(&before, &after));

        // Recovery clears the degraded flag.
        store.fail_reads(false);
        cache.refresh().await.unwrap();
        assert!(!cache.degraded());
    }

    #[tokio::test]
    async fn test_concurrent_reads_never_observe_mismatch() {
        let store = Arc::new(StubStore::default());
        let cache = Arc::new(GalleryCache::new(Arc::clone(&store) as Arc<dyn GalleryStore>));

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = cache.current().await;
                    assert_eq!(snapshot.identities.len(), snapshot.embeddings.len());
                    tokio::task::yield_now().await;
                }
            })
        };

        for i in 0..50 {
            let rows = (0..=i % 7)
                .map(|k| (format!("id{k}"), blob(&[k as f32, 1.0])))
                .collect();
            store.set_rows(rows);
            cache.refresh().await.unwrap();
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_task_is_singleton() {
        let cache = Arc::new(GalleryCache::new(Arc::new(StubStore::default())));
        assert!(Arc::clone(&cache).spawn_refresh_task(Duration::from_secs(5)));
        assert!(!Arc::clone(&cache).spawn_refresh_task(Duration::from_secs(5)));
    }
}
