//! The live snapshot reference.
//!
//! Holds exactly one `Arc<Snapshot>` behind a `watch` channel. Publishing is a
//! single reference replacement, so a reader sees either the whole previous
//! snapshot or the whole new one. Readers only clone the `Arc` and release
//! the channel immediately; filtering and sorting then run against their own
//! handle, never holding anything the refresh path needs.

use crate::market::Snapshot;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Returned by reads before the first refresh cycle has published a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no snapshot has been published yet")]
pub struct CacheUninitialized;

/// Shared snapshot cache. Clone-cheap.
#[derive(Clone)]
pub struct SnapshotCache {
    rx: watch::Receiver<Option<Arc<Snapshot>>>,
    tx: Arc<watch::Sender<Option<Arc<Snapshot>>>>,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    /// An empty cache; reads fail with [`CacheUninitialized`] until the first publish.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            rx,
            tx: Arc::new(tx),
        }
    }

    /// The current snapshot. Never blocks on refresh.
    pub fn current(&self) -> Result<Arc<Snapshot>, CacheUninitialized> {
        self.rx.borrow().clone().ok_or(CacheUninitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Atomically replace the live snapshot, returning the published handle.
    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let previous = self.tx.send_replace(Some(Arc::clone(&snapshot)));
        debug!(
            generation = snapshot.generation(),
            records = snapshot.len(),
            previous_generation = previous.as_ref().map(|s| s.generation()),
            "Snapshot published"
        );
        snapshot
    }

    /// A receiver notified on every publish.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Snapshot>>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::MarketRecord;
    use chrono::Utc;

    fn empty(generation: u64) -> Snapshot {
        Snapshot::from_records(generation, Utc::now(), Vec::<MarketRecord>::new())
    }

    #[test]
    fn uninitialized_until_first_publish() {
        let cache = SnapshotCache::new();
        assert_eq!(cache.current().unwrap_err(), CacheUninitialized);
        assert!(!cache.is_initialized());

        cache.publish(empty(1));
        assert!(cache.is_initialized());
        assert_eq!(cache.current().unwrap().generation(), 1);
    }

    #[test]
    fn held_snapshot_survives_replacement() {
        let cache = SnapshotCache::new();
        cache.publish(empty(1));
        let held = cache.current().unwrap();

        cache.publish(empty(2));
        assert_eq!(held.generation(), 1);
        assert_eq!(cache.current().unwrap().generation(), 2);
    }

    #[test]
    fn clones_share_the_live_reference() {
        let cache = SnapshotCache::new();
        let reader = cache.clone();
        cache.publish(empty(7));
        assert_eq!(reader.current().unwrap().generation(), 7);
    }

    #[tokio::test]
    async fn subscribers_observe_publishes() {
        let cache = SnapshotCache::new();
        let mut rx = cache.subscribe();
        cache.publish(empty(4));
        rx.changed().await.unwrap();
        let generation = rx.borrow().as_ref().map(|s| s.generation());
        assert_eq!(generation, Some(4));
    }
}
