use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::BackupRecord;

/// How long a listing is served before the bucket is enumerated again.
pub const LISTING_TTL: Duration = Duration::from_secs(300);

/// Records as of one enumeration, newest first.
#[derive(Debug, Clone)]
pub struct ListingSnapshot {
    records: Vec<BackupRecord>,
    captured_at: Instant,
    valid_until: Instant,
}

impl ListingSnapshot {
    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn find(&self, backup_id: &str) -> Option<&BackupRecord> {
        self.records.iter().find(|r| r.backup_id == backup_id)
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.valid_until
    }
}

#[derive(Debug, Default)]
struct CacheState {
    snapshot: Option<Arc<ListingSnapshot>>,
    generation: u64,
}

/// Time-bounded memo of the last enumeration.
///
/// Snapshots are swapped whole behind an `Arc`, so a reader holds either the
/// previous or the new snapshot, never a partial one. Concurrent refreshes are
/// not deduplicated; the last one installed wins.
#[derive(Debug)]
pub struct ListingCache {
    ttl: Duration,
    state: RwLock<CacheState>,
}

impl Default for ListingCache {
    fn default() -> Self {
        Self::new(LISTING_TTL)
    }
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        ListingCache {
            ttl,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// The current snapshot if it has not expired.
    pub fn peek(&self) -> Option<Arc<ListingSnapshot>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .snapshot
            .as_ref()
            .filter(|s| s.is_fresh(Instant::now()))
            .map(Arc::clone)
    }

    /// Serve the fresh snapshot, or run `refresh` and install its result.
    ///
    /// A refresh that started before an [`invalidate`](Self::invalidate) is
    /// returned to its caller but not installed.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<Arc<ListingSnapshot>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<BackupRecord>, E>>,
    {
        if let Some(snapshot) = self.peek() {
            return Ok(snapshot);
        }

        let generation = self.generation();
        let records = refresh().await?;
        let captured_at = Instant::now();
        let snapshot = Arc::new(ListingSnapshot {
            records,
            captured_at,
            valid_until: captured_at + self.ttl,
        });

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.generation == generation {
            state.snapshot = Some(Arc::clone(&snapshot));
        } else {
            debug!("listing invalidated during refresh, not caching it");
        }
        Ok(snapshot)
    }

    /// Drop the current snapshot regardless of its deadline.
    pub fn invalidate(&self) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.snapshot = None;
        state.generation += 1;
    }

    fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }
}
