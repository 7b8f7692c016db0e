//! Output-pool manager: hands out pre-minted single-use outputs for exactly
//! one in-flight broadcast attempt at a time, and reclaims allocations that
//! are abandoned before they are spent or released.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use otx_db::{Store, StoreError};
use otx_schemas::{Outpoint, PoolEntry};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool exhausted: no available publishing entry")]
    Exhausted,
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Output-pool manager, generic over the storage backend. `S` is left
/// `?Sized` so callers can share one manager over `Arc<dyn Store>`.
pub struct PoolManager<S: Store + ?Sized> {
    store: Arc<S>,
    /// Bound applied to every `Store` call this manager makes.
    store_deadline: Option<Duration>,
}

impl<S: Store + ?Sized> PoolManager<S> {
    pub fn new(store: Arc<S>, store_deadline: Option<Duration>) -> Self {
        Self { store, store_deadline }
    }

    /// Claim one available publishing entry. The caller owns it exclusively
    /// until it calls `release` or `spend`.
    pub async fn allocate(&self) -> Result<PoolEntry, PoolError> {
        match self.store.find_and_allocate_publishing_entry(self.store_deadline).await {
            Ok(entry) => Ok(entry),
            Err(StoreError::PoolExhausted) => Err(PoolError::Exhausted),
            Err(e) => Err(PoolError::Store(e)),
        }
    }

    /// Return an allocated entry to the available pool. Used when a build or
    /// broadcast attempt bound to it fails before the entry is spent.
    pub async fn release(&self, outpoint: &Outpoint) -> Result<(), PoolError> {
        self.store.release_entry(outpoint, self.store_deadline).await?;
        Ok(())
    }

    /// Mark an allocated entry spent. Terminal.
    pub async fn spend(&self, outpoint: &Outpoint) -> Result<(), PoolError> {
        self.store.mark_entry_spent(outpoint, self.store_deadline).await?;
        Ok(())
    }

    /// Release every allocation older than `threshold`. Run once at startup
    /// (recovering from a crash mid-allocation) and periodically by the
    /// janitor.
    pub async fn sweep_stuck_allocations(&self, threshold: Duration) -> Result<usize, PoolError> {
        let reclaimed = self
            .store
            .reclaim_stuck_allocations(
                chrono::Duration::from_std(threshold).unwrap(),
                chrono::Utc::now(),
                self.store_deadline,
            )
            .await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed stuck pool allocations");
        }
        Ok(reclaimed.len())
    }

    pub async fn counts(&self) -> Result<otx_db::PoolCounts, PoolError> {
        Ok(self.store.pool_counts(self.store_deadline).await?)
    }
}

/// Spawn the janitor: periodically sweeps allocations stuck past
/// `stuck_threshold`, on a `interval` tick.
pub fn spawn_janitor<S: Store + ?Sized + 'static>(
    pool: Arc<PoolManager<S>>,
    interval: Duration,
    stuck_threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match pool.sweep_stuck_allocations(stuck_threshold).await {
                Ok(n) if n > 0 => info!(reclaimed = n, "janitor sweep reclaimed allocations"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "janitor sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use otx_db::MemStore;
    use otx_schemas::{EntryKind, EntryState};

    fn seeded_entry(tx: &str, state: EntryState) -> PoolEntry {
        PoolEntry {
            producer_tx_id: tx.to_string(),
            vout: 0,
            amount: 1000,
            spend_script: vec![0xac],
            kind: EntryKind::Publishing,
            state,
            allocated_at: None,
            spent_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn allocate_is_exclusive() {
        let store = Arc::new(MemStore::new());
        store.seed_entry(seeded_entry("a", EntryState::Available));
        let pool = PoolManager::new(store, None);

        let first = pool.allocate().await.unwrap();
        assert_eq!(first.state, EntryState::Allocated);

        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted));
    }

    #[tokio::test]
    async fn release_then_reallocate() {
        let store = Arc::new(MemStore::new());
        store.seed_entry(seeded_entry("a", EntryState::Available));
        let pool = PoolManager::new(store, None);

        let entry = pool.allocate().await.unwrap();
        pool.release(&entry.outpoint()).await.unwrap();

        let reallocated = pool.allocate().await.unwrap();
        assert_eq!(reallocated.outpoint(), entry.outpoint());
    }

    #[tokio::test]
    async fn spend_is_terminal() {
        let store = Arc::new(MemStore::new());
        store.seed_entry(seeded_entry("a", EntryState::Available));
        let pool = PoolManager::new(store, None);

        let entry = pool.allocate().await.unwrap();
        pool.spend(&entry.outpoint()).await.unwrap();

        let err = pool.release(&entry.outpoint()).await.unwrap_err();
        assert!(matches!(err, PoolError::Store(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn allocate_times_out_against_a_slow_store() {
        let store = Arc::new(SlowStore::new());
        let pool = PoolManager::new(store, Some(Duration::from_millis(10)));
        let err = pool.allocate().await.unwrap_err();
        assert!(matches!(err, PoolError::Store(StoreError::Timeout)));
    }

    /// `Store` double whose only method actually does anything: every call
    /// sleeps past any deadline under test, so `with_deadline`'s timeout path
    /// in `PgStore` has a unit-level analogue here without a real database.
    struct SlowStore;

    impl SlowStore {
        fn new() -> Self {
            Self
        }
    }

    #[async_trait::async_trait]
    impl Store for SlowStore {
        async fn find_and_allocate_publishing_entry(
            &self,
            deadline: Option<Duration>,
        ) -> Result<PoolEntry, StoreError> {
            let sleep = tokio::time::sleep(Duration::from_secs(3600));
            match deadline {
                Some(d) => tokio::time::timeout(d, sleep).await.map_err(|_| StoreError::Timeout)?,
                None => sleep.await,
            }
            unreachable!("sleep never completes within a test timeout");
        }

        async fn release_entry(&self, _outpoint: &Outpoint, _deadline: Option<Duration>) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn mark_entry_spent(&self, _outpoint: &Outpoint, _deadline: Option<Duration>) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn reclaim_stuck_allocations(
            &self,
            _threshold: chrono::Duration,
            _now: chrono::DateTime<Utc>,
            _deadline: Option<Duration>,
        ) -> Result<Vec<Outpoint>, StoreError> {
            unimplemented!()
        }

        async fn pool_counts(&self, _deadline: Option<Duration>) -> Result<otx_db::PoolCounts, StoreError> {
            unimplemented!()
        }

        async fn insert_receipt(
            &self,
            _receipt: &otx_schemas::RequestReceipt,
            _deadline: Option<Duration>,
        ) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn get_receipt(
            &self,
            _uuid: uuid::Uuid,
            _deadline: Option<Duration>,
        ) -> Result<otx_schemas::RequestReceipt, StoreError> {
            unimplemented!()
        }

        async fn update_receipt_state(
            &self,
            _uuid: uuid::Uuid,
            _state: otx_schemas::ReceiptState,
            _tx_id: Option<&str>,
            _upstream_status: Option<&str>,
            _error: Option<&str>,
            _deadline: Option<Duration>,
        ) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn get_client_by_token_hash(
            &self,
            _token_hash: &str,
            _deadline: Option<Duration>,
        ) -> Result<otx_schemas::ClientRecord, StoreError> {
            unimplemented!()
        }

        async fn get_client_by_id(
            &self,
            _id: uuid::Uuid,
            _deadline: Option<Duration>,
        ) -> Result<otx_schemas::ClientRecord, StoreError> {
            unimplemented!()
        }

        async fn insert_client(
            &self,
            _client: &otx_schemas::ClientRecord,
            _deadline: Option<Duration>,
        ) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn update_client_security(
            &self,
            _id: uuid::Uuid,
            _tier: Option<otx_schemas::Tier>,
            _require_signature: Option<bool>,
            _allowed_origins: Option<Vec<String>>,
            _grace_window_hours: Option<i64>,
            _daily_limit: Option<i64>,
            _active: Option<bool>,
            _deadline: Option<Duration>,
        ) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn rotate_client_public_key(
            &self,
            _id: uuid::Uuid,
            _new_public_key: Vec<u8>,
            _rotated_at: chrono::DateTime<Utc>,
            _deadline: Option<Duration>,
        ) -> Result<(), StoreError> {
            unimplemented!()
        }

        async fn check_and_record_nonce(
            &self,
            _client_id: uuid::Uuid,
            _nonce: &str,
            _seen_at: chrono::DateTime<Utc>,
            _replay_window: chrono::Duration,
            _deadline: Option<Duration>,
        ) -> Result<bool, StoreError> {
            unimplemented!()
        }

        async fn increment_daily_count(
            &self,
            _id: uuid::Uuid,
            _today: chrono::NaiveDate,
            _deadline: Option<Duration>,
        ) -> Result<i64, StoreError> {
            unimplemented!()
        }

        async fn count_pending_or_processing_receipts(&self, _deadline: Option<Duration>) -> Result<i64, StoreError> {
            unimplemented!()
        }
    }
}
