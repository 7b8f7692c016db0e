//! Deterministic in-memory `Store`, used in place of `PgStore` by every other
//! crate's test suite. No randomness, no wall-clock reads beyond what the
//! caller passes in.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use otx_schemas::{ClientRecord, EntryState, Outpoint, PoolEntry, ReceiptState, RequestReceipt};

use crate::{PoolCounts, Store, StoreError};

#[derive(Default)]
struct Inner {
    entries: HashMap<Outpoint, PoolEntry>,
    receipts: HashMap<Uuid, RequestReceipt>,
    clients_by_id: HashMap<Uuid, ClientRecord>,
    nonces: HashMap<(Uuid, String), DateTime<Utc>>,
}

/// In-memory `Store`. Seed it with `seed_entry`/`seed_client` before use.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn seed_entry(&self, entry: PoolEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(entry.outpoint(), entry);
    }

    pub fn seed_client(&self, client: ClientRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.clients_by_id.insert(client.id, client);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn find_and_allocate_publishing_entry(
        &self,
        _deadline: Option<Duration>,
    ) -> Result<PoolEntry, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut candidates: Vec<&Outpoint> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Available && e.kind == otx_schemas::EntryKind::Publishing)
            .map(|(k, _)| k)
            .collect();
        candidates.sort_by(|a, b| {
            let ea = &inner.entries[a];
            let eb = &inner.entries[b];
            ea.created_at.cmp(&eb.created_at)
        });
        let Some(key) = candidates.first().cloned().cloned() else {
            return Err(StoreError::PoolExhausted);
        };
        let entry = inner.entries.get_mut(&key).unwrap();
        entry.state = EntryState::Allocated;
        entry.allocated_at = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn release_entry(&self, outpoint: &Outpoint, _deadline: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(outpoint).ok_or(StoreError::NotFound)?;
        if entry.state != EntryState::Allocated {
            return Err(StoreError::Conflict("entry not allocated".to_string()));
        }
        entry.state = EntryState::Available;
        entry.allocated_at = None;
        Ok(())
    }

    async fn mark_entry_spent(&self, outpoint: &Outpoint, _deadline: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(outpoint).ok_or(StoreError::NotFound)?;
        if entry.state != EntryState::Allocated {
            return Err(StoreError::Conflict("entry not allocated".to_string()));
        }
        entry.state = EntryState::Spent;
        entry.spent_at = Some(Utc::now());
        Ok(())
    }

    async fn reclaim_stuck_allocations(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
        _deadline: Option<Duration>,
    ) -> Result<Vec<Outpoint>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now - threshold;
        let mut reclaimed = Vec::new();
        for entry in inner.entries.values_mut() {
            if entry.state == EntryState::Allocated {
                if let Some(allocated_at) = entry.allocated_at {
                    if allocated_at < cutoff {
                        entry.state = EntryState::Available;
                        entry.allocated_at = None;
                        reclaimed.push(entry.outpoint());
                    }
                }
            }
        }
        Ok(reclaimed)
    }

    async fn pool_counts(&self, _deadline: Option<Duration>) -> Result<PoolCounts, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut out = PoolCounts::new();
        for entry in inner.entries.values() {
            *out.entry(format!("{}:{}", entry.kind.as_str(), entry.state.as_str())).or_insert(0) += 1;
        }
        Ok(out)
    }

    async fn insert_receipt(&self, receipt: &RequestReceipt, _deadline: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.receipts.contains_key(&receipt.uuid) {
            return Err(StoreError::Conflict("receipt already exists".to_string()));
        }
        inner.receipts.insert(receipt.uuid, receipt.clone());
        Ok(())
    }

    async fn get_receipt(&self, uuid: Uuid, _deadline: Option<Duration>) -> Result<RequestReceipt, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.receipts.get(&uuid).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_receipt_state(
        &self,
        uuid: Uuid,
        state: ReceiptState,
        tx_id: Option<&str>,
        upstream_status: Option<&str>,
        error: Option<&str>,
        _deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let receipt = inner.receipts.get_mut(&uuid).ok_or(StoreError::NotFound)?;
        receipt.state = state;
        if let Some(tx_id) = tx_id {
            receipt.tx_id = Some(tx_id.to_string());
        }
        if let Some(status) = upstream_status {
            receipt.upstream_status = Some(status.to_string());
        }
        if let Some(error) = error {
            receipt.error = Some(error.to_string());
        }
        receipt.updated_at = Utc::now();
        Ok(())
    }

    async fn get_client_by_token_hash(
        &self,
        token_hash: &str,
        _deadline: Option<Duration>,
    ) -> Result<ClientRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .clients_by_id
            .values()
            .find(|c| c.token_hash == token_hash)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn get_client_by_id(&self, id: Uuid, _deadline: Option<Duration>) -> Result<ClientRecord, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.clients_by_id.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn insert_client(&self, client: &ClientRecord, _deadline: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.clients_by_id.contains_key(&client.id) {
            return Err(StoreError::Conflict("client already exists".to_string()));
        }
        inner.clients_by_id.insert(client.id, client.clone());
        Ok(())
    }

    async fn update_client_security(
        &self,
        id: Uuid,
        tier: Option<otx_schemas::Tier>,
        require_signature: Option<bool>,
        allowed_origins: Option<Vec<String>>,
        grace_window_hours: Option<i64>,
        daily_limit: Option<i64>,
        active: Option<bool>,
        _deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let client = inner.clients_by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(v) = tier {
            client.tier = v;
        }
        if let Some(v) = require_signature {
            client.require_signature = v;
        }
        if let Some(v) = allowed_origins {
            client.allowed_origins = v;
        }
        if let Some(v) = grace_window_hours {
            client.grace_window_hours = v;
        }
        if let Some(v) = daily_limit {
            client.daily_limit = v;
        }
        if let Some(v) = active {
            client.active = v;
        }
        Ok(())
    }

    async fn rotate_client_public_key(
        &self,
        id: Uuid,
        new_public_key: Vec<u8>,
        rotated_at: DateTime<Utc>,
        _deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let client = inner.clients_by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        client.previous_public_key = client.current_public_key.take();
        client.current_public_key = Some(new_public_key);
        client.last_rotation = Some(rotated_at);
        Ok(())
    }

    async fn check_and_record_nonce(
        &self,
        client_id: Uuid,
        nonce: &str,
        seen_at: DateTime<Utc>,
        replay_window: chrono::Duration,
        _deadline: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = seen_at - replay_window;
        inner.nonces.retain(|_, &mut seen| seen >= cutoff);
        let key = (client_id, nonce.to_string());
        if inner.nonces.contains_key(&key) {
            return Ok(false);
        }
        inner.nonces.insert(key, seen_at);
        Ok(true)
    }

    async fn increment_daily_count(
        &self,
        id: Uuid,
        today: NaiveDate,
        _deadline: Option<Duration>,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let client = inner.clients_by_id.get_mut(&id).ok_or(StoreError::NotFound)?;
        if client.daily_reset_date < today {
            client.daily_count = 1;
            client.daily_reset_date = today;
        } else {
            client.daily_count += 1;
        }
        Ok(client.daily_count)
    }

    async fn count_pending_or_processing_receipts(&self, _deadline: Option<Duration>) -> Result<i64, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .receipts
            .values()
            .filter(|r| matches!(r.state, ReceiptState::Pending | ReceiptState::Processing))
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otx_schemas::{EntryKind, Tier};

    fn entry(tx: &str, vout: i64, state: EntryState) -> PoolEntry {
        let now = Utc::now();
        PoolEntry {
            producer_tx_id: tx.to_string(),
            vout,
            amount: 1000,
            spend_script: vec![0xac],
            kind: EntryKind::Publishing,
            state,
            allocated_at: None,
            spent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn allocate_then_spend_is_terminal() {
        let store = MemStore::new();
        store.seed_entry(entry("a", 0, EntryState::Available));

        let allocated = store.find_and_allocate_publishing_entry(None).await.unwrap();
        assert_eq!(allocated.state, EntryState::Allocated);

        store.mark_entry_spent(&allocated.outpoint(), None).await.unwrap();
        let err = store.release_entry(&allocated.outpoint(), None).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn allocate_exhausted_pool_errors() {
        let store = MemStore::new();
        let err = store.find_and_allocate_publishing_entry(None).await.unwrap_err();
        assert!(matches!(err, StoreError::PoolExhausted));
    }

    #[tokio::test]
    async fn nonce_replay_is_rejected_once() {
        let store = MemStore::new();
        let client_id = Uuid::nil();
        let window = chrono::Duration::seconds(300);
        let now = Utc::now();
        assert!(store.check_and_record_nonce(client_id, "n1", now, window, None).await.unwrap());
        assert!(!store.check_and_record_nonce(client_id, "n1", now, window, None).await.unwrap());
    }

    #[tokio::test]
    async fn nonce_outside_replay_window_is_pruned_and_reaccepted() {
        let store = MemStore::new();
        let client_id = Uuid::nil();
        let window = chrono::Duration::seconds(60);
        let first_seen = Utc::now() - chrono::Duration::seconds(120);
        assert!(store.check_and_record_nonce(client_id, "n1", first_seen, window, None).await.unwrap());

        let later = Utc::now();
        assert!(store.check_and_record_nonce(client_id, "n1", later, window, None).await.unwrap());
    }

    #[tokio::test]
    async fn daily_count_resets_on_new_day() {
        let store = MemStore::new();
        let id = Uuid::nil();
        store.seed_client(ClientRecord {
            id,
            name: "acme".to_string(),
            token_hash: "hash".to_string(),
            tier: Tier::Pilot,
            current_public_key: None,
            previous_public_key: None,
            last_rotation: None,
            require_signature: false,
            grace_window_hours: 0,
            allowed_origins: vec![],
            daily_limit: 100,
            daily_count: 5,
            daily_reset_date: chrono::NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            active: true,
        });

        let today = chrono::NaiveDate::from_ymd_opt(2026, 1, 2).unwrap();
        let n = store.increment_daily_count(id, today, None).await.unwrap();
        assert_eq!(n, 1);
    }
}
