//! Batching scheduler ("train"): a single long-running worker that collects
//! work on a bounded channel and dispatches on a tick or at capacity,
//! whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use otx_broadcast::{BroadcastClient, PerItemOutcome};
use otx_db::Store;
use otx_reconcile::{apply_outcomes, BatchItem, SyncSink};
use otx_schemas::{Outpoint, ReceiptState};

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("scheduler queue is full")]
    Full,
    #[error("scheduler is shutting down")]
    Closed,
}

/// One unit of work handed from intake to the scheduler.
pub struct WorkItem {
    pub uuid: Uuid,
    pub outpoint: Outpoint,
    pub wire_bytes: Vec<u8>,
    pub sink: Option<SyncSink>,
}

/// Handle given to request intake. Enqueuing is always non-blocking: a full
/// queue is reported to the caller rather than awaited.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<WorkItem>,
}

impl SchedulerHandle {
    pub fn try_enqueue(&self, item: WorkItem) -> Result<(), EnqueueError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

/// Configuration for one scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub channel_capacity: usize,
    pub tick: Duration,
    pub max_batch: usize,
    pub drain_deadline: Duration,
    /// Bound applied to every `Store` call the dispatch loop makes.
    pub store_call_deadline: Option<Duration>,
}

/// Spawn the scheduler loop. Returns a handle for intake to enqueue work and
/// a `watch::Sender<bool>` the caller signals (set to `true`) to begin an
/// orderly shutdown; the returned `JoinHandle` completes once the scheduler
/// has drained and exited.
pub fn spawn<B, S>(
    config: SchedulerConfig,
    broadcaster: Arc<B>,
    store: Arc<S>,
) -> (SchedulerHandle, watch::Sender<bool>, tokio::task::JoinHandle<()>)
where
    B: BroadcastClient + ?Sized + 'static,
    S: Store + ?Sized + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler {
        rx,
        broadcaster,
        store,
        config: config.clone(),
    };

    let join = tokio::spawn(scheduler.run(shutdown_rx));

    (SchedulerHandle { tx }, shutdown_tx, join)
}

struct Scheduler<B: ?Sized, S: ?Sized> {
    rx: mpsc::Receiver<WorkItem>,
    broadcaster: Arc<B>,
    store: Arc<S>,
    config: SchedulerConfig,
}

impl<B, S> Scheduler<B, S>
where
    B: BroadcastClient + ?Sized,
    S: Store + ?Sized,
{
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut acc: Vec<WorkItem> = Vec::new();
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        break;
                    }
                }

                maybe_item = self.rx.recv() => {
                    match maybe_item {
                        Some(item) => {
                            acc.push(item);
                            if acc.len() >= self.config.max_batch {
                                let batch = std::mem::take(&mut acc);
                                self.dispatch(batch).await;
                            }
                        }
                        None => break,
                    }
                }

                _ = ticker.tick() => {
                    if !acc.is_empty() {
                        let batch = std::mem::take(&mut acc);
                        self.dispatch(batch).await;
                    }
                }
            }
        }

        let drain = async {
            loop {
                match self.rx.try_recv() {
                    Ok(item) => {
                        acc.push(item);
                        if acc.len() >= self.config.max_batch {
                            let batch = std::mem::take(&mut acc);
                            self.dispatch(batch).await;
                        }
                    }
                    Err(_) => break,
                }
            }
            if !acc.is_empty() {
                let batch = std::mem::take(&mut acc);
                self.dispatch(batch).await;
            }
        };

        if tokio::time::timeout(self.config.drain_deadline, drain).await.is_err() {
            warn!("scheduler drain deadline exceeded, remaining work left in the channel");
        }
    }

    async fn dispatch(&self, batch: Vec<WorkItem>) {
        let deadline = self.config.store_call_deadline;

        for item in &batch {
            if let Err(e) = self
                .store
                .update_receipt_state(item.uuid, ReceiptState::Processing, None, None, None, deadline)
                .await
            {
                warn!(uuid = %item.uuid, error = %e, "failed to mark receipt processing");
            }
        }

        let wire: Vec<Vec<u8>> = batch.iter().map(|item| item.wire_bytes.clone()).collect();
        let batch_len = batch.len();

        let outcomes = match self.broadcaster.broadcast(&wire).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(error = %e, batch_size = batch_len, "broadcast transport error, failing whole batch");
                vec![PerItemOutcome::TransportError; batch_len]
            }
        };

        let items: Vec<BatchItem> = batch
            .into_iter()
            .map(|item| BatchItem {
                uuid: item.uuid,
                outpoint: item.outpoint,
                sink: item.sink,
            })
            .collect();

        info!(batch_size = batch_len, "dispatched batch");

        if let Err(e) = apply_outcomes(&*self.store, items, outcomes, deadline).await {
            warn!(error = %e, "reconciliation failed for dispatched batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otx_broadcast::StubBroadcastClient;
    use otx_db::MemStore;
    use otx_schemas::{EntryKind, EntryState, PoolEntry, RequestReceipt};

    fn seeded_entry(tx: &str) -> PoolEntry {
        let now = chrono::Utc::now();
        PoolEntry {
            producer_tx_id: tx.to_string(),
            vout: 0,
            amount: 100,
            spend_script: vec![0xac],
            kind: EntryKind::Publishing,
            state: EntryState::Allocated,
            allocated_at: Some(now),
            spent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dispatches_on_capacity_before_tick() {
        let store = Arc::new(MemStore::new());
        let broadcaster = Arc::new(StubBroadcastClient::always_accept());

        let config = SchedulerConfig {
            channel_capacity: 10,
            tick: Duration::from_secs(60),
            max_batch: 2,
            drain_deadline: Duration::from_secs(5),
            store_call_deadline: None,
        };
        let (handle, shutdown, join) = spawn(config, broadcaster, store.clone());

        for i in 0..2 {
            let tx = format!("tx{i}");
            store.seed_entry(seeded_entry(&tx));
            let uuid = Uuid::new_v4();
            let now = chrono::Utc::now();
            store
                .insert_receipt(
                    &RequestReceipt {
                        uuid,
                        client_id: Uuid::nil(),
                        tx_bytes: vec![1],
                        tx_id: None,
                        bound_outpoint: Outpoint::new(tx.clone(), 0),
                        state: ReceiptState::Pending,
                        upstream_status: None,
                        error: None,
                        created_at: now,
                        updated_at: now,
                    },
                    None,
                )
                .await
                .unwrap();
            handle
                .try_enqueue(WorkItem {
                    uuid,
                    outpoint: Outpoint::new(tx, 0),
                    wire_bytes: vec![1, 2, 3],
                    sink: None,
                })
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        let counts = store.pool_counts(None).await.unwrap();
        assert_eq!(counts.get("publishing:spent"), Some(&2));

        shutdown.send(true).unwrap();
        join.await.unwrap();
    }

    #[test]
    fn enqueue_fails_when_queue_full() {
        // Exercises SchedulerHandle directly against an un-drained channel
        // so fullness is deterministic (no consumer racing to drain it).
        let (tx, _rx) = mpsc::channel(1);
        let handle = SchedulerHandle { tx };

        handle
            .try_enqueue(WorkItem {
                uuid: Uuid::new_v4(),
                outpoint: Outpoint::new("a", 0),
                wire_bytes: vec![],
                sink: None,
            })
            .unwrap();

        let err = handle
            .try_enqueue(WorkItem {
                uuid: Uuid::new_v4(),
                outpoint: Outpoint::new("b", 0),
                wire_bytes: vec![],
                sink: None,
            })
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Full));
    }
}
