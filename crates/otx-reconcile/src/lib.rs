//! Reconciler: applies upstream broadcast outcomes to request receipts, pool
//! entries, and any attached sync-wait sinks.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

use otx_broadcast::PerItemOutcome;
use otx_db::Store;
use otx_schemas::{ErrorKind, Outpoint, ReceiptState};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("storage error: {0}")]
    Store(#[from] otx_db::StoreError),
}

/// Terminal result delivered to a synchronous waiter.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Success { tx_id: String, upstream_status: String },
    Failed { kind: ErrorKind, message: String },
}

/// A single-slot, non-blocking notification sink attached to a receipt for
/// the duration of a synchronous request. Owned by the waiter; the
/// reconciler only ever attempts a non-blocking send.
pub type SyncSink = oneshot::Sender<SyncOutcome>;

/// One unit of dispatched work: the receipt it belongs to, the pool entry it
/// bound, and (if the caller is waiting synchronously) its sink.
pub struct BatchItem {
    pub uuid: Uuid,
    pub outpoint: Outpoint,
    pub sink: Option<SyncSink>,
}

/// Pure classification of an outcome into the receipt/entry disposition it
/// implies. Exposed separately from `apply_outcomes` so the mapping itself
/// is unit-testable without a store.
pub fn classify(outcome: &PerItemOutcome) -> (ReceiptState, EntryDisposition, SyncOutcome) {
    match outcome {
        PerItemOutcome::Accepted { upstream_status, tx_id } => (
            ReceiptState::Success,
            EntryDisposition::Spend,
            SyncOutcome::Success {
                tx_id: tx_id.clone(),
                upstream_status: upstream_status.clone(),
            },
        ),
        PerItemOutcome::Rejected { reason } => (
            ReceiptState::Failed,
            EntryDisposition::Release,
            SyncOutcome::Failed {
                kind: ErrorKind::UpstreamRejected,
                message: reason.clone(),
            },
        ),
        PerItemOutcome::DoubleSpend { tx_id, .. } => (
            ReceiptState::Failed,
            EntryDisposition::Spend,
            SyncOutcome::Failed {
                kind: ErrorKind::DoubleSpent,
                message: format!("output already spent by {tx_id}"),
            },
        ),
        PerItemOutcome::TransportError => (
            ReceiptState::Failed,
            EntryDisposition::Release,
            SyncOutcome::Failed {
                kind: ErrorKind::UpstreamUnavailable,
                message: "transport error contacting upstream".to_string(),
            },
        ),
    }
}

/// What should happen to the bound pool entry as a result of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryDisposition {
    Spend,
    Release,
}

/// Apply `outcomes` (in the order returned by the broadcaster, matching
/// `items`'s order) to the store, and fire any attached sync sinks.
///
/// `items` and `outcomes` must be the same length and in the same order as
/// the batch that was dispatched; this is a caller invariant, not re-checked
/// here beyond a length assertion.
pub async fn apply_outcomes<S: Store + ?Sized>(
    store: &S,
    items: Vec<BatchItem>,
    outcomes: Vec<PerItemOutcome>,
    deadline: Option<Duration>,
) -> Result<(), ReconcileError> {
    assert_eq!(items.len(), outcomes.len(), "batch/outcome length mismatch");

    for (item, outcome) in items.into_iter().zip(outcomes.into_iter()) {
        let (state, disposition, sync_outcome) = classify(&outcome);

        let (tx_id, upstream_status, error) = match &sync_outcome {
            SyncOutcome::Success { tx_id, upstream_status } => {
                (Some(tx_id.as_str()), Some(upstream_status.as_str()), None)
            }
            SyncOutcome::Failed { message, .. } => (None, None, Some(message.as_str())),
        };

        if let Err(e) = store
            .update_receipt_state(item.uuid, state, tx_id, upstream_status, error, deadline)
            .await
        {
            warn!(uuid = %item.uuid, error = %e, "failed to persist receipt state during reconciliation");
        }

        let entry_result = match disposition {
            EntryDisposition::Spend => store.mark_entry_spent(&item.outpoint, deadline).await,
            EntryDisposition::Release => store.release_entry(&item.outpoint, deadline).await,
        };
        if let Err(e) = entry_result {
            warn!(outpoint = %item.outpoint, error = %e, "failed to update pool entry during reconciliation");
        }

        if let Some(sink) = item.sink {
            // Non-blocking by construction: `oneshot::Sender::send` never
            // awaits. If the receiver already timed out and dropped, this is
            // a no-op — the caller has moved on to the async path.
            let _ = sink.send(sync_outcome);
        }
    }

    Ok(())
}
