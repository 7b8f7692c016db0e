//! Persistent store adapter for the OP_RETURN broadcasting core.
//!
//! Everything above this crate talks to storage through the `Store` trait.
//! `PgStore` is the production implementation (Postgres via `sqlx`); `MemStore`
//! (behind the `testkit` feature) is a deterministic in-memory double used by
//! the rest of the workspace's test suites.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use otx_schemas::{ClientRecord, EntryKind, EntryState, Outpoint, PoolEntry, ReceiptState, RequestReceipt, Tier};

pub const ENV_DB_URL: &str = "OTX_DATABASE_URL";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("pool exhausted: no available publishing entry")]
    PoolExhausted,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("operation exceeded its deadline")]
    Timeout,
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Counts of pool entries grouped by `(kind, state)`, keyed as
/// `"{kind}:{state}"` — the shape the `/health` and admin status surfaces
/// report verbatim.
pub type PoolCounts = HashMap<String, i64>;

/// Storage boundary every other crate programs against.
///
/// All mutations that must be atomic with respect to concurrent callers
/// (allocate, release, spend) are individual trait methods rather than a
/// transaction handle exposed to callers — this mirrors the outbox
/// claim/release/mark-sent protocol this crate is modeled on: the invariant
/// lives inside the query, not in caller discipline.
///
/// Every operation takes a `deadline`: `Some(d)` bounds the call to `d` via
/// `tokio::time::timeout`, surfacing `StoreError::Timeout` on expiry; `None`
/// waits indefinitely. `PgStore` enforces this; `MemStore` accepts the
/// parameter for signature parity but never blocks long enough for it to
/// matter.
#[async_trait]
pub trait Store: Send + Sync {
    /// Atomically claim one available publishing entry and mark it
    /// allocated. Returns `StoreError::PoolExhausted` if none are available.
    async fn find_and_allocate_publishing_entry(
        &self,
        deadline: Option<Duration>,
    ) -> Result<PoolEntry, StoreError>;

    /// Revert an allocated entry back to available. Used when building or
    /// broadcasting a transaction bound to it fails before it is spent.
    async fn release_entry(&self, outpoint: &Outpoint, deadline: Option<Duration>) -> Result<(), StoreError>;

    /// Mark an allocated entry spent. Terminal — a spent entry never
    /// transitions again.
    async fn mark_entry_spent(&self, outpoint: &Outpoint, deadline: Option<Duration>) -> Result<(), StoreError>;

    /// Release every entry that has been allocated for longer than
    /// `threshold`, relative to `now`. Returns the outpoints reclaimed.
    async fn reclaim_stuck_allocations(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
        deadline: Option<Duration>,
    ) -> Result<Vec<Outpoint>, StoreError>;

    /// Counts of pool entries by kind and state, for health/status reporting.
    async fn pool_counts(&self, deadline: Option<Duration>) -> Result<PoolCounts, StoreError>;

    /// Insert a freshly created request receipt in `pending` state.
    async fn insert_receipt(&self, receipt: &RequestReceipt, deadline: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch a receipt by its client-visible uuid.
    async fn get_receipt(&self, uuid: Uuid, deadline: Option<Duration>) -> Result<RequestReceipt, StoreError>;

    /// Transition a receipt's state, optionally recording `tx_id`,
    /// `upstream_status`, and/or `error`.
    async fn update_receipt_state(
        &self,
        uuid: Uuid,
        state: ReceiptState,
        tx_id: Option<&str>,
        upstream_status: Option<&str>,
        error: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Look up a client by the sha256 hash of its bearer token.
    async fn get_client_by_token_hash(
        &self,
        token_hash: &str,
        deadline: Option<Duration>,
    ) -> Result<ClientRecord, StoreError>;

    /// Look up a client by id (used by admin endpoints).
    async fn get_client_by_id(&self, id: Uuid, deadline: Option<Duration>) -> Result<ClientRecord, StoreError>;

    /// Register a new client at its tier's default policy.
    async fn insert_client(&self, client: &ClientRecord, deadline: Option<Duration>) -> Result<(), StoreError>;

    /// Update the mutable security-policy fields of a client (admin-only).
    #[allow(clippy::too_many_arguments)]
    async fn update_client_security(
        &self,
        id: Uuid,
        tier: Option<Tier>,
        require_signature: Option<bool>,
        allowed_origins: Option<Vec<String>>,
        grace_window_hours: Option<i64>,
        daily_limit: Option<i64>,
        active: Option<bool>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Record a public-key rotation, shifting the current key to previous.
    async fn rotate_client_public_key(
        &self,
        id: Uuid,
        new_public_key: Vec<u8>,
        rotated_at: DateTime<Utc>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Atomically check-and-record a nonce for replay prevention. Returns
    /// `false` if the nonce was already seen for this client. Entries older
    /// than `replay_window` relative to `seen_at` are pruned as part of the
    /// same call rather than left to accumulate.
    async fn check_and_record_nonce(
        &self,
        client_id: Uuid,
        nonce: &str,
        seen_at: DateTime<Utc>,
        replay_window: chrono::Duration,
        deadline: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Atomically increment a client's daily counter, resetting it first if
    /// `today` is past `daily_reset_date`. Returns the post-increment count.
    async fn increment_daily_count(
        &self,
        id: Uuid,
        today: NaiveDate,
        deadline: Option<Duration>,
    ) -> Result<i64, StoreError>;

    /// Count of receipts whose state is `pending` or `processing` — the
    /// `queueDepth` reported by `/health`.
    async fn count_pending_or_processing_receipts(&self, deadline: Option<Duration>) -> Result<i64, StoreError>;
}

/// Connect to Postgres using `OTX_DATABASE_URL`.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Run `fut` under `deadline` when one is given, mapping expiry to
/// `StoreError::Timeout`. Every `PgStore` method body is wrapped in this.
async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, fut).await.unwrap_or(Err(StoreError::Timeout)),
        None => fut.await,
    }
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// Production `Store` backed by Postgres.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_pool_entry(row: &sqlx::postgres::PgRow) -> Result<PoolEntry, StoreError> {
    Ok(PoolEntry {
        producer_tx_id: row.try_get("producer_tx_id").map_err(|e| StoreError::Backend(e.into()))?,
        vout: row.try_get("vout").map_err(|e| StoreError::Backend(e.into()))?,
        amount: row.try_get("amount").map_err(|e| StoreError::Backend(e.into()))?,
        spend_script: row.try_get("spend_script").map_err(|e| StoreError::Backend(e.into()))?,
        kind: EntryKind::parse(&row.try_get::<String, _>("kind").map_err(|e| StoreError::Backend(e.into()))?)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt entry kind")))?,
        state: EntryState::parse(&row.try_get::<String, _>("state").map_err(|e| StoreError::Backend(e.into()))?)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt entry state")))?,
        allocated_at: row.try_get("allocated_at").map_err(|e| StoreError::Backend(e.into()))?,
        spent_at: row.try_get("spent_at").map_err(|e| StoreError::Backend(e.into()))?,
        created_at: row.try_get("created_at").map_err(|e| StoreError::Backend(e.into()))?,
        updated_at: row.try_get("updated_at").map_err(|e| StoreError::Backend(e.into()))?,
    })
}

fn row_to_client(row: &sqlx::postgres::PgRow) -> Result<ClientRecord, StoreError> {
    let origins_json: serde_json::Value =
        row.try_get("allowed_origins").map_err(|e| StoreError::Backend(e.into()))?;
    let allowed_origins: Vec<String> = serde_json::from_value(origins_json).unwrap_or_default();
    Ok(ClientRecord {
        id: row.try_get("id").map_err(|e| StoreError::Backend(e.into()))?,
        name: row.try_get("name").map_err(|e| StoreError::Backend(e.into()))?,
        token_hash: row.try_get("token_hash").map_err(|e| StoreError::Backend(e.into()))?,
        tier: Tier::parse(&row.try_get::<String, _>("tier").map_err(|e| StoreError::Backend(e.into()))?)
            .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt tier")))?,
        current_public_key: row.try_get("current_public_key").map_err(|e| StoreError::Backend(e.into()))?,
        previous_public_key: row.try_get("previous_public_key").map_err(|e| StoreError::Backend(e.into()))?,
        last_rotation: row.try_get("last_rotation").map_err(|e| StoreError::Backend(e.into()))?,
        require_signature: row.try_get("require_signature").map_err(|e| StoreError::Backend(e.into()))?,
        grace_window_hours: row.try_get("grace_window_hours").map_err(|e| StoreError::Backend(e.into()))?,
        allowed_origins,
        daily_limit: row.try_get("daily_limit").map_err(|e| StoreError::Backend(e.into()))?,
        daily_count: row.try_get("daily_count").map_err(|e| StoreError::Backend(e.into()))?,
        daily_reset_date: row.try_get("daily_reset_date").map_err(|e| StoreError::Backend(e.into()))?,
        active: row.try_get("active").map_err(|e| StoreError::Backend(e.into()))?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn find_and_allocate_publishing_entry(
        &self,
        deadline: Option<Duration>,
    ) -> Result<PoolEntry, StoreError> {
        with_deadline(deadline, async {
            let row = sqlx::query(
                r#"
                with to_claim as (
                    select producer_tx_id, vout
                    from pool_entries
                    where state = 'available' and kind = 'publishing'
                    order by created_at asc
                    limit 1
                    for update skip locked
                )
                update pool_entries
                   set state = 'allocated',
                       allocated_at = now(),
                       updated_at = now()
                 where (producer_tx_id, vout) in (select producer_tx_id, vout from to_claim)
                returning producer_tx_id, vout, amount, spend_script, kind, state,
                          allocated_at, spent_at, created_at, updated_at
                "#,
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            match row {
                Some(row) => row_to_pool_entry(&row),
                None => Err(StoreError::PoolExhausted),
            }
        })
        .await
    }

    async fn release_entry(&self, outpoint: &Outpoint, deadline: Option<Duration>) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let row: Option<(String,)> = sqlx::query_as(
                r#"
                update pool_entries
                   set state = 'available',
                       allocated_at = null,
                       updated_at = now()
                 where producer_tx_id = $1 and vout = $2 and state = 'allocated'
                returning producer_tx_id
                "#,
            )
            .bind(&outpoint.producer_tx_id)
            .bind(outpoint.vout)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn mark_entry_spent(&self, outpoint: &Outpoint, deadline: Option<Duration>) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let row: Option<(String,)> = sqlx::query_as(
                r#"
                update pool_entries
                   set state = 'spent',
                       spent_at = now(),
                       updated_at = now()
                 where producer_tx_id = $1 and vout = $2 and state = 'allocated'
                returning producer_tx_id
                "#,
            )
            .bind(&outpoint.producer_tx_id)
            .bind(outpoint.vout)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn reclaim_stuck_allocations(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
        deadline: Option<Duration>,
    ) -> Result<Vec<Outpoint>, StoreError> {
        with_deadline(deadline, async {
            let cutoff = now - threshold;
            let rows = sqlx::query(
                r#"
                update pool_entries
                   set state = 'available',
                       allocated_at = null,
                       updated_at = now()
                 where state = 'allocated' and allocated_at < $1
                returning producer_tx_id, vout
                "#,
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            rows.iter()
                .map(|row| {
                    Ok(Outpoint::new(
                        row.try_get::<String, _>("producer_tx_id").map_err(|e| StoreError::Backend(e.into()))?,
                        row.try_get("vout").map_err(|e| StoreError::Backend(e.into()))?,
                    ))
                })
                .collect()
        })
        .await
    }

    async fn pool_counts(&self, deadline: Option<Duration>) -> Result<PoolCounts, StoreError> {
        with_deadline(deadline, async {
            let rows = sqlx::query(
                r#"select kind, state, count(*)::bigint as n from pool_entries group by kind, state"#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            let mut out = PoolCounts::new();
            for row in rows {
                let kind: String = row.try_get("kind").map_err(|e| StoreError::Backend(e.into()))?;
                let state: String = row.try_get("state").map_err(|e| StoreError::Backend(e.into()))?;
                let n: i64 = row.try_get("n").map_err(|e| StoreError::Backend(e.into()))?;
                out.insert(format!("{kind}:{state}"), n);
            }
            Ok(out)
        })
        .await
    }

    async fn insert_receipt(&self, receipt: &RequestReceipt, deadline: Option<Duration>) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            sqlx::query(
                r#"
                insert into requests (
                    uuid, client_id, tx_bytes, tx_id, bound_tx_id, bound_vout,
                    state, upstream_status, error, created_at, updated_at
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(receipt.uuid)
            .bind(receipt.client_id)
            .bind(&receipt.tx_bytes)
            .bind(&receipt.tx_id)
            .bind(&receipt.bound_outpoint.producer_tx_id)
            .bind(receipt.bound_outpoint.vout)
            .bind(receipt.state.as_str())
            .bind(&receipt.upstream_status)
            .bind(&receipt.error)
            .bind(receipt.created_at)
            .bind(receipt.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            Ok(())
        })
        .await
    }

    async fn get_receipt(&self, uuid: Uuid, deadline: Option<Duration>) -> Result<RequestReceipt, StoreError> {
        with_deadline(deadline, async {
            let row = sqlx::query(
                r#"
                select uuid, client_id, tx_bytes, tx_id, bound_tx_id, bound_vout,
                       state, upstream_status, error, created_at, updated_at
                from requests where uuid = $1
                "#,
            )
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;

            Ok(RequestReceipt {
                uuid: row.try_get("uuid").map_err(|e| StoreError::Backend(e.into()))?,
                client_id: row.try_get("client_id").map_err(|e| StoreError::Backend(e.into()))?,
                tx_bytes: row.try_get("tx_bytes").map_err(|e| StoreError::Backend(e.into()))?,
                tx_id: row.try_get("tx_id").map_err(|e| StoreError::Backend(e.into()))?,
                bound_outpoint: Outpoint::new(
                    row.try_get::<String, _>("bound_tx_id").map_err(|e| StoreError::Backend(e.into()))?,
                    row.try_get("bound_vout").map_err(|e| StoreError::Backend(e.into()))?,
                ),
                state: ReceiptState::parse(
                    &row.try_get::<String, _>("state").map_err(|e| StoreError::Backend(e.into()))?,
                )
                .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("corrupt receipt state")))?,
                upstream_status: row.try_get("upstream_status").map_err(|e| StoreError::Backend(e.into()))?,
                error: row.try_get("error").map_err(|e| StoreError::Backend(e.into()))?,
                created_at: row.try_get("created_at").map_err(|e| StoreError::Backend(e.into()))?,
                updated_at: row.try_get("updated_at").map_err(|e| StoreError::Backend(e.into()))?,
            })
        })
        .await
    }

    async fn update_receipt_state(
        &self,
        uuid: Uuid,
        state: ReceiptState,
        tx_id: Option<&str>,
        upstream_status: Option<&str>,
        error: Option<&str>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let row: Option<(Uuid,)> = sqlx::query_as(
                r#"
                update requests
                   set state = $2,
                       tx_id = coalesce($3, tx_id),
                       upstream_status = coalesce($4, upstream_status),
                       error = coalesce($5, error),
                       updated_at = now()
                 where uuid = $1
                returning uuid
                "#,
            )
            .bind(uuid)
            .bind(state.as_str())
            .bind(tx_id)
            .bind(upstream_status)
            .bind(error)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn get_client_by_token_hash(
        &self,
        token_hash: &str,
        deadline: Option<Duration>,
    ) -> Result<ClientRecord, StoreError> {
        with_deadline(deadline, async {
            let row = sqlx::query(
                r#"
                select id, name, token_hash, tier, current_public_key, previous_public_key,
                       last_rotation, require_signature, grace_window_hours, allowed_origins,
                       daily_limit, daily_count, daily_reset_date, active
                from clients where token_hash = $1
                "#,
            )
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
            row_to_client(&row)
        })
        .await
    }

    async fn get_client_by_id(&self, id: Uuid, deadline: Option<Duration>) -> Result<ClientRecord, StoreError> {
        with_deadline(deadline, async {
            let row = sqlx::query(
                r#"
                select id, name, token_hash, tier, current_public_key, previous_public_key,
                       last_rotation, require_signature, grace_window_hours, allowed_origins,
                       daily_limit, daily_count, daily_reset_date, active
                from clients where id = $1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?
            .ok_or(StoreError::NotFound)?;
            row_to_client(&row)
        })
        .await
    }

    async fn insert_client(&self, client: &ClientRecord, deadline: Option<Duration>) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let origins_json = serde_json::to_value(&client.allowed_origins).unwrap_or_default();
            sqlx::query(
                r#"
                insert into clients (
                    id, name, token_hash, tier, current_public_key, previous_public_key,
                    last_rotation, require_signature, grace_window_hours, allowed_origins,
                    daily_limit, daily_count, daily_reset_date, active
                ) values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
                "#,
            )
            .bind(client.id)
            .bind(&client.name)
            .bind(&client.token_hash)
            .bind(client.tier.as_str())
            .bind(&client.current_public_key)
            .bind(&client.previous_public_key)
            .bind(client.last_rotation)
            .bind(client.require_signature)
            .bind(client.grace_window_hours)
            .bind(origins_json)
            .bind(client.daily_limit)
            .bind(client.daily_count)
            .bind(client.daily_reset_date)
            .bind(client.active)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            Ok(())
        })
        .await
    }

    async fn update_client_security(
        &self,
        id: Uuid,
        tier: Option<Tier>,
        require_signature: Option<bool>,
        allowed_origins: Option<Vec<String>>,
        grace_window_hours: Option<i64>,
        daily_limit: Option<i64>,
        active: Option<bool>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let origins_json = allowed_origins.map(|o| serde_json::to_value(o).unwrap_or_default());
            let tier_str = tier.map(|t| t.as_str().to_string());
            let row: Option<(Uuid,)> = sqlx::query_as(
                r#"
                update clients
                   set tier = coalesce($2, tier),
                       require_signature = coalesce($3, require_signature),
                       allowed_origins = coalesce($4, allowed_origins),
                       grace_window_hours = coalesce($5, grace_window_hours),
                       daily_limit = coalesce($6, daily_limit),
                       active = coalesce($7, active),
                       updated_at = now()
                 where id = $1
                returning id
                "#,
            )
            .bind(id)
            .bind(tier_str)
            .bind(require_signature)
            .bind(origins_json)
            .bind(grace_window_hours)
            .bind(daily_limit)
            .bind(active)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn rotate_client_public_key(
        &self,
        id: Uuid,
        new_public_key: Vec<u8>,
        rotated_at: DateTime<Utc>,
        deadline: Option<Duration>,
    ) -> Result<(), StoreError> {
        with_deadline(deadline, async {
            let row: Option<(Uuid,)> = sqlx::query_as(
                r#"
                update clients
                   set previous_public_key = current_public_key,
                       current_public_key = $2,
                       last_rotation = $3,
                       updated_at = now()
                 where id = $1
                returning id
                "#,
            )
            .bind(id)
            .bind(new_public_key)
            .bind(rotated_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|_| ()).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn check_and_record_nonce(
        &self,
        client_id: Uuid,
        nonce: &str,
        seen_at: DateTime<Utc>,
        replay_window: chrono::Duration,
        deadline: Option<Duration>,
    ) -> Result<bool, StoreError> {
        with_deadline(deadline, async {
            let cutoff = seen_at - replay_window;
            // Prune entries this (or any) replay window has already aged out
            // before recording the new one, so the table stays bounded by
            // the window rather than growing forever.
            sqlx::query("delete from auth_nonces where seen_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(e.into()))?;

            let row: Option<(Uuid,)> = sqlx::query_as(
                r#"
                insert into auth_nonces (client_id, nonce, seen_at)
                values ($1, $2, $3)
                on conflict (client_id, nonce) do nothing
                returning client_id
                "#,
            )
            .bind(client_id)
            .bind(nonce)
            .bind(seen_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            Ok(row.is_some())
        })
        .await
    }

    async fn increment_daily_count(
        &self,
        id: Uuid,
        today: NaiveDate,
        deadline: Option<Duration>,
    ) -> Result<i64, StoreError> {
        with_deadline(deadline, async {
            let row: Option<(i64,)> = sqlx::query_as(
                r#"
                update clients
                   set daily_count = case when daily_reset_date < $2 then 1 else daily_count + 1 end,
                       daily_reset_date = $2,
                       updated_at = now()
                 where id = $1
                returning daily_count
                "#,
            )
            .bind(id)
            .bind(today)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;

            row.map(|(n,)| n).ok_or(StoreError::NotFound)
        })
        .await
    }

    async fn count_pending_or_processing_receipts(&self, deadline: Option<Duration>) -> Result<i64, StoreError> {
        with_deadline(deadline, async {
            let (n,): (i64,) = sqlx::query_as(
                r#"select count(*)::bigint from requests where state in ('pending', 'processing')"#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.into()))?;
            Ok(n)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// MemStore — in-memory test double
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "testkit"))]
mod mem_store;

#[cfg(any(test, feature = "testkit"))]
pub use mem_store::MemStore;
