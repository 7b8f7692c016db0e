//! Axum router and all HTTP handlers for otx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use otx_auth::{hash_token, new_client_record, AuthError, AuthRequest, SignatureFields};
use otx_builder::{validate_payload, BuildError};
use otx_db::StoreError;
use otx_pool::PoolError;
use otx_reconcile::SyncOutcome;
use otx_schemas::{ErrorKind, RequestReceipt, Tier};
use otx_scheduler::{EnqueueError, WorkItem};

use crate::api_types::{
    HealthResponse, KeyStatusResponse, OkResponse, PublicKeyRequest, PublishAcceptedResponse,
    PublishErrorResponse, PublishQuery, PublishRequest, PublishSuccessResponse,
    RegisterClientRequest, RegisterClientResponse, StatusResponse, UpdateClientSecurityRequest,
    UtxoCounts,
};
use crate::state::AppState;

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/publish", post(publish))
        .route("/status/:uuid", get(get_status))
        .route("/health", get(health))
        .route("/admin/clients/register", post(register_client))
        .route("/admin/clients/:id/security", patch(update_client_security))
        .route("/auth/register-public-key", post(register_public_key))
        .route("/auth/rotate-public-key", post(rotate_public_key))
        .route("/auth/key-status", get(key_status))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error taxonomy -> HTTP mapping
// ---------------------------------------------------------------------------

fn status_for_kind(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::UpstreamRejected => StatusCode::BAD_GATEWAY,
        ErrorKind::DoubleSpent => StatusCode::CONFLICT,
        ErrorKind::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(kind: ErrorKind, message: impl Into<String>) -> Response {
    (
        status_for_kind(kind),
        Json(PublishErrorResponse {
            error: message.into(),
            kind: kind.as_str(),
        }),
    )
        .into_response()
}

fn auth_error_response(err: AuthError) -> Response {
    let kind = err.kind();
    error_response(kind, err.to_string())
}

// ---------------------------------------------------------------------------
// Admin / client auth extraction
// ---------------------------------------------------------------------------

fn admin_authorized(headers: &HeaderMap, state: &AppState) -> bool {
    headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .map(|token| token == state.settings.admin_token)
        .unwrap_or(false)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-api-key").and_then(|v| v.to_str().ok())
}

fn signature_fields<'a>(
    headers: &'a HeaderMap,
    signature_bytes: &'a mut Option<Vec<u8>>,
) -> Option<SignatureFields<'a>> {
    let signature_hex = headers.get("x-signature")?.to_str().ok()?;
    let timestamp: i64 = headers.get("x-timestamp")?.to_str().ok()?.parse().ok()?;
    let nonce = headers.get("x-nonce")?.to_str().ok()?;
    *signature_bytes = hex::decode(signature_hex).ok();
    Some(SignatureFields {
        signature: signature_bytes.as_deref()?,
        timestamp,
        nonce,
    })
}

// ---------------------------------------------------------------------------
// POST /publish
// ---------------------------------------------------------------------------

async fn publish(
    State(st): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(q): Query<PublishQuery>,
    headers: HeaderMap,
    Json(req): Json<PublishRequest>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(ErrorKind::Unauthenticated, "missing X-Api-Key header");
    };

    let payload = match hex::decode(&req.data) {
        Ok(bytes) => bytes,
        Err(_) => return error_response(ErrorKind::InvalidArgument, "data is not valid hex"),
    };

    let mut signature_storage = None;
    let sig_fields = signature_fields(&headers, &mut signature_storage);
    let auth_req = AuthRequest {
        token,
        peer_addr: Some(addr.ip()),
        payload: &payload,
        signature_fields: sig_fields,
    };

    let client = match otx_auth::authenticate(&*st.store, &auth_req, st.auth_policy, Utc::now()).await {
        Ok(client) => client,
        Err(e) => return auth_error_response(e),
    };

    if let Err(e) = validate_payload(&payload, st.settings.max_payload_len) {
        let message = match e {
            BuildError::PayloadTooLarge { len, max } => {
                format!("payload length {len} exceeds maximum {max}")
            }
            BuildError::PayloadEmpty => "payload is empty".to_string(),
            BuildError::Signing(msg) => msg,
        };
        return error_response(ErrorKind::InvalidArgument, message);
    }

    let entry = match st.pool.allocate().await {
        Ok(entry) => entry,
        Err(PoolError::Exhausted) => {
            return error_response(ErrorKind::ResourceExhausted, "output pool exhausted")
        }
        Err(PoolError::Store(e)) => {
            warn!(error = %e, "pool allocation failed");
            return error_response(ErrorKind::Internal, "storage error during allocation");
        }
    };
    let outpoint = entry.outpoint();

    let built = match st
        .builder
        .build(&outpoint, entry.amount, &entry.spend_script, &payload, &st.signing_key)
    {
        Ok(built) => built,
        Err(e) => {
            let _ = st.pool.release(&outpoint).await;
            warn!(error = %e, "transaction build failed");
            return error_response(ErrorKind::Internal, "failed to build transaction");
        }
    };

    let uuid = Uuid::new_v4();
    let now = Utc::now();
    let receipt = RequestReceipt {
        uuid,
        client_id: client.id,
        tx_bytes: built.wire_bytes.clone(),
        tx_id: None,
        bound_outpoint: outpoint.clone(),
        state: otx_schemas::ReceiptState::Pending,
        upstream_status: None,
        error: None,
        created_at: now,
        updated_at: now,
    };
    if let Err(e) = st.store.insert_receipt(&receipt, Some(st.settings.store_call_deadline)).await {
        let _ = st.pool.release(&outpoint).await;
        warn!(error = %e, "failed to persist receipt");
        return error_response(ErrorKind::Internal, "failed to persist request");
    }

    let (sink, waiter) = if q.wait {
        let (tx, rx) = tokio::sync::oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    };

    let enqueue_result = st.scheduler.try_enqueue(WorkItem {
        uuid,
        outpoint,
        wire_bytes: built.wire_bytes,
        sink,
    });

    let queue_depth = st
        .store
        .count_pending_or_processing_receipts(Some(st.settings.store_call_deadline))
        .await
        .unwrap_or(0);

    match enqueue_result {
        Ok(()) => {}
        Err(EnqueueError::Full) => {
            info!(%uuid, "scheduler queue full, degrading to async reply");
            return (
                StatusCode::ACCEPTED,
                Json(PublishAcceptedResponse {
                    uuid,
                    message: "queued (queue was at capacity; poll /status for progress)",
                    queue_depth,
                }),
            )
                .into_response();
        }
        Err(EnqueueError::Closed) => {
            warn!(%uuid, "scheduler channel closed");
            return error_response(ErrorKind::Internal, "scheduler is not accepting work");
        }
    }

    info!(%uuid, "accepted request for broadcast");

    let Some(waiter) = waiter else {
        return (
            StatusCode::ACCEPTED,
            Json(PublishAcceptedResponse {
                uuid,
                message: "queued",
                queue_depth,
            }),
        )
            .into_response();
    };

    match tokio::time::timeout(st.settings.sync_wait_timeout, waiter).await {
        Ok(Ok(SyncOutcome::Success { tx_id, upstream_status })) => (
            StatusCode::CREATED,
            Json(PublishSuccessResponse {
                uuid,
                txid: tx_id,
                arc_status: upstream_status,
            }),
        )
            .into_response(),
        Ok(Ok(SyncOutcome::Failed { kind, message })) => error_response(kind, message),
        Ok(Err(_)) | Err(_) => (
            StatusCode::ACCEPTED,
            Json(PublishAcceptedResponse {
                uuid,
                message: "still processing; poll /status for the result",
                queue_depth,
            }),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// GET /status/{uuid}
// ---------------------------------------------------------------------------

async fn get_status(State(st): State<Arc<AppState>>, Path(uuid): Path<Uuid>) -> Response {
    match st.store.get_receipt(uuid, Some(st.settings.store_call_deadline)).await {
        Ok(receipt) => (
            StatusCode::OK,
            Json(StatusResponse {
                uuid: receipt.uuid,
                status: receipt.state.as_str(),
                txid: receipt.tx_id,
                arc_status: receipt.upstream_status,
                error: receipt.error,
                created_at: receipt.created_at,
                updated_at: receipt.updated_at,
            }),
        )
            .into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to load receipt");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

async fn health(State(st): State<Arc<AppState>>) -> Response {
    let queue_depth = st
        .store
        .count_pending_or_processing_receipts(Some(st.settings.store_call_deadline))
        .await
        .unwrap_or(0);
    let counts = st.pool.counts().await.unwrap_or_default();

    let get = |key: &str| *counts.get(key).unwrap_or(&0);
    let publishing_available = get("publishing:available");
    let utxos = UtxoCounts {
        publishing_available,
        publishing_locked: get("publishing:allocated"),
        publishing_spent: get("publishing:spent"),
        funding_available: get("seed:available"),
        change_available: get("residual:available"),
    };

    let status = if publishing_available > 0 { "healthy" } else { "degraded" };

    (StatusCode::OK, Json(HealthResponse { status, queue_depth, utxos })).into_response()
}

// ---------------------------------------------------------------------------
// POST /admin/clients/register
// ---------------------------------------------------------------------------

async fn register_client(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RegisterClientRequest>,
) -> Response {
    if !admin_authorized(&headers, &st) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let tier = req
        .tier
        .as_deref()
        .and_then(Tier::parse)
        .unwrap_or(Tier::Pilot);

    let plaintext_token = format!("otx_{}", Uuid::new_v4().simple());
    let mut client = new_client_record(req.name, tier, &plaintext_token);
    client.daily_limit = req.max_daily_tx.unwrap_or(0);
    client.allowed_origins = req.allowed_ips.unwrap_or_default();
    if let Some(pk_hex) = req.public_key {
        match hex::decode(&pk_hex) {
            Ok(bytes) => client.current_public_key = Some(bytes),
            Err(_) => return error_response(ErrorKind::InvalidArgument, "public_key is not valid hex"),
        }
    }

    if let Err(e) = st.store.insert_client(&client, Some(st.settings.store_call_deadline)).await {
        warn!(error = %e, "failed to register client");
        return error_response(ErrorKind::Internal, "failed to register client");
    }

    (
        StatusCode::CREATED,
        Json(RegisterClientResponse {
            id: client.id,
            access_token: plaintext_token,
            tier: client.tier.as_str(),
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// PATCH /admin/clients/:id/security
// ---------------------------------------------------------------------------

async fn update_client_security(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateClientSecurityRequest>,
) -> Response {
    if !admin_authorized(&headers, &st) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let tier = match req.tier.as_deref().map(Tier::parse) {
        Some(Some(t)) => Some(t),
        Some(None) => return error_response(ErrorKind::InvalidArgument, "unknown tier"),
        None => None,
    };

    let result = st
        .store
        .update_client_security(
            id,
            tier,
            req.require_signature,
            req.allowed_ips,
            req.grace_period_hours,
            None,
            None,
            Some(st.settings.store_call_deadline),
        )
        .await;

    match result {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            warn!(error = %e, "failed to update client security");
            error_response(ErrorKind::Internal, "failed to update client")
        }
    }
}

// ---------------------------------------------------------------------------
// Client self-service key management
// ---------------------------------------------------------------------------

async fn resolve_caller(headers: &HeaderMap, st: &AppState) -> Result<otx_schemas::ClientRecord, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error_response(ErrorKind::Unauthenticated, "missing X-Api-Key header"));
    };
    st.store
        .get_client_by_token_hash(&hash_token(token), Some(st.settings.store_call_deadline))
        .await
        .map_err(|e| match e {
            StoreError::NotFound => error_response(ErrorKind::Unauthenticated, "unknown access token"),
            other => {
                warn!(error = %other, "failed to resolve caller");
                error_response(ErrorKind::Internal, "storage error")
            }
        })
}

async fn register_public_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PublicKeyRequest>,
) -> Response {
    let client = match resolve_caller(&headers, &st).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if client.current_public_key.is_some() {
        return error_response(
            ErrorKind::PermissionDenied,
            "a public key is already registered; use rotate-public-key",
        );
    }
    apply_key_update(&st, client.id, req).await
}

async fn rotate_public_key(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PublicKeyRequest>,
) -> Response {
    let client = match resolve_caller(&headers, &st).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if client.current_public_key.is_none() {
        return error_response(
            ErrorKind::PermissionDenied,
            "no public key registered yet; use register-public-key",
        );
    }
    apply_key_update(&st, client.id, req).await
}

async fn apply_key_update(st: &AppState, client_id: Uuid, req: PublicKeyRequest) -> Response {
    let Ok(key_bytes) = hex::decode(&req.public_key) else {
        return error_response(ErrorKind::InvalidArgument, "public_key is not valid hex");
    };
    match st
        .store
        .rotate_client_public_key(client_id, key_bytes, Utc::now(), Some(st.settings.store_call_deadline))
        .await
    {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to update public key");
            error_response(ErrorKind::Internal, "failed to update public key")
        }
    }
}

async fn key_status(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let client = match resolve_caller(&headers, &st).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    (
        StatusCode::OK,
        Json(KeyStatusResponse {
            has_current_key: client.current_public_key.is_some(),
            has_previous_key: client.previous_public_key.is_some(),
            last_rotation: client.last_rotation,
            grace_window_hours: client.grace_window_hours,
        }),
    )
        .into_response()
}
