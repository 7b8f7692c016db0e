//! End-to-end scenario tests for otx-daemon's HTTP surface.
//!
//! These drive `routes::build_router` directly via `tower::ServiceExt::oneshot`,
//! wired to `MemStore` + `StubBroadcastClient` + `StubBuilder` so nothing here
//! touches a real database or broadcast upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use otx_auth::new_client_record;
use otx_builder::StubBuilder;
use otx_daemon::{routes, state::AppState};
use otx_db::MemStore;
use otx_schemas::{EntryKind, EntryState, PoolEntry, Tier};

fn peer() -> SocketAddr {
    "203.0.113.7:54321".parse().unwrap()
}

fn seed_publishing_entry(store: &MemStore, vout: i64) {
    let now = Utc::now();
    store.seed_entry(PoolEntry {
        producer_tx_id: format!("{:064x}", vout + 1),
        vout,
        amount: 1_000,
        spend_script: vec![0x76, 0xa9],
        kind: EntryKind::Publishing,
        state: EntryState::Available,
        allocated_at: None,
        spent_at: None,
        created_at: now,
        updated_at: now,
    });
}

async fn build_state(store: Arc<MemStore>) -> Arc<AppState> {
    let settings = Arc::new(otx_config::Settings::test_defaults());
    let pool = Arc::new(otx_pool::PoolManager::new(
        store.clone() as Arc<dyn otx_db::Store>,
        Some(settings.store_call_deadline),
    ));
    let broadcaster: Arc<dyn otx_broadcast::BroadcastClient> =
        Arc::new(otx_broadcast::StubBroadcastClient::always_accept());
    let scheduler_config = otx_scheduler::SchedulerConfig {
        channel_capacity: settings.scheduler_channel_capacity,
        tick: settings.scheduler_tick,
        max_batch: settings.scheduler_max_batch,
        drain_deadline: settings.scheduler_drain_deadline,
        store_call_deadline: Some(settings.store_call_deadline),
    };
    let (scheduler_handle, _shutdown, _join) =
        otx_scheduler::spawn(scheduler_config, broadcaster, store.clone() as Arc<dyn otx_db::Store>);
    let builder: Arc<dyn otx_builder::TransactionBuilder> = Arc::new(StubBuilder::new());

    Arc::new(AppState::new(
        store as Arc<dyn otx_db::Store>,
        pool,
        builder,
        scheduler_handle,
        settings,
    ))
}

fn request_with_peer(method: &str, uri: &str, headers: &[(&str, &str)], body: Value) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();
    let (mut parts, body) = req.into_parts();
    parts.extensions.insert(ConnectInfo(peer()));
    Request::from_parts(parts, body)
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn publish_accepted_without_wait() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    let token = "plaintext-token".to_string();
    store.seed_client(client);

    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json"), ("x-api-key", &token)],
        json!({"data": "deadbeef"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body = json_body(resp).await;
    assert!(body.get("uuid").is_some());
    assert!(body.get("queueDepth").is_some(), "response must use the wire field queueDepth: {body}");
    assert!(body.get("queue_depth").is_none(), "response must not also carry snake_case queue_depth: {body}");
}

#[tokio::test]
async fn publish_rejects_missing_token() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json")],
        json!({"data": "deadbeef"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publish_rejects_unknown_token() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json"), ("x-api-key", "not-a-real-token")],
        json!({"data": "deadbeef"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn publish_rejects_non_hex_payload() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    store.seed_client(client);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"data": "not hex!!"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn publish_exhausted_pool_returns_429() {
    let store = Arc::new(MemStore::new());
    let client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    store.seed_client(client);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"data": "deadbeef"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(resp).await;
    assert_eq!(body["kind"], "resource_exhausted");
}

#[tokio::test]
async fn publish_rejects_origin_outside_allowlist() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let mut client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    client.allowed_origins = vec!["198.51.100.0/24".to_string()];
    store.seed_client(client);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/publish",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"data": "deadbeef"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn status_unknown_uuid_returns_404() {
    let store = Arc::new(MemStore::new());
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = Request::builder()
        .method("GET")
        .uri(format!("/status/{}", uuid::Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_degraded_when_pool_empty() {
    let store = Arc::new(MemStore::new());
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["queueDepth"], 0);
    assert!(body.get("queue_depth").is_none(), "response must not also carry snake_case queue_depth: {body}");
}

#[tokio::test]
async fn health_reports_healthy_with_available_entries() {
    let store = Arc::new(MemStore::new());
    seed_publishing_entry(&store, 0);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = Request::builder().method("GET").uri("/health").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    let body = json_body(resp).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["utxos"]["publishing_available"], 1);
}

#[tokio::test]
async fn admin_register_client_requires_admin_token() {
    let store = Arc::new(MemStore::new());
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/admin/clients/register",
        &[("content-type", "application/json")],
        json!({"name": "acme"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_register_client_succeeds_and_issues_token() {
    let store = Arc::new(MemStore::new());
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "POST",
        "/admin/clients/register",
        &[
            ("content-type", "application/json"),
            ("x-admin-token", "test-admin-token"),
        ],
        json!({"name": "acme", "tier": "enterprise"}),
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = json_body(resp).await;
    assert_eq!(body["tier"], "enterprise");
    assert!(body["access_token"].as_str().unwrap().starts_with("otx_"));
}

#[tokio::test]
async fn register_public_key_then_rotate() {
    let store = Arc::new(MemStore::new());
    let client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    let client_id = client.id;
    store.seed_client(client);
    let state = build_state(store.clone()).await;
    let app = routes::build_router(state.clone());

    let req = request_with_peer(
        "POST",
        "/auth/register-public-key",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"public_key": "03aaaa"}),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // A second register attempt must be rejected; rotate must work instead.
    let req = request_with_peer(
        "POST",
        "/auth/register-public-key",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"public_key": "03bbbb"}),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = request_with_peer(
        "POST",
        "/auth/rotate-public-key",
        &[("content-type", "application/json"), ("x-api-key", "plaintext-token")],
        json!({"public_key": "03bbbb"}),
    );
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let updated = otx_db::Store::get_client_by_token_hash(
        store.as_ref(),
        &otx_auth::hash_token("plaintext-token"),
        None,
    )
    .await
    .unwrap();
    assert_eq!(updated.id, client_id);
    assert_eq!(updated.current_public_key, Some(hex::decode("03bbbb").unwrap()));
    assert_eq!(updated.previous_public_key, Some(hex::decode("03aaaa").unwrap()));
}

#[tokio::test]
async fn key_status_reports_no_key_initially() {
    let store = Arc::new(MemStore::new());
    let client = new_client_record("client-a".to_string(), Tier::Pilot, "plaintext-token");
    store.seed_client(client);
    let state = build_state(store).await;
    let app = routes::build_router(state);

    let req = request_with_peer(
        "GET",
        "/auth/key-status",
        &[("x-api-key", "plaintext-token")],
        Value::Null,
    );
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["has_current_key"], false);
}
