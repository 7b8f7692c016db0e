//! Request and response types for all otx-daemon HTTP endpoints.
//!
//! These types are `Serialize`/`Deserialize` so they can be JSON-encoded by
//! Axum and decoded by tests. No business logic lives here.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// POST /publish
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    /// Hex-encoded payload bytes to carry behind the data-carrier opcode.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishQuery {
    #[serde(default)]
    pub wait: bool,
}

/// Returned for both the 202 async-accepted form and the 201-degraded-to-202
/// form (sync requested but the queue was full or the wait timed out).
#[derive(Debug, Clone, Serialize)]
pub struct PublishAcceptedResponse {
    pub uuid: Uuid,
    pub message: &'static str,
    #[serde(rename = "queueDepth")]
    pub queue_depth: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSuccessResponse {
    pub uuid: Uuid,
    pub txid: String,
    pub arc_status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishErrorResponse {
    pub error: String,
    pub kind: &'static str,
}

// ---------------------------------------------------------------------------
// GET /status/{uuid}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub uuid: Uuid,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arc_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct UtxoCounts {
    pub publishing_available: i64,
    pub publishing_locked: i64,
    pub publishing_spent: i64,
    pub funding_available: i64,
    pub change_available: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(rename = "queueDepth")]
    pub queue_depth: i64,
    pub utxos: UtxoCounts,
}

// ---------------------------------------------------------------------------
// POST /admin/clients/register
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterClientRequest {
    pub name: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub max_daily_tx: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterClientResponse {
    pub id: Uuid,
    pub access_token: String,
    pub tier: &'static str,
}

// ---------------------------------------------------------------------------
// PATCH /admin/clients/:id/security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateClientSecurityRequest {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub require_signature: Option<bool>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub grace_period_hours: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

// ---------------------------------------------------------------------------
// /auth/register-public-key, /auth/rotate-public-key, /auth/key-status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyRequest {
    /// Hex-encoded compressed secp256k1 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyStatusResponse {
    pub has_current_key: bool,
    pub has_previous_key: bool,
    pub last_rotation: Option<chrono::DateTime<chrono::Utc>>,
    pub grace_window_hours: i64,
}
