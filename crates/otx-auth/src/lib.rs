//! Tiered authentication middleware, applied in front of request intake.
//!
//! Resolves a client from its hashed access token and runs the per-tier
//! check sequence. Every failure surfaces only the taxonomy class to the
//! caller; the discriminating detail is logged internally.

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use otx_db::{Store, StoreError};
use otx_schemas::{ClientRecord, ErrorKind, Tier};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("permission denied")]
    PermissionDenied,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::Unauthenticated => ErrorKind::Unauthenticated,
            AuthError::PermissionDenied => ErrorKind::PermissionDenied,
            AuthError::ResourceExhausted => ErrorKind::ResourceExhausted,
            AuthError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// The signature-bearing fields of a request, present only when the
/// client's effective policy requires a signature.
pub struct SignatureFields<'a> {
    pub signature: &'a [u8],
    pub timestamp: i64,
    pub nonce: &'a str,
}

/// Everything the middleware needs about one incoming request.
pub struct AuthRequest<'a> {
    pub token: &'a str,
    pub peer_addr: Option<IpAddr>,
    pub payload: &'a [u8],
    pub signature_fields: Option<SignatureFields<'a>>,
}

/// Tunables governing timestamp skew and replay-window enforcement.
#[derive(Debug, Clone, Copy)]
pub struct AuthPolicy {
    pub clock_skew: chrono::Duration,
    /// Nonces older than this are pruned and may be reused.
    pub replay_window: chrono::Duration,
    /// Bound applied to every `Store` call this middleware makes.
    pub store_call_deadline: Option<Duration>,
}

/// sha256 hex digest of a bearer token — the only form ever persisted or
/// looked up against storage.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Run the full per-request check sequence, returning the resolved client on
/// success. `now` is injected so tests can drive calendar-day and
/// grace-window boundaries deterministically.
pub async fn authenticate<S: Store + ?Sized>(
    store: &S,
    req: &AuthRequest<'_>,
    policy: AuthPolicy,
    now: DateTime<Utc>,
) -> Result<ClientRecord, AuthError> {
    let token_hash = hash_token(req.token);
    let client = store
        .get_client_by_token_hash(&token_hash, policy.store_call_deadline)
        .await
        .map_err(|e| match e {
            StoreError::NotFound => AuthError::Unauthenticated,
            other => AuthError::Store(other),
        })?;

    if !client.active {
        return Err(AuthError::PermissionDenied);
    }

    let today: NaiveDate = now.date_naive();
    let effective_count = if client.daily_reset_date < today { 0 } else { client.daily_count };
    if effective_count >= client.daily_limit && client.daily_limit > 0 {
        return Err(AuthError::ResourceExhausted);
    }

    match client.tier {
        Tier::Pilot => {
            check_origin_if_configured(&client, req.peer_addr)?;
        }
        Tier::Enterprise => {
            check_signature(store, &client, req, policy, now).await?;
        }
        Tier::Government => {
            check_origin_mandatory(&client, req.peer_addr)?;
            check_signature(store, &client, req, policy, now).await?;
        }
    }

    let _ = store.increment_daily_count(client.id, today, policy.store_call_deadline).await;

    Ok(client)
}

fn check_origin_if_configured(client: &ClientRecord, peer_addr: Option<IpAddr>) -> Result<(), AuthError> {
    if client.allowed_origins.is_empty() {
        return Ok(());
    }
    match peer_addr {
        Some(addr) if origin_allowed(&client.allowed_origins, addr) => Ok(()),
        _ => Err(AuthError::PermissionDenied),
    }
}

fn check_origin_mandatory(client: &ClientRecord, peer_addr: Option<IpAddr>) -> Result<(), AuthError> {
    match peer_addr {
        Some(addr) if !client.allowed_origins.is_empty() && origin_allowed(&client.allowed_origins, addr) => Ok(()),
        _ => Err(AuthError::PermissionDenied),
    }
}

async fn check_signature<S: Store + ?Sized>(
    store: &S,
    client: &ClientRecord,
    req: &AuthRequest<'_>,
    policy: AuthPolicy,
    now: DateTime<Utc>,
) -> Result<(), AuthError> {
    let Some(fields) = &req.signature_fields else {
        return Err(AuthError::PermissionDenied);
    };

    let ts = DateTime::<Utc>::from_timestamp(fields.timestamp, 0).ok_or(AuthError::PermissionDenied)?;
    let skew = (now - ts).abs();
    if skew > policy.clock_skew {
        debug!(client_id = %client.id, "signature timestamp outside clock skew window");
        return Err(AuthError::PermissionDenied);
    }

    let fresh = store
        .check_and_record_nonce(client.id, fields.nonce, now, policy.replay_window, policy.store_call_deadline)
        .await
        .map_err(AuthError::Store)?;
    if !fresh {
        debug!(client_id = %client.id, "replayed nonce rejected");
        return Err(AuthError::PermissionDenied);
    }

    let in_grace_window = client
        .last_rotation
        .map(|rotated_at| now - rotated_at < chrono::Duration::hours(client.grace_window_hours))
        .unwrap_or(false);

    let candidate_keys: Vec<&[u8]> = if in_grace_window {
        [client.current_public_key.as_deref(), client.previous_public_key.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    } else {
        client.current_public_key.as_deref().into_iter().collect()
    };

    if candidate_keys.is_empty() {
        return Err(AuthError::PermissionDenied);
    }

    let message = signing_message(fields.timestamp, fields.nonce, req.payload);

    for key_bytes in candidate_keys {
        if verify_signature(key_bytes, &message, fields.signature) {
            return Ok(());
        }
    }

    debug!(client_id = %client.id, "signature verification failed against all candidate keys");
    Err(AuthError::PermissionDenied)
}

fn signing_message(timestamp: i64, nonce: &str, payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(payload);
    hasher.finalize().into()
}

fn verify_signature(public_key_bytes: &[u8], message: &[u8; 32], signature_bytes: &[u8]) -> bool {
    let secp = Secp256k1::verification_only();
    let Ok(public_key) = PublicKey::from_slice(public_key_bytes) else {
        return false;
    };
    let Ok(signature) = Signature::from_compact(signature_bytes).or_else(|_| Signature::from_der(signature_bytes))
    else {
        return false;
    };
    let Ok(message) = Message::from_digest_slice(message) else {
        return false;
    };
    secp.verify_ecdsa(&message, &signature, &public_key).is_ok()
}

/// Whether `addr` matches any literal or CIDR entry in `origins`.
fn origin_allowed(origins: &[String], addr: IpAddr) -> bool {
    origins.iter().any(|entry| match entry.split_once('/') {
        Some((base, bits)) => match_cidr(base, bits, addr),
        None => entry.parse::<IpAddr>().map(|lit| lit == addr).unwrap_or(false),
    })
}

fn match_cidr(base: &str, prefix_bits: &str, addr: IpAddr) -> bool {
    let Ok(base_addr) = base.parse::<IpAddr>() else {
        return false;
    };
    let Ok(bits) = prefix_bits.parse::<u32>() else {
        return false;
    };
    match (base_addr, addr) {
        (IpAddr::V4(base), IpAddr::V4(addr)) => {
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits.min(32)) };
            (u32::from(base) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(base), IpAddr::V6(addr)) => {
            let mask = if bits == 0 { 0 } else { u128::MAX << (128 - bits.min(128)) };
            (u128::from(base) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

/// Register a fresh client at its tier's default policy. The caller is
/// responsible for generating and returning the plaintext token to the
/// client exactly once; only its hash is persisted.
pub fn new_client_record(name: String, tier: Tier, plaintext_token: &str) -> ClientRecord {
    let (require_signature, grace_window_hours) = tier.default_policy();
    ClientRecord {
        id: Uuid::new_v4(),
        name,
        token_hash: hash_token(plaintext_token),
        tier,
        current_public_key: None,
        previous_public_key: None,
        last_rotation: None,
        require_signature,
        grace_window_hours,
        allowed_origins: Vec::new(),
        daily_limit: 0,
        daily_count: 0,
        daily_reset_date: Utc::now().date_naive(),
        active: true,
    }
}
