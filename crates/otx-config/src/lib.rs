//! Process configuration for the OP_RETURN broadcasting core.
//!
//! Every tunable is resolved once, at startup, from
//! environment variables with documented defaults. Nothing in the rest of
//! the workspace reads `std::env` directly — callers receive a `Settings`
//! value and pass it down.

use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Env var names. Config values are resolved from these once at startup;
/// error messages reference the NAME, never a resolved secret value.
pub mod env_keys {
    pub const DATABASE_URL: &str = "OTX_DATABASE_URL";
    pub const BIND_ADDR: &str = "OTX_BIND_ADDR";
    pub const ADMIN_TOKEN: &str = "OTX_ADMIN_TOKEN";
    pub const BROADCAST_URL: &str = "OTX_BROADCAST_URL";
    pub const SCHEDULER_TICK_MS: &str = "OTX_SCHEDULER_TICK_MS";
    pub const SCHEDULER_MAX_BATCH: &str = "OTX_SCHEDULER_MAX_BATCH";
    pub const SCHEDULER_CHANNEL_CAPACITY: &str = "OTX_SCHEDULER_CHANNEL_CAPACITY";
    pub const SCHEDULER_DRAIN_DEADLINE_MS: &str = "OTX_SCHEDULER_DRAIN_DEADLINE_MS";
    pub const SYNC_WAIT_TIMEOUT_MS: &str = "OTX_SYNC_WAIT_TIMEOUT_MS";
    pub const JANITOR_INTERVAL_SECS: &str = "OTX_JANITOR_INTERVAL_SECS";
    pub const JANITOR_STUCK_THRESHOLD_SECS: &str = "OTX_JANITOR_STUCK_THRESHOLD_SECS";
    pub const BROADCAST_TIMEOUT_MS: &str = "OTX_BROADCAST_TIMEOUT_MS";
    pub const MAX_PAYLOAD_LEN: &str = "OTX_MAX_PAYLOAD_LEN";
    pub const AUTH_CLOCK_SKEW_SECS: &str = "OTX_AUTH_CLOCK_SKEW_SECS";
    pub const AUTH_REPLAY_WINDOW_SECS: &str = "OTX_AUTH_REPLAY_WINDOW_SECS";
    pub const STORE_CALL_DEADLINE_MS: &str = "OTX_STORE_CALL_DEADLINE_MS";
}

/// Resolved process configuration.
///
/// `Debug` redacts `admin_token` and the credential portion of `database_url`
/// and `broadcast_url` — never log these in full (mirrors the redaction
/// convention used elsewhere in this workspace for webhook/API-key secrets).
#[derive(Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,
    pub admin_token: String,
    pub broadcast_url: String,

    pub scheduler_tick: Duration,
    pub scheduler_max_batch: usize,
    pub scheduler_channel_capacity: usize,
    pub scheduler_drain_deadline: Duration,

    pub sync_wait_timeout: Duration,

    pub janitor_interval: Duration,
    pub janitor_stuck_threshold: Duration,

    pub broadcast_timeout: Duration,

    /// Chain-imposed maximum payload length for the data-carrier opcode.
    pub max_payload_len: usize,

    pub auth_clock_skew: Duration,
    pub auth_replay_window: Duration,

    /// Upper bound on a single `Store` operation, enforced via
    /// `tokio::time::timeout` at the call site.
    pub store_call_deadline: Duration,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("database_url", &"<REDACTED>")
            .field("bind_addr", &self.bind_addr)
            .field("admin_token", &"<REDACTED>")
            .field("broadcast_url", &self.broadcast_url)
            .field("scheduler_tick", &self.scheduler_tick)
            .field("scheduler_max_batch", &self.scheduler_max_batch)
            .field("scheduler_channel_capacity", &self.scheduler_channel_capacity)
            .field("scheduler_drain_deadline", &self.scheduler_drain_deadline)
            .field("sync_wait_timeout", &self.sync_wait_timeout)
            .field("janitor_interval", &self.janitor_interval)
            .field("janitor_stuck_threshold", &self.janitor_stuck_threshold)
            .field("broadcast_timeout", &self.broadcast_timeout)
            .field("max_payload_len", &self.max_payload_len)
            .field("auth_clock_skew", &self.auth_clock_skew)
            .field("auth_replay_window", &self.auth_replay_window)
            .field("store_call_deadline", &self.store_call_deadline)
            .finish()
    }
}

impl Settings {
    /// Resolve settings from the process environment. `database_url` and
    /// `admin_token` have no safe default and are required.
    pub fn load_from_env() -> Result<Self> {
        let database_url = std::env::var(env_keys::DATABASE_URL)
            .with_context(|| format!("missing required env var {}", env_keys::DATABASE_URL))?;
        let admin_token = std::env::var(env_keys::ADMIN_TOKEN)
            .with_context(|| format!("missing required env var {}", env_keys::ADMIN_TOKEN))?;

        Ok(Self {
            database_url,
            bind_addr: env_or(env_keys::BIND_ADDR, "127.0.0.1:8080"),
            admin_token,
            broadcast_url: env_or(env_keys::BROADCAST_URL, "http://127.0.0.1:9292/tx/batch"),

            scheduler_tick: Duration::from_millis(env_or_parse(env_keys::SCHEDULER_TICK_MS, 3_000)),
            scheduler_max_batch: env_or_parse(env_keys::SCHEDULER_MAX_BATCH, 1_000),
            scheduler_channel_capacity: env_or_parse(
                env_keys::SCHEDULER_CHANNEL_CAPACITY,
                10_000,
            ),
            scheduler_drain_deadline: Duration::from_millis(env_or_parse(
                env_keys::SCHEDULER_DRAIN_DEADLINE_MS,
                30_000,
            )),

            sync_wait_timeout: Duration::from_millis(env_or_parse(
                env_keys::SYNC_WAIT_TIMEOUT_MS,
                5_000,
            )),

            janitor_interval: Duration::from_secs(env_or_parse(
                env_keys::JANITOR_INTERVAL_SECS,
                600,
            )),
            janitor_stuck_threshold: Duration::from_secs(env_or_parse(
                env_keys::JANITOR_STUCK_THRESHOLD_SECS,
                300,
            )),

            broadcast_timeout: Duration::from_millis(env_or_parse(
                env_keys::BROADCAST_TIMEOUT_MS,
                30_000,
            )),

            max_payload_len: env_or_parse(env_keys::MAX_PAYLOAD_LEN, 100_000),

            auth_clock_skew: Duration::from_secs(env_or_parse(env_keys::AUTH_CLOCK_SKEW_SECS, 300)),
            auth_replay_window: Duration::from_secs(env_or_parse(
                env_keys::AUTH_REPLAY_WINDOW_SECS,
                300,
            )),

            store_call_deadline: Duration::from_millis(env_or_parse(
                env_keys::STORE_CALL_DEADLINE_MS,
                5_000,
            )),
        })
    }

    /// Defaults suitable for tests: no environment lookups, `MemStore`-sized
    /// budgets, a loopback broadcast URL that is never actually dialed by
    /// `StubBroadcastClient`-backed tests.
    pub fn test_defaults() -> Self {
        Self {
            database_url: "postgres://localhost/otx_test".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            admin_token: "test-admin-token".to_string(),
            broadcast_url: "http://127.0.0.1:0/tx/batch".to_string(),
            scheduler_tick: Duration::from_millis(3_000),
            scheduler_max_batch: 1_000,
            scheduler_channel_capacity: 10_000,
            scheduler_drain_deadline: Duration::from_secs(30),
            sync_wait_timeout: Duration::from_secs(5),
            janitor_interval: Duration::from_secs(600),
            janitor_stuck_threshold: Duration::from_secs(300),
            broadcast_timeout: Duration::from_secs(30),
            max_payload_len: 100_000,
            auth_clock_skew: Duration::from_secs(300),
            auth_replay_window: Duration::from_secs(300),
            store_call_deadline: Duration::from_secs(5),
        }
    }

    /// A stable fingerprint of the non-secret tunables, suitable for logging
    /// at startup so operators can tell which configuration a running
    /// process loaded without printing credentials.
    pub fn fingerprint(&self) -> String {
        let canonical = format!(
            "bind_addr={}|broadcast_url={}|tick_ms={}|max_batch={}|chan_cap={}|drain_ms={}|sync_wait_ms={}|janitor_interval_s={}|janitor_threshold_s={}|broadcast_timeout_ms={}|max_payload_len={}|skew_s={}|replay_window_s={}|store_deadline_ms={}",
            self.bind_addr,
            self.broadcast_url,
            self.scheduler_tick.as_millis(),
            self.scheduler_max_batch,
            self.scheduler_channel_capacity,
            self.scheduler_drain_deadline.as_millis(),
            self.sync_wait_timeout.as_millis(),
            self.janitor_interval.as_secs(),
            self.janitor_stuck_threshold.as_secs(),
            self.broadcast_timeout.as_millis(),
            self.max_payload_len,
            self.auth_clock_skew.as_secs(),
            self.auth_replay_window.as_secs(),
            self.store_call_deadline.as_millis(),
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
