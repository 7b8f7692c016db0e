//! Shared runtime state for otx-daemon.
//!
//! All types here are `Clone`-able (via `Arc`). Handlers receive
//! `State<Arc<AppState>>` from Axum; this module owns nothing async itself.

use std::sync::Arc;

use otx_auth::AuthPolicy;
use otx_config::Settings;
use otx_db::Store;
use otx_pool::PoolManager;
use otx_scheduler::SchedulerHandle;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pool: Arc<PoolManager<dyn Store>>,
    pub builder: Arc<dyn otx_builder::TransactionBuilder>,
    pub scheduler: SchedulerHandle,
    pub settings: Arc<Settings>,
    pub auth_policy: AuthPolicy,
    pub build: BuildInfo,
    /// Process-lifetime placeholder signing material handed to the
    /// transaction builder. Real per-entry signing keys are established out
    /// of band during seed-output discovery, which is outside this core.
    pub signing_key: Vec<u8>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        pool: Arc<PoolManager<dyn Store>>,
        builder: Arc<dyn otx_builder::TransactionBuilder>,
        scheduler: SchedulerHandle,
        settings: Arc<Settings>,
    ) -> Self {
        let auth_policy = AuthPolicy {
            clock_skew: chrono::Duration::from_std(settings.auth_clock_skew).unwrap(),
            replay_window: chrono::Duration::from_std(settings.auth_replay_window).unwrap(),
            store_call_deadline: Some(settings.store_call_deadline),
        };
        Self {
            store,
            pool,
            builder,
            scheduler,
            settings,
            auth_policy,
            build: BuildInfo {
                service: "otx-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            signing_key: rand::random::<[u8; 32]>().to_vec(),
        }
    }
}
