//! Shared data model for the OP_RETURN broadcasting core.
//!
//! Every crate in this workspace that needs to talk about a pool entry, a
//! request receipt, or a client record imports these types rather than
//! defining its own. No business logic lives here — just shapes and the
//! small enums that tag their lifecycle states.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Outpoint
// ---------------------------------------------------------------------------

/// Identity of a UTXO: the producing transaction id (hex, big-endian display
/// form) and the output index within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Outpoint {
    pub producer_tx_id: String,
    pub vout: i64,
}

impl Outpoint {
    pub fn new(producer_tx_id: impl Into<String>, vout: i64) -> Self {
        Self {
            producer_tx_id: producer_tx_id.into(),
            vout,
        }
    }
}

impl std::fmt::Display for Outpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.producer_tx_id, self.vout)
    }
}

// ---------------------------------------------------------------------------
// Pool entry
// ---------------------------------------------------------------------------

/// Tag distinguishing why an entry exists in the pool.
///
/// Only `Publishing` entries are ever handed out by
/// `find_and_allocate_publishing_entry`; `Seed` and `Residual` are produced
/// and consumed entirely outside this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Seed,
    Publishing,
    Residual,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Seed => "seed",
            EntryKind::Publishing => "publishing",
            EntryKind::Residual => "residual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seed" => Some(EntryKind::Seed),
            "publishing" => Some(EntryKind::Publishing),
            "residual" => Some(EntryKind::Residual),
            _ => None,
        }
    }
}

/// Lifecycle state of a pool entry. `Spent` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Available,
    Allocated,
    Spent,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Available => "available",
            EntryState::Allocated => "allocated",
            EntryState::Spent => "spent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(EntryState::Available),
            "allocated" => Some(EntryState::Allocated),
            "spent" => Some(EntryState::Spent),
            _ => None,
        }
    }
}

/// One pre-minted single-use output in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub producer_tx_id: String,
    pub vout: i64,
    pub amount: i64,
    pub spend_script: Vec<u8>,
    pub kind: EntryKind,
    pub state: EntryState,
    pub allocated_at: Option<DateTime<Utc>>,
    pub spent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PoolEntry {
    pub fn outpoint(&self) -> Outpoint {
        Outpoint::new(self.producer_tx_id.clone(), self.vout)
    }
}

// ---------------------------------------------------------------------------
// Request receipt
// ---------------------------------------------------------------------------

/// Lifecycle state of a client submission. Monotonic along
/// `pending -> processing -> {success|failed}`, with `success -> mined` as an
/// optional later refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptState {
    Pending,
    Processing,
    Success,
    Mined,
    Failed,
}

impl ReceiptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptState::Pending => "pending",
            ReceiptState::Processing => "processing",
            ReceiptState::Success => "success",
            ReceiptState::Mined => "mined",
            ReceiptState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReceiptState::Pending),
            "processing" => Some(ReceiptState::Processing),
            "success" => Some(ReceiptState::Success),
            "mined" => Some(ReceiptState::Mined),
            "failed" => Some(ReceiptState::Failed),
            _ => None,
        }
    }

    /// `true` once a receipt can no longer change state on its own (barring
    /// the optional `success -> mined` refinement, which callers may still
    /// apply after this returns `true` for `Success`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReceiptState::Success | ReceiptState::Mined | ReceiptState::Failed)
    }
}

/// One client submission, tracked end to end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestReceipt {
    pub uuid: Uuid,
    pub client_id: Uuid,
    pub tx_bytes: Vec<u8>,
    pub tx_id: Option<String>,
    pub bound_outpoint: Outpoint,
    pub state: ReceiptState,
    pub upstream_status: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Client record
// ---------------------------------------------------------------------------

/// Per-client tier, driving the policy applied by the auth middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Pilot,
    Enterprise,
    Government,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Pilot => "pilot",
            Tier::Enterprise => "enterprise",
            Tier::Government => "government",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pilot" => Some(Tier::Pilot),
            "enterprise" => Some(Tier::Enterprise),
            "government" => Some(Tier::Government),
            _ => None,
        }
    }

    /// Default `(require_signature, grace_window_hours)` for a freshly
    /// registered client of this tier.
    pub fn default_policy(&self) -> (bool, i64) {
        match self {
            Tier::Pilot => (false, 0),
            Tier::Enterprise => (true, 24),
            Tier::Government => (true, 168),
        }
    }
}

/// A registered API client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: Uuid,
    pub name: String,
    pub token_hash: String,
    pub tier: Tier,
    pub current_public_key: Option<Vec<u8>>,
    pub previous_public_key: Option<Vec<u8>>,
    pub last_rotation: Option<DateTime<Utc>>,
    pub require_signature: bool,
    pub grace_window_hours: i64,
    pub allowed_origins: Vec<String>,
    pub daily_limit: i64,
    pub daily_count: i64,
    pub daily_reset_date: NaiveDate,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// The error taxonomy surfaced to clients. Carries only the class — never
/// the underlying cryptographic or storage detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    PermissionDenied,
    InvalidArgument,
    ResourceExhausted,
    UpstreamRejected,
    DoubleSpent,
    UpstreamUnavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::UpstreamRejected => "upstream_rejected",
            ErrorKind::DoubleSpent => "double_spent",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_state_round_trips() {
        for s in [EntryState::Available, EntryState::Allocated, EntryState::Spent] {
            assert_eq!(EntryState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn tier_default_policy_matches_spec() {
        assert_eq!(Tier::Pilot.default_policy(), (false, 0));
        assert_eq!(Tier::Enterprise.default_policy(), (true, 24));
        assert_eq!(Tier::Government.default_policy(), (true, 168));
    }

    #[test]
    fn receipt_state_terminal_classification() {
        assert!(!ReceiptState::Pending.is_terminal());
        assert!(!ReceiptState::Processing.is_terminal());
        assert!(ReceiptState::Success.is_terminal());
        assert!(ReceiptState::Mined.is_terminal());
        assert!(ReceiptState::Failed.is_terminal());
    }

    #[test]
    fn outpoint_display_is_stable() {
        let op = Outpoint::new("abcd", 3);
        assert_eq!(op.to_string(), "abcd:3");
    }
}
