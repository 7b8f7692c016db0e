//! Upstream broadcast client. Sends an ordered batch of wire-ready
//! transaction bytes to the provider and maps its response back to
//! per-item outcomes, preserving input order.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// One provider-level advancement label, carried opaquely on `Accepted`.
pub type UpstreamStatus = String;

/// Outcome of a single item within a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PerItemOutcome {
    Accepted { upstream_status: UpstreamStatus, tx_id: String },
    Rejected { reason: String },
    DoubleSpend { tx_id: String, competing_ids: Vec<String> },
    TransportError,
}

/// Boundary to the external broadcaster. `broadcast` preserves the order of
/// `batch` in its returned outcomes.
#[async_trait]
pub trait BroadcastClient: Send + Sync {
    async fn broadcast(&self, batch: &[Vec<u8>]) -> Result<Vec<PerItemOutcome>, BroadcastError>;
}

/// Deterministic broadcaster used by tests: every item is accepted, with a
/// `tx_id` derived from the item's own bytes so results are reproducible.
pub struct StubBroadcastClient {
    outcome_for: Box<dyn Fn(usize, &[u8]) -> PerItemOutcome + Send + Sync>,
}

impl StubBroadcastClient {
    /// All items accepted, `tx_id` = sha256(wire_bytes).
    pub fn always_accept() -> Self {
        Self {
            outcome_for: Box::new(|_idx, wire_bytes| {
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                hasher.update(wire_bytes);
                let tx_id = hex::encode(hasher.finalize());
                PerItemOutcome::Accepted {
                    upstream_status: "accepted".to_string(),
                    tx_id,
                }
            }),
        }
    }

    /// Customize the outcome per item index, for scenarios exercising mixed
    /// accept/reject/double-spend results within one batch.
    pub fn with_outcomes(
        f: impl Fn(usize, &[u8]) -> PerItemOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            outcome_for: Box::new(f),
        }
    }
}

#[async_trait]
impl BroadcastClient for StubBroadcastClient {
    async fn broadcast(&self, batch: &[Vec<u8>]) -> Result<Vec<PerItemOutcome>, BroadcastError> {
        Ok(batch
            .iter()
            .enumerate()
            .map(|(i, wire_bytes)| (self.outcome_for)(i, wire_bytes))
            .collect())
    }
}

/// Production broadcaster. Framing of the request/response body is the
/// external provider's; this client owns only the order-preserving mapping
/// and the timeout.
pub struct HttpBroadcastClient {
    client: reqwest::Client,
    url: String,
}

impl HttpBroadcastClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client build");
        Self { client, url }
    }
}

#[async_trait]
impl BroadcastClient for HttpBroadcastClient {
    async fn broadcast(&self, batch: &[Vec<u8>]) -> Result<Vec<PerItemOutcome>, BroadcastError> {
        let body: Vec<String> = batch.iter().map(hex::encode).collect();

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BroadcastError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(vec![PerItemOutcome::TransportError; batch.len()]);
        }

        let parsed: Vec<RawItemResult> = response
            .json()
            .await
            .map_err(|e| BroadcastError::Transport(e.to_string()))?;

        if parsed.len() != batch.len() {
            return Err(BroadcastError::Transport(format!(
                "outcome count mismatch: sent {}, received {}",
                batch.len(),
                parsed.len()
            )));
        }

        Ok(parsed.into_iter().map(Into::into).collect())
    }
}

#[derive(serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum RawItemResult {
    Accepted { upstream_status: String, tx_id: String },
    Rejected { reason: String },
    DoubleSpend { tx_id: String, competing_ids: Vec<String> },
    TransportError,
}

impl From<RawItemResult> for PerItemOutcome {
    fn from(raw: RawItemResult) -> Self {
        match raw {
            RawItemResult::Accepted { upstream_status, tx_id } => {
                PerItemOutcome::Accepted { upstream_status, tx_id }
            }
            RawItemResult::Rejected { reason } => PerItemOutcome::Rejected { reason },
            RawItemResult::DoubleSpend { tx_id, competing_ids } => {
                PerItemOutcome::DoubleSpend { tx_id, competing_ids }
            }
            RawItemResult::TransportError => PerItemOutcome::TransportError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_always_accept_preserves_order() {
        let client = StubBroadcastClient::always_accept();
        let batch = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let outcomes = client.broadcast(&batch).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        for outcome in &outcomes {
            assert!(matches!(outcome, PerItemOutcome::Accepted { .. }));
        }
    }

    #[tokio::test]
    async fn stub_with_outcomes_mixed_batch() {
        let client = StubBroadcastClient::with_outcomes(|idx, _| {
            if idx == 1 {
                PerItemOutcome::Rejected { reason: "bad script".to_string() }
            } else {
                PerItemOutcome::Accepted { upstream_status: "seen".to_string(), tx_id: format!("tx{idx}") }
            }
        });
        let batch = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        let outcomes = client.broadcast(&batch).await.unwrap();
        assert!(matches!(outcomes[0], PerItemOutcome::Accepted { .. }));
        assert!(matches!(outcomes[1], PerItemOutcome::Rejected { .. }));
        assert!(matches!(outcomes[2], PerItemOutcome::Accepted { .. }));
    }
}
