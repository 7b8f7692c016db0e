//! Transaction builder boundary.
//!
//! Producing wire-ready transaction bytes for a UTXO-based chain is out of
//! core scope (see Non-goals): this crate only defines the contract the rest
//! of the workspace programs against, plus payload validation, plus a
//! deterministic stub implementation for tests.

use sha2::{Digest, Sha256};
use thiserror::Error;

use otx_schemas::Outpoint;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("payload exceeds maximum length ({len} > {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("payload is empty")]
    PayloadEmpty,
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Validate a raw payload against the chain-imposed maximum for the
/// data-carrier opcode. Called by request intake before a pool entry is
/// allocated.
pub fn validate_payload(payload: &[u8], max_len: usize) -> Result<(), BuildError> {
    if payload.is_empty() {
        return Err(BuildError::PayloadEmpty);
    }
    if payload.len() > max_len {
        return Err(BuildError::PayloadTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    Ok(())
}

/// Result of a successful build: wire-ready transaction bytes and the
/// transaction's computed identifier.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub wire_bytes: Vec<u8>,
    pub tx_id: String,
}

/// Boundary to the external signer. Implementations must produce a
/// transaction with exactly one input (the allocated entry) and one
/// non-spendable output carrying `payload_bytes` behind the chain's
/// data-carrier opcode, signing deterministically, with total fee equal to
/// `amount` (the pool's fixed-denomination convention implies zero change).
pub trait TransactionBuilder: Send + Sync {
    fn build(
        &self,
        outpoint: &Outpoint,
        amount: i64,
        spend_script: &[u8],
        payload_bytes: &[u8],
        signing_key: &[u8],
    ) -> Result<BuiltTransaction, BuildError>;
}

/// The chain's data-carrier opcode byte (OP_RETURN under its
/// Bitcoin-Script-derived numbering), used by `StubBuilder` to assemble a
/// script recognizable in tests without pulling in a full script interpreter.
const OP_RETURN: u8 = 0x6a;

/// Deterministic builder used by tests in place of the real signer. Encodes
/// `outpoint || amount || spend_script || payload` into a script and derives
/// `tx_id` as the sha256 of that script — no randomness, no wall-clock.
#[derive(Debug, Default)]
pub struct StubBuilder;

impl StubBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl TransactionBuilder for StubBuilder {
    fn build(
        &self,
        outpoint: &Outpoint,
        amount: i64,
        spend_script: &[u8],
        payload_bytes: &[u8],
        signing_key: &[u8],
    ) -> Result<BuiltTransaction, BuildError> {
        if payload_bytes.is_empty() {
            return Err(BuildError::PayloadEmpty);
        }

        let mut wire_bytes = Vec::with_capacity(1 + spend_script.len() + payload_bytes.len() + 16);
        wire_bytes.push(OP_RETURN);
        push_with_len_prefix(&mut wire_bytes, payload_bytes);
        wire_bytes.extend_from_slice(&amount.to_le_bytes());
        wire_bytes.extend_from_slice(spend_script);
        wire_bytes.extend_from_slice(outpoint.producer_tx_id.as_bytes());
        wire_bytes.extend_from_slice(&outpoint.vout.to_le_bytes());

        if signing_key.is_empty() {
            return Err(BuildError::Signing("empty signing key".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(&wire_bytes);
        hasher.update(signing_key);
        let tx_id = hex::encode(hasher.finalize());

        Ok(BuiltTransaction { wire_bytes, tx_id })
    }
}

fn push_with_len_prefix(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_payload_rejects_empty_and_oversize() {
        assert!(validate_payload(b"", 100).is_err());
        assert!(validate_payload(&vec![0u8; 101], 100).is_err());
        assert!(validate_payload(&vec![0u8; 100], 100).is_ok());
    }

    #[test]
    fn stub_builder_is_deterministic() {
        let builder = StubBuilder::new();
        let outpoint = Outpoint::new("abcd", 0);
        let a = builder.build(&outpoint, 100, &[0xac], b"hello", b"key").unwrap();
        let b = builder.build(&outpoint, 100, &[0xac], b"hello", b"key").unwrap();
        assert_eq!(a.tx_id, b.tx_id);
        assert_eq!(a.wire_bytes, b.wire_bytes);
    }

    #[test]
    fn stub_builder_distinguishes_payloads() {
        let builder = StubBuilder::new();
        let outpoint = Outpoint::new("abcd", 0);
        let a = builder.build(&outpoint, 100, &[0xac], b"hello", b"key").unwrap();
        let b = builder.build(&outpoint, 100, &[0xac], b"world", b"key").unwrap();
        assert_ne!(a.tx_id, b.tx_id);
    }

    #[test]
    fn stub_builder_rejects_empty_payload() {
        let builder = StubBuilder::new();
        let outpoint = Outpoint::new("abcd", 0);
        assert!(builder.build(&outpoint, 100, &[0xac], b"", b"key").is_err());
    }
}
