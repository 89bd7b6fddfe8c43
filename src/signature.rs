//! Payment signature verification.
//!
//! A payment intent is signed over a domain-separated text message binding
//! payer, payee, value, validity window, nonce, asset, and chain id:
//!
//! ```text
//! x402-payment:<from>:<to>:<value>:<validAfter>:<validBefore>:<nonce>:<asset>:<chainId>
//! ```
//!
//! In strict mode only this canonical form is accepted, hashed with the
//! EIP-191 personal-message prefix. In permissive mode a finite cross-product
//! of legacy variants is tried: checksummed or lowercase addresses, hex or
//! decimal value, with or without the trailing chain id, each hashed both
//! prefixed and raw. Permissive mode exists to migrate old clients; strict is
//! the target.
//!
//! Verification yields a bare boolean. The verifier composes the user-facing
//! rejection reason.

use alloy_primitives::{Address, B256, Signature, eip191_hash_message, keccak256};

use crate::config::SignatureValidation;
use crate::types::PaymentPayloadData;

/// Recovers payment signatures and checks them against the claimed payer.
#[derive(Debug, Clone, Copy)]
pub struct SignatureVerifier {
    chain_id: u64,
    validation: SignatureValidation,
}

impl SignatureVerifier {
    pub fn new(chain_id: u64, validation: SignatureValidation) -> Self {
        Self {
            chain_id,
            validation,
        }
    }

    /// Whether the payload's signature recovers to `payload.from` under the
    /// configured validation mode.
    pub fn verify(&self, payload: &PaymentPayloadData) -> bool {
        let Some(signature) = normalized_signature(&payload.signature) else {
            tracing::warn!(len = payload.signature.len(), "payment signature malformed");
            return false;
        };
        match self.validation {
            SignatureValidation::Strict => {
                let message = canonical_message(payload, self.chain_id);
                recovers_to(&signature, eip191_hash_message(message.as_bytes()), payload.from)
            }
            SignatureValidation::Permissive => {
                for message in message_candidates(payload, self.chain_id) {
                    if recovers_to(&signature, eip191_hash_message(message.as_bytes()), payload.from)
                    {
                        return true;
                    }
                    if recovers_to(&signature, keccak256(message.as_bytes()), payload.from) {
                        return true;
                    }
                }
                tracing::warn!(
                    from = %payload.from,
                    "signature did not match any accepted message variant"
                );
                false
            }
        }
    }
}

/// The canonical (strict) signed message for a payload.
pub fn canonical_message(payload: &PaymentPayloadData, chain_id: u64) -> String {
    format!(
        "x402-payment:{}:{}:{:#x}:{}:{}:{}:{}:{}",
        payload.from.to_checksum(None),
        payload.to.to_checksum(None),
        payload.value,
        payload.valid_after,
        payload.valid_before,
        payload.nonce,
        payload.asset.to_checksum(None),
        chain_id,
    )
}

/// Every message variant permissive mode accepts, in trial order. The
/// canonical message is the first entry, so permissive accepts at least
/// everything strict does.
fn message_candidates(payload: &PaymentPayloadData, chain_id: u64) -> Vec<String> {
    let from_checksum = payload.from.to_checksum(None);
    let to_checksum = payload.to.to_checksum(None);
    let asset_checksum = payload.asset.to_checksum(None);
    let address_pairs = [
        (from_checksum.clone(), to_checksum.clone()),
        (from_checksum.to_lowercase(), to_checksum.to_lowercase()),
    ];
    let values = [format!("{:#x}", payload.value), payload.value.to_string()];
    let assets = [asset_checksum.clone(), asset_checksum.to_lowercase()];
    let nonce = payload.nonce.to_string();

    let mut candidates = Vec::with_capacity(address_pairs.len() * values.len() * assets.len() * 2);
    for (from, to) in &address_pairs {
        for value in &values {
            for asset in &assets {
                candidates.push(format!(
                    "x402-payment:{from}:{to}:{value}:{}:{}:{nonce}:{asset}:{chain_id}",
                    payload.valid_after, payload.valid_before,
                ));
                candidates.push(format!(
                    "x402-payment:{from}:{to}:{value}:{}:{}:{nonce}:{asset}",
                    payload.valid_after, payload.valid_before,
                ));
            }
        }
    }
    candidates
}

/// Parses a 65-byte `r || s || v` signature, normalizing `v` from {27, 28}
/// to {0, 1}. Any other length or parity value is rejected.
fn normalized_signature(bytes: &[u8]) -> Option<Signature> {
    if bytes.len() != 65 {
        return None;
    }
    let mut raw = [0u8; 65];
    raw.copy_from_slice(bytes);
    if raw[64] >= 27 {
        raw[64] -= 27;
    }
    if raw[64] > 1 {
        return None;
    }
    Signature::from_raw(&raw).ok()
}

fn recovers_to(signature: &Signature, digest: B256, expected: Address) -> bool {
    signature
        .recover_address_from_prehash(&digest)
        .is_ok_and(|recovered| recovered == expected)
}
