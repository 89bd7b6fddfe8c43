//! The settlement pipeline.
//!
//! A settlement re-verifies the payment, then walks a strict program order:
//! claim the nonce, encode the payload, seal the envelope, submit it to the
//! mempool, and enroll it with the propagation manager. The nonce claim is
//! the only linearization point: of any number of concurrent settlements for
//! the same `(from, nonce)`, exactly one proceeds past it. A claim is never
//! rolled back, even when a later step fails; losing a nonce to a failed
//! submission is the accepted price of replay safety.

use std::sync::Arc;

use crate::broadcast::PropagationManager;
use crate::envelope::{PaymentEnvelope, derive_envelope_nonce, encode_payload};
use crate::node::NodeBackend;
use crate::replay::ReplayGuard;
use crate::signature::SignatureVerifier;
use crate::types::{PaymentPayload, PaymentRequirements, SettlementResponse};
use crate::verify::Verifier;

/// Executes verified payments by injecting typed envelopes into the mempool.
#[derive(Debug)]
pub struct Settler<'a, N: NodeBackend> {
    backend: &'a N,
    signature: &'a SignatureVerifier,
    replay: &'a ReplayGuard,
    propagation: Option<&'a PropagationManager<N>>,
}

impl<'a, N: NodeBackend> Settler<'a, N> {
    pub fn new(
        backend: &'a N,
        signature: &'a SignatureVerifier,
        replay: &'a ReplayGuard,
        propagation: Option<&'a PropagationManager<N>>,
    ) -> Self {
        Self {
            backend,
            signature,
            replay,
            propagation,
        }
    }

    /// Settles a payment. Failures are returned in-band; the call itself
    /// does not error.
    pub async fn settle(
        &self,
        requirements: &PaymentRequirements,
        payload: &PaymentPayload,
    ) -> SettlementResponse {
        let verification = Verifier::new(self.backend, self.signature, self.replay)
            .verify(requirements, payload)
            .await;
        if !verification.is_valid {
            let reason = verification
                .invalid_reason
                .unwrap_or_else(|| "payment verification failed".to_string());
            return SettlementResponse::failed(reason);
        }

        let data = &payload.payload;
        if self.replay.claim(data.from, data.nonce) {
            return SettlementResponse::failed("payment nonce already used");
        }

        let encoded = encode_payload(data);
        let envelope_nonce = derive_envelope_nonce(data.nonce.as_slice());
        let envelope = Arc::new(PaymentEnvelope::x402(
            self.backend.chain_id(),
            envelope_nonce,
            encoded,
        ));
        tracing::info!(
            hash = %envelope.hash(),
            nonce = envelope_nonce,
            from = %data.from,
            "created payment envelope"
        );

        if let Err(err) = self.backend.submit_transaction(Arc::clone(&envelope)).await {
            return SettlementResponse::failed(format!("x402: add to txpool failed: {err}"));
        }

        match self.propagation {
            Some(manager) => {
                manager.enroll(Arc::clone(&envelope)).await;
                tracing::info!(hash = %envelope.hash(), "payment envelope enrolled for propagation");
            }
            None => {
                tracing::warn!(
                    hash = %envelope.hash(),
                    "propagation manager unavailable, relying on mempool gossip"
                );
            }
        }

        SettlementResponse::settled(envelope.hash())
    }
}
