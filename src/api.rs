//! The payment façade the host node exposes over its RPC surface.
//!
//! Three live operations: `verify` applies the verification gate without
//! side effects, `settle` runs the full settlement pipeline, and `supported`
//! reports the accepted scheme/network pairs. The history and statistics
//! endpoints are stubs until durable payment storage lands.
//!
//! The adapter holds the process-wide replay guard, so one [`X402Api`]
//! instance must serve all requests.

use alloy_primitives::Address;
use std::sync::Arc;

use crate::broadcast::PropagationManager;
use crate::config::X402Config;
use crate::node::{self, FundingStatus, NodeBackend};
use crate::replay::ReplayGuard;
use crate::settle::Settler;
use crate::signature::SignatureVerifier;
use crate::types::{
    NETWORK_ID, PaymentKind, PaymentPayload, PaymentRecord, PaymentRequirements, PaymentStats,
    SCHEME_EXACT, SettlementResponse, SupportedResponse, VerificationResponse,
};
use crate::verify::Verifier;

/// Native x402 payment API over a host node.
#[derive(Debug)]
pub struct X402Api<N: NodeBackend> {
    backend: Arc<N>,
    signature: SignatureVerifier,
    replay: ReplayGuard,
    propagation: Option<Arc<PropagationManager<N>>>,
}

impl<N: NodeBackend> X402Api<N> {
    /// Builds the adapter. Logs the pseudo-sender funding verdict once at
    /// startup; an unfunded pseudo-sender is diagnostic, not fatal.
    pub fn new(
        backend: Arc<N>,
        config: &X402Config,
        propagation: Option<Arc<PropagationManager<N>>>,
    ) -> Self {
        let signature = SignatureVerifier::new(backend.chain_id(), config.signature_validation);
        node::check_pseudo_sender_funding(backend.as_ref());
        Self {
            backend,
            signature,
            replay: ReplayGuard::new(),
            propagation,
        }
    }

    /// Validates a payment without executing it.
    pub async fn verify(
        &self,
        requirements: &PaymentRequirements,
        payload: &PaymentPayload,
    ) -> VerificationResponse {
        let data = &payload.payload;
        tracing::info!(from = %data.from, to = %data.to, value = %data.value, "verifying payment");
        Verifier::new(self.backend.as_ref(), &self.signature, &self.replay)
            .verify(requirements, payload)
            .await
    }

    /// Verifies and executes a payment.
    pub async fn settle(
        &self,
        requirements: &PaymentRequirements,
        payload: &PaymentPayload,
    ) -> SettlementResponse {
        let data = &payload.payload;
        tracing::info!(from = %data.from, to = %data.to, value = %data.value, "settling payment");
        Settler::new(
            self.backend.as_ref(),
            &self.signature,
            &self.replay,
            self.propagation.as_deref(),
        )
        .settle(requirements, payload)
        .await
    }

    /// The accepted scheme/network pairs.
    pub fn supported(&self) -> SupportedResponse {
        SupportedResponse {
            kinds: vec![PaymentKind {
                scheme: SCHEME_EXACT.to_string(),
                network: NETWORK_ID.to_string(),
            }],
        }
    }

    /// Payment history for an address. Stub: durable storage is not part of
    /// this release.
    pub fn payment_history(&self, _address: Address, _limit: usize) -> Vec<PaymentRecord> {
        Vec::new()
    }

    /// Aggregate payment statistics. Stub: returns zeros.
    pub fn payment_stats(&self) -> PaymentStats {
        PaymentStats::default()
    }

    /// Re-runs the pseudo-sender funding check on demand, for health
    /// endpoints.
    pub fn pseudo_sender_funding(&self) -> FundingStatus {
        node::check_pseudo_sender_funding(self.backend.as_ref())
    }
}
