//! The verification gate.
//!
//! Checks run in a fixed order and short-circuit on the first failure:
//! scheme, network, validity window, signature, state access, funds (native
//! balance, or token balance plus permit/allowance), requirement binding
//! (recipient and asset), and finally the advisory replay check. Every
//! failure maps to one stable, client-facing reason string.
//!
//! The verifier never mutates anything: it does not claim the nonce and it
//! does not touch the mempool. A passing verdict is a statement about the
//! state snapshot it ran against, nothing more.

use alloy_primitives::{Address, U256};

use crate::node::{NodeBackend, StateView};
use crate::probe::AssetProbe;
use crate::replay::ReplayGuard;
use crate::signature::SignatureVerifier;
use crate::timestamp::UnixTimestamp;
use crate::types::{
    NETWORK_ID, PaymentPayload, PaymentPayloadData, PaymentRequirements, SCHEME_EXACT,
    VerificationResponse,
};

/// Why a payment failed verification. The `Display` strings are the wire
/// `invalidReason` values and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InvalidReason {
    #[error("Unsupported payment scheme")]
    UnsupportedScheme,
    #[error("Unsupported network")]
    UnsupportedNetwork,
    #[error("Payment not yet valid")]
    NotYetValid,
    #[error("Payment expired")]
    Expired,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Could not get blockchain state")]
    StateUnavailable,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Could not query token balance")]
    TokenBalanceUnavailable,
    #[error("Insufficient token balance")]
    InsufficientTokenBalance,
    #[error("Permit value below required amount")]
    PermitValueTooLow,
    #[error("Permit deadline expired")]
    PermitDeadlineExpired,
    #[error("Could not query token allowance")]
    TokenAllowanceUnavailable,
    #[error("Insufficient token allowance")]
    InsufficientTokenAllowance,
    #[error("Payment recipient mismatch")]
    RecipientMismatch,
    #[error("Payment asset mismatch")]
    AssetMismatch,
    #[error("Payment nonce already used")]
    NonceAlreadyUsed,
}

/// Composes the signature verifier, replay guard, and asset probes into a
/// yes/no verdict with a reason.
#[derive(Debug)]
pub struct Verifier<'a, N: NodeBackend> {
    backend: &'a N,
    signature: &'a SignatureVerifier,
    replay: &'a ReplayGuard,
}

impl<'a, N: NodeBackend> Verifier<'a, N> {
    pub fn new(backend: &'a N, signature: &'a SignatureVerifier, replay: &'a ReplayGuard) -> Self {
        Self {
            backend,
            signature,
            replay,
        }
    }

    /// Verifies a payment against the declared requirements.
    pub async fn verify(
        &self,
        requirements: &PaymentRequirements,
        payload: &PaymentPayload,
    ) -> VerificationResponse {
        match self.check(requirements, payload).await {
            Ok(payer) => VerificationResponse::valid(payer),
            Err(reason) => {
                tracing::debug!(%reason, from = %payload.payload.from, "payment rejected");
                VerificationResponse::invalid(reason)
            }
        }
    }

    async fn check(
        &self,
        requirements: &PaymentRequirements,
        payload: &PaymentPayload,
    ) -> Result<Address, InvalidReason> {
        if payload.scheme != SCHEME_EXACT {
            return Err(InvalidReason::UnsupportedScheme);
        }
        if payload.network != NETWORK_ID {
            return Err(InvalidReason::UnsupportedNetwork);
        }

        let data = &payload.payload;
        let now = UnixTimestamp::now();
        if now < data.valid_after {
            return Err(InvalidReason::NotYetValid);
        }
        if now > data.valid_before {
            return Err(InvalidReason::Expired);
        }

        if !self.signature.verify(data) {
            return Err(InvalidReason::InvalidSignature);
        }

        let state = self
            .backend
            .state()
            .map_err(|_| InvalidReason::StateUnavailable)?;

        if data.asset == Address::ZERO {
            if state.balance(data.from) < data.value {
                return Err(InvalidReason::InsufficientBalance);
            }
        } else {
            self.check_token_funds(data, now).await?;
        }

        // The exact scheme accepts any amount; maxAmountRequired stays
        // informational.
        if data.to != requirements.pay_to {
            return Err(InvalidReason::RecipientMismatch);
        }
        if data.asset != requirements.asset {
            return Err(InvalidReason::AssetMismatch);
        }

        if self.replay.is_used(data.from, data.nonce) {
            return Err(InvalidReason::NonceAlreadyUsed);
        }

        Ok(data.from)
    }

    async fn check_token_funds(
        &self,
        data: &PaymentPayloadData,
        now: UnixTimestamp,
    ) -> Result<(), InvalidReason> {
        let probe = AssetProbe::new(self.backend);
        let balance = probe
            .token_balance(data.asset, data.from)
            .await
            .map_err(|err| {
                tracing::warn!(%err, asset = %data.asset, owner = %data.from, "token balance query failed");
                InvalidReason::TokenBalanceUnavailable
            })?;
        if balance < data.value {
            return Err(InvalidReason::InsufficientTokenBalance);
        }

        let Some(permit) = &data.permit else {
            return self.check_allowance(&probe, data).await;
        };
        if let Some(value) = permit.value {
            if value < data.value {
                return Err(InvalidReason::PermitValueTooLow);
            }
        }
        if let Some(deadline) = permit.deadline {
            if deadline < U256::from(now.seconds_since_epoch()) {
                return Err(InvalidReason::PermitDeadlineExpired);
            }
        }
        match probe
            .simulate_permit(data.asset, data.from, data.to, permit)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::warn!(asset = %data.asset, "permit simulation reverted, falling back to allowance");
                self.check_allowance(&probe, data).await
            }
            Err(err) => {
                tracing::warn!(%err, asset = %data.asset, "permit simulation failed, falling back to allowance");
                self.check_allowance(&probe, data).await
            }
        }
    }

    async fn check_allowance(
        &self,
        probe: &AssetProbe<'a, N>,
        data: &PaymentPayloadData,
    ) -> Result<(), InvalidReason> {
        let allowance = probe
            .token_allowance(data.asset, data.from, data.to)
            .await
            .map_err(|_| InvalidReason::TokenAllowanceUnavailable)?;
        if allowance < data.value {
            return Err(InvalidReason::InsufficientTokenAllowance);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    use crate::testutil::{
        ALLOWANCE_SELECTOR, BALANCE_OF_SELECTOR, MockNode, PERMIT_SELECTOR, TestPayment,
        uint_outcome,
    };
    use crate::types::PermitData;

    fn verdict_of<'a>(
        node: &'a MockNode,
        payment: &'a TestPayment,
    ) -> impl std::future::Future<Output = VerificationResponse> + 'a {
        async move {
            Verifier::new(node, &payment.signature_verifier, &payment.replay)
                .verify(&payment.requirements, &payment.payload)
                .await
        }
    }

    #[tokio::test]
    async fn valid_native_payment_passes() {
        let node = MockNode::new();
        let payment = TestPayment::native(&node);
        let verdict = verdict_of(&node, &payment).await;
        assert!(verdict.is_valid, "{:?}", verdict.invalid_reason);
        assert_eq!(
            verdict.payer_address,
            Some(payment.payload.payload.from.to_checksum(None))
        );
    }

    #[tokio::test]
    async fn scheme_and_network_gate_first() {
        let node = MockNode::new();
        let mut payment = TestPayment::native(&node);
        payment.payload.scheme = "upto".into();
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Unsupported payment scheme"));

        let mut payment = TestPayment::native(&node);
        payment.payload.network = "mainnet".into();
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Unsupported network"));
    }

    #[tokio::test]
    async fn window_bounds_are_inclusive() {
        let node = MockNode::new();
        let now = UnixTimestamp::now().0;

        // `validAfter = now` accepts: the lower bound is inclusive.
        for (after, before) in [(now, now + 1000), (now.saturating_sub(1000), now + 2)] {
            let payment = TestPayment::native_with_window(&node, after, before);
            let verdict = verdict_of(&node, &payment).await;
            assert!(verdict.is_valid, "window [{after}, {before}] should accept");
        }

        let payment = TestPayment::native_with_window(&node, now + 120, now + 1000);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Payment not yet valid"));

        let payment = TestPayment::native_with_window(&node, 0, now - 120);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Payment expired"));
    }

    #[tokio::test]
    async fn expiry_short_circuits_before_signature() {
        let node = MockNode::new();
        let now = UnixTimestamp::now().0;
        let mut payment = TestPayment::native_with_window(&node, 0, now - 120);
        // Garbage signature: the window check must fire first.
        payment.payload.payload.signature = vec![0u8; 65].into();
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Payment expired"));
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let node = MockNode::new();
        let mut payment = TestPayment::native(&node);
        payment.payload.payload.signature = vec![0u8; 65].into();
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Invalid signature"));
    }

    #[tokio::test]
    async fn unreadable_state_is_reported() {
        let node = MockNode::new();
        let payment = TestPayment::native(&node);
        node.fail_state();
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Could not get blockchain state")
        );
    }

    #[tokio::test]
    async fn native_balance_must_cover_value() {
        let node = MockNode::new();
        let payment = TestPayment::native(&node);
        node.set_balance(payment.payload.payload.from, U256::ZERO);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(verdict.invalid_reason.as_deref(), Some("Insufficient balance"));
    }

    #[tokio::test]
    async fn token_payment_without_permit_needs_allowance() {
        let node = MockNode::new();
        let payment = TestPayment::token(&node);
        let token = payment.payload.payload.asset;
        node.script_call(token, BALANCE_OF_SELECTOR, Ok(uint_outcome(U256::from(100))));

        // Zero allowance (unscripted call decodes to zero return).
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Insufficient token allowance")
        );

        node.script_call(token, ALLOWANCE_SELECTOR, Ok(uint_outcome(U256::from(100))));
        let verdict = verdict_of(&node, &payment).await;
        assert!(verdict.is_valid, "{:?}", verdict.invalid_reason);
    }

    #[tokio::test]
    async fn token_balance_shortfall_and_probe_errors_have_distinct_reasons() {
        let node = MockNode::new();
        let payment = TestPayment::token(&node);
        let token = payment.payload.payload.asset;

        node.script_call(token, BALANCE_OF_SELECTOR, Ok(uint_outcome(U256::from(1))));
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Insufficient token balance")
        );

        node.script_call(token, BALANCE_OF_SELECTOR, Err("timeout".into()));
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Could not query token balance")
        );
    }

    #[tokio::test]
    async fn successful_permit_simulation_skips_the_allowance_check() {
        let node = MockNode::new();
        let mut payment = TestPayment::token(&node);
        let token = payment.payload.payload.asset;
        payment.set_permit(PermitData {
            value: Some(U256::from(100)),
            deadline: Some(U256::from(UnixTimestamp::now().0 + 3600)),
            v: 27,
            r: vec![0x11; 32].into(),
            s: vec![0x22; 32].into(),
        });
        node.script_call(token, BALANCE_OF_SELECTOR, Ok(uint_outcome(U256::from(100))));
        node.script_call(token, PERMIT_SELECTOR, Ok(Default::default()));
        // Allowance stays zero: the permit alone must carry the verdict.
        let verdict = verdict_of(&node, &payment).await;
        assert!(verdict.is_valid, "{:?}", verdict.invalid_reason);
    }

    #[tokio::test]
    async fn reverting_permit_falls_back_to_allowance() {
        let node = MockNode::new();
        let mut payment = TestPayment::token(&node);
        let token = payment.payload.payload.asset;
        payment.set_permit(PermitData {
            value: Some(U256::from(100)),
            deadline: Some(U256::from(UnixTimestamp::now().0 + 3600)),
            v: 27,
            r: vec![0x11; 32].into(),
            s: vec![0x22; 32].into(),
        });
        node.script_call(token, BALANCE_OF_SELECTOR, Ok(uint_outcome(U256::from(100))));
        node.script_revert(token, PERMIT_SELECTOR);

        node.script_call(token, ALLOWANCE_SELECTOR, Ok(uint_outcome(U256::from(100))));
        let verdict = verdict_of(&node, &payment).await;
        assert!(verdict.is_valid, "{:?}", verdict.invalid_reason);

        node.script_call(token, ALLOWANCE_SELECTOR, Ok(uint_outcome(U256::from(1))));
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Insufficient token allowance")
        );
    }

    #[tokio::test]
    async fn permit_field_checks_precede_simulation() {
        let node = MockNode::new();
        let mut payment = TestPayment::token(&node);
        let token = payment.payload.payload.asset;
        node.script_call(token, BALANCE_OF_SELECTOR, Ok(uint_outcome(U256::from(100))));

        payment.set_permit(PermitData {
            value: Some(U256::from(1)),
            ..PermitData::default()
        });
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Permit value below required amount")
        );

        payment.set_permit(PermitData {
            value: Some(U256::from(100)),
            deadline: Some(U256::from(1)),
            ..PermitData::default()
        });
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Permit deadline expired")
        );
    }

    #[tokio::test]
    async fn requirement_binding_checks_recipient_and_asset() {
        let node = MockNode::new();
        let mut payment = TestPayment::native(&node);
        payment.requirements.pay_to = Address::repeat_byte(0x99);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Payment recipient mismatch")
        );

        let mut payment = TestPayment::native(&node);
        payment.requirements.asset = Address::repeat_byte(0x99);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Payment asset mismatch")
        );
    }

    #[tokio::test]
    async fn used_nonce_is_rejected_in_advisory_check() {
        let node = MockNode::new();
        let payment = TestPayment::native(&node);
        let data = &payment.payload.payload;
        payment.replay.claim(data.from, data.nonce);
        let verdict = verdict_of(&node, &payment).await;
        assert_eq!(
            verdict.invalid_reason.as_deref(),
            Some("Payment nonce already used")
        );
    }

    #[tokio::test]
    async fn max_amount_required_is_not_enforced() {
        let node = MockNode::new();
        let mut payment = TestPayment::native(&node);
        payment.requirements.max_amount_required = U256::from(1);
        // Payment value far above the declared ceiling still verifies.
        let verdict = verdict_of(&node, &payment).await;
        assert!(verdict.is_valid);
    }
}
