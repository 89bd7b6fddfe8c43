//! Protocol data model for native x402 payments.
//!
//! These types mirror the JSON shapes exchanged with x402 clients: the
//! server-declared [`PaymentRequirements`], the client-signed
//! [`PaymentPayload`], and the verification/settlement/discovery responses.
//! Big integers travel as `0x`-prefixed hex, byte strings as `0x`-prefixed
//! hex, addresses as 20-byte hex (checksummed preferred, lowercase accepted).
//!
//! Scheme and network are carried as free-form strings rather than closed
//! enums: an unsupported value must surface as an in-band verdict from the
//! verifier, not as a deserialization error.

use alloy_primitives::{Address, B256, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::timestamp::UnixTimestamp;

/// The only payment scheme this adapter accepts.
pub const SCHEME_EXACT: &str = "exact";

/// The network identifier this adapter settles on.
pub const NETWORK_ID: &str = "silverbitcoin";

/// Server-declared requirements an incoming payment must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Informational ceiling for clients. The `exact` scheme accepts any
    /// amount and never enforces this field.
    pub max_amount_required: U256,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mime_type: String,
    pub pay_to: Address,
    #[serde(default)]
    pub max_timeout_seconds: u64,
    /// Asset contract address. The zero address denotes the native coin.
    pub asset: Address,
}

/// A client-submitted x402 payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u32,
    pub scheme: String,
    pub network: String,
    pub payload: PaymentPayloadData,
}

/// The signed contents of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayloadData {
    pub from: Address,
    pub to: Address,
    /// Native wei or token base units.
    pub value: U256,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    /// 32-byte opaque nonce, unique per payer.
    pub nonce: B256,
    /// Asset contract address; zero for the native coin.
    pub asset: Address,
    /// 65-byte `r || s || v` secp256k1 signature over the payment message.
    pub signature: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permit: Option<PermitData>,
}

/// Optional EIP-2612 permit fields accompanying a token payment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<U256>,
    #[serde(default)]
    pub v: u8,
    #[serde(default)]
    pub r: Bytes,
    #[serde(default)]
    pub s: Bytes,
}

/// Result of payment verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_address: Option<String>,
}

impl VerificationResponse {
    /// A passing verdict carrying the recovered payer as checksummed hex.
    pub fn valid(payer: Address) -> Self {
        Self {
            is_valid: true,
            invalid_reason: None,
            payer_address: Some(payer.to_checksum(None)),
        }
    }

    pub fn invalid(reason: impl Display) -> Self {
        Self {
            is_valid: false,
            invalid_reason: Some(reason.to_string()),
            payer_address: None,
        }
    }
}

/// Result of payment settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
}

impl SettlementResponse {
    /// A successful settlement carrying the envelope hash.
    pub fn settled(tx_hash: B256) -> Self {
        Self {
            success: true,
            error: None,
            tx_hash: Some(tx_hash),
            network_id: Some(NETWORK_ID.to_string()),
        }
    }

    pub fn failed(error: impl Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            tx_hash: None,
            network_id: None,
        }
    }
}

/// Discovery response listing accepted scheme/network pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    pub kinds: Vec<PaymentKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentKind {
    pub scheme: String,
    pub network: String,
}

/// A historical payment record. Durable history storage is not part of this
/// release; the history endpoint returns an empty list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub tx_hash: B256,
    pub from: Address,
    pub to: Address,
    pub amount: U256,
    pub timestamp: u64,
    pub resource: String,
    pub status: String,
}

/// Aggregate payment statistics. Persistence is not part of this release;
/// the stats endpoint returns zeros.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStats {
    pub total_payments: u64,
    pub total_volume: U256,
    pub average_payment: U256,
    pub active_users: u64,
    pub payments_today: u64,
    pub volume_today: U256,
}
