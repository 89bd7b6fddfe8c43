//! The typed envelope transaction that carries a verified payment into the
//! mempool, and the canonical encoding of the payment it wraps.
//!
//! An envelope is a consensus transaction of type [`X402_TX_TYPE`]. Its data
//! field holds the RLP encoding of the verified payment payload; its
//! recipient slot is deliberately empty as the protocol marker; its
//! signature is the deterministic placeholder. The payload's own signature
//! is the cryptographic binding, the envelope signature only keeps the
//! mempool and indexers treating the envelope as well-formed. Tests pin the
//! placeholder exactly.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_rlp::{Decodable, EMPTY_STRING_CODE, Encodable, Header};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{PaymentPayloadData, PermitData};

/// Transaction type byte for x402 payment envelopes.
pub const X402_TX_TYPE: u8 = 0x64;

const PLACEHOLDER_SCALAR: U256 = U256::from_limbs([1, 0, 0, 0]);

/// The envelope's secp256k1 signature slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeSignature {
    pub v: u8,
    pub r: U256,
    pub s: U256,
}

impl EnvelopeSignature {
    /// The deterministic placeholder: `r = 1`, `s = 1`, `v = 27`. A protocol
    /// constant, not a shortcut.
    pub const fn placeholder() -> Self {
        Self {
            v: 27,
            r: PLACEHOLDER_SCALAR,
            s: PLACEHOLDER_SCALAR,
        }
    }
}

/// Derives the envelope nonce from a payment nonce.
///
/// Interprets the last 8 bytes big-endian. Payment nonces are 32 bytes on
/// the wire; the wall-clock fallback covers shorter inputs.
pub fn derive_envelope_nonce(nonce: &[u8]) -> u64 {
    if nonce.len() >= 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&nonce[nonce.len() - 8..]);
        u64::from_be_bytes(buf)
    } else {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default()
    }
}

/// Encodes a verified payment payload into the envelope data field.
///
/// The encoding is an RLP list of `[from, to, value, validAfter,
/// validBefore, nonce, asset, signature]`, followed by a nested
/// `[value, deadline, v, r, s]` list only when a permit is present. Missing
/// permit numerics encode as zero.
pub fn encode_payload(data: &PaymentPayloadData) -> Bytes {
    let payload_length = payload_fields_length(data);
    let mut out = Vec::with_capacity(payload_length + 4);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    data.from.encode(&mut out);
    data.to.encode(&mut out);
    data.value.encode(&mut out);
    data.valid_after.0.encode(&mut out);
    data.valid_before.0.encode(&mut out);
    data.nonce.encode(&mut out);
    data.asset.encode(&mut out);
    data.signature.encode(&mut out);
    if let Some(permit) = &data.permit {
        encode_permit(permit, &mut out);
    }
    out.into()
}

fn payload_fields_length(data: &PaymentPayloadData) -> usize {
    data.from.length()
        + data.to.length()
        + data.value.length()
        + data.valid_after.0.length()
        + data.valid_before.0.length()
        + data.nonce.length()
        + data.asset.length()
        + data.signature.length()
        + data.permit.as_ref().map_or(0, permit_length)
}

fn permit_fields_length(permit: &PermitData) -> usize {
    permit.value.unwrap_or_default().length()
        + permit.deadline.unwrap_or_default().length()
        + permit.v.length()
        + permit.r.length()
        + permit.s.length()
}

fn permit_length(permit: &PermitData) -> usize {
    let payload_length = permit_fields_length(permit);
    Header {
        list: true,
        payload_length,
    }
    .length()
        + payload_length
}

fn encode_permit(permit: &PermitData, out: &mut Vec<u8>) {
    Header {
        list: true,
        payload_length: permit_fields_length(permit),
    }
    .encode(out);
    permit.value.unwrap_or_default().encode(out);
    permit.deadline.unwrap_or_default().encode(out);
    permit.v.encode(out);
    permit.r.encode(out);
    permit.s.encode(out);
}

/// Decodes an envelope data field back into a payment payload.
///
/// Permit numerics encoded from absent fields come back as explicit zeros.
pub fn decode_payload(buf: &mut &[u8]) -> Result<PaymentPayloadData, alloy_rlp::Error> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let (mut payload, rest) = buf.split_at(header.payload_length);
    *buf = rest;

    let from = Address::decode(&mut payload)?;
    let to = Address::decode(&mut payload)?;
    let value = U256::decode(&mut payload)?;
    let valid_after = u64::decode(&mut payload)?;
    let valid_before = u64::decode(&mut payload)?;
    let nonce = B256::decode(&mut payload)?;
    let asset = Address::decode(&mut payload)?;
    let signature = Bytes::decode(&mut payload)?;
    let permit = if payload.is_empty() {
        None
    } else {
        Some(decode_permit(&mut payload)?)
    };
    Ok(PaymentPayloadData {
        from,
        to,
        value,
        valid_after: valid_after.into(),
        valid_before: valid_before.into(),
        nonce,
        asset,
        signature,
        permit,
    })
}

fn decode_permit(buf: &mut &[u8]) -> Result<PermitData, alloy_rlp::Error> {
    let header = Header::decode(buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString);
    }
    if buf.len() < header.payload_length {
        return Err(alloy_rlp::Error::InputTooShort);
    }
    let (mut payload, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok(PermitData {
        value: Some(U256::decode(&mut payload)?),
        deadline: Some(U256::decode(&mut payload)?),
        v: u8::decode(&mut payload)?,
        r: Bytes::decode(&mut payload)?,
        s: Bytes::decode(&mut payload)?,
    })
}

/// A typed consensus transaction carrying an encoded payment payload.
#[derive(Debug, Clone)]
pub struct PaymentEnvelope {
    tx_type: u8,
    chain_id: u64,
    nonce: u64,
    to: Option<Address>,
    data: Bytes,
    signature: EnvelopeSignature,
    hash: OnceLock<B256>,
}

impl PaymentEnvelope {
    /// Builds an x402 envelope: no recipient, placeholder signature, payload
    /// encoding as data.
    pub fn x402(chain_id: u64, nonce: u64, data: Bytes) -> Self {
        Self {
            tx_type: X402_TX_TYPE,
            chain_id,
            nonce,
            to: None,
            data,
            signature: EnvelopeSignature::placeholder(),
            hash: OnceLock::new(),
        }
    }

    /// A minimal view of a non-x402 pool transaction, for hosts feeding the
    /// mempool subscription. Carries only the type byte and the hash.
    pub fn foreign(tx_type: u8, hash: B256) -> Self {
        Self {
            tx_type,
            chain_id: 0,
            nonce: 0,
            to: None,
            data: Bytes::new(),
            signature: EnvelopeSignature::placeholder(),
            hash: OnceLock::from(hash),
        }
    }

    pub fn tx_type(&self) -> u8 {
        self.tx_type
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn to(&self) -> Option<Address> {
        self.to
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn signature(&self) -> &EnvelopeSignature {
        &self.signature
    }

    /// The canonical wire encoding: the type byte followed by the RLP list
    /// `[chainId, nonce, to, data, v, r, s]`.
    pub fn encoded(&self) -> Vec<u8> {
        let payload_length = self.fields_length();
        let mut out = Vec::with_capacity(payload_length + 6);
        out.push(self.tx_type);
        Header {
            list: true,
            payload_length,
        }
        .encode(&mut out);
        self.chain_id.encode(&mut out);
        self.nonce.encode(&mut out);
        match self.to {
            Some(addr) => addr.encode(&mut out),
            None => out.push(EMPTY_STRING_CODE),
        }
        self.data.encode(&mut out);
        self.signature.v.encode(&mut out);
        self.signature.r.encode(&mut out);
        self.signature.s.encode(&mut out);
        out
    }

    fn fields_length(&self) -> usize {
        self.chain_id.length()
            + self.nonce.length()
            + self.to.map_or(1, |addr| addr.length())
            + self.data.length()
            + self.signature.v.length()
            + self.signature.r.length()
            + self.signature.s.length()
    }

    /// The transaction hash: keccak-256 over the canonical wire encoding.
    pub fn hash(&self) -> B256 {
        *self.hash.get_or_init(|| keccak256(self.encoded()))
    }
}
