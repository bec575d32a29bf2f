//! Protocol types for x402 payment verification and settlement.
//!
//! Mirrors the wire structures of the x402 client SDKs. Payment payloads
//! arrive in two protocol versions: v1 is flat (`scheme`/`network` beside
//! the payload), v2 nests the chosen option under `accepted`. Both are
//! deserialized through a version-discriminated union and normalized into
//! one canonical [`PaymentPayload`] before any settlement adapter sees them.
//!
//! Amounts are base-unit integers carried as decimal strings and compared
//! with full 256-bit precision, never as floats.

use alloy::primitives::U256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;
use url::Url;

use crate::timestamp::UnixTimestamp;

/// Protocol version marker for x402 v1. Deserializes only from the literal `1`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

/// Protocol version marker for x402 v2. Deserializes only from the literal `2`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version2;

macro_rules! version_marker {
    ($ty:ident, $value:literal) => {
        impl $ty {
            pub const VALUE: u8 = $value;
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u8(Self::VALUE)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let num = u8::deserialize(deserializer)?;
                if num == Self::VALUE {
                    Ok($ty)
                } else {
                    Err(serde::de::Error::custom(format!(
                        "expected x402Version {}, got {}",
                        Self::VALUE,
                        num
                    )))
                }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", Self::VALUE)
            }
        }
    };
}

version_marker!(X402Version1, 1);
version_marker!(X402Version2, 2);

/// Protocol version of a normalized payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum X402Version {
    V1,
    V2,
}

impl X402Version {
    pub fn as_u8(&self) -> u8 {
        match self {
            X402Version::V1 => X402Version1::VALUE,
            X402Version::V2 => X402Version2::VALUE,
        }
    }
}

impl Serialize for X402Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl Display for X402Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Payment schemes. Only `exact` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Exact => write!(f, "exact"),
        }
    }
}

/// A token amount in base units, held as a 256-bit integer.
///
/// Wire format is a base-10 integer string (`"1000000"`); a bare JSON
/// integer is also accepted for lenience. Comparison is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TokenAmount(pub U256);

impl TokenAmount {
    pub fn as_u256(&self) -> U256 {
        self.0
    }

    /// Narrow to u64 base units (Solana and Stacks native amounts).
    pub fn as_u64(&self) -> Option<u64> {
        u64::try_from(self.0).ok()
    }

    pub fn as_u128(&self) -> Option<u128> {
        u128::try_from(self.0).ok()
    }
}

impl From<u64> for TokenAmount {
    fn from(value: u64) -> Self {
        TokenAmount(U256::from(value))
    }
}

impl FromStr for TokenAmount {
    type Err = TokenAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TokenAmountParseError(s.to_string()));
        }
        let value = U256::from_str_radix(s, 10).map_err(|_| TokenAmountParseError(s.to_string()))?;
        Ok(TokenAmount(value))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid token amount: {0:?} is not a non-negative base-10 integer")]
pub struct TokenAmountParseError(String);

impl Display for TokenAmount {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TokenAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for TokenAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Text(String),
            Number(u64),
        }
        match Wire::deserialize(deserializer)? {
            Wire::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Wire::Number(n) => Ok(TokenAmount::from(n)),
        }
    }
}

/// An EVM account address, `0x`-prefixed on the wire.
#[derive(Debug, Copy, Clone, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct EvmAddress(pub alloy::primitives::Address);

impl Display for EvmAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to decode EVM address")]
pub struct EvmAddressDecodingError;

impl FromStr for EvmAddress {
    type Err = EvmAddressDecodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address =
            alloy::primitives::Address::from_str(s).map_err(|_| EvmAddressDecodingError)?;
        Ok(Self(address))
    }
}

impl From<alloy::primitives::Address> for EvmAddress {
    fn from(address: alloy::primitives::Address) -> Self {
        EvmAddress(address)
    }
}

impl From<EvmAddress> for alloy::primitives::Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

/// A 65-byte EIP-712 signature, `0x`-prefixed 130 hex chars on the wire.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

impl Debug for EvmSignature {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "EvmSignature(0x{})", hex::encode(self.0))
    }
}

static SIG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid signature regex"));

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !SIG_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom(
                "invalid EVM signature: expected 0x-prefixed 130 hex chars",
            ));
        }
        let bytes = hex::decode(&s[2..])
            .map_err(|_| serde::de::Error::custom("invalid hex in EVM signature"))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("EVM signature must be 65 bytes"))?;
        Ok(EvmSignature(array))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

/// A 32-byte ERC-3009 nonce, `0x`-prefixed 64 hex chars on the wire.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct HexEncodedNonce(pub [u8; 32]);

impl Debug for HexEncodedNonce {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "HexEncodedNonce(0x{})", hex::encode(self.0))
    }
}

static NONCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid nonce regex"));

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !NONCE_REGEX.is_match(&s) {
            return Err(serde::de::Error::custom("invalid nonce format"));
        }
        let bytes =
            hex::decode(&s[2..]).map_err(|_| serde::de::Error::custom("invalid hex in nonce"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("nonce must be 32 bytes"))?;
        Ok(HexEncodedNonce(array))
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

/// EIP-712 message body of an ERC-3009 `TransferWithAuthorization`.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayloadAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: TokenAmount,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

/// Signature plus the authorization it covers.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    pub signature: EvmSignature,
    pub authorization: ExactEvmPayloadAuthorization,
}

/// Chain-family-specific portion of a payment payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadDetail {
    /// ERC-3009 authorization plus its EIP-712 signature (EVM).
    Evm(ExactEvmPayload),
    /// A fully pre-signed transaction blob (Solana, Stacks), encoded as
    /// base64, base58 or hex depending on the chain's convention.
    SignedTransaction {
        transaction: String,
    },
}

/// Whether the required amount is a ceiling (v1 `maxAmountRequired`) or an
/// exact figure (v2 `amount`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountKind {
    Ceiling,
    Exact,
}

/// Canonical payment requirements, normalized from the v1 and v2 wire shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "PaymentRequirementsWire")]
pub struct PaymentRequirements {
    pub scheme: Scheme,
    pub network: String,
    pub asset: String,
    pub amount: TokenAmount,
    pub amount_kind: AmountKind,
    pub pay_to: String,
    pub max_timeout_seconds: Option<u64>,
    pub resource: Option<Url>,
    pub description: Option<String>,
    pub mime_type: Option<String>,
    pub output_schema: Option<Value>,
    pub extra: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequirementsWire {
    scheme: Scheme,
    network: String,
    asset: String,
    max_amount_required: Option<TokenAmount>,
    amount: Option<TokenAmount>,
    pay_to: String,
    max_timeout_seconds: Option<u64>,
    resource: Option<Url>,
    description: Option<String>,
    mime_type: Option<String>,
    output_schema: Option<Value>,
    extra: Option<Value>,
}

impl TryFrom<PaymentRequirementsWire> for PaymentRequirements {
    type Error = String;

    fn try_from(wire: PaymentRequirementsWire) -> Result<Self, Self::Error> {
        let (amount, amount_kind) = match (wire.amount, wire.max_amount_required) {
            (Some(amount), _) => (amount, AmountKind::Exact),
            (None, Some(ceiling)) => (ceiling, AmountKind::Ceiling),
            (None, None) => {
                return Err("payment requirements need `amount` or `maxAmountRequired`".to_string());
            }
        };
        Ok(PaymentRequirements {
            scheme: wire.scheme,
            network: wire.network,
            asset: wire.asset,
            amount,
            amount_kind,
            pay_to: wire.pay_to,
            max_timeout_seconds: wire.max_timeout_seconds,
            resource: wire.resource,
            description: wire.description,
            mime_type: wire.mime_type,
            output_schema: wire.output_schema,
            extra: wire.extra,
        })
    }
}

impl PaymentRequirements {
    /// EIP-712 domain overrides carried in `extra`.
    pub fn extra_str(&self, key: &str) -> Option<String> {
        self.extra
            .as_ref()
            .and_then(|extra| extra.get(key))
            .and_then(|value| value.as_str().map(str::to_string))
    }
}

/// Canonical payment payload after version normalization.
#[derive(Debug, Clone)]
pub struct PaymentPayload {
    pub version: X402Version,
    pub scheme: Scheme,
    pub network: String,
    pub detail: PayloadDetail,
    pub extensions: Option<Value>,
}

/// x402 v1 wire payload: flat scheme/network.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V1PaymentPayload {
    pub x402_version: X402Version1,
    pub scheme: Scheme,
    pub network: String,
    pub payload: PayloadDetail,
}

/// The payer-chosen option echoed inside a v2 payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Accepted {
    pub scheme: Scheme,
    pub network: String,
}

/// x402 v2 wire payload: scheme/network nested under `accepted`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2PaymentPayload {
    pub x402_version: X402Version2,
    pub accepted: V2Accepted,
    pub payload: PayloadDetail,
    #[serde(default)]
    pub extensions: Option<Value>,
}

/// Version-discriminated union of the wire payload shapes. The zero-sized
/// version markers make `untagged` deserialization unambiguous.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentPayloadWire {
    V2(V2PaymentPayload),
    V1(V1PaymentPayload),
}

impl From<PaymentPayloadWire> for PaymentPayload {
    fn from(wire: PaymentPayloadWire) -> Self {
        match wire {
            PaymentPayloadWire::V1(v1) => PaymentPayload {
                version: X402Version::V1,
                scheme: v1.scheme,
                network: v1.network,
                detail: v1.payload,
                extensions: None,
            },
            PaymentPayloadWire::V2(v2) => PaymentPayload {
                version: X402Version::V2,
                scheme: v2.accepted.scheme,
                network: v2.accepted.network,
                detail: v2.payload,
                extensions: v2.extensions,
            },
        }
    }
}

/// Error decoding a client-supplied payment payload.
#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A payment payload as it arrives on the wire: either a JSON object or a
/// base64-encoded JSON string (the `X-Payment` header convention).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPaymentPayload {
    Encoded(String),
    Structured(PaymentPayloadWire),
}

impl RawPaymentPayload {
    /// Normalize to the canonical payload shape.
    pub fn decode(self) -> Result<PaymentPayload, PayloadDecodeError> {
        match self {
            RawPaymentPayload::Structured(wire) => Ok(wire.into()),
            RawPaymentPayload::Encoded(encoded) => {
                let bytes = b64.decode(encoded.as_bytes())?;
                let wire: PaymentPayloadWire = serde_json::from_slice(&bytes)?;
                Ok(wire.into())
            }
        }
    }
}

/// Machine-readable reason a verification or settlement did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    MalformedPayload,
    InvalidScheme,
    NetworkMismatch,
    UnsupportedNetwork,
    NotConfigured,
    InvalidSignature,
    InvalidTiming,
    InvalidRecipient,
    AssetMismatch,
    InsufficientFunds,
    InsufficientValue,
    SettlementFailed,
    ConfirmationTimeout,
    PostSettlementVerificationFailed,
    InternalError,
}

impl Display for ErrorReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(s.trim_matches('"'))
    }
}

/// Request body of `POST /verify` and `POST /settle`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    #[serde(default)]
    pub x402_version: Option<u8>,
    pub payment_payload: RawPaymentPayload,
    pub payment_requirements: PaymentRequirements,
}

pub type SettleRequest = VerifyRequest;

/// Outcome of `POST /verify`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<ErrorReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl VerifyResponse {
    pub fn valid(payer: impl Into<String>) -> Self {
        VerifyResponse {
            is_valid: true,
            invalid_reason: None,
            payer: Some(payer.into()),
            details: None,
        }
    }

    pub fn invalid(reason: ErrorReason) -> Self {
        VerifyResponse {
            is_valid: false,
            invalid_reason: Some(reason),
            payer: None,
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
}

/// Outcome of `POST /settle`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ErrorReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub network: String,
}

impl SettleResponse {
    pub fn succeeded(
        network: impl Into<String>,
        payer: impl Into<String>,
        transaction: impl Into<String>,
    ) -> Self {
        SettleResponse {
            success: true,
            error_reason: None,
            error_detail: None,
            payer: Some(payer.into()),
            transaction: Some(transaction.into()),
            network: network.into(),
        }
    }

    pub fn failed(network: impl Into<String>, reason: ErrorReason) -> Self {
        SettleResponse {
            success: false,
            error_reason: Some(reason),
            error_detail: None,
            payer: None,
            transaction: None,
            network: network.into(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn with_transaction(mut self, transaction: impl Into<String>) -> Self {
        self.transaction = Some(transaction.into());
        self
    }

    pub fn with_payer(mut self, payer: impl Into<String>) -> Self {
        self.payer = Some(payer.into());
        self
    }
}

/// One supported (version, scheme, network) combination.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub x402_version: u8,
    pub scheme: Scheme,
    pub network: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// Body of `GET /supported`.
#[derive(Debug, Clone, Serialize)]
pub struct SupportedResponse {
    pub kinds: Vec<SupportedPaymentKind>,
    /// Signer addresses per namespace wildcard, e.g. `"eip155:*": ["0x.."]`.
    pub signers: HashMap<String, Vec<String>>,
    pub extensions: Vec<String>,
}

/// Generic structured error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evm_payload_json() -> serde_json::Value {
        serde_json::json!({
            "signature": format!("0x{}", "ab".repeat(65)),
            "authorization": {
                "from": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
                "to": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
                "value": "1000000",
                "validAfter": "1740672089",
                "validBefore": "1740672154",
                "nonce": format!("0x{}", "f3".repeat(32)),
            }
        })
    }

    #[test]
    fn v1_payload_normalizes_flat_shape() {
        let json = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base",
            "payload": evm_payload_json(),
        });
        let wire: PaymentPayloadWire = serde_json::from_value(json).unwrap();
        let payload: PaymentPayload = wire.into();
        assert_eq!(payload.version, X402Version::V1);
        assert_eq!(payload.scheme, Scheme::Exact);
        assert_eq!(payload.network, "base");
        assert!(matches!(payload.detail, PayloadDetail::Evm(_)));
    }

    #[test]
    fn v2_payload_normalizes_nested_shape() {
        let json = serde_json::json!({
            "x402Version": 2,
            "accepted": { "scheme": "exact", "network": "solana" },
            "payload": { "transaction": "AQAAAA==" },
        });
        let wire: PaymentPayloadWire = serde_json::from_value(json).unwrap();
        let payload: PaymentPayload = wire.into();
        assert_eq!(payload.version, X402Version::V2);
        assert_eq!(payload.network, "solana");
        match payload.detail {
            PayloadDetail::SignedTransaction { transaction } => {
                assert_eq!(transaction, "AQAAAA==");
            }
            other => panic!("expected signed transaction detail, got {other:?}"),
        }
    }

    #[test]
    fn base64_encoded_payload_decodes() {
        let json = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "base",
            "payload": evm_payload_json(),
        });
        let encoded = b64.encode(serde_json::to_vec(&json).unwrap());
        let raw = RawPaymentPayload::Encoded(encoded);
        let payload = raw.decode().unwrap();
        assert_eq!(payload.network, "base");
    }

    #[test]
    fn requirements_v1_ceiling_vs_v2_exact() {
        let v1: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "maxAmountRequired": "1000000",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
        }))
        .unwrap();
        assert_eq!(v1.amount_kind, AmountKind::Ceiling);
        assert_eq!(v1.amount, TokenAmount::from(1_000_000u64));

        let v2: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "amount": "42",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
        }))
        .unwrap();
        assert_eq!(v2.amount_kind, AmountKind::Exact);
        assert_eq!(v2.amount, TokenAmount::from(42u64));
    }

    #[test]
    fn requirements_without_amount_rejected() {
        let result: Result<PaymentRequirements, _> = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn token_amount_keeps_full_precision() {
        let huge = "115792089237316195423570985008687907853269984665640564039457584007913129639935";
        let amount: TokenAmount = huge.parse().unwrap();
        assert_eq!(amount.to_string(), huge);
        assert!(amount.as_u64().is_none());
    }

    #[test]
    fn token_amount_rejects_non_integers() {
        assert!("1.5".parse::<TokenAmount>().is_err());
        assert!("-3".parse::<TokenAmount>().is_err());
        assert!("1e6".parse::<TokenAmount>().is_err());
        assert!("".parse::<TokenAmount>().is_err());
    }
}
