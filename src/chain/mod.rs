//! Settlement adapters: one per chain family.
//!
//! The engine resolves a network to a [`crate::network::ChainFamily`] and
//! dispatches to the matching [`SettlementAdapter`]. Adapters own all chain
//! I/O; everything above them works with canonical payloads and
//! requirements.

pub mod evm;
pub mod solana;
pub mod stacks;

use async_trait::async_trait;
use std::sync::Arc;

use crate::network::{ChainFamily, ChainId, ResolvedNetwork};
use crate::types::{
    ErrorReason, PaymentPayload, PaymentRequirements, SettleResponse, TokenAmount, VerifyResponse,
};

/// Failure of a verification, settlement or payout attempt.
///
/// Every variant maps to a wire-level [`ErrorReason`]; none of these reach
/// the client as an HTTP error.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("incompatible payload scheme")]
    IncompatibleScheme,
    #[error("payload network does not match requirements network")]
    NetworkMismatch,
    #[error("network not supported: {0}")]
    UnsupportedNetwork(String),
    #[error("no signer or endpoint configured for {0}")]
    NotConfigured(ChainId),
    #[error("invalid payment signature")]
    InvalidSignature,
    #[error("authorization is not valid at the current time")]
    InvalidTiming,
    #[error("payment recipient does not match requirements")]
    InvalidRecipient,
    #[error("payment asset does not match requirements: {0}")]
    AssetMismatch(String),
    #[error("payer has insufficient funds")]
    InsufficientFunds,
    #[error("authorized value below required amount")]
    InsufficientValue,
    #[error("malformed transaction payload: {0}")]
    MalformedTransaction(String),
    #[error("settlement failed: {0}")]
    SettlementFailed(String),
    #[error("transaction not confirmed within the polling deadline")]
    ConfirmationTimeout,
    #[error("on-chain outcome does not match the authorized payment: {0}")]
    PostSettlementVerification(String),
    #[error("chain rpc error: {0}")]
    Rpc(String),
}

impl PaymentError {
    /// Wire reason for this failure.
    pub fn reason(&self) -> ErrorReason {
        match self {
            PaymentError::IncompatibleScheme => ErrorReason::InvalidScheme,
            PaymentError::NetworkMismatch => ErrorReason::NetworkMismatch,
            PaymentError::UnsupportedNetwork(_) => ErrorReason::UnsupportedNetwork,
            PaymentError::NotConfigured(_) => ErrorReason::NotConfigured,
            PaymentError::InvalidSignature => ErrorReason::InvalidSignature,
            PaymentError::InvalidTiming => ErrorReason::InvalidTiming,
            PaymentError::InvalidRecipient => ErrorReason::InvalidRecipient,
            PaymentError::AssetMismatch(_) => ErrorReason::AssetMismatch,
            PaymentError::InsufficientFunds => ErrorReason::InsufficientFunds,
            PaymentError::InsufficientValue => ErrorReason::InsufficientValue,
            PaymentError::MalformedTransaction(_) => ErrorReason::MalformedPayload,
            PaymentError::SettlementFailed(_) => ErrorReason::SettlementFailed,
            PaymentError::ConfirmationTimeout => ErrorReason::ConfirmationTimeout,
            PaymentError::PostSettlementVerification(_) => {
                ErrorReason::PostSettlementVerificationFailed
            }
            PaymentError::Rpc(_) => ErrorReason::SettlementFailed,
        }
    }
}

/// Everything an adapter needs to act on one payment.
#[derive(Debug, Clone)]
pub struct SettlementContext {
    pub payload: PaymentPayload,
    pub requirements: PaymentRequirements,
    pub network: ResolvedNetwork,
}

/// A refund payout request originated by the claims state machine.
#[derive(Debug, Clone)]
pub struct Payout {
    pub asset: String,
    pub to: String,
    pub amount: TokenAmount,
}

/// Chain-family settlement backend.
#[async_trait]
pub trait SettlementAdapter: Send + Sync {
    fn family(&self) -> ChainFamily;

    /// CAIP-2 ids this adapter is configured for.
    fn chain_ids(&self) -> Vec<ChainId>;

    /// Addresses of the signing keys this adapter settles with, for the
    /// `/supported` listing. Empty when the adapter only verifies.
    fn signer_addresses(&self) -> Vec<String>;

    /// Check a payment without moving funds.
    async fn verify(&self, ctx: &SettlementContext) -> Result<VerifyResponse, PaymentError>;

    /// Execute the payment and wait for on-chain confirmation. Success is
    /// only reported once the transaction is confirmed.
    async fn settle(&self, ctx: &SettlementContext) -> Result<SettleResponse, PaymentError>;

    /// Send a refund payout from a dedicated wallet key. `secret` is the
    /// decrypted key material handed over by the claims store.
    async fn pay_out(
        &self,
        secret: &str,
        payout: &Payout,
        network: &ResolvedNetwork,
    ) -> Result<SettleResponse, PaymentError>;
}

/// Configured adapters, at most one per family.
#[derive(Clone, Default)]
pub struct AdapterSet {
    pub evm: Option<Arc<dyn SettlementAdapter>>,
    pub solana: Option<Arc<dyn SettlementAdapter>>,
    pub stacks: Option<Arc<dyn SettlementAdapter>>,
}

impl AdapterSet {
    pub fn for_family(&self, family: ChainFamily) -> Option<&Arc<dyn SettlementAdapter>> {
        match family {
            ChainFamily::Evm => self.evm.as_ref(),
            ChainFamily::Solana => self.solana.as_ref(),
            ChainFamily::Stacks => self.stacks.as_ref(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SettlementAdapter>> {
        [self.evm.as_ref(), self.solana.as_ref(), self.stacks.as_ref()]
            .into_iter()
            .flatten()
    }
}
