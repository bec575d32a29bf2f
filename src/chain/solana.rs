//! Solana settlement by relaying pre-signed transactions.
//!
//! The client builds and signs the SPL token transfer; the facilitator
//! verifies it structurally, co-signs as fee payer when the transaction
//! names its key, relays it with preflight skipped, and confirms it within
//! the lifetime of the transaction's recent blockhash.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_message::VersionedMessage;
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::Signer;
use solana_transaction::versioned::VersionedTransaction;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::chain::{PaymentError, Payout, SettlementAdapter, SettlementContext};
use crate::network::{ChainFamily, ChainId, ResolvedNetwork};
use crate::poller::{PollConfig, PollOutcome, PollStatus, poll};
use crate::types::{ErrorReason, PayloadDetail, SettleResponse, VerifyResponse};

const ASSOCIATED_TOKEN_PROGRAM_ID: Pubkey =
    Pubkey::from_str_const("ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL");

/// Confirmation is bounded by blockhash validity; two-second probes cover a
/// blockhash lifetime of roughly 60-90 seconds.
const CONFIRM_POLL: PollConfig = PollConfig {
    max_attempts: 45,
    interval: Duration::from_secs(2),
};

#[derive(Debug, thiserror::Error)]
pub enum SolanaSetupError {
    #[error("invalid signer key: {0}")]
    InvalidSigner(String),
}

/// One configured Solana cluster with the facilitator fee-payer keypair.
pub struct SolanaChain {
    chain_id: ChainId,
    keypair: Arc<Keypair>,
    rpc: Arc<RpcClient>,
}

impl SolanaChain {
    pub fn new(chain_id: ChainId, rpc_url: String, signer_base58: &str) -> Result<Self, SolanaSetupError> {
        let bytes = bs58::decode(signer_base58)
            .into_vec()
            .map_err(|e| SolanaSetupError::InvalidSigner(e.to_string()))?;
        let keypair = Keypair::try_from(bytes.as_slice())
            .map_err(|e| SolanaSetupError::InvalidSigner(e.to_string()))?;
        tracing::info!(chain = %chain_id, fee_payer = %keypair.pubkey(), rpc = rpc_url, "initialized Solana chain");
        Ok(Self {
            chain_id,
            keypair: Arc::new(keypair),
            rpc: Arc::new(RpcClient::new(rpc_url)),
        })
    }

    pub fn fee_payer(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    /// Place the facilitator's signature into its slot among the required
    /// signers. The transaction names the facilitator as fee payer; the
    /// client left that signature slot empty.
    fn co_sign(&self, mut tx: VersionedTransaction) -> Result<VersionedTransaction, PaymentError> {
        let message_bytes = tx.message.serialize();
        let signature = self
            .keypair
            .try_sign_message(&message_bytes)
            .map_err(|e| PaymentError::SettlementFailed(e.to_string()))?;
        let num_required = tx.message.header().num_required_signatures as usize;
        let static_keys = tx.message.static_account_keys();
        let pos = static_keys[..num_required.min(static_keys.len())]
            .iter()
            .position(|key| *key == self.fee_payer())
            .ok_or_else(|| {
                PaymentError::MalformedTransaction(
                    "facilitator is not among the required signers".to_string(),
                )
            })?;
        if tx.signatures.len() < num_required {
            tx.signatures.resize(num_required, Signature::default());
        }
        tx.signatures[pos] = signature;
        Ok(tx)
    }

    async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, PaymentError> {
        self.rpc
            .send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await
            .map_err(|e| PaymentError::SettlementFailed(e.to_string()))
    }

    /// Confirm a relayed transaction, giving up once its blockhash expires.
    async fn confirm(&self, signature: &Signature, blockhash: &solana_hash::Hash) -> PollOutcome<(), PaymentError> {
        let commitment = CommitmentConfig::confirmed();
        poll(CONFIRM_POLL, |_| async move {
            match self
                .rpc
                .confirm_transaction_with_commitment(signature, commitment)
                .await
            {
                Ok(response) if response.value => return PollStatus::Confirmed(()),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "confirmation probe failed");
                }
            }
            match self.rpc.is_blockhash_valid(blockhash, commitment).await {
                Ok(false) => PollStatus::Failed(PaymentError::ConfirmationTimeout),
                _ => PollStatus::Pending,
            }
        })
        .await
    }
}

/// Pre-signed-relay settlement adapter for Solana clusters.
pub struct SolanaAdapter {
    chains: HashMap<ChainId, SolanaChain>,
}

impl SolanaAdapter {
    pub fn new(chains: impl IntoIterator<Item = SolanaChain>) -> Self {
        let chains = chains
            .into_iter()
            .map(|chain| (chain.chain_id.clone(), chain))
            .collect();
        Self { chains }
    }

    fn chain(&self, network: &ResolvedNetwork) -> Result<&SolanaChain, PaymentError> {
        self.chains
            .get(&network.chain_id)
            .ok_or_else(|| PaymentError::NotConfigured(network.chain_id.clone()))
    }

    /// Structural checks shared by verify and settle. Returns the decoded
    /// transaction and the payer it identifies.
    fn check_transaction(
        &self,
        chain: &SolanaChain,
        ctx: &SettlementContext,
    ) -> Result<(VersionedTransaction, Pubkey), PaymentError> {
        if ctx.payload.scheme != ctx.requirements.scheme {
            return Err(PaymentError::IncompatibleScheme);
        }
        let encoded = signed_transaction(&ctx.payload.detail)?;
        let tx = decode_transaction(encoded)?;

        let num_required = tx.message.header().num_required_signatures as usize;
        let static_keys = tx.message.static_account_keys();
        if num_required == 0 || static_keys.len() < num_required {
            return Err(PaymentError::MalformedTransaction(
                "transaction has no required signers".to_string(),
            ));
        }
        if let Some(expected_fee_payer) = ctx.requirements.extra_str("feePayer") {
            let expected = Pubkey::from_str(&expected_fee_payer).map_err(|_| {
                PaymentError::MalformedTransaction("invalid feePayer in requirements".to_string())
            })?;
            if static_keys[0] != expected {
                return Err(PaymentError::MalformedTransaction(
                    "fee payer does not match the required one".to_string(),
                ));
            }
        }
        if !has_token_program(&tx.message) {
            return Err(PaymentError::MalformedTransaction(
                "transaction carries no SPL token instruction".to_string(),
            ));
        }

        let payer = payer_of(&tx.message, &chain.fee_payer());
        Ok((tx, payer))
    }
}

#[async_trait]
impl SettlementAdapter for SolanaAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Solana
    }

    fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.keys().cloned().collect()
    }

    fn signer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .chains
            .values()
            .map(|chain| chain.fee_payer().to_string())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    async fn verify(&self, ctx: &SettlementContext) -> Result<VerifyResponse, PaymentError> {
        let chain = self.chain(&ctx.network)?;
        let (_, payer) = self.check_transaction(chain, ctx)?;
        Ok(VerifyResponse::valid(payer.to_string()))
    }

    #[instrument(skip_all, err, fields(chain_id = %ctx.network.chain_id))]
    async fn settle(&self, ctx: &SettlementContext) -> Result<SettleResponse, PaymentError> {
        let chain = self.chain(&ctx.network)?;
        let (tx, payer) = self.check_transaction(chain, ctx)?;

        // Co-sign only when the client delegated fee payment to us.
        let static_keys = tx.message.static_account_keys();
        let tx = if static_keys.first() == Some(&chain.fee_payer()) {
            chain.co_sign(tx)?
        } else {
            tx
        };

        let blockhash = *tx.message.recent_blockhash();
        let signature = chain.send(&tx).await?;
        tracing::info!(tx = %signature, "relayed Solana transaction");

        let network = ctx.network.wire_name();
        match chain.confirm(&signature, &blockhash).await {
            PollOutcome::Confirmed(()) => Ok(SettleResponse::succeeded(
                network,
                payer.to_string(),
                signature.to_string(),
            )),
            // Blockhash expired or the deadline ran out. The transaction may
            // still land; report the signature so callers can reconcile.
            PollOutcome::Failed(_) | PollOutcome::TimedOut => Ok(SettleResponse::failed(
                network,
                ErrorReason::ConfirmationTimeout,
            )
            .with_payer(payer.to_string())
            .with_transaction(signature.to_string())
            .with_detail("transaction not confirmed before blockhash expiry")),
        }
    }

    #[instrument(skip_all, err, fields(chain_id = %network.chain_id))]
    async fn pay_out(
        &self,
        secret: &str,
        payout: &Payout,
        network: &ResolvedNetwork,
    ) -> Result<SettleResponse, PaymentError> {
        let chain = self.chain(network)?;
        let bytes = bs58::decode(secret)
            .into_vec()
            .map_err(|e| PaymentError::SettlementFailed(format!("invalid refund key: {e}")))?;
        let keypair = Keypair::try_from(bytes.as_slice())
            .map_err(|e| PaymentError::SettlementFailed(format!("invalid refund key: {e}")))?;
        let authority = keypair.pubkey();

        let mint = Pubkey::from_str(&payout.asset)
            .map_err(|_| PaymentError::MalformedTransaction("invalid mint address".to_string()))?;
        let recipient = Pubkey::from_str(&payout.to)
            .map_err(|_| PaymentError::InvalidRecipient)?;
        let amount = payout.amount.as_u64().ok_or_else(|| {
            PaymentError::SettlementFailed("payout amount exceeds u64".to_string())
        })?;

        let source = associated_token_address(&authority, &mint);
        let destination = associated_token_address(&recipient, &mint);
        let instruction = spl_token::instruction::transfer(
            &spl_token::id(),
            &source,
            &destination,
            &authority,
            &[],
            amount,
        )
        .map_err(|e| PaymentError::SettlementFailed(e.to_string()))?;

        let blockhash = chain
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;
        let message = solana_message::Message::new_with_blockhash(
            &[instruction],
            Some(&authority),
            &blockhash,
        );
        let tx = VersionedTransaction::try_new(VersionedMessage::Legacy(message), &[&keypair])
            .map_err(|e| PaymentError::SettlementFailed(e.to_string()))?;

        let signature = chain.send(&tx).await?;
        match chain.confirm(&signature, &blockhash).await {
            PollOutcome::Confirmed(()) => Ok(SettleResponse::succeeded(
                network.wire_name(),
                authority.to_string(),
                signature.to_string(),
            )),
            PollOutcome::Failed(e) => Err(e),
            PollOutcome::TimedOut => Err(PaymentError::ConfirmationTimeout),
        }
    }
}

fn signed_transaction(detail: &PayloadDetail) -> Result<&str, PaymentError> {
    match detail {
        PayloadDetail::SignedTransaction { transaction } => Ok(transaction),
        PayloadDetail::Evm(_) => Err(PaymentError::MalformedTransaction(
            "expected a pre-signed Solana transaction".to_string(),
        )),
    }
}

/// Decode a wire-encoded transaction. Base64 is the x402 convention;
/// base58 is accepted for compatibility with older clients.
pub fn decode_transaction(encoded: &str) -> Result<VersionedTransaction, PaymentError> {
    let bytes = b64
        .decode(encoded.as_bytes())
        .or_else(|_| bs58::decode(encoded).into_vec())
        .map_err(|_| {
            PaymentError::MalformedTransaction("transaction is not base64 or base58".to_string())
        })?;
    bincode::deserialize(&bytes).map_err(|e| {
        PaymentError::MalformedTransaction(format!("undecodable transaction: {e}"))
    })
}

/// The payer reported for this payment: the first required signer that is
/// not the facilitator fee payer, falling back to account key 0.
pub fn payer_of(message: &VersionedMessage, facilitator: &Pubkey) -> Pubkey {
    let num_required = message.header().num_required_signatures as usize;
    let static_keys = message.static_account_keys();
    static_keys[..num_required.min(static_keys.len())]
        .iter()
        .find(|key| *key != facilitator)
        .copied()
        .unwrap_or_else(|| static_keys[0])
}

fn has_token_program(message: &VersionedMessage) -> bool {
    let static_keys = message.static_account_keys();
    message.instructions().iter().any(|ix| {
        static_keys
            .get(ix.program_id_index as usize)
            .is_some_and(|program| *program == spl_token::id())
    })
}

/// Associated token account derivation, standard seeds.
fn associated_token_address(wallet: &Pubkey, mint: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(
        &[wallet.as_ref(), spl_token::id().as_ref(), mint.as_ref()],
        &ASSOCIATED_TOKEN_PROGRAM_ID,
    )
    .0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::SOLANA_NAMESPACE;
    use solana_keypair::Keypair;
    use solana_message::Message;

    fn transfer_message(fee_payer: &Pubkey, payer: &Pubkey) -> VersionedMessage {
        let source = Pubkey::new_unique();
        let destination = Pubkey::new_unique();
        let instruction = spl_token::instruction::transfer(
            &spl_token::id(),
            &source,
            &destination,
            payer,
            &[],
            1_000_000,
        )
        .unwrap();
        VersionedMessage::Legacy(Message::new(&[instruction], Some(fee_payer)))
    }

    #[test]
    fn garbage_transactions_rejected() {
        assert!(decode_transaction("not a transaction").is_err());
        assert!(decode_transaction(&b64.encode([0u8; 4])).is_err());
    }

    #[test]
    fn roundtrip_decodes_signed_transaction() {
        let payer = Keypair::new();
        let message = transfer_message(&payer.pubkey(), &payer.pubkey());
        let tx = VersionedTransaction::try_new(message, &[&payer]).unwrap();
        let encoded = b64.encode(bincode::serialize(&tx).unwrap());
        let decoded = decode_transaction(&encoded).unwrap();
        assert_eq!(decoded.signatures, tx.signatures);
        assert!(has_token_program(&decoded.message));
    }

    #[test]
    fn payer_skips_facilitator_fee_payer() {
        let facilitator = Pubkey::new_unique();
        let payer = Pubkey::new_unique();
        let message = transfer_message(&facilitator, &payer);
        assert_eq!(payer_of(&message, &facilitator), payer);

        // Self-funded transaction: the payer is the fee payer itself.
        let message = transfer_message(&payer, &payer);
        assert_eq!(payer_of(&message, &facilitator), payer);
    }

    #[test]
    fn co_sign_requires_membership() {
        let chain = SolanaChain {
            chain_id: ChainId::new(SOLANA_NAMESPACE, "test"),
            keypair: Arc::new(Keypair::new()),
            rpc: Arc::new(RpcClient::new("http://localhost:8899".to_string())),
        };
        let payer = Keypair::new();
        let message = transfer_message(&payer.pubkey(), &payer.pubkey());
        let tx = VersionedTransaction::try_new(message, &[&payer]).unwrap();
        assert!(chain.co_sign(tx).is_err());
    }

    #[test]
    fn co_sign_fills_fee_payer_slot() {
        let facilitator = Keypair::new();
        let payer = Keypair::new();
        let message = transfer_message(&facilitator.pubkey(), &payer.pubkey());
        // Client signs its own slot; the fee payer slot stays empty.
        let mut tx = VersionedTransaction {
            signatures: vec![Signature::default(); 2],
            message,
        };
        let serialized = tx.message.serialize();
        tx.signatures[1] = payer.sign_message(&serialized);

        let chain = SolanaChain {
            chain_id: ChainId::new(SOLANA_NAMESPACE, "test"),
            keypair: Arc::new(facilitator),
            rpc: Arc::new(RpcClient::new("http://localhost:8899".to_string())),
        };
        let signed = chain.co_sign(tx).unwrap();
        assert_ne!(signed.signatures[0], Signature::default());
        assert_eq!(signed.signatures[1], payer.sign_message(&serialized));
    }
}
