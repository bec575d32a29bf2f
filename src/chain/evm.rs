//! EVM settlement via ERC-3009 `transferWithAuthorization`.
//!
//! Verification recovers the EIP-712 signer and checks it against the
//! authorization's `from`, then confirms the payer's on-chain balance.
//! Settlement submits the authorized transfer from the facilitator's gas
//! wallet and reports success only after the receipt arrives.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, Signature, U256};
use alloy::providers::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, NonceManager,
    WalletFiller,
};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::signers::Signer;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy::sol_types::{Eip712Domain, SolStruct, eip712_domain};
use alloy::transports::TransportResult;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

use crate::chain::{PaymentError, Payout, SettlementAdapter, SettlementContext};
use crate::network::{ChainFamily, ChainId, EIP155_NAMESPACE, ResolvedNetwork};
use crate::timestamp::UnixTimestamp;
use crate::types::{
    AmountKind, ErrorReason, EvmAddress, ExactEvmPayload, ExactEvmPayloadAuthorization,
    PayloadDetail, PaymentRequirements, Scheme, SettleResponse, VerifyResponse,
};

sol! {
    #[allow(missing_docs)]
    #[sol(rpc)]
    contract Erc3009Token {
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes signature
        ) external;
        function transfer(address to, uint256 value) external returns (bool);
        function balanceOf(address account) external view returns (uint256);
        function version() external view returns (string);
    }
}

sol! {
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

/// Expiration must clear `now` by this many seconds so the settlement
/// transaction has time to land.
const TIMING_GRACE_SECS: u64 = 6;

const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Nonce manager that caches per-address nonces and seeds from the pending
/// transaction count, so a restart with mempool transactions in flight does
/// not produce "nonce too low" errors.
#[derive(Clone, Debug, Default)]
pub struct SerializedNonceManager {
    nonces: Arc<DashMap<Address, Arc<Mutex<u64>>>>,
}

// Sentinel meaning "not fetched yet".
const NONCE_UNSET: u64 = u64::MAX;

#[async_trait]
impl NonceManager for SerializedNonceManager {
    async fn get_next_nonce<P, N>(&self, provider: &P, address: Address) -> TransportResult<u64>
    where
        P: Provider<N>,
        N: alloy::network::Network,
    {
        // Clone the Arc out of the dashmap entry without holding the shard
        // lock across the await below.
        let slot = {
            let entry = self
                .nonces
                .entry(address)
                .or_insert_with(|| Arc::new(Mutex::new(NONCE_UNSET)));
            Arc::clone(entry.value())
        };

        let mut nonce = slot.lock().await;
        let next = if *nonce == NONCE_UNSET {
            tracing::trace!(%address, "fetching pending nonce");
            provider.get_transaction_count(address).pending().await?
        } else {
            *nonce + 1
        };
        *nonce = next;
        Ok(next)
    }
}

impl SerializedNonceManager {
    /// Forget the cached nonce after a failed send. The transaction may or
    /// may not have reached the mempool, so the next allocation re-queries
    /// with `.pending()`.
    pub async fn reset(&self, address: Address) {
        if let Some(slot) = self.nonces.get(&address) {
            let mut nonce = slot.lock().await;
            *nonce = NONCE_UNSET;
            tracing::debug!(%address, "reset cached nonce");
        }
    }
}

type EvmFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<SerializedNonceManager>, ChainIdFiller>>,
>;

type EvmProvider = FillProvider<
    JoinFill<JoinFill<Identity, EvmFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

/// Static EIP-712 metadata of a well-known USDC deployment.
struct UsdcDeployment {
    chain_reference: u64,
    address: &'static str,
    name: &'static str,
    version: &'static str,
}

static USDC_DEPLOYMENTS: &[UsdcDeployment] = &[
    UsdcDeployment {
        chain_reference: 8453,
        address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
        name: "USD Coin",
        version: "2",
    },
    UsdcDeployment {
        chain_reference: 84532,
        address: "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
        name: "USDC",
        version: "2",
    },
    UsdcDeployment {
        chain_reference: 137,
        address: "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359",
        name: "USD Coin",
        version: "2",
    },
    UsdcDeployment {
        chain_reference: 80002,
        address: "0x41E94Eb019C0762f9Bfcf9Fb1E58725BfB0e7582",
        name: "USDC",
        version: "2",
    },
    UsdcDeployment {
        chain_reference: 43114,
        address: "0xB97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E",
        name: "USD Coin",
        version: "2",
    },
    UsdcDeployment {
        chain_reference: 43113,
        address: "0x5425890298aed601595a70AB815c96711a31Bc65",
        name: "USD Coin",
        version: "2",
    },
];

fn usdc_by_chain(chain_reference: u64) -> Option<&'static UsdcDeployment> {
    USDC_DEPLOYMENTS
        .iter()
        .find(|d| d.chain_reference == chain_reference)
}

#[derive(Debug, thiserror::Error)]
pub enum EvmSetupError {
    #[error("invalid signer key: {0}")]
    InvalidSigner(String),
    #[error("invalid eip155 chain reference: {0}")]
    InvalidChainReference(String),
}

/// One configured EVM chain: provider with filler stack, gas wallet, fee
/// mode.
pub struct EvmChain {
    chain_reference: u64,
    eip1559: bool,
    rpc: Url,
    provider: EvmProvider,
    signer_address: Address,
    nonce_manager: SerializedNonceManager,
}

impl EvmChain {
    pub fn new(
        chain_id: &ChainId,
        rpc: Url,
        signer_key: &str,
        eip1559: bool,
    ) -> Result<Self, EvmSetupError> {
        let chain_reference: u64 = chain_id
            .reference
            .parse()
            .map_err(|_| EvmSetupError::InvalidChainReference(chain_id.reference.clone()))?;
        let signer = PrivateKeySigner::from_str(signer_key.trim_start_matches("0x"))
            .map_err(|e| EvmSetupError::InvalidSigner(e.to_string()))?
            .with_chain_id(Some(chain_reference));
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let nonce_manager = SerializedNonceManager::default();
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(nonce_manager.clone()),
                    ChainIdFiller::default(),
                ),
            ),
        );
        let provider: EvmProvider = ProviderBuilder::default()
            .filler(filler)
            .wallet(wallet)
            .connect_http(rpc.clone());

        tracing::info!(chain = %chain_id, signer = %signer_address, "initialized EVM chain");

        Ok(Self {
            chain_reference,
            eip1559,
            rpc,
            provider,
            signer_address,
            nonce_manager,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        ChainId::new(EIP155_NAMESPACE, self.chain_reference.to_string())
    }
}

/// ERC-3009 settlement adapter over a set of configured EVM chains.
pub struct EvmAdapter {
    chains: HashMap<ChainId, EvmChain>,
}

impl EvmAdapter {
    pub fn new(chains: impl IntoIterator<Item = EvmChain>) -> Self {
        let chains = chains
            .into_iter()
            .map(|chain| (chain.chain_id(), chain))
            .collect();
        Self { chains }
    }

    fn chain(&self, network: &ResolvedNetwork) -> Result<&EvmChain, PaymentError> {
        self.chains
            .get(&network.chain_id)
            .ok_or_else(|| PaymentError::NotConfigured(network.chain_id.clone()))
    }

    /// Run every precondition of a successful payment. Returns the payload
    /// once the signature, timing, recipient, value and balance all check
    /// out.
    #[instrument(skip_all, err, fields(chain_id = %ctx.network.chain_id))]
    async fn check_payment<'a>(
        &'a self,
        ctx: &'a SettlementContext,
    ) -> Result<(&'a EvmChain, &'a ExactEvmPayload), PaymentError> {
        let chain = self.chain(&ctx.network)?;
        let payload = exact_evm_payload(&ctx.payload.detail)?;
        check_requirements(&ctx.payload.scheme, payload, &ctx.requirements)?;
        check_time(&payload.authorization, UnixTimestamp::now())?;
        check_value(
            payload.authorization.value.as_u256(),
            ctx.requirements.amount.as_u256(),
            ctx.requirements.amount_kind,
        )?;

        let asset = parse_address(&ctx.requirements.asset)?;
        let contract = Erc3009Token::new(asset, &chain.provider);
        let domain = resolve_domain(&contract, chain.chain_reference, &asset, &ctx.requirements)
            .await?;
        check_signature(payload, &domain)?;

        let balance = contract
            .balanceOf(payload.authorization.from.0)
            .call()
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;
        if balance < ctx.requirements.amount.as_u256() {
            return Err(PaymentError::InsufficientFunds);
        }
        Ok((chain, payload))
    }
}

#[async_trait]
impl SettlementAdapter for EvmAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Evm
    }

    fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.keys().cloned().collect()
    }

    fn signer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .chains
            .values()
            .map(|chain| chain.signer_address.to_string())
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    async fn verify(&self, ctx: &SettlementContext) -> Result<VerifyResponse, PaymentError> {
        let (_, payload) = self.check_payment(ctx).await?;
        Ok(VerifyResponse::valid(
            payload.authorization.from.to_string(),
        ))
    }

    #[instrument(skip_all, err, fields(chain_id = %ctx.network.chain_id))]
    async fn settle(&self, ctx: &SettlementContext) -> Result<SettleResponse, PaymentError> {
        let (chain, payload) = self.check_payment(ctx).await?;
        let asset = parse_address(&ctx.requirements.asset)?;
        let contract = Erc3009Token::new(asset, &chain.provider);

        let auth = &payload.authorization;
        let from: Address = auth.from.into();
        let call = contract.transferWithAuthorization(
            from,
            auth.to.into(),
            auth.value.as_u256(),
            U256::from(auth.valid_after.as_secs()),
            U256::from(auth.valid_before.as_secs()),
            FixedBytes(auth.nonce.0),
            Bytes::from(payload.signature.0),
        );

        let call = if chain.eip1559 {
            call
        } else {
            let gas = chain
                .provider
                .get_gas_price()
                .await
                .map_err(|e| PaymentError::Rpc(e.to_string()))?;
            call.gas_price(gas)
        };

        let pending = match call.send().await {
            Ok(pending) => pending,
            Err(e) => {
                chain.nonce_manager.reset(chain.signer_address).await;
                return Err(PaymentError::SettlementFailed(e.to_string()));
            }
        };
        let tx_hash = *pending.tx_hash();
        tracing::info!(tx = %tx_hash, rpc = %chain.rpc, "submitted transferWithAuthorization");

        let receipt = match pending
            .with_required_confirmations(1)
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                chain.nonce_manager.reset(chain.signer_address).await;
                tracing::warn!(tx = %tx_hash, error = %e, "receipt wait failed");
                return Err(PaymentError::ConfirmationTimeout);
            }
        };

        let network = ctx.network.wire_name();
        let payer = auth.from.to_string();
        let transaction = format!("{}", receipt.transaction_hash);
        if receipt.status() {
            tracing::info!(tx = %transaction, "transferWithAuthorization succeeded");
            Ok(SettleResponse::succeeded(network, payer, transaction))
        } else {
            tracing::warn!(tx = %transaction, "transferWithAuthorization reverted");
            Ok(SettleResponse::failed(network, ErrorReason::SettlementFailed)
                .with_payer(payer)
                .with_transaction(transaction)
                .with_detail("transaction reverted"))
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
        let signer = PrivateKeySigner::from_str(secret.trim_start_matches("0x"))
            .map_err(|e| PaymentError::SettlementFailed(format!("invalid refund key: {e}")))?
            .with_chain_id(Some(chain.chain_reference));
        let payer = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_http(chain.rpc.clone());

        let asset = parse_address(&payout.asset)?;
        let to = payout
            .to
            .parse::<EvmAddress>()
            .map_err(|_| PaymentError::InvalidRecipient)?;
        let contract = Erc3009Token::new(asset, provider);
        let pending = contract
            .transfer(to.into(), payout.amount.as_u256())
            .send()
            .await
            .map_err(|e| PaymentError::SettlementFailed(e.to_string()))?;
        let receipt = pending
            .with_required_confirmations(1)
            .with_timeout(Some(RECEIPT_TIMEOUT))
            .get_receipt()
            .await
            .map_err(|_| PaymentError::ConfirmationTimeout)?;

        let transaction = format!("{}", receipt.transaction_hash);
        if receipt.status() {
            Ok(SettleResponse::succeeded(
                network.wire_name(),
                payer.to_string(),
                transaction,
            ))
        } else {
            Err(PaymentError::SettlementFailed(format!(
                "payout transfer reverted: {transaction}"
            )))
        }
    }
}

fn exact_evm_payload(detail: &PayloadDetail) -> Result<&ExactEvmPayload, PaymentError> {
    match detail {
        PayloadDetail::Evm(payload) => Ok(payload),
        PayloadDetail::SignedTransaction { .. } => Err(PaymentError::MalformedTransaction(
            "expected an ERC-3009 authorization payload".to_string(),
        )),
    }
}

fn parse_address(s: &str) -> Result<Address, PaymentError> {
    Address::from_str(s)
        .map_err(|_| PaymentError::MalformedTransaction(format!("invalid EVM address: {s}")))
}

/// Scheme and recipient compatibility between payload and requirements.
fn check_requirements(
    scheme: &Scheme,
    payload: &ExactEvmPayload,
    requirements: &PaymentRequirements,
) -> Result<(), PaymentError> {
    if *scheme != requirements.scheme {
        return Err(PaymentError::IncompatibleScheme);
    }
    let pay_to = requirements
        .pay_to
        .parse::<EvmAddress>()
        .map_err(|_| PaymentError::InvalidRecipient)?;
    if payload.authorization.to != pay_to {
        return Err(PaymentError::InvalidRecipient);
    }
    Ok(())
}

/// Authorization window check with a grace buffer for settlement latency.
fn check_time(
    authorization: &ExactEvmPayloadAuthorization,
    now: UnixTimestamp,
) -> Result<(), PaymentError> {
    let now = now.as_secs();
    if authorization.valid_before.as_secs() < now + TIMING_GRACE_SECS {
        return Err(PaymentError::InvalidTiming);
    }
    if authorization.valid_after.as_secs() > now {
        return Err(PaymentError::InvalidTiming);
    }
    Ok(())
}

/// Authorized value against the required amount. A ceiling requirement
/// accepts any value at or above it; an exact requirement accepts only
/// equality.
fn check_value(sent: U256, required: U256, kind: AmountKind) -> Result<(), PaymentError> {
    let ok = match kind {
        AmountKind::Ceiling => sent >= required,
        AmountKind::Exact => sent == required,
    };
    if ok {
        Ok(())
    } else {
        Err(PaymentError::InsufficientValue)
    }
}

/// EIP-712 domain for the token. `extra.name`/`extra.version` from the
/// requirements win; otherwise static USDC metadata; otherwise the
/// contract's own `version()`.
async fn resolve_domain<P: Provider>(
    contract: &Erc3009Token::Erc3009TokenInstance<P>,
    chain_reference: u64,
    asset: &Address,
    requirements: &PaymentRequirements,
) -> Result<Eip712Domain, PaymentError> {
    let deployment = usdc_by_chain(chain_reference)
        .filter(|d| d.address.eq_ignore_ascii_case(&asset.to_string()));
    let name = requirements
        .extra_str("name")
        .or_else(|| deployment.map(|d| d.name.to_string()))
        .unwrap_or_else(|| "USD Coin".to_string());
    let version = match requirements.extra_str("version") {
        Some(version) => version,
        None => match deployment {
            Some(d) => d.version.to_string(),
            None => contract
                .version()
                .call()
                .await
                .map_err(|e| PaymentError::Rpc(e.to_string()))?,
        },
    };
    Ok(eip712_domain! {
        name: name,
        version: version,
        chain_id: chain_reference,
        verifying_contract: *asset,
    })
}

/// Recover the EIP-712 signer and compare with the authorization's `from`.
fn check_signature(payload: &ExactEvmPayload, domain: &Eip712Domain) -> Result<(), PaymentError> {
    let signature =
        Signature::from_raw_array(&payload.signature.0).map_err(|_| PaymentError::InvalidSignature)?;
    let auth = &payload.authorization;
    let message = TransferWithAuthorization {
        from: auth.from.0,
        to: auth.to.0,
        value: auth.value.as_u256(),
        validAfter: U256::from(auth.valid_after.as_secs()),
        validBefore: U256::from(auth.valid_before.as_secs()),
        nonce: FixedBytes(auth.nonce.0),
    };
    let hash = message.eip712_signing_hash(domain);
    let recovered = signature
        .recover_address_from_prehash(&hash)
        .map_err(|_| PaymentError::InvalidSignature)?;
    if recovered != auth.from.0 {
        return Err(PaymentError::InvalidSignature);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EvmSignature, HexEncodedNonce, TokenAmount};
    use alloy::signers::SignerSync;

    fn authorization(valid_after: u64, valid_before: u64) -> ExactEvmPayloadAuthorization {
        ExactEvmPayloadAuthorization {
            from: "0x857b06519E91e3A54538791bDbb0E22373e36b66"
                .parse()
                .unwrap(),
            to: "0x209693Bc6afc0C5328bA36FaF03C514EF312287C".parse().unwrap(),
            value: TokenAmount::from(1_000_000u64),
            valid_after: UnixTimestamp::from_secs(valid_after),
            valid_before: UnixTimestamp::from_secs(valid_before),
            nonce: HexEncodedNonce([7u8; 32]),
        }
    }

    #[test]
    fn time_window_enforces_grace() {
        let now = UnixTimestamp::from_secs(1_000);
        // expires in 5s, inside the 6s grace buffer
        assert!(check_time(&authorization(0, 1_005), now).is_err());
        assert!(check_time(&authorization(0, 1_007), now).is_ok());
        // not active yet
        assert!(check_time(&authorization(1_001, 2_000), now).is_err());
    }

    #[test]
    fn value_ceiling_vs_exact() {
        let required = U256::from(100u64);
        assert!(check_value(U256::from(100u64), required, AmountKind::Ceiling).is_ok());
        assert!(check_value(U256::from(150u64), required, AmountKind::Ceiling).is_ok());
        assert!(check_value(U256::from(99u64), required, AmountKind::Ceiling).is_err());
        assert!(check_value(U256::from(100u64), required, AmountKind::Exact).is_ok());
        assert!(check_value(U256::from(150u64), required, AmountKind::Exact).is_err());
    }

    #[test]
    fn signature_roundtrip_recovers_signer() {
        let signer = PrivateKeySigner::random();
        let domain = eip712_domain! {
            name: "USD Coin",
            version: "2",
            chain_id: 8453u64,
            verifying_contract: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap(),
        };
        let mut auth = authorization(0, u64::from(u32::MAX));
        auth.from = EvmAddress(signer.address());
        let message = TransferWithAuthorization {
            from: auth.from.0,
            to: auth.to.0,
            value: auth.value.as_u256(),
            validAfter: U256::from(auth.valid_after.as_secs()),
            validBefore: U256::from(auth.valid_before.as_secs()),
            nonce: FixedBytes(auth.nonce.0),
        };
        let hash = message.eip712_signing_hash(&domain);
        let signature = signer.sign_hash_sync(&hash).unwrap();
        let payload = ExactEvmPayload {
            signature: EvmSignature(signature.as_bytes()),
            authorization: auth,
        };
        assert!(check_signature(&payload, &domain).is_ok());

        // Same signature under a different domain must not verify.
        let other_domain = eip712_domain! {
            name: "USD Coin",
            version: "2",
            chain_id: 1u64,
            verifying_contract: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".parse().unwrap(),
        };
        assert!(check_signature(&payload, &other_domain).is_err());
    }

    #[test]
    fn recipient_mismatch_rejected() {
        let payload = ExactEvmPayload {
            signature: EvmSignature([0u8; 65]),
            authorization: authorization(0, 2_000),
        };
        let requirements: PaymentRequirements = serde_json::from_value(serde_json::json!({
            "scheme": "exact",
            "network": "base",
            "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            "maxAmountRequired": "1000000",
            "payTo": "0x857b06519E91e3A54538791bDbb0E22373e36b66",
        }))
        .unwrap();
        let result = check_requirements(&Scheme::Exact, &payload, &requirements);
        assert!(matches!(result, Err(PaymentError::InvalidRecipient)));
    }
}
