//! Stacks settlement by relaying pre-signed transactions through an
//! indexer API.
//!
//! The client signs a complete Stacks transaction (native STX transfer or a
//! SIP-010 contract call). The facilitator reads the wire format to check
//! recipient and amount before broadcasting, relays the raw bytes, polls the
//! indexer for anchoring, and then re-checks the indexer's view of the mined
//! transaction. A transaction that mined but paid the wrong party is a
//! failed settlement.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as b64;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::instrument;
use url::Url;

use crate::chain::{PaymentError, Payout, SettlementAdapter, SettlementContext};
use crate::network::{ChainFamily, ChainId, ResolvedNetwork};
use crate::poller::{BackoffPolicy, PollConfig, PollOutcome, PollStatus, poll};
use crate::types::{AmountKind, ErrorReason, PayloadDetail, SettleResponse, VerifyResponse};

/// Stacks blocks are slow; the indexer is polled for five minutes.
const CONFIRM_POLL: PollConfig = PollConfig {
    max_attempts: 30,
    interval: Duration::from_secs(10),
};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(10);

const VERSION_MAINNET: u8 = 0x00;
const VERSION_TESTNET: u8 = 0x80;

/// One configured Stacks network behind a Hiro-style indexer.
pub struct StacksChain {
    chain_id: ChainId,
    api: Url,
    client: reqwest::Client,
    throttle: BackoffPolicy,
}

impl StacksChain {
    pub fn new(chain_id: ChainId, api: Url) -> Self {
        tracing::info!(chain = %chain_id, api = %api, "initialized Stacks chain");
        Self {
            chain_id,
            api,
            client: reqwest::Client::new(),
            throttle: BackoffPolicy::new(
                CONFIRM_POLL.max_attempts,
                DEFAULT_RETRY_AFTER,
                Duration::from_secs(60),
            ),
        }
    }

    /// Wait before the next probe after a 429. `Retry-After` wins when the
    /// indexer sends one; otherwise the wait grows with each consecutive
    /// rate-limited probe.
    fn retry_wait(&self, retry_after: Option<Duration>, throttled: &AtomicU32) -> Duration {
        let consecutive = throttled.fetch_add(1, Ordering::Relaxed) + 1;
        match retry_after {
            Some(wait) => wait,
            None => self.throttle.delay(consecutive),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, PaymentError> {
        self.api
            .join(path)
            .map_err(|e| PaymentError::Rpc(e.to_string()))
    }

    /// Relay raw transaction bytes. The indexer answers with the txid.
    async fn broadcast(&self, raw: &[u8]) -> Result<String, PaymentError> {
        let url = self.endpoint("v2/transactions")?;
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(raw.to_vec())
            .send()
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PaymentError::Rpc(e.to_string()))?;
        if !status.is_success() {
            return Err(PaymentError::SettlementFailed(format!(
                "broadcast rejected ({status}): {body}"
            )));
        }
        let txid = body.trim().trim_matches('"').trim_start_matches("0x");
        if txid.is_empty() {
            return Err(PaymentError::Rpc("broadcast returned no txid".to_string()));
        }
        Ok(txid.to_string())
    }

    /// One status probe against the indexer. `throttled` counts consecutive
    /// rate-limited probes for the backoff fallback.
    async fn probe(&self, txid: &str, throttled: &AtomicU32) -> PollStatus<ConfirmedTx, PaymentError> {
        let url = match self.endpoint(&format!("extended/v1/tx/0x{txid}")) {
            Ok(url) => url,
            Err(e) => return PollStatus::Failed(e),
        };
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "status probe failed");
                return PollStatus::Pending;
            }
        };
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let wait = self.retry_wait(retry_after, throttled);
            tracing::debug!(wait_secs = wait.as_secs(), "indexer rate limited");
            return PollStatus::Wait(wait);
        }
        throttled.store(0, Ordering::Relaxed);
        match response.status() {
            StatusCode::NOT_FOUND => PollStatus::Pending,
            status if !status.is_success() => {
                tracing::debug!(%status, "unexpected indexer status");
                PollStatus::Pending
            }
            _ => {
                let tx: ConfirmedTx = match response.json().await {
                    Ok(tx) => tx,
                    Err(e) => {
                        tracing::debug!(error = %e, "unreadable indexer response");
                        return PollStatus::Pending;
                    }
                };
                match tx.tx_status.as_str() {
                    "success" => PollStatus::Confirmed(tx),
                    "pending" => PollStatus::Pending,
                    status if status.starts_with("abort") || status.starts_with("dropped") => {
                        PollStatus::Failed(PaymentError::SettlementFailed(format!(
                            "transaction {status}"
                        )))
                    }
                    _ => PollStatus::Pending,
                }
            }
        }
    }
}

/// Indexer view of a transaction, reduced to what post-settlement
/// verification needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmedTx {
    pub tx_status: String,
    #[serde(default)]
    pub token_transfer: Option<TokenTransferView>,
    #[serde(default)]
    pub contract_call: Option<ContractCallView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenTransferView {
    pub recipient_address: String,
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractCallView {
    pub contract_id: String,
    #[serde(default)]
    pub function_args: Vec<FunctionArgView>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionArgView {
    pub repr: String,
}

/// Pre-signed-relay settlement adapter for Stacks.
pub struct StacksAdapter {
    chains: HashMap<ChainId, StacksChain>,
}

impl StacksAdapter {
    pub fn new(chains: impl IntoIterator<Item = StacksChain>) -> Self {
        let chains = chains
            .into_iter()
            .map(|chain| (chain.chain_id.clone(), chain))
            .collect();
        Self { chains }
    }

    fn chain(&self, network: &ResolvedNetwork) -> Result<&StacksChain, PaymentError> {
        self.chains
            .get(&network.chain_id)
            .ok_or_else(|| PaymentError::NotConfigured(network.chain_id.clone()))
    }

    /// Decode and check the transaction before broadcasting anything.
    fn check_transaction(
        &self,
        ctx: &SettlementContext,
    ) -> Result<(Vec<u8>, StacksTransaction), PaymentError> {
        if ctx.payload.scheme != ctx.requirements.scheme {
            return Err(PaymentError::IncompatibleScheme);
        }
        let encoded = match &ctx.payload.detail {
            PayloadDetail::SignedTransaction { transaction } => transaction,
            PayloadDetail::Evm(_) => {
                return Err(PaymentError::MalformedTransaction(
                    "expected a pre-signed Stacks transaction".to_string(),
                ));
            }
        };
        let raw = decode_raw(encoded)?;
        let tx = StacksTransaction::parse(&raw)?;

        let expected_version = if ctx.network.testnet {
            VERSION_TESTNET
        } else {
            VERSION_MAINNET
        };
        if tx.version != expected_version {
            return Err(PaymentError::NetworkMismatch);
        }

        check_asset(&tx.payload, &ctx.requirements.asset)?;
        let (recipients, amount) = tx.payment_targets()?;
        if !recipients.iter().any(|r| *r == ctx.requirements.pay_to) {
            return Err(PaymentError::InvalidRecipient);
        }
        check_amount(amount, &ctx.requirements.amount, ctx.requirements.amount_kind)?;
        Ok((raw, tx))
    }
}

#[async_trait]
impl SettlementAdapter for StacksAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Stacks
    }

    fn chain_ids(&self) -> Vec<ChainId> {
        self.chains.keys().cloned().collect()
    }

    fn signer_addresses(&self) -> Vec<String> {
        // The facilitator never signs Stacks transactions; it only relays.
        Vec::new()
    }

    async fn verify(&self, ctx: &SettlementContext) -> Result<VerifyResponse, PaymentError> {
        self.chain(&ctx.network)?;
        let (_, tx) = self.check_transaction(ctx)?;
        Ok(VerifyResponse::valid(tx.sender.clone()))
    }

    #[instrument(skip_all, err, fields(chain_id = %ctx.network.chain_id))]
    async fn settle(&self, ctx: &SettlementContext) -> Result<SettleResponse, PaymentError> {
        let chain = self.chain(&ctx.network)?;
        let (raw, tx) = self.check_transaction(ctx)?;

        let txid = chain.broadcast(&raw).await?;
        tracing::info!(tx = %txid, "broadcast Stacks transaction");

        let throttled = AtomicU32::new(0);
        let outcome = poll(CONFIRM_POLL, |_| chain.probe(&txid, &throttled)).await;
        let network = ctx.network.wire_name();
        let payer = tx.sender.clone();
        match outcome {
            PollOutcome::Confirmed(confirmed) => {
                match check_confirmed(
                    &confirmed,
                    &ctx.requirements.asset,
                    &ctx.requirements.pay_to,
                    &ctx.requirements.amount,
                    ctx.requirements.amount_kind,
                ) {
                    Ok(()) => Ok(SettleResponse::succeeded(network, payer, txid)),
                    Err(e) => {
                        tracing::warn!(tx = %txid, error = %e, "mined transaction failed post-settlement check");
                        Ok(SettleResponse::failed(network, e.reason())
                            .with_payer(payer)
                            .with_transaction(txid)
                            .with_detail(e.to_string()))
                    }
                }
            }
            PollOutcome::Failed(e) => Ok(SettleResponse::failed(network, e.reason())
                .with_payer(payer)
                .with_transaction(txid)
                .with_detail(e.to_string())),
            PollOutcome::TimedOut => Ok(SettleResponse::failed(
                network,
                ErrorReason::ConfirmationTimeout,
            )
            .with_payer(payer)
            .with_transaction(txid)
            .with_detail("transaction not anchored within the polling deadline")),
        }
    }

    async fn pay_out(
        &self,
        _secret: &str,
        _payout: &Payout,
        network: &ResolvedNetwork,
    ) -> Result<SettleResponse, PaymentError> {
        // Originating fresh Stacks transactions needs a wallet stack this
        // service does not carry; refunds on Stacks stay manual.
        Err(PaymentError::NotConfigured(network.chain_id.clone()))
    }
}

fn decode_raw(encoded: &str) -> Result<Vec<u8>, PaymentError> {
    let hex_str = encoded.trim().trim_start_matches("0x");
    hex::decode(hex_str)
        .or_else(|_| b64.decode(encoded.trim().as_bytes()))
        .map_err(|_| {
            PaymentError::MalformedTransaction("transaction is not hex or base64".to_string())
        })
}

/// Requirements name either native STX (empty or "stx") or a SIP-010
/// contract principal, optionally with a `::token-name` suffix.
fn is_native_asset(asset: &str) -> bool {
    asset.is_empty() || asset.eq_ignore_ascii_case("stx")
}

fn asset_contract(asset: &str) -> &str {
    asset.split("::").next().unwrap_or(asset)
}

/// The transaction must move the asset the requirements name: a native
/// transfer only satisfies native STX, a contract call only the matching
/// SIP-010 contract.
fn check_asset(payload: &StacksPayload, asset: &str) -> Result<(), PaymentError> {
    match payload {
        StacksPayload::TokenTransfer { .. } => {
            if is_native_asset(asset) {
                Ok(())
            } else {
                Err(PaymentError::AssetMismatch(format!(
                    "native STX transfer, requirements name {asset}"
                )))
            }
        }
        StacksPayload::ContractCall { contract, .. } => {
            if is_native_asset(asset) {
                Err(PaymentError::AssetMismatch(format!(
                    "contract call to {contract}, requirements name native STX"
                )))
            } else if contract.eq_ignore_ascii_case(asset_contract(asset)) {
                Ok(())
            } else {
                Err(PaymentError::AssetMismatch(format!(
                    "calls {contract}, requirements name {asset}"
                )))
            }
        }
    }
}

fn check_amount(
    sent: u128,
    required: &crate::types::TokenAmount,
    kind: AmountKind,
) -> Result<(), PaymentError> {
    let required = required
        .as_u128()
        .ok_or(PaymentError::InsufficientValue)?;
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

/// Re-check the indexer's record of the mined transaction against the
/// payment requirements. The mempool accepts what it likes; only the mined
/// effects count.
pub fn check_confirmed(
    tx: &ConfirmedTx,
    expected_asset: &str,
    expected_recipient: &str,
    expected_amount: &crate::types::TokenAmount,
    kind: AmountKind,
) -> Result<(), PaymentError> {
    let (recipients, amount) = if let Some(transfer) = &tx.token_transfer {
        if !is_native_asset(expected_asset) {
            return Err(PaymentError::PostSettlementVerification(format!(
                "mined a native STX transfer, requirements name {expected_asset}"
            )));
        }
        let amount: u128 = transfer.amount.parse().map_err(|_| {
            PaymentError::PostSettlementVerification("unreadable mined amount".to_string())
        })?;
        (vec![transfer.recipient_address.clone()], amount)
    } else if let Some(call) = &tx.contract_call {
        if is_native_asset(expected_asset) {
            return Err(PaymentError::PostSettlementVerification(format!(
                "mined a call to {}, requirements name native STX",
                call.contract_id
            )));
        }
        if !call
            .contract_id
            .eq_ignore_ascii_case(asset_contract(expected_asset))
        {
            return Err(PaymentError::PostSettlementVerification(format!(
                "mined a call to {}, requirements name {expected_asset}",
                call.contract_id
            )));
        }
        let recipients: Vec<String> = call
            .function_args
            .iter()
            .filter_map(|arg| arg.repr.strip_prefix('\'').map(str::to_string))
            .collect();
        if recipients.is_empty() {
            return Err(PaymentError::PostSettlementVerification(
                "mined contract call names no recipient".to_string(),
            ));
        }
        let amount = call
            .function_args
            .iter()
            .find_map(|arg| arg.repr.strip_prefix('u')?.parse::<u128>().ok())
            .ok_or_else(|| {
                PaymentError::PostSettlementVerification(
                    "mined contract call names no amount".to_string(),
                )
            })?;
        (recipients, amount)
    } else {
        return Err(PaymentError::PostSettlementVerification(
            "mined transaction moved no tokens".to_string(),
        ));
    };

    if !recipients.iter().any(|r| r == expected_recipient) {
        return Err(PaymentError::PostSettlementVerification(format!(
            "paid {recipients:?}, requirements name {expected_recipient}"
        )));
    }
    let expected = expected_amount
        .as_u128()
        .ok_or_else(|| PaymentError::PostSettlementVerification("amount overflow".to_string()))?;
    let ok = match kind {
        AmountKind::Ceiling => amount >= expected,
        AmountKind::Exact => amount == expected,
    };
    if !ok {
        return Err(PaymentError::PostSettlementVerification(format!(
            "paid {amount}, requirements name {expected}"
        )));
    }
    Ok(())
}

// --- Stacks wire format -------------------------------------------------
//
// Just enough of SIP-005 transaction encoding to read who pays whom before
// relaying. Single-signature spending conditions only.

const ADDR_MAINNET_P2PKH: u8 = 22;
const ADDR_MAINNET_P2SH: u8 = 20;
const ADDR_TESTNET_P2PKH: u8 = 26;
const ADDR_TESTNET_P2SH: u8 = 21;

/// What a parsed transaction pays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StacksPayload {
    /// Native STX transfer to a principal.
    TokenTransfer { recipient: String, amount: u64 },
    /// SIP-010 style contract call; recipient and amount are read from the
    /// Clarity arguments.
    ContractCall {
        contract: String,
        function: String,
        args: Vec<ClarityArg>,
    },
}

/// Clarity argument, reduced to the shapes a token transfer uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarityArg {
    Uint(u128),
    Int(i128),
    Principal(String),
    Buffer(Vec<u8>),
    Bool(bool),
    None,
    Some(Box<ClarityArg>),
    Other,
}

#[derive(Debug, Clone)]
pub struct StacksTransaction {
    pub version: u8,
    pub chain_id: u32,
    pub sender: String,
    pub nonce: u64,
    pub fee: u64,
    pub payload: StacksPayload,
}

impl StacksTransaction {
    pub fn parse(raw: &[u8]) -> Result<Self, PaymentError> {
        let mut cursor = Cursor::new(raw);
        let version = cursor.u8()?;
        if version != VERSION_MAINNET && version != VERSION_TESTNET {
            return Err(malformed("unknown transaction version"));
        }
        let chain_id = cursor.u32()?;

        let auth_type = cursor.u8()?;
        let (sender, nonce, fee) = parse_spending_condition(&mut cursor, version)?;
        match auth_type {
            0x04 => {}
            0x05 => {
                // Sponsored: skip the sponsor's spending condition.
                parse_spending_condition(&mut cursor, version)?;
            }
            _ => return Err(malformed("unknown authorization type")),
        }

        let _anchor_mode = cursor.u8()?;
        let post_condition_mode = cursor.u8()?;
        if post_condition_mode != 0x01 && post_condition_mode != 0x02 {
            return Err(malformed("unknown post-condition mode"));
        }
        let post_condition_count = cursor.u32()?;
        for _ in 0..post_condition_count {
            skip_post_condition(&mut cursor)?;
        }

        let payload = parse_payload(&mut cursor)?;
        Ok(StacksTransaction {
            version,
            chain_id,
            sender,
            nonce,
            fee,
            payload,
        })
    }

    /// The principals this transaction can pay and the amount it moves.
    ///
    /// A native transfer has exactly one recipient. A SIP-010 contract call
    /// carries both sender and recipient as principal arguments with no
    /// reliable ordering, so every principal is returned and the caller
    /// checks that the required one is among them.
    pub fn payment_targets(&self) -> Result<(Vec<String>, u128), PaymentError> {
        match &self.payload {
            StacksPayload::TokenTransfer { recipient, amount } => {
                Ok((vec![recipient.clone()], u128::from(*amount)))
            }
            StacksPayload::ContractCall { args, .. } => {
                let principals: Vec<String> = args
                    .iter()
                    .filter_map(|arg| match arg {
                        ClarityArg::Principal(p) => Some(p.clone()),
                        _ => None,
                    })
                    .collect();
                if principals.is_empty() {
                    return Err(malformed("contract call names no recipient"));
                }
                let amount = args
                    .iter()
                    .find_map(|arg| match arg {
                        ClarityArg::Uint(amount) => Some(*amount),
                        _ => None,
                    })
                    .ok_or_else(|| malformed("contract call names no amount"))?;
                Ok((principals, amount))
            }
        }
    }
}

fn malformed(what: &str) -> PaymentError {
    PaymentError::MalformedTransaction(what.to_string())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PaymentError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| malformed("truncated transaction"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PaymentError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PaymentError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, PaymentError> {
        let bytes = self.take(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(array))
    }

    fn u128(&mut self) -> Result<u128, PaymentError> {
        let bytes = self.take(16)?;
        let mut array = [0u8; 16];
        array.copy_from_slice(bytes);
        Ok(u128::from_be_bytes(array))
    }

    fn hash160(&mut self) -> Result<[u8; 20], PaymentError> {
        let bytes = self.take(20)?;
        let mut array = [0u8; 20];
        array.copy_from_slice(bytes);
        Ok(array)
    }

    /// A length-prefixed Clarity name (1-byte length).
    fn name(&mut self) -> Result<String, PaymentError> {
        let len = self.u8()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("non-utf8 name"))
    }
}

/// Single-signature spending condition: signer hash, nonce, fee.
fn parse_spending_condition(
    cursor: &mut Cursor<'_>,
    tx_version: u8,
) -> Result<(String, u64, u64), PaymentError> {
    let hash_mode = cursor.u8()?;
    let address_version = match (hash_mode, tx_version) {
        (0x00, VERSION_MAINNET) | (0x02, VERSION_MAINNET) => ADDR_MAINNET_P2PKH,
        (0x00, VERSION_TESTNET) | (0x02, VERSION_TESTNET) => ADDR_TESTNET_P2PKH,
        (0x03, VERSION_MAINNET) => ADDR_MAINNET_P2SH,
        (0x03, VERSION_TESTNET) => ADDR_TESTNET_P2SH,
        (0x01, _) => return Err(malformed("multisig senders not supported")),
        _ => return Err(malformed("unknown spending condition hash mode")),
    };
    let signer = cursor.hash160()?;
    let nonce = cursor.u64()?;
    let fee = cursor.u64()?;
    let _key_encoding = cursor.u8()?;
    let _signature = cursor.take(65)?;
    Ok((c32_address(address_version, &signer), nonce, fee))
}

fn skip_principal(cursor: &mut Cursor<'_>) -> Result<(), PaymentError> {
    match cursor.u8()? {
        0x01 => Ok(()),
        0x02 => {
            cursor.u8()?;
            cursor.hash160()?;
            Ok(())
        }
        0x03 => {
            cursor.u8()?;
            cursor.hash160()?;
            cursor.name()?;
            Ok(())
        }
        _ => Err(malformed("unknown post-condition principal")),
    }
}

fn skip_asset_info(cursor: &mut Cursor<'_>) -> Result<(), PaymentError> {
    cursor.u8()?;
    cursor.hash160()?;
    cursor.name()?;
    cursor.name()?;
    Ok(())
}

fn skip_post_condition(cursor: &mut Cursor<'_>) -> Result<(), PaymentError> {
    match cursor.u8()? {
        0x00 => {
            skip_principal(cursor)?;
            cursor.u8()?;
            cursor.u64()?;
            Ok(())
        }
        0x01 => {
            skip_principal(cursor)?;
            skip_asset_info(cursor)?;
            cursor.u8()?;
            cursor.u64()?;
            Ok(())
        }
        0x02 => {
            skip_principal(cursor)?;
            skip_asset_info(cursor)?;
            parse_clarity_value(cursor)?;
            cursor.u8()?;
            Ok(())
        }
        _ => Err(malformed("unknown post-condition type")),
    }
}

fn parse_payload(cursor: &mut Cursor<'_>) -> Result<StacksPayload, PaymentError> {
    match cursor.u8()? {
        0x00 => {
            let recipient = parse_principal(cursor)?;
            let amount = cursor.u64()?;
            let _memo = cursor.take(34)?;
            Ok(StacksPayload::TokenTransfer { recipient, amount })
        }
        0x02 => {
            let address_version = cursor.u8()?;
            let address_hash = cursor.hash160()?;
            let contract_name = cursor.name()?;
            let function = cursor.name()?;
            let arg_count = cursor.u32()?;
            if arg_count > 64 {
                return Err(malformed("implausible argument count"));
            }
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                args.push(parse_clarity_value(cursor)?);
            }
            let contract = format!("{}.{}", c32_address(address_version, &address_hash), contract_name);
            Ok(StacksPayload::ContractCall {
                contract,
                function,
                args,
            })
        }
        _ => Err(malformed("unsupported payload type")),
    }
}

/// Serialized principal with its leading type tag.
fn parse_principal(cursor: &mut Cursor<'_>) -> Result<String, PaymentError> {
    match cursor.u8()? {
        0x05 => {
            let version = cursor.u8()?;
            let hash = cursor.hash160()?;
            Ok(c32_address(version, &hash))
        }
        0x06 => {
            let version = cursor.u8()?;
            let hash = cursor.hash160()?;
            let name = cursor.name()?;
            Ok(format!("{}.{}", c32_address(version, &hash), name))
        }
        _ => Err(malformed("unknown principal type")),
    }
}

/// Nesting cap for optional/response wrappers. Token-transfer arguments are
/// flat; anything deeper is hostile input.
const MAX_CLARITY_DEPTH: u8 = 8;

fn parse_clarity_value(cursor: &mut Cursor<'_>) -> Result<ClarityArg, PaymentError> {
    parse_clarity_value_at(cursor, 0)
}

fn parse_clarity_value_at(cursor: &mut Cursor<'_>, depth: u8) -> Result<ClarityArg, PaymentError> {
    if depth >= MAX_CLARITY_DEPTH {
        return Err(malformed("clarity value nested too deeply"));
    }
    match cursor.u8()? {
        0x00 => {
            let bytes = cursor.u128()?;
            Ok(ClarityArg::Int(bytes as i128))
        }
        0x01 => Ok(ClarityArg::Uint(cursor.u128()?)),
        0x02 => {
            let len = cursor.u32()? as usize;
            Ok(ClarityArg::Buffer(cursor.take(len)?.to_vec()))
        }
        0x03 => Ok(ClarityArg::Bool(true)),
        0x04 => Ok(ClarityArg::Bool(false)),
        0x05 => {
            let version = cursor.u8()?;
            let hash = cursor.hash160()?;
            Ok(ClarityArg::Principal(c32_address(version, &hash)))
        }
        0x06 => {
            let version = cursor.u8()?;
            let hash = cursor.hash160()?;
            let name = cursor.name()?;
            Ok(ClarityArg::Principal(format!(
                "{}.{}",
                c32_address(version, &hash),
                name
            )))
        }
        0x07 | 0x08 => {
            parse_clarity_value_at(cursor, depth + 1)?;
            Ok(ClarityArg::Other)
        }
        0x09 => Ok(ClarityArg::None),
        0x0a => Ok(ClarityArg::Some(Box::new(parse_clarity_value_at(
            cursor,
            depth + 1,
        )?))),
        0x0d | 0x0e => {
            let len = cursor.u32()? as usize;
            cursor.take(len)?;
            Ok(ClarityArg::Other)
        }
        _ => Err(malformed("unsupported clarity value")),
    }
}

// --- c32check addresses -------------------------------------------------

const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Render a Stacks address from its version byte and hash160, with the
/// standard double-sha256 checksum.
pub fn c32_address(version: u8, hash: &[u8; 20]) -> String {
    let mut checked = Vec::with_capacity(24);
    checked.extend_from_slice(hash);
    let digest = Sha256::digest(Sha256::digest(
        [&[version], hash.as_slice()].concat(),
    ));
    checked.extend_from_slice(&digest[..4]);

    let mut out = String::with_capacity(42);
    out.push('S');
    out.push(C32_ALPHABET[(version & 0x1f) as usize] as char);
    out.push_str(&c32_encode(&checked));
    out
}

fn c32_encode(input: &[u8]) -> String {
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 8 / 5 + 1);
    let mut carry: u16 = 0;
    let mut carry_bits: u8 = 0;
    for byte in input.iter().rev() {
        carry |= (*byte as u16) << carry_bits;
        carry_bits += 8;
        while carry_bits >= 5 {
            digits.push(C32_ALPHABET[(carry & 0x1f) as usize]);
            carry >>= 5;
            carry_bits -= 5;
        }
    }
    if carry_bits > 0 && carry != 0 {
        digits.push(C32_ALPHABET[(carry & 0x1f) as usize]);
    }
    while digits.last() == Some(&b'0') {
        digits.pop();
    }
    for byte in input {
        if *byte == 0 {
            digits.push(b'0');
        } else {
            break;
        }
    }
    digits.iter().rev().map(|b| *b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TokenAmount;

    fn serialize_token_transfer(
        version: u8,
        recipient_version: u8,
        recipient_hash: [u8; 20],
        amount: u64,
    ) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.push(version);
        raw.extend_from_slice(&1u32.to_be_bytes()); // chain id
        raw.push(0x04); // standard auth
        raw.push(0x00); // p2pkh
        raw.extend_from_slice(&[0x11; 20]); // sender hash160
        raw.extend_from_slice(&7u64.to_be_bytes()); // nonce
        raw.extend_from_slice(&180u64.to_be_bytes()); // fee
        raw.push(0x00); // key encoding
        raw.extend_from_slice(&[0xaa; 65]); // signature
        raw.push(0x03); // anchor mode: any
        raw.push(0x02); // post-condition mode: deny
        raw.extend_from_slice(&0u32.to_be_bytes()); // no post-conditions
        raw.push(0x00); // token transfer
        raw.push(0x05); // standard principal
        raw.push(recipient_version);
        raw.extend_from_slice(&recipient_hash);
        raw.extend_from_slice(&amount.to_be_bytes());
        raw.extend_from_slice(&[0u8; 34]); // memo
        raw
    }

    #[test]
    fn parses_token_transfer() {
        let recipient_hash = [0x42; 20];
        let raw = serialize_token_transfer(VERSION_MAINNET, 22, recipient_hash, 1_000_000);
        let tx = StacksTransaction::parse(&raw).unwrap();
        assert_eq!(tx.version, VERSION_MAINNET);
        assert_eq!(tx.nonce, 7);
        assert_eq!(tx.fee, 180);
        assert!(tx.sender.starts_with("SP"));
        match &tx.payload {
            StacksPayload::TokenTransfer { recipient, amount } => {
                assert_eq!(*amount, 1_000_000);
                assert_eq!(*recipient, c32_address(22, &recipient_hash));
            }
            other => panic!("expected token transfer, got {other:?}"),
        }
    }

    #[test]
    fn parses_contract_call_with_uint_and_principals() {
        let mut raw = Vec::new();
        raw.push(VERSION_TESTNET);
        raw.extend_from_slice(&0x80000000u32.to_be_bytes());
        raw.push(0x04);
        raw.push(0x00);
        raw.extend_from_slice(&[0x21; 20]);
        raw.extend_from_slice(&1u64.to_be_bytes());
        raw.extend_from_slice(&200u64.to_be_bytes());
        raw.push(0x00);
        raw.extend_from_slice(&[0xbb; 65]);
        raw.push(0x03);
        raw.push(0x02);
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.push(0x02); // contract call
        raw.push(26);
        raw.extend_from_slice(&[0x33; 20]);
        raw.push(5);
        raw.extend_from_slice(b"token");
        raw.push(8);
        raw.extend_from_slice(b"transfer");
        raw.extend_from_slice(&4u32.to_be_bytes());
        // amount
        raw.push(0x01);
        raw.extend_from_slice(&500u128.to_be_bytes());
        // sender principal
        raw.push(0x05);
        raw.push(26);
        raw.extend_from_slice(&[0x21; 20]);
        // recipient principal
        raw.push(0x05);
        raw.push(26);
        raw.extend_from_slice(&[0x55; 20]);
        // no memo
        raw.push(0x09);

        let tx = StacksTransaction::parse(&raw).unwrap();
        let (recipients, amount) = tx.payment_targets().unwrap();
        assert_eq!(amount, 500);
        assert!(recipients.contains(&c32_address(26, &[0x21; 20])));
        assert!(recipients.contains(&c32_address(26, &[0x55; 20])));
        match &tx.payload {
            StacksPayload::ContractCall { function, args, .. } => {
                assert_eq!(function, "transfer");
                assert_eq!(args.len(), 4);
                assert_eq!(args[3], ClarityArg::None);
            }
            other => panic!("expected contract call, got {other:?}"),
        }
    }

    #[test]
    fn truncated_transactions_rejected() {
        let raw = serialize_token_transfer(VERSION_MAINNET, 22, [0x42; 20], 1);
        for len in [0, 1, 5, 30, raw.len() - 1] {
            assert!(StacksTransaction::parse(&raw[..len]).is_err());
        }
    }

    #[test]
    fn wrong_network_version_rejected() {
        assert!(StacksTransaction::parse(&[0x55]).is_err());
    }

    #[test]
    fn rejects_deeply_nested_clarity_values() {
        // An attacker can wrap an optional in optionals indefinitely; the
        // parser must bail instead of recursing through all of them.
        let nested = vec![0x0a; 64];
        let mut cursor = Cursor::new(&nested);
        assert!(parse_clarity_value(&mut cursor).is_err());

        let mut shallow = vec![0x0a, 0x0a];
        shallow.push(0x01);
        shallow.extend_from_slice(&7u128.to_be_bytes());
        let mut cursor = Cursor::new(&shallow);
        assert!(parse_clarity_value(&mut cursor).is_ok());
    }

    #[test]
    fn asset_must_match_the_requirements() {
        let native = StacksPayload::TokenTransfer {
            recipient: "SP2RECIPIENT".to_string(),
            amount: 100,
        };
        assert!(check_asset(&native, "STX").is_ok());
        assert!(check_asset(&native, "").is_ok());
        assert!(matches!(
            check_asset(&native, "SP3TOKEN.usdc"),
            Err(PaymentError::AssetMismatch(_))
        ));

        let call = StacksPayload::ContractCall {
            contract: "SP3TOKEN.usdc".to_string(),
            function: "transfer".to_string(),
            args: Vec::new(),
        };
        assert!(check_asset(&call, "SP3TOKEN.usdc").is_ok());
        assert!(check_asset(&call, "SP3TOKEN.usdc::usdc").is_ok());
        assert!(matches!(
            check_asset(&call, "SP3OTHER.token"),
            Err(PaymentError::AssetMismatch(_))
        ));
        assert!(matches!(
            check_asset(&call, "STX"),
            Err(PaymentError::AssetMismatch(_))
        ));
    }

    #[test]
    fn c32_addresses_are_stable_and_distinct() {
        let a = c32_address(22, &[0x42; 20]);
        let b = c32_address(22, &[0x42; 20]);
        let c = c32_address(22, &[0x43; 20]);
        let t = c32_address(26, &[0x42; 20]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, t);
        assert!(a.starts_with("SP"));
        assert!(t.starts_with("ST"));
        assert!(a.chars().skip(1).all(|ch| C32_ALPHABET.contains(&(ch as u8))));
    }

    #[test]
    fn c32_encodes_the_burn_address() {
        // The all-zero hash160 under mainnet single-sig version 22 is the
        // well-known Stacks burn address.
        assert_eq!(c32_address(22, &[0u8; 20]), "SP000000000000000000002Q6VF78");
    }

    #[test]
    fn rate_limit_waits_grow_without_retry_after() {
        let chain = StacksChain::new(
            ChainId::new("stacks", "1"),
            Url::parse("https://api.example.test/").unwrap(),
        );
        let throttled = AtomicU32::new(0);

        // An explicit Retry-After always wins.
        let told = chain.retry_wait(Some(Duration::from_secs(3)), &throttled);
        assert_eq!(told, Duration::from_secs(3));

        // Without the header, consecutive 429s back off further each time,
        // capped at a minute.
        let first = chain.retry_wait(None, &throttled);
        let second = chain.retry_wait(None, &throttled);
        let third = chain.retry_wait(None, &throttled);
        assert!(first < second);
        assert!(second < third);
        assert!(third <= Duration::from_secs(60));

        // A successful probe resets the streak.
        throttled.store(0, Ordering::Relaxed);
        let fresh = chain.retry_wait(None, &throttled);
        assert!(fresh <= DEFAULT_RETRY_AFTER);
    }

    fn confirmed_transfer(recipient: &str, amount: &str) -> ConfirmedTx {
        ConfirmedTx {
            tx_status: "success".to_string(),
            token_transfer: Some(TokenTransferView {
                recipient_address: recipient.to_string(),
                amount: amount.to_string(),
            }),
            contract_call: None,
        }
    }

    fn confirmed_call(contract_id: &str, args: &[&str]) -> ConfirmedTx {
        ConfirmedTx {
            tx_status: "success".to_string(),
            token_transfer: None,
            contract_call: Some(ContractCallView {
                contract_id: contract_id.to_string(),
                function_args: args
                    .iter()
                    .map(|repr| FunctionArgView {
                        repr: repr.to_string(),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn post_settlement_check_catches_recipient_swap() {
        let expected = TokenAmount::from(1_000u64);
        let ok = confirmed_transfer("SP2EXPECTED", "1000");
        assert!(check_confirmed(&ok, "STX", "SP2EXPECTED", &expected, AmountKind::Ceiling).is_ok());

        let swapped = confirmed_transfer("SP2SOMEONEELSE", "1000");
        let result = check_confirmed(&swapped, "STX", "SP2EXPECTED", &expected, AmountKind::Ceiling);
        assert!(matches!(
            result,
            Err(PaymentError::PostSettlementVerification(_))
        ));
    }

    #[test]
    fn post_settlement_check_enforces_amount() {
        let expected = TokenAmount::from(1_000u64);
        let short = confirmed_transfer("SP2EXPECTED", "999");
        assert!(
            check_confirmed(&short, "STX", "SP2EXPECTED", &expected, AmountKind::Ceiling).is_err()
        );
        let over = confirmed_transfer("SP2EXPECTED", "1500");
        assert!(
            check_confirmed(&over, "STX", "SP2EXPECTED", &expected, AmountKind::Ceiling).is_ok()
        );
        assert!(
            check_confirmed(&over, "STX", "SP2EXPECTED", &expected, AmountKind::Exact).is_err()
        );
    }

    #[test]
    fn post_settlement_check_reads_contract_calls() {
        let expected = TokenAmount::from(500u64);
        let tx = confirmed_call("SP3TOKEN.usdc", &["u500", "'SP2RECIPIENT"]);
        assert!(
            check_confirmed(&tx, "SP3TOKEN.usdc", "SP2RECIPIENT", &expected, AmountKind::Exact)
                .is_ok()
        );
        assert!(
            check_confirmed(&tx, "SP3TOKEN.usdc", "SP2OTHER", &expected, AmountKind::Exact)
                .is_err()
        );
    }

    #[test]
    fn post_settlement_check_enforces_asset_identity() {
        let expected = TokenAmount::from(500u64);

        // A call to a different token contract must not satisfy the
        // requirement, even with matching amount and recipient.
        let wrong_token = confirmed_call("SP3OTHER.shadytoken", &["u500", "'SP2RECIPIENT"]);
        let result = check_confirmed(
            &wrong_token,
            "SP3TOKEN.usdc",
            "SP2RECIPIENT",
            &expected,
            AmountKind::Exact,
        );
        assert!(matches!(
            result,
            Err(PaymentError::PostSettlementVerification(_))
        ));

        // A contract call cannot satisfy a native STX requirement and a
        // native transfer cannot satisfy a token requirement.
        let call = confirmed_call("SP3TOKEN.usdc", &["u500", "'SP2RECIPIENT"]);
        assert!(check_confirmed(&call, "STX", "SP2RECIPIENT", &expected, AmountKind::Exact).is_err());
        let native = confirmed_transfer("SP2RECIPIENT", "500");
        assert!(
            check_confirmed(&native, "SP3TOKEN.usdc", "SP2RECIPIENT", &expected, AmountKind::Exact)
                .is_err()
        );
    }
}
