//! Failed-payment claims: reporting, review, and refund payouts.
//!
//! A resource server that charged a user for a settlement that later proved
//! broken reports a claim against the original transaction hash. Claims move
//! through a small state machine:
//!
//! ```text
//! pending -> approved -> paid
//!         -> rejected
//! pending, approved -> expired   (30 days without resolution)
//! ```
//!
//! A claim is only `paid` once the refund transaction is confirmed on
//! chain; a payout attempt that fails leaves the claim `approved` so it can
//! be retried.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::{AdapterSet, Payout};
use crate::network::NetworkRegistry;
use crate::types::TokenAmount;
use crate::webhook::{WebhookDispatcher, WebhookEvent};

/// Claims expire after this long without review.
pub const CLAIM_TTL_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Approved,
    Paid,
    Rejected,
    Expired,
}

impl std::fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Approved => "approved",
            ClaimStatus::Paid => "paid",
            ClaimStatus::Rejected => "rejected",
            ClaimStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub id: Uuid,
    pub server_id: String,
    pub resource_owner_id: String,
    pub original_tx_hash: String,
    pub user_wallet: String,
    pub amount: TokenAmount,
    pub asset: String,
    pub network: String,
    pub reason: String,
    pub status: ClaimStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payout_tx_hash: Option<String>,
    pub reported_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// Body of `POST /claims/report`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportClaimRequest {
    pub original_tx_hash: String,
    pub user_wallet: String,
    pub amount: TokenAmount,
    pub asset: String,
    pub network: String,
    pub reason: String,
}

/// What an API key authenticates: the reporting server and the resource
/// owner whose refund wallets back its claims.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub server_id: String,
    pub resource_owner_id: String,
}

/// Decrypted key material for one resource owner's refund wallet on one
/// network.
#[derive(Debug, Clone)]
pub struct RefundWallet {
    pub address: String,
    pub secret: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error("unknown api key")]
    Unauthorized,
    #[error("a claim for this transaction already exists")]
    DuplicateClaim,
    #[error("claim not found")]
    NotFound,
    #[error("claim is {from}, cannot move to {to}")]
    InvalidTransition { from: ClaimStatus, to: ClaimStatus },
    #[error("a payout for this claim is already in progress")]
    PayoutInFlight,
    #[error("no refund wallet configured for {0}")]
    NoRefundWallet(String),
    #[error("unsupported network: {0}")]
    UnsupportedNetwork(String),
    #[error("payout failed: {0}")]
    PayoutFailed(String),
    #[error("store error: {0}")]
    Store(String),
}

/// Persistence behind the claims service. The in-memory implementation
/// below is the default; a database-backed store slots in here.
#[async_trait]
pub trait ClaimsStore: Send + Sync {
    /// Resolve credentials from the sha256 hex digest of an API key.
    async fn credentials_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiCredentials>, ClaimError>;

    /// Insert a new claim. Fails with [`ClaimError::DuplicateClaim`] when a
    /// claim for the same original transaction hash exists, atomically.
    async fn insert_claim(&self, claim: Claim) -> Result<(), ClaimError>;

    async fn claim(&self, id: Uuid) -> Result<Option<Claim>, ClaimError>;

    /// Compare-and-set status transition. Fails with
    /// [`ClaimError::InvalidTransition`] if the claim is not in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: ClaimStatus,
        to: ClaimStatus,
    ) -> Result<Claim, ClaimError>;

    /// Record a confirmed payout and mark the claim paid. Only valid from
    /// `approved`.
    async fn mark_paid(&self, id: Uuid, payout_tx_hash: String) -> Result<Claim, ClaimError>;

    /// Pending and approved claims whose `expires_at` is behind `now`.
    async fn overdue_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, ClaimError>;

    /// Refund wallet for a resource owner on a network, with decrypted key
    /// material.
    async fn refund_wallet(
        &self,
        resource_owner: &str,
        network: &str,
    ) -> Result<Option<RefundWallet>, ClaimError>;
}

#[derive(Default)]
struct InMemoryState {
    claims: HashMap<Uuid, Claim>,
    by_tx_hash: HashMap<String, Uuid>,
    api_keys: HashMap<String, ApiCredentials>,
    refund_wallets: HashMap<(String, String), RefundWallet>,
}

/// Mutex-backed store; the single lock keeps the transaction-hash
/// uniqueness check and the insert atomic.
#[derive(Default)]
pub struct InMemoryClaimsStore {
    state: Mutex<InMemoryState>,
}

impl InMemoryClaimsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_api_key(
        &self,
        api_key: &str,
        server_id: impl Into<String>,
        resource_owner: impl Into<String>,
    ) {
        let mut state = self.state.lock().await;
        state.api_keys.insert(
            hash_api_key(api_key),
            ApiCredentials {
                server_id: server_id.into(),
                resource_owner_id: resource_owner.into(),
            },
        );
    }

    pub async fn add_refund_wallet(
        &self,
        resource_owner: impl Into<String>,
        network: impl Into<String>,
        wallet: RefundWallet,
    ) {
        let mut state = self.state.lock().await;
        state
            .refund_wallets
            .insert((resource_owner.into(), network.into()), wallet);
    }
}

#[async_trait]
impl ClaimsStore for InMemoryClaimsStore {
    async fn credentials_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<ApiCredentials>, ClaimError> {
        let state = self.state.lock().await;
        Ok(state.api_keys.get(key_hash).cloned())
    }

    async fn insert_claim(&self, claim: Claim) -> Result<(), ClaimError> {
        let mut state = self.state.lock().await;
        if state.by_tx_hash.contains_key(&claim.original_tx_hash) {
            return Err(ClaimError::DuplicateClaim);
        }
        state
            .by_tx_hash
            .insert(claim.original_tx_hash.clone(), claim.id);
        state.claims.insert(claim.id, claim);
        Ok(())
    }

    async fn claim(&self, id: Uuid) -> Result<Option<Claim>, ClaimError> {
        let state = self.state.lock().await;
        Ok(state.claims.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: Uuid,
        from: ClaimStatus,
        to: ClaimStatus,
    ) -> Result<Claim, ClaimError> {
        let mut state = self.state.lock().await;
        let claim = state.claims.get_mut(&id).ok_or(ClaimError::NotFound)?;
        if claim.status != from {
            return Err(ClaimError::InvalidTransition {
                from: claim.status,
                to,
            });
        }
        claim.status = to;
        Ok(claim.clone())
    }

    async fn mark_paid(&self, id: Uuid, payout_tx_hash: String) -> Result<Claim, ClaimError> {
        let mut state = self.state.lock().await;
        let claim = state.claims.get_mut(&id).ok_or(ClaimError::NotFound)?;
        if claim.status != ClaimStatus::Approved {
            return Err(ClaimError::InvalidTransition {
                from: claim.status,
                to: ClaimStatus::Paid,
            });
        }
        claim.status = ClaimStatus::Paid;
        claim.payout_tx_hash = Some(payout_tx_hash);
        claim.paid_at = Some(Utc::now());
        Ok(claim.clone())
    }

    async fn overdue_claims(&self, now: DateTime<Utc>) -> Result<Vec<Claim>, ClaimError> {
        let state = self.state.lock().await;
        Ok(state
            .claims
            .values()
            .filter(|claim| {
                matches!(claim.status, ClaimStatus::Pending | ClaimStatus::Approved)
                    && claim.expires_at <= now
            })
            .cloned()
            .collect())
    }

    async fn refund_wallet(
        &self,
        resource_owner: &str,
        network: &str,
    ) -> Result<Option<RefundWallet>, ClaimError> {
        let state = self.state.lock().await;
        Ok(state
            .refund_wallets
            .get(&(resource_owner.to_string(), network.to_string()))
            .cloned())
    }
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// Drives the claim state machine over a store and the settlement adapters.
pub struct ClaimsService<S> {
    store: Arc<S>,
    adapters: Arc<AdapterSet>,
    webhooks: WebhookDispatcher,
    facilitator_id: String,
    /// Claims with a payout currently executing. The store transition to
    /// `paid` happens only after chain confirmation, so this set is what
    /// keeps a second payout from racing the first.
    payouts_in_flight: Mutex<HashSet<Uuid>>,
}

impl<S: ClaimsStore> ClaimsService<S> {
    pub fn new(
        store: Arc<S>,
        adapters: Arc<AdapterSet>,
        webhooks: WebhookDispatcher,
        facilitator_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            adapters,
            webhooks,
            facilitator_id: facilitator_id.into(),
            payouts_in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Create a pending claim on behalf of an authenticated resource
    /// server.
    #[instrument(skip_all, err, fields(tx_hash = %request.original_tx_hash))]
    pub async fn report_failure(
        &self,
        api_key: &str,
        request: ReportClaimRequest,
    ) -> Result<Claim, ClaimError> {
        let credentials = self
            .store
            .credentials_by_key_hash(&hash_api_key(api_key))
            .await?
            .ok_or(ClaimError::Unauthorized)?;
        NetworkRegistry::resolve(&request.network)
            .ok_or_else(|| ClaimError::UnsupportedNetwork(request.network.clone()))?;
        let now = Utc::now();
        let claim = Claim {
            id: Uuid::new_v4(),
            server_id: credentials.server_id,
            resource_owner_id: credentials.resource_owner_id,
            original_tx_hash: request.original_tx_hash,
            user_wallet: request.user_wallet,
            amount: request.amount,
            asset: request.asset,
            network: request.network,
            reason: request.reason,
            status: ClaimStatus::Pending,
            payout_tx_hash: None,
            reported_at: now,
            paid_at: None,
            expires_at: now + Duration::days(CLAIM_TTL_DAYS),
        };
        self.store.insert_claim(claim.clone()).await?;
        tracing::info!(claim = %claim.id, network = %claim.network, "claim reported");
        Ok(claim)
    }

    pub async fn approve(&self, id: Uuid) -> Result<Claim, ClaimError> {
        self.store
            .transition(id, ClaimStatus::Pending, ClaimStatus::Approved)
            .await
    }

    pub async fn reject(&self, id: Uuid) -> Result<Claim, ClaimError> {
        self.store
            .transition(id, ClaimStatus::Pending, ClaimStatus::Rejected)
            .await
    }

    /// Pay out an approved claim from the resource owner's refund wallet.
    ///
    /// The claim moves to `paid` only after the refund transaction is
    /// confirmed. Any failure leaves it `approved` for a retry. At most one
    /// payout per claim runs at a time; concurrent attempts are refused.
    #[instrument(skip_all, err, fields(claim = %id))]
    pub async fn execute_payout(&self, id: Uuid) -> Result<Claim, ClaimError> {
        {
            let mut in_flight = self.payouts_in_flight.lock().await;
            if !in_flight.insert(id) {
                return Err(ClaimError::PayoutInFlight);
            }
        }
        let result = self.execute_payout_inner(id).await;
        self.payouts_in_flight.lock().await.remove(&id);
        result
    }

    async fn execute_payout_inner(&self, id: Uuid) -> Result<Claim, ClaimError> {
        let claim = self.store.claim(id).await?.ok_or(ClaimError::NotFound)?;
        if claim.status != ClaimStatus::Approved {
            return Err(ClaimError::InvalidTransition {
                from: claim.status,
                to: ClaimStatus::Paid,
            });
        }
        let network = NetworkRegistry::resolve(&claim.network)
            .ok_or_else(|| ClaimError::UnsupportedNetwork(claim.network.clone()))?;
        let adapter = self
            .adapters
            .for_family(network.family)
            .ok_or_else(|| ClaimError::UnsupportedNetwork(claim.network.clone()))?;
        let wallet = self
            .store
            .refund_wallet(&claim.resource_owner_id, &claim.network)
            .await?
            .ok_or_else(|| {
                ClaimError::NoRefundWallet(format!(
                    "{} on {}",
                    claim.resource_owner_id, claim.network
                ))
            })?;

        let payout = Payout {
            asset: claim.asset.clone(),
            to: claim.user_wallet.clone(),
            amount: claim.amount,
        };
        let response = adapter
            .pay_out(&wallet.secret, &payout, &network)
            .await
            .map_err(|e| ClaimError::PayoutFailed(e.to_string()))?;
        if !response.success {
            return Err(ClaimError::PayoutFailed(
                response
                    .error_detail
                    .unwrap_or_else(|| "payout not confirmed".to_string()),
            ));
        }
        let tx_hash = response
            .transaction
            .ok_or_else(|| ClaimError::PayoutFailed("payout returned no transaction".to_string()))?;

        let paid = self.store.mark_paid(id, tx_hash).await?;
        tracing::info!(claim = %paid.id, tx = ?paid.payout_tx_hash, "claim paid");
        if let Ok(body) = serde_json::to_value(&paid) {
            self.webhooks
                .dispatch(WebhookEvent::claim_paid(&self.facilitator_id, body));
        }
        Ok(paid)
    }

    /// Expire pending and approved claims past their deadline. Safe to run
    /// repeatedly; a claim that already moved on is skipped by the store's
    /// compare-and-set.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize, ClaimError> {
        let overdue = self.store.overdue_claims(now).await?;
        let mut expired = 0;
        for claim in overdue {
            match self
                .store
                .transition(claim.id, claim.status, ClaimStatus::Expired)
                .await
            {
                Ok(_) => expired += 1,
                Err(ClaimError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if expired > 0 {
            tracing::info!(expired, "expired overdue claims");
        }
        Ok(expired)
    }
}
