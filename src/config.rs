//! Facilitator configuration.
//!
//! Loaded once at startup from a JSON file and injected into the engine
//! and adapters; nothing below the entrypoint reads the environment.
//! String values of the form `"$VAR"` resolve from the environment at
//! load time, so key material stays out of the config file.
//!
//! ```json
//! {
//!   "port": 8080,
//!   "chains": {
//!     "eip155:8453": { "rpc": "https://mainnet.base.org", "signer": "$EVM_PRIVATE_KEY" },
//!     "solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp": { "rpc": "https://api.mainnet-beta.solana.com", "signer": "$SOLANA_KEYPAIR" },
//!     "stacks:1": { "api": "https://api.hiro.so/" }
//!   },
//!   "webhooks": [{ "url": "https://example.com/hooks", "secret": "$WEBHOOK_SECRET" }]
//! }
//! ```

use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

use crate::chain::AdapterSet;
use crate::chain::evm::{EvmAdapter, EvmChain};
use crate::chain::solana::{SolanaAdapter, SolanaChain};
use crate::chain::stacks::{StacksAdapter, StacksChain};
use crate::network::{ChainFamily, ChainId};
use crate::webhook::WebhookTarget;

#[derive(Debug, Parser)]
#[command(version, about = "x402 payment facilitator")]
pub struct CliArgs {
    /// Path to the JSON configuration file.
    #[arg(long, env = "CONFIG", default_value = "facilitator.json")]
    pub config: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("invalid chain id {0}")]
    InvalidChainId(String),
    #[error("chain {0}: {1}")]
    Chain(ChainId, String),
}

/// A literal string, or `"$VAR"` resolved from the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct LiteralOrEnv(String);

impl LiteralOrEnv {
    pub fn resolve(&self) -> Result<String, ConfigError> {
        match self.0.strip_prefix('$') {
            Some(var) => {
                std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.to_string()))
            }
            None => Ok(self.0.clone()),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_facilitator_id() -> String {
    "x402-facilitator".to_string()
}

fn default_eip1559() -> bool {
    true
}

/// One chain entry, keyed by CAIP-2 id in [`FacilitatorConfig::chains`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainConfig {
    /// JSON-RPC endpoint (EVM, Solana).
    pub rpc: Option<LiteralOrEnv>,
    /// Indexer API base (Stacks).
    pub api: Option<LiteralOrEnv>,
    /// Signing key: hex private key (EVM), base58 keypair (Solana).
    pub signer: Option<LiteralOrEnv>,
    #[serde(default = "default_eip1559")]
    pub eip1559: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: LiteralOrEnv,
    pub secret: LiteralOrEnv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyConfig {
    pub key: LiteralOrEnv,
    pub server_id: String,
    pub resource_owner: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundWalletConfig {
    pub resource_owner: String,
    pub network: String,
    pub address: String,
    pub secret: LiteralOrEnv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_facilitator_id")]
    pub facilitator_id: String,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// Refund wallets for claim payouts, one per resource owner and
    /// network.
    #[serde(default)]
    pub refund_wallets: Vec<RefundWalletConfig>,
}

impl FacilitatorConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: FacilitatorConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn webhook_targets(&self) -> Result<Vec<WebhookTarget>, ConfigError> {
        self.webhooks
            .iter()
            .map(|w| {
                Ok(WebhookTarget {
                    url: w.url.resolve()?,
                    secret: w.secret.resolve()?,
                })
            })
            .collect()
    }

    /// Construct one adapter per chain family that has at least one
    /// configured chain.
    pub fn build_adapters(&self) -> Result<AdapterSet, ConfigError> {
        let mut evm_chains = Vec::new();
        let mut solana_chains = Vec::new();
        let mut stacks_chains = Vec::new();

        for (key, chain_config) in &self.chains {
            let chain_id: ChainId = key
                .parse()
                .map_err(|_| ConfigError::InvalidChainId(key.clone()))?;
            let family = chain_id
                .family()
                .ok_or_else(|| ConfigError::InvalidChainId(key.clone()))?;
            match family {
                ChainFamily::Evm => {
                    let rpc = required(&chain_id, "rpc", chain_config.rpc.as_ref())?;
                    let rpc: Url = rpc
                        .parse()
                        .map_err(|_| ConfigError::Chain(chain_id.clone(), "invalid rpc url".to_string()))?;
                    let signer = required(&chain_id, "signer", chain_config.signer.as_ref())?;
                    let chain = EvmChain::new(&chain_id, rpc, &signer, chain_config.eip1559)
                        .map_err(|e| ConfigError::Chain(chain_id.clone(), e.to_string()))?;
                    evm_chains.push(chain);
                }
                ChainFamily::Solana => {
                    let rpc = required(&chain_id, "rpc", chain_config.rpc.as_ref())?;
                    let signer = required(&chain_id, "signer", chain_config.signer.as_ref())?;
                    let chain = SolanaChain::new(chain_id.clone(), rpc, &signer)
                        .map_err(|e| ConfigError::Chain(chain_id.clone(), e.to_string()))?;
                    solana_chains.push(chain);
                }
                ChainFamily::Stacks => {
                    let api = required(&chain_id, "api", chain_config.api.as_ref())?;
                    let api: Url = api
                        .parse()
                        .map_err(|_| ConfigError::Chain(chain_id.clone(), "invalid api url".to_string()))?;
                    stacks_chains.push(StacksChain::new(chain_id.clone(), api));
                }
            }
        }

        Ok(AdapterSet {
            evm: (!evm_chains.is_empty())
                .then(|| std::sync::Arc::new(EvmAdapter::new(evm_chains)) as _),
            solana: (!solana_chains.is_empty())
                .then(|| std::sync::Arc::new(SolanaAdapter::new(solana_chains)) as _),
            stacks: (!stacks_chains.is_empty())
                .then(|| std::sync::Arc::new(StacksAdapter::new(stacks_chains)) as _),
        })
    }
}

fn required(
    chain_id: &ChainId,
    field: &str,
    value: Option<&LiteralOrEnv>,
) -> Result<String, ConfigError> {
    value
        .ok_or_else(|| ConfigError::Chain(chain_id.clone(), format!("missing {field}")))?
        .resolve()
}
