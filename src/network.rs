//! Network identity: CAIP-2 chain identifiers, chain families, and the
//! registry of well-known networks.
//!
//! The x402 wire formats accept network identifiers in two shapes: a
//! human-readable name ("base", "solana-devnet", "stacks-testnet") or a
//! CAIP-2 identifier ("eip155:8453", "solana:<genesisHash>", "stacks:1").
//! Everything downstream of the registry works with a [`ResolvedNetwork`],
//! so adapters never see raw strings.

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

pub const EIP155_NAMESPACE: &str = "eip155";
pub const SOLANA_NAMESPACE: &str = "solana";
pub const STACKS_NAMESPACE: &str = "stacks";

/// Closed set of chain families the facilitator can settle on.
///
/// Dispatch to a settlement adapter happens on this enum, resolved once by
/// the registry, never on string prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Evm,
    Solana,
    Stacks,
}

impl ChainFamily {
    /// CAIP-2 namespace this family owns.
    pub fn namespace(&self) -> &'static str {
        match self {
            ChainFamily::Evm => EIP155_NAMESPACE,
            ChainFamily::Solana => SOLANA_NAMESPACE,
            ChainFamily::Stacks => STACKS_NAMESPACE,
        }
    }

    pub fn from_namespace(namespace: &str) -> Option<ChainFamily> {
        match namespace {
            EIP155_NAMESPACE => Some(ChainFamily::Evm),
            SOLANA_NAMESPACE => Some(ChainFamily::Solana),
            STACKS_NAMESPACE => Some(ChainFamily::Stacks),
            _ => None,
        }
    }
}

impl Display for ChainFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChainFamily::Evm => "evm",
            ChainFamily::Solana => "solana",
            ChainFamily::Stacks => "stacks",
        })
    }
}

/// A CAIP-2 chain identifier: `namespace:reference`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainId {
    pub namespace: String,
    pub reference: String,
}

impl ChainId {
    pub fn new(namespace: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    pub fn family(&self) -> Option<ChainFamily> {
        ChainFamily::from_namespace(&self.namespace)
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid CAIP-2 chain id: {0}")]
pub struct ChainIdParseError(String);

impl FromStr for ChainId {
    type Err = ChainIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ChainIdParseError(s.to_string()))?;
        if namespace.is_empty() || reference.is_empty() {
            return Err(ChainIdParseError(s.to_string()));
        }
        Ok(ChainId::new(namespace, reference))
    }
}

impl Serialize for ChainId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A well-known network entry: human name plus CAIP-2 coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub name: &'static str,
    pub namespace: &'static str,
    pub reference: &'static str,
    pub testnet: bool,
}

impl NetworkInfo {
    pub fn chain_id(&self) -> ChainId {
        ChainId::new(self.namespace, self.reference)
    }
}

static KNOWN_NETWORKS: &[NetworkInfo] = &[
    // EVM
    NetworkInfo {
        name: "base",
        namespace: EIP155_NAMESPACE,
        reference: "8453",
        testnet: false,
    },
    NetworkInfo {
        name: "base-sepolia",
        namespace: EIP155_NAMESPACE,
        reference: "84532",
        testnet: true,
    },
    NetworkInfo {
        name: "polygon",
        namespace: EIP155_NAMESPACE,
        reference: "137",
        testnet: false,
    },
    NetworkInfo {
        name: "polygon-amoy",
        namespace: EIP155_NAMESPACE,
        reference: "80002",
        testnet: true,
    },
    NetworkInfo {
        name: "avalanche",
        namespace: EIP155_NAMESPACE,
        reference: "43114",
        testnet: false,
    },
    NetworkInfo {
        name: "avalanche-fuji",
        namespace: EIP155_NAMESPACE,
        reference: "43113",
        testnet: true,
    },
    // Solana
    NetworkInfo {
        name: "solana",
        namespace: SOLANA_NAMESPACE,
        reference: "5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp",
        testnet: false,
    },
    NetworkInfo {
        name: "solana-devnet",
        namespace: SOLANA_NAMESPACE,
        reference: "EtWTRABZaYq6iMfeYKouRu166VU2xqa1",
        testnet: true,
    },
    // Stacks
    NetworkInfo {
        name: "stacks",
        namespace: STACKS_NAMESPACE,
        reference: "1",
        testnet: false,
    },
    NetworkInfo {
        name: "stacks-testnet",
        namespace: STACKS_NAMESPACE,
        reference: "2147483648",
        testnet: true,
    },
];

/// Alternate spellings accepted on the wire. "solana-mainnet" and "solana"
/// must behave identically.
static ALIASES: &[(&str, &str)] = &[
    ("base-mainnet", "base"),
    ("polygon-mainnet", "polygon"),
    ("avalanche-mainnet", "avalanche"),
    ("solana-mainnet", "solana"),
    ("stacks-mainnet", "stacks"),
];

static BY_NAME: Lazy<HashMap<&'static str, &'static NetworkInfo>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static NetworkInfo> = KNOWN_NETWORKS
        .iter()
        .map(|info| (info.name, info))
        .collect();
    for (alias, canonical) in ALIASES {
        let info = map
            .get(canonical)
            .copied()
            .expect("alias target present in KNOWN_NETWORKS");
        map.insert(alias, info);
    }
    map
});

static BY_CHAIN_ID: Lazy<HashMap<ChainId, &'static NetworkInfo>> = Lazy::new(|| {
    KNOWN_NETWORKS
        .iter()
        .map(|info| (info.chain_id(), info))
        .collect()
});

/// A network identifier after registry resolution.
///
/// Carries the CAIP-2 id, the chain family, and the canonical human name
/// when one is known. Unknown-but-well-formed CAIP-2 ids in a supported
/// namespace still resolve; the adapter decides whether it is configured
/// for them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedNetwork {
    pub chain_id: ChainId,
    pub family: ChainFamily,
    pub name: Option<&'static str>,
    pub testnet: bool,
}

impl ResolvedNetwork {
    /// The wire representation: canonical name if known, CAIP-2 otherwise.
    pub fn wire_name(&self) -> String {
        match self.name {
            Some(name) => name.to_string(),
            None => self.chain_id.to_string(),
        }
    }
}

impl Display for ResolvedNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_name())
    }
}

/// Static bidirectional mapping between network names, CAIP-2 ids and chain
/// families.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkRegistry;

impl NetworkRegistry {
    /// Resolve any accepted network identifier format.
    ///
    /// Returns `None` for unknown names and unsupported namespaces; callers
    /// turn that into an "unsupported network" result, never a panic.
    pub fn resolve(input: &str) -> Option<ResolvedNetwork> {
        let trimmed = input.trim();
        if let Some(info) = BY_NAME.get(trimmed) {
            return Some(ResolvedNetwork {
                chain_id: info.chain_id(),
                family: ChainFamily::from_namespace(info.namespace)?,
                name: Some(info.name),
                testnet: info.testnet,
            });
        }
        let chain_id: ChainId = trimmed.parse().ok()?;
        let family = chain_id.family()?;
        let known = BY_CHAIN_ID.get(&chain_id);
        Some(ResolvedNetwork {
            family,
            name: known.map(|info| info.name),
            testnet: known.map(|info| info.testnet).unwrap_or(false),
            chain_id,
        })
    }

    /// Shorthand when only the family matters.
    pub fn resolve_chain_family(input: &str) -> Option<ChainFamily> {
        Self::resolve(input).map(|resolved| resolved.family)
    }

    /// All well-known networks, for the `/supported` listing.
    pub fn known_networks() -> &'static [NetworkInfo] {
        KNOWN_NETWORKS
    }

    pub fn by_chain_id(chain_id: &ChainId) -> Option<&'static NetworkInfo> {
        BY_CHAIN_ID.get(chain_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_human_names() {
        let base = NetworkRegistry::resolve("base").unwrap();
        assert_eq!(base.family, ChainFamily::Evm);
        assert_eq!(base.chain_id, ChainId::new("eip155", "8453"));
        assert!(!base.testnet);

        let stacks = NetworkRegistry::resolve("stacks-testnet").unwrap();
        assert_eq!(stacks.family, ChainFamily::Stacks);
        assert!(stacks.testnet);
    }

    #[test]
    fn resolves_caip2() {
        let solana = NetworkRegistry::resolve("solana:5eykt4UsFv8P8NJdTREpY1vzqKqZKvdp").unwrap();
        assert_eq!(solana.family, ChainFamily::Solana);
        assert_eq!(solana.name, Some("solana"));

        let base = NetworkRegistry::resolve("eip155:8453").unwrap();
        assert_eq!(base.name, Some("base"));
        assert_eq!(base.wire_name(), "base");
    }

    #[test]
    fn aliases_resolve_identically() {
        let canonical = NetworkRegistry::resolve("solana").unwrap();
        let alias = NetworkRegistry::resolve("solana-mainnet").unwrap();
        assert_eq!(canonical, alias);
    }

    #[test]
    fn unknown_caip2_in_supported_namespace_still_resolves() {
        let resolved = NetworkRegistry::resolve("eip155:999999").unwrap();
        assert_eq!(resolved.family, ChainFamily::Evm);
        assert_eq!(resolved.name, None);
        assert_eq!(resolved.wire_name(), "eip155:999999");
    }

    #[test]
    fn unsupported_inputs_resolve_to_none() {
        assert!(NetworkRegistry::resolve("near").is_none());
        assert!(NetworkRegistry::resolve("cosmos:cosmoshub-4").is_none());
        assert!(NetworkRegistry::resolve("").is_none());
    }

    #[test]
    fn family_mismatch_is_visible() {
        let solana = NetworkRegistry::resolve_chain_family("solana").unwrap();
        let base = NetworkRegistry::resolve_chain_family("base").unwrap();
        assert_ne!(solana, base);
    }
}
