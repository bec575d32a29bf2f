//! The facilitator engine: payload normalization, network resolution, and
//! dispatch to the settlement adapters.
//!
//! Malformed requests are the only errors that escape here; every domain
//! failure becomes a structured `VerifyResponse`/`SettleResponse` so the
//! HTTP layer never turns a bad payment into a 500.

use std::sync::Arc;
use tracing::instrument;

use crate::chain::{AdapterSet, SettlementContext};
use crate::facilitator::{Facilitator, FacilitatorError};
use crate::network::{NetworkRegistry, ResolvedNetwork};
use crate::types::{
    ErrorReason, PaymentPayload, SettleRequest, SettleResponse, SupportedPaymentKind,
    SupportedResponse, VerifyRequest, VerifyResponse,
};
use crate::webhook::{WebhookDispatcher, WebhookEvent};

pub struct FacilitatorEngine {
    adapters: Arc<AdapterSet>,
    webhooks: WebhookDispatcher,
    facilitator_id: String,
}

impl FacilitatorEngine {
    pub fn new(
        adapters: Arc<AdapterSet>,
        webhooks: WebhookDispatcher,
        facilitator_id: impl Into<String>,
    ) -> Self {
        Self {
            adapters,
            webhooks,
            facilitator_id: facilitator_id.into(),
        }
    }

    /// Decode the payload and resolve both network identifiers. A malformed
    /// payload is a request error; everything else maps to a structured
    /// invalid result via `Err(reason)`.
    fn prepare(
        &self,
        request: VerifyRequest,
    ) -> Result<Result<SettlementContext, (ErrorReason, String)>, FacilitatorError> {
        let required_name = request.payment_requirements.network.clone();
        let payload: PaymentPayload = request
            .payment_payload
            .decode()
            .map_err(|e| FacilitatorError::MalformedPayload(e.to_string()))?;

        let Some(required_network) = NetworkRegistry::resolve(&required_name) else {
            return Ok(Err((ErrorReason::UnsupportedNetwork, required_name)));
        };
        let required_name = required_network.wire_name();
        let Some(payload_network) = NetworkRegistry::resolve(&payload.network) else {
            return Ok(Err((ErrorReason::UnsupportedNetwork, required_name)));
        };
        if payload_network != required_network {
            return Ok(Err((ErrorReason::NetworkMismatch, required_name)));
        }
        Ok(Ok(SettlementContext {
            payload,
            requirements: request.payment_requirements,
            network: required_network,
        }))
    }

    fn adapter_for(
        &self,
        network: &ResolvedNetwork,
    ) -> Result<&Arc<dyn crate::chain::SettlementAdapter>, ErrorReason> {
        self.adapters
            .for_family(network.family)
            .ok_or(ErrorReason::NotConfigured)
    }
}

impl Facilitator for FacilitatorEngine {
    #[instrument(skip_all, err)]
    async fn verify(&self, request: VerifyRequest) -> Result<VerifyResponse, FacilitatorError> {
        let ctx = match self.prepare(request)? {
            Ok(ctx) => ctx,
            Err((reason, _)) => return Ok(VerifyResponse::invalid(reason)),
        };
        let adapter = match self.adapter_for(&ctx.network) {
            Ok(adapter) => adapter,
            Err(reason) => return Ok(VerifyResponse::invalid(reason)),
        };
        match adapter.verify(&ctx).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::info!(network = %ctx.network, error = %e, "verification rejected");
                Ok(VerifyResponse::invalid(e.reason()).with_details(e.to_string()))
            }
        }
    }

    #[instrument(skip_all, err)]
    async fn settle(&self, request: SettleRequest) -> Result<SettleResponse, FacilitatorError> {
        let ctx = match self.prepare(request)? {
            Ok(ctx) => ctx,
            Err((reason, network)) => {
                return Ok(SettleResponse::failed(network, reason));
            }
        };
        let network = ctx.network.wire_name();
        let adapter = match self.adapter_for(&ctx.network) {
            Ok(adapter) => adapter,
            Err(reason) => return Ok(SettleResponse::failed(network, reason)),
        };
        let response = match adapter.settle(&ctx).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(network = %ctx.network, error = %e, "settlement failed");
                SettleResponse::failed(network, e.reason()).with_detail(e.to_string())
            }
        };
        if response.success {
            if let Ok(body) = serde_json::to_value(&response) {
                self.webhooks
                    .dispatch(WebhookEvent::payment_settled(&self.facilitator_id, body));
            }
        }
        Ok(response)
    }

    async fn supported(&self) -> Result<SupportedResponse, FacilitatorError> {
        let mut kinds = Vec::new();
        let mut signers = std::collections::HashMap::new();
        for adapter in self.adapters.iter() {
            for chain_id in adapter.chain_ids() {
                let network = NetworkRegistry::by_chain_id(&chain_id)
                    .map(|info| info.name.to_string())
                    .unwrap_or_else(|| chain_id.to_string());
                for version in [1u8, 2u8] {
                    kinds.push(SupportedPaymentKind {
                        x402_version: version,
                        scheme: crate::types::Scheme::Exact,
                        network: network.clone(),
                        extra: None,
                    });
                }
            }
            let addresses = adapter.signer_addresses();
            if !addresses.is_empty() {
                signers.insert(format!("{}:*", adapter.family().namespace()), addresses);
            }
        }
        Ok(SupportedResponse {
            kinds,
            signers,
            extensions: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{PaymentError, Payout, SettlementAdapter};
    use crate::network::{ChainFamily, ChainId};
    use async_trait::async_trait;

    struct StubAdapter {
        family: ChainFamily,
        chain_ids: Vec<ChainId>,
    }

    #[async_trait]
    impl SettlementAdapter for StubAdapter {
        fn family(&self) -> ChainFamily {
            self.family
        }

        fn chain_ids(&self) -> Vec<ChainId> {
            self.chain_ids.clone()
        }

        fn signer_addresses(&self) -> Vec<String> {
            vec!["0x00000000000000000000000000000000000000aa".to_string()]
        }

        async fn verify(&self, ctx: &SettlementContext) -> Result<VerifyResponse, PaymentError> {
            Ok(VerifyResponse::valid(format!("payer-on-{}", ctx.network)))
        }

        async fn settle(&self, ctx: &SettlementContext) -> Result<SettleResponse, PaymentError> {
            Ok(SettleResponse::succeeded(
                ctx.network.wire_name(),
                "payer",
                "0xdeadbeef",
            ))
        }

        async fn pay_out(
            &self,
            _secret: &str,
            _payout: &Payout,
            network: &ResolvedNetwork,
        ) -> Result<SettleResponse, PaymentError> {
            Err(PaymentError::NotConfigured(network.chain_id.clone()))
        }
    }

    fn engine_with_evm_stub() -> FacilitatorEngine {
        let adapters = AdapterSet {
            evm: Some(Arc::new(StubAdapter {
                family: ChainFamily::Evm,
                chain_ids: vec![ChainId::new("eip155", "8453")],
            })),
            ..AdapterSet::default()
        };
        FacilitatorEngine::new(
            Arc::new(adapters),
            WebhookDispatcher::new(Vec::new()),
            "fac-test",
        )
    }

    fn verify_request(payload_network: &str, required_network: &str) -> VerifyRequest {
        serde_json::from_value(serde_json::json!({
            "x402Version": 1,
            "paymentPayload": {
                "x402Version": 1,
                "scheme": "exact",
                "network": payload_network,
                "payload": { "transaction": "AQAAAA==" },
            },
            "paymentRequirements": {
                "scheme": "exact",
                "network": required_network,
                "asset": "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
                "maxAmountRequired": "1000000",
                "payTo": "0x209693Bc6afc0C5328bA36FaF03C514EF312287C",
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn family_mismatch_is_invalid_not_an_error() {
        let engine = engine_with_evm_stub();
        let response = engine.verify(verify_request("solana", "base")).await.unwrap();
        assert!(!response.is_valid);
        assert_eq!(response.invalid_reason, Some(ErrorReason::NetworkMismatch));
    }

    #[tokio::test]
    async fn alias_and_canonical_network_match() {
        let engine = engine_with_evm_stub();
        let response = engine
            .verify(verify_request("base-mainnet", "base"))
            .await
            .unwrap();
        assert!(response.is_valid);
    }

    #[tokio::test]
    async fn unsupported_network_is_invalid() {
        let engine = engine_with_evm_stub();
        let response = engine.verify(verify_request("near", "near")).await.unwrap();
        assert_eq!(
            response.invalid_reason,
            Some(ErrorReason::UnsupportedNetwork)
        );
    }

    #[tokio::test]
    async fn family_without_adapter_is_not_configured() {
        let engine = engine_with_evm_stub();
        let response = engine
            .verify(verify_request("stacks", "stacks"))
            .await
            .unwrap();
        assert_eq!(response.invalid_reason, Some(ErrorReason::NotConfigured));
    }

    #[tokio::test]
    async fn settle_reports_success_from_adapter() {
        let engine = engine_with_evm_stub();
        let response = engine.settle(verify_request("base", "base")).await.unwrap();
        assert!(response.success);
        assert_eq!(response.transaction.as_deref(), Some("0xdeadbeef"));
        assert_eq!(response.network, "base");
    }

    #[tokio::test]
    async fn supported_lists_versions_and_signers() {
        let engine = engine_with_evm_stub();
        let supported = engine.supported().await.unwrap();
        assert_eq!(supported.kinds.len(), 2);
        assert!(supported.kinds.iter().any(|k| k.x402_version == 1));
        assert!(supported.kinds.iter().any(|k| k.x402_version == 2));
        assert!(supported.signers.contains_key("eip155:*"));
    }
}
