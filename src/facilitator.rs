//! The facilitator interface: verify, settle, supported.

use std::future::Future;
use std::sync::Arc;

use crate::types::{SettleRequest, SettleResponse, SupportedResponse, VerifyRequest, VerifyResponse};

/// Error for malformed or undecodable requests. Domain failures (bad
/// signature, insufficient funds, ...) are not errors; they come back as
/// `VerifyResponse::invalid` or `SettleResponse { success: false }`.
#[derive(Debug, thiserror::Error)]
pub enum FacilitatorError {
    #[error("malformed payment payload: {0}")]
    MalformedPayload(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Payment facilitator surface backing the HTTP endpoints.
pub trait Facilitator {
    fn verify(
        &self,
        request: VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, FacilitatorError>> + Send;

    fn settle(
        &self,
        request: SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, FacilitatorError>> + Send;

    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, FacilitatorError>> + Send;
}

impl<T> Facilitator for Arc<T>
where
    T: Facilitator + Send + Sync,
{
    fn verify(
        &self,
        request: VerifyRequest,
    ) -> impl Future<Output = Result<VerifyResponse, FacilitatorError>> + Send {
        self.as_ref().verify(request)
    }

    fn settle(
        &self,
        request: SettleRequest,
    ) -> impl Future<Output = Result<SettleResponse, FacilitatorError>> + Send {
        self.as_ref().settle(request)
    }

    fn supported(&self) -> impl Future<Output = Result<SupportedResponse, FacilitatorError>> + Send {
        self.as_ref().supported()
    }
}
