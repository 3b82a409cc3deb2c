//! Request/response modification pipeline.
//!
//! # Data Flow
//! ```text
//! Routed + balanced request
//!     → Modifier::modify_request (outbound snapshot)
//!     → Proxier executes the call
//!     → success: Modifier::modify_response
//!         └─ a stage fails → modify_error_response(error, best response so far)
//!     → failure: Modifier::modify_error_response
//! ```
//!
//! # Design Decisions
//! - `ModifierChain` is a fold over ordered stages; the first failing stage
//!   aborts the rest of the fold
//! - The error path never fails: a stage that cannot rewrite the error
//!   response leaves its input untouched

pub mod chain;
pub mod plugin;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::http::{RequestSnapshot, ResponseSnapshot};

pub use chain::ModifierChain;
pub use plugin::PluginModifier;

/// A failed `modify_response`, carrying the best response produced before
/// the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyFailure {
    pub error: GatewayError,
    pub response: ResponseSnapshot,
}

/// One request/response transformation.
#[async_trait]
pub trait Modifier: Send + Sync + std::fmt::Debug {
    async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError>;

    async fn modify_response(
        &self,
        request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, ModifyFailure>;

    async fn modify_error_response(
        &self,
        error: GatewayError,
        request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> ResponseSnapshot;
}

/// Returns every input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopModifier;

#[async_trait]
impl Modifier for NoopModifier {
    async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError> {
        Ok(request)
    }

    async fn modify_response(
        &self,
        _request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, ModifyFailure> {
        Ok(response)
    }

    async fn modify_error_response(
        &self,
        _error: GatewayError,
        _request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> ResponseSnapshot {
        response
    }
}
