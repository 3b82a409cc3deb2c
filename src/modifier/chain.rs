//! Ordered modifier stages.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::http::{RequestSnapshot, ResponseSnapshot};
use crate::modifier::{Modifier, ModifyFailure};

/// Runs stages strictly in order, each stage's output feeding the next.
/// A stage fails either by returning an error or by setting the snapshot's
/// `error`. An empty chain behaves like `NoopModifier`.
#[derive(Debug, Clone, Default)]
pub struct ModifierChain {
    stages: Vec<Arc<dyn Modifier>>,
}

impl ModifierChain {
    pub fn new(stages: Vec<Arc<dyn Modifier>>) -> Self {
        Self { stages }
    }

    pub fn push(&mut self, stage: Arc<dyn Modifier>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl Modifier for ModifierChain {
    async fn modify_request(&self, mut request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError> {
        for stage in &self.stages {
            request = stage.modify_request(request).await?;
            if let Some(err) = request.error.clone() {
                return Err(err);
            }
        }
        Ok(request)
    }

    async fn modify_response(
        &self,
        request: &RequestSnapshot,
        mut response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, ModifyFailure> {
        for stage in &self.stages {
            response = stage.modify_response(request, response).await?;
            if let Some(error) = response.error.clone() {
                return Err(ModifyFailure { error, response });
            }
        }
        Ok(response)
    }

    async fn modify_error_response(
        &self,
        error: GatewayError,
        request: &RequestSnapshot,
        mut response: ResponseSnapshot,
    ) -> ResponseSnapshot {
        for stage in &self.stages {
            response = stage
                .modify_error_response(error.clone(), request, response)
                .await;
        }
        response
    }
}
