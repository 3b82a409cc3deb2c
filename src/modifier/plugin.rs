//! A modifier stage answered by a modifier plugin.

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::http::{RequestSnapshot, ResponseSnapshot};
use crate::modifier::{Modifier, ModifyFailure};
use crate::plugin::{PluginError, PluginType, Supervisor};

#[derive(Debug, Clone)]
pub struct PluginModifier {
    supervisor: Supervisor,
}

impl PluginModifier {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    fn name(&self) -> String {
        self.supervisor.name().to_string()
    }
}

#[async_trait]
impl Modifier for PluginModifier {
    async fn modify_request(&self, request: RequestSnapshot) -> Result<RequestSnapshot, GatewayError> {
        let name = self.name();
        let modified = self
            .supervisor
            .call("ModifyRequest", move |plugin| {
                let request = request.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_modifier()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Modifier))?
                        .modify_request(request)
                        .await
                }
            })
            .await?;
        match modified.error.clone() {
            Some(err) => Err(err),
            None => Ok(modified),
        }
    }

    async fn modify_response(
        &self,
        request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> Result<ResponseSnapshot, ModifyFailure> {
        let name = self.name();
        let (outbound_request, outbound_response) = (request.clone(), response.clone());
        let result = self
            .supervisor
            .call("ModifyResponse", move |plugin| {
                let request = outbound_request.clone();
                let response = outbound_response.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_modifier()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Modifier))?
                        .modify_response(request, response)
                        .await
                }
            })
            .await;

        match result {
            Ok(modified) => match modified.error.clone() {
                Some(error) => Err(ModifyFailure {
                    error,
                    response: modified,
                }),
                None => Ok(modified),
            },
            Err(e) => Err(ModifyFailure {
                error: e.into(),
                response,
            }),
        }
    }

    async fn modify_error_response(
        &self,
        error: GatewayError,
        request: &RequestSnapshot,
        response: ResponseSnapshot,
    ) -> ResponseSnapshot {
        let name = self.name();
        let (outbound_request, outbound_response) = (request.clone(), response.clone());
        let result = self
            .supervisor
            .call("ModifyErrorResponse", move |plugin| {
                let error = error.clone();
                let request = outbound_request.clone();
                let response = outbound_response.clone();
                let name = name.clone();
                async move {
                    plugin
                        .as_modifier()
                        .ok_or_else(|| PluginError::internal(&name, PluginType::Modifier))?
                        .modify_error_response(error, request, response)
                        .await
                }
            })
            .await;

        match result {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(
                    plugin = %self.supervisor.name(),
                    request_id = %request.request_id,
                    error = %e,
                    "Modifier plugin failed on error response, keeping previous response"
                );
                response
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifier::ModifierChain;
    use crate::observability::NoopSink;
    use crate::plugin::{ModifierPlugin, Plugin, PluginDescriptor, PluginLauncher, PluginOptions};
    use axum::http::StatusCode;
    use std::sync::Arc;

    /// Adds `x-plugin` to requests and responses, rejects `DELETE`.
    #[derive(Debug)]
    struct HeaderPlugin;

    #[async_trait]
    impl Plugin for HeaderPlugin {
        fn name(&self) -> &str {
            "headers"
        }

        fn plugin_type(&self) -> PluginType {
            PluginType::Modifier
        }

        async fn configure(&self, _options: &PluginOptions) -> Result<(), PluginError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn heartbeat(&self) -> Result<(), PluginError> {
            Ok(())
        }

        async fn kill(&self) -> Result<(), PluginError> {
            Ok(())
        }

        fn as_modifier(&self) -> Option<&dyn ModifierPlugin> {
            Some(self)
        }
    }

    #[async_trait]
    impl ModifierPlugin for HeaderPlugin {
        async fn modify_request(&self, mut request: RequestSnapshot) -> Result<RequestSnapshot, PluginError> {
            if request.method == "DELETE" {
                return Err(PluginError::Remote("deletes are not allowed".into()));
            }
            request.set_header("x-plugin", "request");
            Ok(request)
        }

        async fn modify_response(
            &self,
            _request: RequestSnapshot,
            mut response: ResponseSnapshot,
        ) -> Result<ResponseSnapshot, PluginError> {
            if response.status >= 500 {
                return Err(PluginError::Remote("refusing to touch a 5xx".into()));
            }
            response.set_header("x-plugin", "response");
            Ok(response)
        }

        async fn modify_error_response(
            &self,
            error: GatewayError,
            _request: RequestSnapshot,
            response: ResponseSnapshot,
        ) -> Result<ResponseSnapshot, PluginError> {
            Ok(response.with_body(format!("custom: {}", error.code())))
        }
    }

    #[derive(Debug)]
    struct Launcher;

    #[async_trait]
    impl PluginLauncher for Launcher {
        async fn launch(&self, _descriptor: &PluginDescriptor) -> Result<Arc<dyn Plugin>, PluginError> {
            Ok(Arc::new(HeaderPlugin))
        }
    }

    async fn modifier() -> PluginModifier {
        let supervisor = Supervisor::new(
            PluginDescriptor::new("headers", PluginType::Modifier, "headers").with_retries(1),
            Arc::new(Launcher),
            Arc::new(NoopSink),
        );
        supervisor.start().await.unwrap();
        PluginModifier::new(supervisor)
    }

    #[tokio::test]
    async fn test_plugin_stage_modifies_both_directions() {
        let modifier = modifier().await;
        let request = modifier
            .modify_request(RequestSnapshot::new("GET", "svc.local", "/"))
            .await
            .unwrap();
        assert_eq!(request.header("x-plugin"), Some("request"));

        let response = modifier
            .modify_response(&request, ResponseSnapshot::new(StatusCode::OK))
            .await
            .unwrap();
        assert_eq!(response.header("x-plugin"), Some("response"));
    }

    #[tokio::test]
    async fn test_remote_error_becomes_failure_with_original_response() {
        let modifier = modifier().await;
        let request = RequestSnapshot::new("GET", "svc.local", "/");
        let original = ResponseSnapshot::new(StatusCode::BAD_GATEWAY);

        let failure = modifier
            .modify_response(&request, original.clone())
            .await
            .unwrap_err();
        assert_eq!(failure.error.code(), "plugin_error");
        assert_eq!(failure.response, original);

        let rendered = modifier
            .modify_error_response(failure.error, &request, failure.response)
            .await;
        assert_eq!(rendered.body.as_deref(), Some(&b"custom: plugin_error"[..]));
    }

    #[tokio::test]
    async fn test_plugin_stage_inside_chain() {
        let chain = ModifierChain::new(vec![Arc::new(modifier().await)]);
        let err = chain
            .modify_request(RequestSnapshot::new("DELETE", "svc.local", "/"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "plugin_error");
    }
}
