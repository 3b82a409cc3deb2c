//! Response snapshot and client-facing error bodies.
//!
//! # Responsibilities
//! - Project a backend response head into a serializable snapshot
//! - Build placeholder responses for per-request errors
//! - Render the final snapshot back onto the wire
//!
//! # Design Decisions
//! - Streaming responses avoid buffering the entire body; an override body
//!   supplied by a modifier replaces it
//! - Hop-by-hop headers stripped automatically
//! - Error responses carry a JSON body and an `x-gateway-error` code header

use axum::body::Body;
use axum::http::response::Parts;
use axum::http::{header, HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::http::request::{headers_to_multimap, multimap_to_headers, HeaderMultimap};

/// Header carrying the machine-readable error code.
pub const X_GATEWAY_ERROR: &str = "x-gateway-error";

/// Serializable view of a response on its way to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    pub headers: HeaderMultimap,
    /// Replaces the backend body when set.
    pub body: Option<Vec<u8>>,
    /// Terminal error for this exchange.
    pub error: Option<GatewayError>,
}

impl ResponseSnapshot {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status: status.as_u16(),
            headers: HeaderMultimap::new(),
            body: None,
            error: None,
        }
    }

    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            status: parts.status.as_u16(),
            headers: headers_to_multimap(&parts.headers),
            body: None,
            error: None,
        }
    }

    /// Placeholder response for a failed exchange.
    pub fn for_error(err: &GatewayError) -> Self {
        Self {
            status: err.status_code().as_u16(),
            headers: HeaderMultimap::new(),
            body: None,
            error: Some(err.clone()),
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Render onto the wire.
    ///
    /// With an override body the upstream body must already have been
    /// drained; otherwise `upstream_body` is streamed untouched. Errors
    /// without any body get the default JSON error body.
    pub fn into_response(self, upstream_body: Option<Body>) -> Response<Body> {
        let mut headers = multimap_to_headers(&self.headers);
        let body = match (self.body, upstream_body, &self.error) {
            (Some(bytes), _, _) => {
                headers.remove(header::CONTENT_LENGTH);
                Body::from(bytes)
            }
            (None, Some(stream), _) => stream,
            (None, None, Some(err)) => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                Body::from(error_body(err))
            }
            (None, None, None) => Body::empty(),
        };
        if let Some(err) = &self.error {
            headers.insert(X_GATEWAY_ERROR, HeaderValue::from_static(err.code()));
        }

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = headers;
        response
    }
}

/// `{"error": code, "message": text}`.
pub fn error_body(err: &GatewayError) -> Vec<u8> {
    serde_json::json!({
        "error": err.code(),
        "message": err.to_string(),
    })
    .to_string()
    .into_bytes()
}
