//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, request-id + trace layers)
//!     → request.rs (RequestSnapshot: host, prefix, forwardable headers)
//!     → [routing layer picks upstream]
//!     → [load balancer picks backend]
//!     → proxier.rs (modify, deadline-bound call, modify response or error)
//!     → response.rs (ResponseSnapshot back onto the wire)
//!     → Send to client
//! ```

pub mod proxier;
pub mod request;
pub mod response;
pub mod server;

pub use proxier::Proxier;
pub use request::{HeaderMultimap, RequestSnapshot, X_REQUEST_ID};
pub use response::{ResponseSnapshot, X_GATEWAY_ERROR};
pub use server::{gateway_router, run_listeners, AppState, HttpServer, ServeError};
