//! Extensible HTTP gateway library.
//!
//! Routing, load balancing and request/response modification each have an
//! in-process default and a variant delegated to a supervised plugin
//! process. Topology changes flow from the manager through the event
//! broadcaster into the serving components.

pub mod admin;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod lifecycle;
pub mod load_balancer;
pub mod modifier;
pub mod observability;
pub mod plugin;
pub mod routing;
pub mod topology;

pub use config::GatewayConfig;
pub use error::GatewayError;
pub use http::HttpServer;
pub use lifecycle::{Gateway, Shutdown};
