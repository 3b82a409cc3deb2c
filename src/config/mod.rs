//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → lifecycle::startup (assembles components)
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → topology::StaticSource reconciles the [[upstreams]] section
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only static topology is hot-reloaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, BackendConfig, BalancingPolicy, GatewayConfig, ListenerConfig, ListenersConfig,
    LoadBalancerConfig, LogFormat, ObservabilityConfig, PluginConfig, PluginsConfig, ProxyConfig,
    UpstreamConfig,
};
pub use watcher::ConfigWatcher;
