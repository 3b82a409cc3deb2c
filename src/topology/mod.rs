//! Upstream/backend topology.
//!
//! # Data Flow
//! ```text
//! discovery plugin / admin API / config file
//!     → manager.rs (validate, store, maintain BackendID → UpstreamID index)
//!     → event.rs (one immutable Event per mutation)
//!     → events::Broadcaster (fan-out to router / load balancer hooks)
//! ```
//!
//! # Design Decisions
//! - The manager is the single writer of topology
//! - Events are created at the moment of mutation and never persisted
//! - IDs come from an injected generator, never from global counters

pub mod event;
pub mod ids;
pub mod manager;
pub mod static_source;
pub mod types;

pub use event::{Event, EventType};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use manager::{Manager, TopologyError};
pub use static_source::StaticSource;
pub use types::{Backend, BackendId, HealthCheck, Protocol, Upstream, UpstreamId};
