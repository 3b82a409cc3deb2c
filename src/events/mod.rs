//! Typed, asynchronous topology event distribution.
//!
//! # Data Flow
//! ```text
//! Manager mutation
//!     → broadcaster.rs publish(event)
//!     → per-listener queue (unbounded, never blocks the publisher)
//!     → per-listener forwarder task → consumer channel (bounded, may stall
//!       that listener only)
//!     → subscriber.rs worker → matching hooks, run concurrently
//! ```
//!
//! # Design Decisions
//! - A slow consumer only delays its own deliveries
//! - Events reach any one listener in publish order
//! - No ordering across listeners, no persistence
//! - The broadcaster never closes a consumer's channel

pub mod broadcaster;
pub mod subscriber;

pub use broadcaster::{Broadcaster, ListenerId};
pub use subscriber::{Hook, Subscriber, Subscription};
