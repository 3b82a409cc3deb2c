//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Config → metric sinks → plugins started → router/LB subscribed
//!     → discovery drain + discovery plugins → static topology → listeners
//!
//! Shutdown (shutdown.rs):
//!     Signal received → stop accepting → drain connections
//!     → stop plugins within a deadline → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then plugins, then listeners
//! - Ordered shutdown: stop accept, drain, stop plugins
//! - Plugin shutdown has a deadline; stragglers are killed

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{forward_signals, shutdown_signal};
pub use startup::{Gateway, Launchers, StartupError};
