//! HTTP boundary.
//!
//! # Data Flow
//! ```text
//! EffectiveConfig (port, tls_*)
//!     → server.rs (bind with retry, plain or TLS)
//!     → status_router (/generate_204, /generate_200[/...], 404 otherwise)
//! ```
//!
//! # Design Decisions
//! - Only connectivity checks are served; user traffic goes to the core
//! - The listener is bound once and survives process restarts

pub mod server;

pub use server::{bind_with_retry, status_router, ListenMode, StatusServer};
