//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events tagged [Initialization] / [Main] / [Cluster]
//!
//! logging.rs:
//!     RUST_LOG or proxy_box=info
//!     → raised to debug once the resolved config asks for it
//!     → fmt layer on stdout
//! ```
//!
//! # Design Decisions
//! - Logging starts before config resolution so resolution itself is logged
//! - An explicit RUST_LOG always wins over the config's debug flag

pub mod logging;

pub use logging::{init, LogHandle};
