//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Resolved config → status listener → cluster link → supervisor startup
//!
//! Run loop (startup.rs):
//!     Fatal (fatal.rs) or SIGINT/SIGTERM (signals.rs)
//!     → close link → Shutdown::trigger (shutdown.rs) → kill processes → Exit
//! ```
//!
//! # Design Decisions
//! - Subsystems report fatal conditions; only the run loop acts on them
//! - Exit status 1 for any fatal condition, 0 for a signal

pub mod fatal;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use fatal::Fatal;
pub use shutdown::{Shutdown, ShutdownSignal};
pub use startup::{Exit, Instance, InstanceOptions};
