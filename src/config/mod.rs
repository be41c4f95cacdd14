//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! CLUSTER env ("url;auth;id;exec")
//!     → loader.rs (bootstrap patch)
//! CONFIG env / config.json
//!     → loader.rs (local override patch, broken input = empty)
//! cluster server GET /config
//!     → remote.rs (remote patch)
//!
//! defaults ← bootstrap ← local ← remote   (merge.rs, field by field)
//!     → resolver.rs (identity re-asserted after remote)
//!     → EffectiveConfig
//!     → cell.rs (single authoritative record, replaced wholesale)
//! ```
//!
//! # Design Decisions
//! - Resolution never fails; every broken input degrades to defaults
//! - All fields have defaults, so the record is always complete
//! - Transport encodings (base64 TLS material, reserved bytes) are undone
//!   once, during merge

pub mod cell;
pub mod loader;
pub mod merge;
pub mod remote;
pub mod resolver;
pub mod schema;

pub use cell::ConfigCell;
pub use loader::{ConfigError, ConfigSources};
pub use remote::{HttpConfigSource, RemoteConfigError, RemoteConfigSource};
pub use resolver::Resolver;
pub use schema::{ConfigPatch, EffectiveConfig, ReservedValue};
