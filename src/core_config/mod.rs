//! Core config builder.
//!
//! # Data Flow
//! ```text
//! EffectiveConfig
//!     → builder.rs (pure translation, no I/O)
//!         inbound   : loopback listener on middle_port
//!         outbounds : direct + blocked [+ wireguard]
//!         routing   : api rule, [VPN ip/port rules], bittorrent block
//!         dns       : custom | VPN | defaults
//!     → CoreDocument (document.rs)
//!     → compact JSON on the core's stdin
//! ```
//!
//! # Design Decisions
//! - User-supplied custom sections always win over synthesized ones
//! - VPN outbound only when secret key, IPv6 address and a family flag are set
//! - Both families enabled routes by port range, not IP range

pub mod builder;
pub mod document;

pub use builder::{build, build_json};
pub use document::{CoreDocument, Section};
