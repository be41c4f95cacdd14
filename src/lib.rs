//! proxy-box: supervisor for a local proxy core and its tunnel client.
//!
//! # Architecture Overview
//!
//! ```text
//!   CLUSTER / CONFIG / config.json        cluster server
//!              │                          │   ▲
//!              ▼                    GET /config   ws /connection
//!        ┌──────────┐                     │   │
//!        │  config  │◀────────────────────┘   │
//!        │ resolver │                         │
//!        └────┬─────┘                   ┌─────┴─────┐
//!             ▼                         │  cluster  │
//!        ConfigCell ◀──── refresh ──────│   link +  │
//!             │                         │ dispatch  │
//!             ▼                         └─────┬─────┘
//!      ┌─────────────┐   restart / update     │
//!      │ core_config │◀───────────────────────┘
//!      │  builder    │          │
//!      └──────┬──────┘          ▼
//!             ▼           ┌────────────┐
//!         stdin JSON ───▶ │ supervisor │──▶ core, tunnel client
//!                         └─────┬──────┘
//!                               ▼ Fatal
//!                         ┌────────────┐      ┌────────┐
//!                         │ lifecycle  │      │  http  │ /generate_204
//!                         │  Instance  │      │ status │ /generate_200
//!                         └────────────┘      └────────┘
//! ```

// Configuration
pub mod config;
pub mod core_config;

// Process and control plane
pub mod cluster;
pub mod supervisor;

// Boundary and cross-cutting concerns
pub mod http;
pub mod lifecycle;
pub mod observability;

pub use config::{ConfigCell, EffectiveConfig, Resolver};
pub use lifecycle::{Exit, Instance, InstanceOptions, Shutdown};
pub use supervisor::Supervisor;
