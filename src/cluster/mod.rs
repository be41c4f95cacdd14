//! Cluster control-plane subsystem.
//!
//! # Data Flow
//! ```text
//! EffectiveConfig (cluster enabled + server url)
//!     → protocol.rs (ws(s)://.../connection?uuid=..&version=..)
//!     → link.rs (socket task: ping, keep-alive url, frames → LinkEvent)
//!     → dispatch.rs (refresh_config / get_env / process_restart /
//!                    process_update / push_tasks)
//!     → Resolver + ConfigCell + Supervisor
//!
//! drop / error → reconnect.rs (one pending timer, 10 s) → link.rs
//! close()      → no further reconnects
//! ```
//!
//! # Design Decisions
//! - Link errors are never fatal; they become a reconnect
//! - Malformed frames are dropped without touching the connection
//! - One consumer per link, so commands run in arrival order

pub mod dispatch;
pub mod link;
pub mod protocol;
pub mod reconnect;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::EffectiveConfig;

pub use dispatch::{Dispatcher, LoggingTasks, TaskDispatcher};
pub use link::{ClusterLink, LinkEvent, LinkOptions};
pub use protocol::ClusterCommand;

/// Variable holding the externally reachable base URL of this instance.
pub const KEEPALIVE_ENV: &str = "RENDER_EXTERNAL_URL";

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("invalid cluster server URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported cluster server scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("cluster link is closed")]
    Closed,
}

/// `RENDER_EXTERNAL_URL` + `/generate_200`, when the variable is set.
pub fn keepalive_url_from_env() -> Option<String> {
    std::env::var(KEEPALIVE_ENV)
        .ok()
        .filter(|base| !base.is_empty())
        .map(|base| format!("{}/generate_200", base.trim_end_matches('/')))
}

/// Open the link described by `config`, or `None` when clustering is off.
pub fn connect(
    config: &EffectiveConfig,
    keepalive_url: Option<String>,
) -> Result<Option<(ClusterLink, mpsc::UnboundedReceiver<LinkEvent>)>, LinkError> {
    let Some(server_url) = config.cluster_server_url.as_deref().filter(|_| config.cluster_active()) else {
        return Ok(None);
    };

    let endpoint = protocol::socket_endpoint(
        server_url,
        &config.cluster_client_uuid,
        protocol::SOFTWARE_VERSION,
    )?;
    let options = LinkOptions::new(endpoint).with_keepalive_url(keepalive_url);
    Ok(Some(ClusterLink::connect(options)))
}
