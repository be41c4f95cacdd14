//! Structured logging.
//!
//! # Responsibilities
//! - Install the global tracing subscriber
//! - Switch to debug verbosity at runtime

use tracing_subscriber::{
    fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

const DEFAULT_FILTER: &str = "proxy_box=info,tower_http=info";
const DEBUG_FILTER: &str = "proxy_box=debug,tower_http=debug";

/// Adjusts the installed filter after startup.
#[derive(Debug, Clone)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    from_env: bool,
}

impl LogHandle {
    /// Raise verbosity when the config's `debug` flag is set, unless
    /// `RUST_LOG` was given explicitly.
    pub fn apply_debug(&self, debug: bool) {
        if !debug || self.from_env {
            return;
        }
        match self.filter.reload(EnvFilter::new(DEBUG_FILTER)) {
            Ok(()) => tracing::debug!("Debug logging enabled"),
            Err(err) => tracing::warn!(error = %err, "Failed to raise log level"),
        }
    }
}

/// Install the subscriber. Safe to call more than once; later calls leave
/// the first subscriber in place.
pub fn init() -> LogHandle {
    let (filter, from_env) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(DEFAULT_FILTER), false),
    };
    let (filter, handle) = reload::Layer::new(filter);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();

    LogHandle {
        filter: handle,
        from_env,
    }
}
