//! Local configuration sources: the embedded/file override document and the
//! cluster bootstrap variable.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::schema::ConfigPatch;

/// Environment variable holding an embedded JSON override document.
pub const CONFIG_ENV: &str = "CONFIG";
/// Environment variable holding `serverUrl;authToken;clientId;execEnabled`.
pub const CLUSTER_ENV: &str = "CLUSTER";
/// Override file read when no embedded document parses.
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The raw inputs the resolver reads.
///
/// Captured once from the process environment, or built directly in tests.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    /// Embedded override document.
    pub config_env: Option<String>,
    /// Cluster bootstrap value.
    pub cluster_env: Option<String>,
    /// Override file path.
    pub config_path: PathBuf,
}

impl ConfigSources {
    /// Read the sources from the current process environment.
    pub fn from_env(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_env: std::env::var(CONFIG_ENV).ok(),
            cluster_env: std::env::var(CLUSTER_ENV).ok(),
            config_path: config_path.into(),
        }
    }

    /// Sources with nothing set and a file path that is not expected to exist.
    pub fn empty(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_env: None,
            cluster_env: None,
            config_path: config_path.into(),
        }
    }

    /// The local override patch: embedded document, else file, else empty.
    ///
    /// Never fails; a broken source is logged and treated as empty.
    pub fn local_override(&self) -> ConfigPatch {
        if let Some(text) = self.config_env.as_deref() {
            match ConfigPatch::from_json(text) {
                Ok(patch) => return patch,
                Err(e) => {
                    tracing::debug!(error = %e, "Embedded config did not parse, trying file");
                }
            }
        }

        match load_config(&self.config_path) {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(
                    path = %self.config_path.display(),
                    error = %e,
                    "[Main] Config Error"
                );
                ConfigPatch::default()
            }
        }
    }

    /// The bootstrap patch, if the cluster variable is set.
    pub fn bootstrap(&self) -> Option<ConfigPatch> {
        self.cluster_env.as_deref().map(parse_bootstrap)
    }
}

/// Load an override document from a JSON file.
pub fn load_config(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let content = fs::read_to_string(path)?;
    let patch = ConfigPatch::from_json(&content)?;
    Ok(patch)
}

/// Parse `serverUrl;authToken;clientId;execEnabled`.
///
/// Empty or missing segments leave their field untouched. A server URL turns
/// clustering on.
pub fn parse_bootstrap(value: &str) -> ConfigPatch {
    let mut parts = value.split(';').map(str::trim);
    let mut segment = || parts.next().filter(|s| !s.is_empty()).map(str::to_string);

    let server_url = segment();
    let auth = segment();
    let client_uuid = segment();
    let exec_enabled = segment().map(|flag| {
        matches!(
            flag.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    });

    ConfigPatch {
        cluster_enabled: server_url.as_ref().map(|_| true),
        cluster_server_url: server_url,
        cluster_server_auth: auth,
        cluster_client_uuid: client_uuid,
        cluster_exec_enabled: exec_enabled,
        ..Default::default()
    }
}
