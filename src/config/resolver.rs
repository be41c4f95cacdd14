//! Effective configuration resolution.
//!
//! Order, later wins per field:
//! 1. built-in defaults
//! 2. cluster bootstrap variable
//! 3. local override (embedded document, else file)
//! 4. cluster server document, with cluster identity re-asserted afterwards

use std::sync::Arc;

use crate::config::loader::ConfigSources;
use crate::config::merge::ClusterIdentity;
use crate::config::remote::RemoteConfigSource;
use crate::config::schema::EffectiveConfig;

/// Produces `EffectiveConfig` records from the configured sources.
#[derive(Clone)]
pub struct Resolver {
    sources: ConfigSources,
    remote: Arc<dyn RemoteConfigSource>,
}

impl Resolver {
    pub fn new(sources: ConfigSources, remote: Arc<dyn RemoteConfigSource>) -> Self {
        Self { sources, remote }
    }

    pub fn sources(&self) -> &ConfigSources {
        &self.sources
    }

    /// Defaults, bootstrap and local override. No network access.
    pub fn resolve_local(&self) -> EffectiveConfig {
        let mut config = EffectiveConfig::default();
        if let Some(bootstrap) = self.sources.bootstrap() {
            config.apply(bootstrap);
        }
        config.apply(self.sources.local_override());
        config
    }

    /// Full resolution including the cluster server document.
    ///
    /// A failed fetch leaves the local-only result in place; remote fields
    /// from earlier resolutions are not carried over.
    pub async fn resolve(&self) -> EffectiveConfig {
        let mut config = self.resolve_local();
        if !config.cluster_active() {
            return config;
        }

        let identity = ClusterIdentity::of(&config);
        let server_url = config.cluster_server_url.clone().unwrap_or_default();

        match self
            .remote
            .fetch(
                &server_url,
                &config.cluster_client_uuid,
                config.cluster_server_auth.as_deref(),
            )
            .await
        {
            Ok(patch) => {
                config.apply(patch);
                identity.reassert(&mut config);
                tracing::info!("[Initialization] Obtain cluster configuration successfully");
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "[Initialization] Cluster configuration unavailable, using local configuration"
                );
            }
        }

        config
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config_path", &self.sources.config_path)
            .field("has_config_env", &self.sources.config_env.is_some())
            .field("has_cluster_env", &self.sources.cluster_env.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::remote::RemoteConfigError;
    use crate::config::schema::ConfigPatch;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a fixed document and records the requests it served.
    struct FixedRemote {
        patch: Option<ConfigPatch>,
        calls: Mutex<Vec<(String, String, Option<String>)>>,
    }

    impl FixedRemote {
        fn new(patch: Option<ConfigPatch>) -> Arc<Self> {
            Arc::new(Self {
                patch,
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl RemoteConfigSource for FixedRemote {
        async fn fetch(
            &self,
            server_url: &str,
            client_uuid: &str,
            auth: Option<&str>,
        ) -> Result<ConfigPatch, RemoteConfigError> {
            self.calls.lock().unwrap().push((
                server_url.to_string(),
                client_uuid.to_string(),
                auth.map(str::to_string),
            ));
            self.patch
                .clone()
                .ok_or(RemoteConfigError::Status(reqwest::StatusCode::UNAUTHORIZED))
        }
    }

    fn sources() -> ConfigSources {
        ConfigSources::empty("/nonexistent/proxy-box/config.json")
    }

    #[tokio::test]
    async fn test_empty_sources_yield_defaults() {
        let remote = FixedRemote::new(None);
        let resolver = Resolver::new(sources(), remote.clone());

        assert_eq!(resolver.resolve().await, EffectiveConfig::default());
        assert!(remote.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_from_local_document() {
        let mut sources = sources();
        sources.config_env = Some(r#"{"warp_reserved":"AAAA"}"#.into());
        let resolver = Resolver::new(sources, FixedRemote::new(None));

        assert_eq!(resolver.resolve().await.warp_reserved, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_malformed_local_yields_bootstrap_only() {
        let mut sources = sources();
        sources.config_env = Some("{{{".into());
        sources.cluster_env = Some("https://ctrl.example;secret;node-1;1".into());
        let resolver = Resolver::new(sources, FixedRemote::new(None));

        let mut expected = EffectiveConfig::default();
        expected.cluster_enabled = true;
        expected.cluster_server_url = Some("https://ctrl.example".into());
        expected.cluster_server_auth = Some("secret".into());
        expected.cluster_client_uuid = "node-1".into();
        expected.cluster_exec_enabled = true;

        assert_eq!(resolver.resolve().await, expected);
    }

    #[tokio::test]
    async fn test_remote_merged_with_identity_reasserted() {
        let mut sources = sources();
        sources.cluster_env = Some("https://ctrl.example;secret;node-1;1".into());
        let remote = FixedRemote::new(Some(ConfigPatch {
            cluster_enabled: Some(false),
            cluster_server_url: Some("https://other.example".into()),
            cluster_server_auth: Some("stolen".into()),
            cluster_client_uuid: Some("node-9".into()),
            cluster_exec_enabled: Some(false),
            port: Some(9000),
            ..Default::default()
        }));
        let resolver = Resolver::new(sources, remote.clone());

        let config = resolver.resolve().await;
        assert_eq!(config.port, 9000);
        assert!(config.cluster_enabled);
        assert_eq!(config.cluster_server_url.as_deref(), Some("https://ctrl.example"));
        assert_eq!(config.cluster_server_auth.as_deref(), Some("secret"));
        assert_eq!(config.cluster_client_uuid, "node-1");
        assert!(config.cluster_exec_enabled);

        let calls = remote.calls.lock().unwrap();
        assert_eq!(
            calls.as_slice(),
            &[(
                "https://ctrl.example".to_string(),
                "node-1".to_string(),
                Some("secret".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local() {
        let mut sources = sources();
        sources.cluster_env = Some("https://ctrl.example;secret;node-1;1".into());
        sources.config_env = Some(r#"{"port": 4000}"#.into());
        let resolver = Resolver::new(sources, FixedRemote::new(None));

        let config = resolver.resolve().await;
        assert_eq!(config, resolver.resolve_local());
        assert_eq!(config.port, 4000);
    }

    #[tokio::test]
    async fn test_local_can_override_bootstrap() {
        let mut sources = sources();
        sources.cluster_env = Some("https://ctrl.example;secret;node-1;1".into());
        sources.config_env = Some(r#"{"cluster_enabled": false}"#.into());
        let remote = FixedRemote::new(Some(ConfigPatch::default()));
        let resolver = Resolver::new(sources, remote.clone());

        let config = resolver.resolve().await;
        assert!(!config.cluster_enabled);
        assert!(remote.calls.lock().unwrap().is_empty());
    }
}
