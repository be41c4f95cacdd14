//! Cluster configuration fetch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use thiserror::Error;
use url::Url;

use crate::config::schema::ConfigPatch;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the cluster config endpoint.
#[derive(Debug, Error)]
pub enum RemoteConfigError {
    #[error("invalid cluster server URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cluster config request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("cluster config endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("cluster config document is not an object: {0}")]
    Document(#[source] serde_json::Error),
}

/// Where the remote configuration document comes from.
#[async_trait]
pub trait RemoteConfigSource: Send + Sync {
    async fn fetch(
        &self,
        server_url: &str,
        client_uuid: &str,
        auth: Option<&str>,
    ) -> Result<ConfigPatch, RemoteConfigError>;
}

/// Build `{server_url}/config?uuid={client_uuid}`.
pub fn config_endpoint(server_url: &str, client_uuid: &str) -> Result<Url, RemoteConfigError> {
    let base = format!("{}/config", server_url.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|source| RemoteConfigError::InvalidUrl {
        url: server_url.to_string(),
        source,
    })?;
    url.query_pairs_mut().append_pair("uuid", client_uuid);
    Ok(url)
}

/// Fetches the document over HTTP with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpConfigSource {
    client: reqwest::Client,
}

impl HttpConfigSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteConfigSource for HttpConfigSource {
    async fn fetch(
        &self,
        server_url: &str,
        client_uuid: &str,
        auth: Option<&str>,
    ) -> Result<ConfigPatch, RemoteConfigError> {
        let url = config_endpoint(server_url, client_uuid)?;

        let mut request = self.client.get(url);
        if let Some(token) = auth {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RemoteConfigError::Status(status));
        }

        let document = response.json::<serde_json::Value>().await?;
        ConfigPatch::from_value(document).map_err(RemoteConfigError::Document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_endpoint() {
        let url = config_endpoint("https://ctrl.example/", "node 1").unwrap();
        assert_eq!(url.as_str(), "https://ctrl.example/config?uuid=node+1");

        let url = config_endpoint("http://10.0.0.1:8080/base", "n").unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.1:8080/base/config?uuid=n");
    }

    #[test]
    fn test_config_endpoint_rejects_garbage() {
        let err = config_endpoint("not a url", "n").unwrap_err();
        assert!(err.to_string().contains("not a url"));
    }
}
