//! Field-by-field merging of patches into the effective configuration.
//!
//! Transport encodings are undone here, once: TLS material is base64-decoded,
//! `warp_reserved` is normalized to bytes and `protocol` is accepted either
//! plain or base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::config::schema::{ConfigPatch, EffectiveConfig, ReservedValue};

impl EffectiveConfig {
    /// Apply a patch on top of this record. Later patches win per field.
    ///
    /// The patch is destructured exhaustively, so a field added to
    /// `ConfigPatch` without a merge rule fails to compile.
    pub fn apply(&mut self, patch: ConfigPatch) {
        let ConfigPatch {
            cluster_enabled,
            cluster_server_url,
            cluster_server_auth,
            cluster_client_uuid,
            cluster_exec_enabled,
            debug,
            port,
            middle_port,
            core_path,
            core_download_url,
            disable_exit_protect,
            protocol,
            network,
            uuid,
            decryption,
            path,
            xhttp_extra,
            tls_enabled,
            tls_key,
            tls_cert,
            warp_add_ipv4,
            warp_add_ipv6,
            warp_ipv4,
            warp_ipv6,
            warp_reserved,
            warp_public_key,
            warp_secret_key,
            warp_endpoint,
            warp_routing,
            cloudflared_enabled,
            cloudflared_path,
            cloudflared_protocol,
            cloudflared_region,
            cloudflared_access_token,
            inbound_custom,
            outbound_custom,
            dns_custom,
            routing_custom,
        } = patch;

        set(&mut self.cluster_enabled, cluster_enabled);
        set_some(&mut self.cluster_server_url, cluster_server_url);
        set_some(&mut self.cluster_server_auth, cluster_server_auth);
        set(&mut self.cluster_client_uuid, cluster_client_uuid);
        set(&mut self.cluster_exec_enabled, cluster_exec_enabled);

        set(&mut self.debug, debug);
        set(&mut self.port, port);
        set(&mut self.middle_port, middle_port);
        set(&mut self.core_path, core_path);
        set_some(&mut self.core_download_url, core_download_url);
        set(&mut self.disable_exit_protect, disable_exit_protect);

        set(&mut self.protocol, protocol.map(|p| decode_protocol(&p)));
        set(&mut self.network, network);
        set(&mut self.uuid, uuid);
        set(&mut self.decryption, decryption);
        set(&mut self.path, path);
        set(&mut self.xhttp_extra, xhttp_extra);

        set(&mut self.tls_enabled, tls_enabled);
        if let Some(key) = tls_key {
            self.tls_key = decode_secret("tls_key", &key);
        }
        if let Some(cert) = tls_cert {
            self.tls_cert = decode_secret("tls_cert", &cert);
        }

        set(&mut self.warp_add_ipv4, warp_add_ipv4);
        set(&mut self.warp_add_ipv6, warp_add_ipv6);
        set(&mut self.warp_ipv4, warp_ipv4);
        set_some(&mut self.warp_ipv6, warp_ipv6);
        if let Some(reserved) = warp_reserved {
            self.warp_reserved = normalize_reserved(reserved, &self.warp_reserved);
        }
        set(&mut self.warp_public_key, warp_public_key);
        set_some(&mut self.warp_secret_key, warp_secret_key);
        set(&mut self.warp_endpoint, warp_endpoint);
        set(&mut self.warp_routing, warp_routing);

        set(&mut self.cloudflared_enabled, cloudflared_enabled);
        set(&mut self.cloudflared_path, cloudflared_path);
        set(&mut self.cloudflared_protocol, cloudflared_protocol);
        set(&mut self.cloudflared_region, cloudflared_region);
        set_some(&mut self.cloudflared_access_token, cloudflared_access_token);

        set_some(&mut self.inbound_custom, inbound_custom);
        set_some(&mut self.outbound_custom, outbound_custom);
        set_some(&mut self.dns_custom, dns_custom);
        set_some(&mut self.routing_custom, routing_custom);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn set_some<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// The cluster-identity fields, captured so a remote document cannot change them.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterIdentity {
    enabled: bool,
    server_url: Option<String>,
    auth: Option<String>,
    client_uuid: String,
    exec_enabled: bool,
}

impl ClusterIdentity {
    pub fn of(config: &EffectiveConfig) -> Self {
        Self {
            enabled: config.cluster_enabled,
            server_url: config.cluster_server_url.clone(),
            auth: config.cluster_server_auth.clone(),
            client_uuid: config.cluster_client_uuid.clone(),
            exec_enabled: config.cluster_exec_enabled,
        }
    }

    pub fn reassert(self, config: &mut EffectiveConfig) {
        config.cluster_enabled = self.enabled;
        config.cluster_server_url = self.server_url;
        config.cluster_server_auth = self.auth;
        config.cluster_client_uuid = self.client_uuid;
        config.cluster_exec_enabled = self.exec_enabled;
    }
}

/// Decode a base64 reserved string into its byte values.
///
/// The bytes are read back pairwise from their hex rendering, which for
/// well-formed input is exactly the decoded byte sequence.
pub fn decode_reserved(encoded: &str) -> Option<Vec<u8>> {
    let bytes = STANDARD.decode(encoded.trim()).ok()?;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
        })
        .collect()
}

fn normalize_reserved(value: ReservedValue, fallback: &[u8]) -> Vec<u8> {
    match value {
        ReservedValue::Bytes(bytes) => bytes,
        ReservedValue::Encoded(text) => match decode_reserved(&text) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!("[Main] warp_reserved is not valid base64, using previous value");
                fallback.to_vec()
            }
        },
    }
}

fn decode_secret(field: &'static str, encoded: &str) -> Option<String> {
    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());
    if decoded.is_none() {
        tracing::warn!(field, "[Main] Ignoring value that is not base64-encoded text");
    }
    decoded
}

fn decode_protocol(value: &str) -> String {
    STANDARD
        .decode(value.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reserved() {
        assert_eq!(decode_reserved("AAAA"), Some(vec![0, 0, 0]));
        assert_eq!(decode_reserved("AQID"), Some(vec![1, 2, 3]));
        assert_eq!(decode_reserved("not base64!"), None);
    }

    #[test]
    fn test_reserved_literal_passes_through() {
        let mut config = EffectiveConfig::default();
        config.apply(ConfigPatch {
            warp_reserved: Some(ReservedValue::Bytes(vec![9, 8, 7])),
            ..Default::default()
        });
        assert_eq!(config.warp_reserved, vec![9, 8, 7]);
    }

    #[test]
    fn test_invalid_reserved_keeps_previous() {
        let mut config = EffectiveConfig::default();
        config.apply(ConfigPatch {
            warp_reserved: Some(ReservedValue::Encoded("***".into())),
            ..Default::default()
        });
        assert_eq!(config.warp_reserved, vec![0, 0, 0]);
    }

    #[test]
    fn test_tls_material_is_decoded() {
        let mut config = EffectiveConfig::default();
        config.apply(ConfigPatch {
            tls_key: Some(STANDARD.encode("-----BEGIN KEY-----")),
            tls_cert: Some("%%%".into()),
            ..Default::default()
        });
        assert_eq!(config.tls_key.as_deref(), Some("-----BEGIN KEY-----"));
        assert_eq!(config.tls_cert, None);
    }

    #[test]
    fn test_protocol_accepts_plain_and_encoded() {
        let mut config = EffectiveConfig::default();
        config.apply(ConfigPatch {
            protocol: Some("dm1lc3M=".into()),
            ..Default::default()
        });
        assert_eq!(config.protocol, "vmess");

        config.apply(ConfigPatch {
            protocol: Some("vless".into()),
            ..Default::default()
        });
        assert_eq!(config.protocol, "vless");
    }

    #[test]
    fn test_absent_fields_untouched() {
        let mut config = EffectiveConfig::default();
        config.apply(ConfigPatch {
            port: Some(8443),
            ..Default::default()
        });
        assert_eq!(config.port, 8443);
        assert_eq!(config, EffectiveConfig { port: 8443, ..EffectiveConfig::default() });
    }

    #[test]
    fn test_identity_reassert() {
        let mut config = EffectiveConfig::default();
        config.cluster_enabled = true;
        config.cluster_server_url = Some("https://ctrl.example".into());
        let identity = ClusterIdentity::of(&config);

        config.apply(ConfigPatch {
            cluster_enabled: Some(false),
            cluster_server_url: Some("https://evil.example".into()),
            ..Default::default()
        });
        identity.reassert(&mut config);

        assert!(config.cluster_enabled);
        assert_eq!(config.cluster_server_url.as_deref(), Some("https://ctrl.example"));
    }
}
