//! Configuration schema definitions.
//!
//! `EffectiveConfig` is the fully-resolved record every subsystem reads.
//! `ConfigPatch` is what each source (bootstrap variable, local document,
//! cluster server) contributes: one `Option` per field, applied on top of
//! the record by `config::merge`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields never written to logs.
const SECRET_FIELDS: &[&str] = &[
    "cluster_server_auth",
    "tls_key",
    "tls_cert",
    "warp_secretKey",
    "cloudflared_access_token",
];

/// The merged, authoritative configuration for one running instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    // Cluster
    pub cluster_enabled: bool,
    pub cluster_server_url: Option<String>,
    pub cluster_server_auth: Option<String>,
    pub cluster_client_uuid: String,
    pub cluster_exec_enabled: bool,

    // Operation
    pub debug: bool,
    /// Public listening port.
    pub port: u16,
    /// Loopback port the core's inbound listens on.
    pub middle_port: u16,
    pub core_path: String,
    /// Explicit core download location; discovered via DNS when absent.
    pub core_download_url: Option<String>,
    pub disable_exit_protect: bool,

    // Proxy
    /// Base protocol id, already decoded from its transport encoding.
    pub protocol: String,
    /// Transport network type (ws, xhttp, ...).
    pub network: String,
    pub uuid: String,
    pub decryption: String,
    pub path: String,
    pub xhttp_extra: Value,

    // TLS, held decoded
    pub tls_enabled: bool,
    pub tls_key: Option<String>,
    pub tls_cert: Option<String>,

    // VPN outbound
    pub warp_add_ipv4: bool,
    pub warp_add_ipv6: bool,
    pub warp_ipv4: String,
    pub warp_ipv6: Option<String>,
    pub warp_reserved: Vec<u8>,
    #[serde(rename = "warp_publicKey")]
    pub warp_public_key: String,
    #[serde(rename = "warp_secretKey")]
    pub warp_secret_key: Option<String>,
    pub warp_endpoint: String,
    pub warp_routing: String,

    // Tunnel
    pub cloudflared_enabled: bool,
    pub cloudflared_path: String,
    pub cloudflared_protocol: String,
    pub cloudflared_region: String,
    pub cloudflared_access_token: Option<String>,

    // Explicit core-config overrides
    pub inbound_custom: Option<Value>,
    pub outbound_custom: Option<Value>,
    pub dns_custom: Option<Value>,
    pub routing_custom: Option<Value>,
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            cluster_enabled: false,
            cluster_server_url: None,
            cluster_server_auth: None,
            cluster_client_uuid: "default".to_string(),
            cluster_exec_enabled: false,

            debug: false,
            port: 3000,
            middle_port: 58515,
            core_path: default_executable("./core"),
            core_download_url: None,
            disable_exit_protect: false,

            protocol: "vless".to_string(),
            network: "xhttp".to_string(),
            uuid: "api".to_string(),
            decryption: "none".to_string(),
            path: "/api".to_string(),
            xhttp_extra: serde_json::json!({
                "scMaxEachPostBytes": "100000000",
                "scStreamUpServerSecs": "90",
            }),

            tls_enabled: false,
            tls_key: None,
            tls_cert: None,

            warp_add_ipv4: false,
            warp_add_ipv6: false,
            warp_ipv4: "172.16.0.2".to_string(),
            warp_ipv6: None,
            warp_reserved: vec![0, 0, 0],
            warp_public_key: "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=".to_string(),
            warp_secret_key: None,
            warp_endpoint: "engage.cloudflareclient.com:2408".to_string(),
            warp_routing: "auto".to_string(),

            cloudflared_enabled: false,
            cloudflared_path: default_executable("./cloudflared"),
            cloudflared_protocol: "auto".to_string(),
            cloudflared_region: String::new(),
            cloudflared_access_token: None,

            inbound_custom: None,
            outbound_custom: None,
            dns_custom: None,
            routing_custom: None,
        }
    }
}

impl EffectiveConfig {
    /// True when both the cluster flag and a server URL are present.
    pub fn cluster_active(&self) -> bool {
        self.cluster_enabled
            && self
                .cluster_server_url
                .as_deref()
                .is_some_and(|url| !url.is_empty())
    }

    /// A JSON view of the record with secrets masked, for logging.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(map) = value.as_object_mut() {
            for key in SECRET_FIELDS {
                if let Some(field) = map.get_mut(*key) {
                    if !field.is_null() {
                        *field = Value::String("<redacted>".to_string());
                    }
                }
            }
        }
        value
    }
}

fn default_executable(base: &str) -> String {
    if cfg!(windows) {
        format!("{base}.exe")
    } else {
        base.to_string()
    }
}

/// `warp_reserved` as a source may encode it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ReservedValue {
    /// Literal byte array.
    Bytes(Vec<u8>),
    /// Base64 text of the raw bytes.
    Encoded(String),
}

/// One source's contribution to the effective configuration.
///
/// Every field is optional; `None` leaves the underlying value untouched.
/// TLS material arrives base64-encoded and `warp_reserved` may arrive as
/// base64 text: both are normalized when the patch is applied.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub cluster_enabled: Option<bool>,
    pub cluster_server_url: Option<String>,
    pub cluster_server_auth: Option<String>,
    pub cluster_client_uuid: Option<String>,
    pub cluster_exec_enabled: Option<bool>,

    pub debug: Option<bool>,
    pub port: Option<u16>,
    pub middle_port: Option<u16>,
    pub core_path: Option<String>,
    pub core_download_url: Option<String>,
    pub disable_exit_protect: Option<bool>,

    pub protocol: Option<String>,
    pub network: Option<String>,
    pub uuid: Option<String>,
    pub decryption: Option<String>,
    pub path: Option<String>,
    pub xhttp_extra: Option<Value>,

    pub tls_enabled: Option<bool>,
    pub tls_key: Option<String>,
    pub tls_cert: Option<String>,

    pub warp_add_ipv4: Option<bool>,
    pub warp_add_ipv6: Option<bool>,
    pub warp_ipv4: Option<String>,
    pub warp_ipv6: Option<String>,
    pub warp_reserved: Option<ReservedValue>,
    #[serde(rename = "warp_publicKey")]
    pub warp_public_key: Option<String>,
    #[serde(rename = "warp_secretKey")]
    pub warp_secret_key: Option<String>,
    pub warp_endpoint: Option<String>,
    pub warp_routing: Option<String>,

    pub cloudflared_enabled: Option<bool>,
    pub cloudflared_path: Option<String>,
    pub cloudflared_protocol: Option<String>,
    pub cloudflared_region: Option<String>,
    pub cloudflared_access_token: Option<String>,

    pub inbound_custom: Option<Value>,
    pub outbound_custom: Option<Value>,
    pub dns_custom: Option<Value>,
    pub routing_custom: Option<Value>,
}

impl ConfigPatch {
    /// Parse a JSON document into a patch. See [`ConfigPatch::from_value`].
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// Build a patch from a JSON object.
    ///
    /// A field whose value does not fit its type is logged and left out;
    /// the rest of the document still applies. Anything other than an
    /// object is an error.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let fields = match value {
            Value::Object(fields) => fields,
            other => return serde_json::from_value(other),
        };

        let fields: Map<String, Value> = fields
            .into_iter()
            .filter(|(name, field)| {
                let single = Value::Object(Map::from_iter([(name.clone(), field.clone())]));
                match serde_json::from_value::<ConfigPatch>(single) {
                    Ok(_) => true,
                    Err(err) => {
                        tracing::warn!(field = %name, error = %err, "[Main] Config Error: field ignored");
                        false
                    }
                }
            })
            .collect();

        serde_json::from_value(Value::Object(fields))
    }
}
