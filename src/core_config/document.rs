//! Core config document types.
//!
//! Field names follow the core's JSON format. Sections that the effective
//! configuration may override wholesale are wrapped in [`Section`].

use serde::Serialize;
use serde_json::{Map, Value};

/// A section that is either synthesized or supplied verbatim by the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Section<T> {
    Built(T),
    Custom(Value),
}

impl<T> Section<T> {
    pub fn built(&self) -> Option<&T> {
        match self {
            Section::Built(value) => Some(value),
            Section::Custom(_) => None,
        }
    }

    pub fn is_custom(&self) -> bool {
        matches!(self, Section::Custom(_))
    }
}

/// The full document written to the core's stdin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoreDocument {
    pub log: LogSection,
    pub api: ApiSection,
    pub inbounds: Section<Vec<Inbound>>,
    pub outbounds: Section<Vec<Outbound>>,
    pub routing: Section<Routing>,
    pub dns: DnsSection,
}

impl CoreDocument {
    /// Compact JSON, as the core reads it.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogSection {
    pub access: String,
    pub error: String,
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiSection {
    pub tag: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub sniffing: Sniffing,
    pub settings: InboundSettings,
    #[serde(rename = "streamSettings")]
    pub stream_settings: StreamSettings,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sniffing {
    pub enabled: bool,
    #[serde(rename = "destOverride")]
    pub dest_override: Vec<String>,
    #[serde(rename = "routeOnly")]
    pub route_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundSettings {
    pub clients: Vec<InboundClient>,
    pub decryption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundClient {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    /// `<network>Settings` keyed by transport name.
    #[serde(flatten)]
    pub transport: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outbound {
    pub protocol: String,
    pub settings: OutboundSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Empty(EmptySettings),
    Wireguard(WireguardSettings),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmptySettings {}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireguardSettings {
    #[serde(rename = "kernelMode")]
    pub kernel_mode: bool,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    pub address: Vec<String>,
    pub peers: Vec<WireguardPeer>,
    pub reserved: Vec<u8>,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireguardPeer {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Routing {
    #[serde(rename = "domainStrategy", skip_serializing_if = "Option::is_none")]
    pub domain_strategy: Option<String>,
    pub rules: Vec<RoutingRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "inboundTag", skip_serializing_if = "Option::is_none")]
    pub inbound_tag: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<String>>,
    #[serde(rename = "outboundTag")]
    pub outbound_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsSection {
    pub servers: Section<Vec<String>>,
}
