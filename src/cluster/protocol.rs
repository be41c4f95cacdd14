//! Control-plane wire format.
//!
//! Inbound frames are JSON `{"type": ..., "data": ...}` text. Outbound frames
//! are the literal `ping` on open and the same JSON envelope otherwise.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::cluster::LinkError;

/// Sent once after every successful connect.
pub const PING_FRAME: &str = "ping";

/// Running software version reported to the server.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commands the cluster server can issue.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterCommand {
    RefreshConfig,
    GetEnv,
    ProcessRestart,
    ProcessUpdate,
    PushTasks(Vec<Value>),
    Unknown { kind: String, data: Value },
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Decode one inbound text frame. Anything that is not a well-formed
/// envelope is dropped.
pub fn parse_frame(text: &str) -> Option<ClusterCommand> {
    let frame: InboundFrame = serde_json::from_str(text).ok()?;

    let command = match frame.kind.as_str() {
        "refresh_config" => ClusterCommand::RefreshConfig,
        "get_env" => ClusterCommand::GetEnv,
        "process_restart" => ClusterCommand::ProcessRestart,
        "process_update" => ClusterCommand::ProcessUpdate,
        "push_tasks" => ClusterCommand::PushTasks(match frame.data {
            Value::Array(tasks) => tasks,
            Value::Null => Vec::new(),
            single => vec![single],
        }),
        _ => ClusterCommand::Unknown {
            kind: frame.kind,
            data: frame.data,
        },
    };
    Some(command)
}

fn envelope(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

pub fn keepalive_frame(url: &str) -> String {
    envelope("keepalive_url", Value::String(url.to_string()))
}

pub fn env_frame(env: &BTreeMap<String, String>) -> String {
    envelope("get_env", json!(env))
}

/// Snapshot of this process's environment for `get_env`.
pub fn env_snapshot() -> BTreeMap<String, String> {
    std::env::vars_os()
        .map(|(key, value)| {
            (
                key.to_string_lossy().into_owned(),
                value.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

/// `{server_url as ws(s)}/connection?uuid=..&version=..`
pub fn socket_endpoint(server_url: &str, client_uuid: &str, version: &str) -> Result<Url, LinkError> {
    let base = format!("{}/connection", server_url.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|source| LinkError::InvalidUrl {
        url: server_url.to_string(),
        source,
    })?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(LinkError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| LinkError::UnsupportedScheme(scheme.to_string()))?;

    url.query_pairs_mut()
        .append_pair("uuid", client_uuid)
        .append_pair("version", version);
    Ok(url)
}
