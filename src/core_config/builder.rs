//! Effective configuration → core config document.

use serde_json::Map;

use crate::config::EffectiveConfig;
use crate::core_config::document::*;

pub const TAG_API: &str = "api";
pub const TAG_DIRECT: &str = "direct";
pub const TAG_BLOCKED: &str = "blocked";
pub const TAG_WIREGUARD: &str = "wireguard";

const INBOUND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_DNS: [&str; 2] = ["https+local://1.1.1.1/dns-query", "8.8.8.8"];
const VPN_DNS: &str = "tcp+local://8.8.8.8";
const WIREGUARD_MTU: u32 = 1420;

/// VPN-outbound parameters, present only when complete.
#[derive(Debug, Clone, PartialEq)]
struct VpnPlan<'a> {
    secret_key: &'a str,
    ipv6: &'a str,
    route_v4: bool,
    route_v6: bool,
}

impl<'a> VpnPlan<'a> {
    fn from_config(config: &'a EffectiveConfig) -> Option<Self> {
        let secret_key = config.warp_secret_key.as_deref().filter(|k| !k.is_empty())?;
        let ipv6 = config.warp_ipv6.as_deref().filter(|a| !a.is_empty())?;
        if !(config.warp_add_ipv4 || config.warp_add_ipv6) {
            return None;
        }
        Some(Self {
            secret_key,
            ipv6,
            route_v4: config.warp_add_ipv4,
            route_v6: config.warp_add_ipv6,
        })
    }
}

/// Build the core document. Pure: no I/O, no failure modes.
pub fn build(config: &EffectiveConfig) -> CoreDocument {
    let vpn = VpnPlan::from_config(config);

    let inbounds = match &config.inbound_custom {
        Some(custom) => Section::Custom(custom.clone()),
        None => Section::Built(vec![inbound(config)]),
    };

    let outbounds = match (&config.outbound_custom, &vpn) {
        (Some(custom), _) => Section::Custom(custom.clone()),
        (None, Some(plan)) => Section::Built(vpn_outbounds(config, plan)),
        (None, None) => Section::Built(default_outbounds()),
    };

    let routing = match (&config.routing_custom, &vpn) {
        (Some(custom), _) => Section::Custom(custom.clone()),
        (None, Some(plan)) => Section::Built(vpn_routing(plan)),
        (None, None) => Section::Built(Routing {
            domain_strategy: None,
            rules: vec![api_rule(), bittorrent_rule()],
        }),
    };

    let servers = match (&config.dns_custom, &vpn) {
        (Some(custom), _) => Section::Custom(custom.clone()),
        (None, Some(_)) => Section::Built(vec![VPN_DNS.to_string()]),
        (None, None) => Section::Built(DEFAULT_DNS.iter().map(|s| s.to_string()).collect()),
    };

    CoreDocument {
        log: LogSection {
            access: String::new(),
            error: String::new(),
            loglevel: "warning".to_string(),
        },
        api: ApiSection {
            tag: TAG_API.to_string(),
            services: Vec::new(),
        },
        inbounds,
        outbounds,
        routing,
        dns: DnsSection { servers },
    }
}

fn inbound(config: &EffectiveConfig) -> Inbound {
    let mut transport = Map::new();
    let transport_settings = if config.network == "xhttp" {
        serde_json::json!({
            "path": config.path,
            "mode": "auto",
            "extra": config.xhttp_extra,
        })
    } else {
        serde_json::json!({ "path": config.path })
    };
    transport.insert(format!("{}Settings", config.network), transport_settings);

    Inbound {
        listen: INBOUND_ADDRESS.to_string(),
        port: config.middle_port,
        protocol: config.protocol.clone(),
        sniffing: Sniffing {
            enabled: false,
            dest_override: vec!["http".into(), "tls".into(), "quic".into()],
            route_only: true,
        },
        settings: InboundSettings {
            clients: vec![InboundClient {
                id: config.uuid.clone(),
                email: "user@example.com".to_string(),
                flow: None,
            }],
            decryption: if config.decryption.is_empty() {
                "none".to_string()
            } else {
                config.decryption.clone()
            },
        },
        stream_settings: StreamSettings {
            network: config.network.clone(),
            security: "none".to_string(),
            transport,
        },
        tag: "main".to_string(),
    }
}

fn plain_outbound(protocol: &str, tag: &str) -> Outbound {
    Outbound {
        protocol: protocol.to_string(),
        settings: OutboundSettings::Empty(EmptySettings::default()),
        tag: Some(tag.to_string()),
    }
}

fn default_outbounds() -> Vec<Outbound> {
    vec![
        plain_outbound("freedom", TAG_DIRECT),
        plain_outbound("blackhole", TAG_BLOCKED),
    ]
}

fn vpn_outbounds(config: &EffectiveConfig, plan: &VpnPlan<'_>) -> Vec<Outbound> {
    let mut outbounds = default_outbounds();
    outbounds.push(Outbound {
        protocol: "wireguard".to_string(),
        settings: OutboundSettings::Wireguard(WireguardSettings {
            kernel_mode: false,
            secret_key: plan.secret_key.to_string(),
            address: vec![
                format!("{}/32", config.warp_ipv4),
                format!("{}/128", plan.ipv6),
            ],
            peers: vec![WireguardPeer {
                public_key: config.warp_public_key.clone(),
                endpoint: config.warp_endpoint.clone(),
            }],
            reserved: config.warp_reserved.clone(),
            mtu: WIREGUARD_MTU,
        }),
        tag: Some(TAG_WIREGUARD.to_string()),
    });
    outbounds
}

/// Both families enabled routes everything by port range instead of by IP.
fn vpn_routing(plan: &VpnPlan<'_>) -> Routing {
    let target = |enabled: bool| if enabled { TAG_WIREGUARD } else { TAG_DIRECT };

    let (domain_strategy, ip_rules) = if plan.route_v4 && plan.route_v6 {
        (
            "AsIs",
            vec![RoutingRule {
                kind: "field".to_string(),
                port: Some("0-65535".to_string()),
                outbound_tag: TAG_WIREGUARD.to_string(),
                ..Default::default()
            }],
        )
    } else {
        (
            "IPIfNonMatch",
            vec![
                RoutingRule {
                    kind: "field".to_string(),
                    ip: Some(vec!["0.0.0.0/0".to_string()]),
                    outbound_tag: target(plan.route_v4).to_string(),
                    ..Default::default()
                },
                RoutingRule {
                    kind: "field".to_string(),
                    ip: Some(vec!["::/0".to_string()]),
                    outbound_tag: target(plan.route_v6).to_string(),
                    ..Default::default()
                },
            ],
        )
    };

    let mut rules = vec![api_rule()];
    rules.extend(ip_rules);
    rules.push(bittorrent_rule());

    Routing {
        domain_strategy: Some(domain_strategy.to_string()),
        rules,
    }
}

fn api_rule() -> RoutingRule {
    RoutingRule {
        kind: "field".to_string(),
        inbound_tag: Some(vec![TAG_API.to_string()]),
        outbound_tag: TAG_API.to_string(),
        ..Default::default()
    }
}

fn bittorrent_rule() -> RoutingRule {
    RoutingRule {
        kind: "field".to_string(),
        protocol: Some(vec!["bittorrent".to_string()]),
        outbound_tag: TAG_BLOCKED.to_string(),
        ..Default::default()
    }
}

/// Convenience for callers that only need the serialized form.
pub fn build_json(config: &EffectiveConfig) -> Result<String, serde_json::Error> {
    build(config).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn vpn_config(v4: bool, v6: bool) -> EffectiveConfig {
        EffectiveConfig {
            warp_secret_key: Some("c2VjcmV0".into()),
            warp_ipv6: Some("2606:4700::1".into()),
            warp_add_ipv4: v4,
            warp_add_ipv6: v6,
            ..EffectiveConfig::default()
        }
    }

    fn routing(doc: &CoreDocument) -> &Routing {
        doc.routing.built().expect("synthesized routing")
    }

    #[test]
    fn test_default_document() {
        let doc = build(&EffectiveConfig::default());

        assert_eq!(doc.log.loglevel, "warning");
        assert!(doc.api.services.is_empty());

        let inbound = &doc.inbounds.built().unwrap()[0];
        assert_eq!(inbound.listen, "127.0.0.1");
        assert_eq!(inbound.port, 58515);
        assert_eq!(inbound.protocol, "vless");
        assert_eq!(inbound.settings.clients[0].id, "api");
        assert_eq!(inbound.settings.decryption, "none");
        assert_eq!(inbound.stream_settings.transport["xhttpSettings"]["path"], "/api");
        assert_eq!(inbound.stream_settings.transport["xhttpSettings"]["mode"], "auto");

        let outbounds = doc.outbounds.built().unwrap();
        let protocols: Vec<_> = outbounds.iter().map(|o| o.protocol.as_str()).collect();
        assert_eq!(protocols, ["freedom", "blackhole"]);

        let rules = &routing(&doc).rules;
        assert_eq!(rules[0].inbound_tag.as_deref(), Some(&["api".to_string()][..]));
        assert_eq!(rules[0].outbound_tag, "api");
        assert_eq!(rules[1].outbound_tag, "blocked");
        assert_eq!(routing(&doc).domain_strategy, None);

        assert_eq!(
            doc.dns.servers.built().unwrap(),
            &vec!["https+local://1.1.1.1/dns-query".to_string(), "8.8.8.8".to_string()]
        );
    }

    #[test]
    fn test_ws_transport_settings() {
        let config = EffectiveConfig {
            network: "ws".into(),
            path: "/ws".into(),
            ..EffectiveConfig::default()
        };
        let doc = build(&config);
        let transport = &doc.inbounds.built().unwrap()[0].stream_settings.transport;
        assert_eq!(transport["wsSettings"], serde_json::json!({ "path": "/ws" }));
        assert!(!transport.contains_key("xhttpSettings"));
    }

    #[test]
    fn test_vpn_v4_only() {
        let doc = build(&vpn_config(true, false));
        let routing = routing(&doc);

        assert_eq!(routing.domain_strategy.as_deref(), Some("IPIfNonMatch"));
        let v4 = routing.rules.iter().find(|r| r.ip.as_deref() == Some(&["0.0.0.0/0".to_string()][..])).unwrap();
        let v6 = routing.rules.iter().find(|r| r.ip.as_deref() == Some(&["::/0".to_string()][..])).unwrap();
        assert_eq!(v4.outbound_tag, "wireguard");
        assert_eq!(v6.outbound_tag, "direct");
        assert!(routing.rules.iter().any(|r| r.protocol.is_some() && r.outbound_tag == "blocked"));

        let outbounds = doc.outbounds.built().unwrap();
        let tags: Vec<_> = outbounds.iter().filter_map(|o| o.tag.as_deref()).collect();
        assert_eq!(tags, ["direct", "blocked", "wireguard"]);

        assert_eq!(doc.dns.servers.built().unwrap(), &vec!["tcp+local://8.8.8.8".to_string()]);
    }

    #[test]
    fn test_vpn_v6_only() {
        let doc = build(&vpn_config(false, true));
        let routing = routing(&doc);
        assert_eq!(routing.domain_strategy.as_deref(), Some("IPIfNonMatch"));

        let targets: Vec<_> = routing
            .rules
            .iter()
            .filter(|r| r.ip.is_some())
            .map(|r| r.outbound_tag.as_str())
            .collect();
        assert_eq!(targets, ["direct", "wireguard"]);
    }

    #[test]
    fn test_vpn_both_families() {
        let doc = build(&vpn_config(true, true));
        let routing = routing(&doc);

        assert_eq!(routing.domain_strategy.as_deref(), Some("AsIs"));
        assert!(routing.rules.iter().all(|r| r.ip.is_none()));

        let port_rules: Vec<_> = routing.rules.iter().filter(|r| r.port.is_some()).collect();
        assert_eq!(port_rules.len(), 1);
        assert_eq!(port_rules[0].port.as_deref(), Some("0-65535"));
        assert_eq!(port_rules[0].outbound_tag, "wireguard");
    }

    #[test]
    fn test_wireguard_outbound_fields() {
        let mut config = vpn_config(true, false);
        config.warp_reserved = vec![1, 2, 3];
        let doc = build(&config);

        let json = serde_json::to_value(&doc).unwrap();
        let wg = &json["outbounds"][2];
        assert_eq!(wg["protocol"], "wireguard");
        assert_eq!(wg["settings"]["kernelMode"], false);
        assert_eq!(wg["settings"]["address"][0], "172.16.0.2/32");
        assert_eq!(wg["settings"]["address"][1], "2606:4700::1/128");
        assert_eq!(wg["settings"]["reserved"], serde_json::json!([1, 2, 3]));
        assert_eq!(wg["settings"]["mtu"], 1420);
        assert_eq!(wg["settings"]["peers"][0]["endpoint"], "engage.cloudflareclient.com:2408");
    }

    #[test]
    fn test_incomplete_vpn_falls_back() {
        let mut config = vpn_config(true, true);
        config.warp_ipv6 = None;
        let doc = build(&config);
        assert_eq!(doc.outbounds.built().unwrap().len(), 2);

        let config = vpn_config(false, false);
        let doc = build(&config);
        assert_eq!(doc.outbounds.built().unwrap().len(), 2);
    }

    #[test]
    fn test_custom_sections_win() {
        let mut config = vpn_config(true, true);
        config.outbound_custom = Some(serde_json::json!([{ "protocol": "freedom" }]));
        config.routing_custom = Some(serde_json::json!({ "rules": [] }));
        config.dns_custom = Some(serde_json::json!(["1.1.1.1"]));
        config.inbound_custom = Some(serde_json::json!([{ "port": 1 }]));

        let doc = build(&config);
        assert!(doc.outbounds.is_custom());
        assert!(doc.routing.is_custom());
        assert!(doc.inbounds.is_custom());
        assert!(doc.dns.servers.is_custom());

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["routing"], serde_json::json!({ "rules": [] }));
        assert_eq!(json["dns"]["servers"], serde_json::json!(["1.1.1.1"]));
        assert_eq!(json["inbounds"][0]["port"], 1);
    }

    #[test]
    fn test_serialized_shape() {
        let json = build_json(&EffectiveConfig::default()).unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["api"]["tag"], "api");
        assert_eq!(value["outbounds"][1]["settings"], serde_json::json!({}));
        assert_eq!(value["routing"]["rules"][1]["protocol"][0], "bittorrent");
        assert!(value["routing"].get("domainStrategy").is_none());
        assert!(!json.contains('\n'));
    }
}
