//! Snapshot parser — decodes one feed payload into normalized node patches.
//!
//! Two upstream shapes are supported: a flat `address -> attributes` map
//! (alfred) and the nested `{nodes: {id -> {flags, nodeinfo, statistics}}}`
//! map (meshviewer). Both normalize to `NodePatch` so the registry merge
//! never needs to know which feed a field came from.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};

use super::node::NodePatch;

/// Declared shape of a feed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    /// Flat map of hardware address to node attributes. Presence in the
    /// payload implies the node is online.
    Alfred,
    /// Nested `{nodes: {...}}` map with explicit flags.
    Meshviewer,
}

/// Lowercase a hardware address and strip `:`/`-` separators so the same
/// physical node keys identically across both feed shapes.
pub fn normalize_addr(addr: &str) -> String {
    addr.to_lowercase()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect()
}

/// Decode `body` into node patches tagged with `source`.
///
/// Identity keys listed in `skip` are dropped; this is the operator's
/// escape hatch for nodes that appear under conflicting identities in two
/// feeds at once.
pub fn parse_feed(
    body: &str,
    format: FeedFormat,
    source: &str,
    skip: &std::collections::HashSet<String>,
) -> FeedResult<Vec<NodePatch>> {
    match format {
        FeedFormat::Alfred => parse_alfred(body, source, skip),
        FeedFormat::Meshviewer => parse_meshviewer(body, source, skip),
    }
}

fn parse_alfred(
    body: &str,
    source: &str,
    skip: &std::collections::HashSet<String>,
) -> FeedResult<Vec<NodePatch>> {
    let map: HashMap<String, RawAlfredNode> =
        serde_json::from_str(body).map_err(|e| FeedError::Parse(e.to_string()))?;

    let mut patches = Vec::with_capacity(map.len());
    for (addr, raw) in map {
        let id = match &raw.node_id {
            Some(node_id) => normalize_addr(node_id),
            None => normalize_addr(&addr),
        };
        if skip.contains(&id) {
            continue;
        }

        let mut patch = NodePatch {
            id,
            source: source.to_string(),
            node_id: raw.node_id,
            mac: Some(addr),
            hostname: raw.hostname,
            // A node present in the alfred payload is online by definition.
            online: Some(true),
            clientcount: raw
                .clients
                .and_then(|c| c.total)
                .unwrap_or(0),
            ..NodePatch::default()
        };
        if let Some(location) = raw.location {
            patch.lat = location.latitude;
            patch.lon = location.longitude;
        }
        if let Some(model) = raw.hardware.and_then(|h| h.model) {
            patch.hardware = Some(model.join());
        }
        if let Some(owner) = raw.owner {
            patch.contact = owner.contact;
        }
        apply_software(&mut patch, raw.software);

        patches.push(patch);
    }
    Ok(patches)
}

fn parse_meshviewer(
    body: &str,
    source: &str,
    skip: &std::collections::HashSet<String>,
) -> FeedResult<Vec<NodePatch>> {
    let doc: RawMeshviewerDoc =
        serde_json::from_str(body).map_err(|e| FeedError::Parse(e.to_string()))?;

    let mut patches = Vec::with_capacity(doc.nodes.len());
    for (node_id, raw) in doc.nodes {
        let id = normalize_addr(&node_id);
        if skip.contains(&id) {
            continue;
        }

        let mut patch = NodePatch {
            id,
            source: source.to_string(),
            node_id: Some(node_id),
            ..NodePatch::default()
        };

        if let Some(flags) = raw.flags {
            patch.gateway = flags.gateway;
            patch.online = flags.online;
        }

        if let Some(nodeinfo) = raw.nodeinfo {
            patch.hostname = nodeinfo.hostname;
            if let Some(model) = nodeinfo.hardware.and_then(|h| h.model) {
                patch.hardware = Some(model.join());
            }
            // location may be present but null.
            if let Some(location) = nodeinfo.location {
                patch.lat = location.latitude;
                patch.lon = location.longitude;
            }
            if let Some(network) = nodeinfo.network {
                patch.mac = network.mac;
            }
            if let Some(owner) = nodeinfo.owner {
                patch.contact = owner.contact;
            }
            apply_software(&mut patch, nodeinfo.software);
        }

        // Clients only count while the node is online; an offline node's
        // stale statistics block must not resurrect a count.
        if patch.online == Some(true) {
            patch.clientcount = raw
                .statistics
                .and_then(|s| s.clients)
                .unwrap_or(0);
        }

        patches.push(patch);
    }
    Ok(patches)
}

fn apply_software(patch: &mut NodePatch, software: Option<RawSoftware>) {
    let Some(software) = software else { return };
    if let Some(autoupdater) = software.autoupdater {
        patch.autoupdate = autoupdater.enabled;
        patch.branch = autoupdater.branch;
    }
    if let Some(firmware) = software.firmware {
        patch.firmware_base = firmware.base;
        patch.firmware_release = firmware.release;
    }
}

// ── Raw wire shapes ────────────────────────────────────────

#[derive(Deserialize)]
struct RawAlfredNode {
    node_id: Option<String>,
    hostname: Option<String>,
    location: Option<RawLocation>,
    hardware: Option<RawHardware>,
    owner: Option<RawOwner>,
    software: Option<RawSoftware>,
    clients: Option<RawClients>,
}

#[derive(Deserialize)]
struct RawMeshviewerDoc {
    nodes: HashMap<String, RawMeshviewerNode>,
}

#[derive(Deserialize)]
struct RawMeshviewerNode {
    flags: Option<RawFlags>,
    nodeinfo: Option<RawNodeinfo>,
    statistics: Option<RawStatistics>,
}

#[derive(Deserialize)]
struct RawFlags {
    online: Option<bool>,
    gateway: Option<bool>,
}

#[derive(Deserialize)]
struct RawNodeinfo {
    hostname: Option<String>,
    hardware: Option<RawHardware>,
    location: Option<RawLocation>,
    network: Option<RawNetwork>,
    owner: Option<RawOwner>,
    software: Option<RawSoftware>,
}

#[derive(Deserialize)]
struct RawNetwork {
    mac: Option<String>,
}

#[derive(Deserialize)]
struct RawStatistics {
    clients: Option<i64>,
}

#[derive(Deserialize)]
struct RawClients {
    total: Option<i64>,
}

#[derive(Deserialize)]
struct RawLocation {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize)]
struct RawHardware {
    model: Option<RawModel>,
}

/// Some firmwares report the model as a list of string fragments.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawModel {
    One(String),
    Parts(Vec<String>),
}

impl RawModel {
    fn join(self) -> String {
        match self {
            RawModel::One(s) => s,
            RawModel::Parts(parts) => parts.concat(),
        }
    }
}

#[derive(Deserialize)]
struct RawOwner {
    contact: Option<String>,
}

#[derive(Deserialize)]
struct RawSoftware {
    autoupdater: Option<RawAutoupdater>,
    firmware: Option<RawFirmware>,
}

#[derive(Deserialize)]
struct RawAutoupdater {
    enabled: Option<bool>,
    branch: Option<String>,
}

#[derive(Deserialize)]
struct RawFirmware {
    base: Option<String>,
    release: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn no_skip() -> HashSet<String> {
        HashSet::new()
    }

    #[test]
    fn alfred_flat_map_with_clients() {
        let body = r#"{"aa:bb:cc:dd:ee:ff": {"hostname": "node1", "clients": {"total": 3}}}"#;
        let patches = parse_feed(body, FeedFormat::Alfred, "alfred.json", &no_skip()).unwrap();
        assert_eq!(patches.len(), 1);

        let p = &patches[0];
        assert_eq!(p.id, "aabbccddeeff");
        assert_eq!(p.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(p.hostname.as_deref(), Some("node1"));
        assert_eq!(p.online, Some(true));
        assert_eq!(p.clientcount, 3);
        assert_eq!(p.source, "alfred.json");
        assert_eq!(p.gateway, None);
    }

    #[test]
    fn alfred_without_clients_defaults_to_zero() {
        let body = r#"{"aa:bb:cc:dd:ee:ff": {"hostname": "node1"}}"#;
        let patches = parse_feed(body, FeedFormat::Alfred, "alfred.json", &no_skip()).unwrap();
        assert_eq!(patches[0].clientcount, 0);
        assert_eq!(patches[0].online, Some(true));
    }

    #[test]
    fn meshviewer_nested_shape() {
        let body = r#"{"nodes": {"C04A00E44AB6": {
            "flags": {"online": true, "gateway": false},
            "nodeinfo": {
                "hostname": "entropia",
                "hardware": {"model": "TL-WR841N"},
                "location": {"latitude": 49.0047, "longitude": 8.3858},
                "network": {"mac": "c0:4a:00:e4:4a:b6"},
                "owner": {"contact": "ops@example.net"},
                "software": {
                    "autoupdater": {"enabled": true, "branch": "stable"},
                    "firmware": {"base": "gluon-v2014.4", "release": "0.6.1"}
                }
            },
            "statistics": {"clients": 7}
        }}}"#;
        let patches =
            parse_feed(body, FeedFormat::Meshviewer, "nodes.json", &no_skip()).unwrap();
        assert_eq!(patches.len(), 1);

        let p = &patches[0];
        assert_eq!(p.id, "c04a00e44ab6");
        assert_eq!(p.node_id.as_deref(), Some("C04A00E44AB6"));
        assert_eq!(p.mac.as_deref(), Some("c0:4a:00:e4:4a:b6"));
        assert_eq!(p.hostname.as_deref(), Some("entropia"));
        assert_eq!(p.lat, Some(49.0047));
        assert_eq!(p.lon, Some(8.3858));
        assert_eq!(p.hardware.as_deref(), Some("TL-WR841N"));
        assert_eq!(p.contact.as_deref(), Some("ops@example.net"));
        assert_eq!(p.autoupdate, Some(true));
        assert_eq!(p.branch.as_deref(), Some("stable"));
        assert_eq!(p.firmware_base.as_deref(), Some("gluon-v2014.4"));
        assert_eq!(p.firmware_release.as_deref(), Some("0.6.1"));
        assert_eq!(p.online, Some(true));
        assert_eq!(p.gateway, Some(false));
        assert_eq!(p.clientcount, 7);
    }

    #[test]
    fn meshviewer_offline_node_gets_no_clients() {
        let body = r#"{"nodes": {"c04a00e44ab6": {
            "flags": {"online": false},
            "statistics": {"clients": 7}
        }}}"#;
        let patches =
            parse_feed(body, FeedFormat::Meshviewer, "nodes.json", &no_skip()).unwrap();
        assert_eq!(patches[0].online, Some(false));
        assert_eq!(patches[0].clientcount, 0);
    }

    #[test]
    fn meshviewer_null_location_and_model_fragments() {
        let body = r#"{"nodes": {"c04a00e44ab6": {
            "flags": {"online": true},
            "nodeinfo": {
                "hostname": "huette",
                "hardware": {"model": ["TL-", "WR841N"]},
                "location": null
            }
        }}}"#;
        let patches =
            parse_feed(body, FeedFormat::Meshviewer, "nodes.json", &no_skip()).unwrap();
        let p = &patches[0];
        assert_eq!(p.hardware.as_deref(), Some("TL-WR841N"));
        assert_eq!(p.lat, None);
        assert_eq!(p.lon, None);
    }

    #[test]
    fn skip_list_drops_duplicate_identities() {
        let body = r#"{"nodes": {
            "c04a00e44ab6": {"flags": {"online": true}},
            "deadbeef0001": {"flags": {"online": true}}
        }}"#;
        let skip: HashSet<String> = ["c04a00e44ab6".to_string()].into_iter().collect();
        let patches = parse_feed(body, FeedFormat::Meshviewer, "nodes.json", &skip).unwrap();
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].id, "deadbeef0001");
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_feed("{not json", FeedFormat::Alfred, "alfred.json", &no_skip())
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }

    #[test]
    fn wrong_shape_is_a_parse_error() {
        // meshviewer parser on an alfred body: no `nodes` key.
        let err = parse_feed(
            r#"{"aa:bb:cc:dd:ee:ff": {}}"#,
            FeedFormat::Meshviewer,
            "nodes.json",
            &no_skip(),
        )
        .unwrap_err();
        assert!(matches!(err, FeedError::Parse(_)));
    }
}
