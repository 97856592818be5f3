//! Node — durable per-node state plus the merge and diff primitives.
//!
//! A `Node` is the committed registry record. A `NodePatch` is what one
//! feed snapshot says about a node this cycle: only the fields the feed
//! actually carried are set, and applying a patch overwrites exactly those
//! fields (merge, not replace).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed node record, keyed by its identity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable identity: the explicit node id when the feed carries one,
    /// otherwise the normalized hardware address.
    pub id: String,
    pub node_id: Option<String>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hardware: Option<String>,
    pub contact: Option<String>,
    pub autoupdate: Option<bool>,
    pub branch: Option<String>,
    pub firmware_base: Option<String>,
    pub firmware_release: Option<String>,
    pub firstseen: Option<DateTime<Utc>>,
    pub lastseen: Option<DateTime<Utc>>,
    pub online: bool,
    /// Tri-state: `None` means no feed ever said either way and the node
    /// is treated as "not a known gateway".
    pub gateway: Option<bool>,
    pub clientcount: i64,
    /// Which feed last wrote this record. Scopes the offline sweep.
    pub source: String,
}

/// One feed's view of a node for a single cycle.
///
/// `online` is `None` when the feed did not state presence; the swept
/// record then stays offline. `clientcount` is always set because every
/// feed has an explicit policy for it (absent clients means zero).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub id: String,
    pub source: String,
    pub node_id: Option<String>,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hardware: Option<String>,
    pub contact: Option<String>,
    pub autoupdate: Option<bool>,
    pub branch: Option<String>,
    pub firmware_base: Option<String>,
    pub firmware_release: Option<String>,
    pub online: Option<bool>,
    pub gateway: Option<bool>,
    pub clientcount: i64,
}

impl Node {
    /// Fresh record from a first observation. `firstseen` is set exactly
    /// once, here.
    pub fn from_patch(patch: &NodePatch, now: DateTime<Utc>) -> Self {
        let mut node = Node {
            id: patch.id.clone(),
            node_id: None,
            mac: None,
            hostname: None,
            lat: None,
            lon: None,
            hardware: None,
            contact: None,
            autoupdate: None,
            branch: None,
            firmware_base: None,
            firmware_release: None,
            firstseen: Some(now),
            lastseen: None,
            online: false,
            gateway: None,
            clientcount: 0,
            source: patch.source.clone(),
        };
        node.apply(patch, now);
        node
    }

    /// Merge a patch into this record: fields present in the patch win,
    /// absent fields keep their committed values.
    pub fn apply(&mut self, patch: &NodePatch, now: DateTime<Utc>) {
        macro_rules! merge {
            ($field:ident) => {
                if patch.$field.is_some() {
                    self.$field = patch.$field.clone();
                }
            };
        }
        merge!(node_id);
        merge!(mac);
        merge!(hostname);
        merge!(lat);
        merge!(lon);
        merge!(hardware);
        merge!(contact);
        merge!(autoupdate);
        merge!(branch);
        merge!(firmware_base);
        merge!(firmware_release);
        merge!(gateway);

        if let Some(online) = patch.online {
            self.online = online;
            if online {
                self.lastseen = Some(now);
            }
        }
        self.clientcount = patch.clientcount;
        self.source = patch.source.clone();
    }

    /// Display name: hostname when known, identity key otherwise.
    pub fn name(&self) -> &str {
        self.hostname.as_deref().unwrap_or(&self.id)
    }

    /// One-line summary used in new-node announcements:
    /// name, hardware, firmware.
    pub fn summary(&self) -> String {
        let mut out = vec![self.name().to_string()];
        if let Some(hardware) = &self.hardware {
            out.push(hardware.clone());
        }
        if let (Some(base), Some(release)) = (&self.firmware_base, &self.firmware_release) {
            out.push(format!("{}/{}", base, release));
        }
        out.join(", ")
    }
}

/// The explicitly enumerated diffable fields of a node record.
///
/// `firstseen` and `lastseen` are churn-only and deliberately not listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeField {
    NodeId,
    Mac,
    Hostname,
    Lat,
    Lon,
    Hardware,
    Contact,
    Autoupdate,
    Branch,
    FirmwareBase,
    FirmwareRelease,
    Online,
    Gateway,
    Clientcount,
    Source,
}

impl NodeField {
    pub const ALL: [NodeField; 15] = [
        NodeField::NodeId,
        NodeField::Mac,
        NodeField::Hostname,
        NodeField::Lat,
        NodeField::Lon,
        NodeField::Hardware,
        NodeField::Contact,
        NodeField::Autoupdate,
        NodeField::Branch,
        NodeField::FirmwareBase,
        NodeField::FirmwareRelease,
        NodeField::Online,
        NodeField::Gateway,
        NodeField::Clientcount,
        NodeField::Source,
    ];

    /// Name as used in the operator's `ignore_fields` config list.
    pub fn name(self) -> &'static str {
        match self {
            NodeField::NodeId => "node_id",
            NodeField::Mac => "mac",
            NodeField::Hostname => "hostname",
            NodeField::Lat => "lat",
            NodeField::Lon => "lon",
            NodeField::Hardware => "hardware",
            NodeField::Contact => "contact",
            NodeField::Autoupdate => "autoupdate",
            NodeField::Branch => "branch",
            NodeField::FirmwareBase => "firmware_base",
            NodeField::FirmwareRelease => "firmware_release",
            NodeField::Online => "online",
            NodeField::Gateway => "gateway",
            NodeField::Clientcount => "clientcount",
            NodeField::Source => "source",
        }
    }
}

/// A single changed field with its stringified old and new values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: NodeField,
    pub old: String,
    pub new: String,
}

fn fmt_opt<T: std::fmt::Display>(value: &Option<T>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "none".to_string(),
    }
}

/// Structural before/after comparison over the enumerated field list.
pub fn diff(before: &Node, after: &Node) -> Vec<FieldChange> {
    let mut changes = Vec::new();

    macro_rules! cmp_opt {
        ($field:ident, $variant:expr) => {
            if before.$field != after.$field {
                changes.push(FieldChange {
                    field: $variant,
                    old: fmt_opt(&before.$field),
                    new: fmt_opt(&after.$field),
                });
            }
        };
    }

    for field in NodeField::ALL {
        match field {
            NodeField::NodeId => cmp_opt!(node_id, field),
            NodeField::Mac => cmp_opt!(mac, field),
            NodeField::Hostname => cmp_opt!(hostname, field),
            NodeField::Lat => cmp_opt!(lat, field),
            NodeField::Lon => cmp_opt!(lon, field),
            NodeField::Hardware => cmp_opt!(hardware, field),
            NodeField::Contact => cmp_opt!(contact, field),
            NodeField::Autoupdate => cmp_opt!(autoupdate, field),
            NodeField::Branch => cmp_opt!(branch, field),
            NodeField::FirmwareBase => cmp_opt!(firmware_base, field),
            NodeField::FirmwareRelease => cmp_opt!(firmware_release, field),
            NodeField::Gateway => cmp_opt!(gateway, field),
            NodeField::Online => {
                if before.online != after.online {
                    changes.push(FieldChange {
                        field,
                        old: before.online.to_string(),
                        new: after.online.to_string(),
                    });
                }
            }
            NodeField::Clientcount => {
                if before.clientcount != after.clientcount {
                    changes.push(FieldChange {
                        field,
                        old: before.clientcount.to_string(),
                        new: after.clientcount.to_string(),
                    });
                }
            }
            NodeField::Source => {
                if before.source != after.source {
                    changes.push(FieldChange {
                        field,
                        old: before.source.clone(),
                        new: after.source.clone(),
                    });
                }
            }
        }
    }

    changes
}
