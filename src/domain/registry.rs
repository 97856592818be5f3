//! Node registry — the durable keyed store behind the reconciliation engine.
//!
//! Backed by sqlite with two tables: `nodes` (one row per identity key) and
//! `highscores` (one row per tracked metric). Every mutating cycle runs as
//! one transaction: the source-scoped offline sweep plus all upserts either
//! commit together or roll back together.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serde::{Deserialize, Serialize};

use crate::error::FeedResult;

use super::node::{Node, NodePatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    id               TEXT PRIMARY KEY,
    node_id          TEXT,
    mac              TEXT,
    hostname         TEXT,
    lat              REAL,
    lon              REAL,
    hardware         TEXT,
    contact          TEXT,
    autoupdate       INTEGER,
    branch           TEXT,
    firmware_base    TEXT,
    firmware_release TEXT,
    firstseen        TEXT,
    lastseen         TEXT,
    online           INTEGER NOT NULL DEFAULT 0,
    gateway          INTEGER,
    clientcount      INTEGER NOT NULL DEFAULT 0,
    source           TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS highscores (
    name  TEXT PRIMARY KEY,
    value INTEGER NOT NULL,
    date  TEXT
);
";

/// Gateway-flag filter. An unknown flag is never "a known gateway".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFilter {
    /// gateway = true
    Gateway,
    /// gateway = false or unknown
    NotGateway,
}

/// Predicate over node records for queries and aggregates.
#[derive(Debug, Clone, Default)]
pub struct NodeQuery {
    pub gateway: Option<GatewayFilter>,
    pub online: Option<bool>,
    pub source: Option<String>,
    /// Case-insensitive hostname substring.
    pub name_like: Option<String>,
    pub seen_since: Option<DateTime<Utc>>,
}

/// What one reconciliation cycle did to the registry, as before/after
/// snapshots. The field-level diff is computed by the engine, not here.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Records created this cycle, in feed order.
    pub created: Vec<Node>,
    /// `(before, after)` pairs for records that existed before this cycle
    /// and were touched by the sweep or an upsert.
    pub changed: Vec<(Node, Node)>,
}

/// A monotonic record value for one aggregate metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Highscore {
    pub name: String,
    pub value: i64,
    pub date: Option<DateTime<Utc>>,
}

/// Aggregate counts for the status query surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSummary {
    pub gateways_online: i64,
    pub nodes_online: i64,
    pub clients_online: i64,
    pub nodes_total: i64,
    pub nodes_seen_14d: i64,
    pub nodes_by_source: BTreeMap<String, i64>,
}

/// Node lookup result for the nodeinfo query surface: at most two matches
/// are returned; more than two without an exact hostname match is reported
/// as ambiguous.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NodeLookup {
    Matches { nodes: Vec<Node> },
    Ambiguous { count: usize },
}

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (or create) the registry database at `path`.
    pub fn open(path: &Path) -> FeedResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory registry, used by tests.
    pub fn open_in_memory() -> FeedResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply one cycle's snapshot for `source`: sweep every record owned by
    /// that source offline, then merge-upsert all patches, atomically.
    ///
    /// Returns before/after snapshots of every record the cycle touched so
    /// the engine can diff against pre-transaction state. On error the
    /// transaction rolls back and the prior committed state stays
    /// authoritative.
    pub fn apply_cycle(&self, source: &str, patches: &[NodePatch]) -> FeedResult<CycleOutcome> {
        let now = Utc::now();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        // Pre-transaction state: everything the sweep will touch, plus any
        // record an incoming patch will merge into (it may be owned by
        // another source).
        let mut before: BTreeMap<String, Node> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM nodes WHERE source = ?1",
                NODE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![source], node_from_row)?;
            for node in rows {
                let node = node?;
                before.insert(node.id.clone(), node);
            }
        }
        for patch in patches {
            if !before.contains_key(&patch.id) {
                if let Some(node) = get_in(&tx, &patch.id)? {
                    before.insert(node.id.clone(), node);
                }
            }
        }

        // Sweep: only nodes present in this snapshot may stay online.
        tx.execute(
            "UPDATE nodes SET online = 0, clientcount = 0 WHERE source = ?1",
            params![source],
        )?;

        let mut after: BTreeMap<String, Node> = BTreeMap::new();
        let mut created_order: Vec<String> = Vec::new();
        for patch in patches {
            let merged = match get_in(&tx, &patch.id)? {
                Some(mut current) => {
                    current.apply(patch, now);
                    current
                }
                None => Node::from_patch(patch, now),
            };
            save_in(&tx, &merged)?;
            if !before.contains_key(&patch.id) && !after.contains_key(&patch.id) {
                created_order.push(patch.id.clone());
            }
            after.insert(patch.id.clone(), merged);
        }

        // Swept records absent from the snapshot changed too; read their
        // post-sweep state back before committing.
        for id in before.keys() {
            if !after.contains_key(id) {
                if let Some(node) = get_in(&tx, id)? {
                    after.insert(id.clone(), node);
                }
            }
        }

        tx.commit()?;

        let mut outcome = CycleOutcome::default();
        for id in created_order {
            if let Some(node) = after.get(&id) {
                outcome.created.push(node.clone());
            }
        }
        for (id, old) in &before {
            if let Some(new) = after.get(id) {
                if new != old {
                    outcome.changed.push((old.clone(), new.clone()));
                }
            }
        }
        Ok(outcome)
    }

    pub fn get(&self, id: &str) -> FeedResult<Option<Node>> {
        let conn = self.conn();
        Ok(get_in(&conn, id)?)
    }

    /// All records matching the predicate, ordered by identity key.
    pub fn query(&self, q: &NodeQuery) -> FeedResult<Vec<Node>> {
        let (where_sql, params) = build_where(q);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM nodes{} ORDER BY id",
            NODE_COLUMNS, where_sql
        ))?;
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), node_from_row)?;
        let mut nodes = Vec::new();
        for node in rows {
            nodes.push(node?);
        }
        Ok(nodes)
    }

    /// Count of records matching the predicate.
    pub fn count(&self, q: &NodeQuery) -> FeedResult<i64> {
        self.scalar(q, "COUNT(*)")
    }

    /// Sum of clientcount over records matching the predicate.
    pub fn sum_clients(&self, q: &NodeQuery) -> FeedResult<i64> {
        self.scalar(q, "COALESCE(SUM(clientcount), 0)")
    }

    fn scalar(&self, q: &NodeQuery, aggregate: &str) -> FeedResult<i64> {
        let (where_sql, params) = build_where(q);
        let conn = self.conn();
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let value = conn.query_row(
            &format!("SELECT {} FROM nodes{}", aggregate, where_sql),
            refs.as_slice(),
            |row| row.get(0),
        )?;
        Ok(value)
    }

    /// Shutdown sweep across every source, so a restart does not announce
    /// phantom presence flaps.
    pub fn mark_all_offline(&self) -> FeedResult<()> {
        let conn = self.conn();
        conn.execute("UPDATE nodes SET online = 0, clientcount = 0", [])?;
        Ok(())
    }

    /// Substring lookup over non-gateway nodes for the nodeinfo command.
    pub fn lookup(&self, name: &str) -> FeedResult<NodeLookup> {
        let matches = self.query(&NodeQuery {
            gateway: Some(GatewayFilter::NotGateway),
            name_like: Some(name.to_string()),
            ..NodeQuery::default()
        })?;

        if matches.len() <= 2 {
            return Ok(NodeLookup::Matches { nodes: matches });
        }
        let exact: Vec<Node> = matches
            .iter()
            .filter(|n| {
                n.hostname
                    .as_deref()
                    .is_some_and(|h| h.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect();
        if exact.is_empty() {
            Ok(NodeLookup::Ambiguous {
                count: matches.len(),
            })
        } else {
            Ok(NodeLookup::Matches { nodes: exact })
        }
    }

    /// Aggregate counts for the status summary.
    pub fn status_summary(&self) -> FeedResult<StatusSummary> {
        let non_gateway = NodeQuery {
            gateway: Some(GatewayFilter::NotGateway),
            ..NodeQuery::default()
        };
        let online_non_gateway = NodeQuery {
            online: Some(true),
            ..non_gateway.clone()
        };

        let summary = StatusSummary {
            gateways_online: self.count(&NodeQuery {
                gateway: Some(GatewayFilter::Gateway),
                online: Some(true),
                ..NodeQuery::default()
            })?,
            nodes_online: self.count(&online_non_gateway)?,
            clients_online: self.sum_clients(&online_non_gateway)?,
            nodes_total: self.count(&non_gateway)?,
            nodes_seen_14d: self.count(&NodeQuery {
                seen_since: Some(Utc::now() - chrono::Duration::days(14)),
                ..non_gateway.clone()
            })?,
            nodes_by_source: self.nodes_by_source()?,
        };
        Ok(summary)
    }

    fn nodes_by_source(&self) -> FeedResult<BTreeMap<String, i64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT source, COUNT(*) FROM nodes
             WHERE gateway = 0 OR gateway IS NULL GROUP BY source",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut by_source = BTreeMap::new();
        for row in rows {
            let (source, count): (String, i64) = row?;
            by_source.insert(source, count);
        }
        Ok(by_source)
    }

    // ── Highscores ─────────────────────────────────────────

    /// All highscore records, ordered by metric name.
    pub fn highscores(&self) -> FeedResult<Vec<Highscore>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT name, value, date FROM highscores ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok(Highscore {
                name: row.get(0)?,
                value: row.get(1)?,
                date: row.get(2)?,
            })
        })?;
        let mut scores = Vec::new();
        for score in rows {
            scores.push(score?);
        }
        Ok(scores)
    }

    /// Monotonic update: the stored record moves only when `value` strictly
    /// exceeds it. Returns the new record when it did, `None` otherwise.
    /// The record is created lazily at zero on first evaluation.
    pub fn update_highscore(&self, name: &str, value: i64) -> FeedResult<Option<Highscore>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT value FROM highscores WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let current = match current {
            Some(v) => v,
            None => {
                tx.execute(
                    "INSERT INTO highscores (name, value, date) VALUES (?1, 0, NULL)",
                    params![name],
                )?;
                0
            }
        };

        if value <= current {
            tx.commit()?;
            return Ok(None);
        }

        let now = Utc::now();
        tx.execute(
            "UPDATE highscores SET value = ?2, date = ?3 WHERE name = ?1",
            params![name, value, now],
        )?;
        tx.commit()?;
        Ok(Some(Highscore {
            name: name.to_string(),
            value,
            date: Some(now),
        }))
    }
}

const NODE_COLUMNS: &str = "id, node_id, mac, hostname, lat, lon, hardware, contact, \
     autoupdate, branch, firmware_base, firmware_release, firstseen, lastseen, \
     online, gateway, clientcount, source";

fn node_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        node_id: row.get(1)?,
        mac: row.get(2)?,
        hostname: row.get(3)?,
        lat: row.get(4)?,
        lon: row.get(5)?,
        hardware: row.get(6)?,
        contact: row.get(7)?,
        autoupdate: row.get(8)?,
        branch: row.get(9)?,
        firmware_base: row.get(10)?,
        firmware_release: row.get(11)?,
        firstseen: row.get(12)?,
        lastseen: row.get(13)?,
        online: row.get(14)?,
        gateway: row.get(15)?,
        clientcount: row.get(16)?,
        source: row.get(17)?,
    })
}

fn get_in(conn: &Connection, id: &str) -> rusqlite::Result<Option<Node>> {
    conn.query_row(
        &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
        params![id],
        node_from_row,
    )
    .optional()
}

fn save_in(conn: &Connection, node: &Node) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO nodes (id, node_id, mac, hostname, lat, lon, hardware, \
         contact, autoupdate, branch, firmware_base, firmware_release, firstseen, \
         lastseen, online, gateway, clientcount, source) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            node.id,
            node.node_id,
            node.mac,
            node.hostname,
            node.lat,
            node.lon,
            node.hardware,
            node.contact,
            node.autoupdate,
            node.branch,
            node.firmware_base,
            node.firmware_release,
            node.firstseen,
            node.lastseen,
            node.online,
            node.gateway,
            node.clientcount,
            node.source,
        ],
    )?;
    Ok(())
}

fn build_where(q: &NodeQuery) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<&str> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    match q.gateway {
        Some(GatewayFilter::Gateway) => clauses.push("gateway = 1"),
        Some(GatewayFilter::NotGateway) => clauses.push("(gateway = 0 OR gateway IS NULL)"),
        None => {}
    }
    if let Some(online) = q.online {
        clauses.push("online = ?");
        params.push(Box::new(online));
    }
    if let Some(source) = &q.source {
        clauses.push("source = ?");
        params.push(Box::new(source.clone()));
    }
    if let Some(name) = &q.name_like {
        clauses.push("hostname LIKE '%' || ? || '%'");
        params.push(Box::new(name.clone()));
    }
    if let Some(since) = q.seen_since {
        clauses.push("lastseen > ?");
        params.push(Box::new(since));
    }

    if clauses.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), params)
    }
}
