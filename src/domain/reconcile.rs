//! Reconciliation engine — one fetch/parse/merge/diff pass per feed tick.
//!
//! Each feed source owns a `FeedContext` carrying its cross-tick state
//! (cache validator, de-duplicated error, bootstrap flag). A tick never
//! takes the registry transaction across the network fetch: the body is
//! fully downloaded and parsed before the merge transaction opens.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{IF_MODIFIED_SINCE, LAST_MODIFIED, USER_AGENT};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use crate::config::FeedConfig;
use crate::error::{FeedError, FeedResult};

use super::events::{Event, EventSink, Notifier};
use super::geo;
use super::node::{diff, Node, NodeField};
use super::parser::{normalize_addr, parse_feed};
use super::registry::{GatewayFilter, NodeQuery, Registry};

const AGENT: &str = concat!("meshmon/", env!("CARGO_PKG_VERSION"));

/// Per-feed cross-tick state. Reset on process restart.
pub struct FeedContext {
    pub feed: FeedConfig,
    /// Last-Modified token from the previous successful cycle.
    last_modified: Option<String>,
    /// Last reported error message, for de-duplicated alerting.
    last_error: Option<String>,
    /// True until the first snapshot has been absorbed.
    initial: bool,
}

impl FeedContext {
    pub fn new(feed: FeedConfig) -> Self {
        Self {
            feed,
            last_modified: None,
            last_error: None,
            initial: true,
        }
    }
}

enum CycleReport {
    /// 304: the upstream payload has not changed, nothing to do.
    NotModified,
    Completed { events: Vec<Event> },
}

pub struct Engine {
    registry: Arc<Registry>,
    notifier: Notifier,
    sink: Arc<dyn EventSink>,
    http: reqwest::Client,
    skip_nodes: HashSet<String>,
    ignore_fields: HashSet<String>,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        notifier: Notifier,
        sink: Arc<dyn EventSink>,
        fetch_timeout: Duration,
        skip_nodes: &[String],
        ignore_fields: &[String],
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            registry,
            notifier,
            sink,
            http,
            skip_nodes: skip_nodes.iter().map(|s| normalize_addr(s)).collect(),
            ignore_fields: ignore_fields.iter().cloned().collect(),
        })
    }

    /// Run one reconciliation cycle. Failures are downgraded to reported
    /// error events; the scheduling loop never sees them.
    pub async fn tick(&self, ctx: &mut FeedContext) {
        match self.run_cycle(ctx).await {
            Ok(CycleReport::NotModified) => {
                debug!(feed = %ctx.feed.name, "feed not modified");
            }
            Ok(CycleReport::Completed { events }) => {
                if ctx.last_error.take().is_some() {
                    self.emit(&Event::FeedRecovered {
                        feed: ctx.feed.name.clone(),
                    });
                }
                for event in &events {
                    self.emit(event);
                }
            }
            Err(err) => self.report_error(ctx, err.to_string()),
        }
    }

    async fn run_cycle(&self, ctx: &mut FeedContext) -> FeedResult<CycleReport> {
        // FETCHING: conditional GET against the previous cycle's validator.
        let mut request = self.http.get(&ctx.feed.url).header(USER_AGENT, AGENT);
        if let Some(token) = &ctx.last_modified {
            request = request.header(IF_MODIFIED_SINCE, token);
        }
        let response = request.send().await.map_err(fetch_error)?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(CycleReport::NotModified);
        }
        if response.status() != StatusCode::OK {
            return Err(FeedError::HttpStatus(response.status().as_u16()));
        }
        let last_modified = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(fetch_error)?;

        // PARSING
        let patches = parse_feed(&body, ctx.feed.format, &ctx.feed.name, &self.skip_nodes)?;

        // The validator only advances once the payload proved usable.
        if let Some(token) = last_modified {
            ctx.last_modified = Some(token);
        }

        // MERGING: sweep + upserts, one transaction.
        let outcome = self.registry.apply_cycle(&ctx.feed.name, &patches)?;

        if ctx.initial {
            // Bootstrap absorbs state silently and skips highscores.
            ctx.initial = false;
            info!(feed = %ctx.feed.name, nodes = patches.len(), "bootstrap cycle absorbed");
            return Ok(CycleReport::Completed { events: Vec::new() });
        }

        debug!(
            feed = %ctx.feed.name,
            nodes = patches.len(),
            created = outcome.created.len(),
            changed = outcome.changed.len(),
            "cycle merged"
        );

        // DIFFING: arrivals first, then records, then per-field churn.
        let mut events = Vec::new();
        for node in &outcome.created {
            let summary = node.summary();
            if node.gateway == Some(true) {
                events.push(Event::NewGateway { summary });
            } else {
                events.push(Event::NewNode { summary });
            }
        }

        self.check_highscores(&mut events)?;

        for (before, after) in &outcome.changed {
            self.diff_events(before, after, &mut events);
        }

        Ok(CycleReport::Completed { events })
    }

    /// Classify one record's field changes into events. Latitude and
    /// longitude changes coalesce into a single position event.
    fn diff_events(&self, before: &Node, after: &Node, events: &mut Vec<Event>) {
        let mut position_handled = false;
        for change in diff(before, after) {
            if self.ignore_fields.contains(change.field.name()) {
                continue;
            }
            match change.field {
                NodeField::Online => events.push(Event::Presence {
                    name: after.name().to_string(),
                    online: after.online,
                }),
                NodeField::Lat | NodeField::Lon => {
                    if position_handled {
                        continue;
                    }
                    position_handled = true;
                    let old_known = before.lat.is_some() && before.lon.is_some();
                    let new_known = after.lat.is_some() && after.lon.is_some();
                    let name = after.name().to_string();
                    if old_known && new_known {
                        events.push(Event::Moved {
                            name,
                            node_id: after.node_id.clone(),
                            meters: geo::distance(before.lat, before.lon, after.lat, after.lon),
                        });
                    } else if new_known {
                        events.push(Event::PositionAcquired {
                            name,
                            node_id: after.node_id.clone(),
                        });
                    } else if old_known {
                        events.push(Event::PositionLost { name });
                    }
                    // Neither pair fully known: no position event at all.
                }
                field => events.push(Event::FieldChanged {
                    name: after.name().to_string(),
                    field: field.name(),
                    old: change.old,
                    new: change.new,
                }),
            }
        }
    }

    /// Re-evaluate the tracked aggregate metrics against their records.
    fn check_highscores(&self, events: &mut Vec<Event>) -> FeedResult<()> {
        let online_non_gateway = NodeQuery {
            gateway: Some(GatewayFilter::NotGateway),
            online: Some(true),
            ..NodeQuery::default()
        };
        let metrics = [
            (
                "gateways",
                self.registry.count(&NodeQuery {
                    gateway: Some(GatewayFilter::Gateway),
                    online: Some(true),
                    ..NodeQuery::default()
                })?,
            ),
            ("nodes", self.registry.count(&online_non_gateway)?),
            ("clients", self.registry.sum_clients(&online_non_gateway)?),
        ];
        for (metric, value) in metrics {
            if let Some(score) = self.registry.update_highscore(metric, value)? {
                events.push(Event::NewHighscore {
                    metric: score.name,
                    value: score.value,
                });
            }
        }
        Ok(())
    }

    fn emit(&self, event: &Event) {
        self.sink.deliver(&self.notifier.render(event));
    }

    /// Report a cycle failure, suppressing consecutive identical messages.
    fn report_error(&self, ctx: &mut FeedContext, message: String) {
        warn!(feed = %ctx.feed.name, error = %message, "reconciliation cycle failed");
        if ctx.last_error.as_deref() == Some(message.as_str()) {
            return;
        }
        ctx.last_error = Some(message.clone());
        self.emit(&Event::FeedFailure {
            feed: ctx.feed.name.clone(),
            message,
        });
    }
}

fn fetch_error(err: reqwest::Error) -> FeedError {
    if err.is_timeout() {
        FeedError::Fetch("timeout".to_string())
    } else if err.is_connect() {
        FeedError::Fetch("connection error".to_string())
    } else {
        FeedError::Fetch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventBuffer;
    use crate::domain::node::NodePatch;
    use crate::domain::parser::FeedFormat;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

    /// wiremock's `header` matcher splits request values on commas, so it
    /// can never match an HTTP-date validator; compare the raw value instead.
    struct RawHeader(&'static str, &'static str);

    impl Match for RawHeader {
        fn matches(&self, request: &Request) -> bool {
            request.headers.get(self.0).and_then(|v| v.to_str().ok()) == Some(self.1)
        }
    }

    fn test_engine(
        skip: &[String],
        ignore: &[String],
    ) -> (Engine, Arc<Registry>, Arc<EventBuffer>) {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let buffer = Arc::new(EventBuffer::new(64));
        let engine = Engine::new(
            registry.clone(),
            Notifier::new(None),
            buffer.clone() as Arc<dyn EventSink>,
            Duration::from_secs(5),
            skip,
            ignore,
        )
        .unwrap();
        (engine, registry, buffer)
    }

    fn feed_ctx(server: &MockServer, format: FeedFormat) -> FeedContext {
        FeedContext::new(FeedConfig {
            name: "nodes.json".to_string(),
            url: format!("{}/nodes.json", server.uri()),
            format,
        })
    }

    fn texts(buffer: &EventBuffer) -> Vec<String> {
        buffer.recent().into_iter().map(|n| n.text).collect()
    }

    async fn mount_body(server: &MockServer, body: &str) {
        Mock::given(method("GET"))
            .and(path("/nodes.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn bootstrap_is_silent_then_changes_are_announced() {
        let server = MockServer::start().await;
        let (engine, registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Alfred);

        mount_body(
            &server,
            r#"{"aa:bb:cc:dd:ee:ff": {"hostname": "node1", "clients": {"total": 3}}}"#,
        )
        .await;
        engine.tick(&mut ctx).await;

        assert!(texts(&buffer).is_empty(), "bootstrap must be silent");
        let node = registry.get("aabbccddeeff").unwrap().unwrap();
        assert!(node.online);
        assert_eq!(node.clientcount, 3);
        assert_eq!(node.hostname.as_deref(), Some("node1"));

        server.reset().await;
        mount_body(
            &server,
            r#"{"aa:bb:cc:dd:ee:ff": {"hostname": "node1", "clients": {"total": 5}}}"#,
        )
        .await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(
            msgs,
            vec!["Node node1 changed clientcount from 3 to 5".to_string()]
        );
    }

    #[tokio::test]
    async fn absent_node_goes_offline_with_presence_event_only() {
        let server = MockServer::start().await;
        let (engine, registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Meshviewer);

        mount_body(
            &server,
            r#"{"nodes": {"c04a00e44ab6": {
                "flags": {"online": true},
                "nodeinfo": {
                    "hostname": "wanderer",
                    "location": {"latitude": 50.0, "longitude": 10.0}
                }
            }}}"#,
        )
        .await;
        engine.tick(&mut ctx).await;
        assert!(texts(&buffer).is_empty());

        server.reset().await;
        mount_body(&server, r#"{"nodes": {}}"#).await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(msgs, vec!["Node wanderer is now offline".to_string()]);

        // Position survives the sweep untouched.
        let node = registry.get("c04a00e44ab6").unwrap().unwrap();
        assert!(!node.online);
        assert_eq!(node.lat, Some(50.0));
        assert_eq!(node.lon, Some(10.0));
    }

    #[tokio::test]
    async fn not_modified_short_circuits() {
        let server = MockServer::start().await;
        let (engine, registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Alfred);

        Mock::given(method("GET"))
            .and(path("/nodes.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Thu, 01 Jan 2015 00:00:00 GMT")
                    .set_body_string(
                        r#"{"aa:bb:cc:dd:ee:ff": {"hostname": "node1", "clients": {"total": 3}}}"#,
                    ),
            )
            .mount(&server)
            .await;
        engine.tick(&mut ctx).await;

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/nodes.json"))
            .and(RawHeader("if-modified-since", "Thu, 01 Jan 2015 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        engine.tick(&mut ctx).await;

        // No sweep ran: the node is still online with its client count.
        let node = registry.get("aabbccddeeff").unwrap().unwrap();
        assert!(node.online);
        assert_eq!(node.clientcount, 3);
        assert!(texts(&buffer).is_empty());
        assert!(registry.highscores().unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_errors_reported_once_then_recovery() {
        let server = MockServer::start().await;
        let (engine, _registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Alfred);

        mount_body(&server, r#"{}"#).await;
        engine.tick(&mut ctx).await;

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/nodes.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        engine.tick(&mut ctx).await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(msgs.len(), 1, "identical errors must be de-duplicated");
        assert!(msgs[0].contains("[ERROR]"));
        assert!(msgs[0].contains("500"));

        server.reset().await;
        mount_body(&server, r#"{}"#).await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].contains("everything back to normal"));
    }

    #[tokio::test]
    async fn malformed_payload_fails_the_cycle_not_the_loop() {
        let server = MockServer::start().await;
        let (engine, registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Alfred);

        mount_body(
            &server,
            r#"{"aa:bb:cc:dd:ee:ff": {"clients": {"total": 3}}}"#,
        )
        .await;
        engine.tick(&mut ctx).await;

        server.reset().await;
        mount_body(&server, "{definitely not json").await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].contains("[ERROR]"));
        // Prior committed state stays authoritative.
        let node = registry.get("aabbccddeeff").unwrap().unwrap();
        assert!(node.online);
        assert_eq!(node.clientcount, 3);
    }

    #[tokio::test]
    async fn new_gateway_and_highscores_are_announced_in_order() {
        let server = MockServer::start().await;
        let (engine, _registry, buffer) = test_engine(&[], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Meshviewer);

        mount_body(
            &server,
            r#"{"nodes": {"aaaa00000001": {
                "flags": {"online": true},
                "nodeinfo": {"hostname": "plain"}
            }}}"#,
        )
        .await;
        engine.tick(&mut ctx).await;
        assert!(texts(&buffer).is_empty());

        server.reset().await;
        mount_body(
            &server,
            r#"{"nodes": {
                "aaaa00000001": {"flags": {"online": true}, "nodeinfo": {"hostname": "plain"}},
                "bbbb00000001": {"flags": {"online": true, "gateway": true}, "nodeinfo": {"hostname": "gw1"}}
            }}"#,
        )
        .await;
        engine.tick(&mut ctx).await;

        let msgs = texts(&buffer);
        assert_eq!(
            msgs,
            vec![
                "New gateway: gw1".to_string(),
                "New highscore: 1 Gateways".to_string(),
                "New highscore: 1 Nodes".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn skip_list_excludes_configured_identities() {
        let server = MockServer::start().await;
        let (engine, registry, _buffer) =
            test_engine(&["c0:4a:00:e4:4a:b6".to_string()], &[]);
        let mut ctx = feed_ctx(&server, FeedFormat::Meshviewer);

        mount_body(
            &server,
            r#"{"nodes": {
                "c04a00e44ab6": {"flags": {"online": true}},
                "deadbeef0001": {"flags": {"online": true}}
            }}"#,
        )
        .await;
        engine.tick(&mut ctx).await;

        assert!(registry.get("c04a00e44ab6").unwrap().is_none());
        assert!(registry.get("deadbeef0001").unwrap().is_some());
    }

    // ── diff classification, no network involved ───────────

    fn stored(id: &str, lat: Option<f64>, lon: Option<f64>) -> Node {
        let patch = NodePatch {
            id: id.to_string(),
            source: "nodes.json".to_string(),
            hostname: Some("wanderer".to_string()),
            lat,
            lon,
            online: Some(true),
            ..NodePatch::default()
        };
        Node::from_patch(&patch, Utc::now())
    }

    #[test]
    fn coordinate_changes_coalesce_into_one_movement_event() {
        let (engine, _registry, _buffer) = test_engine(&[], &[]);
        let before = stored("n1", Some(50.0), Some(10.0));
        let mut after = before.clone();
        after.lat = Some(50.01);
        after.lon = Some(10.01);

        let mut events = Vec::new();
        engine.diff_events(&before, &after, &mut events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Moved { meters, .. } => assert!(*meters > 1000.0 && *meters < 2000.0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn position_acquired_and_lost() {
        let (engine, _registry, _buffer) = test_engine(&[], &[]);

        let before = stored("n1", None, None);
        let after = stored("n1", Some(50.0), Some(10.0));
        let mut events = Vec::new();
        engine.diff_events(&before, &after, &mut events);
        assert!(matches!(events.as_slice(), [Event::PositionAcquired { .. }]));

        let mut events = Vec::new();
        engine.diff_events(&after, &before, &mut events);
        assert!(matches!(events.as_slice(), [Event::PositionLost { .. }]));
    }

    #[test]
    fn incomplete_coordinates_produce_no_position_event() {
        let (engine, _registry, _buffer) = test_engine(&[], &[]);
        // Latitude-only before and after: never a full pair on either side.
        let before = stored("n1", Some(50.0), None);
        let after = stored("n1", Some(51.0), None);
        let mut events = Vec::new();
        engine.diff_events(&before, &after, &mut events);
        assert!(events.is_empty());
    }

    #[test]
    fn ignore_list_suppresses_field_events() {
        let (engine, _registry, _buffer) = test_engine(&[], &["clientcount".to_string()]);
        let before = stored("n1", None, None);
        let mut after = before.clone();
        after.clientcount = 9;
        let mut events = Vec::new();
        engine.diff_events(&before, &after, &mut events);
        assert!(events.is_empty());
    }
}
