//! Topic+scope pub/sub. Both the filestore (file-change events) and the
//! block controller (status events) publish through here; subscribers are
//! opaque [`Route`] callbacks.
//!
//! Matching happens under `state`'s mutex; the actual `send_event` calls
//! happen after releasing it, so one slow subscriber cannot stall the match
//! phase of other publishers (sends themselves remain sequential — see
//! `SPEC_FULL.md` §5 for the ordering guarantees this buys and doesn't buy).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use uuid::Uuid;

const MAX_HISTORY: usize = 4096;

pub type RouteId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Append,
    Truncate,
}

/// One event flowing through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerEvent {
    pub event: String,
    pub scopes: Vec<String>,
    pub sender: Option<RouteId>,
    pub persist: u32,
    pub data: Json,
}

impl BrokerEvent {
    pub fn file_change(zone_id: &str, name: &str, fileop: FileOp) -> Self {
        BrokerEvent {
            event: "blockfile".to_string(),
            scopes: vec![zone_id.to_string()],
            sender: None,
            persist: 0,
            data: serde_json::json!({
                "zoneId": zone_id,
                "fileName": name,
                "fileop": fileop,
            }),
        }
    }

    pub fn controller_status(block_id: &str, version: u64, status: Json) -> Self {
        let mut data = status;
        if let Some(obj) = data.as_object_mut() {
            obj.insert("blockId".into(), Json::from(block_id));
            obj.insert("version".into(), Json::from(version));
        }
        BrokerEvent {
            event: "controllerstatus".to_string(),
            scopes: vec![block_id.to_string()],
            sender: None,
            persist: 0,
            data,
        }
    }
}

/// A subscriber endpoint. Implementations must not block indefinitely —
/// `publish` calls this synchronously, outside the broker's lock but still
/// on the publisher's own thread.
pub trait Route: Send + Sync {
    fn send_event(&self, route_id: RouteId, event: &BrokerEvent);
}

/// An in-memory route backed by a bounded channel, used by tests and any
/// in-process consumer. Wiring a real websocket on top of this is an outer
/// concern.
pub struct ChannelRoute {
    sender: crossbeam_channel::Sender<BrokerEvent>,
}

impl ChannelRoute {
    pub fn new(capacity: usize) -> (Self, crossbeam_channel::Receiver<BrokerEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        (ChannelRoute { sender: tx }, rx)
    }
}

impl Route for ChannelRoute {
    fn send_event(&self, _route_id: RouteId, event: &BrokerEvent) {
        // an unresponsive subscriber drops events rather than blocking the
        // publisher indefinitely.
        let _ = self.sender.try_send(event.clone());
    }
}

pub struct SubscriptionRequest {
    pub event: String,
    pub scopes: Vec<String>,
    pub all_scopes: bool,
}

#[derive(Default)]
struct EventTables {
    all_subs: HashSet<RouteId>,
    scope_subs: HashMap<String, HashSet<RouteId>>,
    star_subs: HashMap<String, HashSet<RouteId>>,
    history: HashMap<String, VecDeque<BrokerEvent>>,
}

struct State {
    events: HashMap<String, EventTables>,
    routes: HashMap<RouteId, Arc<dyn Route>>,
}

/// Topic+scope pub/sub broker.
pub struct Broker {
    state: Mutex<State>,
}

impl Broker {
    pub fn new() -> Self {
        Broker { state: Mutex::new(State { events: HashMap::new(), routes: HashMap::new() }) }
    }

    pub fn register_route(&self, route: Arc<dyn Route>) -> RouteId {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().routes.insert(id, route);
        id
    }

    pub fn unregister_route(&self, route_id: RouteId) {
        let mut state = self.state.lock().unwrap();
        state.routes.remove(&route_id);
        for tables in state.events.values_mut() {
            tables.all_subs.remove(&route_id);
            for subs in tables.scope_subs.values_mut() {
                subs.remove(&route_id);
            }
            for subs in tables.star_subs.values_mut() {
                subs.remove(&route_id);
            }
        }
    }

    pub fn subscribe(&self, route_id: RouteId, req: SubscriptionRequest) {
        let mut state = self.state.lock().unwrap();
        let tables = state.events.entry(req.event).or_default();
        if req.all_scopes {
            tables.all_subs.insert(route_id);
            return;
        }
        for scope in req.scopes {
            if scope.contains('*') {
                tables.star_subs.entry(scope).or_default().insert(route_id);
            } else {
                tables.scope_subs.entry(scope).or_default().insert(route_id);
            }
        }
    }

    pub fn publish(&self, event: BrokerEvent) {
        let (matched, route_arcs): (Vec<RouteId>, HashMap<RouteId, Arc<dyn Route>>) = {
            let mut state = self.state.lock().unwrap();
            let mut matched: HashSet<RouteId> = HashSet::new();
            if let Some(tables) = state.events.get(&event.event) {
                matched.extend(tables.all_subs.iter().copied());
                for scope in &event.scopes {
                    if let Some(subs) = tables.scope_subs.get(scope) {
                        matched.extend(subs.iter().copied());
                    }
                    for (pattern, subs) in &tables.star_subs {
                        if scope_matches(pattern, scope) {
                            matched.extend(subs.iter().copied());
                        }
                    }
                }
            }

            if event.persist > 0 {
                let tables = state.events.entry(event.event.clone()).or_default();
                let cap = (event.persist as usize).min(MAX_HISTORY);
                push_history(tables, "", &event, cap);
                for scope in &event.scopes {
                    push_history(tables, scope, &event, cap);
                }
            }

            let route_arcs: HashMap<RouteId, Arc<dyn Route>> = matched
                .iter()
                .filter_map(|id| state.routes.get(id).map(|r| (*id, r.clone())))
                .collect();
            (matched.into_iter().collect(), route_arcs)
        };

        for route_id in matched {
            if let Some(route) = route_arcs.get(&route_id) {
                route.send_event(route_id, &event);
            }
        }
    }

    pub fn read_event_history(&self, event_name: &str, scope: &str, max_items: usize) -> Vec<BrokerEvent> {
        let state = self.state.lock().unwrap();
        match state.events.get(event_name).and_then(|t| t.history.get(scope)) {
            Some(ring) => {
                let len = ring.len();
                let skip = len.saturating_sub(max_items);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

fn push_history(tables: &mut EventTables, key: &str, event: &BrokerEvent, cap: usize) {
    let ring = tables.history.entry(key.to_string()).or_default();
    ring.push_back(event.clone());
    while ring.len() > cap {
        ring.pop_front();
    }
}

/// `:`-separated segment match with `*` (one segment) and `**` (zero or more
/// segments) wildcards in `pattern` against a literal `scope`.
fn scope_matches(pattern: &str, scope: &str) -> bool {
    let pat: Vec<&str> = pattern.split(':').collect();
    let seg: Vec<&str> = scope.split(':').collect();
    matches_segments(&pat, &seg)
}

fn matches_segments(pat: &[&str], seg: &[&str]) -> bool {
    match pat.first() {
        None => seg.is_empty(),
        Some(&"**") => {
            if pat.len() == 1 {
                return true;
            }
            (0..=seg.len()).any(|i| matches_segments(&pat[1..], &seg[i..]))
        }
        Some(&"*") => !seg.is_empty() && matches_segments(&pat[1..], &seg[1..]),
        Some(p) => !seg.is_empty() && seg[0] == *p && matches_segments(&pat[1..], &seg[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRoute(Arc<AtomicUsize>);
    impl Route for CountingRoute {
        fn send_event(&self, _route_id: RouteId, _event: &BrokerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn exact_scope_match() {
        let broker = Broker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let route_id = broker.register_route(Arc::new(CountingRoute(count.clone())));
        broker.subscribe(
            route_id,
            SubscriptionRequest { event: "blockfile".into(), scopes: vec!["z1".into()], all_scopes: false },
        );
        broker.publish(BrokerEvent::file_change("z1", "term", FileOp::Append));
        broker.publish(BrokerEvent::file_change("z2", "term", FileOp::Append));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_star_matches_one_segment() {
        let broker = Broker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let route_id = broker.register_route(Arc::new(CountingRoute(count.clone())));
        broker.subscribe(
            route_id,
            SubscriptionRequest { event: "ev".into(), scopes: vec!["zone:*".into()], all_scopes: false },
        );
        broker.publish(BrokerEvent {
            event: "ev".into(),
            scopes: vec!["zone:a".into()],
            sender: None,
            persist: 0,
            data: Json::Null,
        });
        broker.publish(BrokerEvent {
            event: "ev".into(),
            scopes: vec!["zone:a:b".into()],
            sender: None,
            persist: 0,
            data: Json::Null,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wildcard_double_star_matches_any_depth() {
        let broker = Broker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let route_id = broker.register_route(Arc::new(CountingRoute(count.clone())));
        broker.subscribe(
            route_id,
            SubscriptionRequest { event: "ev".into(), scopes: vec!["zone:**".into()], all_scopes: false },
        );
        for scope in ["zone", "zone:a", "zone:a:b:c"] {
            broker.publish(BrokerEvent {
                event: "ev".into(),
                scopes: vec![scope.into()],
                sender: None,
                persist: 0,
                data: Json::Null,
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn history_ring_keeps_newest_and_respects_cap() {
        let broker = Broker::new();
        for i in 0..10 {
            broker.publish(BrokerEvent {
                event: "ev".into(),
                scopes: vec!["z1".into()],
                sender: None,
                persist: 3,
                data: Json::from(i),
            });
        }
        let hist = broker.read_event_history("ev", "z1", 10);
        assert_eq!(hist.len(), 3);
        let values: Vec<i64> = hist.iter().map(|e| e.data.as_i64().unwrap()).collect();
        assert_eq!(values, vec![7, 8, 9]);
    }

    #[test]
    fn unregister_stops_delivery() {
        let broker = Broker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let route_id = broker.register_route(Arc::new(CountingRoute(count.clone())));
        broker.subscribe(
            route_id,
            SubscriptionRequest { event: "ev".into(), scopes: vec![], all_scopes: true },
        );
        broker.publish(BrokerEvent { event: "ev".into(), scopes: vec![], sender: None, persist: 0, data: Json::Null });
        broker.unregister_route(route_id);
        broker.publish(BrokerEvent { event: "ev".into(), scopes: vec![], sender: None, persist: 0, data: Json::Null });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
