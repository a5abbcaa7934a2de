//! Event routing for unsolicited messages
//!
//! Messages that arrive without a correlation identifier are handed to an
//! [`EventRouter`], which fans them out to subscriptions keyed either by an
//! exact topic or by a regular expression. The topic is the body's `type`
//! field; `path` is a secondary key.
//!
//! Dispatch order for one message:
//! 1. every pattern subscription matching `type` or `path`, in registration order
//! 2. every exact subscription on `type` (or on `path` when `type` has none),
//!    in registration order

use crate::error::Result;
use crate::messages::event_body;

use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Action run for each matching unsolicited message; receives the message body
pub type EventAction = Arc<dyn Fn(&Value) + Send + Sync>;

/// What a subscription listens for
#[derive(Debug, Clone)]
pub enum MatchKey {
    /// Exact match on the `type` (or `path`) field
    Topic(String),
    /// Regular expression tested against `type` and `path`
    Pattern(Regex),
}

impl MatchKey {
    /// Compile a pattern key
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(MatchKey::Pattern(Regex::new(pattern)?))
    }

    fn kind(&self) -> &'static str {
        match self {
            MatchKey::Topic(_) => "topic",
            MatchKey::Pattern(_) => "pattern",
        }
    }
}

impl std::fmt::Display for MatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchKey::Topic(topic) => f.write_str(topic),
            MatchKey::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<&str> for MatchKey {
    fn from(topic: &str) -> Self {
        MatchKey::Topic(topic.to_string())
    }
}

impl From<String> for MatchKey {
    fn from(topic: String) -> Self {
        MatchKey::Topic(topic)
    }
}

impl From<Regex> for MatchKey {
    fn from(re: Regex) -> Self {
        MatchKey::Pattern(re)
    }
}

struct Entry {
    id: u64,
    action: EventAction,
}

struct PatternEntry {
    id: u64,
    pattern: Regex,
    action: EventAction,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Vec<Entry>>,
    patterns: Vec<PatternEntry>,
}

struct RouterInner {
    registry: RwLock<Registry>,
    enabled: AtomicBool,
    debug: AtomicBool,
    next_id: AtomicU64,
}

/// Registry of subscriptions for unsolicited messages.
///
/// Cheaply cloneable; clones share the same registry.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: RwLock::new(Registry::default()),
                enabled: AtomicBool::new(true),
                debug: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Log every update this router receives
    pub fn set_debug(&self, debug: bool) {
        self.inner.debug.store(debug, Ordering::Relaxed);
    }

    /// Resume dispatch after [`disable`](Self::disable)
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Suppress all dispatch without removing subscriptions
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Register `action` for messages matching `key`.
    ///
    /// The subscription is active immediately and stays registered until
    /// [`Subscription::stop`] is called; dropping the handle does not stop it.
    pub fn subscribe<F>(&self, key: impl Into<MatchKey>, action: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let key = key.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let action: EventAction = Arc::new(action);

        self.inner.registry.write().insert(id, &key, action.clone());
        debug!(key = %key, kind = key.kind(), subscription = id, "Subscribed");

        Subscription {
            id,
            key,
            action,
            router: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Dispatch one unsolicited message, returning how many actions ran
    pub fn update(&self, message: &Value) -> usize {
        if self.inner.debug.load(Ordering::Relaxed) {
            debug!(message = %message, "Unsolicited message");
        }
        if !self.is_enabled() {
            return 0;
        }

        let body = event_body(message);
        let kind = body.get("type").and_then(Value::as_str);
        let path = body.get("path").and_then(Value::as_str);

        // Snapshot under the lock so actions may subscribe or stop freely
        let actions: Vec<EventAction> = {
            let registry = self.inner.registry.read();

            let matched = registry
                .patterns
                .iter()
                .filter(|entry| {
                    kind.is_some_and(|k| entry.pattern.is_match(k))
                        || path.is_some_and(|p| entry.pattern.is_match(p))
                })
                .map(|entry| entry.action.clone());

            let exact = [kind, path]
                .into_iter()
                .flatten()
                .filter_map(|key| registry.topics.get(key))
                .find(|entries| !entries.is_empty())
                .into_iter()
                .flatten()
                .map(|entry| entry.action.clone());

            let collected: Vec<EventAction> = matched.chain(exact).collect();
            collected
        };

        let mut ran = 0;
        for action in actions {
            match catch_unwind(AssertUnwindSafe(|| action(body))) {
                Ok(()) => ran += 1,
                Err(_) => warn!(event_type = ?kind, path = ?path, "Subscription action panicked"),
            }
        }
        ran
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        let registry = self.inner.registry.read();
        registry.patterns.len() + registry.topics.values().map(Vec::len).sum::<usize>()
    }
}

impl Registry {
    /// Append at the end of the key's container
    fn insert(&mut self, id: u64, key: &MatchKey, action: EventAction) {
        match key {
            MatchKey::Topic(topic) => self
                .topics
                .entry(topic.clone())
                .or_default()
                .push(Entry { id, action }),
            MatchKey::Pattern(pattern) => self.patterns.push(PatternEntry {
                id,
                pattern: pattern.clone(),
                action,
            }),
        }
    }

    fn remove(&mut self, id: u64, key: &MatchKey) -> bool {
        match key {
            MatchKey::Topic(topic) => {
                let Some(entries) = self.topics.get_mut(topic) else {
                    return false;
                };
                let before = entries.len();
                entries.retain(|entry| entry.id != id);
                let removed = entries.len() != before;
                if entries.is_empty() {
                    self.topics.remove(topic);
                }
                removed
            }
            MatchKey::Pattern(_) => {
                let before = self.patterns.len();
                self.patterns.retain(|entry| entry.id != id);
                self.patterns.len() != before
            }
        }
    }
}

/// Handle to a registered subscription
pub struct Subscription {
    id: u64,
    key: MatchKey,
    action: EventAction,
    router: Weak<RouterInner>,
    // Flipped under the registry write lock so it always agrees with it
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &MatchKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Re-register a stopped subscription with the same key and action, after
    /// every subscription currently in its container. Returns `false` if it
    /// was already active or the router is gone.
    pub fn start(&self) -> bool {
        let Some(router) = self.router.upgrade() else {
            return false;
        };

        let mut registry = router.registry.write();
        if self.active.swap(true, Ordering::SeqCst) {
            return false;
        }
        registry.insert(self.id, &self.key, self.action.clone());
        drop(registry);

        debug!(key = %self.key, subscription = self.id, "Subscription restarted");
        true
    }

    /// Deregister. Returns `false` if it was already stopped.
    pub fn stop(&self) -> bool {
        match self.router.upgrade() {
            Some(router) => {
                let mut registry = router.registry.write();
                if !self.active.swap(false, Ordering::SeqCst) {
                    return false;
                }
                registry.remove(self.id, &self.key);
            }
            None => {
                if !self.active.swap(false, Ordering::SeqCst) {
                    return false;
                }
            }
        }
        debug!(key = %self.key, subscription = self.id, "Subscription stopped");
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Box<dyn Fn(&Value) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &'static str| {
            let log = log_clone.clone();
            Box::new(move |_: &Value| log.lock().push(name.to_string())) as Box<dyn Fn(&Value) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn test_pattern_runs_before_exact() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        // Exact registered first; pattern must still run first
        let _e = router.subscribe("priceUpdate", make("exact"));
        let _p = router.subscribe(Regex::new("price.*").unwrap(), make("pattern"));

        let ran = router.update(&json!({"type": "priceUpdate", "path": "/nft/1"}));

        assert_eq!(ran, 2);
        assert_eq!(*log.lock(), vec!["pattern", "exact"]);
    }

    #[test]
    fn test_registration_order_within_topic() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let _a = router.subscribe("tick", make("a"));
        let _b = router.subscribe("tick", make("b"));
        let _c = router.subscribe("tick", make("c"));

        router.update(&json!({"type": "tick"}));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_pattern_matches_path() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let _p = router.subscribe(MatchKey::pattern("^/nft/").unwrap(), make("nft"));
        router.update(&json!({"type": "sale", "path": "/nft/9"}));
        router.update(&json!({"type": "sale", "path": "/user/9"}));

        assert_eq!(*log.lock(), vec!["nft"]);
    }

    #[test]
    fn test_exact_prefers_type_over_path() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let _t = router.subscribe("sale", make("type"));
        let _p = router.subscribe("/nft/1", make("path"));

        router.update(&json!({"type": "sale", "path": "/nft/1"}));
        router.update(&json!({"type": "other", "path": "/nft/1"}));

        assert_eq!(*log.lock(), vec!["type", "path"]);
    }

    #[test]
    fn test_body_envelope_is_unwrapped() {
        let router = EventRouter::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();

        let _s = router.subscribe("priceUpdate", move |body: &Value| {
            *seen_clone.lock() = Some(body.clone());
        });

        router.update(&json!({"body": {"type": "priceUpdate", "price": 3}}));
        assert_eq!(*seen.lock(), Some(json!({"type": "priceUpdate", "price": 3})));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let first = router.subscribe("tick", make("first"));
        let _second = router.subscribe("tick", make("second"));

        assert!(first.stop());
        assert!(!first.stop());
        assert!(!first.is_active());

        router.update(&json!({"type": "tick"}));
        assert_eq!(*log.lock(), vec!["second"]);
        assert_eq!(router.subscription_count(), 1);
    }

    #[test]
    fn test_stop_pattern_subscription() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let p = router.subscribe(MatchKey::pattern(".*").unwrap(), make("p"));
        p.stop();
        p.stop();

        assert_eq!(router.update(&json!({"type": "x"})), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_disable_suppresses_dispatch() {
        let router = EventRouter::new();
        let (log, make) = recorder();
        let _s = router.subscribe("tick", make("tick"));

        router.disable();
        assert_eq!(router.update(&json!({"type": "tick"})), 0);
        assert_eq!(router.subscription_count(), 1);

        router.enable();
        assert_eq!(router.update(&json!({"type": "tick"})), 1);
        assert_eq!(*log.lock(), vec!["tick"]);
    }

    #[test]
    fn test_panicking_action_is_isolated() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let _bad = router.subscribe(MatchKey::pattern("tick").unwrap(), |_: &Value| {
            panic!("action failure")
        });
        let _good = router.subscribe("tick", make("good"));

        let ran = router.update(&json!({"type": "tick"}));
        assert_eq!(ran, 1);
        assert_eq!(*log.lock(), vec!["good"]);
    }

    #[test]
    fn test_restart_rejoins_at_end() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let first = router.subscribe("tick", make("first"));
        let _second = router.subscribe("tick", make("second"));

        assert!(first.stop());
        assert!(first.start());
        assert!(first.is_active());

        let ran = router.update(&json!({"type": "tick"}));
        assert_eq!(ran, 2);
        assert_eq!(*log.lock(), vec!["second", "first"]);
    }

    #[test]
    fn test_start_while_active_is_noop() {
        let router = EventRouter::new();
        let (log, make) = recorder();

        let p = router.subscribe(MatchKey::pattern("^tick$").unwrap(), make("p"));
        assert!(!p.start());

        p.stop();
        assert!(p.start());
        assert!(!p.start());
        assert_eq!(router.subscription_count(), 1);

        router.update(&json!({"type": "tick"}));
        assert_eq!(*log.lock(), vec!["p"]);
    }

    #[test]
    fn test_start_after_router_dropped() {
        let router = EventRouter::new();
        let sub = router.subscribe("tick", |_: &Value| {});
        sub.stop();
        drop(router);

        assert!(!sub.start());
        assert!(!sub.is_active());
    }

    #[test]
    fn test_action_may_stop_itself() {
        let router = EventRouter::new();
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();

        let sub = router.subscribe("once", move |_: &Value| {
            if let Some(sub) = slot_clone.lock().as_ref() {
                sub.stop();
            }
        });
        *slot.lock() = Some(sub);

        assert_eq!(router.update(&json!({"type": "once"})), 1);
        assert_eq!(router.update(&json!({"type": "once"})), 0);
    }

    #[test]
    fn test_message_without_keys_runs_nothing() {
        let router = EventRouter::new();
        let (log, make) = recorder();
        let _s = router.subscribe(MatchKey::pattern(".*").unwrap(), make("any"));

        assert_eq!(router.update(&json!({"price": 1})), 0);
        assert_eq!(router.update(&json!([1, 2, 3])), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_match_key_display() {
        assert_eq!(MatchKey::from("tick").to_string(), "tick");
        assert_eq!(MatchKey::pattern("price.*").unwrap().to_string(), "/price.*/");
        assert!(MatchKey::pattern("(").is_err());
    }
}
