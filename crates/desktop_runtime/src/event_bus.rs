//! Synchronous publish/subscribe hub shared by every runtime component.
//!
//! Handlers for one event name run in subscription order on the calling thread. A handler that
//! returns an error or panics is logged and skipped; the remaining handlers still run.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

use desktop_app_contract::WindowId;
use platform_host::next_monotonic_timestamp_ms;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
/// One published event, as delivered to handlers and kept in the debug history.
pub struct BusEvent {
    pub sequence: u64,
    pub name: String,
    pub payload: Value,
    pub published_at_unix_ms: u64,
}

impl BusEvent {
    /// Deserializes the payload into a typed shape.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        serde_json::from_value(self.payload.clone()).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionToken(u64);

type EventHandler = Rc<dyn Fn(&BusEvent) -> Result<(), String>>;

struct Subscription {
    token: SubscriptionToken,
    owner: Option<WindowId>,
    handler: EventHandler,
}

struct BusState {
    next_token: u64,
    next_sequence: u64,
    subscriptions: HashMap<String, Vec<Subscription>>,
    /// Owners already cleaned up; window ids are never reused.
    retired_owners: HashSet<WindowId>,
    history: VecDeque<BusEvent>,
    history_capacity: usize,
}

impl BusState {
    fn remove_where(&mut self, mut predicate: impl FnMut(&Subscription) -> bool) -> usize {
        let mut removed = 0;
        for subscribers in self.subscriptions.values_mut() {
            let before = subscribers.len();
            subscribers.retain(|sub| !predicate(sub));
            removed += before - subscribers.len();
        }
        self.subscriptions
            .retain(|_, subscribers| !subscribers.is_empty());
        removed
    }

    fn is_active(&self, name: &str, token: SubscriptionToken) -> bool {
        self.subscriptions
            .get(name)
            .is_some_and(|subscribers| subscribers.iter().any(|sub| sub.token == token))
    }

    fn record(&mut self, event: BusEvent) {
        self.history.push_back(event);
        if self.history.len() > self.history_capacity {
            let overflow = self.history.len() - self.history_capacity;
            self.history.drain(0..overflow);
        }
    }
}

#[derive(Clone)]
/// Cheaply clonable handle to the shared bus.
pub struct EventBus {
    inner: Rc<RefCell<BusState>>,
}

impl EventBus {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BusState {
                next_token: 1,
                next_sequence: 1,
                subscriptions: HashMap::new(),
                retired_owners: HashSet::new(),
                history: VecDeque::new(),
                history_capacity: history_capacity.max(1),
            })),
        }
    }

    /// Registers `handler` for `name`. Subscriptions with an `owner` are dropped when that window
    /// closes.
    ///
    /// Subscribing on behalf of an owner that was already cleaned up registers nothing; the
    /// returned token is inert.
    pub fn subscribe<F>(
        &self,
        name: &str,
        owner: Option<WindowId>,
        handler: F,
    ) -> SubscriptionToken
    where
        F: Fn(&BusEvent) -> Result<(), String> + 'static,
    {
        let mut state = self.inner.borrow_mut();
        let token = SubscriptionToken(state.next_token);
        state.next_token += 1;
        if let Some(owner) = owner.filter(|owner| state.retired_owners.contains(owner)) {
            tracing::warn!("ignoring `{name}` subscription for closed window {owner}");
            return token;
        }
        state
            .subscriptions
            .entry(name.to_string())
            .or_default()
            .push(Subscription {
                token,
                owner,
                handler: Rc::new(handler),
            });
        token
    }

    /// Removes one subscription. Returns `false` when the token was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.inner
            .borrow_mut()
            .remove_where(|sub| sub.token == token)
            > 0
    }

    /// Removes every subscription owned by `owner` and returns how many were dropped. Later
    /// subscriptions for `owner` are refused.
    pub fn unsubscribe_owner(&self, owner: WindowId) -> usize {
        let removed = {
            let mut state = self.inner.borrow_mut();
            state.retired_owners.insert(owner);
            state.remove_where(|sub| sub.owner == Some(owner))
        };
        if removed > 0 {
            tracing::debug!("dropped {removed} subscription(s) owned by window {owner}");
        }
        removed
    }

    /// Delivers `payload` to every current subscriber of `name` and returns how many handlers ran.
    ///
    /// Publishing a name nobody subscribed to is a no-op apart from the history entry.
    pub fn publish(&self, name: &str, payload: Value) -> usize {
        let (event, targets) = {
            let mut state = self.inner.borrow_mut();
            let event = BusEvent {
                sequence: state.next_sequence,
                name: name.to_string(),
                payload,
                published_at_unix_ms: next_monotonic_timestamp_ms(),
            };
            state.next_sequence += 1;
            state.record(event.clone());
            let targets: Vec<(SubscriptionToken, EventHandler)> = state
                .subscriptions
                .get(name)
                .map(|subscribers| {
                    subscribers
                        .iter()
                        .map(|sub| (sub.token, sub.handler.clone()))
                        .collect()
                })
                .unwrap_or_default();
            (event, targets)
        };

        let mut invoked = 0;
        for (token, handler) in targets {
            // An earlier handler may have unsubscribed this one.
            if !self.inner.borrow().is_active(name, token) {
                continue;
            }
            invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!("handler {:?} for `{name}` failed: {err}", token);
                }
                Err(_) => {
                    tracing::warn!("handler {:?} for `{name}` panicked", token);
                }
            }
        }
        invoked
    }

    /// Serializes `payload` and publishes it. Serialization failures are logged and deliver nothing.
    pub fn publish_typed<T: Serialize>(&self, name: &str, payload: &T) -> usize {
        match serde_json::to_value(payload) {
            Ok(value) => self.publish(name, value),
            Err(err) => {
                tracing::warn!("dropping `{name}` event with unserializable payload: {err}");
                0
            }
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.inner
            .borrow()
            .subscriptions
            .get(name)
            .map_or(0, Vec::len)
    }

    /// Most recent events, oldest first. Inspection only; never replayed.
    pub fn recent_events(&self) -> Vec<BusEvent> {
        self.inner.borrow().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    type Handler = Box<dyn Fn(&BusEvent) -> Result<(), String>>;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) -> Handler) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |label: &str| {
                let log = log.clone();
                let label = label.to_string();
                Box::new(move |event: &BusEvent| {
                    log.borrow_mut().push(format!("{label}:{}", event.name));
                    Ok(())
                }) as Handler
            }
        };
        (log, make)
    }

    #[test]
    fn handlers_for_one_name_run_in_subscription_order() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        bus.subscribe("window:created", None, make("first"));
        bus.subscribe("window:created", None, make("second"));
        bus.subscribe("window:closed", None, make("other"));

        assert_eq!(bus.publish("window:created", Value::Null), 2);
        assert_eq!(
            *log.borrow(),
            vec![
                "first:window:created".to_string(),
                "second:window:created".to_string()
            ]
        );
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_block_later_handlers() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        bus.subscribe("tick", None, |_| Err("boom".to_string()));
        bus.subscribe("tick", None, |_| panic!("handler bug"));
        bus.subscribe("tick", None, make("survivor"));

        assert_eq!(bus.publish("tick", json!({})), 3);
        assert_eq!(*log.borrow(), vec!["survivor:tick".to_string()]);
    }

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        assert_eq!(bus.publish("nobody:listens", json!(1)), 0);

        let (log, make) = recorder();
        bus.subscribe("nobody:listens", None, make("late"));
        assert!(log.borrow().is_empty(), "no replay for late subscribers");
    }

    #[test]
    fn owner_cleanup_removes_only_that_windows_subscriptions() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        bus.subscribe("files:changed", Some(WindowId(1)), make("w1"));
        bus.subscribe("files:changed", Some(WindowId(2)), make("w2"));
        bus.subscribe("w1:only", Some(WindowId(1)), make("w1"));

        assert_eq!(bus.unsubscribe_owner(WindowId(1)), 2);
        assert_eq!(bus.publish("w1:only", Value::Null), 0);
        assert_eq!(bus.publish("files:changed", Value::Null), 1);
        assert_eq!(*log.borrow(), vec!["w2:files:changed".to_string()]);
    }

    #[test]
    fn subscriptions_for_a_cleaned_up_owner_are_refused() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        bus.unsubscribe_owner(WindowId(7));

        let token = bus.subscribe("files:changed", Some(WindowId(7)), make("late"));
        assert_eq!(bus.subscriber_count("files:changed"), 0);
        assert_eq!(bus.publish("files:changed", Value::Null), 0);
        assert!(!bus.unsubscribe(token));
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn unsubscribe_by_token_is_idempotent() {
        let bus = EventBus::new(8);
        let token = bus.subscribe("x", None, |_| Ok(()));
        assert!(bus.unsubscribe(token));
        assert!(!bus.unsubscribe(token));
        assert_eq!(bus.subscriber_count("x"), 0);
    }

    #[test]
    fn handler_unsubscribed_mid_delivery_is_skipped() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        let victim = Rc::new(RefCell::new(None));
        {
            let handle = bus.clone();
            let victim = victim.clone();
            bus.subscribe("x", None, move |_| {
                if let Some(token) = victim.borrow_mut().take() {
                    handle.unsubscribe(token);
                }
                Ok(())
            });
        }
        *victim.borrow_mut() = Some(bus.subscribe("x", None, make("victim")));

        assert_eq!(bus.publish("x", Value::Null), 1);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let bus = EventBus::new(8);
        let (log, make) = recorder();
        {
            let inner_bus = bus.clone();
            bus.subscribe("outer", None, move |_| {
                inner_bus.publish("inner", Value::Null);
                Ok(())
            });
        }
        bus.subscribe("inner", None, make("nested"));

        bus.publish("outer", Value::Null);
        assert_eq!(*log.borrow(), vec!["nested:inner".to_string()]);
    }

    #[test]
    fn history_keeps_only_the_newest_events() {
        let bus = EventBus::new(2);
        for n in 0..5 {
            bus.publish("n", json!(n));
        }
        let recent = bus.recent_events();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload, json!(3));
        assert_eq!(recent[1].payload, json!(4));
        assert!(recent[0].sequence < recent[1].sequence);
    }
}
