//! Subscription registry — maps subscription ids to patterns and
//! handlers.
//!
//! The registry exclusively owns the subscription records; handlers are
//! shared `Arc`s that outlive a single connection and are invoked many
//! times. Entries are kept across reconnects until explicitly removed.

use std::collections::BTreeMap;
use std::sync::Arc;

use gw_protocol::{validate_subject, Envelope};

use crate::error::Result;

/// Handle identifying one subscription for the lifetime of the client.
pub type SubscriptionId = u64;

/// Callback invoked for each matching inbound Message:
/// `(subject, payload, full envelope)`.
pub type SubscriptionHandler =
    Arc<dyn Fn(&str, &serde_json::Value, &Envelope) + Send + Sync + 'static>;

pub(crate) struct Subscription {
    pub id: SubscriptionId,
    pub pattern: String,
    pub handler: SubscriptionHandler,
    pub active: bool,
}

/// Id-ordered subscription store. Ids are allocated monotonically, so
/// iteration order is insertion order — the order re-subscription
/// frames are sent in after a reconnect.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionId, Subscription>,
    next_id: SubscriptionId,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Validate the pattern and insert a new record.
    pub fn add(&mut self, pattern: &str, handler: SubscriptionHandler) -> Result<SubscriptionId> {
        validate_subject(pattern)?;

        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Subscription {
                id,
                pattern: pattern.to_string(),
                handler,
                active: true,
            },
        );
        Ok(id)
    }

    /// Drop a record by id, returning its pattern.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<String> {
        self.entries.remove(&id).map(|sub| sub.pattern)
    }

    /// Drop the first record with the given pattern, returning its id.
    pub fn remove_by_pattern(&mut self, pattern: &str) -> Option<SubscriptionId> {
        let id = self
            .entries
            .values()
            .find(|sub| sub.pattern == pattern)
            .map(|sub| sub.id)?;
        self.entries.remove(&id);
        Some(id)
    }

    /// Active patterns in insertion order.
    pub fn patterns(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|sub| sub.active)
            .map(|sub| sub.pattern.clone())
            .collect()
    }

    /// Handlers whose pattern matches `subject`, cloned out so callers
    /// can invoke them without holding any lock.
    pub fn matching_handlers(&self, subject: &str) -> Vec<(SubscriptionId, SubscriptionHandler)> {
        self.entries
            .values()
            .filter(|sub| sub.active && gw_protocol::matches(&sub.pattern, subject))
            .map(|sub| (sub.id, Arc::clone(&sub.handler)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> SubscriptionHandler {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn ids_are_unique_and_monotonic() {
        let mut reg = SubscriptionRegistry::new();
        let a = reg.add("a.b", noop()).unwrap();
        let b = reg.add("a.c", noop()).unwrap();
        reg.remove(a);
        let c = reg.add("a.d", noop()).unwrap();
        assert!(a < b && b < c, "ids never reused: {a} {b} {c}");
    }

    #[test]
    fn add_rejects_invalid_patterns() {
        let mut reg = SubscriptionRegistry::new();
        assert!(reg.add("", noop()).is_err());
        assert!(reg.add("a..b", noop()).is_err());
        assert!(reg.add("a.>.b", noop()).is_err());
        assert!(reg.patterns().is_empty());
    }

    #[test]
    fn patterns_keep_insertion_order() {
        let mut reg = SubscriptionRegistry::new();
        reg.add("a.b", noop()).unwrap();
        reg.add("a.c", noop()).unwrap();
        reg.add("z.>", noop()).unwrap();
        assert_eq!(reg.patterns(), vec!["a.b", "a.c", "z.>"]);
    }

    #[test]
    fn remove_by_pattern() {
        let mut reg = SubscriptionRegistry::new();
        let id = reg.add("a.b", noop()).unwrap();
        assert_eq!(reg.remove_by_pattern("a.b"), Some(id));
        assert_eq!(reg.remove_by_pattern("a.b"), None);
    }

    #[test]
    fn matching_handlers_applies_wildcards() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut reg = SubscriptionRegistry::new();
        for pattern in ["factory.line1.>", "factory.*.temp", "other.>"] {
            let counter = Arc::clone(&counter);
            reg.add(
                pattern,
                Arc::new(move |_, _, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        }

        let matched = reg.matching_handlers("factory.line1.temp");
        assert_eq!(matched.len(), 2);

        let env = Envelope::publish("factory.line1.temp", serde_json::json!({}));
        for (_, handler) in &matched {
            handler("factory.line1.temp", &serde_json::Value::Null, &env);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
