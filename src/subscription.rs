//! Subscription handles, the per-connection registry, and the
//! process-wide active-subscription service.

use crate::config::Config;
use crate::dispatch::SharedCallback;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

/// Handle returned by `Connection::subscribe` and consumed by
/// `Connection::unsubscribe`.
///
/// The handle remembers which connection minted it; handing it to a
/// different connection's `unsubscribe` is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    handle: u64,
    subject_pattern: String,
    connection_id: String,
}

impl SubscriptionInfo {
    pub(crate) fn new(handle: u64, subject_pattern: &str, connection_id: &str) -> Self {
        Self {
            handle,
            subject_pattern: subject_pattern.to_string(),
            connection_id: connection_id.to_string(),
        }
    }

    pub fn subject_pattern(&self) -> &str {
        &self.subject_pattern
    }

    pub(crate) fn handle(&self) -> u64 {
        self.handle
    }

    pub(crate) fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

/// Outcome of checking a new subscription against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionStatus {
    /// First subscription for this pattern: the driver must be told.
    IsNew,
    /// Pattern already established at the driver; multiplex client-side.
    NotNew,
    /// Same pattern with no callback — a duplicate subscription.
    Duplicate,
    /// Same pattern with the same callback object.
    DuplicateUsingCallback,
}

pub(crate) struct SubscriptionEntry {
    pub handle: u64,
    pub pattern: String,
    pub callback: Option<SharedCallback>,
    pub config: Config,
}

/// The user's view of active subscriptions on one connection.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Vec<SubscriptionEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, pattern: &str, callback: Option<&SharedCallback>) -> SubscriptionStatus {
        let mut status = SubscriptionStatus::IsNew;
        for entry in &self.entries {
            if entry.pattern != pattern {
                continue;
            }
            status = SubscriptionStatus::NotNew;
            match callback {
                None => return SubscriptionStatus::Duplicate,
                Some(cb) => {
                    if entry
                        .callback
                        .as_ref()
                        .map(|existing| Arc::ptr_eq(existing, cb))
                        .unwrap_or(false)
                    {
                        return SubscriptionStatus::DuplicateUsingCallback;
                    }
                }
            }
        }
        status
    }

    pub fn add(&mut self, entry: SubscriptionEntry) {
        self.entries.push(entry);
    }

    pub fn remove(&mut self, handle: u64) -> Option<SubscriptionEntry> {
        let idx = self.entries.iter().position(|e| e.handle == handle)?;
        Some(self.entries.remove(idx))
    }

    /// Whether any subscription for this pattern remains (driver-level
    /// unsubscribe only happens when the last one goes).
    pub fn has_pattern(&self, pattern: &str) -> bool {
        self.entries.iter().any(|e| e.pattern == pattern)
    }

    pub fn drain(&mut self) -> Vec<SubscriptionEntry> {
        std::mem::take(&mut self.entries)
    }
}

/// Process-wide registry of subscription patterns across every live
/// connection, used to populate heartbeat tracking fields.
///
/// This is the one truly global datum in the crate. It is an explicit
/// service with a shutdown hook (`reset`, called from
/// `Connection::shutdown_all_middlewares`) rather than bare static
/// state.
pub struct ActiveSubscriptions {
    // Pattern → reference count across connections.
    topics: Mutex<BTreeMap<String, usize>>,
}

static ACTIVE_SUBSCRIPTIONS: OnceLock<ActiveSubscriptions> = OnceLock::new();

impl ActiveSubscriptions {
    fn new() -> Self {
        ActiveSubscriptions {
            topics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn global() -> &'static ActiveSubscriptions {
        ACTIVE_SUBSCRIPTIONS.get_or_init(ActiveSubscriptions::new)
    }

    pub fn register(&self, pattern: &str) {
        *self.topics.lock().entry(pattern.to_string()).or_insert(0) += 1;
    }

    pub fn unregister(&self, pattern: &str) {
        let mut topics = self.topics.lock();
        if let Some(count) = topics.get_mut(pattern) {
            *count -= 1;
            if *count == 0 {
                topics.remove(pattern);
            }
        }
    }

    /// Sorted snapshot of the distinct active patterns.
    pub fn topics(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    pub fn reset(&self) {
        self.topics.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::shared_callback;
    use crate::message::Message;

    fn noop() -> SharedCallback {
        shared_callback(|_msg: &Message| {})
    }

    fn entry(handle: u64, pattern: &str, callback: Option<SharedCallback>) -> SubscriptionEntry {
        SubscriptionEntry {
            handle,
            pattern: pattern.to_string(),
            callback,
            config: Config::default(),
        }
    }

    #[test]
    fn duplicate_rules() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.check("A.>", None), SubscriptionStatus::IsNew);

        registry.add(entry(1, "A.>", None));
        // Same pattern, no callback: duplicate.
        assert_eq!(registry.check("A.>", None), SubscriptionStatus::Duplicate);

        // Same pattern with a new callback: allowed, driver not re-told.
        let cb = noop();
        assert_eq!(registry.check("A.>", Some(&cb)), SubscriptionStatus::NotNew);
        registry.add(entry(2, "A.>", Some(cb.clone())));

        // Same pattern with the same callback object: rejected.
        assert_eq!(
            registry.check("A.>", Some(&cb)),
            SubscriptionStatus::DuplicateUsingCallback
        );
    }

    #[test]
    fn removal_tracks_remaining_patterns() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(entry(1, "A.>", None));
        registry.add(entry(2, "A.>", Some(noop())));

        registry.remove(1).unwrap();
        assert!(registry.has_pattern("A.>"));
        registry.remove(2).unwrap();
        assert!(!registry.has_pattern("A.>"));
        assert!(registry.remove(2).is_none());
    }

    #[test]
    fn active_subscription_service_refcounts() {
        // A private instance: the global service is shared with every
        // other test in the process.
        let service = ActiveSubscriptions::new();

        service.register("HB.>");
        service.register("HB.>");
        service.register("CMD.*");
        assert_eq!(service.topics(), vec!["CMD.*".to_string(), "HB.>".to_string()]);

        service.unregister("HB.>");
        assert!(service.topics().contains(&"HB.>".to_string()));
        service.unregister("HB.>");
        assert_eq!(service.topics(), vec!["CMD.*".to_string()]);

        service.reset();
        assert!(service.topics().is_empty());
    }
}
