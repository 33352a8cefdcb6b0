//! # Callback Dispatch
//!
//! User callbacks for messages, events, and replies; the pattern-based
//! callback lookup used when dispatching inbound traffic; the per-event
//! callback slots; and the auto-dispatch worker that turns a connection
//! into a push-style consumer.
//!
//! Callback objects are owned by the user and shared with the runtime as
//! `Arc<Mutex<dyn ...>>`; the runtime never drops the user's last
//! reference. A callback that panics is caught and logged — the dispatch
//! loop always continues.

use crate::message::Message;
use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::subject::Pattern;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// Events surfaced through [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    ConnectionSuccessful,
    ConnectionBroken,
    ConnectionReconnect,
    ConnectionException,
    RequestTimeout,
    DispatcherError,
    /// Fallback slot consulted when no specific callback is registered.
    AllEvents,
}

/// Receives dispatched messages for a subscription.
pub trait Callback: Send {
    fn on_message(&mut self, msg: &Message);
}

impl<F: FnMut(&Message) + Send> Callback for F {
    fn on_message(&mut self, msg: &Message) {
        self(msg)
    }
}

/// Receives connection lifecycle events.
pub trait EventCallback: Send {
    fn on_event(&mut self, event: ConnectionEvent, status: &Status);
}

impl<F: FnMut(ConnectionEvent, &Status) + Send> EventCallback for F {
    fn on_event(&mut self, event: ConnectionEvent, status: &Status) {
        self(event, status)
    }
}

/// Receives the reply for a callback-form request.
pub trait ReplyCallback: Send {
    fn on_reply(&mut self, request: &Message, reply: &Message);

    /// Invoked for request-scoped events (timeout in particular).
    fn on_event(&mut self, _event: ConnectionEvent, _status: &Status) {}
}

pub type SharedCallback = Arc<Mutex<dyn Callback>>;
pub type SharedEventCallback = Arc<Mutex<dyn EventCallback>>;
pub type SharedReplyCallback = Arc<Mutex<dyn ReplyCallback>>;

/// Wrap a callback for registration.
pub fn shared_callback(cb: impl Callback + 'static) -> SharedCallback {
    Arc::new(Mutex::new(cb))
}

pub fn shared_event_callback(cb: impl EventCallback + 'static) -> SharedEventCallback {
    Arc::new(Mutex::new(cb))
}

pub fn shared_reply_callback(cb: impl ReplyCallback + 'static) -> SharedReplyCallback {
    Arc::new(Mutex::new(cb))
}

/// Run message callbacks, isolating the loop from user panics.
pub(crate) fn run_callbacks(callbacks: &[SharedCallback], msg: &Message) {
    for cb in callbacks {
        let outcome = catch_unwind(AssertUnwindSafe(|| cb.lock().on_message(msg)));
        if outcome.is_err() {
            error!("An uncaught panic from a message callback was contained");
        }
    }
}

struct LookupEntry {
    pattern_text: String,
    pattern: Pattern,
    callbacks: Vec<SharedCallback>,
}

/// Subject-pattern → callback set used for dispatch.
#[derive(Default)]
pub(crate) struct CallbackLookup {
    entries: Vec<LookupEntry>,
}

impl CallbackLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callback to a pattern. Registering the same callback
    /// object twice against one pattern is an error.
    pub fn register(&mut self, pattern_text: &str, callback: SharedCallback) -> Result<()> {
        let entry = self.entries.iter_mut().find(|e| e.pattern_text == pattern_text);
        match entry {
            Some(entry) => {
                if entry.callbacks.iter().any(|cb| Arc::ptr_eq(cb, &callback)) {
                    return Err(Status::new(
                        StatusClass::ConnectionError,
                        StatusCode::InvalidCallback,
                        "Duplicate callback registered for subject pattern",
                    ));
                }
                entry.callbacks.push(callback);
            }
            None => {
                self.entries.push(LookupEntry {
                    pattern_text: pattern_text.to_string(),
                    pattern: pattern_text.parse()?,
                    callbacks: vec![callback],
                });
            }
        }
        Ok(())
    }

    /// Detach one callback (or, with `None`, every callback) from a
    /// pattern.
    pub fn unregister(&mut self, pattern_text: &str, callback: Option<&SharedCallback>) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.pattern_text == pattern_text) {
            match callback {
                Some(target) => entry.callbacks.retain(|cb| !Arc::ptr_eq(cb, target)),
                None => entry.callbacks.clear(),
            }
        }
        self.entries.retain(|e| !e.callbacks.is_empty());
    }

    /// Every callback whose pattern matches the delivered subject, in
    /// registration order.
    pub fn collect_callbacks(&self, subject: &str) -> Vec<SharedCallback> {
        let mut out = Vec::new();
        for entry in &self.entries {
            if entry.pattern.matches(subject) {
                out.extend(entry.callbacks.iter().cloned());
            }
        }
        out
    }

    pub fn callback_count(&self) -> usize {
        self.entries.iter().map(|e| e.callbacks.len()).sum()
    }
}

/// One callback slot per event kind. Dispatch is serialized through a
/// ticketed event mutex so concurrent workers deliver events in arrival
/// order.
pub struct EventBus {
    slots: Mutex<HashMap<ConnectionEvent, SharedEventCallback>>,
    gate: crate::util::TicketMutex<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            gate: crate::util::TicketMutex::new(()),
        }
    }

    /// Register (or replace) the callback for an event kind.
    pub fn register(&self, event: ConnectionEvent, callback: SharedEventCallback) {
        self.slots.lock().insert(event, callback);
    }

    /// Dispatch an event to its callback, falling back to the
    /// `AllEvents` slot. User panics are contained.
    pub fn dispatch(&self, event: ConnectionEvent, status: &Status) {
        let slot = {
            let slots = self.slots.lock();
            slots
                .get(&event)
                .or_else(|| slots.get(&ConnectionEvent::AllEvents))
                .cloned()
        };

        debug!(?event, %status, "dispatching event");

        if let Some(cb) = slot {
            let _serial = self.gate.lock();
            let outcome = catch_unwind(AssertUnwindSafe(|| cb.lock().on_event(event, status)));
            if outcome.is_err() {
                error!(?event, "An uncaught panic from an event callback was contained");
            }
        }
    }
}

/// Poll slice used by the auto-dispatch worker between receive calls.
const DISPATCH_POLL_MS: i32 = 100;

/// Background worker that repeatedly receives and routes messages
/// through the callback lookup.
///
/// While the worker runs, manual `receive`/`dispatch` calls fail with
/// `AUTODISPATCH_EXCLUSIVE`. Start and stop are idempotent.
pub(crate) struct AutoDispatcher {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AutoDispatcher {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the worker. Returns `false` if it was already running.
    pub fn start(&self, core: &Arc<crate::connection::ConnectionCore>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let running = Arc::clone(&self.running);
        let weak: Weak<crate::connection::ConnectionCore> = Arc::downgrade(core);

        let handle = std::thread::Builder::new()
            .name("auto-dispatcher".into())
            .spawn(move || {
                debug!("auto-dispatcher started");
                while running.load(Ordering::SeqCst) {
                    let Some(core) = weak.upgrade() else { break };
                    if !core.is_alive() {
                        break;
                    }
                    match core.receive_internal(DISPATCH_POLL_MS) {
                        Ok(Some(msg)) => core.dispatch_internal(&msg),
                        Ok(None) => {}
                        Err(status) => {
                            warn!(%status, "auto-dispatcher receive failed");
                            core.dispatch_event(ConnectionEvent::DispatcherError, status);
                        }
                    }
                }
                debug!("auto-dispatcher stopped");
            })
            .expect("spawn auto-dispatcher");

        *self.handle.lock() = Some(handle);
        true
    }

    /// Stop the worker, optionally blocking until it has exited.
    /// Returns `false` if it was not running.
    pub fn stop(&self, wait_for_completion: bool) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        if wait_for_completion {
            if let Some(handle) = self.handle.lock().take() {
                let _ = handle.join();
            }
        } else {
            self.handle.lock().take();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;
    use std::sync::atomic::AtomicUsize;

    fn collector(hits: Arc<Mutex<Vec<String>>>) -> SharedCallback {
        shared_callback(move |msg: &Message| {
            hits.lock().push(msg.subject().to_string());
        })
    }

    #[test]
    fn lookup_collects_matching_patterns_in_registration_order() {
        let mut lookup = CallbackLookup::new();
        let hits = Arc::new(Mutex::new(Vec::new()));
        lookup.register("A.>", collector(hits.clone())).unwrap();
        lookup.register("A.B.*", collector(hits.clone())).unwrap();
        lookup.register("Z.>", collector(hits.clone())).unwrap();

        let matched = lookup.collect_callbacks("A.B.C");
        assert_eq!(matched.len(), 2);
        let matched = lookup.collect_callbacks("Q.R");
        assert!(matched.is_empty());
    }

    #[test]
    fn duplicate_callback_on_same_pattern_is_rejected() {
        let mut lookup = CallbackLookup::new();
        let cb = collector(Arc::new(Mutex::new(Vec::new())));
        lookup.register("A.>", cb.clone()).unwrap();
        let err = lookup.register("A.>", cb.clone()).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidCallback);

        // A different callback object on the same pattern is fine.
        lookup
            .register("A.>", collector(Arc::new(Mutex::new(Vec::new()))))
            .unwrap();
        assert_eq!(lookup.callback_count(), 2);
    }

    #[test]
    fn unregister_removes_only_the_target() {
        let mut lookup = CallbackLookup::new();
        let first = collector(Arc::new(Mutex::new(Vec::new())));
        let second = collector(Arc::new(Mutex::new(Vec::new())));
        lookup.register("A.>", first.clone()).unwrap();
        lookup.register("A.>", second).unwrap();

        lookup.unregister("A.>", Some(&first));
        assert_eq!(lookup.callback_count(), 1);
        lookup.unregister("A.>", None);
        assert_eq!(lookup.callback_count(), 0);
    }

    #[test]
    fn run_callbacks_contains_panics() {
        let counted = Arc::new(AtomicUsize::new(0));
        let counted2 = Arc::clone(&counted);
        let panicking = shared_callback(|_msg: &Message| panic!("user bug"));
        let counting = shared_callback(move |_msg: &Message| {
            counted2.fetch_add(1, Ordering::SeqCst);
        });

        let msg = Message::new("A.B", Kind::Publish).unwrap();
        run_callbacks(&[panicking, counting], &msg);
        assert_eq!(counted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_bus_falls_back_to_all_events() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_all = Arc::clone(&seen);
        bus.register(
            ConnectionEvent::AllEvents,
            shared_event_callback(move |event: ConnectionEvent, _: &Status| {
                seen_all.lock().push(("all", event));
            }),
        );
        let seen_broken = Arc::clone(&seen);
        bus.register(
            ConnectionEvent::ConnectionBroken,
            shared_event_callback(move |event: ConnectionEvent, _: &Status| {
                seen_broken.lock().push(("broken", event));
            }),
        );

        bus.dispatch(ConnectionEvent::ConnectionBroken, &Status::default());
        bus.dispatch(ConnectionEvent::RequestTimeout, &Status::default());

        let seen = seen.lock();
        assert_eq!(
            *seen,
            vec![
                ("broken", ConnectionEvent::ConnectionBroken),
                ("all", ConnectionEvent::RequestTimeout),
            ]
        );
    }
}
