//! # Request/Reply Correlation
//!
//! Outbound requests are stamped with a per-process-monotone unique ID
//! and parked in a pending table. Inbound replies are matched back by
//! that ID and delivered either to a synchronous waiter or to a reply
//! callback. A background thread services the table: it sends the first
//! copy of each new request, republishes unanswered requests on their
//! configured interval, and emits `REQUEST_TIMEOUT` events when a
//! request with republish disabled expires.
//!
//! The thread supports early wake-up so a freshly added request is sent
//! without waiting for the next tick.

use crate::dispatch::{ConnectionEvent, SharedReplyCallback};
use crate::message::Message;
use crate::status::Status;
use crate::util::CountDownLatch;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Republish disabled: the request is sent exactly once.
pub const REQUEST_REPUBLISH_NEVER: i32 = -1;

/// How long the callback-form `request` waits for first-send completion
/// before logging a warning.
pub(crate) const REQUEST_PUBLISH_WAIT_MS: i32 = 10_000;

/// Correlator scan interval.
const TICK: Duration = Duration::from_millis(250);

/// Field carrying the reply correlation ID on the wire.
pub const REPLY_UNIQUE_ID_FIELD: &str = "GMSEC-REPLY-UNIQUE-ID";
/// Alternate spelling accepted/emitted when `gmsec-support-legacy-api`
/// is set.
pub const LEGACY_REPLY_UNIQUE_ID_FIELD: &str = "REPLY-UNIQUE-ID";

/// Correlation ID of a received reply or request, as recorded by the
/// receive pipeline.
pub fn get_reply_unique_id(msg: &Message) -> Option<String> {
    msg.meta_string(REPLY_UNIQUE_ID_FIELD)
}

pub(crate) struct PendingState {
    pub next_deadline: Option<Instant>,
    pub reply: Option<Message>,
    pub active: bool,
    pub sent_once: bool,
    pub quit: bool,
}

/// One outstanding request.
pub(crate) struct PendingRequest {
    pub unique_id: String,
    /// Owned clone of the caller's request, already carrying the reply
    /// correlation field(s). Tracking fields are stamped per send.
    pub request: Message,
    pub multi_response: bool,
    /// `None` means republish NEVER.
    pub republish_ms: Option<u32>,
    /// Whether an absolute timeout applies (false = wait forever).
    pub has_deadline: bool,
    pub reply_callback: Option<SharedReplyCallback>,
    pub state: Mutex<PendingState>,
    pub delivered: Condvar,
    pub sent_latch: CountDownLatch,
}

impl PendingRequest {
    pub fn new(
        unique_id: String,
        request: Message,
        timeout_ms: i32,
        republish_ms: Option<u32>,
        multi_response: bool,
        reply_callback: Option<SharedReplyCallback>,
    ) -> Self {
        let now = Instant::now();
        let has_deadline = timeout_ms >= 0;
        // Without an absolute timeout the deadline drives republish only.
        let next_deadline = if has_deadline {
            Some(now + Duration::from_millis(timeout_ms as u64))
        } else {
            republish_ms.map(|ms| now + Duration::from_millis(ms as u64))
        };

        Self {
            unique_id,
            request,
            multi_response,
            republish_ms,
            has_deadline,
            reply_callback,
            state: Mutex::new(PendingState {
                next_deadline,
                reply: None,
                active: true,
                sent_once: false,
                quit: false,
            }),
            delivered: Condvar::new(),
            sent_latch: CountDownLatch::new(1),
        }
    }

    /// Mark the request no longer interested in replies.
    pub fn deactivate(&self) {
        let mut state = self.state.lock();
        state.active = false;
        self.delivered.notify_all();
    }
}

/// Capability surface the correlator worker needs from its connection:
/// send a (re)stamped copy of a request and raise events.
pub(crate) trait RequestSender: Send + Sync {
    fn send_request_copy(&self, pending: &PendingRequest) -> crate::status::Result<()>;
    fn raise_event(&self, event: ConnectionEvent, status: Status);
}

struct CorrelatorShared {
    pending: Mutex<HashMap<String, Arc<PendingRequest>>>,
    wake: Condvar,
    quit: AtomicBool,
}

/// Pending-request table plus its service thread.
pub(crate) struct RequestCorrelator {
    shared: Arc<CorrelatorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CorrelatorShared {
                pending: Mutex::new(HashMap::new()),
                wake: Condvar::new(),
                quit: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the service thread if it is not already running.
    pub fn start(&self, sender: Weak<dyn RequestSender>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("request-correlator".into())
            .spawn(move || correlator_loop(shared, sender))
            .expect("spawn request-correlator");
        *worker = Some(handle);
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Register a pending request; the service thread sends the first
    /// copy. Wakes the thread immediately.
    pub fn add(&self, pending: Arc<PendingRequest>) {
        {
            let mut table = self.shared.pending.lock();
            table.insert(pending.unique_id.clone(), pending);
        }
        self.shared.wake.notify_all();
    }

    /// Deliver a reply to its pending request. Returns `true` when the
    /// reply was consumed by a pending entry.
    pub fn on_reply(&self, unique_id: &str, reply: Message) -> bool {
        let entry = {
            let table = self.shared.pending.lock();
            table.get(unique_id).cloned()
        };

        let Some(entry) = entry else {
            debug!(unique_id, "reply does not correlate to a pending request");
            return false;
        };

        {
            let mut state = entry.state.lock();
            if !state.active {
                return false;
            }
            state.reply = Some(reply.clone());
            if !entry.multi_response {
                state.active = false;
            }
        }
        entry.delivered.notify_all();

        if let Some(cb) = &entry.reply_callback {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                cb.lock().on_reply(&entry.request, &reply)
            }));
            if outcome.is_err() {
                error!("An uncaught panic from a reply callback was contained");
            }
        }

        if !entry.multi_response {
            self.remove(unique_id);
        }
        true
    }

    pub fn remove(&self, unique_id: &str) {
        self.shared.pending.lock().remove(unique_id);
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Stop the service thread and fail every outstanding waiter.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }

        let entries: Vec<Arc<PendingRequest>> =
            self.shared.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            let mut state = entry.state.lock();
            state.quit = true;
            state.active = false;
            entry.delivered.notify_all();
            // Release anyone stuck on the first-send latch too.
            entry.sent_latch.count_down();
        }
    }
}

fn correlator_loop(shared: Arc<CorrelatorShared>, sender: Weak<dyn RequestSender>) {
    debug!("request-correlator started");

    loop {
        // Collect work under the lock, perform sends outside it.
        let mut to_send: Vec<Arc<PendingRequest>> = Vec::new();
        let mut timed_out: Vec<Arc<PendingRequest>> = Vec::new();

        {
            let mut table = shared.pending.lock();
            if shared.quit.load(Ordering::SeqCst) {
                break;
            }

            let now = Instant::now();
            let mut retired: Vec<String> = Vec::new();
            let mut nearest: Option<Instant> = None;

            for (id, entry) in table.iter() {
                let mut state = entry.state.lock();
                if !state.active {
                    retired.push(id.clone());
                    continue;
                }

                if !state.sent_once {
                    to_send.push(Arc::clone(entry));
                    continue;
                }

                if let Some(deadline) = state.next_deadline {
                    if now >= deadline {
                        match entry.republish_ms {
                            Some(ms) => {
                                to_send.push(Arc::clone(entry));
                                let next = now + Duration::from_millis(ms as u64);
                                state.next_deadline = Some(next);
                                nearest = Some(nearest.map_or(next, |n| n.min(next)));
                                if entry.has_deadline {
                                    timed_out.push(Arc::clone(entry));
                                }
                            }
                            None => {
                                state.active = false;
                                retired.push(id.clone());
                                timed_out.push(Arc::clone(entry));
                                entry.delivered.notify_all();
                            }
                        }
                    } else {
                        nearest = Some(nearest.map_or(deadline, |n| n.min(deadline)));
                    }
                }
            }

            for id in retired {
                table.remove(&id);
            }

            if to_send.is_empty() && timed_out.is_empty() {
                // Sleep until the nearest deadline (capped by the scan
                // tick) or an early wake-up from add()/quit().
                let wait = nearest
                    .map(|d| d.saturating_duration_since(Instant::now()).min(TICK))
                    .unwrap_or(TICK);
                shared.wake.wait_for(&mut table, wait);
            }
        }

        let sender = match sender.upgrade() {
            Some(sender) => sender,
            None => break,
        };

        for entry in timed_out {
            let status = Status::timeout("Request timed out");
            if let Some(cb) = &entry.reply_callback {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    cb.lock().on_event(ConnectionEvent::RequestTimeout, &status)
                }));
                if outcome.is_err() {
                    error!("An uncaught panic from a reply callback was contained");
                }
            }
            sender.raise_event(ConnectionEvent::RequestTimeout, status);
        }

        for entry in to_send {
            let result = sender.send_request_copy(&entry);
            let mut state = entry.state.lock();
            if !state.sent_once {
                state.sent_once = true;
                entry.sent_latch.count_down();
            }
            drop(state);

            if let Err(status) = result {
                warn!(%status, unique_id = %entry.unique_id, "request send failed");
                sender.raise_event(ConnectionEvent::ConnectionException, status);
            }
        }
    }

    debug!("request-correlator stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;
    use std::sync::atomic::AtomicUsize;

    struct CountingSender {
        sends: AtomicUsize,
        events: Mutex<Vec<ConnectionEvent>>,
    }

    impl RequestSender for CountingSender {
        fn send_request_copy(&self, _pending: &PendingRequest) -> crate::status::Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn raise_event(&self, event: ConnectionEvent, _status: Status) {
            self.events.lock().push(event);
        }
    }

    fn request_msg() -> Message {
        Message::new("REQ.1", Kind::Request).unwrap()
    }

    fn sender() -> Arc<CountingSender> {
        Arc::new(CountingSender {
            sends: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn first_copy_is_sent_and_latch_released() {
        let correlator = RequestCorrelator::new();
        let sender = sender();
        let as_trait: Arc<dyn RequestSender> = sender.clone();
        correlator.start(Arc::downgrade(&as_trait));

        let pending = Arc::new(PendingRequest::new(
            "id-1".into(),
            request_msg(),
            5000,
            None,
            false,
            None,
        ));
        correlator.add(Arc::clone(&pending));

        assert!(pending.sent_latch.await_timeout(2000));
        assert_eq!(sender.sends.load(Ordering::SeqCst), 1);
        correlator.quit();
    }

    #[test]
    fn reply_delivery_retires_single_response_entries() {
        let correlator = RequestCorrelator::new();
        let sender = sender();
        let as_trait: Arc<dyn RequestSender> = sender.clone();
        correlator.start(Arc::downgrade(&as_trait));

        let pending = Arc::new(PendingRequest::new(
            "id-2".into(),
            request_msg(),
            5000,
            None,
            false,
            None,
        ));
        correlator.add(Arc::clone(&pending));
        pending.sent_latch.await_timeout(2000);

        let reply = Message::new("REQ.1.RESP", Kind::Reply).unwrap();
        assert!(correlator.on_reply("id-2", reply.clone()));
        assert_eq!(correlator.pending_count(), 0);
        // A second identical reply no longer correlates.
        assert!(!correlator.on_reply("id-2", reply));
        correlator.quit();
    }

    #[test]
    fn republish_resends_until_reply() {
        let correlator = RequestCorrelator::new();
        let sender = sender();
        let as_trait: Arc<dyn RequestSender> = sender.clone();
        correlator.start(Arc::downgrade(&as_trait));

        let pending = Arc::new(PendingRequest::new(
            "id-3".into(),
            request_msg(),
            crate::util::WAIT_FOREVER,
            Some(50),
            false,
            None,
        ));
        correlator.add(Arc::clone(&pending));

        std::thread::sleep(Duration::from_millis(400));
        let sends = sender.sends.load(Ordering::SeqCst);
        assert!(sends >= 3, "expected >=3 sends, saw {sends}");
        // No absolute deadline: republish never raises a timeout event.
        assert!(sender.events.lock().is_empty());
        correlator.quit();
    }

    #[test]
    fn expired_never_republish_entries_emit_timeout_and_retire() {
        let correlator = RequestCorrelator::new();
        let sender = sender();
        let as_trait: Arc<dyn RequestSender> = sender.clone();
        correlator.start(Arc::downgrade(&as_trait));

        let pending = Arc::new(PendingRequest::new(
            "id-4".into(),
            request_msg(),
            50,
            None,
            false,
            None,
        ));
        correlator.add(Arc::clone(&pending));

        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(correlator.pending_count(), 0);
        assert!(!pending.state.lock().active);
        assert!(sender
            .events
            .lock()
            .contains(&ConnectionEvent::RequestTimeout));
        correlator.quit();
    }

    #[test]
    fn multi_response_entries_stay_active_after_a_reply() {
        let correlator = RequestCorrelator::new();
        let sender = sender();
        let as_trait: Arc<dyn RequestSender> = sender.clone();
        correlator.start(Arc::downgrade(&as_trait));

        let replies = Arc::new(AtomicUsize::new(0));
        let replies2 = Arc::clone(&replies);
        let cb = crate::dispatch::shared_reply_callback(ReplyCounter(replies2));

        let pending = Arc::new(PendingRequest::new(
            "id-5".into(),
            request_msg(),
            5000,
            None,
            true,
            Some(cb),
        ));
        correlator.add(Arc::clone(&pending));
        pending.sent_latch.await_timeout(2000);

        let reply = Message::new("REQ.1.RESP", Kind::Reply).unwrap();
        assert!(correlator.on_reply("id-5", reply.clone()));
        assert!(correlator.on_reply("id-5", reply));
        assert_eq!(replies.load(Ordering::SeqCst), 2);
        assert_eq!(correlator.pending_count(), 1);
        correlator.quit();
    }

    struct ReplyCounter(Arc<AtomicUsize>);

    impl crate::dispatch::ReplyCallback for ReplyCounter {
        fn on_reply(&mut self, _request: &Message, _reply: &Message) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
