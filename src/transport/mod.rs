//! # Transport Abstraction and Driver Module
//!
//! This module defines the contract every concrete middleware driver
//! must satisfy, the host capability surface a driver is handed at
//! connect time, and the factory that turns a configuration into a
//! driver instance.
//!
//! ## Driver Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌──────────────────┐    ┌─────────────────┐
//! │   Connection    │───▶│    Transport     │───▶│    Specific     │
//! │    runtime      │    │      trait       │    │     driver      │
//! │                 │    │  (abstraction)   │    │ (loopback/bolt) │
//! └─────────────────┘    └──────────────────┘    └─────────────────┘
//! ```
//!
//! A driver may deliver inbound traffic either by returning messages
//! from [`Transport::receive`] or by pushing through its
//! [`DriverHost`]; it signals transport-level events (broken,
//! reconnecting, exceptions) exclusively through the host. The host
//! holds a weak reference back to the connection and an alive flag that
//! is cleared as the first step of teardown, so a late callback from a
//! driver-internal thread is a no-op rather than a use-after-teardown.

use crate::config::{keys, Config};
use crate::dispatch::ConnectionEvent;
use crate::message::Message;
use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::util::timeout_to_duration;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub mod bolt;
pub mod loopback;

pub use bolt::BoltTransport;
pub use loopback::LoopbackTransport;

/// Connection-side capability surface exposed to drivers.
///
/// Deliberately narrow: a driver can raise events, enqueue inbound
/// messages, and deliver replies — nothing else of the connection is
/// reachable from driver code.
pub(crate) trait ConnectionHost: Send + Sync {
    fn dispatch_event(&self, event: ConnectionEvent, status: Status);
    fn enqueue_inbound(&self, msg: Message);
    fn on_reply(&self, reply: Message);
}

/// Handle given to a driver at connect time.
///
/// All calls become no-ops once [`DriverHost::clear`] has run.
pub struct DriverHost {
    alive: AtomicBool,
    target: Weak<dyn ConnectionHost>,
}

impl DriverHost {
    pub(crate) fn new(target: Weak<dyn ConnectionHost>) -> Arc<Self> {
        Arc::new(Self {
            alive: AtomicBool::new(true),
            target,
        })
    }

    /// First step of connection teardown.
    pub(crate) fn clear(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn with_target(&self, f: impl FnOnce(&dyn ConnectionHost)) {
        if !self.is_alive() {
            return;
        }
        if let Some(target) = self.target.upgrade() {
            f(target.as_ref());
        }
    }

    pub fn dispatch_event(&self, event: ConnectionEvent, status: Status) {
        self.with_target(move |t| t.dispatch_event(event, status));
    }

    pub fn enqueue_inbound(&self, msg: Message) {
        self.with_target(move |t| t.enqueue_inbound(msg));
    }

    pub fn on_reply(&self, reply: Message) {
        self.with_target(move |t| t.on_reply(reply));
    }
}

/// Driver connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Driver created but never connected.
    Uninitialized,
    /// Connect in progress.
    Initializing,
    /// Ready for traffic.
    Connected,
    /// Cleanly disconnected.
    Disconnected,
    /// Failed; requires a reconnect.
    Error,
}

/// Contract every concrete middleware driver satisfies.
///
/// All methods take `&self`; a driver manages its own interior state and
/// synchronization. The connection runtime serializes outbound calls
/// through its write mutex, but a driver must still tolerate `receive`
/// racing `publish`.
pub trait Transport: Send + Sync {
    /// Receive the host handle used for pushing events and inbound
    /// messages back to the connection. Called before `connect`.
    fn set_host(&self, _host: Arc<DriverHost>) {}

    /// Establish the link to the broker. A single attempt — the
    /// connection runtime owns the retry loop.
    fn connect(&self) -> Result<()>;

    fn disconnect(&self) -> Result<()>;

    /// Establish a driver-level subscription for a pattern. Called at
    /// most once per pattern; client-side callbacks multiplex above.
    fn subscribe(&self, pattern: &str, config: &Config) -> Result<()>;

    fn unsubscribe(&self, pattern: &str) -> Result<()>;

    fn publish(&self, msg: &Message, config: &Config) -> Result<()>;

    /// Send a request message. The correlation ID has already been
    /// stamped into the message; drivers with native request support may
    /// use `unique_id` for their own bookkeeping.
    fn request(&self, msg: &Message, _unique_id: &str) -> Result<()> {
        self.publish(msg, &Config::default())
    }

    /// Blocking receive. Negative timeout waits forever, zero polls.
    fn receive(&self, timeout_ms: i32) -> Result<Option<Message>>;

    /// A fresh driver-scoped unique identifier.
    fn unique_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn library_name(&self) -> &'static str;

    fn library_version(&self) -> String;

    /// Human-readable middleware description for MW-INFO tracking.
    fn middleware_info(&self) -> String {
        format!("{} {}", self.library_name(), self.library_version())
    }

    /// Endpoint actually in use, for observability. `None` when the
    /// driver has nothing meaningful to report.
    fn endpoint(&self) -> Option<String> {
        None
    }
}

/// Blocking inbound queue shared by the bundled drivers.
pub(crate) struct InboundQueue {
    queue: Mutex<VecDeque<Message>>,
    available: Condvar,
}

impl InboundQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        })
    }

    pub fn push(&self, msg: Message) {
        self.queue.lock().push_back(msg);
        self.available.notify_one();
    }

    /// Pop the next message, waiting up to the given timeout
    /// (`< 0` forever, `0` poll).
    pub fn pop(&self, timeout_ms: i32) -> Option<Message> {
        let mut queue = self.queue.lock();
        match timeout_to_duration(timeout_ms) {
            None => loop {
                if let Some(msg) = queue.pop_front() {
                    return Some(msg);
                }
                self.available.wait(&mut queue);
            },
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                loop {
                    if let Some(msg) = queue.pop_front() {
                        return Some(msg);
                    }
                    if self.available.wait_until(&mut queue, deadline).timed_out() {
                        return queue.pop_front();
                    }
                }
            }
        }
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }
}

/// Instantiate the driver selected by `mw-id` (or its legacy alias
/// `connectionType`).
pub fn create_transport(config: &Config) -> Result<Box<dyn Transport>> {
    let mw_id = config
        .value_of_any(&[keys::MW_ID, keys::CONNECTION_TYPE])
        .ok_or_else(|| {
            Status::new(
                StatusClass::ConfigError,
                StatusCode::InvalidConnection,
                "mw-id in configuration is missing",
            )
        })?;

    debug!(mw_id, "creating middleware driver");

    match mw_id.to_lowercase().as_str() {
        "loopback" => Ok(Box::new(LoopbackTransport::new(config))),
        "bolt" => Ok(Box::new(BoltTransport::new(config)?)),
        other => Err(Status::new(
            StatusClass::ConfigError,
            StatusCode::FeatureNotSupported,
            format!("Unable to load middleware wrapper for mw-id '{other}'"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    #[test]
    fn factory_requires_mw_id() {
        let err = match create_transport(&Config::new()) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code(), StatusCode::InvalidConnection);
    }

    #[test]
    fn factory_rejects_unknown_drivers() {
        let config = Config::from_args("mw-id=carrier-pigeon").unwrap();
        let err = match create_transport(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.code(), StatusCode::FeatureNotSupported);
    }

    #[test]
    fn factory_honors_the_legacy_alias() {
        let config = Config::from_args("connectiontype=loopback").unwrap();
        assert!(create_transport(&config).is_ok());
    }

    #[test]
    fn inbound_queue_pop_honors_timeouts() {
        let queue = InboundQueue::new();
        // Poll on an empty queue returns promptly.
        assert!(queue.pop(0).is_none());
        let start = std::time::Instant::now();
        assert!(queue.pop(50).is_none());
        assert!(start.elapsed() >= std::time::Duration::from_millis(45));

        queue.push(Message::new("A.B", Kind::Publish).unwrap());
        assert_eq!(queue.pop(0).unwrap().subject(), "A.B");
    }

    #[test]
    fn inbound_queue_wakes_blocked_consumer() {
        let queue = InboundQueue::new();
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.pop(2000))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        queue.push(Message::new("A.B", Kind::Publish).unwrap());
        assert!(consumer.join().unwrap().is_some());
    }

    #[test]
    fn cleared_host_drops_late_callbacks() {
        struct Recorder(Mutex<usize>);
        impl ConnectionHost for Recorder {
            fn dispatch_event(&self, _event: ConnectionEvent, _status: Status) {
                *self.0.lock() += 1;
            }
            fn enqueue_inbound(&self, _msg: Message) {
                *self.0.lock() += 1;
            }
            fn on_reply(&self, _reply: Message) {
                *self.0.lock() += 1;
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(0)));
        let as_host: Arc<dyn ConnectionHost> = recorder.clone();
        let host = DriverHost::new(Arc::downgrade(&as_host));

        host.dispatch_event(ConnectionEvent::ConnectionBroken, Status::default());
        assert_eq!(*recorder.0.lock(), 1);

        host.clear();
        host.dispatch_event(ConnectionEvent::ConnectionBroken, Status::default());
        host.enqueue_inbound(Message::new("A.B", Kind::Publish).unwrap());
        assert_eq!(*recorder.0.lock(), 1);
    }
}
