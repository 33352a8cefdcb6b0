//! In-process loopback driver.
//!
//! Every loopback connection in the process attaches to one shared bus.
//! A published message is round-tripped through the wire encoding (so
//! meta-map and config hints are shed exactly as a real broker would
//! shed them) and delivered to every attached client with a matching
//! subscription, including the publisher itself.
//!
//! The driver doubles as the test vehicle for fault handling:
//! [`sever_all_links`] simulates a transient broker outage, raising the
//! same events a production driver would.

use crate::config::Config;
use crate::dispatch::ConnectionEvent;
use crate::message::Message;
use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::subject::Pattern;
use crate::transport::{DriverHost, InboundQueue, Transport, TransportState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;

struct ClientSlot {
    subscriptions: Vec<(String, Pattern)>,
    queue: Arc<InboundQueue>,
    host: Option<Arc<DriverHost>>,
}

/// The process-wide bus shared by every loopback connection.
struct LoopbackBus {
    clients: Mutex<HashMap<u64, ClientSlot>>,
    next_id: AtomicU64,
}

static BUS: OnceLock<LoopbackBus> = OnceLock::new();

fn bus() -> &'static LoopbackBus {
    BUS.get_or_init(|| LoopbackBus {
        clients: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
    })
}

/// Detach every client from the bus. Part of
/// `Connection::shutdown_all_middlewares`.
pub fn shutdown() {
    bus().clients.lock().clear();
}

/// Simulate a transient broker outage: every attached connection sees a
/// `CONNECTION_BROKEN` event (code `CONNECTION_LOST`) followed by a
/// `CONNECTION_RECONNECT` once the link is restored.
pub fn sever_all_links() {
    let hosts: Vec<Arc<DriverHost>> = bus()
        .clients
        .lock()
        .values()
        .filter_map(|slot| slot.host.clone())
        .collect();

    for host in hosts {
        host.dispatch_event(
            ConnectionEvent::ConnectionBroken,
            Status::new(
                StatusClass::ConnectionError,
                StatusCode::ConnectionLost,
                "Connection to middleware lost",
            ),
        );
        host.dispatch_event(
            ConnectionEvent::ConnectionReconnect,
            Status::new(
                StatusClass::ConnectionError,
                StatusCode::ConnectionReconnect,
                "Connection to middleware restored",
            ),
        );
    }
}

/// Driver for the in-process bus.
pub struct LoopbackTransport {
    id: AtomicU64,
    queue: Arc<InboundQueue>,
    host: Mutex<Option<Arc<DriverHost>>>,
    state: Mutex<TransportState>,
}

impl LoopbackTransport {
    pub fn new(_config: &Config) -> Self {
        Self {
            id: AtomicU64::new(0),
            queue: InboundQueue::new(),
            host: Mutex::new(None),
            state: Mutex::new(TransportState::Uninitialized),
        }
    }

    fn client_id(&self) -> Result<u64> {
        match self.id.load(Ordering::SeqCst) {
            0 => Err(Status::new(
                StatusClass::MiddlewareError,
                StatusCode::InvalidConnection,
                "Loopback driver is not connected",
            )),
            id => Ok(id),
        }
    }
}

impl Transport for LoopbackTransport {
    fn set_host(&self, host: Arc<DriverHost>) {
        *self.host.lock() = Some(host);
    }

    fn connect(&self) -> Result<()> {
        *self.state.lock() = TransportState::Initializing;

        let bus = bus();
        let id = bus.next_id.fetch_add(1, Ordering::SeqCst);
        bus.clients.lock().insert(
            id,
            ClientSlot {
                subscriptions: Vec::new(),
                queue: Arc::clone(&self.queue),
                host: self.host.lock().clone(),
            },
        );
        self.id.store(id, Ordering::SeqCst);

        *self.state.lock() = TransportState::Connected;
        debug!(client = id, "loopback client attached");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        let id = self.id.swap(0, Ordering::SeqCst);
        if id != 0 {
            bus().clients.lock().remove(&id);
        }
        self.queue.clear();
        *self.state.lock() = TransportState::Disconnected;
        debug!(client = id, "loopback client detached");
        Ok(())
    }

    fn subscribe(&self, pattern: &str, _config: &Config) -> Result<()> {
        let id = self.client_id()?;
        let parsed: Pattern = pattern.parse()?;
        let mut clients = bus().clients.lock();
        let slot = clients.get_mut(&id).ok_or_else(|| {
            Status::new(
                StatusClass::MiddlewareError,
                StatusCode::ConnectionLost,
                "Loopback bus has shut down",
            )
        })?;
        slot.subscriptions.push((pattern.to_string(), parsed));
        Ok(())
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        let id = self.client_id()?;
        let mut clients = bus().clients.lock();
        if let Some(slot) = clients.get_mut(&id) {
            slot.subscriptions.retain(|(text, _)| text != pattern);
        }
        Ok(())
    }

    fn publish(&self, msg: &Message, _config: &Config) -> Result<()> {
        self.client_id()?;

        // Round-trip through the wire form so the delivered copy carries
        // exactly what a broker would deliver (no meta, no config).
        let frame = Message::from_bytes(&msg.to_bytes()?)?;

        // Snapshot the matching targets, then deliver outside the bus
        // lock: reply delivery runs user callbacks, which may publish.
        let targets: Vec<(Option<Arc<DriverHost>>, Arc<InboundQueue>)> = bus()
            .clients
            .lock()
            .values()
            .filter(|slot| {
                slot.subscriptions
                    .iter()
                    .any(|(_, pattern)| pattern.matches(frame.subject()))
            })
            .map(|slot| (slot.host.clone(), Arc::clone(&slot.queue)))
            .collect();

        for (host, queue) in targets {
            // Replies go straight to the receiving connection's
            // correlator via its host; everything else queues.
            match (host, frame.kind()) {
                (Some(host), crate::message::Kind::Reply) if host.is_alive() => {
                    host.on_reply(frame.clone())
                }
                _ => queue.push(frame.clone()),
            }
        }
        Ok(())
    }

    fn receive(&self, timeout_ms: i32) -> Result<Option<Message>> {
        self.client_id()?;
        Ok(self.queue.pop(timeout_ms))
    }

    fn library_name(&self) -> &'static str {
        "loopback"
    }

    fn library_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn endpoint(&self) -> Option<String> {
        Some("loopback://process".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;

    fn connected() -> LoopbackTransport {
        let t = LoopbackTransport::new(&Config::new());
        t.connect().unwrap();
        t
    }

    fn msg(subject: &str) -> Message {
        Message::new(subject, Kind::Publish).unwrap()
    }

    #[test]
    fn delivers_to_matching_subscribers_only() {
        let publisher = connected();
        let subscriber = connected();
        subscriber.subscribe("LB1.A.>", &Config::new()).unwrap();

        publisher.publish(&msg("LB1.A.B"), &Config::new()).unwrap();
        publisher.publish(&msg("LB1.B.X"), &Config::new()).unwrap();

        let got = subscriber.receive(500).unwrap().unwrap();
        assert_eq!(got.subject(), "LB1.A.B");
        assert!(subscriber.receive(0).unwrap().is_none());

        publisher.disconnect().unwrap();
        subscriber.disconnect().unwrap();
    }

    #[test]
    fn publisher_receives_its_own_matching_traffic() {
        let client = connected();
        client.subscribe("LB2.SELF.*", &Config::new()).unwrap();
        client.publish(&msg("LB2.SELF.X"), &Config::new()).unwrap();
        assert!(client.receive(500).unwrap().is_some());
        client.disconnect().unwrap();
    }

    #[test]
    fn operations_require_a_connected_driver() {
        let t = LoopbackTransport::new(&Config::new());
        assert!(t.publish(&msg("LB3.A"), &Config::new()).is_err());
        assert!(t.subscribe("LB3.A", &Config::new()).is_err());
        assert!(t.receive(0).is_err());
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let client = connected();
        client.subscribe("LB4.A.>", &Config::new()).unwrap();
        client.unsubscribe("LB4.A.>").unwrap();
        client.publish(&msg("LB4.A.B"), &Config::new()).unwrap();
        assert!(client.receive(0).unwrap().is_none());
        client.disconnect().unwrap();
    }
}
