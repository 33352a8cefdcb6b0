//! Bolt TCP driver.
//!
//! Connects to a Bolt server and exchanges length-prefixed bincode
//! frames: a 4-byte little-endian length followed by the encoded
//! [`WireFrame`]. A dedicated reader thread drains the socket into the
//! inbound queue and reports a lost link through the driver host.
//!
//! Socket tuning (no-delay, send/receive buffers) matches what the
//! server side expects for low-latency command traffic.

use crate::config::{keys, Config};
use crate::dispatch::ConnectionEvent;
use crate::message::Message;
use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::transport::{DriverHost, InboundQueue, Transport, TransportState};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_SERVER: &str = "127.0.0.1:9100";
const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frames exchanged with a Bolt server.
///
/// Public so server-side tooling can speak the protocol.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireFrame {
    /// Client announces itself.
    Hello { session: String },
    Subscribe { pattern: String },
    Unsubscribe { pattern: String },
    Publish { message: Message },
}

pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<WireFrame> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    bincode::deserialize(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub fn write_frame(stream: &mut TcpStream, frame: &WireFrame) -> std::io::Result<()> {
    let payload = bincode::serialize(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()
}

fn io_status(context: &str, err: &std::io::Error) -> Status {
    use std::io::ErrorKind;
    let status = match err.kind() {
        // Link-level failures the connection runtime may recover from
        // with a reconnect.
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::UnexpectedEof => Status::new(
            StatusClass::MiddlewareError,
            StatusCode::ConnectionLost,
            format!("{context}: {err}"),
        ),
        _ => Status::middleware(format!("{context}: {err}")),
    };
    status.with_custom_code(err.raw_os_error().unwrap_or(0))
}

/// Driver for the Bolt TCP server.
pub struct BoltTransport {
    server: String,
    buffer_size: usize,
    session: String,
    state: Mutex<TransportState>,
    writer: Mutex<Option<TcpStream>>,
    inbound: Arc<InboundQueue>,
    host: Mutex<Option<Arc<DriverHost>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    link_up: Arc<AtomicBool>,
}

impl BoltTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let server = config
            .value_of_any(&[keys::SERVER, keys::MW_SERVER])
            .unwrap_or(DEFAULT_SERVER)
            .to_string();
        let buffer_size = match config.integer_value("mw-buffer-size", DEFAULT_BUFFER_SIZE as i64)
        {
            n if n > 0 => n as usize,
            _ => DEFAULT_BUFFER_SIZE,
        };

        Ok(Self {
            server,
            buffer_size,
            session: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(TransportState::Uninitialized),
            writer: Mutex::new(None),
            inbound: InboundQueue::new(),
            host: Mutex::new(None),
            reader: Mutex::new(None),
            link_up: Arc::new(AtomicBool::new(false)),
        })
    }

    fn send_frame(&self, frame: &WireFrame) -> Result<()> {
        let mut writer = self.writer.lock();
        let stream = writer.as_mut().ok_or_else(|| {
            Status::new(
                StatusClass::MiddlewareError,
                StatusCode::InvalidConnection,
                "Bolt driver is not connected",
            )
        })?;
        write_frame(stream, frame).map_err(|e| io_status("bolt send", &e))
    }
}

impl Transport for BoltTransport {
    fn set_host(&self, host: Arc<DriverHost>) {
        *self.host.lock() = Some(host);
    }

    fn connect(&self) -> Result<()> {
        *self.state.lock() = TransportState::Initializing;

        debug!(server = %self.server, "bolt client connecting");
        let stream = TcpStream::connect(&self.server).map_err(|e| {
            io_status(&format!("bolt connect to {}", self.server), &e)
        })?;

        // Low-latency socket options, matching the server's expectations.
        let sock = socket2::SockRef::from(&stream);
        let _ = sock.set_nodelay(true);
        let _ = sock.set_recv_buffer_size(self.buffer_size);
        let _ = sock.set_send_buffer_size(self.buffer_size);

        let mut reader_stream = stream
            .try_clone()
            .map_err(|e| io_status("bolt stream clone", &e))?;

        {
            let mut writer = self.writer.lock();
            *writer = Some(stream);
        }
        self.send_frame(&WireFrame::Hello {
            session: self.session.clone(),
        })?;

        self.link_up.store(true, Ordering::SeqCst);
        let link_up = Arc::clone(&self.link_up);
        let inbound = Arc::clone(&self.inbound);
        let host = self.host.lock().clone();
        let server = self.server.clone();

        let handle = std::thread::Builder::new()
            .name("bolt-reader".into())
            .spawn(move || {
                debug!(server = %server, "bolt reader started");
                loop {
                    match read_frame(&mut reader_stream) {
                        Ok(WireFrame::Publish { message }) => {
                            // Replies go straight to the correlator via
                            // the host; everything else queues for
                            // receive().
                            match (&host, message.kind()) {
                                (Some(host), crate::message::Kind::Reply)
                                    if host.is_alive() =>
                                {
                                    host.on_reply(message)
                                }
                                _ => inbound.push(message),
                            }
                        }
                        Ok(other) => {
                            warn!(?other, "unexpected frame from bolt server");
                        }
                        Err(e) => {
                            // Silent exit on an orderly disconnect; a lost
                            // link is reported through the host.
                            if link_up.swap(false, Ordering::SeqCst) {
                                warn!(error = %e, "bolt link lost");
                                if let Some(host) = &host {
                                    host.dispatch_event(
                                        ConnectionEvent::ConnectionBroken,
                                        io_status("bolt receive", &e),
                                    );
                                }
                            }
                            break;
                        }
                    }
                }
                debug!("bolt reader stopped");
            })
            .expect("spawn bolt-reader");
        *self.reader.lock() = Some(handle);

        *self.state.lock() = TransportState::Connected;
        debug!(server = %self.server, "bolt client connected");
        Ok(())
    }

    fn disconnect(&self) -> Result<()> {
        // An orderly disconnect: the reader exits without raising events.
        self.link_up.store(false, Ordering::SeqCst);

        if let Some(stream) = self.writer.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.reader.lock().take() {
            let _ = handle.join();
        }
        self.inbound.clear();
        *self.state.lock() = TransportState::Disconnected;
        Ok(())
    }

    fn subscribe(&self, pattern: &str, _config: &Config) -> Result<()> {
        self.send_frame(&WireFrame::Subscribe {
            pattern: pattern.to_string(),
        })
    }

    fn unsubscribe(&self, pattern: &str) -> Result<()> {
        self.send_frame(&WireFrame::Unsubscribe {
            pattern: pattern.to_string(),
        })
    }

    fn publish(&self, msg: &Message, _config: &Config) -> Result<()> {
        // Shed meta/config exactly as the wire form does.
        let message = Message::from_bytes(&msg.to_bytes()?)?;
        self.send_frame(&WireFrame::Publish { message })
    }

    fn receive(&self, timeout_ms: i32) -> Result<Option<Message>> {
        if *self.state.lock() != TransportState::Connected {
            return Err(Status::new(
                StatusClass::MiddlewareError,
                StatusCode::InvalidConnection,
                "Bolt driver is not connected",
            ));
        }
        Ok(self.inbound.pop(timeout_ms))
    }

    fn unique_id(&self) -> String {
        format!("{}-{}", self.session, uuid::Uuid::new_v4())
    }

    fn library_name(&self) -> &'static str {
        "bolt"
    }

    fn library_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn endpoint(&self) -> Option<String> {
        Some(format!("bolt://{}", self.server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kind;
    use crate::subject::Pattern;
    use std::net::TcpListener;

    /// Minimal single-client broker: subscriptions are honored and
    /// matching publishes are reflected back to the client.
    fn spawn_mini_broker() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut subs: Vec<Pattern> = Vec::new();
            loop {
                match read_frame(&mut stream) {
                    Ok(WireFrame::Hello { .. }) => {}
                    Ok(WireFrame::Subscribe { pattern }) => {
                        subs.push(pattern.parse().unwrap());
                    }
                    Ok(WireFrame::Unsubscribe { pattern }) => {
                        let parsed: Pattern = pattern.parse().unwrap();
                        subs.retain(|p| *p != parsed);
                    }
                    Ok(WireFrame::Publish { message }) => {
                        if subs.iter().any(|p| p.matches(message.subject())) {
                            let _ = write_frame(&mut stream, &WireFrame::Publish { message });
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        addr
    }

    fn msg(subject: &str) -> Message {
        let mut m = Message::new(subject, Kind::Publish).unwrap();
        m.add_field_value("X", 42i32).unwrap();
        m
    }

    #[test]
    fn round_trip_through_mini_broker() {
        let addr = spawn_mini_broker();
        let config = Config::from_args(&format!("mw-id=bolt server={addr}")).unwrap();
        let driver = BoltTransport::new(&config).unwrap();

        driver.connect().unwrap();
        driver.subscribe("BOLT.A.>", &Config::new()).unwrap();
        driver.publish(&msg("BOLT.A.B"), &Config::new()).unwrap();
        driver.publish(&msg("BOLT.Z.Z"), &Config::new()).unwrap();

        let got = driver.receive(2000).unwrap().expect("no message");
        assert_eq!(got.subject(), "BOLT.A.B");
        assert_eq!(got.get_field("X").unwrap().i64_value().unwrap(), 42);
        assert!(driver.receive(100).unwrap().is_none());

        driver.disconnect().unwrap();
    }

    #[test]
    fn connect_failure_is_reported() {
        // A port from the dynamic range with nothing listening.
        let config = Config::from_args("mw-id=bolt server=127.0.0.1:1").unwrap();
        let driver = BoltTransport::new(&config).unwrap();
        assert!(driver.connect().is_err());
    }

    #[test]
    fn publish_without_connect_is_rejected() {
        let driver = BoltTransport::new(&Config::new()).unwrap();
        let err = driver.publish(&msg("BOLT.A"), &Config::new()).unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidConnection);
    }

    #[test]
    fn frame_codec_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            write_frame(
                &mut stream,
                &WireFrame::Subscribe {
                    pattern: "A.>".into(),
                },
            )
            .unwrap();
            write_frame(&mut stream, &WireFrame::Publish { message: msg("A.B") }).unwrap();
        });

        let (mut stream, _) = listener.accept().unwrap();
        match read_frame(&mut stream).unwrap() {
            WireFrame::Subscribe { pattern } => assert_eq!(pattern, "A.>"),
            other => panic!("unexpected {other:?}"),
        }
        match read_frame(&mut stream).unwrap() {
            WireFrame::Publish { message } => assert_eq!(message.subject(), "A.B"),
            other => panic!("unexpected {other:?}"),
        }
        writer.join().unwrap();
    }
}
