//! # Groundbus
//!
//! A middleware-agnostic messaging API for command, control, and
//! telemetry buses used by spacecraft ground systems. Client programs
//! express intent with uniform verbs — publish, subscribe,
//! request/reply — against a typed, self-describing [`Message`] model;
//! a pluggable transport layer carries those messages over the broker
//! selected by configuration.
//!
//! ```no_run
//! use groundbus::{Config, Connection, Kind, Message};
//!
//! # fn main() -> groundbus::Result<()> {
//! let conn = Connection::new(Config::from_args("mw-id=loopback")?)?;
//! conn.connect()?;
//! conn.subscribe("TLM.SAT1.>")?;
//!
//! let mut msg = Message::new("TLM.SAT1.TEMP", Kind::Publish)?;
//! msg.add_field_value("VALUE", 21.5f32)?;
//! conn.publish(&msg)?;
//!
//! let _received = conn.receive(1000)?;
//! conn.disconnect()?;
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatch;
pub mod field;
pub mod filter;
pub mod logging;
pub mod message;
pub mod status;
pub mod subject;
pub mod subscription;
pub mod template;
pub mod transport;
pub mod util;

mod asyncpub;
mod perf;
mod track;

pub use config::Config;
pub use connection::{Connection, ConnectionState, ValidationMode};
pub use correlator::{get_reply_unique_id, REQUEST_REPUBLISH_NEVER};
pub use dispatch::{
    shared_callback, shared_event_callback, shared_reply_callback, Callback, ConnectionEvent,
    EventCallback, ReplyCallback,
};
pub use field::{Field, FieldType, FieldValue};
pub use message::{Kind, Message};
pub use status::{Result, Status, StatusClass, StatusCode};
pub use subject::Pattern;
pub use subscription::SubscriptionInfo;
pub use template::{FieldTemplate, MessageTemplate, Specification};
pub use track::{Tracking, TrackingDetails};
pub use util::WAIT_FOREVER;

/// The current version of the library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    /// Asynchronous publish queue depth.
    pub const ASYNC_QUEUE_DEPTH: usize = crate::asyncpub::DEFAULT_QUEUE_DEPTH;

    /// Grace period for draining the async queue at teardown (ms).
    pub const ASYNC_TEARDOWN_WAIT_MS: i64 = crate::asyncpub::DEFAULT_TEARDOWN_WAIT_MS;

    /// Maximum messages per aggregation bin.
    pub const MSG_BIN_SIZE: usize = crate::aggregate::DEFAULT_BIN_SIZE;

    /// Maximum age of an aggregation bin before it flushes (ms).
    pub const MSG_BIN_TIMEOUT_MS: u64 = crate::aggregate::DEFAULT_BIN_TIMEOUT_MS;

    /// Window of the duplicate-suppression filter.
    pub const UNIQUE_FILTER_WINDOW: usize = crate::filter::DEFAULT_UNIQUE_WINDOW;
}
