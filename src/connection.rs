//! # Connection Module
//!
//! The [`Connection`] is the façade over the whole runtime: it owns the
//! middleware driver, the subscription registry and callback lookup, the
//! request correlator, the aggregation toolkit, the async publish queue,
//! the auto-dispatcher, and the event bus, and it sequences every
//! send/receive through the validation, tracking, and filtering
//! pipeline.
//!
//! ## Locking Discipline
//!
//! Four ticketed (FIFO) locks guard the shared state:
//!
//! - the **read** lock: subscription registry and callback lookup;
//! - the **write** lock: outbound driver calls;
//! - the **event** lock: inside [`EventBus`], serializing callbacks;
//! - the **counter** lock: the monotone counter behind unique IDs.
//!
//! Background workers (correlator, aggregator, async publisher,
//! auto-dispatcher, performance logger) hold only weak references to the
//! core and exit promptly when the connection goes away.

use crate::aggregate::{self, Aggregator, CompositePublisher};
use crate::asyncpub::{AsyncPublisher, DirectPublisher, DEFAULT_TEARDOWN_WAIT_MS};
use crate::config::{keys, Config};
use crate::correlator::{
    get_reply_unique_id, PendingRequest, RequestCorrelator, RequestSender,
    LEGACY_REPLY_UNIQUE_ID_FIELD, REPLY_UNIQUE_ID_FIELD, REQUEST_PUBLISH_WAIT_MS,
};
use crate::dispatch::{
    run_callbacks, AutoDispatcher, CallbackLookup, ConnectionEvent, EventBus, SharedCallback,
    SharedEventCallback, SharedReplyCallback,
};
use crate::field::{Field, FieldValue};
use crate::filter::{ExclusionFilter, UniqueFilter};
use crate::message::{Kind, Message};
use crate::perf::PerfLogger;
use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::subject::Pattern;
use crate::subscription::{
    ActiveSubscriptions, SubscriptionEntry, SubscriptionInfo, SubscriptionRegistry,
    SubscriptionStatus,
};
use crate::template::Specification;
use crate::track::{TrackingDetails, TrackingInjector};
use crate::transport::{self, ConnectionHost, DriverHost, InboundQueue, Transport};
use crate::util::{current_timestamp_ms, TicketMutex, WAIT_FOREVER};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static DEFAULT_MAX_CONN_RETRIES: i64 = 0;
static DEFAULT_CONN_RETRY_INTERVAL_MS: i64 = 5000;

/// Per-process connection ordinal.
static INSTANCE_COUNT: AtomicU32 = AtomicU32::new(0);

/// Logical connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotConnected,
    Connected,
    Reconnecting,
}

/// Message validation mode resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    None,
    Send,
    Recv,
    All,
}

impl ValidationMode {
    fn from_config(config: &Config) -> Self {
        let mut mode = ValidationMode::None;
        if config.boolean_value(keys::MSG_CONTENT_VALIDATE, false) {
            mode = ValidationMode::Send;
        }
        if config.boolean_value(keys::MSG_CONTENT_VALIDATE_ALL, false) {
            mode = ValidationMode::All;
        }
        if mode == ValidationMode::None {
            if config.boolean_value(keys::MSG_CONTENT_VALIDATE_RECV, false) {
                mode = ValidationMode::Recv;
            }
            if config.boolean_value(keys::MSG_CONTENT_VALIDATE_SEND, false) {
                mode = if mode == ValidationMode::Recv {
                    ValidationMode::All
                } else {
                    ValidationMode::Send
                };
            }
        }
        mode
    }

    fn on_send(&self) -> bool {
        matches!(self, ValidationMode::Send | ValidationMode::All)
    }

    fn on_recv(&self) -> bool {
        matches!(self, ValidationMode::Recv | ValidationMode::All)
    }
}

/// Request/reply shaping resolved from configuration.
struct RequestSpecs {
    multi_response: bool,
    subscribe_for_response: bool,
    expose_replies: bool,
    reply_subject: Option<String>,
    disabled: bool,
    default_republish_ms: i32,
}

impl RequestSpecs {
    fn from_config(config: &Config) -> Self {
        // Open-response mode: replies are ordinary published traffic.
        // The requester manages its own subscription and sees replies
        // through receive/dispatch.
        let open_resp = config
            .value(keys::REQ_RESP_BEHAVIOR)
            .map(|v| v.eq_ignore_ascii_case("open-resp"))
            .unwrap_or(false);

        Self {
            multi_response: config.boolean_value(keys::MULTI_RESPONSE, false),
            subscribe_for_response: config
                .boolean_value(keys::SUBSCRIBE_FOR_RESPONSE, !open_resp),
            expose_replies: config.boolean_value(keys::EXPOSE_REPLIES, open_resp),
            reply_subject: config.value(keys::REPLY_SUBJECT).map(str::to_string),
            disabled: config.boolean_value(keys::DISABLE_RR, false),
            default_republish_ms: config.integer_value(keys::REQ_REPUBLISH_MS, 0) as i32,
        }
    }
}

struct ReadState {
    registry: SubscriptionRegistry,
    lookup: CallbackLookup,
    /// Reply subjects subscribed internally for request/reply.
    response_subscriptions: Vec<String>,
}

pub(crate) struct ConnectionCore {
    config: Config,
    driver: Box<dyn Transport>,

    state: Mutex<ConnectionState>,
    alive: AtomicBool,
    host: Mutex<Option<Arc<DriverHost>>>,

    read: TicketMutex<ReadState>,
    write: TicketMutex<()>,
    counter: TicketMutex<u32>,
    pub(crate) events: EventBus,

    exclusions: Mutex<ExclusionFilter>,
    dup_filter: Option<Mutex<UniqueFilter>>,
    pushed_inbound: Arc<InboundQueue>,

    spec: Specification,
    validate: ValidationMode,
    remove_tracking: bool,
    injector: TrackingInjector,

    correlator: RequestCorrelator,
    request_specs: RequestSpecs,
    support_legacy_api: bool,

    aggregator: Aggregator,
    use_bins: bool,

    async_publisher: Mutex<Option<AsyncPublisher>>,
    use_global_async: bool,
    async_queue_depth: usize,
    async_teardown_wait_ms: u64,

    auto_dispatcher: AutoDispatcher,

    perf: Mutex<Option<PerfLogger>>,
    perf_path: Option<String>,

    name: Mutex<String>,
    conn_id: String,
    mw_info: Mutex<String>,
    endpoint: Mutex<Option<String>>,

    max_conn_retries: i64,
    conn_retry_interval_ms: u64,
    next_handle: AtomicU64,

    /// Weak self-reference handed to background workers.
    self_ref: Mutex<Weak<ConnectionCore>>,
}

/// A logical bus connection.
///
/// Created from a [`Config`] that selects the driver and tunes the
/// runtime; no traffic flows until [`Connection::connect`].
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    pub fn new(config: Config) -> Result<Self> {
        let driver = transport::create_transport(&config)?;
        let spec = Specification::from_config(&config)?;
        let ordinal = INSTANCE_COUNT.fetch_add(1, Ordering::SeqCst) + 1;

        let host_name = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| {
                warn!("Error acquiring host name");
                "unknown".to_string()
            })
            .to_uppercase();
        let user_lower = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| {
                warn!("Error acquiring user name");
                "unknown".to_string()
            })
            .to_lowercase();
        let user_upper = user_lower.to_uppercase();
        let process_id = std::process::id();

        // Connection ID: GMSEC_<HOST>_<sec hex><subsec hex>_<pid>_<ordinal>
        let conn_id = {
            let now_ms = current_timestamp_ms();
            let sec = (now_ms / 1000) as u32;
            let subsec = (((now_ms % 1000) as f64 / 1000.0) * 65536.0) as u16;
            format!("GMSEC_{host_name}_{sec:X}{subsec:04X}_{process_id}_{ordinal}")
        };

        let perf_path = config.value(keys::LOG_PERFORMANCE).map(str::to_string);

        let injector = TrackingInjector {
            details: TrackingDetails::for_connection(&config),
            host_name,
            user_lower,
            user_upper,
            process_id,
            connection_ordinal: ordinal,
            conn_id: conn_id.clone(),
            spec_version: spec.version(),
            schema_level: spec.schema_level(),
            perf_logger_active: perf_path.is_some(),
        };

        let async_queue_depth = AsyncPublisher::clamp_depth(config.integer_value(
            keys::ASYNC_PUBLISH_QUEUE_DEPTH,
            crate::asyncpub::DEFAULT_QUEUE_DEPTH as i64,
        ));
        let async_teardown_wait_ms =
            match config.integer_value(keys::ASYNC_PUBLISH_TEARDOWN_WAIT, DEFAULT_TEARDOWN_WAIT_MS)
            {
                n if n > 0 => n as u64,
                _ => {
                    warn!("Invalid async publish teardown wait, using default");
                    DEFAULT_TEARDOWN_WAIT_MS as u64
                }
            };

        let max_conn_retries = config
            .integer_value(keys::MAX_CONN_RETRIES, DEFAULT_MAX_CONN_RETRIES)
            .max(-1);
        let conn_retry_interval_ms = config
            .integer_value(keys::CONN_RETRY_INTERVAL, DEFAULT_CONN_RETRY_INTERVAL_MS)
            .max(0) as u64;

        let dup_filter = if config.boolean_value(keys::FILTER_DUPS, true) {
            Some(Mutex::new(UniqueFilter::default()))
        } else {
            None
        };

        let core = Arc::new(ConnectionCore {
            driver,
            state: Mutex::new(ConnectionState::NotConnected),
            alive: AtomicBool::new(false),
            host: Mutex::new(None),
            read: TicketMutex::new(ReadState {
                registry: SubscriptionRegistry::new(),
                lookup: CallbackLookup::new(),
                response_subscriptions: Vec::new(),
            }),
            write: TicketMutex::new(()),
            counter: TicketMutex::new(0),
            events: EventBus::new(),
            exclusions: Mutex::new(ExclusionFilter::new()),
            dup_filter,
            pushed_inbound: InboundQueue::new(),
            validate: ValidationMode::from_config(&config),
            remove_tracking: config.boolean_value(keys::REMOVE_TRACKING_FIELDS, false),
            injector,
            correlator: RequestCorrelator::new(),
            request_specs: RequestSpecs::from_config(&config),
            support_legacy_api: config.boolean_value(keys::SUPPORT_LEGACY_API, false),
            aggregator: Aggregator::from_config(&config)?,
            use_bins: config.boolean_value(keys::USE_MSG_BINS, false),
            async_publisher: Mutex::new(None),
            use_global_async: config.boolean_value(keys::ASYNC_PUBLISH, false),
            async_queue_depth,
            async_teardown_wait_ms,
            auto_dispatcher: AutoDispatcher::new(),
            perf: Mutex::new(None),
            perf_path,
            name: Mutex::new(format!("Connection {ordinal}")),
            conn_id,
            mw_info: Mutex::new(String::new()),
            endpoint: Mutex::new(None),
            max_conn_retries,
            conn_retry_interval_ms,
            next_handle: AtomicU64::new(1),
            self_ref: Mutex::new(Weak::new()),
            spec,
            config,
        });
        *core.self_ref.lock() = Arc::downgrade(&core);

        Ok(Self { core })
    }

    /// Convenience: build a connection straight from `name=value` text.
    pub fn from_args(args: &str) -> Result<Self> {
        Self::new(Config::from_args(args)?)
    }

    // ---- lifecycle ----

    /// Establish the driver link, honoring the configured retry policy.
    pub fn connect(&self) -> Result<()> {
        if self.core.state() == ConnectionState::Connected {
            return Err(Status::new(
                StatusClass::ConnectionError,
                StatusCode::ConnectionConnected,
                "A connection has already been established",
            ));
        }

        let core = &self.core;

        // Give the driver its host handle before the first attempt.
        let as_host: Arc<dyn ConnectionHost> = Arc::clone(core) as Arc<dyn ConnectionHost>;
        let host = DriverHost::new(Arc::downgrade(&as_host));
        *core.host.lock() = Some(Arc::clone(&host));
        core.driver.set_host(host);

        let mut attempts: i64 = 0;
        loop {
            match core.driver.connect() {
                Ok(()) => break,
                Err(status) => {
                    attempts += 1;
                    let retry = core.max_conn_retries == -1 || attempts <= core.max_conn_retries;
                    if !retry {
                        return Err(status);
                    }
                    warn!(%status, attempt = attempts, "connect failed, retrying");
                    std::thread::sleep(Duration::from_millis(core.conn_retry_interval_ms));
                }
            }
        }

        *core.mw_info.lock() = core.driver.middleware_info();
        *core.endpoint.lock() = core.driver.endpoint();

        if let Some(path) = &core.perf_path {
            *core.perf.lock() = Some(PerfLogger::start(path)?);
        }

        if core.use_bins {
            let publisher: Arc<dyn CompositePublisher> =
                Arc::clone(core) as Arc<dyn CompositePublisher>;
            core.aggregator.start(Arc::downgrade(&publisher));
        }

        core.alive.store(true, Ordering::SeqCst);
        core.set_state(ConnectionState::Connected);
        info!(id = %core.conn_id, "connection established");

        core.events.dispatch(
            ConnectionEvent::ConnectionSuccessful,
            &Status::new(
                StatusClass::NoError,
                StatusCode::NoErrorCode,
                "Connection established",
            ),
        );
        Ok(())
    }

    /// Tear the connection down: background threads are quiesced, the
    /// async queue drains within its grace period, open bins flush, and
    /// the driver link closes.
    pub fn disconnect(&self) -> Result<()> {
        let core = &self.core;
        if core.state() == ConnectionState::NotConnected {
            return Err(Status::not_connected());
        }

        // First step: make any late driver callback a no-op.
        if let Some(host) = core.host.lock().as_ref() {
            host.clear();
        }

        core.auto_dispatcher.stop(true);

        // Flush bins while the driver can still publish.
        if core.aggregator.is_running() {
            core.aggregator.stop(core.as_ref());
        }

        if let Some(publisher) = core.async_publisher.lock().take() {
            publisher.teardown(core.async_teardown_wait_ms);
        }

        core.correlator.quit();

        if let Some(perf) = core.perf.lock().take() {
            perf.stop();
        }

        core.alive.store(false, Ordering::SeqCst);

        // Drop driver-level subscriptions and the global registrations.
        let entries: Vec<SubscriptionEntry> = {
            let mut read = core.read.lock();
            read.response_subscriptions.clear();
            read.registry.drain()
        };
        let service = ActiveSubscriptions::global();
        for entry in &entries {
            service.unregister(&entry.pattern);
        }

        let result = {
            let _write = core.write.lock();
            core.driver.disconnect()
        };

        core.set_state(ConnectionState::NotConnected);
        *core.host.lock() = None;
        info!(id = %core.conn_id, "connection closed");
        result
    }

    // ---- subscriptions ----

    pub fn subscribe(&self, pattern: &str) -> Result<SubscriptionInfo> {
        self.core.subscribe_inner(pattern, Config::default(), None)
    }

    pub fn subscribe_with_config(
        &self,
        pattern: &str,
        config: &Config,
    ) -> Result<SubscriptionInfo> {
        self.core.subscribe_inner(pattern, config.clone(), None)
    }

    pub fn subscribe_with_callback(
        &self,
        pattern: &str,
        callback: SharedCallback,
    ) -> Result<SubscriptionInfo> {
        self.core
            .subscribe_inner(pattern, Config::default(), Some(callback))
    }

    pub fn unsubscribe(&self, info: SubscriptionInfo) -> Result<()> {
        let core = &self.core;
        core.require_connected()?;

        if info.connection_id() != core.conn_id {
            return Err(Status::new(
                StatusClass::ConnectionError,
                StatusCode::OtherErrorCode,
                "SubscriptionInfo object is not associated with this Connection",
            ));
        }

        let (entry, last_for_pattern) = {
            let mut read = core.read.lock();
            match read.registry.remove(info.handle()) {
                Some(entry) => {
                    if let Some(cb) = &entry.callback {
                        read.lookup.unregister(&entry.pattern, Some(cb));
                    }
                    let last = !read.registry.has_pattern(&entry.pattern);
                    (entry, last)
                }
                // Already unsubscribed: idempotent.
                None => return Ok(()),
            }
        };

        if last_for_pattern {
            let _write = core.write.lock();
            core.driver.unsubscribe(&entry.pattern)?;
        }
        ActiveSubscriptions::global().unregister(&entry.pattern);
        Ok(())
    }

    // ---- send paths ----

    pub fn publish(&self, msg: &Message) -> Result<()> {
        self.publish_with_config(msg, &Config::default())
    }

    pub fn publish_with_config(&self, msg: &Message, mw_config: &Config) -> Result<()> {
        let core = &self.core;
        core.require_connected()?;

        if msg.kind() != Kind::Publish {
            return Err(Status::invalid_msg(
                "Cannot publish message with non-PUBLISH message kind",
            ));
        }

        let is_composite = aggregate::is_aggregated(msg);
        if core.validate.on_send() && !is_composite {
            core.validate_outbound(msg)?;
        }

        // The caller's message is never mutated; tracking fields ride on
        // an internal clone only.
        let mut outbound = msg.clone();
        if core.strip_requested(msg) {
            core.injector.remove(&mut outbound);
        }
        core.insert_tracking(&mut outbound);

        if core.use_bins && !is_composite && core.aggregator.accepts(outbound.subject()) {
            // Surface any earlier background failure before accepting
            // more traffic.
            if let Some(status) = core.aggregator.take_publish_status() {
                return Err(status);
            }
            // The per-publish mw-config is intentionally not carried
            // into the eventual composite publish.
            core.aggregator.add_message(outbound);
            return Ok(());
        }

        core.send_or_enqueue(outbound, mw_config)
    }

    // ---- request / reply ----

    /// Synchronous request: blocks until a reply arrives, the timeout
    /// expires (republish NEVER → `Ok(None)`), or the connection shuts
    /// down.
    pub fn request(
        &self,
        request: &Message,
        timeout_ms: i32,
        republish_ms: i32,
    ) -> Result<Option<Message>> {
        let core = &self.core;
        let pending = core.prepare_request(request, timeout_ms, republish_ms, None)?;

        let reply = {
            let mut state = pending.state.lock();
            loop {
                if let Some(reply) = state.reply.take() {
                    break Some(reply);
                }
                if !state.active {
                    if state.quit {
                        return Err(Status::new(
                            StatusClass::ConnectionError,
                            StatusCode::RequestDispatchFailure,
                            "Request interrupted by connection shutdown",
                        ));
                    }
                    break None;
                }
                pending.delivered.wait(&mut state);
            }
        };

        pending.deactivate();
        core.correlator.remove(&pending.unique_id);

        if reply.is_none() && !pending.sent_latch.await_timeout(0) {
            // Mirror the callback form's first-send diagnostics.
            if !pending.sent_latch.await_timeout(REQUEST_PUBLISH_WAIT_MS) {
                warn!("request: initial send has not completed");
            }
        }

        Ok(reply)
    }

    /// Callback-form request: returns after the first copy of the
    /// request is on its way; the reply (or timeout event) arrives on
    /// the given callback.
    pub fn request_with_callback(
        &self,
        request: &Message,
        timeout_ms: i32,
        republish_ms: i32,
        callback: SharedReplyCallback,
    ) -> Result<()> {
        let core = &self.core;
        let pending = core.prepare_request(request, timeout_ms, republish_ms, Some(callback))?;

        if !pending.sent_latch.await_timeout(REQUEST_PUBLISH_WAIT_MS) {
            warn!("request (callback): initial send has not completed");
        }
        Ok(())
    }

    /// Send a reply correlated to a received request.
    pub fn reply(&self, request: &Message, reply: &Message) -> Result<()> {
        let core = &self.core;
        core.require_connected()?;
        if core.request_specs.disabled {
            return Err(core.rr_disabled());
        }

        if request.kind() != Kind::Request {
            return Err(Status::invalid_msg(
                "Cannot issue reply to a non-REQUEST kind message",
            ));
        }
        if reply.kind() != Kind::Reply {
            return Err(Status::invalid_msg(
                "Cannot issue reply with a non-REPLY kind message",
            ));
        }

        if core.validate.on_send() {
            core.validate_outbound(reply)?;
        }

        let mut outbound = reply.clone();
        if core.strip_requested(reply) {
            core.injector.remove(&mut outbound);
        }
        match get_reply_unique_id(request) {
            Some(unique_id) => {
                outbound.add_field(
                    Field::new(REPLY_UNIQUE_ID_FIELD, unique_id.clone())?.with_header(true),
                );
                if core.support_legacy_api {
                    outbound.add_field(
                        Field::new(LEGACY_REPLY_UNIQUE_ID_FIELD, unique_id)?.with_header(true),
                    );
                }
            }
            None => {
                warn!("request message does not carry a reply unique id");
            }
        }

        core.insert_tracking(&mut outbound);
        core.driver_publish(&outbound, &Config::default())
    }

    // ---- receive paths ----

    /// Blocking receive (`timeout_ms < 0` waits forever, `0` polls).
    pub fn receive(&self, timeout_ms: i32) -> Result<Option<Message>> {
        let core = &self.core;
        core.require_connected()?;
        core.require_manual_dispatch()?;
        core.receive_internal(timeout_ms)
    }

    /// Route a message through every matching subscription callback.
    pub fn dispatch(&self, msg: &Message) -> Result<()> {
        let core = &self.core;
        core.require_connected()?;
        core.require_manual_dispatch()?;
        core.dispatch_internal(msg);
        Ok(())
    }

    pub fn start_auto_dispatch(&self) -> Result<bool> {
        let core = &self.core;
        core.require_connected()?;
        Ok(core.auto_dispatcher.start(core))
    }

    pub fn stop_auto_dispatch(&self, wait_for_completion: bool) -> Result<bool> {
        self.core.require_connected()?;
        Ok(self.core.auto_dispatcher.stop(wait_for_completion))
    }

    // ---- filters and events ----

    pub fn exclude_subject(&self, pattern: &str) -> Result<()> {
        self.core.exclusions.lock().exclude_subject(pattern)
    }

    pub fn remove_excluded_subject(&self, pattern: &str) -> Result<bool> {
        self.core.exclusions.lock().remove_excluded_subject(pattern)
    }

    pub fn register_event_callback(&self, event: ConnectionEvent, callback: SharedEventCallback) {
        self.core.events.register(event, callback);
    }

    // ---- observability ----

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn name(&self) -> String {
        self.core.name.lock().clone()
    }

    pub fn set_name(&self, name: &str) {
        *self.core.name.lock() = name.to_string();
    }

    /// The connection's unique identifier (`GMSEC_<HOST>_<TS>_<PID>_<N>`).
    pub fn id(&self) -> &str {
        &self.core.conn_id
    }

    pub fn library_name(&self) -> &'static str {
        self.core.driver.library_name()
    }

    pub fn library_version(&self) -> String {
        self.core.driver.library_version()
    }

    pub fn middleware_info(&self) -> String {
        self.core.mw_info.lock().clone()
    }

    pub fn connection_endpoint(&self) -> Option<String> {
        self.core.endpoint.lock().clone()
    }

    /// Messages currently waiting in the asynchronous publish queue.
    pub fn publish_queue_message_count(&self) -> usize {
        self.core
            .async_publisher
            .lock()
            .as_ref()
            .map(|p| p.queued())
            .unwrap_or(0)
    }

    /// Access to the message specification in force.
    pub fn specification(&self) -> &Specification {
        &self.core.spec
    }

    /// Tear down every process-wide middleware resource: the in-process
    /// bus and the active-subscription service.
    pub fn shutdown_all_middlewares() {
        transport::loopback::shutdown();
        ActiveSubscriptions::global().reset();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.core.state() != ConnectionState::NotConnected {
            let _ = self.disconnect();
        }
    }
}

impl ConnectionCore {
    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn require_connected(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            _ => Err(Status::not_connected()),
        }
    }

    fn require_manual_dispatch(&self) -> Result<()> {
        if self.auto_dispatcher.is_running() {
            return Err(Status::new(
                StatusClass::ConnectionError,
                StatusCode::AutodispatchExclusive,
                "Receive and dispatch are not available while the auto-dispatcher is running",
            ));
        }
        Ok(())
    }

    fn rr_disabled(&self) -> Status {
        Status::new(
            StatusClass::ConnectionError,
            StatusCode::FeatureNotSupported,
            "Request/reply functionality has been disabled for this Connection",
        )
    }

    fn next_counter(&self) -> u32 {
        let mut counter = self.counter.lock();
        *counter += 1;
        *counter
    }

    /// Whether user-supplied tracking fields should be stripped from
    /// this message before validation and send.
    fn strip_requested(&self, msg: &Message) -> bool {
        self.remove_tracking
            || msg
                .config()
                .boolean_value(keys::REMOVE_TRACKING_FIELDS, false)
    }

    fn insert_tracking(&self, msg: &mut Message) {
        let counter = self.next_counter();
        let mw_info = self.mw_info.lock().clone();
        let endpoint = self.endpoint.lock().clone();
        let subs = ActiveSubscriptions::global().topics();
        self.injector
            .insert(msg, counter, &mw_info, endpoint.as_deref(), &subs);
    }

    /// Send-side validation with optional tracking-field stripping.
    fn validate_outbound(&self, msg: &Message) -> Result<()> {
        if self.strip_requested(msg) {
            let mut copy = msg.clone();
            self.injector.remove(&mut copy);
            self.spec.validate(&copy)
        } else {
            self.spec.validate(msg)
        }
    }

    fn subscribe_inner(
        &self,
        pattern: &str,
        config: Config,
        callback: Option<SharedCallback>,
    ) -> Result<SubscriptionInfo> {
        self.require_connected()?;
        let _parsed: Pattern = pattern.parse()?;

        let (is_new, handle) = {
            let mut read = self.read.lock();
            match read.registry.check(pattern, callback.as_ref()) {
                SubscriptionStatus::Duplicate => {
                    return Err(Status::new(
                        StatusClass::ConnectionError,
                        StatusCode::InvalidSubjectName,
                        "Duplicate subscription",
                    ));
                }
                SubscriptionStatus::DuplicateUsingCallback => {
                    return Err(Status::new(
                        StatusClass::ConnectionError,
                        StatusCode::InvalidSubjectName,
                        "Duplicate subscription using same callback",
                    ));
                }
                status => {
                    let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
                    if let Some(cb) = &callback {
                        read.lookup.register(pattern, Arc::clone(cb))?;
                    }
                    read.registry.add(SubscriptionEntry {
                        handle,
                        pattern: pattern.to_string(),
                        callback,
                        config: config.clone(),
                    });
                    (status == SubscriptionStatus::IsNew, handle)
                }
            }
        };

        if is_new {
            // The driver sees the connection config overlaid with the
            // per-subscription options.
            let driver_config = {
                let mut merged = self.config.clone();
                merged.merge(&config, true);
                merged
            };
            let result = {
                let _write = self.write.lock();
                self.driver.subscribe(pattern, &driver_config)
            };
            if let Err(status) = result {
                // Roll back the registry entry the driver refused.
                let mut read = self.read.lock();
                if let Some(entry) = read.registry.remove(handle) {
                    if let Some(cb) = &entry.callback {
                        read.lookup.unregister(&entry.pattern, Some(cb));
                    }
                }
                return Err(status);
            }
        }

        ActiveSubscriptions::global().register(pattern);
        debug!(pattern, "subscribed");
        Ok(SubscriptionInfo::new(handle, pattern, &self.conn_id))
    }

    /// Common request setup shared by the sync and callback forms.
    fn prepare_request(
        &self,
        request: &Message,
        timeout_ms: i32,
        republish_ms: i32,
        callback: Option<SharedReplyCallback>,
    ) -> Result<Arc<PendingRequest>> {
        self.require_connected()?;
        if self.request_specs.disabled {
            return Err(self.rr_disabled());
        }

        if request.kind() != Kind::Request {
            return Err(Status::invalid_msg(
                "Cannot issue request with non-REQUEST kind message",
            ));
        }

        if self.validate.on_send() {
            self.validate_outbound(request)?;
        }

        if self.request_specs.subscribe_for_response {
            self.setup_response_subscription(request)?;
        }

        // Timeout: any negative value waits forever.
        let timeout_ms = if timeout_ms < 0 { WAIT_FOREVER } else { timeout_ms };
        // Republish: 0 falls back to the connection default, negative
        // disables.
        let republish_ms = match republish_ms {
            0 => self.request_specs.default_republish_ms,
            other => other,
        };
        let republish = if republish_ms > 0 {
            Some(republish_ms as u32)
        } else {
            None
        };

        let counter = self.next_counter();
        let unique_id = format!("{}_{}", self.conn_id, counter);

        let mut stamped = request.clone();
        if self.strip_requested(request) {
            self.injector.remove(&mut stamped);
        }
        stamped.add_field(
            Field::new(REPLY_UNIQUE_ID_FIELD, unique_id.clone())?.with_header(true),
        );
        if self.support_legacy_api {
            stamped.add_field(
                Field::new(LEGACY_REPLY_UNIQUE_ID_FIELD, unique_id.clone())?.with_header(true),
            );
        }
        stamped.set_meta(REPLY_UNIQUE_ID_FIELD, FieldValue::String(unique_id.clone()));

        let pending = Arc::new(PendingRequest::new(
            unique_id,
            stamped,
            timeout_ms,
            republish,
            self.request_specs.multi_response,
            callback,
        ));

        self.start_correlator();
        self.correlator.add(Arc::clone(&pending));
        Ok(pending)
    }

    fn self_arc(&self) -> Option<Arc<ConnectionCore>> {
        self.self_ref.lock().upgrade()
    }

    fn start_correlator(&self) {
        if !self.correlator.is_running() {
            if let Some(this) = self.self_arc() {
                let as_sender: Arc<dyn RequestSender> = this;
                self.correlator.start(Arc::downgrade(&as_sender));
            }
        }
    }

    /// Subject on which replies to this request are expected.
    fn response_subject(&self, request: &Message) -> String {
        self.request_specs
            .reply_subject
            .clone()
            .unwrap_or_else(|| format!("{}.RESP", request.subject()))
    }

    /// Internal driver-level subscription so replies actually reach this
    /// connection; established at most once per reply subject.
    fn setup_response_subscription(&self, request: &Message) -> Result<()> {
        let subject = self.response_subject(request);
        {
            let read = self.read.lock();
            if read.response_subscriptions.contains(&subject) {
                return Ok(());
            }
        }

        {
            let _write = self.write.lock();
            self.driver.subscribe(&subject, &self.config)?;
        }
        self.read.lock().response_subscriptions.push(subject);
        Ok(())
    }

    /// Direct or queued send of an already-stamped message.
    fn send_or_enqueue(&self, outbound: Message, mw_config: &Config) -> Result<()> {
        let async_requested = self.use_global_async
            || mw_config.boolean_value(keys::ASYNC_PUBLISH, false)
            || outbound.config().boolean_value(keys::ASYNC_PUBLISH, false);

        if async_requested {
            let mut publisher = self.async_publisher.lock();
            if publisher.is_none() {
                let this = self.self_arc().ok_or_else(Status::not_connected)?;
                let as_publisher: Arc<dyn DirectPublisher> = this;
                *publisher = Some(AsyncPublisher::start(
                    self.async_queue_depth,
                    Arc::downgrade(&as_publisher),
                ));
            }
            publisher
                .as_ref()
                .expect("async publisher just started")
                .enqueue(outbound, mw_config.clone());
            return Ok(());
        }

        self.driver_publish(&outbound, mw_config)
    }

    /// Publish through the driver under the write lock, with one
    /// reconnect attempt on a transient link failure.
    fn driver_publish(&self, msg: &Message, mw_config: &Config) -> Result<()> {
        let first = {
            let _write = self.write.lock();
            self.driver.publish(msg, mw_config)
        };

        match first {
            Ok(()) => Ok(()),
            Err(status) if status.code() == StatusCode::ConnectionLost => {
                warn!(%status, "publish hit a broken link, attempting reconnect");
                self.set_state(ConnectionState::Reconnecting);
                self.events
                    .dispatch(ConnectionEvent::ConnectionBroken, &status);

                let reconnected = {
                    let _write = self.write.lock();
                    self.driver.connect()
                };
                match reconnected {
                    Ok(()) => {
                        self.set_state(ConnectionState::Connected);
                        self.events.dispatch(
                            ConnectionEvent::ConnectionReconnect,
                            &Status::new(
                                StatusClass::ConnectionError,
                                StatusCode::ConnectionReconnect,
                                "Connection re-established",
                            ),
                        );
                        let _write = self.write.lock();
                        self.driver.publish(msg, mw_config)
                    }
                    Err(_) => Err(status),
                }
            }
            Err(status) => Err(status),
        }
    }

    pub(crate) fn dispatch_event(&self, event: ConnectionEvent, status: Status) {
        match event {
            ConnectionEvent::ConnectionBroken => {
                if self.state() == ConnectionState::Connected {
                    self.set_state(ConnectionState::Reconnecting);
                }
            }
            ConnectionEvent::ConnectionReconnect => {
                if self.state() == ConnectionState::Reconnecting {
                    self.set_state(ConnectionState::Connected);
                }
            }
            _ => {}
        }
        self.events.dispatch(event, &status);
    }

    /// The shared inbound pipeline: de-aggregation queue, host-pushed
    /// frames, then the driver; exclusion, duplicate, and validation
    /// filtering; request/reply bookkeeping; performance logging.
    pub(crate) fn receive_internal(&self, timeout_ms: i32) -> Result<Option<Message>> {
        // Bounded slices against the driver so host-pushed frames are
        // noticed even while a long receive is in progress.
        const POLL_SLICE_MS: i32 = 100;

        let started = Instant::now();
        let expired = |started: &Instant| {
            timeout_ms >= 0 && started.elapsed() >= Duration::from_millis(timeout_ms as u64)
        };

        loop {
            let remaining = if timeout_ms < 0 {
                WAIT_FOREVER
            } else {
                let elapsed = started.elapsed().as_millis() as i64;
                (timeout_ms as i64 - elapsed).max(0) as i32
            };

            let candidate = if let Some(msg) = self.aggregator.next_msg() {
                Some(msg)
            } else if let Some(msg) = self.pushed_inbound.pop(0) {
                Some(msg)
            } else {
                let slice = if remaining == WAIT_FOREVER {
                    POLL_SLICE_MS
                } else {
                    remaining.min(POLL_SLICE_MS)
                };
                self.driver.receive(slice)?
            };

            let Some(mut msg) = candidate else {
                if expired(&started) {
                    return Ok(None);
                }
                continue;
            };

            // Exclusion filter drops the message and re-arms the wait.
            if self.exclusions.lock().check_for_exclusion(&msg) {
                if expired(&started) {
                    return Ok(None);
                }
                continue;
            }

            // Expand composites and deliver the first constituent.
            if aggregate::is_aggregated(&msg) {
                self.aggregator.process_aggregated(&msg)?;
                match self.aggregator.next_msg() {
                    Some(first) => msg = first,
                    None => continue,
                }
            }

            // Duplicate suppression keyed on the UNIQUE-ID tracking
            // field; messages without one always pass.
            if let Some(filter) = &self.dup_filter {
                if let Some(unique_id) = msg.string_value("UNIQUE-ID") {
                    if !filter.lock().update(&unique_id) {
                        debug!(%unique_id, "duplicate message dropped");
                        if expired(&started) {
                            return Ok(None);
                        }
                        continue;
                    }
                }
            }

            if self.validate.on_recv() {
                self.spec.validate(&msg)?;
            }

            if let Some(perf) = self.perf.lock().as_ref() {
                if let Some(publish_time) = msg.string_value("PUBLISH-TIME") {
                    perf.log(msg.subject(), &publish_time);
                }
            }

            match msg.kind() {
                Kind::Request => {
                    // Move the correlation id off the field set into the
                    // meta-map before the user sees the request.
                    let unique_id = msg
                        .string_value(REPLY_UNIQUE_ID_FIELD)
                        .or_else(|| {
                            if self.support_legacy_api {
                                msg.string_value(LEGACY_REPLY_UNIQUE_ID_FIELD)
                            } else {
                                None
                            }
                        });
                    msg.clear_field(REPLY_UNIQUE_ID_FIELD);
                    msg.clear_field(LEGACY_REPLY_UNIQUE_ID_FIELD);
                    if let Some(unique_id) = unique_id {
                        msg.set_meta(REPLY_UNIQUE_ID_FIELD, FieldValue::String(unique_id));
                    }
                }
                Kind::Reply => {
                    let unique_id = msg
                        .string_value(REPLY_UNIQUE_ID_FIELD)
                        .or_else(|| {
                            if self.support_legacy_api {
                                msg.string_value(LEGACY_REPLY_UNIQUE_ID_FIELD)
                            } else {
                                None
                            }
                        });
                    msg.clear_field(REPLY_UNIQUE_ID_FIELD);
                    msg.clear_field(LEGACY_REPLY_UNIQUE_ID_FIELD);

                    if let Some(unique_id) = unique_id {
                        msg.set_meta(
                            REPLY_UNIQUE_ID_FIELD,
                            FieldValue::String(unique_id.clone()),
                        );
                        let consumed = self.correlator.on_reply(&unique_id, msg.clone());
                        if consumed && !self.request_specs.expose_replies {
                            if expired(&started) {
                                return Ok(None);
                            }
                            continue;
                        }
                    }
                }
                Kind::Publish => {}
            }

            return Ok(Some(msg));
        }
    }

    /// Route a message to every matching subscription callback.
    pub(crate) fn dispatch_internal(&self, msg: &Message) {
        let callbacks = {
            let read = self.read.lock();
            read.lookup.collect_callbacks(msg.subject())
        };
        if !callbacks.is_empty() {
            run_callbacks(&callbacks, msg);
        }
    }
}

impl ConnectionHost for ConnectionCore {
    fn dispatch_event(&self, event: ConnectionEvent, status: Status) {
        ConnectionCore::dispatch_event(self, event, status);
    }

    fn enqueue_inbound(&self, msg: Message) {
        self.pushed_inbound.push(msg);
    }

    /// Reply delivery from the driver. The correlation id is moved off
    /// the wire fields into the meta-map, the pending request (if any)
    /// is satisfied, and the reply additionally surfaces through
    /// `receive` when unclaimed or when replies are exposed.
    fn on_reply(&self, mut reply: Message) {
        let unique_id = reply.string_value(REPLY_UNIQUE_ID_FIELD).or_else(|| {
            if self.support_legacy_api {
                reply.string_value(LEGACY_REPLY_UNIQUE_ID_FIELD)
            } else {
                None
            }
        });
        reply.clear_field(REPLY_UNIQUE_ID_FIELD);
        reply.clear_field(LEGACY_REPLY_UNIQUE_ID_FIELD);

        let consumed = match unique_id {
            Some(unique_id) => {
                reply.set_meta(REPLY_UNIQUE_ID_FIELD, FieldValue::String(unique_id.clone()));
                self.correlator.on_reply(&unique_id, reply.clone())
            }
            None => false,
        };

        if !consumed || self.request_specs.expose_replies {
            self.pushed_inbound.push(reply);
        }
    }
}

impl RequestSender for ConnectionCore {
    fn send_request_copy(&self, pending: &PendingRequest) -> Result<()> {
        // Each copy (first send and every republish) gets fresh tracking
        // fields, so receivers' duplicate filters see distinct ids.
        let mut copy = pending.request.clone();
        self.insert_tracking(&mut copy);

        let _write = self.write.lock();
        self.driver.request(&copy, &pending.unique_id)
    }

    fn raise_event(&self, event: ConnectionEvent, status: Status) {
        self.dispatch_event(event, status);
    }
}

impl CompositePublisher for ConnectionCore {
    fn publish_composite(&self, msg: Message) -> Result<()> {
        // Composites carry no tracking fields and use a default config.
        let _write = self.write.lock();
        self.driver.publish(&msg, &Config::default())
    }
}

impl DirectPublisher for ConnectionCore {
    fn publish_direct(&self, msg: &Message, config: &Config) -> Result<()> {
        self.driver_publish(msg, config)
    }

    fn raise_event(&self, event: ConnectionEvent, status: Status) {
        self.dispatch_event(event, status);
    }
}

