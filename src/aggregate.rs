//! # Message Aggregation
//!
//! Same-subject messages can be batched ("binned") into one composite
//! wire message. A bin flushes when it is full or older than the bin
//! timeout; a background worker performs the flush and publishes the
//! composite with a default config. Publish errors from the worker are
//! captured and surfaced to the caller on the next `add_message`,
//! instead of disappearing in the background.
//!
//! On the receive side a composite is recognized by its marker field and
//! expanded; the constituents are handed back to the connection in
//! insertion order.

use crate::config::{keys, Config};
use crate::field::{Field, FieldValue};
use crate::message::{Kind, Message};
use crate::status::{Result, Status, StatusCode};
use crate::subject::Pattern;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) const DEFAULT_BIN_SIZE: usize = 100;
pub(crate) const DEFAULT_BIN_TIMEOUT_MS: u64 = 5000;

/// Worker scan interval; bins flush within this slack of their timeout.
const FLUSH_SCAN: Duration = Duration::from_millis(100);

/// Marker field identifying a composite frame.
pub const AGGREGATED_MARKER_FIELD: &str = "AGGREGATED-MSGS";
const NUM_MESSAGES_FIELD: &str = "NUM-MESSAGES";
const MSG_DATA_FIELD: &str = "MSG-DATA";

/// Capability the flush worker needs from its connection.
pub(crate) trait CompositePublisher: Send + Sync {
    fn publish_composite(&self, msg: Message) -> Result<()>;
}

struct Bin {
    messages: Vec<Message>,
    created: Instant,
}

#[derive(Default)]
struct AggState {
    bins: HashMap<String, Bin>,
    publish_status: Option<Status>,
    /// De-aggregated inbound constituents awaiting delivery.
    expanded: VecDeque<Message>,
}

struct AggShared {
    bin_size: usize,
    bin_timeout: Duration,
    state: Mutex<AggState>,
    flush_now: Condvar,
    quit: AtomicBool,
}

impl AggShared {
    /// Flush bins that are full or expired; with `all` set, flush
    /// everything.
    fn flush_due_bins(&self, publisher: &dyn CompositePublisher, all: bool) {
        let due: Vec<(String, Vec<Message>)> = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let subjects: Vec<String> = state
                .bins
                .iter()
                .filter(|(_, bin)| {
                    all || bin.messages.len() >= self.bin_size
                        || now.duration_since(bin.created) >= self.bin_timeout
                })
                .map(|(subject, _)| subject.clone())
                .collect();
            subjects
                .into_iter()
                .filter_map(|subject| {
                    state
                        .bins
                        .remove(&subject)
                        .map(|bin| (subject, bin.messages))
                })
                .collect()
        };

        for (subject, messages) in due {
            debug!(subject = %subject, count = messages.len(), "flushing message bin");
            match build_composite(&subject, &messages) {
                Ok(composite) => {
                    if let Err(status) = publisher.publish_composite(composite) {
                        warn!(%status, "composite publish failed");
                        self.state.lock().publish_status = Some(status);
                    }
                }
                Err(status) => {
                    self.state.lock().publish_status = Some(status);
                }
            }
        }
    }
}

/// The aggregation toolkit owned by a connection. Always constructed
/// (a subscriber needs the expansion path); the flush worker only runs
/// when binning is enabled.
pub(crate) struct Aggregator {
    shared: Arc<AggShared>,
    /// Empty = bin everything.
    filters: Vec<Pattern>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    pub fn from_config(config: &Config) -> Result<Self> {
        let bin_size = match config.integer_value(keys::MSG_BIN_SIZE, DEFAULT_BIN_SIZE as i64) {
            n if n > 0 => n as usize,
            _ => DEFAULT_BIN_SIZE,
        };
        let bin_timeout =
            match config.integer_value(keys::MSG_BIN_TIMEOUT, DEFAULT_BIN_TIMEOUT_MS as i64) {
                n if n > 0 => Duration::from_millis(n as u64),
                _ => Duration::from_millis(DEFAULT_BIN_TIMEOUT_MS),
            };

        let mut filters = Vec::new();
        if let Some(raw) = config.value(keys::MSG_BIN_SUBJECT) {
            for part in raw.split(',') {
                let part = part.trim();
                if !part.is_empty() {
                    filters.push(part.parse::<Pattern>()?);
                }
            }
        }

        Ok(Self {
            shared: Arc::new(AggShared {
                bin_size,
                bin_timeout,
                state: Mutex::new(AggState::default()),
                flush_now: Condvar::new(),
                quit: AtomicBool::new(false),
            }),
            filters,
            worker: Mutex::new(None),
        })
    }

    pub fn bin_size(&self) -> usize {
        self.shared.bin_size
    }

    /// Error captured from a background composite publish, surfaced once.
    pub fn take_publish_status(&self) -> Option<Status> {
        self.shared.state.lock().publish_status.take()
    }

    /// Whether a subject falls under the configured bin filter.
    pub fn accepts(&self, subject: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(subject))
    }

    /// Offer a message for binning. Returns `true` when the message was
    /// absorbed into a bin (the caller must not publish it directly).
    pub fn add_message(&self, msg: Message) -> bool {
        if !self.filters.is_empty() && !self.filters.iter().any(|f| f.matches(msg.subject())) {
            return false;
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        let bin = state
            .bins
            .entry(msg.subject().to_string())
            .or_insert_with(|| Bin {
                messages: Vec::new(),
                created: Instant::now(),
            });
        bin.messages.push(msg);

        if bin.messages.len() >= shared.bin_size {
            shared.flush_now.notify_all();
        }
        true
    }

    /// Start the flush worker.
    pub fn start(&self, publisher: Weak<dyn CompositePublisher>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("msg-aggregator".into())
            .spawn(move || {
                debug!("aggregation worker started");
                loop {
                    {
                        let mut state = shared.state.lock();
                        if shared.quit.load(Ordering::SeqCst) {
                            break;
                        }
                        shared.flush_now.wait_for(&mut state, FLUSH_SCAN);
                    }
                    let Some(publisher) = publisher.upgrade() else { break };
                    let all = shared.quit.load(Ordering::SeqCst);
                    shared.flush_due_bins(publisher.as_ref(), all);
                    if all {
                        break;
                    }
                }
                debug!("aggregation worker stopped");
            })
            .expect("spawn msg-aggregator");
        *worker = Some(handle);
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Stop the worker, flushing every open bin first.
    pub fn stop(&self, publisher: &dyn CompositePublisher) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.flush_now.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        // Final synchronous flush of anything the worker left behind.
        self.shared.flush_due_bins(publisher, true);
    }

    // ---- receive side ----

    /// Expand a composite into the constituent queue.
    pub fn process_aggregated(&self, composite: &Message) -> Result<()> {
        let constituents = expand_composite(composite)?;
        let mut state = self.shared.state.lock();
        state.expanded.extend(constituents);
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        !self.shared.state.lock().expanded.is_empty()
    }

    pub fn next_msg(&self) -> Option<Message> {
        self.shared.state.lock().expanded.pop_front()
    }
}

/// Whether a message is a composite produced by [`Aggregator`].
pub fn is_aggregated(msg: &Message) -> bool {
    msg.get_field(AGGREGATED_MARKER_FIELD)
        .map(|f| matches!(f.value(), FieldValue::Bool(true)))
        .unwrap_or(false)
}

fn build_composite(subject: &str, messages: &[Message]) -> Result<Message> {
    let payload = bincode::serialize(messages).map_err(|e| {
        Status::msg_error(StatusCode::BadMsgFormat, format!("Bin encode failed: {e}"))
    })?;

    let mut composite = Message::new(subject, Kind::Publish)?;
    composite.add_field(Field::new(AGGREGATED_MARKER_FIELD, true)?.with_header(true));
    composite.add_field(Field::new(NUM_MESSAGES_FIELD, messages.len() as u32)?.with_header(true));
    composite.add_field(Field::new(MSG_DATA_FIELD, payload)?);
    Ok(composite)
}

fn expand_composite(composite: &Message) -> Result<Vec<Message>> {
    let data = match composite.get_field(MSG_DATA_FIELD).map(|f| f.value()) {
        Some(FieldValue::Binary(bytes)) => bytes,
        _ => {
            return Err(Status::msg_error(
                StatusCode::BadMsgFormat,
                "Composite message is missing MSG-DATA",
            ))
        }
    };

    let messages: Vec<Message> = bincode::deserialize(data).map_err(|e| {
        Status::msg_error(StatusCode::BadMsgFormat, format!("Bin decode failed: {e}"))
    })?;

    let declared = composite
        .get_field(NUM_MESSAGES_FIELD)
        .and_then(|f| f.i64_value().ok())
        .unwrap_or(messages.len() as i64);
    if declared != messages.len() as i64 {
        return Err(Status::msg_error(
            StatusCode::BadMsgFormat,
            format!(
                "Composite declares {declared} messages but carries {}",
                messages.len()
            ),
        ));
    }

    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Capture {
        published: Mutex<Vec<Message>>,
        failures: AtomicUsize,
    }

    impl Capture {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
            })
        }
    }

    impl CompositePublisher for Capture {
        fn publish_composite(&self, msg: Message) -> Result<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Status::middleware("broker unavailable"));
            }
            self.published.lock().push(msg);
            Ok(())
        }
    }

    fn msg(subject: &str, n: i32) -> Message {
        let mut m = Message::new(subject, Kind::Publish).unwrap();
        m.add_field_value("N", n).unwrap();
        m
    }

    fn config(args: &str) -> Config {
        Config::from_args(args).unwrap()
    }

    #[test]
    fn composite_round_trip_preserves_order() {
        let messages = vec![msg("AGG.X", 1), msg("AGG.X", 2), msg("AGG.X", 3)];
        let composite = build_composite("AGG.X", &messages).unwrap();
        assert!(is_aggregated(&composite));
        assert_eq!(
            composite
                .get_field(NUM_MESSAGES_FIELD)
                .unwrap()
                .i64_value()
                .unwrap(),
            3
        );

        let expanded = expand_composite(&composite).unwrap();
        assert_eq!(expanded.len(), 3);
        for (i, m) in expanded.iter().enumerate() {
            assert_eq!(m.get_field("N").unwrap().i64_value().unwrap(), i as i64 + 1);
        }
    }

    #[test]
    fn full_bin_flushes_without_waiting_for_timeout() {
        let agg =
            Aggregator::from_config(&config("gmsec-msg-bin-size=2 gmsec-msg-bin-timeout=60000"))
                .unwrap();
        let capture = Capture::new();
        let publisher: Arc<dyn CompositePublisher> = capture.clone();
        agg.start(Arc::downgrade(&publisher));

        assert!(agg.add_message(msg("AGG.X", 1)));
        assert!(agg.add_message(msg("AGG.X", 2)));

        // The worker should flush promptly once the bin is full.
        let deadline = Instant::now() + Duration::from_secs(2);
        while capture.published.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let published = capture.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(expand_composite(&published[0]).unwrap().len(), 2);
        drop(published);
        agg.stop(publisher.as_ref());
    }

    #[test]
    fn aged_bin_flushes_on_timeout() {
        let agg =
            Aggregator::from_config(&config("gmsec-msg-bin-size=100 gmsec-msg-bin-timeout=100"))
                .unwrap();
        let capture = Capture::new();
        let publisher: Arc<dyn CompositePublisher> = capture.clone();
        agg.start(Arc::downgrade(&publisher));

        assert!(agg.add_message(msg("AGG.X", 1)));
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(capture.published.lock().len(), 1);
        agg.stop(publisher.as_ref());
    }

    #[test]
    fn subject_filter_limits_binning() {
        let agg = Aggregator::from_config(&config("gmsec-msg-bin-subject=AGG.>")).unwrap();
        assert!(agg.add_message(msg("AGG.X", 1)));
        assert!(!agg.add_message(msg("TLM.X", 1)));
    }

    #[test]
    fn background_failure_surfaces_on_next_call() {
        let agg =
            Aggregator::from_config(&config("gmsec-msg-bin-size=1 gmsec-msg-bin-timeout=50"))
                .unwrap();
        let capture = Capture::new();
        capture.failures.store(1, Ordering::SeqCst);
        let publisher: Arc<dyn CompositePublisher> = capture.clone();
        agg.start(Arc::downgrade(&publisher));

        assert!(agg.add_message(msg("AGG.X", 1)));
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut status = None;
        while status.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
            status = agg.take_publish_status();
        }
        assert!(status.is_some(), "background error never surfaced");
        agg.stop(publisher.as_ref());
    }

    #[test]
    fn stop_flushes_remaining_bins() {
        let agg = Aggregator::from_config(&config("gmsec-msg-bin-timeout=60000")).unwrap();
        let capture = Capture::new();
        let publisher: Arc<dyn CompositePublisher> = capture.clone();
        agg.start(Arc::downgrade(&publisher));

        assert!(agg.add_message(msg("AGG.X", 1)));
        assert!(agg.add_message(msg("AGG.Y", 2)));
        agg.stop(publisher.as_ref());

        assert_eq!(capture.published.lock().len(), 2);
    }

    #[test]
    fn expansion_queue_preserves_insertion_order() {
        let agg = Aggregator::from_config(&Config::new()).unwrap();
        let composite =
            build_composite("AGG.X", &[msg("AGG.X", 1), msg("AGG.X", 2)]).unwrap();
        agg.process_aggregated(&composite).unwrap();

        assert!(agg.has_next());
        assert_eq!(
            agg.next_msg().unwrap().get_field("N").unwrap().i64_value().unwrap(),
            1
        );
        assert_eq!(
            agg.next_msg().unwrap().get_field("N").unwrap().i64_value().unwrap(),
            2
        );
        assert!(agg.next_msg().is_none());
    }

    #[test]
    fn malformed_composites_are_rejected() {
        let agg = Aggregator::from_config(&Config::new()).unwrap();
        let mut fake = Message::new("AGG.X", Kind::Publish).unwrap();
        fake.add_field_value(AGGREGATED_MARKER_FIELD, true).unwrap();
        assert!(agg.process_aggregated(&fake).is_err());
    }
}
