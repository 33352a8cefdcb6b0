//! # Asynchronous Publish
//!
//! A bounded single-producer/single-consumer queue with one worker
//! thread draining it to the driver. Enqueueing blocks when the queue is
//! full. Driver errors never propagate to the enqueuer; they are raised
//! as `CONNECTION_EXCEPTION` events. On teardown the queue is drained
//! for a bounded grace period and whatever remains is discarded.

use crate::config::Config;
use crate::dispatch::ConnectionEvent;
use crate::message::Message;
use crate::status::Result;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) const MIN_QUEUE_DEPTH: usize = 8;
pub(crate) const MAX_QUEUE_DEPTH: usize = 65_536;
pub(crate) const DEFAULT_QUEUE_DEPTH: usize = 1000;
pub(crate) const DEFAULT_TEARDOWN_WAIT_MS: i64 = 1000;

/// Capability the publish worker needs from its connection.
pub(crate) trait DirectPublisher: Send + Sync {
    fn publish_direct(&self, msg: &Message, config: &Config) -> Result<()>;
    fn raise_event(&self, event: ConnectionEvent, status: crate::status::Status);
}

enum Task {
    Publish(Box<Message>, Config),
    Shutdown,
}

/// Bounded queue plus its single drain worker.
pub(crate) struct AsyncPublisher {
    tx: Sender<Task>,
    done: Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncPublisher {
    /// Clamp a configured depth into the supported window.
    pub fn clamp_depth(requested: i64) -> usize {
        if requested < MIN_QUEUE_DEPTH as i64 {
            warn!(requested, "async publish queue depth out of range, using default");
            DEFAULT_QUEUE_DEPTH
        } else if requested > MAX_QUEUE_DEPTH as i64 {
            warn!(requested, "async publish queue depth capped");
            MAX_QUEUE_DEPTH
        } else {
            requested as usize
        }
    }

    pub fn start(depth: usize, publisher: Weak<dyn DirectPublisher>) -> Self {
        let (tx, rx) = bounded::<Task>(depth);
        let (done_tx, done) = bounded::<()>(1);

        let worker = std::thread::Builder::new()
            .name("async-publisher".into())
            .spawn(move || {
                debug!("async publisher started");
                while let Ok(task) = rx.recv() {
                    match task {
                        Task::Publish(msg, config) => {
                            let Some(publisher) = publisher.upgrade() else { break };
                            if let Err(status) = publisher.publish_direct(&msg, &config) {
                                warn!(%status, subject = msg.subject(), "async publish failed");
                                publisher
                                    .raise_event(ConnectionEvent::ConnectionException, status);
                            }
                        }
                        Task::Shutdown => break,
                    }
                }
                let _ = done_tx.send(());
                debug!("async publisher stopped");
            })
            .expect("spawn async-publisher");

        Self {
            tx,
            done,
            worker: Some(worker),
        }
    }

    /// Queue a message for publication, blocking while the queue is
    /// full.
    pub fn enqueue(&self, msg: Message, config: Config) {
        // The channel only disconnects at teardown; a failed send means
        // the message is discarded along with the rest of the queue.
        let _ = self.tx.send(Task::Publish(Box::new(msg), config));
    }

    /// Messages currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    /// Drain the queue for up to `grace_ms`, then discard the rest.
    pub fn teardown(mut self, grace_ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(grace_ms);

        let sent = self
            .tx
            .send_timeout(Task::Shutdown, Duration::from_millis(grace_ms))
            .is_ok();
        if sent {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.done.recv_timeout(remaining).is_ok() {
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                return;
            }
        }

        let discarded = self.tx.len();
        if discarded > 0 {
            warn!(discarded, "async publish queue discarded on teardown");
        }
        // Dropping the sender disconnects the channel; the worker exits
        // after its in-flight publish.
        drop(self.tx);
    }
}
