//! Small concurrency and time helpers shared across the connection runtime.
//!
//! The locks in here are deliberately boring: a FIFO "ticket" mutex that
//! hands the lock to waiters in arrival order, and a countdown latch used
//! to observe first-send completion on the request path. Both are built on
//! `parking_lot` primitives.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timeout value meaning "wait indefinitely".
pub const WAIT_FOREVER: i32 = -1;

/// A mutex whose waiters acquire the lock in strict FIFO order.
///
/// `parking_lot` mutexes are only eventually fair; the dispatch paths of a
/// connection (read, write, event, counter) require that a burst of
/// publishers cannot starve a subscriber that queued first. Each waiter
/// draws a ticket and sleeps until the serving counter reaches it.
pub struct TicketMutex<T> {
    tickets: Mutex<TicketCounters>,
    turn: Condvar,
    data: Mutex<T>,
}

#[derive(Default)]
struct TicketCounters {
    next: u64,
    serving: u64,
}

pub struct TicketGuard<'a, T> {
    // Dropped before the serving counter is advanced.
    guard: Option<MutexGuard<'a, T>>,
    owner: &'a TicketMutex<T>,
}

impl<T> TicketMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            tickets: Mutex::new(TicketCounters::default()),
            turn: Condvar::new(),
            data: Mutex::new(value),
        }
    }

    /// Number of tickets drawn so far (acquired + waiting).
    #[cfg(test)]
    fn tickets_drawn(&self) -> u64 {
        self.tickets.lock().next
    }

    /// Acquire the lock, queueing behind earlier arrivals.
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let mut counters = self.tickets.lock();
        let ticket = counters.next;
        counters.next += 1;

        while counters.serving != ticket {
            self.turn.wait(&mut counters);
        }
        drop(counters);

        // Uncontended: only the holder of the current ticket reaches this.
        TicketGuard {
            guard: Some(self.data.lock()),
            owner: self,
        }
    }
}

impl<T> std::ops::Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().expect("ticket guard taken")
    }
}

impl<T> std::ops::DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().expect("ticket guard taken")
    }
}

impl<T> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();

        let mut counters = self.owner.tickets.lock();
        counters.serving += 1;
        drop(counters);
        self.owner.turn.notify_all();
    }
}

/// A one-shot latch that releases waiters once the count reaches zero.
///
/// The request path arms a latch before handing a pending request to the
/// correlator thread and awaits it (with a warn-timeout) so the caller can
/// observe that the first copy of the request actually went out.
pub struct CountDownLatch {
    count: Mutex<u32>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: u32) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    /// Wait up to `timeout_ms` for the count to reach zero. Returns `true`
    /// if the latch released, `false` on timeout. A negative timeout waits
    /// indefinitely.
    pub fn await_timeout(&self, timeout_ms: i32) -> bool {
        let mut count = self.count.lock();
        if timeout_ms < 0 {
            while *count > 0 {
                self.zero.wait(&mut count);
            }
            return true;
        }

        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms as u64);
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Milliseconds since the Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Format the current time in the bus-standard `YYYY-DDD-HH:MM:SS.mmm`
/// form (day-of-year, UTC) used by PUBLISH-TIME and the event log.
pub fn format_time_now() -> String {
    format_time(chrono::Utc::now())
}

pub fn format_time(t: chrono::DateTime<chrono::Utc>) -> String {
    t.format("%Y-%j-%H:%M:%S%.3f").to_string()
}

/// Parse a bus-standard timestamp back into UTC time.
pub fn parse_time(text: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%j-%H:%M:%S%.3f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert an API timeout (`< 0` = forever, `0` = poll) to a `Duration`.
/// Returns `None` for "wait forever".
pub fn timeout_to_duration(timeout_ms: i32) -> Option<Duration> {
    if timeout_ms < 0 {
        None
    } else {
        Some(Duration::from_millis(timeout_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ticket_mutex_serves_in_fifo_order() {
        let lock = Arc::new(TicketMutex::new(Vec::new()));

        // Hold the lock (ticket 0) while workers queue up one at a time.
        let held = lock.lock();
        let mut handles = Vec::new();

        for i in 0u64..4 {
            let worker_lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                worker_lock.lock().push(i);
            }));
            // Wait for this worker to draw its ticket before spawning the
            // next, so arrival order is deterministic.
            while lock.tickets_drawn() != i + 2 {
                thread::yield_now();
            }
        }

        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn ticket_mutex_guards_data() {
        let lock = Arc::new(TicketMutex::new(0usize));
        let hits = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let hits = Arc::clone(&hits);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    *lock.lock() += 1;
                    hits.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.lock(), 800);
        assert_eq!(hits.load(Ordering::Relaxed), 800);
    }

    #[test]
    fn latch_releases_waiters() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.await_timeout(2000))
        };
        latch.count_down();
        latch.count_down();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn latch_times_out() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.await_timeout(20));
    }

    #[test]
    fn time_format_round_trips() {
        let now = chrono::Utc::now();
        let text = format_time(now);
        let back = parse_time(&text).unwrap();
        assert_eq!(format_time(back), text);
    }

    #[test]
    fn timeout_conversion() {
        assert_eq!(timeout_to_duration(WAIT_FOREVER), None);
        assert_eq!(timeout_to_duration(0), Some(Duration::from_millis(0)));
        assert_eq!(timeout_to_duration(250), Some(Duration::from_millis(250)));
    }
}
