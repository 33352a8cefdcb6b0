//! Performance logger: a CSV stream of publish-to-receive latencies.
//!
//! Enabled by the `gmsec-log-performance` option. Every received message
//! carrying a PUBLISH-TIME field contributes one line; a percentile
//! summary computed from an HDR histogram is appended when the
//! connection shuts down. File writes go through a non-blocking
//! appender so the receive path never waits on disk.

use crate::status::{Result, Status, StatusClass, StatusCode};
use crate::util::{format_time, parse_time};
use crossbeam::channel::{unbounded, Sender};
use hdrhistogram::Histogram;
use std::io::Write;
use std::thread::JoinHandle;
use tracing::{debug, warn};

struct PerfEntry {
    subject: String,
    publish_time: String,
}

pub(crate) struct PerfLogger {
    tx: Option<Sender<PerfEntry>>,
    worker: Option<JoinHandle<()>>,
    // Flushes buffered lines when dropped.
    _writer_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl PerfLogger {
    pub fn start(path: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                Status::new(
                    StatusClass::ConfigError,
                    StatusCode::InvalidFieldValue,
                    format!("Cannot open performance log {path}: {e}"),
                )
            })?;
        let (mut writer, guard) = tracing_appender::non_blocking(file);
        let (tx, rx) = unbounded::<PerfEntry>();

        let worker = std::thread::Builder::new()
            .name("perf-logger".into())
            .spawn(move || {
                debug!("performance logger started");
                // Latencies in whole milliseconds, up to ten minutes.
                let mut histogram =
                    Histogram::<u64>::new_with_bounds(1, 600_000, 3).expect("histogram bounds");

                while let Ok(entry) = rx.recv() {
                    let now = chrono::Utc::now();
                    let latency_ms = parse_time(&entry.publish_time)
                        .map(|published| (now - published).num_milliseconds().max(0) as u64);

                    let line = match latency_ms {
                        Some(ms) => format!(
                            "{},{},{},{}\n",
                            entry.subject,
                            entry.publish_time,
                            format_time(now),
                            ms
                        ),
                        None => format!(
                            "{},{},{},\n",
                            entry.subject,
                            entry.publish_time,
                            format_time(now)
                        ),
                    };
                    if writer.write_all(line.as_bytes()).is_err() {
                        warn!("performance log write failed");
                    }
                    if let Some(ms) = latency_ms {
                        let _ = histogram.record(ms.max(1));
                    }
                }

                if histogram.len() > 0 {
                    let summary = format!(
                        "# latency_ms count={} p50={} p90={} p99={} max={}\n",
                        histogram.len(),
                        histogram.value_at_quantile(0.50),
                        histogram.value_at_quantile(0.90),
                        histogram.value_at_quantile(0.99),
                        histogram.max()
                    );
                    let _ = writer.write_all(summary.as_bytes());
                }
                debug!("performance logger stopped");
            })
            .expect("spawn perf-logger");

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            _writer_guard: guard,
        })
    }

    /// Record one received message. Never blocks.
    pub fn log(&self, subject: &str, publish_time: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(PerfEntry {
                subject: subject.to_string(),
                publish_time: publish_time.to_string(),
            });
        }
    }

    /// Flush the stream and append the latency summary.
    pub fn stop(mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PerfLogger {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::format_time_now;

    #[test]
    fn logs_lines_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.csv");
        let path_str = path.to_str().unwrap();

        let logger = PerfLogger::start(path_str).unwrap();
        logger.log("A.B.C", &format_time_now());
        logger.log("A.B.D", &format_time_now());
        logger.stop();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert!(lines.len() >= 3, "expected 2 entries + summary: {contents}");
        assert!(lines[0].starts_with("A.B.C,"));
        assert!(lines.last().unwrap().starts_with("# latency_ms count=2"));
    }

    #[test]
    fn unparseable_publish_time_still_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.csv");
        let logger = PerfLogger::start(path.to_str().unwrap()).unwrap();
        logger.log("A.B", "not-a-time");
        logger.stop();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("A.B,not-a-time,"));
    }

    #[test]
    fn bad_path_is_reported() {
        assert!(PerfLogger::start("/definitely/missing/dir/perf.csv").is_err());
    }
}
