//! Log capture for supervised processes.
//!
//! Each [`LogCapture`] reads a child's stdout and stderr line by line into a
//! ring buffer and fans every line out to live subscribers. Optionally it
//! also forwards lines to a shared hub so a single stream can follow every
//! service at once.

use crate::broadcast::{Broadcaster, SlowObserverPolicy, Subscription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Lines kept in memory per service.
pub const DEFAULT_MAX_LOG_LINES: usize = 10_000;

/// Queue depth of a single log subscriber.
pub const LOG_SUBSCRIBER_CAPACITY: usize = 100;

/// Fraction of the buffer at which a one-time warning is logged.
const LOG_BUFFER_WARNING_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub service: String,
    pub line: String,
    pub stream: LogStream,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(service: impl Into<String>, stream: LogStream, line: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            line: line.into(),
            stream,
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            LogStream::Stdout => write!(f, "{}", self.line),
            LogStream::Stderr => write!(f, "[stderr] {}", self.line),
        }
    }
}

/// Shared multiplexed stream of every service's output.
pub type LogHub = Broadcaster<LogLine>;

/// Create a hub for [`LogCapture::with_hub`].
pub fn new_log_hub() -> Arc<LogHub> {
    Arc::new(Broadcaster::new(SlowObserverPolicy::Skip))
}

struct Inner {
    service: String,
    lines: Mutex<VecDeque<LogLine>>,
    max_lines: usize,
    warned_at_capacity: AtomicBool,
    dropped_count: AtomicUsize,
    subscribers: Broadcaster<LogLine>,
    hub: Option<Arc<LogHub>>,
}

impl Inner {
    fn push(&self, line: LogLine) {
        {
            let mut lines = self.lines.lock();
            lines.push_back(line.clone());
            if lines.len() > self.max_lines {
                lines.pop_front();
                self.dropped_count.fetch_add(1, Ordering::Relaxed);
            }

            let threshold = (self.max_lines as f64 * LOG_BUFFER_WARNING_THRESHOLD) as usize;
            if lines.len() >= threshold && !self.warned_at_capacity.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    "Log buffer for service '{}' is at {}/{} lines. Oldest logs will be dropped.",
                    self.service,
                    lines.len(),
                    self.max_lines,
                );
            }
        }

        if let Some(hub) = &self.hub {
            hub.publish(line.clone());
        }
        self.subscribers.publish(line);
    }
}

/// Ring buffer plus live fan-out for one service's output.
pub struct LogCapture {
    inner: Arc<Inner>,
    // std-style sync mutex so Drop can reach it
    log_tasks: Mutex<Vec<JoinHandle<()>>>,
    log_shutdown: Arc<Notify>,
}

impl fmt::Debug for LogCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCapture")
            .field("service", &self.inner.service)
            .field("max_lines", &self.inner.max_lines)
            .finish_non_exhaustive()
    }
}

impl LogCapture {
    pub fn new(service: impl Into<String>) -> Self {
        Self::build(service.into(), DEFAULT_MAX_LOG_LINES, None)
    }

    pub fn with_max_lines(service: impl Into<String>, max_lines: usize) -> Self {
        Self::build(service.into(), max_lines.max(1), None)
    }

    /// Also forward every line to `hub`.
    pub fn with_hub(service: impl Into<String>, hub: Arc<LogHub>) -> Self {
        Self::build(service.into(), DEFAULT_MAX_LOG_LINES, Some(hub))
    }

    fn build(service: String, max_lines: usize, hub: Option<Arc<LogHub>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                lines: Mutex::new(VecDeque::new()),
                max_lines,
                warned_at_capacity: AtomicBool::new(false),
                dropped_count: AtomicUsize::new(0),
                subscribers: Broadcaster::new(SlowObserverPolicy::Skip),
                hub,
            }),
            log_tasks: Mutex::new(Vec::new()),
            log_shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Lines evicted because the buffer was full.
    pub fn dropped_count(&self) -> usize {
        self.inner.dropped_count.load(Ordering::Relaxed)
    }

    /// Start a background reader for one output stream.
    pub fn capture<R>(&self, reader: R, stream: LogStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let inner = self.inner.clone();
        let shutdown = self.log_shutdown.clone();

        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.notified() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => inner.push(LogLine::new(&inner.service, stream, line)),
                        _ => break,
                    },
                }
            }
        });
        self.log_tasks.lock().push(handle);
    }

    /// Record a line that did not come from the child (e.g. supervisor notes).
    pub fn push(&self, stream: LogStream, line: impl Into<String>) {
        self.inner
            .push(LogLine::new(&self.inner.service, stream, line));
    }

    /// Buffered lines, optionally only the last `tail`. Stderr lines carry a
    /// `[stderr] ` prefix.
    pub fn read_logs(&self, tail: Option<usize>) -> Vec<String> {
        self.read_lines(tail).iter().map(ToString::to_string).collect()
    }

    pub fn read_lines(&self, tail: Option<usize>) -> Vec<LogLine> {
        let lines = self.inner.lines.lock();
        let skip = tail.map_or(0, |n| lines.len().saturating_sub(n));
        lines.iter().skip(skip).cloned().collect()
    }

    /// Live lines from now on. A subscriber that falls behind misses lines
    /// instead of stalling the reader.
    pub fn subscribe(&self) -> Subscription<LogLine> {
        self.inner.subscribers.subscribe(LOG_SUBSCRIBER_CAPACITY)
    }

    pub fn clear(&self) {
        self.inner.lines.lock().clear();
    }

    /// Wait for readers to hit EOF, up to `timeout`, so the final lines of
    /// an exited process are not lost.
    pub async fn drain(&self, timeout: Duration) {
        let tasks: Vec<_> = self.log_tasks.lock().drain(..).collect();
        let joined = tokio::time::timeout(timeout, futures::future::join_all(tasks)).await;
        if joined.is_err() {
            tracing::debug!(service = %self.inner.service, "Log readers still busy after drain timeout");
        }
    }

    /// Stop readers and close subscriber channels.
    pub async fn shutdown(&self) {
        self.log_shutdown.notify_waiters();
        tokio::time::sleep(Duration::from_millis(10)).await;
        for task in self.log_tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.subscribers.close();
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        self.log_shutdown.notify_waiters();
        for task in self.log_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_both_streams() {
        let capture = LogCapture::new("api");
        capture.capture(&b"hello\nworld\n"[..], LogStream::Stdout);
        capture.drain(Duration::from_secs(1)).await;
        capture.capture(&b"oops\n"[..], LogStream::Stderr);
        capture.drain(Duration::from_secs(1)).await;

        let logs = capture.read_logs(None);
        assert_eq!(logs, vec!["hello", "world", "[stderr] oops"]);
    }

    #[tokio::test]
    async fn test_read_logs_with_tail() {
        let capture = LogCapture::new("api");
        for i in 0..10 {
            capture.push(LogStream::Stdout, format!("line {}", i));
        }

        let logs = capture.read_logs(Some(3));
        assert_eq!(logs, vec!["line 7", "line 8", "line 9"]);
        assert_eq!(capture.read_logs(Some(50)).len(), 10);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let capture = LogCapture::with_max_lines("api", 5);
        for i in 0..10 {
            capture.push(LogStream::Stdout, format!("line {}", i));
        }

        assert_eq!(capture.dropped_count(), 5);
        let logs = capture.read_logs(None);
        assert_eq!(logs.len(), 5);
        assert_eq!(logs[0], "line 5");
        assert_eq!(logs[4], "line 9");
    }

    #[tokio::test]
    async fn test_subscriber_receives_live_lines() {
        let capture = LogCapture::new("api");
        capture.push(LogStream::Stdout, "before");

        let mut sub = capture.subscribe();
        capture.push(LogStream::Stderr, "after");

        let line = sub.recv().await.unwrap();
        assert_eq!(line.line, "after");
        assert_eq!(line.stream, LogStream::Stderr);
        assert_eq!(line.service, "api");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_capture() {
        let capture = LogCapture::new("api");
        let mut sub = capture.subscribe();
        for i in 0..(LOG_SUBSCRIBER_CAPACITY * 2) {
            capture.push(LogStream::Stdout, format!("{}", i));
        }

        assert_eq!(capture.read_logs(None).len(), LOG_SUBSCRIBER_CAPACITY * 2);
        assert_eq!(sub.recv().await.unwrap().line, "0");
    }

    #[tokio::test]
    async fn test_hub_multiplexes_services() {
        let hub = new_log_hub();
        let mut all = hub.subscribe(10);
        let api = LogCapture::with_hub("api", hub.clone());
        let web = LogCapture::with_hub("web", hub.clone());

        api.push(LogStream::Stdout, "a");
        web.push(LogStream::Stdout, "w");

        assert_eq!(all.recv().await.unwrap().service, "api");
        assert_eq!(all.recv().await.unwrap().service, "web");
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let capture = LogCapture::new("api");
        let mut sub = capture.subscribe();
        capture.shutdown().await;
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_aborts_tasks() {
        let (_tx, rx) = tokio::io::duplex(64);
        let capture = LogCapture::new("api");
        capture.capture(rx, LogStream::Stdout);
        assert_eq!(capture.log_tasks.lock().len(), 1);
        drop(capture);
    }
}
