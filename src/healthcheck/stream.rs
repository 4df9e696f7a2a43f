use super::{HealthMonitor, HealthReport};
use crate::broadcast::{Broadcaster, SlowObserverPolicy, Subscription, DEFAULT_OBSERVER_CAPACITY};
use crate::service::HealthStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub const DEFAULT_STREAM_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_STREAM_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_STREAM_INTERVAL: Duration = Duration::from_secs(60);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const STREAM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// What a health subscriber receives.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HealthEvent {
    /// Full report of one check cycle.
    #[serde(rename = "health")]
    Snapshot(HealthReport),
    /// A service's health differs from the previous cycle.
    #[serde(rename = "health-change", rename_all = "camelCase")]
    Change {
        service: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: DateTime<Utc> },
}

impl HealthEvent {
    pub fn heartbeat() -> Self {
        HealthEvent::Heartbeat {
            timestamp: Utc::now(),
        }
    }
}

/// Remembers the last status per service and reports differences.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: HashMap<String, HealthStatus>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Change events for `report`. The first sighting of a service is not a
    /// change, and services missing from the report are forgotten.
    pub fn observe(&mut self, report: &HealthReport) -> Vec<HealthEvent> {
        let mut changes = Vec::new();
        let mut seen = HashMap::with_capacity(report.services.len());

        for result in &report.services {
            if let Some(&old) = self.last.get(&result.service_name) {
                if old != result.status {
                    changes.push(HealthEvent::Change {
                        service: result.service_name.clone(),
                        old_status: old,
                        new_status: result.status,
                        reason: result.error.clone(),
                        timestamp: result.timestamp,
                    });
                }
            }
            seen.insert(result.service_name.clone(), result.status);
        }

        self.last = seen;
        changes
    }

    pub fn last_status(&self, service: &str) -> Option<HealthStatus> {
        self.last.get(service).copied()
    }
}

/// Clamp a requested stream interval to [1s, 60s].
pub fn clamp_interval(requested: Duration) -> Duration {
    requested.clamp(MIN_STREAM_INTERVAL, MAX_STREAM_INTERVAL)
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub interval: Duration,
    pub heartbeat: Duration,
    /// Cycle timeout; raised to the monitor's own probe budget when shorter.
    pub check_timeout: Duration,
    /// Services to check; empty means all.
    pub services: Vec<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_STREAM_INTERVAL,
            heartbeat: HEARTBEAT_INTERVAL,
            check_timeout: STREAM_CHECK_TIMEOUT,
            services: Vec::new(),
        }
    }
}

impl StreamOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = clamp_interval(interval);
        self
    }

    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }
}

/// Periodic health checks for one subscriber.
///
/// Each cycle publishes a snapshot followed by any change events; a
/// heartbeat goes out on its own timer. The loop ends when its token is
/// cancelled or when nobody is listening any more.
pub struct HealthStream {
    monitor: Arc<HealthMonitor>,
    options: StreamOptions,
}

impl HealthStream {
    pub fn new(monitor: Arc<HealthMonitor>, options: StreamOptions) -> Self {
        Self { monitor, options }
    }

    /// Start a stream with a dedicated subscription.
    ///
    /// Dropping the returned subscription or cancelling `cancel` stops the
    /// stream; other streams of the same monitor are unaffected.
    pub fn subscribe(
        monitor: Arc<HealthMonitor>,
        options: StreamOptions,
        cancel: CancellationToken,
    ) -> Subscription<HealthEvent> {
        let sink = Arc::new(Broadcaster::new(SlowObserverPolicy::Drop));
        let subscription = sink.subscribe(DEFAULT_OBSERVER_CAPACITY);
        let span = tracing::debug_span!("health_stream", id = subscription.id());
        let stream = HealthStream::new(monitor, options);
        tokio::spawn(async move { stream.run(sink, cancel).await }.instrument(span));
        subscription
    }

    pub async fn run(self, sink: Arc<Broadcaster<HealthEvent>>, cancel: CancellationToken) {
        let interval_len = clamp_interval(self.options.interval);
        let mut ticker = interval(interval_len);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = interval_at(Instant::now() + self.options.heartbeat, self.options.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut detector = ChangeDetector::new();
        // Never cut a cycle shorter than the monitor lets its probes run.
        let cycle_timeout = self.options.check_timeout.max(self.monitor.cycle_budget());

        tracing::debug!(interval = ?interval_len, timeout = ?cycle_timeout, "Health stream started");
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let cycle = tokio::time::timeout(
                        cycle_timeout,
                        self.monitor.check(&self.options.services, &cancel),
                    )
                    .await;
                    match cycle {
                        Ok(Ok(report)) => {
                            let changes = detector.observe(&report);
                            sink.publish(HealthEvent::Snapshot(report));
                            for change in changes {
                                sink.publish(change);
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "Health stream check failed");
                        }
                        Err(_) => {
                            tracing::warn!(timeout = ?cycle_timeout, "Health stream check timed out");
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    sink.publish(HealthEvent::heartbeat());
                }
            }
            if sink.observer_count() == 0 {
                break;
            }
        }
        tracing::debug!("Health stream stopped");
    }
}
