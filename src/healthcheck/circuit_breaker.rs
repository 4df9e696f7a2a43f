use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Gauge value: 0 closed, 1 half-open, 2 open.
    pub fn gauge_value(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::HalfOpen => 1.0,
            BreakerState::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    last_transition: DateTime<Utc>,
}

/// Per-service failure isolation.
///
/// ```text
///            threshold consecutive failures
///   Closed ──────────────────────────────────► Open
///     ▲                                          │ timeout elapsed
///     │ success                                  ▼
///     └──────────────────────────────────── HalfOpen ── failure ──► Open
/// ```
///
/// While open every check is short-circuited. In half-open exactly one
/// check is let through; the rest are rejected until it reports back.
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, threshold: u32, timeout: Duration) -> Self {
        Self {
            service: service.into(),
            threshold: threshold.max(1),
            timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
                last_transition: Utc::now(),
            }),
        }
    }

    /// Current state. An open breaker whose timeout has elapsed still reads
    /// `Open` until a check is admitted.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_transition: inner.last_transition,
        }
    }

    /// Ask to run a real check. `None` means short-circuit.
    ///
    /// The permit reports the outcome. Dropping it without an outcome (the
    /// check was cancelled or its future dropped) frees the half-open slot
    /// so a later check is admitted.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map_or(true, |t| t.elapsed() >= self.timeout);
                if !elapsed {
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.probe_in_flight = true;
                true
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    return None;
                }
                inner.probe_in_flight = true;
                true
            }
        };
        Some(BreakerPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Closed {
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.threshold => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            _ => {}
        }
    }

    fn release(&self) {
        self.inner.lock().probe_in_flight = false;
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = Utc::now();
        tracing::info!(
            service = %self.service,
            from = %from,
            to = %to,
            failures = inner.consecutive_failures,
            "Circuit breaker state changed"
        );
        metrics::record_breaker_state(&self.service, to);
    }
}

/// An admitted check. Consume it with [`success`](Self::success) or
/// [`failure`](Self::failure).
#[must_use = "dropping a permit records no outcome"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    /// Admitted as the single half-open trial.
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::debug!(service = %self.breaker.service, "Half-open check ended without an outcome");
            self.breaker.release();
        }
    }
}

impl fmt::Debug for BreakerPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("service", &self.breaker.service)
            .field("trial", &self.trial)
            .field("settled", &self.settled)
            .finish()
    }
}
