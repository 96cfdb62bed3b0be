//! Per-source admission control: a governor token bucket in front of a
//! three-state circuit breaker, plus usage accounting.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{direct::NotKeyed, InMemoryState};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SourceError;
use crate::layers::usage::{ApiUsageStats, PricingModel, UsageTracker};
use crate::layers::DiscoverySource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// What to do with a request that exceeds the rate cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitMode {
    Reject,
    /// Wait for a token, at most `GuardConfig::max_queue_wait`.
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub mode: RateLimitMode,
    pub max_queue_wait: Duration,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Number of recent outcomes considered for the failure rate.
    pub window_size: usize,
    pub failure_rate_threshold: f64,
    /// The failure rate is ignored until the window holds this many outcomes.
    pub min_window_samples: usize,
    pub cooldown: Duration,
    pub half_open_probes: u32,
    pub pricing: PricingModel,
}

impl GuardConfig {
    /// Conservative defaults below each provider's published limits.
    pub fn for_source(source: DiscoverySource) -> Self {
        let (requests_per_minute, burst) = match source {
            // OpenAlex polite pool allows 10 req/s.
            DiscoverySource::BibliographicIndex => (600, 10),
            // Semantic Scholar unauthenticated pool is shared and small.
            DiscoverySource::AcademicGraph => (100, 5),
            // arXiv asks for one request every three seconds.
            DiscoverySource::RealtimeResearch => (20, 1),
        };
        Self {
            requests_per_minute,
            burst,
            ..Self::default()
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: 5,
            mode: RateLimitMode::Reject,
            max_queue_wait: Duration::from_secs(5),
            failure_threshold: 5,
            window_size: 20,
            failure_rate_threshold: 0.5,
            min_window_samples: 10,
            cooldown: Duration::from_secs(30),
            half_open_probes: 1,
            pricing: PricingModel::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BreakerState {
    Closed,
    Open { until: Instant },
    HalfOpen { in_flight: u32 },
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    window: VecDeque<bool>,
}

/// Mutex-guarded closed/open/half-open state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    window_size: usize,
    failure_rate_threshold: f64,
    min_window_samples: usize,
    cooldown: Duration,
    half_open_probes: u32,
    inner: Mutex<BreakerInner>,
}

/// Granted admission. `probe` marks a half-open trial request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub probe: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &GuardConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            window_size: config.window_size.max(1),
            failure_rate_threshold: config.failure_rate_threshold,
            min_window_samples: config.min_window_samples,
            cooldown: config.cooldown,
            half_open_probes: config.half_open_probes.max(1),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                window: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        match self.lock().state {
            BreakerState::Closed => CircuitState::Closed,
            BreakerState::Open { .. } => CircuitState::Open,
            BreakerState::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// `None` means short-circuit: do not touch the network.
    pub fn try_admit(&self) -> Option<Admission> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(Admission { probe: false }),
            BreakerState::Open { until } => {
                if Instant::now() >= until {
                    info!(source = %self.name, "Circuit half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen { in_flight: 1 };
                    Some(Admission { probe: true })
                } else {
                    None
                }
            }
            BreakerState::HalfOpen { in_flight } => {
                if in_flight < self.half_open_probes {
                    inner.state = BreakerState::HalfOpen {
                        in_flight: in_flight + 1,
                    };
                    Some(Admission { probe: true })
                } else {
                    None
                }
            }
        }
    }

    /// Give back an admission that never reached the network.
    pub fn release(&self, admission: Admission) {
        if !admission.probe {
            return;
        }
        let mut inner = self.lock();
        if let BreakerState::HalfOpen { in_flight } = inner.state {
            inner.state = BreakerState::HalfOpen {
                in_flight: in_flight.saturating_sub(1),
            };
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen { .. } if admission.probe => {
                info!(source = %self.name, "Probe succeeded, circuit closed");
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.window.clear();
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, true);
            }
            // Late results from calls admitted before the circuit opened.
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen { .. } if admission.probe => {
                warn!(source = %self.name, "Probe failed, circuit re-opened");
                inner.state = BreakerState::Open {
                    until: Instant::now() + self.cooldown,
                };
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                self.push_outcome(&mut inner, false);
                let failures = inner.window.iter().filter(|ok| !**ok).count();
                let rate = failures as f64 / inner.window.len() as f64;
                let rate_tripped = inner.window.len() >= self.min_window_samples
                    && rate >= self.failure_rate_threshold;
                if inner.consecutive_failures >= self.failure_threshold || rate_tripped {
                    warn!(
                        source = %self.name,
                        consecutive = inner.consecutive_failures,
                        failure_rate = rate,
                        "Circuit opened"
                    );
                    inner.state = BreakerState::Open {
                        until: Instant::now() + self.cooldown,
                    };
                }
            }
            _ => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, ok: bool) {
        inner.window.push_back(ok);
        while inner.window.len() > self.window_size {
            inner.window.pop_front();
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Everything that stands between one source client and its provider.
pub struct SourceGuard {
    source: DiscoverySource,
    limiter: DirectLimiter,
    breaker: CircuitBreaker,
    usage: Arc<UsageTracker>,
    mode: RateLimitMode,
    max_queue_wait: Duration,
}

impl SourceGuard {
    pub fn new(source: DiscoverySource, config: GuardConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(config.burst).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_minute(per_minute).allow_burst(burst);

        Self {
            source,
            limiter: RateLimiter::direct(quota),
            breaker: CircuitBreaker::new(source.as_str(), &config),
            usage: Arc::new(UsageTracker::new(source.as_str(), config.pricing.clone())),
            mode: config.mode,
            max_queue_wait: config.max_queue_wait,
        }
    }

    pub fn source(&self) -> DiscoverySource {
        self.source
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn usage(&self) -> ApiUsageStats {
        self.usage.snapshot(self.breaker.state())
    }

    pub fn reset_usage(&self) {
        self.usage.reset();
    }

    /// Breaker first so an open circuit never consumes rate budget.
    pub async fn admit(&self) -> Result<CallPermit<'_>, SourceError> {
        let Some(admission) = self.breaker.try_admit() else {
            self.usage.record_rejection();
            return Err(SourceError::CircuitOpen(self.source));
        };
        // Held across the queue wait so a cancelled `admit` gives the slot back.
        let mut pending = PendingAdmission {
            breaker: &self.breaker,
            admission: Some(admission),
        };

        let allowed = match self.mode {
            RateLimitMode::Reject => self.limiter.check().is_ok(),
            RateLimitMode::Queue => {
                tokio::time::timeout(self.max_queue_wait, self.limiter.until_ready())
                    .await
                    .is_ok()
            }
        };
        if !allowed {
            self.usage.record_rejection();
            return Err(SourceError::RateLimited(self.source));
        }

        Ok(CallPermit {
            guard: self,
            admission: pending.take(),
            started: Instant::now(),
            settled: false,
        })
    }
}

/// Breaker admission that has not reached the network yet.
struct PendingAdmission<'a> {
    breaker: &'a CircuitBreaker,
    admission: Option<Admission>,
}

impl PendingAdmission<'_> {
    fn take(&mut self) -> Admission {
        self.admission.take().unwrap_or(Admission { probe: false })
    }
}

impl Drop for PendingAdmission<'_> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.release(admission);
        }
    }
}

/// An admitted call. Must be settled with [`CallPermit::succeed`] or
/// [`CallPermit::fail`]; dropping it unsettled (cancellation, timeout)
/// counts as a failure.
pub struct CallPermit<'a> {
    guard: &'a SourceGuard,
    admission: Admission,
    started: Instant,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_probe(&self) -> bool {
        self.admission.probe
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.guard.breaker.record_success(self.admission);
        self.guard.usage.record_success(self.started.elapsed());
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.record_failure();
    }

    fn record_failure(&self) {
        self.guard.breaker.record_failure(self.admission);
        self.guard.usage.record_failure(self.started.elapsed());
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.record_failure();
        }
    }
}
