//! Per-service request accounting and cost estimation.
//!
//! Reporting only: nothing in here feeds back into admission control.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::layers::guard::CircuitState;

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// How a provider bills for requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "kebab-case")]
pub enum PricingModel {
    /// Free up to an optional quota; requests beyond it are still free but
    /// reported as over quota.
    Free { monthly_quota: Option<u64> },
    PayPerUse {
        free_requests: u64,
        cost_per_request: f64,
    },
    Subscription {
        monthly_fee: f64,
        included_requests: u64,
        overage_per_request: f64,
    },
}

impl Default for PricingModel {
    fn default() -> Self {
        PricingModel::Free { monthly_quota: None }
    }
}

impl PricingModel {
    /// Estimated spend for `requests` billable requests in one billing period.
    pub fn estimate_cost(&self, requests: u64) -> f64 {
        match *self {
            PricingModel::Free { .. } => 0.0,
            PricingModel::PayPerUse {
                free_requests,
                cost_per_request,
            } => requests.saturating_sub(free_requests) as f64 * cost_per_request,
            PricingModel::Subscription {
                monthly_fee,
                included_requests,
                overage_per_request,
            } => monthly_fee + requests.saturating_sub(included_requests) as f64 * overage_per_request,
        }
    }

    pub fn over_quota(&self, requests: u64) -> bool {
        match *self {
            PricingModel::Free { monthly_quota } => monthly_quota.is_some_and(|q| requests > q),
            PricingModel::PayPerUse { .. } => false,
            PricingModel::Subscription {
                included_requests, ..
            } => requests > included_requests,
        }
    }
}

/// Point-in-time view of one service's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiUsageStats {
    pub service: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Short-circuited by the breaker or the rate cap; never sent.
    pub rejected_requests: u64,
    pub circuit_state: CircuitState,
    pub requests_last_minute: usize,
    pub average_response_ms: f64,
    pub pricing: PricingModel,
    pub estimated_cost: f64,
    pub over_quota: bool,
}

/// Thread-safe running counters for a single external service.
#[derive(Debug)]
pub struct UsageTracker {
    service: String,
    pricing: PricingModel,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    latency_micros: AtomicU64,
    recent: Mutex<VecDeque<Instant>>,
}

impl UsageTracker {
    pub fn new(service: impl Into<String>, pricing: PricingModel) -> Self {
        Self {
            service: service.into(),
            pricing,
            successful: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.successful.fetch_add(1, Ordering::Relaxed);
        self.record_call(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.record_call(latency);
    }

    pub fn record_rejection(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn record_call(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);

        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.push_back(now);
        prune(&mut recent, now);
    }

    pub fn requests_last_minute(&self) -> usize {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut recent, Instant::now());
        recent.len()
    }

    pub fn snapshot(&self, circuit_state: CircuitState) -> ApiUsageStats {
        let successful = self.successful.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let total = successful + failed;
        let average_response_ms = if total == 0 {
            0.0
        } else {
            self.latency_micros.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        };

        ApiUsageStats {
            service: self.service.clone(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            circuit_state,
            requests_last_minute: self.requests_last_minute(),
            average_response_ms,
            pricing: self.pricing.clone(),
            estimated_cost: self.pricing.estimate_cost(total),
            over_quota: self.pricing.over_quota(total),
        }
    }

    /// Operator reset. Nothing else ever zeroes the counters.
    pub fn reset(&self) {
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.latency_micros.store(0, Ordering::Relaxed);
        self.recent.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::info!(service = %self.service, "Usage counters reset");
    }
}

fn prune(recent: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = recent.front() {
        if now.duration_since(*oldest) >= RATE_WINDOW {
            recent.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_cost_models() {
        assert_eq!(PricingModel::default().estimate_cost(10_000), 0.0);

        let pay = PricingModel::PayPerUse {
            free_requests: 100,
            cost_per_request: 0.01,
        };
        assert_eq!(pay.estimate_cost(50), 0.0);
        assert!((pay.estimate_cost(300) - 2.0).abs() < 1e-9);

        let sub = PricingModel::Subscription {
            monthly_fee: 49.0,
            included_requests: 1000,
            overage_per_request: 0.05,
        };
        assert!((sub.estimate_cost(900) - 49.0).abs() < 1e-9);
        assert!((sub.estimate_cost(1100) - 54.0).abs() < 1e-9);
        assert!(sub.over_quota(1001));
    }

    #[test]
    fn test_free_quota_flag() {
        let free = PricingModel::Free {
            monthly_quota: Some(10),
        };
        assert!(!free.over_quota(10));
        assert!(free.over_quota(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_minute_window() {
        let tracker = UsageTracker::new("academic-graph", PricingModel::default());
        tracker.record_success(Duration::from_millis(100));
        tracker.record_failure(Duration::from_millis(300));
        assert_eq!(tracker.requests_last_minute(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        tracker.record_success(Duration::from_millis(200));
        assert_eq!(tracker.requests_last_minute(), 1);

        let stats = tracker.snapshot(CircuitState::Closed);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert!((stats.average_response_ms - 200.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let tracker = Arc::new(UsageTracker::new("bibliographic-index", PricingModel::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    tracker.record_success(Duration::from_millis(1));
                    tracker.record_rejection();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stats = tracker.snapshot(CircuitState::Closed);
        assert_eq!(stats.successful_requests, 800);
        assert_eq!(stats.rejected_requests, 800);

        tracker.reset();
        assert_eq!(tracker.snapshot(CircuitState::Closed).total_requests, 0);
    }
}
