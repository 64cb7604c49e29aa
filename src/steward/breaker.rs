//! Circuit breaker guarding the merge decision model
//!
//! Closed until `failure_threshold` consecutive failures, then open for the
//! cooldown. Once the cooldown has passed a single trial call is let through
//! (half-open) while other callers keep being refused; a success closes the
//! breaker, a failure reopens it with a fresh cooldown.

use crate::config::BreakerConfig;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const OPEN_REASON: &str = "repeated_model_or_executor_failures";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Serializable view of the breaker, as reported by the manager status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub open: bool,
    pub state: BreakerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trial_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trial_in_flight: bool,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            open: false,
            state: BreakerState::Closed,
            reason: None,
            opened_at: None,
            cooldown_until: None,
            consecutive_failures: 0,
            last_failure: None,
            last_trial_success_at: None,
            trial_in_flight: false,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerSnapshot>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerSnapshot::default()),
        }
    }

    pub fn from_config(config: &BreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown)
    }

    /// Whether a decision-model call may go out now
    pub async fn allow_request(&self) -> bool {
        self.allow_request_at(Utc::now()).await
    }

    pub(crate) async fn allow_request_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        match state.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen if state.trial_in_flight => false,
            BreakerState::HalfOpen => {
                state.trial_in_flight = true;
                true
            }
            BreakerState::Open => match state.cooldown_until {
                Some(until) if now > until => {
                    state.state = BreakerState::HalfOpen;
                    state.open = false;
                    state.trial_in_flight = true;
                    info!("Circuit breaker half-open, allowing trial call");
                    true
                }
                _ => false,
            },
        }
    }

    /// Hand back a trial slot that was granted but never used for a call
    pub async fn release_trial(&self) {
        self.state.lock().await.trial_in_flight = false;
    }

    pub async fn record_failure(&self) {
        self.record_failure_at(Utc::now()).await
    }

    pub(crate) async fn record_failure_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.trial_in_flight = false;
        state.consecutive_failures += 1;
        state.last_failure = Some(now);

        let trip = state.state == BreakerState::HalfOpen
            || state.consecutive_failures >= self.failure_threshold;
        if trip {
            let cooldown = ChronoDuration::from_std(self.cooldown)
                .unwrap_or_else(|_| ChronoDuration::seconds(120));
            state.state = BreakerState::Open;
            state.open = true;
            state.reason = Some(OPEN_REASON.to_string());
            state.opened_at = Some(now);
            state.cooldown_until = Some(now + cooldown);
            warn!(
                "Circuit breaker opened after {} consecutive failures",
                state.consecutive_failures
            );
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        let was_tripped = state.state != BreakerState::Closed;
        state.consecutive_failures = 0;
        state.trial_in_flight = false;
        state.state = BreakerState::Closed;
        state.open = false;
        state.reason = None;
        state.cooldown_until = None;
        state.last_trial_success_at = Some(Utc::now());
        if was_tripped {
            info!("Circuit breaker closed");
        }
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        self.state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_breaker_allows_calls() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(tokio_test::block_on(breaker.allow_request()));
        let snapshot = tokio_test::block_on(breaker.snapshot());
        assert_eq!(snapshot.state, BreakerState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_opens_at_threshold_and_respects_cooldown() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        let now = Utc::now();
        breaker.record_failure_at(now).await;
        breaker.record_failure_at(now).await;
        assert!(breaker.allow_request_at(now).await);

        breaker.record_failure_at(now).await;
        let snapshot = breaker.snapshot().await;
        assert!(snapshot.open);
        assert_eq!(snapshot.reason.as_deref(), Some(OPEN_REASON));
        assert_eq!(snapshot.cooldown_until, Some(now + ChronoDuration::seconds(30)));

        assert!(!breaker.allow_request_at(now + ChronoDuration::seconds(10)).await);
        assert!(breaker.allow_request_at(now + ChronoDuration::seconds(31)).await);
        assert_eq!(breaker.snapshot().await.state, BreakerState::HalfOpen);
    }

    #[tokio::test]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let now = Utc::now();
        breaker.record_failure_at(now).await;
        let later = now + ChronoDuration::seconds(31);

        assert!(breaker.allow_request_at(later).await);
        assert!(!breaker.allow_request_at(later).await);
        assert!(!breaker.allow_request_at(later).await);
        assert!(breaker.snapshot().await.trial_in_flight);

        // An unused slot can be handed to the next caller
        breaker.release_trial().await;
        assert!(breaker.allow_request_at(later).await);
        assert!(!breaker.allow_request_at(later).await);

        breaker.record_success().await;
        assert!(breaker.allow_request_at(later).await);
        assert!(breaker.allow_request_at(later).await);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let now = Utc::now();
        breaker.record_failure_at(now).await;
        let later = now + ChronoDuration::seconds(31);
        assert!(breaker.allow_request_at(later).await);

        breaker.record_failure_at(later).await;
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.state, BreakerState::Open);
        assert_eq!(snapshot.cooldown_until, Some(later + ChronoDuration::seconds(30)));
    }

    #[tokio::test]
    async fn test_success_closes_and_resets() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure().await;
        assert!(breaker.snapshot().await.open);

        breaker.record_success().await;
        let snapshot = breaker.snapshot().await;
        assert!(!snapshot.open);
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_trial_success_at.is_some());
        assert!(breaker.allow_request().await);
    }
}
