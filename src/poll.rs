//! Condition polling with backoff
//!
//! Every wait in the orchestrator (pod readiness, bridge port verification,
//! interface appearance) goes through a [`Sleeper`] so tests can run the same
//! loops without real delays.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real time, backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately after yielding, recording every requested delay
#[derive(Debug, Clone, Default)]
pub struct InstantSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl InstantSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }
}

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
        tokio::task::yield_now().await;
    }
}

/// Exponential backoff: `min(floor * 2^(attempt / double_every), ceiling)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay for the first attempts, in seconds
    #[serde(default = "default_floor_secs")]
    pub floor_secs: u64,

    /// Upper bound on any single delay, in seconds
    #[serde(default = "default_ceiling_secs")]
    pub ceiling_secs: u64,

    /// Number of attempts between doublings
    #[serde(default = "default_double_every")]
    pub double_every: u32,

    /// Attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_floor_secs() -> u64 {
    1
}

fn default_ceiling_secs() -> u64 {
    30
}

fn default_double_every() -> u32 {
    5
}

fn default_max_attempts() -> u32 {
    10
}

impl Default for Backoff {
    fn default() -> Self {
        Self::readiness()
    }
}

impl Backoff {
    /// Workload readiness: 1s floor, doubling every 5 attempts, 10 attempts
    pub fn readiness() -> Self {
        Self {
            floor_secs: default_floor_secs(),
            ceiling_secs: default_ceiling_secs(),
            double_every: default_double_every(),
            max_attempts: default_max_attempts(),
        }
    }

    /// Bridge port verification: `min(2^(attempt/2), 30)`, 5 attempts
    pub fn bridge_verify() -> Self {
        Self {
            floor_secs: 1,
            ceiling_secs: 30,
            double_every: 2,
            max_attempts: 5,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay to wait after the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt / self.double_every.max(1);
        let factor = 1u64.checked_shl(doublings).unwrap_or(u64::MAX);
        let secs = self.floor_secs.saturating_mul(factor).min(self.ceiling_secs);
        Duration::from_secs(secs)
    }
}

/// Fixed-interval wait bounded by a total budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalWait {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    #[serde(default = "default_budget_secs")]
    pub budget_secs: u64,
}

fn default_interval_secs() -> u64 {
    1
}

fn default_budget_secs() -> u64 {
    30
}

impl Default for IntervalWait {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            budget_secs: default_budget_secs(),
        }
    }
}

impl IntervalWait {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Number of checks that fit in the budget (at least one)
    pub fn checks(&self) -> u64 {
        (self.budget_secs / self.interval_secs.max(1)).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_backoff_schedule() {
        let backoff = Backoff::readiness();
        let delays: Vec<u64> = (0..12).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2, 4, 4]);
    }

    #[test]
    fn test_backoff_ceiling() {
        let backoff = Backoff::readiness();
        assert_eq!(backoff.delay(40).as_secs(), 30);
        assert_eq!(backoff.delay(u32::MAX).as_secs(), 30);
    }

    #[test]
    fn test_bridge_verify_schedule() {
        let backoff = Backoff::bridge_verify();
        let delays: Vec<u64> = (0..5).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 2, 2, 4]);
    }

    #[test]
    fn test_interval_wait_checks() {
        assert_eq!(IntervalWait::default().checks(), 30);
        let tiny = IntervalWait {
            interval_secs: 5,
            budget_secs: 1,
        };
        assert_eq!(tiny.checks(), 1);
    }

    #[tokio::test]
    async fn test_instant_sleeper_records() {
        let sleeper = InstantSleeper::new();
        sleeper.sleep(Duration::from_secs(2)).await;
        sleeper.sleep(Duration::from_secs(3)).await;
        assert_eq!(sleeper.total(), Duration::from_secs(5));
        assert_eq!(sleeper.recorded().len(), 2);
    }

    #[test]
    fn test_tokio_sleeper_zero_returns() {
        tokio_test::block_on(TokioSleeper.sleep(Duration::ZERO));
    }
}
