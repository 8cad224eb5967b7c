//! Shared fetch budget and retry policy.
//!
//! `RateLimiter` is a fixed-window token budget shared by every worker. A
//! challenge reported by a worker doubles the window length (the cooldown
//! multiplier) and, when configured, closes a gate that blocks all new fetches
//! until an operator clears it.

use std::time::Duration;

use hrs_core::ErrorClass;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2,
            max_delay: Duration::from_secs(60),
        }
    }
}

/// What the coordinator does at the `failed -> pending` edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue after `delay`, charging one retry.
    Retry { delay: Duration },
    /// Re-queue immediately without charging a retry.
    Requeue,
    /// Leave the task in terminal `failed`.
    GiveUp,
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = self.multiplier.max(1).checked_pow(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn decide(&self, class: ErrorClass, retry_count: u32) -> RetryDecision {
        match class {
            ErrorClass::Challenge => RetryDecision::Requeue,
            ErrorClass::Permanent => RetryDecision::GiveUp,
            ErrorClass::Transient if retry_count < self.max_retries => RetryDecision::Retry {
                delay: self.delay_for_attempt(retry_count),
            },
            ErrorClass::Transient => RetryDecision::GiveUp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub requests_per_window: u32,
    pub window: Duration,
    pub max_cooldown_multiplier: u32,
    /// Close the gate on a challenge instead of only slowing down.
    pub pause_on_challenge: bool,
    /// Consecutive successes needed to halve the cooldown multiplier.
    pub decay_after_successes: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 12,
            window: Duration::from_secs(60),
            max_cooldown_multiplier: 16,
            pause_on_challenge: true,
            decay_after_successes: 20,
        }
    }
}

#[derive(Debug)]
struct RateBudget {
    window_started: Instant,
    used_in_window: u32,
    cooldown_multiplier: u32,
    consecutive_successes: u32,
    challenges_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudgetSnapshot {
    pub used_in_window: u32,
    pub cooldown_multiplier: u32,
    pub challenges_seen: u64,
    pub paused: bool,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<RateBudget>,
    gate: watch::Sender<bool>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            config: RateLimitConfig {
                requests_per_window: config.requests_per_window.max(1),
                max_cooldown_multiplier: config.max_cooldown_multiplier.max(1),
                ..config
            },
            state: Mutex::new(RateBudget {
                window_started: Instant::now(),
                used_in_window: 0,
                cooldown_multiplier: 1,
                consecutive_successes: 0,
                challenges_seen: 0,
            }),
            gate,
        }
    }

    /// Take one request token, waiting for the gate and for window replenishment.
    pub async fn acquire(&self) {
        loop {
            self.wait_until_clear().await;

            let mut state = self.state.lock().await;
            let window = self.config.window.saturating_mul(state.cooldown_multiplier);
            let elapsed = state.window_started.elapsed();
            if elapsed >= window {
                state.window_started = Instant::now();
                state.used_in_window = 0;
            }

            if state.used_in_window < self.config.requests_per_window {
                state.used_in_window += 1;
                return;
            }

            let sleep_for = window.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Resolves once no challenge is pending.
    pub async fn wait_until_clear(&self) {
        let mut rx = self.gate.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    pub fn is_paused(&self) -> bool {
        *self.gate.borrow()
    }

    /// Receiver that flips to `true` whenever a challenge closes the gate.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.gate.subscribe()
    }

    /// Record a hostile response; returns the new cooldown multiplier.
    pub async fn raise_challenge(&self) -> u32 {
        let mut state = self.state.lock().await;
        state.cooldown_multiplier = state
            .cooldown_multiplier
            .saturating_mul(2)
            .min(self.config.max_cooldown_multiplier);
        state.consecutive_successes = 0;
        state.challenges_seen += 1;
        let multiplier = state.cooldown_multiplier;
        drop(state);

        if self.config.pause_on_challenge {
            self.gate.send_replace(true);
            warn!(multiplier, "challenge detected; fetching paused until cleared");
        } else {
            warn!(multiplier, "challenge detected; cooldown raised");
        }
        multiplier
    }

    /// External signal that the challenge was handled.
    pub fn clear_challenge(&self) {
        if self.gate.send_replace(false) {
            info!("challenge cleared; fetching resumes");
        }
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_successes += 1;
        if state.cooldown_multiplier > 1 && state.consecutive_successes >= self.config.decay_after_successes {
            state.cooldown_multiplier /= 2;
            state.consecutive_successes = 0;
        }
    }

    pub async fn snapshot(&self) -> RateBudgetSnapshot {
        let state = self.state.lock().await;
        RateBudgetSnapshot {
            used_in_window: state.used_in_window,
            cooldown_multiplier: state.cooldown_multiplier,
            challenges_seen: state.challenges_seen,
            paused: self.is_paused(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(requests: u32, pause: bool) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_window: requests,
            window: Duration::from_secs(10),
            max_cooldown_multiplier: 4,
            pause_on_challenge: pause,
            decay_after_successes: 2,
        })
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 3,
            max_delay: Duration::from_millis(1000),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(1000));
    }

    #[test]
    fn retry_decisions_follow_error_class() {
        let policy = BackoffPolicy {
            max_retries: 2,
            ..Default::default()
        };
        assert!(matches!(policy.decide(ErrorClass::Transient, 0), RetryDecision::Retry { .. }));
        assert!(matches!(policy.decide(ErrorClass::Transient, 1), RetryDecision::Retry { .. }));
        assert_eq!(policy.decide(ErrorClass::Transient, 2), RetryDecision::GiveUp);
        assert_eq!(policy.decide(ErrorClass::Permanent, 0), RetryDecision::GiveUp);
        assert_eq!(policy.decide(ErrorClass::Challenge, 99), RetryDecision::Requeue);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_window_blocks_until_replenished() {
        let limiter = limiter(2, true);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(limiter.snapshot().await.used_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_gate_blocks_until_cleared() {
        let limiter = Arc::new(limiter(10, true));
        assert_eq!(limiter.raise_challenge().await, 2);
        assert!(limiter.is_paused());

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(!waiter.is_finished());

        limiter.clear_challenge();
        waiter.await.unwrap();
        assert!(!limiter.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_multiplier_is_capped_and_decays() {
        let limiter = limiter(10, false);
        assert_eq!(limiter.raise_challenge().await, 2);
        assert_eq!(limiter.raise_challenge().await, 4);
        assert_eq!(limiter.raise_challenge().await, 4);
        assert!(!limiter.is_paused());

        limiter.record_success().await;
        limiter.record_success().await;
        let snap = limiter.snapshot().await;
        assert_eq!(snap.cooldown_multiplier, 2);
        assert_eq!(snap.challenges_seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_stretches_the_window() {
        let limiter = limiter(1, false);
        limiter.raise_challenge().await;
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(20));
    }
}
