//! Integration tests for resilience module
//!
//! Drives the circuit breaker the way the connection pool does: a retry loop
//! with a backoff schedule, each attempt gated by the breaker.

#![cfg(feature = "runtime")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hidesync_common::resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitState, MockClock, RetryPolicy,
};

#[derive(Debug, PartialEq)]
enum Outcome {
    Connected,
    CircuitOpen,
    Exhausted,
}

fn breaker(threshold: u64, cooldown: Duration) -> (CircuitBreaker<MockClock>, MockClock) {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(threshold)
        .timeout(cooldown)
        .build()
        .unwrap();
    (CircuitBreaker::with_clock(config, clock.clone()).unwrap(), clock)
}

/// One connection attempt the way the pool makes it
fn attempt(cb: &CircuitBreaker<MockClock>, driver_calls: &AtomicU32, succeed: bool) -> Option<bool> {
    if !cb.try_acquire() {
        return None;
    }
    driver_calls.fetch_add(1, Ordering::SeqCst);
    if succeed {
        cb.record_success();
    } else {
        cb.record_failure();
    }
    Some(succeed)
}

/// Retries with backoff stop as soon as the breaker opens.
///
/// # Test Steps
/// 1. Threshold of 3, retry policy allowing 5 attempts
/// 2. Every attempt fails
/// 3. Only 3 driver calls happen; the 4th attempt is rejected by the breaker
#[test]
fn test_retry_loop_halts_when_circuit_opens() {
    let (cb, _clock) = breaker(3, Duration::from_secs(30));
    let policy = RetryPolicy::new(5, BackoffStrategy::Fixed(Duration::ZERO));
    let driver_calls = AtomicU32::new(0);

    let mut retry = 0;
    let outcome = loop {
        match attempt(&cb, &driver_calls, false) {
            None => break Outcome::CircuitOpen,
            Some(true) => break Outcome::Connected,
            Some(false) => match policy.delay_after(retry) {
                Some(delay) => {
                    thread::sleep(delay);
                    retry += 1;
                }
                None => break Outcome::Exhausted,
            },
        }
    };

    assert_eq!(outcome, Outcome::CircuitOpen);
    assert_eq!(driver_calls.load(Ordering::SeqCst), 3);
    assert_eq!(cb.state(), CircuitState::Open);
}

/// After the cooldown exactly one trial reaches the driver.
#[test]
fn test_exactly_one_retry_after_cooldown() {
    let (cb, clock) = breaker(2, Duration::from_secs(10));
    let driver_calls = AtomicU32::new(0);

    attempt(&cb, &driver_calls, false);
    attempt(&cb, &driver_calls, false);
    assert_eq!(driver_calls.load(Ordering::SeqCst), 2);

    for _ in 0..5 {
        assert_eq!(attempt(&cb, &driver_calls, false), None);
    }
    assert_eq!(driver_calls.load(Ordering::SeqCst), 2);

    clock.advance(Duration::from_secs(10));
    assert_eq!(attempt(&cb, &driver_calls, false), Some(false));
    assert_eq!(driver_calls.load(Ordering::SeqCst), 3);
    assert_eq!(attempt(&cb, &driver_calls, false), None);
    assert_eq!(driver_calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(10));
    assert_eq!(attempt(&cb, &driver_calls, true), Some(true));
    assert_eq!(cb.state(), CircuitState::Closed);
}

/// Concurrent callers racing for the half-open slot: only one wins.
#[test]
fn test_half_open_trial_is_exclusive_across_threads() {
    let (cb, clock) = breaker(1, Duration::from_secs(1));
    cb.record_failure();
    clock.advance(Duration::from_secs(2));

    let cb = Arc::new(cb);
    let winners = Arc::new(AtomicU32::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cb = Arc::clone(&cb);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                if cb.try_acquire() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    cb.record_success();
    assert_eq!(cb.state(), CircuitState::Closed);
}
