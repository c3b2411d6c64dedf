//! Pure backoff delay computation
//!
//! Each strategy maps a 1-based attempt number and the configured base delay
//! to the number of milliseconds to wait before the next attempt. Strategies
//! never sleep; the retry orchestrator owns the timer.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Named backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffType {
    /// The base delay every time.
    Linear,
    /// `base * 2^(attempt-1)`, uncapped.
    Exponential,
    /// `base * 2^(attempt-1)`, clamped to the configured maximum.
    ExponentialCapped,
    /// `base * fib(attempt)`.
    Fibonacci,
    /// `base + uniform(0, base)`.
    Jitter,
    /// Exponential plus `uniform(0, base)`, clamped to the maximum.
    ExponentialJitter,
    /// An explicit delay sequence; the last entry repeats.
    Custom,
}

impl Default for BackoffType {
    fn default() -> Self {
        Self::Linear
    }
}

/// Compute the delay in milliseconds before the retry that follows `attempt`.
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub fn compute_delay(
    backoff: BackoffType,
    base_ms: u64,
    max_delay_ms: u64,
    custom_delays_ms: &[u64],
    attempt: u32,
) -> u64 {
    let attempt = attempt.max(1);
    match backoff {
        BackoffType::Linear => base_ms,
        BackoffType::Exponential => base_ms.saturating_mul(power_of_two(attempt - 1)),
        BackoffType::ExponentialCapped => base_ms
            .saturating_mul(power_of_two(attempt - 1))
            .min(max_delay_ms),
        BackoffType::Fibonacci => base_ms.saturating_mul(fibonacci(attempt)),
        BackoffType::Jitter => base_ms.saturating_add(uniform(base_ms)),
        BackoffType::ExponentialJitter => base_ms
            .saturating_mul(power_of_two(attempt - 1))
            .saturating_add(uniform(base_ms))
            .min(max_delay_ms),
        BackoffType::Custom => {
            if custom_delays_ms.is_empty() {
                base_ms
            } else {
                let idx = ((attempt - 1) as usize).min(custom_delays_ms.len() - 1);
                custom_delays_ms[idx]
            }
        }
    }
}

fn power_of_two(exp: u32) -> u64 {
    if exp >= 63 {
        u64::MAX
    } else {
        1u64 << exp
    }
}

/// `fib(1) = 1, fib(2) = 1, fib(3) = 2, ...`, saturating.
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

fn uniform(upper_ms: u64) -> u64 {
    if upper_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=upper_ms)
    }
}
