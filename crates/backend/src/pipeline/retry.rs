// Backoff schedule for retrying transient processor failures.

use std::time::Duration;

use arcflow_core::config::RetryConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
  max_retries: u32,
  initial: Duration,
  max: Duration,
  multiplier: f64,
  jitter: bool,
}

impl Backoff {
  pub fn new(config: &RetryConfig) -> Self {
    Self {
      max_retries: config.max_retries,
      initial: Duration::from_millis(config.initial_backoff_ms),
      max: Duration::from_millis(config.max_backoff_ms),
      multiplier: config.backoff_multiplier.max(1.0),
      jitter: config.jitter,
    }
  }

  pub fn max_retries(&self) -> u32 {
    self.max_retries
  }

  /// Delay before retry number `attempt + 1` (zero-based).
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
    let mut delay = Duration::from_secs_f64(base.min(self.max.as_secs_f64()));

    if self.jitter {
      // Add up to 25% jitter
      let jitter_factor = 1.0 + (rand_f64() * 0.25);
      delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter_factor);
    }

    delay.min(self.max)
  }
}

/// Pseudo-random value in [0, 1) from the clock; good enough for jitter
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  unit_from_nanos(nanos)
}

/// Map a sub-second nanosecond count onto [0, 1).
fn unit_from_nanos(nanos: u32) -> f64 {
  f64::from(nanos % NANOS_PER_SEC) / f64::from(NANOS_PER_SEC)
}

const NANOS_PER_SEC: u32 = 1_000_000_000;
