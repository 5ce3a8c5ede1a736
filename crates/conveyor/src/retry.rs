/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Exponential backoff policy for retry scheduling.
//!
//! A failed item never becomes claimable again in the same cycle: the worker
//! computes the next attempt time from the attempt count and writes it back
//! with the failure.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a multiplicative factor, an upper cap, and
/// optional proportional jitter.
///
/// `delay(n)` for attempt `n` (0-based) is
/// `min(base * multiplier^n, max)`, scaled by a random factor in
/// `[1 - jitter, 1 + jitter]`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Proportional jitter in `[0, 1]`. Zero disables jitter.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            multiplier: 2.0,
            max: Duration::from_secs(3600),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay before the next attempt, given how many attempts
    /// have already failed.
    pub fn delay(&self, failed_attempts: i32) -> Duration {
        let exponent = failed_attempts.max(0) as f64;
        let raw = self.base.as_secs_f64() * self.multiplier.powf(exponent);
        let capped = raw.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let factor = rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Computes the wall-clock time of the next attempt.
    pub fn next_attempt_at(&self, failed_attempts: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay(failed_attempts);
        now + ChronoDuration::milliseconds(delay.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(10),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.0,
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_secs(10));
        assert_eq!(p.delay(1), Duration::from_secs(20));
        assert_eq!(p.delay(2), Duration::from_secs(40));
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay(3), Duration::from_secs(60));
        assert_eq!(p.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn negative_attempts_use_base() {
        let p = policy();
        assert_eq!(p.delay(-1), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = BackoffPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..100 {
            let d = p.delay(0).as_secs_f64();
            assert!((5.0..=15.0).contains(&d), "delay out of range: {}", d);
        }
    }

    #[test]
    fn next_attempt_at_is_in_the_future() {
        let p = policy();
        let now = Utc::now();
        let at = p.next_attempt_at(0, now);
        assert_eq!((at - now).num_seconds(), 10);
    }
}
