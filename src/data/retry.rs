//! Retry policy with exponential backoff, and the per-attempt outcome the
//! client's retry loop consumes.

use std::time::Duration;

use crate::error::FetchError;

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally jittered by +/- 50%.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = base.as_secs_f64() * factor.powi(exponent);
                let capped = seconds.min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(capped.max(0.0));

                if !jitter {
                    return delay;
                }

                let millis = delay.as_millis() as u64;
                let spread = millis / 2;
                let offset = fastrand::u64(0..=spread * 2);
                Duration::from_millis((millis + offset).saturating_sub(spread))
            }
        }
    }
}

/// How many times, and how patiently, a request is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            backoff: Backoff::default(),
            retry_on_status: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Classifies a completed HTTP exchange.
    ///
    /// Listed statuses and every 5xx are retried. Other 4xx responses are
    /// rejections; anything else is not a response the client understands.
    pub fn classify(&self, status: u16, body: String) -> AttemptOutcome {
        match status {
            200..=299 => AttemptOutcome::Success(body),
            _ if self.should_retry_status(status) => {
                AttemptOutcome::Retryable(format!("HTTP {status}"))
            }
            500..=599 => AttemptOutcome::Retryable(format!("HTTP {status}")),
            400..=499 => AttemptOutcome::Fatal(FetchError::ClientRequestError { status, body }),
            _ => AttemptOutcome::Fatal(FetchError::MalformedResponse(format!(
                "unexpected HTTP {status}"
            ))),
        }
    }
}

/// Result of a single request attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success(String),
    Retryable(String),
    Fatal(FetchError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_never_changes() {
        let backoff = Backoff::Fixed {
            delay: Duration::from_millis(100),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(7), Duration::from_millis(100));
    }

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_the_base_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..20 {
            for attempt in 0..5 {
                let expected = (100.0 * 2_f64.powi(attempt as i32)).min(1000.0);
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                assert!(delay_ms >= expected * 0.49, "attempt={attempt} delay={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "attempt={attempt} delay={delay_ms}");
            }
        }
    }

    #[test]
    fn classifies_rate_limits_and_server_errors_as_retryable() {
        let policy = RetryPolicy::default();

        assert_eq!(
            policy.classify(200, "[]".into()),
            AttemptOutcome::Success("[]".into())
        );
        assert!(matches!(policy.classify(429, String::new()), AttemptOutcome::Retryable(_)));
        assert!(matches!(policy.classify(503, String::new()), AttemptOutcome::Retryable(_)));
        for status in [501, 520, 522, 524] {
            assert!(
                matches!(policy.classify(status, String::new()), AttemptOutcome::Retryable(_)),
                "status={status}"
            );
        }
        assert!(matches!(
            policy.classify(301, String::new()),
            AttemptOutcome::Fatal(FetchError::MalformedResponse(_))
        ));
        assert_eq!(
            policy.classify(404, "not found".into()),
            AttemptOutcome::Fatal(FetchError::ClientRequestError {
                status: 404,
                body: "not found".into()
            })
        );
    }

    #[test]
    fn attempt_ceiling_is_retries_plus_one() {
        assert_eq!(RetryPolicy::fixed(Duration::ZERO, 3).max_attempts(), 4);
        assert_eq!(RetryPolicy::exponential(0).max_attempts(), 1);
    }
}
