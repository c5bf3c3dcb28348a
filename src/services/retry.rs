//! Retry classification and backoff arithmetic. Stateless: the attempt
//! counter travels with the dispatch event.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::services::providers::ProviderResult;

/// Jitter applied to every computed delay, as a fraction of the delay.
const JITTER_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Success {
        response_id: Option<String>,
    },
    Retry {
        delay: Duration,
        code: String,
        message: String,
    },
    Fatal {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base: Duration::from_secs(config.base_seconds),
            cap: Duration::from_secs(config.cap_seconds),
        }
    }

    pub fn classify(&self, result: &ProviderResult, attempt: u32) -> Disposition {
        match result {
            ProviderResult::Success { response_id } => Disposition::Success {
                response_id: response_id.clone(),
            },
            ProviderResult::TransientError { code, message } if attempt < self.max_attempts => {
                Disposition::Retry {
                    delay: self.delay_for(attempt),
                    code: code.clone(),
                    message: message.clone(),
                }
            }
            ProviderResult::TransientError { code, message } => Disposition::Fatal {
                code: code.clone(),
                message: format!("{} (retries exhausted after {} attempts)", message, attempt),
            },
            ProviderResult::PermanentError { code, message } => Disposition::Fatal {
                code: code.clone(),
                message: message.clone(),
            },
        }
    }

    /// `min(base * 2^attempt +/- 20% jitter, cap)`. The exponent is clamped
    /// so the multiplication cannot overflow before the cap applies.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(20);
        let raw = self.base.as_secs_f64() * f64::from(1u32 << exponent);
        let jitter = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
        let seconds = (raw * jitter).min(self.cap.as_secs_f64());
        Duration::from_secs_f64(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(&Config::default().retry)
    }

    fn transient() -> ProviderResult {
        ProviderResult::TransientError {
            code: "503".to_string(),
            message: "unavailable".to_string(),
        }
    }

    #[test]
    fn success_is_success_at_any_attempt() {
        let result = ProviderResult::Success {
            response_id: Some("gc-1".to_string()),
        };
        assert!(matches!(
            policy().classify(&result, 4),
            Disposition::Success { response_id: Some(id) } if id == "gc-1"
        ));
    }

    #[test]
    fn transient_below_max_is_retried() {
        assert!(matches!(
            policy().classify(&transient(), 0),
            Disposition::Retry { .. }
        ));
        assert!(matches!(
            policy().classify(&transient(), 4),
            Disposition::Retry { .. }
        ));
    }

    #[test]
    fn transient_at_max_attempts_is_fatal() {
        // max_attempts = 5 in the default config: attempt 5 must not retry.
        assert!(matches!(
            policy().classify(&transient(), 5),
            Disposition::Fatal { .. }
        ));
    }

    #[test]
    fn permanent_is_always_fatal() {
        let result = ProviderResult::PermanentError {
            code: "400".to_string(),
            message: "bad address".to_string(),
        };
        assert!(matches!(
            policy().classify(&result, 0),
            Disposition::Fatal { .. }
        ));
    }

    #[test]
    fn delay_grows_and_respects_the_cap() {
        let policy = policy();
        let base = 5.0;
        let cap = 600.0;

        for attempt in 0..10 {
            let delay = policy.delay_for(attempt).as_secs_f64();
            let nominal = (base * f64::from(1u32 << attempt)).min(cap);
            assert!(delay <= cap + f64::EPSILON, "attempt {}: {} > cap", attempt, delay);
            assert!(
                delay >= nominal * 0.8 - f64::EPSILON || delay >= cap * 0.8,
                "attempt {}: {} below jitter floor {}",
                attempt,
                delay,
                nominal * 0.8
            );
            assert!(delay <= nominal * 1.2 + f64::EPSILON);
        }
    }
}
