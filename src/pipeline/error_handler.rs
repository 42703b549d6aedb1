//! Retry pacing for background tasks
//!
//! Delays double from `initial` up to `max`. After `retries` waits, `sleep`
//! reports exhaustion without waiting; `sleep_capped` keeps waiting `max` per
//! call and reports exhaustion after each wait. `reset` starts over.

use std::time::Duration;

#[derive(Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    retries: u32,
    attempt: u32,
}

/// All retry attempts have been used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesExhausted {
    pub attempts: u32,
}

impl std::fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gave up after {} retries", self.attempts)
    }
}

impl std::error::Error for RetriesExhausted {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial,
            max,
            retries,
            attempt: 0,
        }
    }

    /// Delay the next `sleep` would wait, if retries remain
    pub fn next_delay(&self) -> Option<Duration> {
        if self.attempt >= self.retries {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        Some(self.initial.saturating_mul(factor).min(self.max))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub async fn sleep(&mut self) -> Result<(), RetriesExhausted> {
        let delay = self.next_delay().ok_or(RetriesExhausted { attempts: self.attempt })?;

        log::warn!(
            "⏳ Retry {}/{} in {}ms",
            self.attempt + 1,
            self.retries,
            delay.as_millis()
        );

        tokio::time::sleep(delay).await;
        self.attempt += 1;
        Ok(())
    }

    /// Wait like `sleep`; once retries are used up, wait the capped delay
    /// and return `Err` so the caller can report it
    pub async fn sleep_capped(&mut self) -> Result<(), RetriesExhausted> {
        match self.sleep().await {
            Ok(()) => Ok(()),
            Err(exhausted) => {
                tokio::time::sleep(self.max).await;
                Err(exhausted)
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
