use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use super::error::TemporaryError;

/// Sliding-log rate window: at most `limit` admissions in any `delta`.
///
/// Waiters pass through a fair `tokio` mutex first, so admission order is
/// the order in which callers arrived. A `limit` of zero admits everything.
#[derive(Debug)]
pub struct RateWindow {
    limit: usize,
    delta: Duration,
    log: parking_lot::Mutex<VecDeque<Instant>>,
    turnstile: tokio::sync::Mutex<()>,
}

impl RateWindow {
    #[must_use]
    pub fn new(limit: usize, delta: Duration) -> Self {
        Self {
            limit,
            delta,
            log: parking_lot::Mutex::new(VecDeque::with_capacity(limit)),
            turnstile: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.limit == 0
    }

    /// Either record an admission at `now` or return when the next slot opens.
    fn try_admit(&self, now: Instant) -> Result<(), Instant> {
        let mut log = self.log.lock();

        while log
            .front()
            .is_some_and(|admitted| now.saturating_duration_since(*admitted) >= self.delta)
        {
            log.pop_front();
        }

        if log.len() < self.limit {
            log.push_back(now);
            return Ok(());
        }

        Err(log.front().map_or(now, |oldest| *oldest + self.delta))
    }

    /// Wait for an admission, giving up at `deadline`.
    ///
    /// # Errors
    /// `TemporaryError::RateLimited` when no slot opens in time
    pub async fn acquire(&self, deadline: Instant) -> Result<(), TemporaryError> {
        if self.is_unlimited() {
            return Ok(());
        }

        let limited = || {
            TemporaryError::RateLimited(format!(
                "more than {} messages in {:?}",
                self.limit, self.delta
            ))
        };

        let _turn = tokio::time::timeout_at(deadline, self.turnstile.lock())
            .await
            .map_err(|_| limited())?;

        loop {
            match self.try_admit(Instant::now()) {
                Ok(()) => return Ok(()),
                Err(opens_at) if opens_at > deadline => return Err(limited()),
                Err(opens_at) => tokio::time::sleep_until(opens_at).await,
            }
        }
    }
}
