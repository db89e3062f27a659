use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{anyhow, Result};
use tokio::time::Instant;
use tracing::debug;

pub const MS_PER_SEC: u64 = 1_000;
pub const MS_PER_MINUTE: u64 = 60 * MS_PER_SEC;
pub const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
pub const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;

pub trait OptionInspectNone<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self;
}

impl<T> OptionInspectNone<T> for Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        if self.is_none() {
            inspector_function();
        }
        self
    }
}

impl<T> OptionInspectNone<T> for &Option<T> {
    fn inspect_none(self, inspector_function: impl FnOnce()) -> Self {
        if self.is_none() {
            inspector_function();
        }
        self
    }
}

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Backoff schedule for callers polling for an eventual condition.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
}

impl PollBackoff {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Default::default()
        }
    }
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Calls `probe` until it yields `Some`, doubling the sleep between attempts
/// up to `max_interval`. Fails once `timeout` has elapsed. Errors from the
/// probe are returned immediately.
pub async fn poll_until<T, F, Fut>(backoff: PollBackoff, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + backoff.timeout;
    let mut interval = backoff.initial_interval;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(anyhow!(
                "condition not met after {} attempts in {:?}",
                attempts,
                backoff.timeout
            ));
        }
        let sleep_for = interval.min(deadline - now);
        debug!(attempts, ?sleep_for, "condition not met, backing off");
        tokio::time::sleep(sleep_for).await;
        interval = (interval * 2).min(backoff.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_returns_first_value() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = calls.clone();
        let value = poll_until(PollBackoff::default(), move || {
            let calls = probe_calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(if n == 3 { Some(n) } else { None })
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let backoff = PollBackoff::with_timeout(Duration::from_secs(5));
        let result: Result<()> = poll_until(backoff, || async { Ok(None) }).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_inspect_none() {
        let mut seen = false;
        let value: Option<u32> = None;
        value.inspect_none(|| seen = true);
        assert!(seen);
    }
}
