use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T, E> {
    Succeeded(T),
    TimedOut,
    Errored(E),
}

impl<T, E> WaitOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Succeeded(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollSpec {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Spreads `timeout` over attempts spaced `interval` apart.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let attempts = (timeout.as_millis() / interval.as_millis()).max(1);
        Self {
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
            interval,
        }
    }

    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Calls `probe` up to `spec.attempts` times, sleeping `spec.interval` after
/// each miss. `Ok(Some(_))` finishes the wait, `Ok(None)` keeps polling and
/// `Err(_)` aborts it.
pub async fn wait_until<T, E, F, Fut>(spec: PollSpec, mut probe: F) -> WaitOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    for attempt in 0..spec.attempts {
        match probe(attempt).await {
            Ok(Some(value)) => return WaitOutcome::Succeeded(value),
            Ok(None) => sleep(spec.interval).await,
            Err(err) => return WaitOutcome::Errored(err),
        }
    }
    WaitOutcome::TimedOut
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_hit() {
        let outcome: WaitOutcome<u32, ()> =
            wait_until(PollSpec::new(5, Duration::from_secs(1)), |attempt| async move {
                Ok((attempt == 2).then_some(attempt))
            })
            .await;
        assert_eq!(outcome, WaitOutcome::Succeeded(2));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_after_exact_budget() {
        let start = Instant::now();
        let mut calls = 0;
        let outcome: WaitOutcome<(), ()> =
            wait_until(PollSpec::new(15, Duration::from_secs(1)), |_| {
                calls += 1;
                async { Ok(None) }
            })
            .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(calls, 15);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn error_stops_polling() {
        let outcome: WaitOutcome<(), &str> =
            wait_until(PollSpec::new(5, Duration::from_secs(1)), |attempt| async move {
                if attempt == 1 {
                    Err("gone")
                } else {
                    Ok(None)
                }
            })
            .await;
        assert_eq!(outcome, WaitOutcome::Errored("gone"));
    }

    #[test]
    fn timeout_is_split_into_attempts() {
        let spec = PollSpec::from_timeout(Duration::from_secs(180), Duration::from_secs(2));
        assert_eq!(spec.attempts, 90);
        assert_eq!(spec.budget(), Duration::from_secs(180));
    }
}
