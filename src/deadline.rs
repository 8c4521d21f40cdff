use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// A read or write deadline: the zero value means "no deadline", matching the Go convention this
/// layer's external interface mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    None,
    At(Instant),
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::None
    }
}

impl Deadline {
    pub fn at(instant: Instant) -> Self {
        Deadline::At(instant)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Deadline::None)
    }

    /// `None` if there is no deadline or it has not yet elapsed; `Some(elapsed-duration)` (always
    /// `Duration::ZERO`) if it has already passed.
    fn already_elapsed(&self) -> Option<Duration> {
        match self {
            Deadline::None => None,
            Deadline::At(at) if *at <= Instant::now() => Some(Duration::ZERO),
            Deadline::At(_) => None,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::None => None,
            Deadline::At(at) => Some(at.saturating_duration_since(Instant::now())),
        }
    }

    /// Races `fut` against this deadline. A deadline already in the past resolves immediately
    /// without polling `fut` at all, per the "past deadline fails immediately" edge case.
    pub async fn race<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        if self.already_elapsed().is_some() {
            return Err(Error::DeadlineExceeded);
        }

        match self.remaining() {
            None => Ok(fut.await),
            Some(remaining) => tokio::select! {
                biased;
                () = tokio::time::sleep(remaining) => Err(Error::DeadlineExceeded),
                value = fut => Ok(value),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_deadline_lets_future_complete() {
        let deadline = Deadline::None;
        let result = deadline.race(async { 42 }).await.unwrap();

        assert_eq!(result, 42);
    }

    #[tokio::test]
    async fn past_deadline_fails_without_polling_future() {
        let deadline = Deadline::at(Instant::now() - Duration::from_secs(1));
        let result = deadline.race(std::future::pending::<()>()).await;

        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn future_deadline_races_against_slow_future() {
        let deadline = Deadline::at(Instant::now() + Duration::from_millis(20));
        let result = deadline
            .race(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too slow"
            })
            .await;

        assert!(matches!(result, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn future_deadline_allows_fast_future_to_win() {
        let deadline = Deadline::at(Instant::now() + Duration::from_secs(5));
        let result = deadline.race(async { "fast" }).await.unwrap();

        assert_eq!(result, "fast");
    }
}
