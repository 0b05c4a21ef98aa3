//! Operation Deadlines
//!
//! Bounds how long a guard operation may run. When the deadline elapses the
//! in-flight future is dropped; ledger appends are all-or-nothing, so a
//! cancelled consume leaves either a whole event or none.

use std::future::Future;
use std::time::Duration;
use tokio::time;

use super::error::{QuotaError, QuotaResult};

/// Optional per-operation deadline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationDeadline {
    duration: Option<Duration>,
}

impl OperationDeadline {
    /// Create a deadline
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use lectern_quota::quota::OperationDeadline;
    ///
    /// let deadline = OperationDeadline::new(Duration::from_millis(250));
    /// assert_eq!(deadline.duration(), Some(Duration::from_millis(250)));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
        }
    }

    /// No deadline: operations run to completion
    pub fn unbounded() -> Self {
        Self { duration: None }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn from_option(duration: Option<Duration>) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Run a quota operation under the deadline
    ///
    /// Returns [`QuotaError::DeadlineExceeded`] if the deadline elapses first.
    pub async fn run<F, T>(&self, future: F) -> QuotaResult<T>
    where
        F: Future<Output = QuotaResult<T>>,
    {
        match self.duration {
            None => future.await,
            Some(duration) => match time::timeout(duration, future).await {
                Ok(result) => result,
                Err(_) => Err(QuotaError::DeadlineExceeded(duration)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_default() {
        assert_eq!(OperationDeadline::default().duration(), None);
        assert_eq!(OperationDeadline::unbounded(), OperationDeadline::default());
    }

    #[test]
    fn test_from_millis() {
        let deadline = OperationDeadline::from_millis(45);
        assert_eq!(deadline.duration(), Some(Duration::from_millis(45)));
    }

    #[tokio::test]
    async fn test_run_success() {
        let deadline = OperationDeadline::from_millis(500);
        let result = deadline.run(async { Ok::<_, QuotaError>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let deadline = OperationDeadline::from_millis(20);
        let result = deadline
            .run(async {
                time::sleep(Duration::from_millis(500)).await;
                Ok::<_, QuotaError>(())
            })
            .await;
        assert_eq!(
            result,
            Err(QuotaError::DeadlineExceeded(Duration::from_millis(20)))
        );
    }

    #[tokio::test]
    async fn test_run_passes_through_errors() {
        let deadline = OperationDeadline::from_millis(500);
        let result = deadline
            .run(async { Err::<(), _>(QuotaError::Storage("down".into())) })
            .await;
        assert_eq!(result, Err(QuotaError::Storage("down".into())));
    }

    #[tokio::test]
    async fn test_unbounded_waits() {
        let result = OperationDeadline::unbounded()
            .run(async {
                time::sleep(Duration::from_millis(30)).await;
                Ok::<_, QuotaError>("done")
            })
            .await;
        assert_eq!(result, Ok("done"));
    }
}
