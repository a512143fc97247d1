//! Bounded immediate-retry loop around transport operations.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::classifier::RetryClassifier;
use crate::envelope::{headers, Envelope};

/// Generic bounded-retry executor.
///
/// `RetryExecutor` drives an attempt closure until it succeeds, fails with a
/// non-retryable error, or exhausts the attempt budget. The same loop serves
/// request-only and request-reply flows; the closure's result type is the
/// only difference between them.
///
/// No delay is applied between attempts. Backoff is deliberately out of
/// scope here: callers needing one should layer it outside the loop.
pub struct RetryExecutor {
    classifier: RetryClassifier,
    max_attempts: u32,
}

impl RetryExecutor {
    /// Create an executor allowing one retry after the initial attempt.
    pub fn new(classifier: RetryClassifier) -> Self {
        RetryExecutor {
            classifier,
            max_attempts: 1,
        }
    }

    /// Set the number of retries allowed after the initial attempt. Values
    /// below 1 are raised to 1. A permanently failing operation is invoked
    /// `max_attempts + 1` times in total.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// The retryable-failure registry.
    pub fn classifier(&self) -> &RetryClassifier {
        &self.classifier
    }

    /// Mutable access to the retryable-failure registry.
    pub fn classifier_mut(&mut self) -> &mut RetryClassifier {
        &mut self.classifier
    }

    /// Run `attempt` until it succeeds or retries are exhausted.
    ///
    /// Before every re-attempt the retry observer is invoked with the
    /// envelope (and may mutate it), then the [`headers::RETRY_COUNT`] header
    /// is stamped with the current retry count. Each invocation of `attempt`
    /// receives a clone of the envelope as it stands at that point.
    ///
    /// A failure is retried only when the classifier accepts it and the
    /// budget is not exhausted; otherwise the original failure is returned
    /// unchanged so callers can inspect its concrete type and cause chain.
    pub async fn execute<T, R, F, Fut>(
        &self,
        envelope: &mut Envelope,
        mut on_retry: R,
        mut attempt: F,
    ) -> Result<T, tower::BoxError>
    where
        R: FnMut(&mut Envelope),
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<T, tower::BoxError>>,
    {
        // Atomic so transports that run send callbacks off-thread still
        // observe a consistent count.
        let retries = AtomicU32::new(0);

        loop {
            let count = retries.load(Ordering::Acquire);
            if count > 0 {
                on_retry(envelope);
                envelope.set_header(headers::RETRY_COUNT, count as i32);
            }

            match attempt(envelope.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let failure: &(dyn std::error::Error + 'static) = err.as_ref();
                    if self.classifier.is_retryable(failure)
                        && retries.fetch_add(1, Ordering::AcqRel) + 1 <= self.max_attempts
                    {
                        tracing::debug!(error = %err, "retryable failure, re-attempting");
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}
