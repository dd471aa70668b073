//! Flow tokens: a bound on SDUs in flight inside the transport.
//!
//! One token is taken before every submission and comes back when the
//! transport reports the send complete. A token that was taken but never
//! submitted returns immediately, and so does one whose send was refused.
//!
//! A token counts as in transport before `send` is called. Completions may
//! be posted from inside `send` and handled on another thread before it
//! returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::error::PipelineFault;

/// Counting pool of transmit tokens for one live group.
#[derive(Debug)]
pub struct FlowTokens {
    permits: Semaphore,
    max: usize,
    in_transport: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// A token held between acquisition and submission.
///
/// Dropping it without [`submit`](FlowToken::submit) returns it to the pool.
#[derive(Debug)]
#[must_use = "an unsubmitted token returns to the pool when dropped"]
pub struct FlowToken<'a> {
    permit: Option<SemaphorePermit<'a>>,
    tokens: &'a FlowTokens,
}

/// A token counted as in transport while its `send` call runs.
///
/// Dropping it leaves the token out until the completion arrives; call
/// [`rollback`](Submission::rollback) if the transport refused the send.
#[derive(Debug)]
pub struct Submission<'a> {
    tokens: &'a FlowTokens,
}

impl FlowTokens {
    /// Create a pool of `max` tokens, all available.
    pub fn new(max: usize) -> Self {
        Self {
            permits: Semaphore::new(max),
            max,
            in_transport: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    /// Wait up to `timeout` for a token.
    pub async fn acquire(&self, timeout: Duration) -> Result<FlowToken<'_>, PipelineFault> {
        self.acquire_until(Instant::now() + timeout)
            .await
            .ok_or(PipelineFault::TokenTimeout(timeout))
    }

    /// Wait for a token until `deadline`.
    pub async fn acquire_until(&self, deadline: Instant) -> Option<FlowToken<'_>> {
        match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => Some(self.token(permit)),
            // The semaphore is never closed; treat it like a timeout anyway.
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(&self) -> Option<FlowToken<'_>> {
        self.permits.try_acquire().ok().map(|permit| self.token(permit))
    }

    fn token<'a>(&'a self, permit: SemaphorePermit<'a>) -> FlowToken<'a> {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        FlowToken {
            permit: Some(permit),
            tokens: self,
        }
    }

    /// Return the token of one completed send.
    ///
    /// A completion with nothing in flight is ignored, so the pool never
    /// grows past its maximum. Returns whether a token was returned.
    pub fn complete(&self) -> bool {
        let returned = self
            .in_transport
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if returned {
            self.permits.add_permits(1);
            self.released.fetch_add(1, Ordering::Relaxed);
        } else {
            tracing::warn!("send completion with no SDU in flight, ignoring");
        }
        returned
    }

    /// SDUs submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_transport.load(Ordering::Acquire) as usize
    }

    /// Tokens free right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Pool size.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Tokens handed out so far.
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Tokens returned so far, by completion or by an abandoned submission.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl<'a> FlowToken<'a> {
    /// Hand the token to the transport. Call this before `send`.
    pub fn submit(mut self) -> Submission<'a> {
        if let Some(permit) = self.permit.take() {
            permit.forget();
            self.tokens.in_transport.fetch_add(1, Ordering::AcqRel);
        }
        Submission {
            tokens: self.tokens,
        }
    }
}

impl Submission<'_> {
    /// The send was refused, so no completion will follow. Returns the
    /// token to the pool.
    pub fn rollback(self) {
        let tokens = self.tokens;
        let taken_back = tokens
            .in_transport
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if taken_back {
            tokens.permits.add_permits(1);
            tokens.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl Drop for FlowToken<'_> {
    fn drop(&mut self) {
        if self.permit.take().is_some() {
            self.tokens.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_token_stays_out_until_complete() {
        let tokens = FlowTokens::new(1);
        tokens.acquire(Duration::from_millis(1)).await.unwrap().submit();

        assert_eq!(tokens.in_flight(), 1);
        assert_eq!(tokens.available(), 0);
        assert!(tokens.try_acquire().is_none());

        assert!(tokens.complete());
        assert_eq!(tokens.in_flight(), 0);
        assert_eq!(tokens.available(), 1);
    }

    #[tokio::test]
    async fn dropped_token_returns_immediately() {
        let tokens = FlowTokens::new(2);
        {
            let _token = tokens.try_acquire().unwrap();
            assert_eq!(tokens.available(), 1);
        }
        assert_eq!(tokens.available(), 2);
        assert_eq!(tokens.in_flight(), 0);
        assert_eq!(tokens.acquired(), 1);
        assert_eq!(tokens.released(), 1);
    }

    #[tokio::test]
    async fn spurious_completion_does_not_grow_pool() {
        let tokens = FlowTokens::new(1);
        assert!(!tokens.complete());
        assert_eq!(tokens.available(), 1);
        assert_eq!(tokens.max(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_exhausted() {
        let tokens = FlowTokens::new(1);
        tokens.try_acquire().unwrap().submit();

        let result = tokens.acquire(Duration::from_millis(20)).await;
        assert_eq!(
            result.unwrap_err(),
            PipelineFault::TokenTimeout(Duration::from_millis(20))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_until_honours_deadline() {
        let tokens = FlowTokens::new(1);
        tokens.try_acquire().unwrap().submit();

        let start = Instant::now();
        assert!(tokens.acquire_until(start + Duration::from_millis(15)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
        assert!(tokens.acquire_until(start).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_wakes_on_completion() {
        let tokens = std::sync::Arc::new(FlowTokens::new(1));
        tokens.try_acquire().unwrap().submit();

        let completer = tokens.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completer.complete();
        });

        let token = tokens.acquire(Duration::from_millis(20)).await;
        assert!(token.is_ok());
    }

    #[test]
    fn completion_during_send_returns_token() {
        let tokens = FlowTokens::new(1);
        let submission = tokens.try_acquire().unwrap().submit();

        // The transport completes the SDU before `send` has returned.
        assert!(tokens.complete());
        drop(submission);

        assert_eq!(tokens.available(), 1);
        assert_eq!(tokens.in_flight(), 0);
        assert_eq!(tokens.acquired(), tokens.released());
    }

    #[test]
    fn rollback_returns_refused_token() {
        let tokens = FlowTokens::new(2);
        tokens.try_acquire().unwrap().submit().rollback();

        assert_eq!(tokens.available(), 2);
        assert_eq!(tokens.in_flight(), 0);
        assert_eq!(tokens.acquired(), 1);
        assert_eq!(tokens.released(), 1);
    }

    #[test]
    fn accounting_balances() {
        let tokens = FlowTokens::new(3);
        for _ in 0..3 {
            tokens.try_acquire().unwrap().submit();
        }
        drop(tokens.try_acquire());
        for _ in 0..3 {
            tokens.complete();
        }
        assert_eq!(tokens.acquired(), tokens.released());
        assert_eq!(tokens.available(), tokens.max());
    }
}
