// syncrep-core/src/tokens.rs

//! Round tokens and the dispenser that gates replica admission.
//!
//! Tokens sit in a lock-free FIFO. A fair semaphore counts them so that a
//! replica waiting in [`TokenDispenser::dequeue`] suspends only itself and is
//! woken in arrival order once a finalize pushes fresh tokens.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;
use tokio::sync::Semaphore;

use crate::error::{Result, RuntimeError};

/// Admission ticket carrying the round it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundToken {
    round: u64,
}

impl RoundToken {
    pub fn round(&self) -> u64 {
        self.round
    }
}

/// FIFO of round tokens.
#[derive(Debug)]
pub struct TokenDispenser {
    queue: SegQueue<RoundToken>,
    /// One permit per queued token.
    available: Semaphore,
    seeded: AtomicBool,
}

impl Default for TokenDispenser {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenDispenser {
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            available: Semaphore::new(0),
            seeded: AtomicBool::new(false),
        }
    }

    /// Pushes the initial `count` tokens for `round`. Allowed once.
    ///
    /// # Errors
    ///
    /// Returns a `Bootstrap` error if the dispenser was already seeded.
    pub fn seed(&self, count: u32, round: u64) -> Result<()> {
        if self
            .seeded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RuntimeError::bootstrap("token dispenser already seeded"));
        }
        self.push(count, round);
        tracing::info!(count, round, "seeded token dispenser");
        Ok(())
    }

    /// Pushes `count` fresh tokens for `round` after a finalize.
    pub fn replenish(&self, count: u32, round: u64) {
        self.push(count, round);
        tracing::debug!(count, round, depth = self.depth(), "replenished tokens");
    }

    fn push(&self, count: u32, round: u64) {
        for _ in 0..count {
            self.queue.push(RoundToken { round });
        }
        // Permits only after the tokens are visible, so a woken waiter
        // always finds one.
        self.available.add_permits(count as usize);
    }

    /// Waits for a token and removes it from the queue.
    ///
    /// # Errors
    ///
    /// Returns a `Transport` error once the dispenser is closed.
    pub async fn dequeue(&self) -> Result<RoundToken> {
        let permit = self
            .available
            .acquire()
            .await
            .map_err(|e| RuntimeError::transport_with_source("token dispenser closed", e))?;
        permit.forget();
        self.pop()
    }

    /// Takes a token if one is queued, without waiting.
    pub fn try_dequeue(&self) -> Option<RoundToken> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.pop().ok()
    }

    fn pop(&self) -> Result<RoundToken> {
        self.queue
            .pop()
            .ok_or_else(|| RuntimeError::transport("token permit granted with an empty queue"))
    }

    /// Number of tokens currently queued.
    pub fn depth(&self) -> usize {
        self.queue.len()
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::Acquire)
    }

    /// Wakes every waiter with an error; later dequeues fail immediately.
    pub fn close(&self) {
        self.available.close();
    }

    pub fn is_closed(&self) -> bool {
        self.available.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_seed_once() {
        let dispenser = TokenDispenser::new();
        dispenser.seed(2, 0).unwrap();
        assert!(dispenser.is_seeded());
        assert_eq!(dispenser.depth(), 2);

        let err = dispenser.seed(2, 0).unwrap_err();
        assert!(matches!(err, RuntimeError::Bootstrap { .. }));
        assert_eq!(dispenser.depth(), 2);
    }

    #[test]
    fn test_fifo_order() {
        let dispenser = TokenDispenser::new();
        dispenser.seed(1, 0).unwrap();
        dispenser.replenish(2, 1);

        assert_eq!(dispenser.try_dequeue().unwrap().round(), 0);
        assert_eq!(dispenser.try_dequeue().unwrap().round(), 1);
        assert_eq!(dispenser.try_dequeue().unwrap().round(), 1);
        assert!(dispenser.try_dequeue().is_none());
        assert_eq!(dispenser.depth(), 0);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_replenish() {
        let dispenser = Arc::new(TokenDispenser::new());
        dispenser.seed(1, 0).unwrap();
        assert_eq!(dispenser.dequeue().await.unwrap().round(), 0);

        let waiter = {
            let dispenser = dispenser.clone();
            tokio::spawn(async move { dispenser.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        dispenser.replenish(1, 1);
        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token.round(), 1);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let dispenser = Arc::new(TokenDispenser::new());
        dispenser.seed(0, 0).unwrap();

        let waiter = {
            let dispenser = dispenser.clone();
            tokio::spawn(async move { dispenser.dequeue().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        dispenser.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RuntimeError::Transport { .. }));
        assert!(dispenser.is_closed());
    }
}
