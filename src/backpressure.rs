//! Credit-based backpressure primitives.
//!
//! [`Credit`] tracks how many items a producer may still emit toward a
//! consumer. Credit arrives from REQUEST_STREAM's initial request-n and
//! from subsequent REQUEST_N frames; a grant of `i32::MAX` or more
//! saturates to unbounded, after which acquisition never waits again.
//!
//! [`CancelFlag`] is a one-shot latch used to tear down a producer from
//! another task (inbound CANCEL, termination sweep).
//!
//! Both are lock-free atomics with `Notify` wakeups and share state across
//! clones of their `Arc`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::Notify;

/// Sentinel for unbounded credit.
const UNBOUNDED: i64 = i64::MAX;

/// Grants at or above this saturate to unbounded.
const SATURATION_POINT: u32 = i32::MAX as u32;

/// Async credit counter for one outbound stream.
#[derive(Debug)]
pub struct Credit {
    available: AtomicI64,
    notify: Notify,
}

impl Credit {
    /// Create a counter holding `initial` credit. `i32::MAX` and above mean
    /// unbounded.
    pub fn new(initial: u32) -> Self {
        let available = if initial >= SATURATION_POINT {
            UNBOUNDED
        } else {
            initial as i64
        };
        Self {
            available: AtomicI64::new(available),
            notify: Notify::new(),
        }
    }

    /// Create an unbounded counter (fixed-cardinality interactions).
    pub fn unbounded() -> Self {
        Self::new(SATURATION_POINT)
    }

    /// Grant `n` additional credits, saturating to unbounded.
    pub fn add(&self, n: u32) {
        if n == 0 {
            return;
        }
        if n >= SATURATION_POINT {
            self.available.store(UNBOUNDED, Ordering::Release);
        } else {
            let mut current = self.available.load(Ordering::Acquire);
            loop {
                if current == UNBOUNDED {
                    break;
                }
                let next = current.saturating_add(n as i64).min(UNBOUNDED);
                match self.available.compare_exchange(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Currently available credit. Unbounded reports `i64::MAX`.
    #[inline]
    pub fn available(&self) -> i64 {
        self.available.load(Ordering::Acquire)
    }

    /// True once the counter has saturated.
    #[inline]
    pub fn is_unbounded(&self) -> bool {
        self.available.load(Ordering::Acquire) == UNBOUNDED
    }

    /// Take one credit, waiting until some is available. Unbounded counters
    /// return immediately without decrementing.
    pub async fn acquire(&self) {
        loop {
            let current = self.available.load(Ordering::Acquire);
            if current == UNBOUNDED {
                return;
            }
            if current > 0 {
                if self
                    .available
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }

            // Register before re-checking so a concurrent add() is not missed.
            let notified = self.notify.notified();
            if self.available.load(Ordering::Acquire) > 0 {
                continue;
            }
            notified.await;
        }
    }
}

/// One-shot cancellation latch.
#[derive(Debug, Default)]
pub struct CancelFlag {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake all waiters. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// True once [`cancel`](Self::cancel) has run.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolve once the flag is set.
    pub async fn cancelled(&self) {
        while !self.is_cancelled() {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_initial_credit() {
        let credit = Credit::new(5);
        assert_eq!(credit.available(), 5);
        assert!(!credit.is_unbounded());
    }

    #[test]
    fn test_initial_saturation() {
        assert!(Credit::new(u32::MAX).is_unbounded());
        assert!(Credit::new(i32::MAX as u32).is_unbounded());
        assert!(!Credit::new(i32::MAX as u32 - 1).is_unbounded());
        assert!(Credit::unbounded().is_unbounded());
    }

    #[test]
    fn test_add_saturates() {
        let credit = Credit::new(1);
        credit.add(i32::MAX as u32);
        assert!(credit.is_unbounded());

        let credit = Credit::new(1);
        credit.add(3);
        assert_eq!(credit.available(), 4);
    }

    #[test]
    fn test_add_zero_is_noop() {
        let credit = Credit::new(2);
        credit.add(0);
        assert_eq!(credit.available(), 2);
    }

    #[tokio::test]
    async fn test_acquire_decrements() {
        let credit = Credit::new(2);
        credit.acquire().await;
        credit.acquire().await;
        assert_eq!(credit.available(), 0);
    }

    #[tokio::test]
    async fn test_acquire_unbounded_never_decrements() {
        let credit = Credit::unbounded();
        for _ in 0..100 {
            credit.acquire().await;
        }
        assert!(credit.is_unbounded());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_grant() {
        let credit = Arc::new(Credit::new(0));

        let waiter = {
            let credit = credit.clone();
            tokio::spawn(async move {
                credit.acquire().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        credit.add(1);
        waiter.await.unwrap();
        assert_eq!(credit.available(), 0);
    }

    #[tokio::test]
    async fn test_cancel_flag_wakes_waiter() {
        let flag = Arc::new(CancelFlag::new());
        assert!(!flag.is_cancelled());

        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move {
                flag.cancelled().await;
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        flag.cancel();
        waiter.await.unwrap();
        assert!(flag.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let flag = CancelFlag::new();
        flag.cancel();
        flag.cancel();
        flag.cancelled().await;
    }
}
