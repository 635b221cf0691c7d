// Copyright 2020 Joyent, Inc.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::Error;

/// A cloneable cancellation signal with an optional deadline.
///
/// Every blocking operation in the pool takes a `CancelToken`: directory
/// queries and role probes bound their timeouts by its deadline, refresh
/// cycles are discarded when it is cancelled, and `RetryHelper` waits
/// between attempts with `CancelToken::sleep`, which wakes as soon as the
/// token is cancelled.
///
/// Child tokens inherit cancellation from their parent (and never extend its
/// deadline), while cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: Mutex<bool>,
    condvar: Condvar,
    deadline: Option<Instant>,
    children: Mutex<Vec<Weak<TokenInner>>>,
}

impl TokenInner {
    fn new(deadline: Option<Instant>) -> Self {
        TokenInner {
            cancelled: Mutex::new(false),
            condvar: Condvar::new(),
            deadline,
            children: Mutex::new(Vec::new()),
        }
    }

    fn cancelled_lock(&self) -> MutexGuard<bool> {
        self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        {
            let mut cancelled = self.cancelled_lock();
            if *cancelled {
                return;
            }
            *cancelled = true;
            self.condvar.notify_all();
        }
        let children: Vec<Arc<TokenInner>> = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        children.iter().for_each(|c| c.cancel());
    }
}

impl CancelToken {
    /// A token that is never cancelled unless `cancel` is called and has no
    /// deadline.
    pub fn new() -> Self {
        CancelToken {
            inner: Arc::new(TokenInner::new(None)),
        }
    }

    /// A root token whose deadline is `timeout` from now. A timeout too
    /// large to represent leaves the token without a deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        CancelToken {
            inner: Arc::new(TokenInner::new(
                Instant::now().checked_add(timeout),
            )),
        }
    }

    /// A child token with the same deadline as this one.
    pub fn child(&self) -> Self {
        self.child_with_deadline(self.inner.deadline)
    }

    /// A child token whose deadline is `timeout` from now, or this token's
    /// deadline if that comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now().checked_add(timeout);
        let deadline = match (self.inner.deadline, own) {
            (Some(parent), Some(own)) if own < parent => Some(own),
            (Some(parent), _) => Some(parent),
            (None, own) => own,
        };
        self.child_with_deadline(deadline)
    }

    fn child_with_deadline(&self, deadline: Option<Instant>) -> Self {
        let child = Arc::new(TokenInner::new(deadline));
        {
            let mut children = self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child));
        }
        // A cancel that raced with the registration above has either seen
        // the child or already set the flag checked here.
        if self.is_cancelled() {
            child.cancel();
        }
        CancelToken { inner: child }
    }

    /// Cancel this token and every token derived from it, waking any
    /// `sleep` in progress.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// True once `cancel` was called on this token or an ancestor. Passing
    /// the deadline does not count as cancellation.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled_lock()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left until the deadline; `None` if the token has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Bound `timeout` by the time remaining until the deadline.
    pub fn bound(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) if remaining < timeout => remaining,
            _ => timeout,
        }
    }

    /// `Ok` while the token is live, otherwise the reason it is not.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.inner.deadline {
            Some(d) if Instant::now() >= d => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Sleep for `duration`, returning early with an error if the token is
    /// cancelled or its deadline passes first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Error> {
        // None: the wake-up time is past what `Instant` can represent
        let wake_at = Instant::now().checked_add(duration);
        let mut cancelled = self.inner.cancelled_lock();
        loop {
            if *cancelled {
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            let until = match (self.inner.deadline, wake_at) {
                (Some(d), Some(w)) if w < d => Some(w),
                (Some(d), _) => {
                    if now >= d {
                        return Err(Error::DeadlineExceeded);
                    }
                    Some(d)
                }
                (None, w) => w,
            };
            if let Some(w) = wake_at {
                if now >= w {
                    return Ok(());
                }
            }
            cancelled = match until {
                Some(until) => {
                    self.inner
                        .condvar
                        .wait_timeout(cancelled, until - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .inner
                    .condvar
                    .wait(cancelled)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}
