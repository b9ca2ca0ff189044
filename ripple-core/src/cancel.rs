//! Cancellation Tokens
//!
//! A [`CancelToken`] is a one-way latch: once cancelled it stays cancelled,
//! and every callback registered through [`CancelToken::on_cancel`] runs
//! exactly once. Tokens compose: [`CancelToken::child`] follows a single
//! parent, [`CancelToken::any`] follows several at once, which is how an
//! operation accepts "any of these controllers" as its abort signal.
//!
//! The bus bridging primitives and signals use registrations to tear
//! themselves down deterministically when a token fires.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;

type Callback = Box<dyn FnOnce() + Send>;

struct TokenInner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    notify: Notify,
    /// Registrations this token holds on its parents.
    parents: Mutex<Vec<CancelRegistration>>,
}

impl TokenInner {
    fn fire(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        tracing::debug!(callbacks = callbacks.len(), "cancel token fired");

        for (_, callback) in callbacks {
            callback();
        }

        self.parents.lock().clear();
        self.notify.notify_waiters();
    }
}

/// A cloneable cancellation latch.
///
/// Clones share the same state; cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
                notify: Notify::new(),
                parents: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel the token. Calling this more than once has no further effect.
    pub fn cancel(&self) {
        self.inner.fire();
    }

    /// Whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Register a callback to run when the token is cancelled.
    ///
    /// If the token is already cancelled the callback runs immediately and
    /// the returned registration is inert. Dropping the registration before
    /// the token fires unregisters the callback.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return CancelRegistration {
                    token: Arc::downgrade(&self.inner),
                    id,
                };
            }
        }

        callback();
        CancelRegistration {
            token: Weak::new(),
            id,
        }
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Create a token that is cancelled whenever this one is.
    ///
    /// Cancelling the child does not affect the parent.
    pub fn child(&self) -> CancelToken {
        Self::any(std::slice::from_ref(self))
    }

    /// Create a token that is cancelled as soon as any of `tokens` is.
    ///
    /// An empty slice yields a token that only fires when cancelled
    /// directly.
    pub fn any(tokens: &[CancelToken]) -> CancelToken {
        let combined = CancelToken::new();

        for parent in tokens {
            let weak = Arc::downgrade(&combined.inner);
            let registration = parent.on_cancel(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire();
                }
            });

            if combined.is_cancelled() {
                break;
            }
            combined.inner.parents.lock().push(registration);
        }

        combined
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("callbacks", &self.inner.callbacks.lock().len())
            .finish()
    }
}

/// Handle to a callback registered with [`CancelToken::on_cancel`].
///
/// Dropping the handle unregisters the callback if it has not run yet.
#[must_use = "dropping a registration unregisters its callback"]
pub struct CancelRegistration {
    token: Weak<TokenInner>,
    id: u64,
}

impl CancelRegistration {
    /// Keep the callback registered for the lifetime of the token.
    pub fn detach(mut self) {
        self.token = Weak::new();
    }
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.callbacks.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl fmt::Debug for CancelRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelRegistration")
            .field("id", &self.id)
            .field("live", &(self.token.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callbacks_run_once() {
        let token = CancelToken::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        let _reg = token.on_cancel(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_registration_runs_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let hit = Arc::new(AtomicBool::new(false));
        let hit_clone = hit.clone();
        let _reg = token.on_cancel(move || hit_clone.store(true, Ordering::SeqCst));

        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_registration_does_not_run() {
        let token = CancelToken::new();
        let hit = Arc::new(AtomicBool::new(false));
        let hit_clone = hit.clone();

        let reg = token.on_cancel(move || hit_clone.store(true, Ordering::SeqCst));
        drop(reg);
        token.cancel();

        assert!(!hit.load(Ordering::SeqCst));
    }

    #[test]
    fn child_follows_parent_only() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[test]
    fn any_fires_on_first_parent() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        let combined = CancelToken::any(&[a.clone(), b.clone()]);

        assert!(!combined.is_cancelled());
        b.cancel();
        assert!(combined.is_cancelled());
        assert!(!a.is_cancelled());
    }

    #[test]
    fn any_of_already_cancelled_is_cancelled() {
        let a = CancelToken::new();
        a.cancel();
        let combined = CancelToken::any(&[a, CancelToken::new()]);
        assert!(combined.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_completes() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };

        tokio::task::yield_now().await;
        token.cancel();
        waiter.await.unwrap();
    }
}
