//! Listener handles.
//!
//! A [`Listener`] wraps a callback behind an `Arc`. The `Arc` pointer is the
//! listener's identity: registering a clone of the same listener twice is a
//! duplicate, and [`EventBus::remove_listener`](super::EventBus::remove_listener)
//! removes by identity.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::Result;

type SyncFn<A> = dyn Fn(&A) + Send + Sync;
type AsyncFn<A> = dyn Fn(&A) -> BoxFuture<'static, Result<()>> + Send + Sync;

enum Body<A> {
    Sync(Box<SyncFn<A>>),
    Async(Box<AsyncFn<A>>),
}

/// What a listener produced when invoked.
pub(crate) enum Outcome {
    Done,
    Pending(BoxFuture<'static, Result<()>>),
}

/// A registered event callback.
pub struct Listener<A> {
    body: Arc<Body<A>>,
}

impl<A> Listener<A> {
    /// Create a synchronous listener.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        Self {
            body: Arc::new(Body::Sync(Box::new(f))),
        }
    }

    /// Create an asynchronous listener.
    ///
    /// The returned future is driven by the emitting bus; its failure is
    /// routed according to the bus's `capture_rejections` setting.
    pub fn asynchronous<F, Fut>(f: F) -> Self
    where
        F: Fn(&A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            body: Arc::new(Body::Async(Box::new(move |args| f(args).boxed()))),
        }
    }

    /// Whether two handles refer to the same listener.
    pub fn same(&self, other: &Listener<A>) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Whether this listener returns a future.
    pub fn is_async(&self) -> bool {
        matches!(*self.body, Body::Async(_))
    }

    /// Run the listener, for emitters that dispatch on their own.
    ///
    /// A synchronous listener runs to completion and yields `None`; an
    /// asynchronous one yields its future for the caller to drive.
    pub fn call(&self, args: &A) -> Option<BoxFuture<'static, Result<()>>> {
        match self.invoke(args) {
            Outcome::Done => None,
            Outcome::Pending(fut) => Some(fut),
        }
    }

    pub(crate) fn invoke(&self, args: &A) -> Outcome {
        match &*self.body {
            Body::Sync(f) => {
                f(args);
                Outcome::Done
            }
            Body::Async(f) => Outcome::Pending(f(args)),
        }
    }
}

impl<A> Clone for Listener<A> {
    fn clone(&self) -> Self {
        Self {
            body: Arc::clone(&self.body),
        }
    }
}

impl<A> fmt::Debug for Listener<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("ptr", &Arc::as_ptr(&self.body))
            .field("async", &self.is_async())
            .finish()
    }
}
