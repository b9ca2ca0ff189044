//! Signal construction options.
//!
//! A signal is configured with an optional derivation, an optional external
//! source, an optional finale applied on destruction, an optional
//! cancellation token and a list of explicit dependencies.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use super::id::SignalKey;
use super::signal::{Signal, SignalData, SignalValue};
use super::source::SourceAttachment;
use crate::cancel::CancelToken;
use crate::error::Result;

/// What a derivation sees while it runs.
pub struct ComputeContext<'a, T, S, D> {
    /// The signal's value before this computation.
    pub prev: &'a T,
    /// The latest source value, if one was ever set.
    pub source: Option<&'a S>,
    /// The signal's attached data.
    pub data: &'a D,
    pub(crate) signal: &'a Signal<T, S, D>,
}

impl<'a, T, S, D> ComputeContext<'a, T, S, D> {
    /// The signal being computed.
    pub fn signal(&self) -> &'a Signal<T, S, D> {
        self.signal
    }
}

/// Result of running a derivation.
pub enum Computation<T> {
    /// A new value, committed when it differs from the current one.
    Ready(T),
    /// Keep the current value.
    Unchanged,
    /// A deferred value. `Ok(None)` keeps the current value when settled.
    Pending(BoxFuture<'static, Result<Option<T>>>),
}

impl<T> Computation<T> {
    /// Wrap a future that may or may not produce a new value.
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    /// Wrap a future that always produces a value.
    pub fn resolve_with<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        Self::Pending(future.map(|result| result.map(Some)).boxed())
    }
}

impl<T> fmt::Debug for Computation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Ready(..)"),
            Self::Unchanged => f.write_str("Unchanged"),
            Self::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}

type DeriveFn<T, S, D> = dyn Fn(&ComputeContext<'_, T, S, D>) -> Result<Computation<T>> + Send + Sync;

/// A signal's derivation function.
pub struct Derivation<T, S, D> {
    f: Arc<DeriveFn<T, S, D>>,
}

impl<T, S, D> Derivation<T, S, D> {
    /// Wrap a derivation function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ComputeContext<'_, T, S, D>) -> Result<Computation<T>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub(crate) fn call(&self, cx: &ComputeContext<'_, T, S, D>) -> Result<Computation<T>> {
        (self.f)(cx)
    }
}

impl<T: SignalValue, D: SignalData> Derivation<T, T, D> {
    /// The derivation of a plain cell: its value is its latest source.
    pub fn passthrough() -> Self {
        Self::new(|cx| {
            Ok(match cx.source {
                Some(source) => Computation::Ready(source.clone()),
                None => Computation::Unchanged,
            })
        })
    }
}

impl<T, S, D> Clone for Derivation<T, S, D> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

/// Final transition applied when a signal is destroyed.
#[derive(Debug, Clone, PartialEq)]
pub enum Finale<T, S> {
    /// Commit this value directly.
    Value(T),
    /// Set this source and run one last synchronous derivation.
    Source(S),
}

/// Everything a signal can be configured with.
pub struct SignalOptions<T, S, D> {
    /// Derivation producing the value from the source.
    pub compute: Option<Derivation<T, S, D>>,
    /// External producer feeding the source.
    pub source: Option<SourceAttachment<S>>,
    /// Final transition applied on destruction.
    pub finale: Option<Finale<T, S>>,
    /// Token whose cancellation destroys the signal.
    pub cancel: Option<CancelToken>,
    /// Signals to depend on without reading them.
    pub dependencies: Vec<SignalKey>,
    /// Label used in logs.
    pub label: Option<String>,
}

impl<T, S, D> SignalOptions<T, S, D> {
    /// Set the derivation.
    pub fn compute<F>(mut self, f: F) -> Self
    where
        F: Fn(&ComputeContext<'_, T, S, D>) -> Result<Computation<T>> + Send + Sync + 'static,
    {
        self.compute = Some(Derivation::new(f));
        self
    }

    /// Attach an external source.
    pub fn source(mut self, source: impl Into<SourceAttachment<S>>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Commit `value` when the signal is destroyed.
    pub fn finale_value(mut self, value: T) -> Self {
        self.finale = Some(Finale::Value(value));
        self
    }

    /// Derive one last value from `source` when the signal is destroyed.
    pub fn finale_source(mut self, source: S) -> Self {
        self.finale = Some(Finale::Source(source));
        self
    }

    /// Destroy the signal when `token` is cancelled.
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Depend on `signal` without reading it.
    pub fn depends_on<U, V, E>(mut self, signal: &Signal<U, V, E>) -> Self
    where
        U: SignalValue,
        V: SignalValue,
        E: SignalData,
    {
        self.dependencies.push(signal.key().clone());
        self
    }

    /// Set the log label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl<T, S, D> Default for SignalOptions<T, S, D> {
    fn default() -> Self {
        Self {
            compute: None,
            source: None,
            finale: None,
            cancel: None,
            dependencies: Vec::new(),
            label: None,
        }
    }
}

impl<T, S, D> fmt::Debug for SignalOptions<T, S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalOptions")
            .field("compute", &self.compute.is_some())
            .field("source", &self.source.is_some())
            .field("finale", &self.finale.is_some())
            .field("cancel", &self.cancel.is_some())
            .field("dependencies", &self.dependencies.len())
            .field("label", &self.label)
            .finish()
    }
}
