//! External-store integration.
//!
//! Rendering layers that poll a store ask two things of it: "tell me when
//! something changed" and "give me a cheap comparable snapshot". An
//! [`ExternalStore`] answers both for one signal. The snapshot is the
//! signal's [snapshot version](Signal::snapshot_version); each new
//! subscription bumps the render component of that version, so a renderer
//! that re-subscribes always sees a fresh snapshot.

use std::fmt;

use super::signal::{Signal, SignalData, SignalValue, Subscription};

/// Subscribe/snapshot view of a signal.
pub struct ExternalStore<T, S = T, D = ()> {
    signal: Signal<T, S, D>,
}

impl<T, S, D> ExternalStore<T, S, D>
where
    T: SignalValue,
    S: SignalValue,
    D: SignalData,
{
    pub(crate) fn new(signal: Signal<T, S, D>) -> Self {
        Self { signal }
    }

    /// Call `on_change` after every change of the signal's value.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let render_version = self.signal.bump_render_version();
        tracing::trace!(signal = %self.signal.id(), render_version, "external store subscribed");
        self.signal.subscribe(move |_| on_change())
    }

    /// The current snapshot version.
    pub fn snapshot(&self) -> String {
        self.signal.snapshot_version()
    }

    /// The value to render: the current value, or the last one on error.
    pub fn value(&self) -> T {
        self.signal.get_safe()
    }

    /// The underlying signal.
    pub fn signal(&self) -> &Signal<T, S, D> {
        &self.signal
    }
}

impl<T, S, D> Clone for ExternalStore<T, S, D> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T: fmt::Debug, S, D> fmt::Debug for ExternalStore<T, S, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalStore")
            .field("signal", &self.signal)
            .finish()
    }
}
