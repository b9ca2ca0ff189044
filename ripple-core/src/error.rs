//! Error Types
//!
//! Every fallible operation in the crate returns [`ReactiveError`]. The enum
//! is `Clone` because one derivation failure can be delivered to several
//! waiters (every caller joined on the same in-flight computation receives
//! the same error), so dynamic errors are held behind `Arc`.
//!
//! # Taxonomy
//!
//! | Kind | Variants | Raised by |
//! |------|----------|-----------|
//! | Configuration | [`Config`](ReactiveError::Config), [`IncompatibleEmitter`](ReactiveError::IncompatibleEmitter) | the call that introduced it |
//! | Derivation | [`Computation`](ReactiveError::Computation) | `Signal::get` of the owning signal |
//! | Reentrancy | [`Cycle`](ReactiveError::Cycle), [`SelfDependency`](ReactiveError::SelfDependency) | the read that closed the cycle |
//! | Cancellation | [`Cancelled`](ReactiveError::Cancelled) | bridging and iteration primitives |
//! | Timeout | [`Timeout`](ReactiveError::Timeout) | the bridging primitive |
//! | Destroyed | [`Destroyed`](ReactiveError::Destroyed) | pending `Signal::to_future` waiters |
//! | Bus | [`UnhandledError`](ReactiveError::UnhandledError), [`UnhandledPayload`](ReactiveError::UnhandledPayload), [`ErrorEvent`](ReactiveError::ErrorEvent), [`Listener`](ReactiveError::Listener) | `EventBus::emit` and friends |

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use crate::emitter::EventKey;
use crate::reactive::SignalId;

/// Shared, thread-safe dynamic error.
pub type DynError = Arc<dyn StdError + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

/// Errors produced by the event bus, the signal cells and the bridging
/// primitives.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// An option combination or call is not supported.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The object exposes neither a listener-style nor a target-style
    /// subscription surface.
    #[error("emitter supports neither listener-style nor target-style subscription")]
    IncompatibleEmitter,

    /// A derivation function failed.
    #[error("computation failed: {0}")]
    Computation(DynError),

    /// A signal was read while its own derivation was already running.
    #[error("cycle detected: signal {0} is already computing")]
    Cycle(SignalId),

    /// A signal read itself from inside its own derivation.
    #[error("signal {0} depends on itself")]
    SelfDependency(SignalId),

    /// The operation was aborted through a cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// No matching event arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The owning signal was destroyed before the operation completed.
    #[error("signal {0} was destroyed")]
    Destroyed(SignalId),

    /// An error event was emitted with no listener attached; the payload was
    /// itself an error.
    #[error("unhandled error event: {0}")]
    UnhandledError(DynError),

    /// An error event was emitted with no listener attached; the payload was
    /// not an error and is carried in its debug form.
    #[error("unhandled error event (payload: {0})")]
    UnhandledPayload(String),

    /// The designated error event fired while waiting for another event.
    #[error("error event `{event}` emitted: {detail}")]
    ErrorEvent {
        /// Key of the error channel.
        event: EventKey,
        /// Debug rendering of the emitted arguments.
        detail: String,
    },

    /// An asynchronous listener failed.
    #[error("listener for `{event}` failed: {source}")]
    Listener {
        /// Event the listener was registered for.
        event: EventKey,
        /// Underlying failure.
        source: Box<ReactiveError>,
    },
}

/// Plain-text error used by [`ReactiveError::message`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

impl ReactiveError {
    /// Wrap an arbitrary error as a derivation failure.
    pub fn computation<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Computation(Arc::new(err))
    }

    /// Build a derivation failure from a message.
    pub fn message(text: impl Into<String>) -> Self {
        Self::Computation(Arc::new(Message(text.into())))
    }

    /// Whether this error is an expected cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this error is a bridging timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Whether this error reports a dependency cycle or self-dependency.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Self::Cycle(_) | Self::SelfDependency(_))
    }

    /// Whether this error reports a destroyed signal.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, Self::Destroyed(_))
    }
}
