//! Reactive Primitives
//!
//! This module implements the signal side of Ripple: memoized, lazily
//! recomputed value cells wired together through two process-wide internal
//! event buses.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A [`Signal`] holds a value and, optionally, a source value and a
//! derivation. Plain cells ([`Signal::new`]) take whatever is `set`. Derived
//! cells ([`Signal::derived`]) compute their value, possibly asynchronously,
//! from their source, their data and any signals they read.
//!
//! ## Dependency tracking
//!
//! When a signal is read inside another signal's derivation, the reactive
//! context records the read. The reader then listens for the upstream's
//! invalidation broadcast. There are no explicit dependency lists to keep
//! in sync, although [`SignalOptions::depends_on`] can add one.
//!
//! ## Sources
//!
//! [`SourceOptions`] feeds a signal from any [`EmitterLike`] producer. The
//! producer is held weakly.
//!
//! ## External stores
//!
//! [`ExternalStore`] exposes subscribe/snapshot for render loops.
//!
//! # Implementation Notes
//!
//! Invalidation is push, recomputation is pull: a change marks dependents
//! dirty right away, and they recompute when read. Cells with value
//! listeners are the exception and recompute as soon as they are dirtied.
//!
//! [`EmitterLike`]: crate::emitter::EmitterLike

mod context;
mod id;
mod options;
mod runtime;
mod signal;
mod source;
mod store;

pub use context::ReactiveContext;
pub use id::{SignalId, SignalKey};
pub use options::{ComputeContext, Computation, Derivation, Finale, SignalOptions};
pub use runtime::{ChangeNotice, Reactive, Runtime};
pub use signal::{
    Changes, NextChange, Signal, SignalData, SignalStatus, SignalValue, Subscription, ValueListener,
};
pub use source::{Detach, SourceAttachment, SourceOptions, SourceSink};
pub use store::ExternalStore;
