//! Ripple Core
//!
//! This crate provides the core of the Ripple reactive runtime. It implements:
//!
//! - An event bus with ordered, synchronous fan-out
//! - Signal cells: memoized, lazily recomputed values with automatic
//!   dependency tracking and asynchronous derivations
//! - Bridging between emitters and futures/streams
//! - Cancellation tokens
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `emitter`: the event bus, the compatible-emitter adapter, `once` and `on`
//! - `reactive`: signals, dependency tracking and the process-wide runtime
//! - `cancel`: cancellation tokens shared by both sides
//! - `error`: the crate-wide error type
//!
//! Signals talk to each other only through two internal buses owned by the
//! runtime, one for invalidation and one for value changes. A signal can
//! also be fed by any external emitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use ripple_core::reactive::Signal;
//!
//! // Create a signal
//! let count = Signal::new(0);
//!
//! // Create a derived value
//! let doubled = count.map(|v| v * 2);
//!
//! // Listen for changes
//! doubled.subscribe(|v| println!("Doubled: {v}"));
//!
//! // Update the signal
//! count.set(5);
//! // Listener runs, prints: "Doubled: 10"
//! ```

pub mod cancel;
pub mod emitter;
pub mod error;
pub mod reactive;

pub use cancel::{CancelRegistration, CancelToken};
pub use emitter::{once, on, EventBus, EventKey, Listener};
pub use error::{ReactiveError, Result};
pub use reactive::{Computation, Runtime, Signal, SignalOptions, SignalStatus, SourceOptions};
