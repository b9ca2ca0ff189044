//! Event Emitters
//!
//! This module implements the event side of Ripple: the [`EventBus`]
//! listener registry, the adapter that lets signals and bridging helpers
//! subscribe to foreign emitters, and the two bridging helpers themselves.
//!
//! # Emitter shapes
//!
//! Anything implementing [`EmitterLike`] can be subscribed to. It answers
//! which surfaces it supports:
//!
//! - listener-style ([`ListenerEmitter`]): append, prepend, one-shot, remove
//! - target-style ([`TargetEmitter`]): add/remove with string event types
//!
//! [`CompatEmitter`] resolves the shape once and holds the emitter weakly.
//!
//! # Bridging
//!
//! - [`once`] waits for the next of several events, with optional filter,
//!   timeout and cancellation.
//! - [`on`] iterates over every emission of one event as a `Stream`.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ripple_core::emitter::{once, EventBus, Listener, OnceOptions};
//!
//! let bus = Arc::new(EventBus::<String>::new());
//! bus.on("greet", Listener::new(|name| println!("hello {name}")));
//!
//! let next = once(&bus, ["greet"], OnceOptions::default())?;
//! bus.emit("greet", &"world".to_string())?;
//! assert_eq!(next.await?.args, "world");
//! ```

mod bus;
mod compat;
mod config;
mod key;
mod listener;
mod once;
mod stream;

pub use bus::{BusLifecycle, EventArgs, EventBus};
pub use compat::{
    CompatEmitter, EmitterLike, EmitterShape, ListenMode, ListenerEmitter, TargetEmitter,
    TargetListenOptions,
};
pub use config::{BusConfig, DEFAULT_MAX_LISTENERS};
pub use key::{EventKey, Symbol};
pub use listener::Listener;
pub use once::{once, EventFilter, EventMatch, OnceEvent, OnceOptions};
pub use stream::{on, ComputeValue, EventStream, ItemScope, OnOptions};
