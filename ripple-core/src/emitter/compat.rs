//! Compatible-emitter adapter.
//!
//! Producers come in two shapes. Listener-style emitters (like
//! [`EventBus`]) support appending, prepending and one-shot registration;
//! target-style emitters only know `add_event_listener` /
//! `remove_event_listener` with string event types. [`EmitterLike`] is the
//! capability query an object answers to say which shape(s) it supports, and
//! [`CompatEmitter`] resolves the shape once and then speaks the right
//! convention.
//!
//! A `CompatEmitter` holds its producer weakly. When the producer is dropped,
//! new registrations report `false` and removals become no-ops.

use std::fmt;
use std::sync::{Arc, Weak};

use super::bus::{EventArgs, EventBus};
use super::key::EventKey;
use super::listener::Listener;
use crate::error::{ReactiveError, Result};

/// Listener-style subscription surface.
pub trait ListenerEmitter<A>: Send + Sync {
    /// Append a listener.
    fn add_listener(&self, event: &EventKey, listener: Listener<A>);

    /// Insert a listener ahead of the existing ones.
    fn prepend_listener(&self, event: &EventKey, listener: Listener<A>);

    /// Append a listener that runs at most once.
    fn once(&self, event: &EventKey, listener: Listener<A>);

    /// Insert a one-shot listener ahead of the existing ones.
    fn prepend_once_listener(&self, event: &EventKey, listener: Listener<A>);

    /// Remove a listener by identity.
    fn remove_listener(&self, event: &EventKey, listener: &Listener<A>);
}

/// Options accepted by [`TargetEmitter::add_event_listener`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetListenOptions {
    /// Remove the listener after its first invocation.
    pub once: bool,
}

/// Target-style subscription surface, keyed by string event types.
pub trait TargetEmitter<A>: Send + Sync {
    /// Add a listener for `event_type`.
    fn add_event_listener(&self, event_type: &str, listener: Listener<A>, options: TargetListenOptions);

    /// Remove a listener for `event_type` by identity.
    fn remove_event_listener(&self, event_type: &str, listener: &Listener<A>);
}

/// Capability query implemented by anything a signal or bridging primitive
/// can subscribe to.
pub trait EmitterLike<A>: Send + Sync {
    /// The listener-style surface, if supported.
    fn as_listener_style(&self) -> Option<&dyn ListenerEmitter<A>> {
        None
    }

    /// The target-style surface, if supported.
    fn as_target_style(&self) -> Option<&dyn TargetEmitter<A>> {
        None
    }
}

/// Calling convention resolved for an emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterShape {
    /// `on` / `once` / `prepend_listener` / `remove_listener`.
    ListenerStyle,
    /// `add_event_listener` / `remove_event_listener`.
    TargetStyle,
}

/// How a listener should be attached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListenMode {
    /// Append.
    #[default]
    Every,
    /// Append, one-shot.
    Once,
    /// Prepend.
    Prepend,
    /// Prepend, one-shot.
    PrependOnce,
}

/// A weakly held emitter together with its resolved calling convention.
pub struct CompatEmitter<A> {
    target: Weak<dyn EmitterLike<A>>,
    shape: EmitterShape,
}

impl<A: 'static> CompatEmitter<A> {
    /// Resolve the calling convention of a type-erased emitter.
    ///
    /// Listener-style wins when both are available.
    pub fn resolve(emitter: &Arc<dyn EmitterLike<A>>) -> Result<Self> {
        let shape = if emitter.as_listener_style().is_some() {
            EmitterShape::ListenerStyle
        } else if emitter.as_target_style().is_some() {
            EmitterShape::TargetStyle
        } else {
            return Err(ReactiveError::IncompatibleEmitter);
        };

        Ok(Self {
            target: Arc::downgrade(emitter),
            shape,
        })
    }

    /// Resolve the calling convention of a concrete emitter.
    pub fn new<E>(emitter: &Arc<E>) -> Result<Self>
    where
        E: EmitterLike<A> + 'static,
    {
        let erased: Arc<dyn EmitterLike<A>> = emitter.clone();
        Self::resolve(&erased)
    }

    /// The resolved calling convention.
    pub fn shape(&self) -> EmitterShape {
        self.shape
    }

    /// Whether the producer is still alive.
    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Attach `listener` to `event`.
    ///
    /// Returns `Ok(false)` when the producer has already been dropped.
    /// Prepending on a target-style emitter is a configuration error.
    pub fn listen(&self, event: &EventKey, listener: Listener<A>, mode: ListenMode) -> Result<bool> {
        let Some(target) = self.target.upgrade() else {
            tracing::trace!(%event, "emitter dropped, listen ignored");
            return Ok(false);
        };

        match self.shape {
            EmitterShape::ListenerStyle => {
                let emitter = target
                    .as_listener_style()
                    .ok_or(ReactiveError::IncompatibleEmitter)?;
                match mode {
                    ListenMode::Every => emitter.add_listener(event, listener),
                    ListenMode::Once => emitter.once(event, listener),
                    ListenMode::Prepend => emitter.prepend_listener(event, listener),
                    ListenMode::PrependOnce => emitter.prepend_once_listener(event, listener),
                }
            }
            EmitterShape::TargetStyle => {
                let emitter = target
                    .as_target_style()
                    .ok_or(ReactiveError::IncompatibleEmitter)?;
                let once = match mode {
                    ListenMode::Every => false,
                    ListenMode::Once => true,
                    ListenMode::Prepend | ListenMode::PrependOnce => {
                        return Err(ReactiveError::Config(
                            "target-style emitters cannot prepend listeners".into(),
                        ));
                    }
                };
                emitter.add_event_listener(
                    &event.to_type_string(),
                    listener,
                    TargetListenOptions { once },
                );
            }
        }

        Ok(true)
    }

    /// Detach `listener` from `event`. A dropped producer is not an error.
    pub fn unlisten(&self, event: &EventKey, listener: &Listener<A>) {
        let Some(target) = self.target.upgrade() else {
            return;
        };

        match self.shape {
            EmitterShape::ListenerStyle => {
                if let Some(emitter) = target.as_listener_style() {
                    emitter.remove_listener(event, listener);
                }
            }
            EmitterShape::TargetStyle => {
                if let Some(emitter) = target.as_target_style() {
                    emitter.remove_event_listener(&event.to_type_string(), listener);
                }
            }
        }
    }
}

impl<A> Clone for CompatEmitter<A> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            shape: self.shape,
        }
    }
}

impl<A> fmt::Debug for CompatEmitter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatEmitter")
            .field("shape", &self.shape)
            .field("alive", &(self.target.strong_count() > 0))
            .finish()
    }
}

impl<A: EventArgs> ListenerEmitter<A> for EventBus<A> {
    fn add_listener(&self, event: &EventKey, listener: Listener<A>) {
        EventBus::add_listener(self, event, listener);
    }

    fn prepend_listener(&self, event: &EventKey, listener: Listener<A>) {
        EventBus::prepend_listener(self, event, listener);
    }

    fn once(&self, event: &EventKey, listener: Listener<A>) {
        EventBus::once(self, event, listener);
    }

    fn prepend_once_listener(&self, event: &EventKey, listener: Listener<A>) {
        EventBus::prepend_once_listener(self, event, listener);
    }

    fn remove_listener(&self, event: &EventKey, listener: &Listener<A>) {
        EventBus::remove_listener(self, event, listener);
    }
}

impl<A: EventArgs> EmitterLike<A> for EventBus<A> {
    fn as_listener_style(&self) -> Option<&dyn ListenerEmitter<A>> {
        Some(self)
    }
}
