//! Event Bus
//!
//! [`EventBus`] is a synchronous listener registry. `emit` invokes every
//! listener registered for the event, in registration order with prepended
//! listeners first, before it returns.
//!
//! # Fan-out
//!
//! Each emission iterates a snapshot of the listener list taken when the
//! emission starts. Listeners may add or remove listeners (including
//! themselves) while it runs; such changes take effect for the next
//! emission. One-shot listeners are unregistered before they are invoked, so
//! a reentrant `emit` from inside one never calls it twice.
//!
//! # Storage
//!
//! Listeners are kept per event key in first-registration order
//! (`IndexMap`), each key holding an inline single listener or a list
//! (`SmallVec<[_; 1]>`); the single-listener case is by far the most common
//! and never allocates a list.
//!
//! # Locking
//!
//! The registry lock is never held while user code runs.

use std::any::Any;
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use super::config::BusConfig;
use super::key::EventKey;
use super::listener::{Listener, Outcome};
use crate::error::{DynError, ReactiveError, Result};

/// Bound satisfied by every event payload type.
pub trait EventArgs: Clone + Debug + Send + Sync + 'static {}

impl<T> EventArgs for T where T: Clone + Debug + Send + Sync + 'static {}

/// Notifications about the bus's own registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusLifecycle {
    /// A listener is about to be added for the event.
    NewListener(EventKey),
    /// A listener was removed from the event.
    RemoveListener(EventKey),
    /// A duplicate registration was ignored (dedup mode).
    DuplicateListener(EventKey),
}

type LifecycleFn = dyn Fn(&BusLifecycle) + Send + Sync;
type RejectionFn = dyn Fn(&EventKey, ReactiveError) + Send + Sync;

struct Entry<A> {
    listener: Listener<A>,
    /// Present for one-shot registrations; doubles as the registration's
    /// identity.
    fired: Option<Arc<AtomicBool>>,
}

impl<A> Clone for Entry<A> {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            fired: self.fired.clone(),
        }
    }
}

type Slot<A> = SmallVec<[Entry<A>; 1]>;

struct Registry<A> {
    events: IndexMap<EventKey, Slot<A>>,
    /// Keys that already triggered the max-listeners warning.
    warned: HashSet<EventKey>,
}

/// A synchronous, ordered event bus.
///
/// The bus is used behind shared references (`Arc<EventBus<A>>` or a
/// `static`); every method takes `&self`.
pub struct EventBus<A> {
    config: BusConfig,
    max_listeners: AtomicUsize,
    registry: Mutex<Registry<A>>,
    lifecycle: Mutex<Vec<Arc<LifecycleFn>>>,
    rejection_hook: Mutex<Option<Arc<RejectionFn>>>,
}

impl<A: EventArgs> EventBus<A> {
    /// Create a bus with the default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with the given configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            max_listeners: AtomicUsize::new(config.max_listeners),
            config,
            registry: Mutex::new(Registry {
                events: IndexMap::new(),
                warned: HashSet::new(),
            }),
            lifecycle: Mutex::new(Vec::new()),
            rejection_hook: Mutex::new(None),
        }
    }

    /// The configuration the bus was created with.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register a listener for `event`.
    pub fn on(&self, event: impl Into<EventKey>, listener: Listener<A>) -> &Self {
        self.register(event.into(), listener, false, false)
    }

    /// Alias of [`on`](Self::on).
    pub fn add_listener(&self, event: impl Into<EventKey>, listener: Listener<A>) -> &Self {
        self.register(event.into(), listener, false, false)
    }

    /// Register a listener that runs before every listener already
    /// registered for `event`.
    pub fn prepend_listener(&self, event: impl Into<EventKey>, listener: Listener<A>) -> &Self {
        self.register(event.into(), listener, true, false)
    }

    /// Register a listener that runs at most once.
    pub fn once(&self, event: impl Into<EventKey>, listener: Listener<A>) -> &Self {
        self.register(event.into(), listener, false, true)
    }

    /// Register a one-shot listener ahead of the existing ones.
    pub fn prepend_once_listener(&self, event: impl Into<EventKey>, listener: Listener<A>) -> &Self {
        self.register(event.into(), listener, true, true)
    }

    /// Remove the most recently added registration of `listener` for
    /// `event`. Unknown listeners are ignored.
    pub fn remove_listener(&self, event: impl Into<EventKey>, listener: &Listener<A>) -> &Self {
        let event = event.into();
        let removed = {
            let mut registry = self.registry.lock();
            let removed = match registry.events.get_mut(&event) {
                Some(slot) => match slot.iter().rposition(|e| e.listener.same(listener)) {
                    Some(pos) => {
                        slot.remove(pos);
                        true
                    }
                    None => false,
                },
                None => false,
            };
            if removed {
                Self::prune(&mut registry, &event);
            }
            removed
        };

        if removed {
            self.notify_lifecycle(&BusLifecycle::RemoveListener(event));
        }
        self
    }

    /// Alias of [`remove_listener`](Self::remove_listener).
    pub fn off(&self, event: impl Into<EventKey>, listener: &Listener<A>) -> &Self {
        self.remove_listener(event, listener)
    }

    /// Remove every listener for `event`, or for every event when `None`.
    pub fn remove_all_listeners(&self, event: Option<&EventKey>) -> &Self {
        let removed: Vec<(EventKey, usize)> = {
            let mut registry = self.registry.lock();
            match event {
                Some(event) => {
                    let removed = registry
                        .events
                        .shift_remove(event)
                        .map(|slot| vec![(event.clone(), slot.len())])
                        .unwrap_or_default();
                    registry.warned.remove(event);
                    removed
                }
                None => {
                    registry.warned.clear();
                    registry
                        .events
                        .drain(..)
                        .map(|(key, slot)| (key, slot.len()))
                        .collect()
                }
            }
        };

        for (key, count) in removed {
            for _ in 0..count {
                self.notify_lifecycle(&BusLifecycle::RemoveListener(key.clone()));
            }
        }
        self
    }

    /// Synchronously invoke every listener registered for `event`.
    ///
    /// Returns whether any listener was registered. Emitting the error
    /// channel with no listener attached fails with
    /// [`ReactiveError::UnhandledError`] or
    /// [`ReactiveError::UnhandledPayload`].
    pub fn emit(&self, event: impl Into<EventKey>, args: &A) -> Result<bool> {
        let event = event.into();
        let snapshot: Slot<A> = self
            .registry
            .lock()
            .events
            .get(&event)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            if event.is_error() {
                return Err(unhandled(args));
            }
            return Ok(false);
        }

        tracing::trace!(%event, listeners = snapshot.len(), "emit");

        for entry in snapshot {
            if let Some(fired) = &entry.fired {
                if fired.swap(true, Ordering::SeqCst) {
                    continue;
                }
                self.remove_once_entry(&event, fired);
            }

            if let Outcome::Pending(fut) = entry.listener.invoke(args) {
                self.drive(event.clone(), fut);
            }
        }

        Ok(true)
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: impl Into<EventKey>) -> usize {
        self.registry
            .lock()
            .events
            .get(&event.into())
            .map_or(0, |slot| slot.len())
    }

    /// Events that currently have listeners, in first-registration order.
    pub fn event_names(&self) -> Vec<EventKey> {
        self.registry.lock().events.keys().cloned().collect()
    }

    /// Snapshot of the listeners registered for `event`.
    pub fn listeners(&self, event: impl Into<EventKey>) -> Vec<Listener<A>> {
        self.registry
            .lock()
            .events
            .get(&event.into())
            .map(|slot| slot.iter().map(|e| e.listener.clone()).collect())
            .unwrap_or_default()
    }

    /// Change the leak-warning threshold. `0` disables it.
    pub fn set_max_listeners(&self, max: usize) -> &Self {
        self.max_listeners.store(max, Ordering::Relaxed);
        self
    }

    /// Current leak-warning threshold.
    pub fn max_listeners(&self) -> usize {
        self.max_listeners.load(Ordering::Relaxed)
    }

    /// Observe listener additions, removals and ignored duplicates.
    pub fn on_lifecycle<F>(&self, observer: F) -> &Self
    where
        F: Fn(&BusLifecycle) + Send + Sync + 'static,
    {
        self.lifecycle.lock().push(Arc::new(observer));
        self
    }

    /// Install the hook receiving failures of asynchronous listeners when
    /// `capture_rejections` is enabled.
    pub fn on_rejection<F>(&self, hook: F) -> &Self
    where
        F: Fn(&EventKey, ReactiveError) + Send + Sync + 'static,
    {
        *self.rejection_hook.lock() = Some(Arc::new(hook));
        self
    }

    fn register(&self, event: EventKey, listener: Listener<A>, prepend: bool, once: bool) -> &Self {
        let dedup = self.config.dedup_listeners;
        if dedup && self.contains(&event, &listener) {
            self.report_duplicate(event);
            return self;
        }

        self.notify_lifecycle(&BusLifecycle::NewListener(event.clone()));

        let entry = Entry {
            listener,
            fired: once.then(|| Arc::new(AtomicBool::new(false))),
        };

        let max = self.max_listeners();
        let inserted = {
            let mut registry = self.registry.lock();
            // Checked again under the same lock as the insert: a concurrent
            // registration may have won since the check above.
            let count = {
                let slot = registry.events.entry(event.clone()).or_default();
                if dedup && slot.iter().any(|e| e.listener.same(&entry.listener)) {
                    None
                } else {
                    if prepend {
                        slot.insert(0, entry);
                    } else {
                        slot.push(entry);
                    }
                    Some(slot.len())
                }
            };

            if let Some(count) = count {
                if max > 0 && count > max && registry.warned.insert(event.clone()) {
                    tracing::warn!(
                        %event,
                        count,
                        max,
                        "possible listener leak: more listeners than max_listeners"
                    );
                }
            }
            count.is_some()
        };

        if !inserted {
            self.report_duplicate(event);
        }
        self
    }

    fn report_duplicate(&self, event: EventKey) {
        tracing::trace!(%event, "duplicate listener ignored");
        if self.config.emit_duplicate_diagnostics {
            self.notify_lifecycle(&BusLifecycle::DuplicateListener(event));
        }
    }

    fn contains(&self, event: &EventKey, listener: &Listener<A>) -> bool {
        self.registry
            .lock()
            .events
            .get(event)
            .is_some_and(|slot| slot.iter().any(|e| e.listener.same(listener)))
    }

    fn remove_once_entry(&self, event: &EventKey, fired: &Arc<AtomicBool>) {
        let removed = {
            let mut registry = self.registry.lock();
            let removed = registry.events.get_mut(event).is_some_and(|slot| {
                let before = slot.len();
                slot.retain(|e| !e.fired.as_ref().is_some_and(|f| Arc::ptr_eq(f, fired)));
                slot.len() != before
            });
            if removed {
                Self::prune(&mut registry, event);
            }
            removed
        };

        if removed {
            self.notify_lifecycle(&BusLifecycle::RemoveListener(event.clone()));
        }
    }

    fn prune(registry: &mut Registry<A>, event: &EventKey) {
        if registry.events.get(event).is_some_and(|slot| slot.is_empty()) {
            registry.events.shift_remove(event);
            registry.warned.remove(event);
        }
    }

    fn notify_lifecycle(&self, change: &BusLifecycle) {
        let observers = self.lifecycle.lock().clone();
        for observer in observers {
            observer(change);
        }
    }

    /// Drive an asynchronous listener's future and route its failure.
    fn drive(&self, event: EventKey, fut: BoxFuture<'static, Result<()>>) {
        let hook = if self.config.capture_rejections {
            self.rejection_hook.lock().clone()
        } else {
            None
        };
        let capture = self.config.capture_rejections;

        let report = move |err: ReactiveError| {
            let err = ReactiveError::Listener {
                event: event.clone(),
                source: Box::new(err),
            };
            match &hook {
                Some(hook) => hook(&event, err),
                None if capture => {
                    tracing::warn!(%event, error = %err, "captured rejection with no hook installed")
                }
                None => tracing::error!(%event, error = %err, "unhandled listener rejection"),
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = fut.await {
                        report(err);
                    }
                });
            }
            Err(_) => match fut.now_or_never() {
                Some(Ok(())) => {}
                Some(Err(err)) => report(err),
                None => tracing::warn!("async listener is still pending and no runtime can drive it; dropped"),
            },
        }
    }
}

/// Error reported when the error channel has no listener.
fn unhandled<A: EventArgs>(args: &A) -> ReactiveError {
    let any = args as &dyn Any;
    if let Some(err) = any.downcast_ref::<ReactiveError>() {
        ReactiveError::UnhandledError(Arc::new(err.clone()))
    } else if let Some(err) = any.downcast_ref::<DynError>() {
        ReactiveError::UnhandledError(Arc::clone(err))
    } else {
        ReactiveError::UnhandledPayload(format!("{args:?}"))
    }
}

impl<A: EventArgs> Default for EventBus<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Debug for EventBus<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("EventBus")
            .field("config", &self.config)
            .field("events", &registry.events.len())
            .field(
                "listeners",
                &registry.events.values().map(|slot| slot.len()).sum::<usize>(),
            )
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
