//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals. It owns two
//! process-wide internal event buses and the registry of live signals.
//!
//! # How It Works
//!
//! 1. When a signal is created, it registers with the runtime and receives
//!    a private channel key.
//!
//! 2. When a derivation reads a signal, the reader's invalidation listener
//!    is attached to the upstream's channel on the invalidation bus.
//!
//! 3. When a signal's inputs change, it broadcasts on its own channel of the
//!    invalidation bus. Dependents mark themselves dirty and re-broadcast;
//!    dependents nobody listens to stay lazy and recompute on next read.
//!
//! 4. When a signal's value changes, it broadcasts a [`ChangeNotice`] on its
//!    channel of the change bus, where its value listeners live.
//!
//! 5. Eager recomputations (cells with value listeners) requested during an
//!    invalidation fan-out are queued and run only once the outermost
//!    propagation step on the thread has dirtied every dependent.
//!
//! # Thread Safety
//!
//! The reactive context is thread-local; the buses and the registry are
//! global, so signals can be shared across threads. No lock is held while
//! user code runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;

use super::context::ReactiveContext;
use super::id::SignalId;
use crate::emitter::{BusConfig, EventBus, EventKey, ListenMode, Listener};

/// A trait for types the runtime can tear down.
pub trait Reactive: Send + Sync {
    /// Get the ID of this reactive value.
    fn signal_id(&self) -> SignalId;

    /// Optional human-readable label used in logs.
    fn label(&self) -> Option<&str> {
        None
    }

    /// Destroy the reactive value. Must be idempotent.
    fn destroy(&self);
}

/// Payload broadcast on the change bus whenever a signal's value changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    /// The signal whose value changed.
    pub signal: SignalId,
    /// The signal's version after the change.
    pub version: u64,
}

/// The global reactive runtime.
///
/// This is a singleton that manages all signals in the process.
pub struct Runtime;

// Registry of live signals. Weak so the registry never keeps a signal alive.
static REGISTRY: OnceLock<DashMap<SignalId, Weak<dyn Reactive>>> = OnceLock::new();
static INVALIDATION_BUS: OnceLock<EventBus<SignalId>> = OnceLock::new();
static CHANGE_BUS: OnceLock<EventBus<ChangeNotice>> = OnceLock::new();

fn get_registry() -> &'static DashMap<SignalId, Weak<dyn Reactive>> {
    REGISTRY.get_or_init(DashMap::new)
}

fn invalidation_bus() -> &'static EventBus<SignalId> {
    INVALIDATION_BUS.get_or_init(|| EventBus::with_config(BusConfig::internal()))
}

fn change_bus() -> &'static EventBus<ChangeNotice> {
    CHANGE_BUS.get_or_init(|| EventBus::with_config(BusConfig::internal()))
}

type Job = Box<dyn FnOnce()>;

/// Nesting depth of propagation steps on this thread and the recomputations
/// they deferred.
#[derive(Default)]
struct Propagation {
    depth: usize,
    queue: VecDeque<Job>,
}

thread_local! {
    static PROPAGATION: RefCell<Propagation> = RefCell::new(Propagation::default());
}

struct PropagationGuard;

impl Drop for PropagationGuard {
    fn drop(&mut self) {
        PROPAGATION.with(|propagation| {
            let mut propagation = propagation.borrow_mut();
            propagation.depth -= 1;
            if propagation.depth == 0 && std::thread::panicking() {
                propagation.queue.clear();
            }
        });
    }
}

impl Runtime {
    /// Register a reactive value with the runtime.
    pub(crate) fn register(id: SignalId, reactive: Weak<dyn Reactive>) {
        get_registry().insert(id, reactive);
    }

    /// Unregister a reactive value.
    pub(crate) fn unregister(id: SignalId) {
        get_registry().remove(&id);
    }

    /// Whether a signal with this ID is registered and alive.
    pub fn is_registered(id: SignalId) -> bool {
        get_registry()
            .get(&id)
            .map(|entry| entry.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Number of live registered signals.
    pub fn live_count() -> usize {
        get_registry()
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Destroy every live signal.
    ///
    /// Finales are applied as with individual destruction. Returns how many
    /// signals were destroyed.
    pub fn destroy_all() -> usize {
        // Collect first: destroying unregisters, which needs the shard locks.
        let live: Vec<Arc<dyn Reactive>> = get_registry()
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        get_registry().retain(|_, weak| weak.strong_count() > 0);

        let count = live.len();
        for reactive in live {
            tracing::trace!(signal = %reactive.signal_id(), label = ?reactive.label(), "destroying");
            reactive.destroy();
        }
        tracing::debug!(count, "destroyed all signals");
        count
    }

    /// Attach a dependent's invalidation listener to an upstream channel.
    pub(crate) fn add_dependency(upstream: &EventKey, listener: Listener<SignalId>) {
        invalidation_bus().add_listener(upstream, listener);
    }

    /// Detach a dependent's invalidation listener from an upstream channel.
    pub(crate) fn remove_dependency(upstream: &EventKey, listener: &Listener<SignalId>) {
        invalidation_bus().remove_listener(upstream, listener);
    }

    /// Number of dependents attached to a channel.
    pub fn dependent_count(channel: &EventKey) -> usize {
        invalidation_bus().listener_count(channel)
    }

    /// Tell every dependent of `channel` that `origin` changed.
    pub(crate) fn broadcast_invalidation(channel: &EventKey, origin: SignalId) {
        if let Err(err) = invalidation_bus().emit(channel, &origin) {
            tracing::error!(signal = %origin, %err, "invalidation broadcast failed");
        }
    }

    /// Attach a value listener wrapper to a channel of the change bus.
    pub(crate) fn listen_changes(channel: &EventKey, listener: Listener<ChangeNotice>, mode: ListenMode) {
        let bus = change_bus();
        match mode {
            ListenMode::Every => bus.add_listener(channel, listener),
            ListenMode::Once => bus.once(channel, listener),
            ListenMode::Prepend => bus.prepend_listener(channel, listener),
            ListenMode::PrependOnce => bus.prepend_once_listener(channel, listener),
        };
    }

    /// Detach a value listener wrapper from a channel of the change bus.
    pub(crate) fn unlisten_changes(channel: &EventKey, listener: &Listener<ChangeNotice>) {
        change_bus().remove_listener(channel, listener);
    }

    /// Whether anything listens for value changes on `channel`.
    pub(crate) fn has_change_listeners(channel: &EventKey) -> bool {
        change_bus().listener_count(channel) > 0
    }

    /// Fan a value change out to the channel's value listeners.
    pub(crate) fn broadcast_change(channel: &EventKey, notice: ChangeNotice) {
        if let Err(err) = change_bus().emit(channel, &notice) {
            tracing::error!(signal = %notice.signal, %err, "change broadcast failed");
        }
    }

    /// Drop every listener registered on `channel`, on both buses.
    pub(crate) fn release(channel: &EventKey) {
        invalidation_bus().remove_all_listeners(Some(channel));
        change_bus().remove_all_listeners(Some(channel));
    }

    /// Run `f` as one propagation step.
    ///
    /// Jobs passed to [`schedule`](Self::schedule) while a step is running
    /// on this thread wait until the outermost step's `f` has returned, then
    /// run in scheduling order, including jobs scheduled by earlier jobs.
    pub(crate) fn propagate<R>(f: impl FnOnce() -> R) -> R {
        let outermost = PROPAGATION.with(|propagation| {
            let mut propagation = propagation.borrow_mut();
            propagation.depth += 1;
            propagation.depth == 1
        });
        let _guard = PropagationGuard;

        let result = f();
        if outermost {
            while let Some(job) = PROPAGATION.with(|propagation| propagation.borrow_mut().queue.pop_front()) {
                job();
            }
        }
        result
    }

    /// Defer `job` to the end of the current propagation, or run it now
    /// when none is running.
    pub(crate) fn schedule(job: Job) {
        let immediate = PROPAGATION.with(|propagation| {
            let mut propagation = propagation.borrow_mut();
            if propagation.depth > 0 {
                propagation.queue.push_back(job);
                None
            } else {
                Some(job)
            }
        });
        if let Some(job) = immediate {
            job();
        }
    }

    /// The signal currently computing on this thread, if any.
    pub fn current_computation() -> Option<SignalId> {
        ReactiveContext::current()
    }

    /// Check if we're inside a reactive context.
    pub fn is_tracking() -> bool {
        ReactiveContext::is_active()
    }
}
