//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: a memoized, lazily
//! recomputed value cell. It holds a value, an optional source value pushed
//! by [`set`](Signal::set) or by an external producer, and an optional
//! derivation turning the source (and any signals it reads) into the value.
//!
//! # How Signals Work
//!
//! 1. When a derivation reads a signal, the reactive context records the
//!    read. After the pass, the computing signal attaches its invalidation
//!    listener to every upstream it read.
//!
//! 2. When a signal's source changes, it becomes dirty and broadcasts an
//!    invalidation. Dependents become dirty in turn. Nothing recomputes yet.
//!
//! 3. Reading a dirty signal recomputes it. Signals with value listeners
//!    recompute right away instead, so their listeners see every change.
//!
//! 4. A derivation may return a future. The signal enters
//!    [`SignalStatus::Pending`] at once and every read until settlement joins
//!    the same in-flight computation.
//!
//! # Thread Safety
//!
//! Signals are `Send + Sync`; the state sits behind a `parking_lot::Mutex`
//! that is never held while a derivation or listener runs. Cycle detection
//! is per thread: a read of a signal computing on another thread returns
//! the last value.
//!
//! # Example
//!
//! ```rust,ignore
//! let count = Signal::new(1);
//! let doubled = count.map(|v| v * 2);
//!
//! count.set(5);
//! assert_eq!(doubled.get()?, 10);
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use futures_util::future::{BoxFuture, Shared};
use futures_util::{FutureExt, Stream};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use super::context::ReactiveContext;
use super::id::{SignalId, SignalKey};
use super::options::{ComputeContext, Computation, Derivation, Finale, SignalOptions};
use super::runtime::{ChangeNotice, Reactive, Runtime};
use super::source::{Detach, SourceAttachment, SourceSink};
use super::store::ExternalStore;
use crate::cancel::CancelRegistration;
use crate::emitter::{EventKey, ListenMode, Listener};
use crate::error::{ReactiveError, Result};

/// Bounds for values and source values held by a signal.
pub trait SignalValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> SignalValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Bounds for the data payload attached to a signal.
pub trait SignalData: Send + Sync + 'static {}

impl<T> SignalData for T where T: Send + Sync + 'static {}

/// Progress of the asynchronous derivation protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalStatus {
    /// An asynchronous derivation is in flight.
    Pending,
    /// The last derivation failed.
    Error,
    /// The last asynchronous derivation settled, or a failed cell recovered.
    Settled,
}

impl SignalStatus {
    /// Lowercase name, as used in snapshot versions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Settled => "settled",
        }
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A callback receiving a signal's value after each change.
///
/// Identity is by handle: clones are the same listener.
pub struct ValueListener<T> {
    f: Arc<dyn Fn(&T) + Send + Sync>,
}

impl<T> ValueListener<T> {
    /// Wrap a callback.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Whether two handles refer to the same listener.
    pub fn same(&self, other: &ValueListener<T>) -> bool {
        Arc::ptr_eq(&self.f, &other.f)
    }

    fn call(&self, value: &T) {
        (self.f)(value)
    }
}

impl<T> Clone for ValueListener<T> {
    fn clone(&self) -> Self {
        Self { f: self.f.clone() }
    }
}

impl<T> fmt::Debug for ValueListener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueListener")
            .field("ptr", &Arc::as_ptr(&self.f).cast::<()>())
            .finish()
    }
}

/// Handle to one value-listener registration.
///
/// Dropping the handle keeps the listener attached; call
/// [`unsubscribe`](Self::unsubscribe) to detach it.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new<F>(release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            release: Some(Box::new(release)),
        }
    }

    fn inert() -> Self {
        Self { release: None }
    }

    /// Whether this handle still owns a registration.
    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    /// Detach the listener.
    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

type SharedComputation<T> = Shared<BoxFuture<'static, Result<T>>>;

struct ListenerEntry<T> {
    token: u64,
    listener: ValueListener<T>,
    wrapper: Listener<ChangeNotice>,
}

struct State<T, S> {
    value: T,
    source: Option<S>,
    version: u64,
    status: Option<SignalStatus>,
    last_error: Option<ReactiveError>,
    needs_recompute: bool,
    computing: Option<ThreadId>,
    compute_count: u64,
    render_version: u64,
    destroying: bool,
    destroyed: bool,
    pending: Option<SharedComputation<T>>,
    /// Generation of the latest async pass; settlements of older passes are
    /// dropped.
    pass: u64,
    /// A derivation read the pre-update value while this cell was dirty.
    served_stale: bool,
    /// Upstream channels the invalidation listener is attached to.
    dependency_set: IndexMap<SignalId, EventKey>,
    listeners: Vec<ListenerEntry<T>>,
    waiters: Vec<oneshot::Sender<Result<T>>>,
    finale: Option<Finale<T, S>>,
    source_detach: Option<Detach>,
    cancel_registration: Option<CancelRegistration>,
}

struct Change<T> {
    value: T,
    version: u64,
    waiters: Vec<oneshot::Sender<Result<T>>>,
}

/// Everything a torn-down signal lets go of.
struct Released<T> {
    dependencies: IndexMap<SignalId, EventKey>,
    listeners: Vec<ListenerEntry<T>>,
    waiters: Vec<oneshot::Sender<Result<T>>>,
    source_detach: Option<Detach>,
    cancel_registration: Option<CancelRegistration>,
}

impl<T, S> State<T, S> {
    fn new(value: T, needs_recompute: bool, finale: Option<Finale<T, S>>) -> Self {
        Self {
            value,
            source: None,
            version: 0,
            status: None,
            last_error: None,
            needs_recompute,
            computing: None,
            compute_count: 0,
            render_version: 0,
            destroying: false,
            destroyed: false,
            pending: None,
            pass: 0,
            served_stale: false,
            dependency_set: IndexMap::new(),
            listeners: Vec::new(),
            waiters: Vec::new(),
            finale,
            source_detach: None,
            cancel_registration: None,
        }
    }

    fn abandon_pending(&mut self) {
        self.pending = None;
        self.pass += 1;
    }

    fn release(&mut self) -> Released<T> {
        self.destroyed = true;
        self.destroying = false;
        self.abandon_pending();
        Released {
            dependencies: std::mem::take(&mut self.dependency_set),
            listeners: std::mem::take(&mut self.listeners),
            waiters: std::mem::take(&mut self.waiters),
            source_detach: self.source_detach.take(),
            cancel_registration: self.cancel_registration.take(),
        }
    }
}

impl<T: Clone + PartialEq, S> State<T, S> {
    /// Commit `next` if it differs from the current value.
    fn write(&mut self, next: T) -> Option<Change<T>> {
        if self.destroyed || self.value == next {
            return None;
        }
        self.value = next;
        self.version += 1;
        Some(Change {
            value: self.value.clone(),
            version: self.version,
            waiters: std::mem::take(&mut self.waiters),
        })
    }
}

/// Clears the computing mark when a derivation pass ends, also by panic.
struct ComputingGuard<'a, T, S> {
    state: &'a Mutex<State<T, S>>,
}

impl<T, S> Drop for ComputingGuard<'_, T, S> {
    fn drop(&mut self) {
        self.state.lock().computing = None;
    }
}

struct SignalInner<T, S, D> {
    key: SignalKey,
    label: Option<String>,
    data: D,
    compute: Option<Derivation<T, S, D>>,
    /// Plain cells apply every `set` immediately.
    eager: bool,
    invalidation: Listener<SignalId>,
    next_token: AtomicU64,
    state: Mutex<State<T, S>>,
    weak: Weak<SignalInner<T, S, D>>,
}

/// A reactive cell holding a value of type `T`.
///
/// # Type Parameters
///
/// - `T`: the value.
/// - `S`: the source value written by [`set`](Self::set) and external
///   producers. Plain cells use `S = T`.
/// - `D`: data attached at construction and visible to the derivation.
///
/// Clones share the same cell.
pub struct Signal<T, S = T, D = ()> {
    inner: Arc<SignalInner<T, S, D>>,
}

impl<T: SignalValue> Signal<T> {
    /// Create a plain value cell.
    pub fn new(initial: T) -> Self {
        Self::with_data(initial, ())
    }

    /// Create a cell whose value is derived by `f`.
    ///
    /// The derivation first runs on the first read.
    pub fn derived<F>(initial: T, f: F) -> Self
    where
        F: Fn(&ComputeContext<'_, T, T, ()>) -> Result<Computation<T>> + Send + Sync + 'static,
    {
        Self::assemble(initial, (), SignalOptions::default().compute(f), false).0
    }
}

impl<T: SignalValue, D: SignalData> Signal<T, T, D> {
    /// Create a plain value cell carrying `data`.
    pub fn with_data(initial: T, data: D) -> Self {
        let options = SignalOptions {
            compute: Some(Derivation::passthrough()),
            ..SignalOptions::default()
        };
        Self::assemble(initial, data, options, true).0
    }

    /// Create a cell whose value is its source unless `options` supply a
    /// derivation.
    pub fn plain(initial: T, data: D, mut options: SignalOptions<T, T, D>) -> Result<Self> {
        let eager = options.compute.is_none();
        if eager {
            options.compute = Some(Derivation::passthrough());
        }
        let (signal, source) = Self::assemble(initial, data, options, eager);
        signal.attach(source)
    }
}

impl<T, S, D> Signal<T, S, D>
where
    T: SignalValue,
    S: SignalValue,
    D: SignalData,
{
    /// Create a cell from explicit options.
    ///
    /// Without a derivation, the value changes only through the finale.
    /// Fails when the source cannot be attached.
    pub fn create(initial: T, data: D, options: SignalOptions<T, S, D>) -> Result<Self> {
        let (signal, source) = Self::assemble(initial, data, options, false);
        signal.attach(source)
    }

    fn assemble(
        initial: T,
        data: D,
        options: SignalOptions<T, S, D>,
        eager: bool,
    ) -> (Self, Option<SourceAttachment<S>>) {
        let SignalOptions {
            compute,
            source,
            finale,
            cancel,
            dependencies,
            label,
        } = options;
        let id = SignalId::new();
        let needs_recompute = compute.is_some() && !eager;
        let inner = Arc::new_cyclic(|weak: &Weak<SignalInner<T, S, D>>| {
            let invalidation = {
                let weak = weak.clone();
                Listener::new(move |_origin: &SignalId| {
                    if let Some(inner) = weak.upgrade() {
                        inner.invalidate();
                    }
                })
            };

            SignalInner {
                key: SignalKey::new(id),
                label,
                data,
                compute,
                eager,
                invalidation,
                next_token: AtomicU64::new(0),
                state: Mutex::new(State::new(initial, needs_recompute, finale)),
                weak: weak.clone(),
            }
        });

        let registered: Weak<dyn Reactive> = Arc::downgrade(&inner) as Weak<dyn Reactive>;
        Runtime::register(id, registered);
        inner.track_all(dependencies);

        if let Some(token) = cancel {
            let weak = Arc::downgrade(&inner);
            let registration = token.on_cancel(move || {
                if let Some(inner) = weak.upgrade() {
                    tracing::debug!(signal = %inner.key.id, "cancel token fired, destroying signal");
                    inner.teardown();
                }
            });
            inner.state.lock().cancel_registration = Some(registration);
        }

        tracing::debug!(
            signal = %id,
            label = ?inner.label,
            derived = inner.compute.is_some() && !eager,
            "signal created"
        );

        (Self { inner }, source)
    }

    fn attach(self, source: Option<SourceAttachment<S>>) -> Result<Self> {
        if let Some(source) = source {
            self.inner.attach_source(source)?;
        }
        Ok(self)
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> SignalId {
        self.inner.key.id
    }

    /// The signal's identity and channel, for [`SignalOptions::depends_on`].
    pub fn key(&self) -> &SignalKey {
        &self.inner.key
    }

    /// The log label, if any.
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// The data attached at construction.
    pub fn data(&self) -> &D {
        &self.inner.data
    }

    /// Get the current value, recomputing first when dirty.
    ///
    /// Inside a derivation this records the read as a dependency. While an
    /// asynchronous derivation is in flight, returns the last value. A
    /// recorded derivation error is returned until the cell is dirtied
    /// again. Destroyed cells return their final value.
    pub fn get(&self) -> Result<T> {
        let id = self.inner.key.id;
        if ReactiveContext::current() == Some(id) {
            tracing::warn!(signal = %id, label = ?self.inner.label, "signal read itself inside its derivation");
            return Err(ReactiveError::SelfDependency(id));
        }

        ReactiveContext::track_dependency(&self.inner.key);
        self.inner.refresh()
    }

    /// [`get`](Self::get), then wait for any in-flight computation.
    pub async fn get_async(&self) -> Result<T> {
        let value = self.get()?;
        let pending = self.inner.state.lock().pending.clone();
        match pending {
            Some(computation) => computation.await,
            None => Ok(value),
        }
    }

    /// [`get`](Self::get), falling back to the last value on error.
    pub fn get_safe(&self) -> T {
        self.get().unwrap_or_else(|err| {
            tracing::trace!(signal = %self.inner.key.id, %err, "get_safe fell back to last value");
            self.get_last()
        })
    }

    /// The stored value, without recomputation or tracking.
    pub fn get_last(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Write a source value and mark the cell dirty.
    ///
    /// Ignored when equal to the current source, when called from the
    /// cell's own derivation, and after destruction.
    pub fn set(&self, source: S) {
        self.inner.receive(source);
    }

    /// Compute the next source value from the current state and `set` it.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T, Option<&S>, &D) -> S,
    {
        let (value, source) = {
            let state = self.inner.state.lock();
            (state.value.clone(), state.source.clone())
        };
        let next = f(&value, source.as_ref(), &self.inner.data);
        self.set(next);
    }

    /// Build a setter closure applying `f` to the current state and an input.
    ///
    /// `f` returning `None` leaves the source untouched.
    pub fn create_method<I, F>(&self, f: F) -> impl Fn(I) + Send + Sync + 'static
    where
        I: 'static,
        F: Fn(&T, I, Option<&S>, &Signal<T, S, D>) -> Option<S> + Send + Sync + 'static,
    {
        let signal = self.clone();
        move |input| {
            let (value, source) = {
                let state = signal.inner.state.lock();
                (state.value.clone(), state.source.clone())
            };
            if let Some(next) = f(&value, input, source.as_ref(), &signal) {
                signal.set(next);
            }
        }
    }

    /// Mark the cell dirty so the next read recomputes.
    ///
    /// This is how a failed derivation is retried.
    pub fn invalidate(&self) {
        self.inner.invalidate();
    }

    /// A read-only cell holding `f` applied to this cell's value.
    pub fn map<U, F>(&self, f: F) -> Signal<U>
    where
        U: SignalValue,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let upstream = self.clone();
        let initial = f(&self.get_last());
        Signal::derived(initial, move |_| {
            upstream.get().map(|value| Computation::Ready(f(&value)))
        })
    }

    /// Call `f` with the value after every change.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listen(ValueListener::new(f), ListenMode::Every)
    }

    /// Append a value listener.
    pub fn on(&self, listener: ValueListener<T>) -> Subscription {
        self.listen(listener, ListenMode::Every)
    }

    /// Alias of [`on`](Self::on).
    pub fn add_listener(&self, listener: ValueListener<T>) -> Subscription {
        self.listen(listener, ListenMode::Every)
    }

    /// Append a value listener that runs on the next change only.
    pub fn once(&self, listener: ValueListener<T>) -> Subscription {
        self.listen(listener, ListenMode::Once)
    }

    /// Insert a value listener ahead of the existing ones.
    pub fn prepend_listener(&self, listener: ValueListener<T>) -> Subscription {
        self.listen(listener, ListenMode::Prepend)
    }

    /// Remove every registration of `listener`.
    pub fn off(&self, listener: &ValueListener<T>) {
        self.inner.remove_listeners(|entry| entry.listener.same(listener));
    }

    /// Number of value listeners attached.
    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    fn listen(&self, listener: ValueListener<T>, mode: ListenMode) -> Subscription {
        let inner = &self.inner;
        let token = inner.next_token.fetch_add(1, Ordering::Relaxed);
        let once = matches!(mode, ListenMode::Once | ListenMode::PrependOnce);

        let wrapper = {
            let weak = Arc::downgrade(inner);
            let listener = listener.clone();
            Listener::new(move |_notice: &ChangeNotice| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let value = {
                    let mut state = inner.state.lock();
                    if once {
                        state.listeners.retain(|entry| entry.token != token);
                    }
                    state.value.clone()
                };
                listener.call(&value);
            })
        };

        {
            let mut state = inner.state.lock();
            if state.destroyed || state.destroying {
                return Subscription::inert();
            }
            state.listeners.push(ListenerEntry {
                token,
                listener,
                wrapper: wrapper.clone(),
            });
        }
        Runtime::listen_changes(&inner.key.channel, wrapper, mode);

        // A dirty cell has no live dependency edges yet; compute once so
        // upstream changes reach the new listener.
        if inner.state.lock().needs_recompute {
            if let Err(err) = inner.refresh() {
                tracing::debug!(signal = %inner.key.id, %err, "initial computation for listener failed");
            }
        }

        let weak = Arc::downgrade(inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove_listeners(|entry| entry.token == token);
            }
        })
    }

    /// A future resolving with the value after the next change.
    ///
    /// Rejects with [`ReactiveError::Destroyed`] if the cell is destroyed
    /// first, or already is.
    pub fn to_future(&self) -> NextChange<T> {
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                let _ = sender.send(Err(ReactiveError::Destroyed(self.inner.key.id)));
            } else {
                state.waiters.push(sender);
            }
        }
        NextChange {
            signal: self.inner.key.id,
            receiver,
        }
    }

    /// A stream of successive values, ending when the cell is destroyed.
    pub fn changes(&self) -> Changes<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.subscribe(move |value: &T| {
            let _ = sender.send(value.clone());
        });
        Changes {
            receiver,
            subscription: Some(subscription),
        }
    }

    /// Comparable string that changes whenever externally visible state
    /// changes: `"{version}"`, then `":{status}:{compute_count}"` when a
    /// status is present, then `"#{render_version}"`.
    pub fn snapshot_version(&self) -> String {
        let state = self.inner.state.lock();
        match state.status {
            Some(status) => format!(
                "{}:{}:{}#{}",
                state.version, status, state.compute_count, state.render_version
            ),
            None => format!("{}#{}", state.version, state.render_version),
        }
    }

    /// External-store view of this cell.
    pub fn external_store(&self) -> ExternalStore<T, S, D> {
        ExternalStore::new(self.clone())
    }

    pub(crate) fn bump_render_version(&self) -> u64 {
        let mut state = self.inner.state.lock();
        state.render_version += 1;
        state.render_version
    }

    /// Tear the cell down.
    ///
    /// Applies the finale, detaches from dependencies and the source,
    /// drops every value listener and rejects pending
    /// [`to_future`](Self::to_future) waiters. Idempotent.
    pub fn destroy(&self) {
        self.inner.teardown();
    }

    /// Number of value changes so far.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    /// Asynchronous progress, if the cell ever entered the protocol or failed.
    pub fn status(&self) -> Option<SignalStatus> {
        self.inner.state.lock().status
    }

    /// The recorded derivation error, if the last pass failed.
    pub fn last_error(&self) -> Option<ReactiveError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Whether [`destroy`](Self::destroy) has run.
    pub fn is_destroyed(&self) -> bool {
        let state = self.inner.state.lock();
        state.destroyed || state.destroying
    }

    /// Whether the next read recomputes.
    pub fn needs_recompute(&self) -> bool {
        self.inner.state.lock().needs_recompute
    }

    /// The last source value.
    pub fn source_value(&self) -> Option<S> {
        self.inner.state.lock().source.clone()
    }

    /// Number of derivation passes run.
    pub fn compute_count(&self) -> u64 {
        self.inner.state.lock().compute_count
    }

    /// Whether two handles refer to the same cell.
    pub fn same(&self, other: &Signal<T, S, D>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T, S, D> SignalInner<T, S, D>
where
    T: SignalValue,
    S: SignalValue,
    D: SignalData,
{
    fn attach_source(self: &Arc<Self>, source: SourceAttachment<S>) -> Result<()> {
        let weak = Arc::downgrade(self);
        let sink: SourceSink<S> = Arc::new(move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(value);
            }
        });
        let detach = source.attach(sink)?;

        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            detach();
        } else {
            state.source_detach = Some(detach);
        }
        Ok(())
    }

    fn refresh(self: &Arc<Self>) -> Result<T> {
        let Some(compute) = &self.compute else {
            return Ok(self.state.lock().value.clone());
        };

        let (prev, source) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Ok(state.value.clone());
            }
            let computing = state.computing;
            match computing {
                Some(owner) if owner == thread::current().id() => {
                    drop(state);
                    tracing::warn!(signal = %self.key.id, label = ?self.label, "cycle detected");
                    return Err(ReactiveError::Cycle(self.key.id));
                }
                Some(_) => {
                    state.served_stale |= ReactiveContext::is_active();
                    return Ok(state.value.clone());
                }
                None => {}
            }
            if !state.needs_recompute {
                return match (state.status, &state.last_error) {
                    (Some(SignalStatus::Error), Some(err)) => Err(err.clone()),
                    _ => Ok(state.value.clone()),
                };
            }
            if state.pending.is_some() {
                state.served_stale |= ReactiveContext::is_active();
                return Ok(state.value.clone());
            }

            state.needs_recompute = false;
            state.computing = Some(thread::current().id());
            state.compute_count += 1;
            (state.value.clone(), state.source.clone())
        };

        // Refreshes scheduled by this pass wait until it has finished.
        Runtime::propagate(|| {
            let outcome = self.derive(compute, &prev, source.as_ref());
            self.apply(outcome)
        })
    }

    fn derive(
        self: &Arc<Self>,
        compute: &Derivation<T, S, D>,
        prev: &T,
        source: Option<&S>,
    ) -> Result<Computation<T>> {
        let _computing = ComputingGuard { state: &self.state };
        let handle = Signal {
            inner: Arc::clone(self),
        };

        let (outcome, dependencies) = {
            let ctx = ReactiveContext::enter(self.key.id);
            let cx = ComputeContext {
                prev,
                source,
                data: &self.data,
                signal: &handle,
            };
            let outcome = compute.call(&cx);
            (outcome, ctx.take_dependencies())
        };

        self.track_all(dependencies);
        outcome
    }

    fn apply(self: &Arc<Self>, outcome: Result<Computation<T>>) -> Result<T> {
        match outcome {
            Err(err) => {
                {
                    let mut state = self.state.lock();
                    state.status = Some(SignalStatus::Error);
                    state.last_error = Some(err.clone());
                }
                tracing::debug!(signal = %self.key.id, %err, "derivation failed");
                Err(err)
            }
            Ok(Computation::Pending(future)) => Ok(self.start_pending(future)),
            Ok(computation) => {
                let (value, change, stale_readers) = {
                    let mut state = self.state.lock();
                    state.last_error = None;
                    if state.status.is_some() {
                        state.status = Some(SignalStatus::Settled);
                    }
                    let change = match computation {
                        Computation::Ready(next) => state.write(next),
                        _ => None,
                    };
                    let stale_readers = change.is_some() && state.served_stale;
                    (state.value.clone(), change, stale_readers)
                };
                if let Some(change) = change {
                    if stale_readers {
                        self.notify_dependents();
                    }
                    self.publish(change);
                }
                Ok(value)
            }
        }
    }

    fn start_pending(self: &Arc<Self>, future: BoxFuture<'static, Result<Option<T>>>) -> T {
        let id = self.key.id;
        let pass = {
            let mut state = self.state.lock();
            state.pass += 1;
            state.pass
        };
        let weak = Arc::downgrade(self);
        let computation: SharedComputation<T> = async move {
            let outcome = future.await;
            match weak.upgrade() {
                Some(inner) => inner.settle(pass, outcome),
                None => Err(ReactiveError::Destroyed(id)),
            }
        }
        .boxed()
        .shared();

        let value = {
            let mut state = self.state.lock();
            state.status = Some(SignalStatus::Pending);
            state.pending = Some(computation.clone());
            state.value.clone()
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::trace!(signal = %id, "async derivation started");
                handle.spawn(computation.map(|_| ()));
            }
            Err(_) => {
                tracing::trace!(signal = %id, "async derivation started outside a runtime, driven by awaiting callers");
            }
        }
        value
    }

    fn settle(self: &Arc<Self>, pass: u64, outcome: Result<Option<T>>) -> Result<T> {
        let id = self.key.id;
        let (result, change, follow_up, rebroadcast, finishing) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(ReactiveError::Destroyed(id));
            }
            if state.pass != pass {
                tracing::trace!(signal = %id, pass, "superseded async derivation dropped");
                return Ok(state.value.clone());
            }
            state.pending = None;
            let (result, change) = match outcome {
                Ok(next) => {
                    state.status = Some(SignalStatus::Settled);
                    state.last_error = None;
                    let change = next.and_then(|value| state.write(value));
                    (Ok(state.value.clone()), change)
                }
                Err(err) => {
                    state.status = Some(SignalStatus::Error);
                    state.last_error = Some(err.clone());
                    (Err(err), None)
                }
            };
            let finishing = state.destroying;
            let follow_up = state.needs_recompute && !finishing;
            let rebroadcast = change.is_some() || follow_up || state.served_stale;
            (result, change, follow_up, rebroadcast, finishing)
        };
        tracing::trace!(signal = %id, ok = result.is_ok(), follow_up, "async derivation settled");

        Runtime::propagate(|| {
            if rebroadcast {
                self.notify_dependents();
            }
            if let Some(change) = change {
                self.publish(change);
            }
            if follow_up {
                self.schedule_refresh();
            }
        });
        if finishing {
            self.finish_teardown();
        }
        result
    }

    /// Dirty every dependent.
    fn notify_dependents(&self) {
        self.state.lock().served_stale = false;
        Runtime::broadcast_invalidation(&self.key.channel, self.key.id);
    }

    /// Recompute at the end of the current propagation.
    fn schedule_refresh(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        Runtime::schedule(Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if let Err(err) = inner.refresh() {
                tracing::debug!(signal = %inner.key.id, %err, "scheduled refresh failed");
            }
        }));
    }

    fn publish(&self, change: Change<T>) {
        let Change {
            value,
            version,
            waiters,
        } = change;
        tracing::trace!(signal = %self.key.id, version, "value changed");

        for waiter in waiters {
            let _ = waiter.send(Ok(value.clone()));
        }
        Runtime::broadcast_change(
            &self.key.channel,
            ChangeNotice {
                signal: self.key.id,
                version,
            },
        );
    }

    fn receive(self: &Arc<Self>, source: S) {
        {
            let mut state = self.state.lock();
            if state.destroyed || state.destroying {
                tracing::trace!(signal = %self.key.id, "set after destruction ignored");
                return;
            }
            if state.computing == Some(thread::current().id()) {
                tracing::trace!(signal = %self.key.id, "set from inside own derivation ignored");
                return;
            }
            if state.source.as_ref() == Some(&source) {
                return;
            }
            state.source = Some(source);
            state.needs_recompute = true;
        }

        Runtime::propagate(|| {
            if self.eager || Runtime::has_change_listeners(&self.key.channel) {
                self.schedule_refresh();
            }
            self.notify_dependents();
        });
    }

    fn invalidate(self: &Arc<Self>) {
        let (first, served_stale) = {
            let mut state = self.state.lock();
            if state.destroyed || state.destroying || self.compute.is_none() {
                return;
            }
            let first = !std::mem::replace(&mut state.needs_recompute, true);
            (first, state.served_stale)
        };
        // Already dirty: dependents are dirty too, unless one of them read
        // this cell's old value since.
        if !first && !served_stale {
            return;
        }

        tracing::trace!(signal = %self.key.id, first, "invalidated");
        Runtime::propagate(|| {
            if first && Runtime::has_change_listeners(&self.key.channel) {
                self.schedule_refresh();
            }
            self.notify_dependents();
        });
    }

    fn track_all(&self, dependencies: Vec<SignalKey>) {
        for dependency in dependencies {
            if dependency.id == self.key.id {
                continue;
            }
            let added = {
                let mut state = self.state.lock();
                !state.destroyed
                    && state
                        .dependency_set
                        .insert(dependency.id, dependency.channel.clone())
                        .is_none()
            };
            if added {
                tracing::trace!(signal = %self.key.id, upstream = %dependency.id, "dependency tracked");
                Runtime::add_dependency(&dependency.channel, self.invalidation.clone());
            }
        }
    }

    fn remove_listeners<F>(&self, matches: F)
    where
        F: Fn(&ListenerEntry<T>) -> bool,
    {
        let removed: Vec<ListenerEntry<T>> = {
            let mut state = self.state.lock();
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.listeners)
                .into_iter()
                .partition(|entry| matches(entry));
            state.listeners = kept;
            removed
        };
        for entry in removed {
            Runtime::unlisten_changes(&self.key.channel, &entry.wrapper);
        }
    }

    fn teardown(self: &Arc<Self>) {
        let finale = {
            let mut state = self.state.lock();
            if state.destroyed || state.destroying {
                return;
            }
            state.destroying = true;
            state.finale.take()
        };

        Runtime::propagate(|| match finale {
            Some(Finale::Value(value)) => {
                let change = {
                    let mut state = self.state.lock();
                    state.abandon_pending();
                    state.needs_recompute = false;
                    state.write(value)
                };
                if let Some(change) = change {
                    self.notify_dependents();
                    self.publish(change);
                }
            }
            Some(Finale::Source(source)) => {
                {
                    let mut state = self.state.lock();
                    state.abandon_pending();
                    state.source = Some(source);
                    state.needs_recompute = true;
                }
                self.notify_dependents();
                if let Err(err) = self.refresh() {
                    tracing::debug!(signal = %self.key.id, %err, "finale derivation failed");
                }
            }
            None => self.state.lock().abandon_pending(),
        });

        // An async finale pass releases the cell when it settles.
        if self.state.lock().pending.is_some() {
            tracing::debug!(signal = %self.key.id, "release deferred until the finale settles");
            return;
        }
        self.finish_teardown();
    }

    fn finish_teardown(&self) {
        let released = self.state.lock().release();
        self.release(released);
        tracing::debug!(signal = %self.key.id, label = ?self.label, "signal destroyed");
    }
}

impl<T, S, D> SignalInner<T, S, D> {
    fn release(&self, released: Released<T>) {
        let Released {
            dependencies,
            listeners,
            waiters,
            source_detach,
            cancel_registration,
        } = released;

        for channel in dependencies.values() {
            Runtime::remove_dependency(channel, &self.invalidation);
        }
        if let Some(detach) = source_detach {
            detach();
        }
        Runtime::release(&self.key.channel);
        Runtime::unregister(self.key.id);

        for waiter in waiters {
            let _ = waiter.send(Err(ReactiveError::Destroyed(self.key.id)));
        }
        drop(cancel_registration);
        drop(listeners);
    }
}

impl<T, S, D> Reactive for SignalInner<T, S, D>
where
    T: SignalValue,
    S: SignalValue,
    D: SignalData,
{
    fn signal_id(&self) -> SignalId {
        self.key.id
    }

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    fn destroy(&self) {
        if let Some(this) = self.weak.upgrade() {
            this.teardown();
        }
    }
}

impl<T, S, D> Drop for SignalInner<T, S, D> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.destroyed {
            return;
        }
        let released = state.release();
        self.release(released);
        tracing::trace!(signal = %self.key.id, "signal dropped without destroy");
    }
}

impl<T, S, D> Clone for Signal<T, S, D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S, D> fmt::Debug for Signal<T, S, D>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Signal")
            .field("id", &self.inner.key.id)
            .field("label", &self.inner.label)
            .field("value", &state.value)
            .field("version", &state.version)
            .field("status", &state.status)
            .field("needs_recompute", &state.needs_recompute)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}

/// Future returned by [`Signal::to_future`].
#[derive(Debug)]
pub struct NextChange<T> {
    signal: SignalId,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for NextChange<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReactiveError::Destroyed(this.signal))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Stream returned by [`Signal::changes`].
pub struct Changes<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    subscription: Option<Subscription>,
}

impl<T> Stream for Changes<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.receiver.poll_recv(cx)
    }
}

impl<T> Drop for Changes<T> {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl<T> fmt::Debug for Changes<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Changes")
            .field("subscribed", &self.subscription.is_some())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
