//! External sources.
//!
//! A signal can be fed by an external emitter: each matching emission is
//! mapped to a source value and written as if by [`Signal::set`]. The
//! producer is held weakly through a [`CompatEmitter`], so attaching a
//! signal never keeps the producer alive.
//!
//! [`Signal::set`]: super::Signal::set

use std::fmt;
use std::sync::Arc;

use crate::emitter::{CompatEmitter, EmitterLike, EventArgs, EventKey, ListenMode, Listener};
use crate::error::Result;

/// Callback that writes a source value into its signal.
pub type SourceSink<S> = Arc<dyn Fn(S) + Send + Sync>;

/// Undoes a source attachment.
pub type Detach = Box<dyn FnOnce() + Send>;

type Attach<S> = Box<dyn FnOnce(SourceSink<S>) -> Result<Detach> + Send>;

/// A source, with its emission type erased.
///
/// Built from [`SourceOptions`]; consumed when the signal is created.
pub struct SourceAttachment<S> {
    attach: Attach<S>,
}

impl<S> SourceAttachment<S> {
    /// Build an attachment from a raw attach function.
    ///
    /// `attach` receives the signal's sink and returns the function that
    /// undoes the attachment.
    pub fn from_fn<F>(attach: F) -> Self
    where
        F: FnOnce(SourceSink<S>) -> Result<Detach> + Send + 'static,
    {
        Self {
            attach: Box::new(attach),
        }
    }

    pub(crate) fn attach(self, sink: SourceSink<S>) -> Result<Detach> {
        (self.attach)(sink)
    }
}

impl<S> fmt::Debug for SourceAttachment<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceAttachment")
    }
}

type MapFn<A, S> = Arc<dyn Fn(&A) -> S + Send + Sync>;
type FilterFn<A> = Arc<dyn Fn(&A) -> bool + Send + Sync>;

/// Subscribe a signal's source to one or more events of an emitter.
pub struct SourceOptions<A, S> {
    emitter: Arc<dyn EmitterLike<A>>,
    events: Vec<EventKey>,
    map: MapFn<A, S>,
    filter: Option<FilterFn<A>>,
}

impl<A: EventArgs, S: Send + 'static> SourceOptions<A, S> {
    /// Map every emission of `events` on `emitter` through `map`.
    pub fn new<E, K, I, F>(emitter: &Arc<E>, events: I, map: F) -> Self
    where
        E: EmitterLike<A> + 'static,
        K: Into<EventKey>,
        I: IntoIterator<Item = K>,
        F: Fn(&A) -> S + Send + Sync + 'static,
    {
        let emitter: Arc<dyn EmitterLike<A>> = emitter.clone();
        Self {
            emitter,
            events: events.into_iter().map(Into::into).collect(),
            map: Arc::new(map),
            filter: None,
        }
    }

    /// Ignore emissions the predicate rejects.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl<A: EventArgs> SourceOptions<A, A> {
    /// Use every emission's payload as the source value.
    pub fn direct<E, K, I>(emitter: &Arc<E>, events: I) -> Self
    where
        E: EmitterLike<A> + 'static,
        K: Into<EventKey>,
        I: IntoIterator<Item = K>,
    {
        Self::new(emitter, events, A::clone)
    }
}

impl<A: EventArgs, S: Send + 'static> From<SourceOptions<A, S>> for SourceAttachment<S> {
    fn from(options: SourceOptions<A, S>) -> Self {
        SourceAttachment::from_fn(move |sink| {
            let SourceOptions {
                emitter,
                events,
                map,
                filter,
            } = options;
            let compat = CompatEmitter::resolve(&emitter)?;
            drop(emitter);

            let mut attached: Vec<(EventKey, Listener<A>)> = Vec::with_capacity(events.len());
            for event in events {
                let sink = sink.clone();
                let map = map.clone();
                let filter = filter.clone();
                let listener = Listener::new(move |args: &A| {
                    if filter.as_ref().is_some_and(|accept| !accept(args)) {
                        return;
                    }
                    sink(map(args));
                });

                match compat.listen(&event, listener.clone(), ListenMode::Every) {
                    Ok(true) => attached.push((event, listener)),
                    Ok(false) => tracing::trace!(%event, "source producer already dropped"),
                    Err(err) => {
                        for (event, listener) in &attached {
                            compat.unlisten(event, listener);
                        }
                        return Err(err);
                    }
                }
            }

            tracing::trace!(events = attached.len(), shape = ?compat.shape(), "source attached");
            Ok(Box::new(move || {
                for (event, listener) in &attached {
                    compat.unlisten(event, listener);
                }
            }) as Detach)
        })
    }
}

impl<A, S> fmt::Debug for SourceOptions<A, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceOptions")
            .field("events", &self.events)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}
