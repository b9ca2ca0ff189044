//! Async iteration over emitted events.
//!
//! [`on`] attaches to an emitter and returns an [`EventStream`] that yields
//! the arguments of every emission of one event. The stream is lazy and
//! single-use: it buffers emissions between polls and ends when a close
//! event fires, when its cancellation token fires, or when it is closed or
//! dropped. Every one of those paths detaches all of its listeners.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, Stream};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::bus::EventArgs;
use super::compat::{CompatEmitter, EmitterLike, ListenMode};
use super::key::EventKey;
use super::listener::Listener;
use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{ReactiveError, Result};

/// Side effects registered for a single yielded item.
#[derive(Default)]
pub struct ItemScope {
    after: Vec<Box<dyn FnOnce() + Send>>,
}

impl ItemScope {
    /// Run `effect` once this item's computation has finished.
    pub fn after<F>(&mut self, effect: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.after.push(Box::new(effect));
    }

    fn run(self) {
        for effect in self.after {
            effect();
        }
    }
}

impl fmt::Debug for ItemScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemScope").field("after", &self.after.len()).finish()
    }
}

/// Per-item transformation hook.
pub type ComputeValue<A> = Arc<dyn Fn(A, &mut ItemScope) -> BoxFuture<'static, Result<A>> + Send + Sync>;

/// Options for [`on`].
pub struct OnOptions<A> {
    /// Events that end the stream.
    pub close: Vec<EventKey>,
    /// Channel whose emission yields one error and ends the stream.
    /// Defaults to [`EventKey::error()`].
    pub error_event: Option<EventKey>,
    /// Ends the stream when fired.
    pub cancel: Option<CancelToken>,
    /// Transforms (or awaits a replacement for) each item before delivery.
    pub compute_value: Option<ComputeValue<A>>,
}

impl<A> Default for OnOptions<A> {
    fn default() -> Self {
        Self {
            close: Vec::new(),
            error_event: Some(EventKey::error()),
            cancel: None,
            compute_value: None,
        }
    }
}

impl<A: EventArgs> OnOptions<A> {
    /// End the stream when `event` fires.
    pub fn close_on(mut self, event: impl Into<EventKey>) -> Self {
        self.close.push(event.into());
        self
    }

    /// End the stream when `token` fires.
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Install a per-item transformation.
    pub fn compute_value<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(A, &mut ItemScope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<A>> + Send + 'static,
    {
        self.compute_value = Some(Arc::new(move |args, scope| f(args, scope).boxed()));
        self
    }
}

enum Frame<A> {
    Item(A),
    Close,
    Error(ReactiveError),
}

/// Listeners owned by a stream, detached exactly once.
struct Attachment<A> {
    emitter: CompatEmitter<A>,
    registrations: Vec<(EventKey, Listener<A>)>,
}

impl<A: 'static> Attachment<A> {
    fn detach(self) {
        for (event, listener) in &self.registrations {
            self.emitter.unlisten(event, listener);
        }
    }
}

/// State shared between a stream and its cancellation callback.
struct Link<A> {
    attachment: Mutex<Option<Attachment<A>>>,
    cancelled: AtomicBool,
}

impl<A: 'static> Link<A> {
    fn detach(&self) {
        let attachment = self.attachment.lock().take();
        if let Some(attachment) = attachment {
            attachment.detach();
        }
    }
}

/// Stream returned by [`on`].
#[must_use = "streams do nothing unless polled"]
pub struct EventStream<A: EventArgs> {
    receiver: mpsc::UnboundedReceiver<Frame<A>>,
    link: Arc<Link<A>>,
    cancel: Option<CancelRegistration>,
    compute_value: Option<ComputeValue<A>>,
    in_flight: Option<(BoxFuture<'static, Result<A>>, ItemScope)>,
    done: bool,
}

impl<A: EventArgs> EventStream<A> {
    /// Stop iterating and detach every listener.
    pub fn close(&mut self) {
        self.finish();
    }

    /// Stop iterating because of `err`, detaching every listener, and hand
    /// the error back.
    pub fn throw(&mut self, err: ReactiveError) -> ReactiveError {
        self.finish();
        err
    }

    /// Whether the stream has ended.
    pub fn is_done(&self) -> bool {
        self.done
    }

    fn finish(&mut self) {
        self.done = true;
        self.in_flight = None;
        self.cancel = None;
        self.link.detach();
        self.receiver.close();
    }
}

impl<A: EventArgs> Stream for EventStream<A> {
    type Item = Result<A>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            if self.link.cancelled.load(Ordering::SeqCst) {
                self.finish();
                return Poll::Ready(None);
            }

            if let Some((fut, _)) = &mut self.in_flight {
                let outcome = match fut.as_mut().poll(cx) {
                    Poll::Ready(outcome) => outcome,
                    Poll::Pending => return Poll::Pending,
                };
                if let Some((_, scope)) = self.in_flight.take() {
                    scope.run();
                }
                if outcome.is_err() {
                    self.finish();
                }
                return Poll::Ready(Some(outcome));
            }

            let frame = match self.receiver.poll_recv(cx) {
                Poll::Ready(frame) => frame,
                Poll::Pending => return Poll::Pending,
            };

            match frame {
                Some(Frame::Item(args)) => match self.compute_value.clone() {
                    Some(compute) => {
                        let mut scope = ItemScope::default();
                        let fut = compute(args, &mut scope);
                        self.in_flight = Some((fut, scope));
                    }
                    None => return Poll::Ready(Some(Ok(args))),
                },
                Some(Frame::Error(err)) => {
                    self.finish();
                    return Poll::Ready(Some(Err(err)));
                }
                Some(Frame::Close) | None => {
                    self.finish();
                    return Poll::Ready(None);
                }
            }
        }
    }
}

impl<A: EventArgs> Drop for EventStream<A> {
    fn drop(&mut self) {
        self.link.detach();
    }
}

impl<A: EventArgs> fmt::Debug for EventStream<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("done", &self.done)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}

/// Iterate over emissions of `event` on `emitter`.
///
/// Works against any [`EmitterLike`]. Cancellation ends the stream rather
/// than surfacing an error.
pub fn on<A, E>(emitter: &Arc<E>, event: impl Into<EventKey>, options: OnOptions<A>) -> Result<EventStream<A>>
where
    A: EventArgs,
    E: EmitterLike<A> + 'static,
{
    let compat = CompatEmitter::new(emitter)?;
    let event = event.into();
    let (sender, receiver) = mpsc::unbounded_channel();

    let mut stream = EventStream {
        receiver,
        link: Arc::new(Link {
            attachment: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }),
        cancel: None,
        compute_value: options.compute_value,
        in_flight: None,
        done: false,
    };

    if options.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
        stream.done = true;
        return Ok(stream);
    }

    let mut registrations = Vec::new();
    let mut attach = |key: &EventKey, listener: Listener<A>| -> Result<()> {
        compat.listen(key, listener.clone(), ListenMode::Every)?;
        registrations.push((key.clone(), listener));
        Ok(())
    };

    let tx = sender.clone();
    let result = attach(
        &event,
        Listener::new(move |args: &A| {
            let _ = tx.send(Frame::Item(args.clone()));
        }),
    )
    .and_then(|()| {
        for key in &options.close {
            let tx = sender.clone();
            attach(key, Listener::new(move |_: &A| {
                let _ = tx.send(Frame::Close);
            }))?;
        }
        if let Some(error_event) = options.error_event.filter(|e| *e != event) {
            let tx = sender.clone();
            let key = error_event.clone();
            attach(
                &error_event,
                Listener::new(move |args: &A| {
                    let _ = tx.send(Frame::Error(ReactiveError::ErrorEvent {
                        event: key.clone(),
                        detail: format!("{args:?}"),
                    }));
                }),
            )?;
        }
        Ok(())
    });

    *stream.link.attachment.lock() = Some(Attachment {
        emitter: compat.clone(),
        registrations,
    });

    if let Err(err) = result {
        stream.finish();
        return Err(err);
    }

    stream.cancel = options.cancel.map(|token| {
        let link = Arc::downgrade(&stream.link);
        token.on_cancel(move || {
            tracing::debug!("event stream cancelled");
            if let Some(link) = link.upgrade() {
                link.cancelled.store(true, Ordering::SeqCst);
                link.detach();
            }
            // Wakes a consumer parked in poll_next.
            let _ = sender.send(Frame::Close);
        })
    });

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::EventBus;
    use futures_util::StreamExt;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn yields_emissions_in_order() {
        let bus = Arc::new(EventBus::<i32>::new());
        let mut stream = on(&bus, "tick", OnOptions::default().close_on("end")).unwrap();

        bus.emit("tick", &1).unwrap();
        bus.emit("tick", &2).unwrap();
        bus.emit("end", &0).unwrap();
        bus.emit("tick", &3).unwrap();

        let items: Vec<i32> = (&mut stream).map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2]);
        assert!(stream.is_done());
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn error_event_yields_one_error() {
        let bus = Arc::new(EventBus::<i32>::new());
        let mut stream = on(&bus, "tick", OnOptions::default()).unwrap();

        bus.emit(EventKey::error(), &9).unwrap();
        assert!(matches!(stream.next().await, Some(Err(ReactiveError::ErrorEvent { .. }))));
        assert!(stream.next().await.is_none());
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn cancellation_completes_pending_next() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        let mut stream = on(&bus, "tick", OnOptions::default().cancel(token.clone())).unwrap();

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                token.cancel();
            })
        };

        assert!(stream.next().await.is_none());
        canceller.await.unwrap();
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn cancellation_detaches_before_polling() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        let mut stream = on(&bus, "tick", OnOptions::default().cancel(token.clone())).unwrap();

        bus.emit("tick", &1).unwrap();
        token.cancel();
        assert!(bus.event_names().is_empty());
        assert!(!bus.emit("tick", &2).unwrap());

        assert!(stream.next().await.is_none());
        assert!(stream.is_done());
    }

    #[tokio::test]
    async fn compute_value_transforms_items_and_runs_effects() {
        let bus = Arc::new(EventBus::<i32>::new());
        let effects = Arc::new(Mutex::new(Vec::new()));
        let effects_clone = effects.clone();

        let options = OnOptions::default().compute_value(move |v: i32, scope: &mut ItemScope| {
            let effects = effects_clone.clone();
            scope.after(move || effects.lock().push(v));
            async move { Ok(v * 10) }
        });
        let mut stream = on(&bus, "n", options).unwrap();

        bus.emit("n", &1).unwrap();
        bus.emit("n", &2).unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), 10);
        assert_eq!(stream.next().await.unwrap().unwrap(), 20);
        assert_eq!(*effects.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn close_and_drop_detach() {
        let bus = Arc::new(EventBus::<i32>::new());
        let mut stream = on(&bus, "a", OnOptions::default()).unwrap();
        assert_eq!(bus.listener_count("a"), 1);

        stream.close();
        assert!(bus.event_names().is_empty());
        assert!(stream.next().await.is_none());

        let stream = on(&bus, "a", OnOptions::default()).unwrap();
        drop(stream);
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn throw_ends_iteration() {
        let bus = Arc::new(EventBus::<i32>::new());
        let mut stream = on(&bus, "a", OnOptions::default()).unwrap();

        let err = stream.throw(ReactiveError::message("stop"));
        assert!(matches!(err, ReactiveError::Computation(_)));
        assert!(stream.next().await.is_none());
        assert_eq!(bus.listener_count("a"), 0);
    }
}
