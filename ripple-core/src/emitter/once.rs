//! Bridging primitive: wait for the next of several events.
//!
//! [`once`] turns "the next emission of any of these events" into a future.
//! Listeners are attached synchronously when `once` is called, so emissions
//! that happen before the future is first polled are not missed.
//!
//! # Settlement
//!
//! ```text
//!            ┌──────────── match ───────────► resolved
//!            ├──────────── timeout ─────────► Timeout
//!   armed ───┼──────────── token fired ─────► Cancelled
//!            ├──────────── error event ─────► ErrorEvent
//!            └──────────── future dropped ──► (cleanup only)
//! ```
//!
//! Every terminal transition goes through one `settle` call that takes the
//! one-shot sender out of its slot. Only the first caller finds it there, so
//! teardown (removing every listener, the cancellation registration and the
//! timer) runs exactly once and later outcomes are no-ops.
//!
//! The deadline is armed when `once` is called: on a tokio runtime a timer
//! task settles the wait even if the future is never polled, and an emission
//! arriving after the deadline settles it as a timeout rather than a match.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::{Instant, Sleep};

use super::bus::EventArgs;
use super::compat::{CompatEmitter, EmitterLike, ListenMode};
use super::key::EventKey;
use super::listener::Listener;
use crate::cancel::{CancelRegistration, CancelToken};
use crate::error::{ReactiveError, Result};

/// Predicate deciding whether an emission satisfies the wait.
pub type EventFilter<A> = Arc<dyn Fn(&EventKey, &A) -> bool + Send + Sync>;

/// Options for [`once`].
pub struct OnceOptions<A> {
    /// Only emissions for which the filter returns `true` resolve the wait.
    pub filter: Option<EventFilter<A>>,
    /// Channel whose emission rejects the wait. Defaults to
    /// [`EventKey::error()`]. When it is also one of the awaited events it
    /// resolves like any other.
    pub error_event: Option<EventKey>,
    /// Reject with [`ReactiveError::Timeout`] after this long.
    pub timeout: Option<Duration>,
    /// Reject with [`ReactiveError::Cancelled`] when this token fires.
    pub cancel: Option<CancelToken>,
}

impl<A> Default for OnceOptions<A> {
    fn default() -> Self {
        Self {
            filter: None,
            error_event: Some(EventKey::error()),
            timeout: None,
            cancel: None,
        }
    }
}

impl<A> OnceOptions<A> {
    /// Set a timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a cancellation token.
    pub fn cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Set a filter predicate.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&EventKey, &A) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Do not listen to any error channel.
    pub fn without_error_event(mut self) -> Self {
        self.error_event = None;
        self
    }
}

/// The emission that resolved a [`once`] wait.
#[derive(Debug, Clone, PartialEq)]
pub struct EventMatch<A> {
    /// Which of the awaited events fired.
    pub event: EventKey,
    /// Its arguments.
    pub args: A,
}

struct Armed<A> {
    emitter: CompatEmitter<A>,
    registrations: Mutex<Vec<(EventKey, Listener<A>)>>,
    sender: Mutex<Option<oneshot::Sender<Result<EventMatch<A>>>>>,
    cancel_registration: Mutex<Option<CancelRegistration>>,
    deadline: Option<(Instant, Duration)>,
    timer: Mutex<Option<AbortHandle>>,
}

impl<A: EventArgs> Armed<A> {
    /// Settle the wait. Returns `false` if it was already settled.
    fn settle(&self, outcome: Result<EventMatch<A>>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };

        let registrations = std::mem::take(&mut *self.registrations.lock());
        for (event, listener) in &registrations {
            self.emitter.unlisten(event, listener);
        }
        drop(self.cancel_registration.lock().take());
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }

        if let Err(err) = &outcome {
            tracing::debug!(error = %err, "once settled with error");
        }
        let _ = sender.send(outcome);
        true
    }

    fn is_settled(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// The timeout error, if the deadline has passed.
    fn expired(&self) -> Option<ReactiveError> {
        self.deadline
            .filter(|(deadline, _)| Instant::now() >= *deadline)
            .map(|(_, timeout)| ReactiveError::Timeout(timeout))
    }

    fn arm_timer(self: &Arc<Self>) {
        let Some((deadline, timeout)) = self.deadline else {
            return;
        };
        let Ok(handle) = Handle::try_current() else {
            tracing::trace!("once timeout armed outside a runtime, checked on poll");
            return;
        };

        let weak = Arc::downgrade(self);
        let task = handle.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(armed) = weak.upgrade() {
                armed.settle(Err(ReactiveError::Timeout(timeout)));
            }
        });

        let mut timer = self.timer.lock();
        if self.is_settled() {
            task.abort();
        } else {
            *timer = Some(task.abort_handle());
        }
    }
}

/// Future returned by [`once`].
///
/// Dropping it before it resolves removes every listener it attached.
#[must_use = "futures do nothing unless polled"]
pub struct OnceEvent<A: EventArgs> {
    armed: Arc<Armed<A>>,
    receiver: oneshot::Receiver<Result<EventMatch<A>>>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl<A: EventArgs> OnceEvent<A> {
    /// Abort the wait. A no-op once the wait is settled.
    pub fn cancel(&self) {
        self.armed.settle(Err(ReactiveError::Cancelled));
    }
}

impl<A: EventArgs> Future for OnceEvent<A> {
    type Output = Result<EventMatch<A>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some((deadline, timeout)) = self.armed.deadline {
            if !self.armed.is_settled() {
                let sleep = self
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                if sleep.as_mut().poll(cx).is_ready() {
                    self.armed.settle(Err(ReactiveError::Timeout(timeout)));
                }
            }
        }

        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReactiveError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<A: EventArgs> Drop for OnceEvent<A> {
    fn drop(&mut self) {
        self.armed.settle(Err(ReactiveError::Cancelled));
    }
}

impl<A: EventArgs> fmt::Debug for OnceEvent<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnceEvent")
            .field("settled", &self.armed.is_settled())
            .field("timeout", &self.armed.deadline.map(|(_, t)| t))
            .finish()
    }
}

/// Wait for the next emission of any of `events` on `emitter`.
///
/// Works against any [`EmitterLike`], not only [`EventBus`](super::EventBus).
/// Fails synchronously only when the emitter exposes no compatible surface
/// or rejects the registration.
pub fn once<A, E, K>(
    emitter: &Arc<E>,
    events: impl IntoIterator<Item = K>,
    options: OnceOptions<A>,
) -> Result<OnceEvent<A>>
where
    A: EventArgs,
    E: EmitterLike<A> + 'static,
    K: Into<EventKey>,
{
    let compat = CompatEmitter::new(emitter)?;
    let events: Vec<EventKey> = events.into_iter().map(Into::into).collect();
    if events.is_empty() {
        return Err(ReactiveError::Config("once() needs at least one event".into()));
    }

    let (sender, receiver) = oneshot::channel();
    let armed = Arc::new(Armed {
        emitter: compat,
        registrations: Mutex::new(Vec::new()),
        sender: Mutex::new(Some(sender)),
        cancel_registration: Mutex::new(None),
        deadline: options.timeout.map(|t| (Instant::now() + t, t)),
        timer: Mutex::new(None),
    });

    let future = OnceEvent {
        armed: armed.clone(),
        receiver,
        sleep: None,
    };

    if let Some(token) = &options.cancel {
        if token.is_cancelled() {
            armed.settle(Err(ReactiveError::Cancelled));
            return Ok(future);
        }
    }

    for event in &events {
        let listener = match_listener(Arc::downgrade(&armed), event.clone(), options.filter.clone());
        attach(&armed, event, listener)?;
    }

    if let Some(error_event) = options.error_event.filter(|e| !events.contains(e)) {
        let weak = Arc::downgrade(&armed);
        let key = error_event.clone();
        let listener = Listener::new(move |args: &A| {
            if let Some(armed) = weak.upgrade() {
                let err = armed.expired().unwrap_or_else(|| ReactiveError::ErrorEvent {
                    event: key.clone(),
                    detail: format!("{args:?}"),
                });
                armed.settle(Err(err));
            }
        });
        attach(&armed, &error_event, listener)?;
    }

    if let Some(token) = options.cancel {
        let weak = Arc::downgrade(&armed);
        let registration = token.on_cancel(move || {
            if let Some(armed) = weak.upgrade() {
                armed.settle(Err(ReactiveError::Cancelled));
            }
        });
        // A token that fired meanwhile already settled the wait, so the
        // registration only needs keeping while still armed.
        if !armed.is_settled() {
            *armed.cancel_registration.lock() = Some(registration);
        }
    }

    armed.arm_timer();
    Ok(future)
}

fn match_listener<A: EventArgs>(
    armed: Weak<Armed<A>>,
    event: EventKey,
    filter: Option<EventFilter<A>>,
) -> Listener<A> {
    Listener::new(move |args: &A| {
        if let Some(filter) = &filter {
            if !filter(&event, args) {
                return;
            }
        }
        let Some(armed) = armed.upgrade() else {
            return;
        };
        let outcome = match armed.expired() {
            Some(timeout) => Err(timeout),
            None => Ok(EventMatch {
                event: event.clone(),
                args: args.clone(),
            }),
        };
        armed.settle(outcome);
    })
}

fn attach<A: EventArgs>(armed: &Arc<Armed<A>>, event: &EventKey, listener: Listener<A>) -> Result<()> {
    if let Err(err) = armed.emitter.listen(event, listener.clone(), ListenMode::Every) {
        armed.settle(Err(err.clone()));
        return Err(err);
    }
    armed.registrations.lock().push((event.clone(), listener));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::EventBus;

    #[tokio::test]
    async fn resolves_with_first_match_and_cleans_up() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["a", "b"], OnceOptions::default()).unwrap();

        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.listener_count("b"), 1);
        assert_eq!(bus.listener_count(EventKey::error()), 1);

        bus.emit("a", &7).unwrap();
        let matched = wait.await.unwrap();

        assert_eq!(matched, EventMatch { event: "a".into(), args: 7 });
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn filter_skips_non_matching_emissions() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["n"], OnceOptions::default().filter(|_, v| *v > 10)).unwrap();

        bus.emit("n", &1).unwrap();
        bus.emit("n", &11).unwrap();
        assert_eq!(wait.await.unwrap().args, 11);
    }

    #[tokio::test]
    async fn error_event_rejects() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["a"], OnceOptions::default()).unwrap();

        bus.emit(EventKey::error(), &-1).unwrap();
        let err = wait.await.unwrap_err();
        assert!(matches!(err, ReactiveError::ErrorEvent { .. }));
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test]
    async fn listed_error_event_resolves() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, [EventKey::error()], OnceOptions::default()).unwrap();
        assert_eq!(bus.listener_count(EventKey::error()), 1);

        bus.emit(EventKey::error(), &3).unwrap();
        assert_eq!(wait.await.unwrap().args, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_and_cleans_up() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(
            &bus,
            ["a", "b"],
            OnceOptions::default().timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let err = wait.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(bus.event_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_without_polling() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(
            &bus,
            ["a", "b"],
            OnceOptions::default().timeout(Duration::from_millis(50)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.listener_count("a"), 0);
        assert!(!bus.emit("a", &1).unwrap());

        assert!(wait.await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn emission_after_deadline_is_a_timeout() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["a"], OnceOptions::default().timeout(Duration::ZERO)).unwrap();

        bus.emit("a", &1).unwrap();
        assert!(bus.event_names().is_empty());
        assert!(wait.await.unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn match_before_deadline_wins() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["a"], OnceOptions::default().timeout(Duration::from_millis(50))).unwrap();

        bus.emit("a", &4).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(wait.await.unwrap().args, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_timeout_is_a_no_op() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        let wait = once(
            &bus,
            ["a"],
            OnceOptions::default()
                .timeout(Duration::from_millis(10))
                .cancel(token.clone()),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        wait.cancel();
        assert!(wait.await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn cancellation_rejects_and_cleans_up() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        let wait = once(&bus, ["a"], OnceOptions::default().cancel(token.clone())).unwrap();

        token.cancel();
        assert!(bus.event_names().is_empty());
        assert!(wait.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_token_never_registers() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        token.cancel();

        let wait = once(&bus, ["a"], OnceOptions::default().cancel(token)).unwrap();
        assert!(bus.event_names().is_empty());
        assert!(wait.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn later_outcomes_are_no_ops() {
        let bus = Arc::new(EventBus::<i32>::new());
        let token = CancelToken::new();
        let wait = once(&bus, ["a"], OnceOptions::default().cancel(token.clone())).unwrap();

        bus.emit("a", &1).unwrap();
        token.cancel();
        wait.cancel();
        assert_eq!(wait.await.unwrap().args, 1);
    }

    #[test]
    fn dropping_the_future_removes_listeners() {
        let bus = Arc::new(EventBus::<i32>::new());
        let wait = once(&bus, ["a"], OnceOptions::default()).unwrap();
        assert_eq!(bus.listener_count("a"), 1);

        drop(wait);
        assert!(bus.event_names().is_empty());
    }
}
