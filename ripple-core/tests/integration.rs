//! Integration Tests for the Reactive System
//!
//! These tests verify that signals, the event bus and the bridging
//! primitives work together correctly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;

use ripple_core::cancel::CancelToken;
use ripple_core::emitter::{
    EmitterLike, EventBus, EventKey, Listener, Symbol, TargetEmitter, TargetListenOptions,
};
use ripple_core::error::ReactiveError;
use ripple_core::reactive::{
    ComputeContext, Computation, Runtime, Signal, SignalOptions, SignalStatus, SourceOptions,
};

/// Test that a counter cell counts its versions.
#[test]
fn counter_updates_bump_version() {
    let counter = Signal::new(0);
    for _ in 0..3 {
        counter.update(|v, _, _| v + 1);
    }

    assert_eq!(counter.get().unwrap(), 3);
    assert_eq!(counter.version(), 3);
}

/// Test that reading twice does not change anything.
#[test]
fn pure_reads_are_idempotent() {
    let base = Signal::new(2);
    let squared = base.map(|v| v * v);

    assert_eq!(squared.get().unwrap(), 4);
    let version = squared.version();
    assert_eq!(squared.get().unwrap(), 4);
    assert_eq!(squared.version(), version);
    assert_eq!(squared.compute_count(), 1);
}

/// Test that a dependent always reflects its upstream on the next read.
#[test]
fn dependents_never_read_stale_values() {
    let price = Signal::new(10);
    let quantity = Signal::new(3);
    let (p, q) = (price.clone(), quantity.clone());
    let total = Signal::derived(0, move |_| Ok(Computation::Ready(p.get()? * q.get()?)));
    let with_tax = total.map(|t| t + t / 10);

    assert_eq!(with_tax.get().unwrap(), 33);

    price.set(20);
    assert_eq!(with_tax.get().unwrap(), 66);

    quantity.set(1);
    assert_eq!(total.get().unwrap(), 20);
    assert_eq!(with_tax.get().unwrap(), 22);
}

/// Test that a listener on a derived cell sees every upstream change.
#[test]
fn listeners_on_derived_cells_see_upstream_changes() {
    let name = Signal::new("ada".to_string());
    let greeting = name.map(|n| format!("hello {n}"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    greeting.subscribe(move |g| sink.lock().push(g.clone()));

    name.set("grace".to_string());
    name.set("linus".to_string());

    assert_eq!(*seen.lock(), vec!["hello grace", "hello linus"]);
}

/// Test that a cell reading itself fails synchronously.
#[test]
fn self_cycle_errors_synchronously() {
    let selfish = Signal::derived(0, |cx| Ok(Computation::Ready(cx.signal().get()? + 1)));

    let err = selfish.get().unwrap_err();
    assert!(matches!(err, ReactiveError::SelfDependency(_)));
}

/// Test that two cells reading each other fail synchronously.
#[test]
fn mutual_cycle_errors_synchronously() {
    let later: Arc<OnceLock<Signal<i32>>> = Arc::new(OnceLock::new());
    let slot = later.clone();
    let left = Signal::derived(0, move |_| {
        let right = slot.get().ok_or_else(|| ReactiveError::message("not wired"))?;
        Ok(Computation::Ready(right.get()? + 1))
    });
    let reader = left.clone();
    let right = Signal::derived(0, move |_| Ok(Computation::Ready(reader.get()? + 1)));
    let _ = later.set(right.clone());

    assert!(left.get().unwrap_err().is_cycle());
    assert!(right.get().unwrap_err().is_cycle());
    assert_eq!(left.status(), Some(SignalStatus::Error));
}

/// Test that an async derivation runs once for reads inside its window.
#[tokio::test(start_paused = true)]
async fn async_derivation_is_coalesced() {
    let runs = Arc::new(AtomicI32::new(0));
    let count = runs.clone();
    let slow = Signal::derived(0, move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(Computation::resolve_with(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(7)
        }))
    });

    assert_eq!(slow.get().unwrap(), 0);
    assert_eq!(slow.status(), Some(SignalStatus::Pending));
    assert_eq!(slow.get().unwrap(), 0);
    assert_eq!(slow.status(), Some(SignalStatus::Pending));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert_eq!(slow.get_async().await.unwrap(), 7);
    assert_eq!(slow.status(), Some(SignalStatus::Settled));
    assert_eq!(slow.version(), 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(slow.snapshot_version(), "1:settled:1#0");
}

/// Test that dirtying a pending cell joins the in-flight computation.
#[tokio::test(start_paused = true)]
async fn dirtying_while_pending_is_coalesced() {
    let input = Signal::new(1);
    let runs = Arc::new(AtomicI32::new(0));
    let (upstream, count) = (input.clone(), runs.clone());
    let slow = Signal::derived(0, move |_| {
        count.fetch_add(1, Ordering::SeqCst);
        let v = upstream.get()?;
        Ok(Computation::resolve_with(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(v * 100)
        }))
    });

    assert_eq!(slow.get().unwrap(), 0);
    input.set(2);
    assert_eq!(slow.get().unwrap(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The stale pass is followed up as soon as it settles.
    assert_eq!(slow.get_async().await.unwrap(), 100);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert!(!slow.needs_recompute());
    assert_eq!(slow.status(), Some(SignalStatus::Pending));

    assert_eq!(slow.get_async().await.unwrap(), 200);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a dependent read while its async upstream is dirty catches up.
#[tokio::test(start_paused = true)]
async fn dependent_of_a_dirty_pending_cell_catches_up() {
    let a = Signal::new(0);
    let upstream = a.clone();
    let b = Signal::derived(0, move |_| {
        let v = upstream.get()?;
        Ok(Computation::resolve_with(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(v * 2)
        }))
    });
    let c = b.map(|v| v + 1000);

    assert_eq!(c.get().unwrap(), 1000);
    a.set(1);
    assert_eq!(c.get().unwrap(), 1000);
    a.set(2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.get_last(), 4);
    assert_eq!(c.get().unwrap(), 1004);
}

/// Test that every dependent of a pending cell sees the settled value.
#[tokio::test(start_paused = true)]
async fn dependents_over_a_pending_cell_all_catch_up() {
    let input = Signal::new(1);
    let upstream = input.clone();
    let remote = Signal::derived(0, move |_| {
        let v = upstream.get()?;
        Ok(Computation::resolve_with(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(v * 10)
        }))
    });
    let plus = remote.map(|v| v + 1);
    let minus = remote.map(|v| v - 1);

    assert_eq!(plus.get().unwrap(), 1);
    assert_eq!(minus.get().unwrap(), -1);
    input.set(2);
    assert_eq!(plus.get().unwrap(), 1);
    assert_eq!(minus.get().unwrap(), -1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(plus.get().unwrap(), 21);
    assert_eq!(minus.get().unwrap(), 19);
    assert_eq!(remote.version(), 2);
}

/// Test that a failed async derivation is recorded and rethrown.
#[tokio::test(start_paused = true)]
async fn async_failure_is_recorded() {
    let flaky = Signal::derived(0, |_| {
        Ok(Computation::resolve_with(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<i32, _>(ReactiveError::message("backend down"))
        }))
    });

    assert!(flaky.get_async().await.is_err());
    assert_eq!(flaky.status(), Some(SignalStatus::Error));
    assert!(flaky.get().is_err());
    assert!(flaky.last_error().is_some());
    assert_eq!(flaky.get_safe(), 0);
}

/// Test that listeners see the settled value of an async cell.
#[tokio::test(start_paused = true)]
async fn to_future_sees_async_settlement() {
    let delayed = Signal::derived(String::new(), |_| {
        Ok(Computation::resolve_with(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("loaded".to_string())
        }))
    });

    let next = delayed.to_future();
    assert_eq!(delayed.get().unwrap(), "");
    assert_eq!(next.await.unwrap(), "loaded");
}

/// Test that async dependents are refreshed once the upstream settles.
#[tokio::test(start_paused = true)]
async fn dependents_of_async_cells_catch_up() {
    let remote = Signal::derived(0, |_| {
        Ok(Computation::resolve_with(async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(21)
        }))
    });
    let doubled = remote.map(|v| v * 2);

    assert_eq!(doubled.get().unwrap(), 0);
    remote.get_async().await.unwrap();
    assert_eq!(doubled.get().unwrap(), 42);
}

/// Test that waiting for a change resolves with the new value.
#[tokio::test]
async fn to_future_resolves_on_next_change() {
    let signal = Signal::new(1);
    let next = signal.to_future();

    signal.set(2);
    assert_eq!(next.await.unwrap(), 2);
}

/// Test that destruction rejects waiters, now and later.
#[tokio::test]
async fn destroy_rejects_waiters() {
    let signal = Signal::new(1);
    let next = signal.to_future();

    signal.destroy();
    assert!(next.await.unwrap_err().is_destroyed());
    assert!(signal.to_future().await.unwrap_err().is_destroyed());
}

/// Test that destruction is idempotent and freezes the cell.
#[test]
fn destroy_is_idempotent() {
    let signal = Signal::new(5);
    let doubled = signal.map(|v| v * 2);
    doubled.get().unwrap();

    signal.destroy();
    signal.destroy();

    assert!(signal.is_destroyed());
    assert!(!Runtime::is_registered(signal.id()));
    assert_eq!(signal.version(), 0);

    signal.set(9);
    assert_eq!(signal.get().unwrap(), 5);
    assert_eq!(doubled.get().unwrap(), 10);
}

/// Test that the change stream yields every value and ends at destruction.
#[tokio::test]
async fn changes_stream_ends_at_destroy() {
    let signal = Signal::new(0);
    let changes = signal.changes();

    signal.set(1);
    signal.set(2);
    signal.destroy();

    let seen: Vec<i32> = changes.collect().await;
    assert_eq!(seen, vec![1, 2]);
}

/// Test that a cancelled token destroys the cell and applies its finale.
#[test]
fn cancellation_applies_finale() {
    let token = CancelToken::new();
    let options = SignalOptions::default()
        .cancel(token.clone())
        .finale_value("closed");
    let status = Signal::plain("open", (), options).unwrap();

    token.cancel();
    assert!(status.is_destroyed());
    assert_eq!(status.get().unwrap(), "closed");
    assert_eq!(status.version(), 1);
}

/// Test that an async finale pass settles before the cell is released.
#[tokio::test(start_paused = true)]
async fn async_finale_defers_release() {
    let options = SignalOptions::default()
        .compute(|cx: &ComputeContext<'_, String, i32, ()>| {
            let Some(n) = cx.source.copied() else {
                return Ok(Computation::Unchanged);
            };
            Ok(Computation::resolve_with(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(format!("n={n}"))
            }))
        })
        .finale_source(-1);
    let signal = Signal::create(String::new(), (), options).unwrap();
    let final_value = signal.to_future();

    signal.destroy();
    assert!(signal.is_destroyed());
    assert!(Runtime::is_registered(signal.id()));
    assert_eq!(signal.status(), Some(SignalStatus::Pending));

    assert_eq!(final_value.await.unwrap(), "n=-1");
    assert_eq!(signal.get_last(), "n=-1");
    assert!(!Runtime::is_registered(signal.id()));
    signal.set(5);
    assert_eq!(signal.get_last(), "n=-1");
}

/// Test that a bus feeds a signal through a mapped, filtered source.
#[test]
fn source_events_feed_the_signal() {
    let bus = Arc::new(EventBus::<i32>::new());
    let source = SourceOptions::new(&bus, ["tick"], |n: &i32| *n * 10).filter(|n| *n >= 0);
    let signal = Signal::plain(0, (), SignalOptions::default().source(source)).unwrap();

    bus.emit("tick", &2).unwrap();
    assert_eq!(signal.get().unwrap(), 20);

    bus.emit("tick", &-1).unwrap();
    assert_eq!(signal.get().unwrap(), 20);
    assert_eq!(signal.version(), 1);
    assert_eq!(bus.listener_count("tick"), 1);

    signal.destroy();
    assert_eq!(bus.listener_count("tick"), 0);
}

/// Test that a derived source cell sees producer events.
#[test]
fn derived_cell_over_a_source() {
    let bus = Arc::new(EventBus::<String>::new());
    let options = SignalOptions::default()
        .source(SourceOptions::direct(&bus, ["word"]))
        .compute(|cx: &ComputeContext<'_, usize, String, ()>| {
            Ok(Computation::Ready(cx.prev + cx.source.map_or(0, String::len)))
        });
    let total_length = Signal::create(0, (), options).unwrap();

    bus.emit("word", &"tide".to_string()).unwrap();
    bus.emit("word", &"pool".to_string()).unwrap();
    assert_eq!(total_length.get().unwrap(), 4);

    bus.emit("word", &"swell".to_string()).unwrap();
    assert_eq!(total_length.get().unwrap(), 9);
}

/// Test that dropping the producer leaves the signal usable.
#[test]
fn producer_drop_leaves_signal_usable() {
    let bus = Arc::new(EventBus::<String>::new());
    let options = SignalOptions::default().source(SourceOptions::direct(&bus, ["name"]));
    let name = Signal::plain(String::new(), (), options).unwrap();

    bus.emit("name", &"ada".to_string()).unwrap();
    assert_eq!(name.get().unwrap(), "ada");

    drop(bus);
    name.set("grace".to_string());
    assert_eq!(name.get().unwrap(), "grace");

    name.destroy();
    assert!(name.is_destroyed());
}

/// Test that an external store re-renders on change.
#[test]
fn external_store_drives_renders() {
    let count = Signal::new(0);
    let store = count.map(|v| format!("{v} items")).external_store();
    let renders = Arc::new(AtomicI32::new(0));
    let hits = renders.clone();
    store.subscribe(move || {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    let before = store.snapshot();
    count.set(3);

    assert_eq!(renders.load(Ordering::SeqCst), 1);
    assert_ne!(store.snapshot(), before);
    assert_eq!(store.value(), "3 items");
}

/// Target-style producer dispatching by event-type string.
#[derive(Default)]
struct Target {
    listeners: Mutex<Vec<(String, Listener<i32>)>>,
}

impl Target {
    fn dispatch(&self, event_type: &str, value: i32) {
        let matching: Vec<Listener<i32>> = self
            .listeners
            .lock()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in matching {
            assert!(listener.call(&value).is_none());
        }
    }
}

impl TargetEmitter<i32> for Target {
    fn add_event_listener(&self, event_type: &str, listener: Listener<i32>, _options: TargetListenOptions) {
        self.listeners.lock().push((event_type.to_string(), listener));
    }

    fn remove_event_listener(&self, event_type: &str, listener: &Listener<i32>) {
        self.listeners
            .lock()
            .retain(|(t, l)| !(t == event_type && l.same(listener)));
    }
}

impl EmitterLike<i32> for Target {
    fn as_target_style(&self) -> Option<&dyn TargetEmitter<i32>> {
        Some(self)
    }
}

/// Test that a target-style producer feeds a signal under stringified keys.
#[test]
fn target_style_source_stringifies_keys() {
    let target = Arc::new(Target::default());
    let reading = Symbol::new("reading");
    let reading_type = EventKey::from(reading.clone()).to_type_string().into_owned();
    let source = SourceOptions::new(
        &target,
        [EventKey::Number(7), EventKey::Symbol(reading)],
        |v: &i32| *v + 1,
    );
    let signal = Signal::plain(0, (), SignalOptions::default().source(source)).unwrap();

    target.dispatch("7", 4);
    assert_eq!(signal.get().unwrap(), 5);
    target.dispatch(&reading_type, 9);
    assert_eq!(signal.get().unwrap(), 10);
    target.dispatch("8", 1);
    assert_eq!(signal.get().unwrap(), 10);

    signal.destroy();
    assert!(target.listeners.lock().is_empty());
}
