//! Benchmark: signal propagation and bus fan-out

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ripple_core::emitter::{EventBus, Listener};
use ripple_core::reactive::{Computation, Signal};

fn benchmark_set_and_get(c: &mut Criterion) {
    let cell = Signal::new(0u64);

    c.bench_function("plain_set_get", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            cell.set(n);
            black_box(cell.get().ok())
        })
    });
}

fn benchmark_derived_chain(c: &mut Criterion) {
    let root = Signal::new(0u64);
    let mut tail = root.clone();
    for _ in 0..10 {
        let upstream = tail.clone();
        tail = Signal::derived(0, move |_| Ok(Computation::Ready(upstream.get()? + 1)));
    }

    c.bench_function("derived_chain_10", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            root.set(n);
            black_box(tail.get().ok())
        })
    });
}

fn benchmark_subscribed_fan_out(c: &mut Criterion) {
    let root = Signal::new(0u64);
    let leaves: Vec<Signal<u64>> = (0..32).map(|i| root.map(move |v| v + i)).collect();
    for leaf in &leaves {
        leaf.subscribe(|v| {
            black_box(v);
        });
    }

    c.bench_function("subscribed_fan_out_32", |b| {
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            root.set(n);
        })
    });
}

fn benchmark_bus_emit(c: &mut Criterion) {
    let bus = Arc::new(EventBus::<u64>::new());
    bus.set_max_listeners(0);
    for _ in 0..16 {
        bus.on("tick", Listener::new(|v| {
            black_box(v);
        }));
    }

    c.bench_function("bus_emit_16", |b| {
        b.iter(|| black_box(bus.emit("tick", &1).ok()))
    });
}

criterion_group!(
    benches,
    benchmark_set_and_get,
    benchmark_derived_chain,
    benchmark_subscribed_fan_out,
    benchmark_bus_emit
);
criterion_main!(benches);
