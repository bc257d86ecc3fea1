//! # Double Buffer Hand-off Benchmark
//!
//! Measures one writer handing intervals to one reader through the slot,
//! for small and large intervals.

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use interscale_core::{DoubleBuffer, Event, Interval, Message, SynchronizationBuffer};
use std::sync::Arc;
use std::thread;

const INTERVALS: u64 = 1_000;

fn make_interval(index: u64, events: usize) -> SynchronizationBuffer {
    let events = (0..events)
        .map(|i| Event::new(i as f64 * 0.1, i as u64, 1.0))
        .collect();
    SynchronizationBuffer::with_events(Interval::new(index, 0.0, 100.0), events)
}

fn bench_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("double_buffer_handoff");
    for events in [0usize, 64, 4096] {
        let template = make_interval(0, events);
        group.bench_with_input(BenchmarkId::from_parameter(events), &template, |b, template| {
            b.iter(|| {
                let slot = Arc::new(DoubleBuffer::with_capacity(events));
                let writer = {
                    let slot = Arc::clone(&slot);
                    let template = template.clone();
                    thread::spawn(move || {
                        for _ in 0..INTERVALS {
                            slot.write(&template).ok();
                        }
                        slot.finish().ok();
                    })
                };
                let mut total = 0usize;
                while let Message::Interval(buffer) = slot.read() {
                    total += buffer.len();
                }
                writer.join().ok();
                black_box(total)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_handoff);
criterion_main!(benches);
