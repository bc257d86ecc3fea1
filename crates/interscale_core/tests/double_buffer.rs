//! Integration tests for the double buffer under real threads.

use interscale_core::{BufferStatus, DoubleBuffer, Event, Interval, Message, SynchronizationBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn interval(index: u64) -> SynchronizationBuffer {
    #[allow(clippy::cast_precision_loss)]
    let events = (0..(index % 7) as usize)
        .map(|i| Event::new(index as f64 + i as f64 * 0.01, i as u64, index as f64))
        .collect();
    SynchronizationBuffer::with_events(Interval::new(index, index as f64, index as f64 + 1.0), events)
}

#[test]
fn test_intervals_arrive_in_order_exactly_once() {
    const N: u64 = 2_000;
    let slot = Arc::new(DoubleBuffer::with_capacity(4));

    let writer = {
        let slot = Arc::clone(&slot);
        thread::spawn(move || {
            for index in 0..N {
                slot.write(&interval(index)).unwrap();
            }
            slot.finish().unwrap();
        })
    };

    let mut received = Vec::new();
    loop {
        match slot.read() {
            Message::Interval(buffer) => received.push(buffer),
            Message::EndOfStream => break,
            Message::Error(reason) => panic!("unexpected error {reason}"),
        }
    }
    writer.join().unwrap();

    assert_eq!(received.len() as u64, N);
    for (expected, buffer) in received.iter().enumerate() {
        assert_eq!(*buffer, interval(expected as u64));
    }
    assert_eq!(slot.handoffs(), N);
    assert_eq!(slot.status(), BufferStatus::EndOfStream);
}

#[test]
fn test_status_never_leaves_legal_states() {
    let slot = Arc::new(DoubleBuffer::with_capacity(0));
    let done = Arc::new(AtomicBool::new(false));

    let observer = {
        let slot = Arc::clone(&slot);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let (mut seen, mut previous) = slot.snapshot();
            while !done.load(Ordering::Acquire) {
                let (count, current) = slot.snapshot();
                if count == seen {
                    assert_eq!(current, previous);
                    continue;
                }
                assert!(count > seen, "transition count went back");
                assert!(!previous.is_terminal(), "left terminal status {previous:?}");
                if count == seen + 1 {
                    assert!(
                        previous.can_transition(current),
                        "illegal transition {previous:?} -> {current:?}"
                    );
                }
                (seen, previous) = (count, current);
            }
        })
    };

    let writer = {
        let slot = Arc::clone(&slot);
        thread::spawn(move || {
            for index in 0..500 {
                slot.write(&interval(index)).unwrap();
            }
            slot.finish().unwrap();
        })
    };

    while slot.read() != Message::EndOfStream {}
    writer.join().unwrap();
    done.store(true, Ordering::Release);
    observer.join().unwrap();
    // Four transitions per interval plus the final EndOfStream.
    assert_eq!(slot.snapshot(), (500 * 4 + 1, BufferStatus::EndOfStream));
}

#[test]
fn test_abort_from_reader_stops_writer() {
    let slot = Arc::new(DoubleBuffer::with_capacity(0));

    let writer = {
        let slot = Arc::clone(&slot);
        thread::spawn(move || {
            let mut written = 0u64;
            while slot.write(&interval(written)).is_ok() {
                written += 1;
            }
            written
        })
    };

    for _ in 0..10 {
        assert!(matches!(slot.read(), Message::Interval(_)));
    }
    slot.abort("transformer failed");

    let written = writer.join().unwrap();
    assert!(written >= 10);
    assert_eq!(slot.read(), Message::Error("transformer failed".into()));
}
