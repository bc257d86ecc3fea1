//! Integration tests for the file handshake.

use interscale_core::handshake::{self, receipt_path};
use interscale_core::{CancelToken, CleanupOutcome, Clock, HandshakeError, HandshakeRecord, WaitOptions};
use parking_lot::Mutex;
use std::thread;
use std::time::Duration;

/// Clock that only advances when somebody sleeps on it.
#[derive(Default)]
struct ManualClock {
    now: Mutex<Duration>,
    sleeps: Mutex<u32>,
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock() += duration;
        *self.sleeps.lock() += 1;
    }
}

fn fast() -> WaitOptions {
    WaitOptions::default().with_poll_interval(Duration::from_millis(5))
}

#[test]
fn test_waiter_started_first_sees_complete_data() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nest/spike_generator.txt");

    // Large enough that a torn read would be visible.
    let payload: Vec<u8> = (0..2_000_000u32).map(|i| (i % 251) as u8).collect();

    let waiter = {
        let path = path.clone();
        thread::spawn(move || handshake::await_and_consume(&path, &fast().with_timeout(Some(Duration::from_secs(10)))))
    };

    thread::sleep(Duration::from_millis(30));
    handshake::publish(&path, &payload).unwrap();

    let read = waiter.join().unwrap().unwrap();
    assert_eq!(read.len(), payload.len());
    assert_eq!(read, payload);
}

#[test]
fn test_timeout_uses_injected_clock() {
    let dir = tempfile::tempdir().unwrap();
    let record = HandshakeRecord::new(dir.path().join("never.txt"));
    let clock = ManualClock::default();

    let options = WaitOptions::default().with_timeout(Some(Duration::from_secs(5)));
    let err = record.await_and_consume(&options, &clock).unwrap_err();

    match err {
        HandshakeError::Timeout { waited, .. } => assert_eq!(waited, Duration::from_secs(5)),
        other => panic!("unexpected {other:?}"),
    }
    // One second poll interval: five sleeps, no real time spent.
    assert_eq!(*clock.sleeps.lock(), 5);
}

#[test]
fn test_timeout_bounds_last_pause() {
    let dir = tempfile::tempdir().unwrap();
    let record = HandshakeRecord::new(dir.path().join("never.txt"));
    let clock = ManualClock::default();

    let options = WaitOptions::default().with_timeout(Some(Duration::from_millis(2500)));
    assert!(record.await_and_consume(&options, &clock).is_err());
    assert_eq!(clock.now(), Duration::from_millis(2500));
}

#[test]
fn test_cancelled_wait_returns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never.txt");
    let token = CancelToken::new();

    let waiter = {
        let path = path.clone();
        let options = fast().with_cancel(token.clone());
        thread::spawn(move || handshake::await_and_consume(&path, &options))
    };

    thread::sleep(Duration::from_millis(20));
    token.cancel();
    assert!(matches!(waiter.join().unwrap(), Err(HandshakeError::Cancelled(_))));
}

#[test]
fn test_await_consumed_after_marker_removal() {
    let dir = tempfile::tempdir().unwrap();
    let record = handshake::publish(dir.path().join("0.txt"), b"1.0\n").unwrap();

    let producer = {
        let record = record.clone();
        thread::spawn(move || record.await_consumed(&fast(), &interscale_core::SystemClock::new()))
    };

    thread::sleep(Duration::from_millis(20));
    assert_eq!(record.remove_marker().unwrap(), CleanupOutcome::Removed);
    producer.join().unwrap().unwrap();
}

#[test]
fn test_receipts_gate_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let record = handshake::publish(dir.path().join("table.txt"), b"5 2\n7 3\n").unwrap();
    let expected = [(0, "consumer"), (0, "producer"), (1, "consumer"), (1, "producer")];
    let clock = ManualClock::default();
    let bounded = WaitOptions::default().with_timeout(Some(Duration::from_secs(3)));

    record.record_receipt(0, "consumer").unwrap();
    record.record_receipt(0, "producer").unwrap();
    record.record_receipt(1, "consumer").unwrap();
    assert!(matches!(
        record.await_receipts(&expected, &bounded, &clock),
        Err(HandshakeError::Timeout { .. })
    ));

    record.record_receipt(1, "producer").unwrap();
    record.await_receipts(&expected, &bounded, &clock).unwrap();

    record.clear_receipts(&expected).unwrap();
    assert!(!receipt_path(record.data_path(), 1, "producer").exists());
    assert_eq!(record.remove_marker().unwrap(), CleanupOutcome::Removed);
    assert_eq!(record.remove_marker().unwrap(), CleanupOutcome::AlreadyRemoved);
}

#[test]
fn test_remove_reports_already_removed() {
    let dir = tempfile::tempdir().unwrap();
    let record = handshake::publish(dir.path().join("port.txt"), b"127.0.0.1:4000").unwrap();
    assert_eq!(record.remove().unwrap(), CleanupOutcome::Removed);
    assert!(!record.data_path().exists());
    assert_eq!(record.remove().unwrap(), CleanupOutcome::AlreadyRemoved);
}
