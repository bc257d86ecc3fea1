//! # Double Buffer
//!
//! Single-slot hand-off between exactly one writer thread and exactly one
//! reader thread.
//!
//! ## Architecture
//!
//! ```text
//!                  ┌───────────────────────────────────┐
//!                  │           DoubleBuffer            │
//!                  │                                   │
//!   write() ──────►│  Mutex<Slot>   ┌───────────────┐  │──────► read()
//!   finish()       │  ├ status      │ Atomic status │  │
//!   abort()        │  ├ interval    │ (lock-free    │  │
//!                  │  └ events      │  peek)        │  │
//!                  │  Condvar       └───────────────┘  │
//!                  └───────────────────────────────────┘
//! ```
//!
//! ## Status Machine
//!
//! ```text
//!   writer:  Empty ──► Filling ──► Ready
//!   reader:  Ready ──► Reading ──► Empty
//!   writer:  Empty ──► EndOfStream            (graceful shutdown)
//!   anyone:  (not terminal) ──► Error         (pipeline failure)
//! ```
//!
//! The payload is moved out of the slot while `Filling`/`Reading` so the
//! copy happens without holding the lock. The status guarantees nobody
//! else touches the slot in the meantime.
//!
//! The slot's event storage grows to the largest interval seen and never
//! shrinks, so steady-state hand-offs do not reallocate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::buffer::{Event, Interval, Message, SynchronizationBuffer};

/// Status flag attached to the slot.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferStatus {
    /// Nothing to read, the writer may fill the slot.
    Empty = 0,
    /// The writer is copying an interval in.
    Filling = 1,
    /// An interval is waiting for the reader.
    Ready = 2,
    /// The reader is copying the interval out.
    Reading = 3,
    /// No more intervals will be written.
    EndOfStream = 4,
    /// The pipeline failed.
    Error = 5,
}

impl BufferStatus {
    /// Converts from the raw flag value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Empty),
            1 => Some(Self::Filling),
            2 => Some(Self::Ready),
            3 => Some(Self::Reading),
            4 => Some(Self::EndOfStream),
            5 => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns true for `EndOfStream` and `Error`.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::EndOfStream | Self::Error)
    }

    /// Returns true if `self -> to` is a legal transition.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Empty, Self::Filling | Self::EndOfStream)
                | (Self::Filling, Self::Ready)
                | (Self::Ready, Self::Reading)
                | (Self::Reading, Self::Empty)
                | (
                    Self::Empty | Self::Filling | Self::Ready | Self::Reading,
                    Self::Error
                )
        )
    }
}

/// Errors returned to a writer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The slot reached a terminal status, nothing more can be written.
    #[error("double buffer closed ({0:?})")]
    Closed(BufferStatus),
}

struct Slot {
    status: BufferStatus,
    interval: Interval,
    events: Vec<Event>,
    error: Option<String>,
    high_water: usize,
}

/// Single-producer / single-consumer hand-off slot.
///
/// ## Usage
///
/// ```rust,ignore
/// let slot = Arc::new(DoubleBuffer::with_capacity(4096));
///
/// // Writer thread
/// slot.write(&buffer)?;      // blocks until the slot is Empty
/// slot.finish()?;            // EndOfStream once the last interval was read
///
/// // Reader thread
/// loop {
///     match slot.read() {
///         Message::Interval(buffer) => process(buffer),
///         Message::EndOfStream => break,
///         Message::Error(reason) => return Err(reason),
///     }
/// }
/// ```
pub struct DoubleBuffer {
    slot: Mutex<Slot>,
    changed: Condvar,
    /// `transitions << 8 | status`, only written under the lock.
    state: AtomicU64,
    handoffs: AtomicU64,
}

impl DoubleBuffer {
    /// Creates a slot with storage preallocated for `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slot: Mutex::new(Slot {
                status: BufferStatus::Empty,
                interval: Interval::default(),
                events: Vec::with_capacity(capacity),
                error: None,
                high_water: 0,
            }),
            changed: Condvar::new(),
            state: AtomicU64::new(BufferStatus::Empty as u64),
            handoffs: AtomicU64::new(0),
        }
    }

    /// Current status, read without taking the lock.
    #[inline]
    #[must_use]
    pub fn status(&self) -> BufferStatus {
        self.snapshot().1
    }

    /// Number of status transitions so far and the current status, read
    /// together without taking the lock.
    ///
    /// Two snapshots whose counts differ by one bracket exactly one
    /// transition.
    #[must_use]
    pub fn snapshot(&self) -> (u64, BufferStatus) {
        let state = self.state.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let status = BufferStatus::from_u8(state as u8).unwrap_or(BufferStatus::Error);
        (state >> 8, status)
    }

    /// Number of intervals handed from writer to reader so far.
    #[inline]
    #[must_use]
    pub fn handoffs(&self) -> u64 {
        self.handoffs.load(Ordering::Relaxed)
    }

    /// Event capacity of the slot storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slot.lock().events.capacity()
    }

    /// Largest interval (in events) written so far.
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.slot.lock().high_water
    }

    fn transition(&self, slot: &mut Slot, to: BufferStatus) {
        debug_assert!(
            slot.status.can_transition(to),
            "illegal double buffer transition {:?} -> {:?}",
            slot.status,
            to
        );
        slot.status = to;
        let transitions = (self.state.load(Ordering::Relaxed) >> 8) + 1;
        self.state.store((transitions << 8) | to as u64, Ordering::Release);
    }

    /// Writes one interval.
    ///
    /// Blocks while the previous interval has not been read.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Closed`] if the slot reached a terminal status.
    pub fn write(&self, buffer: &SynchronizationBuffer) -> Result<(), BufferError> {
        let mut storage = {
            let mut slot = self.slot.lock();
            loop {
                let status = slot.status;
                match status {
                    BufferStatus::Empty => break,
                    status if status.is_terminal() => return Err(BufferError::Closed(status)),
                    _ => self.changed.wait(&mut slot),
                }
            }
            self.transition(&mut slot, BufferStatus::Filling);
            std::mem::take(&mut slot.events)
        };

        storage.clear();
        storage.extend_from_slice(&buffer.events);

        let mut slot = self.slot.lock();
        slot.events = storage;
        slot.interval = buffer.interval;
        slot.high_water = slot.high_water.max(buffer.events.len());
        if slot.status == BufferStatus::Error {
            // Aborted while filling.
            return Err(BufferError::Closed(BufferStatus::Error));
        }
        self.transition(&mut slot, BufferStatus::Ready);
        drop(slot);
        self.changed.notify_all();
        Ok(())
    }

    /// Reads one interval, blocking until one is ready or the slot closes.
    ///
    /// A terminal status is sticky: once `EndOfStream` or `Error` is
    /// observed every further call returns it without blocking.
    pub fn read(&self) -> Message {
        self.read_inner(None).unwrap_or(Message::EndOfStream)
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    ///
    /// Returns `None` if nothing became readable in time.
    pub fn read_timeout(&self, timeout: Duration) -> Option<Message> {
        self.read_inner(Some(timeout))
    }

    fn read_inner(&self, timeout: Option<Duration>) -> Option<Message> {
        let (interval, storage) = {
            let mut slot = self.slot.lock();
            loop {
                let status = slot.status;
                match status {
                    BufferStatus::Ready => break,
                    BufferStatus::EndOfStream => return Some(Message::EndOfStream),
                    BufferStatus::Error => {
                        return Some(Message::Error(slot.error.clone().unwrap_or_default()));
                    }
                    _ => match timeout {
                        Some(timeout) => {
                            if self.changed.wait_for(&mut slot, timeout).timed_out()
                                && !matches!(
                                    slot.status,
                                    BufferStatus::Ready | BufferStatus::EndOfStream | BufferStatus::Error
                                )
                            {
                                return None;
                            }
                        }
                        None => self.changed.wait(&mut slot),
                    },
                }
            }
            self.transition(&mut slot, BufferStatus::Reading);
            (slot.interval, std::mem::take(&mut slot.events))
        };

        let events = storage.to_vec();

        let mut slot = self.slot.lock();
        slot.events = storage;
        if slot.status == BufferStatus::Reading {
            self.transition(&mut slot, BufferStatus::Empty);
        }
        self.handoffs.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        self.changed.notify_all();

        Some(Message::Interval(SynchronizationBuffer::with_events(interval, events)))
    }

    /// Signals end of stream.
    ///
    /// Waits until the last interval has been read so nothing is lost.
    /// Calling it again after a successful call is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::Closed`] if the slot was aborted.
    pub fn finish(&self) -> Result<(), BufferError> {
        let mut slot = self.slot.lock();
        loop {
            let status = slot.status;
            match status {
                BufferStatus::Empty => break,
                BufferStatus::EndOfStream => return Ok(()),
                BufferStatus::Error => return Err(BufferError::Closed(BufferStatus::Error)),
                _ => self.changed.wait(&mut slot),
            }
        }
        self.transition(&mut slot, BufferStatus::EndOfStream);
        drop(slot);
        self.changed.notify_all();
        Ok(())
    }

    /// Marks the slot failed and wakes every waiter.
    ///
    /// Returns false if the slot was already terminal.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let mut slot = self.slot.lock();
        if slot.status.is_terminal() {
            return false;
        }
        slot.error = Some(reason.into());
        self.transition(&mut slot, BufferStatus::Error);
        drop(slot);
        self.changed.notify_all();
        true
    }
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl std::fmt::Debug for DoubleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleBuffer")
            .field("status", &self.status())
            .field("handoffs", &self.handoffs())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Event;
    use std::sync::Arc;
    use std::thread;

    fn interval(index: u64, events: usize) -> SynchronizationBuffer {
        let events = (0..events)
            .map(|i| Event::new(i as f64, index, 1.0))
            .collect();
        SynchronizationBuffer::with_events(Interval::new(index, 0.0, 1.0), events)
    }

    #[test]
    fn test_write_then_read() {
        let slot = DoubleBuffer::with_capacity(8);
        assert_eq!(slot.status(), BufferStatus::Empty);

        slot.write(&interval(0, 3)).unwrap();
        assert_eq!(slot.status(), BufferStatus::Ready);

        match slot.read() {
            Message::Interval(buffer) => assert_eq!(buffer, interval(0, 3)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(slot.status(), BufferStatus::Empty);
        assert_eq!(slot.handoffs(), 1);
        // Filling, Ready, Reading, Empty
        assert_eq!(slot.snapshot(), (4, BufferStatus::Empty));
    }

    #[test]
    fn test_read_on_empty_times_out() {
        let slot = DoubleBuffer::with_capacity(0);
        assert!(slot.read_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(slot.status(), BufferStatus::Empty);
    }

    #[test]
    fn test_capacity_grows_never_shrinks() {
        let slot = DoubleBuffer::with_capacity(4);
        slot.write(&interval(0, 100)).unwrap();
        let _ = slot.read();
        let grown = slot.capacity();
        assert!(grown >= 100);

        slot.write(&interval(1, 2)).unwrap();
        let _ = slot.read();
        assert_eq!(slot.capacity(), grown);
        assert_eq!(slot.high_water(), 100);
    }

    #[test]
    fn test_end_of_stream_is_sticky() {
        let slot = DoubleBuffer::with_capacity(0);
        slot.finish().unwrap();
        slot.finish().unwrap();
        assert_eq!(slot.read(), Message::EndOfStream);
        assert_eq!(slot.read(), Message::EndOfStream);
        assert_eq!(
            slot.write(&interval(0, 1)),
            Err(BufferError::Closed(BufferStatus::EndOfStream))
        );
    }

    #[test]
    fn test_finish_waits_for_pending_read() {
        let slot = Arc::new(DoubleBuffer::with_capacity(0));
        slot.write(&interval(0, 1)).unwrap();

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.finish())
        };

        // The pending interval is still delivered before end of stream.
        assert!(matches!(slot.read(), Message::Interval(_)));
        writer.join().unwrap().unwrap();
        assert_eq!(slot.read(), Message::EndOfStream);
    }

    #[test]
    fn test_abort_wakes_blocked_writer() {
        let slot = Arc::new(DoubleBuffer::with_capacity(0));
        slot.write(&interval(0, 1)).unwrap();

        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.write(&interval(1, 1)))
        };

        thread::sleep(Duration::from_millis(20));
        assert!(slot.abort("reader gone"));
        assert!(!slot.abort("twice"));

        assert_eq!(
            writer.join().unwrap(),
            Err(BufferError::Closed(BufferStatus::Error))
        );
        assert_eq!(slot.read(), Message::Error("reader gone".into()));
    }

    #[test]
    fn test_transition_table() {
        use BufferStatus::*;
        assert!(Empty.can_transition(Filling));
        assert!(Filling.can_transition(Ready));
        assert!(Ready.can_transition(Reading));
        assert!(Reading.can_transition(Empty));
        assert!(Empty.can_transition(EndOfStream));

        assert!(!Ready.can_transition(Filling));
        assert!(!Empty.can_transition(Reading));
        assert!(!EndOfStream.can_transition(Error));
        assert!(!Error.can_transition(Empty));
    }
}
