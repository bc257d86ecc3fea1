//! # Synchronization Buffers
//!
//! One synchronization interval's worth of data travelling from one
//! simulator to the other.
//!
//! ## Layout
//!
//! ```text
//! SynchronizationBuffer
//! ├── Interval  { index, start, end }     header
//! └── [Event]   { time, value, id } * N   payload (Pod, 24 bytes each)
//! ```
//!
//! Events are plain-old-data so a payload can be handed to a socket or a
//! shared slot as raw bytes without per-field encoding.

use bytemuck::{Pod, Zeroable};

/// A single numeric event.
///
/// For rate streams `id` is a region and `value` a rate in Hz.
/// For spike streams `id` is a channel and `value` the spike weight.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Event {
    /// Simulated time in milliseconds.
    pub time: f64,
    /// Event value (rate, weight, ...).
    pub value: f64,
    /// Region or channel identifier.
    pub id: u64,
}

impl Event {
    /// Creates an event.
    #[inline]
    #[must_use]
    pub const fn new(time: f64, id: u64, value: f64) -> Self {
        Self { time, value, id }
    }
}

/// Header of a synchronization buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Interval {
    /// Position of the interval in its pipeline, strictly increasing.
    pub index: u64,
    /// Simulated start time (ms, inclusive).
    pub start: f64,
    /// Simulated end time (ms, exclusive).
    pub end: f64,
}

impl Interval {
    /// Creates an interval header.
    #[inline]
    #[must_use]
    pub const fn new(index: u64, start: f64, end: f64) -> Self {
        Self { index, start, end }
    }

    /// Length of the interval in milliseconds.
    #[inline]
    #[must_use]
    pub fn length(&self) -> f64 {
        self.end - self.start
    }
}

/// One interval's worth of events.
///
/// Owned by exactly one stage at a time. Ownership moves at the transport
/// hand-off, the buffer is never mutated by two stages concurrently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SynchronizationBuffer {
    /// Interval header.
    pub interval: Interval,
    /// Ordered events of the interval.
    pub events: Vec<Event>,
}

impl SynchronizationBuffer {
    /// Creates an empty buffer for an interval.
    #[must_use]
    pub fn new(interval: Interval) -> Self {
        Self {
            interval,
            events: Vec::new(),
        }
    }

    /// Creates a buffer from existing events.
    #[must_use]
    pub fn with_events(interval: Interval, events: Vec<Event>) -> Self {
        Self { interval, events }
    }

    /// Number of events in the buffer.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns true if the interval carries no events.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Raw byte view of the payload.
    #[inline]
    #[must_use]
    pub fn payload_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.events)
    }

    /// Iterates over the events carrying the given identifier.
    pub fn events_for(&self, id: u64) -> impl Iterator<Item = &Event> + '_ {
        self.events.iter().filter(move |e| e.id == id)
    }
}

/// What a transport carries between two stages.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// One interval of data.
    Interval(SynchronizationBuffer),
    /// Graceful shutdown: no more intervals will follow.
    EndOfStream,
    /// The upstream failed; the pipeline is considered failed.
    Error(String),
}

impl Message {
    /// Returns true for `EndOfStream` and `Error`.
    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Interval(_))
    }
}
