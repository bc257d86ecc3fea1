//! # Downstream Sinks
//!
//! Where the Producer stage delivers transformed intervals.
//!
//! ## Channel Files
//!
//! ```text
//! interval N ──► <dir>/<id>.txt  (atomic rewrite)  ──► <dir>/<id>.txt.unlock
//!                      ▲                                       │
//!                      └──── interval N+1 waits until the ─────┘
//!                            downstream removed the marker
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use interscale_core::{Event, HandshakeRecord, SynchronizationBuffer, SystemClock, WaitOptions};
use parking_lot::Mutex;

use crate::error::EndpointError;
use crate::source::{FeedbackSource, Simulator};

/// Receives transformed intervals from the Producer stage.
pub trait DownstreamSink: Send {
    /// Delivers one interval.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the downstream cannot take it.
    fn deliver(&mut self, buffer: &SynchronizationBuffer) -> Result<(), EndpointError>;

    /// Called once after the last interval.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the downstream cannot be finalized.
    fn finish(&mut self) -> Result<(), EndpointError> {
        Ok(())
    }
}

/// Line format of a channel file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelFileFormat {
    /// One spike time per line.
    SpikeTimes,
    /// `time value` per line.
    Rates,
}

/// One file per channel id, published through the handshake.
#[derive(Debug)]
pub struct ChannelFileSink {
    dir: PathBuf,
    ids: Vec<u64>,
    format: ChannelFileFormat,
    options: WaitOptions,
    delivered: u64,
}

impl ChannelFileSink {
    /// Sink writing `<dir>/<id>.txt` for every id in `ids`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ids: Vec<u64>, format: ChannelFileFormat, options: WaitOptions) -> Self {
        Self {
            dir: dir.into(),
            ids,
            format,
            options,
            delivered: 0,
        }
    }

    /// Path of the file for `id`.
    #[must_use]
    pub fn channel_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.txt"))
    }

    fn render(&self, events: &[&Event]) -> String {
        let mut text = String::with_capacity(events.len() * 16);
        for event in events {
            // Writing into a String cannot fail.
            let _ = match self.format {
                ChannelFileFormat::SpikeTimes => writeln!(text, "{}", event.time),
                ChannelFileFormat::Rates => writeln!(text, "{} {}", event.time, event.value),
            };
        }
        text
    }
}

impl DownstreamSink for ChannelFileSink {
    fn deliver(&mut self, buffer: &SynchronizationBuffer) -> Result<(), EndpointError> {
        let mut by_id: BTreeMap<u64, Vec<&Event>> = self.ids.iter().map(|id| (*id, Vec::new())).collect();
        let mut unknown = 0usize;
        for event in &buffer.events {
            match by_id.get_mut(&event.id) {
                Some(events) => events.push(event),
                None => unknown += 1,
            }
        }
        if unknown > 0 {
            tracing::warn!(index = buffer.interval.index, unknown, "events for unmapped ids dropped");
        }

        let clock = SystemClock::new();
        for (id, events) in &by_id {
            let record = HandshakeRecord::new(self.channel_path(*id));
            if self.delivered > 0 {
                record.await_consumed(&self.options, &clock)?;
            }
            record.publish(self.render(events).as_bytes())?;
        }

        self.delivered += 1;
        tracing::debug!(
            index = buffer.interval.index,
            files = by_id.len(),
            events = buffer.len(),
            "channel files published"
        );
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EndpointError> {
        tracing::info!(dir = %self.dir.display(), intervals = self.delivered, "channel files complete");
        Ok(())
    }
}

/// Shared view of what a [`MemorySink`] received.
#[derive(Clone, Debug, Default)]
pub struct MemorySinkHandle {
    delivered: Arc<Mutex<Vec<SynchronizationBuffer>>>,
    finished: Arc<AtomicBool>,
}

impl MemorySinkHandle {
    /// Copy of every delivered interval.
    #[must_use]
    pub fn delivered(&self) -> Vec<SynchronizationBuffer> {
        self.delivered.lock().clone()
    }

    /// Returns true once the sink was finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Records delivered intervals in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    handle: MemorySinkHandle,
}

impl MemorySink {
    /// Creates a sink and the handle to inspect it.
    #[must_use]
    pub fn new() -> (Self, MemorySinkHandle) {
        let sink = Self::default();
        let handle = sink.handle.clone();
        (sink, handle)
    }
}

impl DownstreamSink for MemorySink {
    fn deliver(&mut self, buffer: &SynchronizationBuffer) -> Result<(), EndpointError> {
        self.handle.delivered.lock().push(buffer.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EndpointError> {
        self.handle.finished.store(true, Ordering::Release);
        Ok(())
    }
}

/// Feeds every interval to a [`Simulator`] as its input.
///
/// What the simulator produces for that interval is queued for the
/// pipeline of the opposite direction, which reads it through the
/// [`FeedbackSource`] returned alongside the sink.
pub struct SimulatorSink {
    simulator: Box<dyn Simulator>,
    output: Option<Sender<SynchronizationBuffer>>,
}

impl SimulatorSink {
    /// Wraps the downstream simulator and returns the source of its outputs.
    #[must_use]
    pub fn new(simulator: Box<dyn Simulator>) -> (Self, FeedbackSource) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let sink = Self {
            simulator,
            output: Some(sender),
        };
        (sink, FeedbackSource::new(receiver))
    }
}

impl DownstreamSink for SimulatorSink {
    fn deliver(&mut self, buffer: &SynchronizationBuffer) -> Result<(), EndpointError> {
        let Some(output) = self.simulator.run_for_synchronization_time(Some(buffer))? else {
            return Ok(());
        };
        let unread = self
            .output
            .as_ref()
            .is_some_and(|sender| sender.send(output).is_err());
        if unread {
            tracing::debug!(index = buffer.interval.index, "feedback source gone, simulator output dropped");
            self.output = None;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EndpointError> {
        // Closing the queue ends the feedback source once it is drained.
        self.output = None;
        Ok(())
    }
}
