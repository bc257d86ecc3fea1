//! # Upstream Sources
//!
//! Where the Consumer stage gets its intervals from.
//!
//! ```text
//! SocketSource      one published endpoint per region/detector, the
//!                   simulator connects and streams wire frames
//! SimulatorSource   drives an in-process Simulator for N intervals
//! FeedbackSource    outputs of the simulator behind a SimulatorSink
//! MemorySource      pre-built intervals
//! ```

use std::collections::VecDeque;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::path::PathBuf;

use crossbeam_channel::Receiver;
use interscale_core::{Message, SynchronizationBuffer, SystemClock, WaitOptions};
use interscale_transport::wire::{read_message, write_message};
use interscale_transport::{connect_published, PublishedListener};

use crate::error::EndpointError;

/// Supplies the Consumer stage with intervals.
pub trait UpstreamSource: Send {
    /// Next interval, or `None` once the upstream ended.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] if the upstream failed.
    fn next_interval(&mut self) -> Result<Option<SynchronizationBuffer>, EndpointError>;

    /// Releases the upstream. Called once the stage stops, also on failure.
    fn close(&mut self) {}
}

/// The exchange contract of an external simulator.
///
/// One call advances the simulator by one synchronization interval,
/// feeding it the interval's input (none at t0) and returning its output.
pub trait Simulator: Send {
    /// Runs one synchronization interval.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Simulator`] if the simulation failed.
    fn run_for_synchronization_time(
        &mut self,
        input: Option<&SynchronizationBuffer>,
    ) -> Result<Option<SynchronizationBuffer>, EndpointError>;
}

/// Intervals prepared up front.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    intervals: VecDeque<SynchronizationBuffer>,
}

impl MemorySource {
    /// Source yielding `intervals` in order.
    #[must_use]
    pub fn new(intervals: impl IntoIterator<Item = SynchronizationBuffer>) -> Self {
        Self {
            intervals: intervals.into_iter().collect(),
        }
    }
}

impl UpstreamSource for MemorySource {
    fn next_interval(&mut self) -> Result<Option<SynchronizationBuffer>, EndpointError> {
        Ok(self.intervals.pop_front())
    }
}

/// Drives a [`Simulator`] as the upstream side.
pub struct SimulatorSource {
    simulator: Box<dyn Simulator>,
    remaining: u64,
}

impl SimulatorSource {
    /// Runs `simulator` for at most `intervals` intervals.
    #[must_use]
    pub fn new(simulator: Box<dyn Simulator>, intervals: u64) -> Self {
        Self {
            simulator,
            remaining: intervals,
        }
    }
}

impl UpstreamSource for SimulatorSource {
    fn next_interval(&mut self) -> Result<Option<SynchronizationBuffer>, EndpointError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        match self.simulator.run_for_synchronization_time(None)? {
            Some(buffer) => {
                self.remaining -= 1;
                Ok(Some(buffer))
            }
            None => {
                self.remaining = 0;
                Ok(None)
            }
        }
    }
}

/// Outputs of the simulator driven by a [`SimulatorSink`](crate::sink::SimulatorSink).
///
/// Blocks until the sink produced the next output. Ends once the sink
/// finished or was dropped and every queued output was read.
#[derive(Debug)]
pub struct FeedbackSource {
    receiver: Receiver<SynchronizationBuffer>,
}

impl FeedbackSource {
    pub(crate) fn new(receiver: Receiver<SynchronizationBuffer>) -> Self {
        Self { receiver }
    }
}

impl UpstreamSource for FeedbackSource {
    fn next_interval(&mut self) -> Result<Option<SynchronizationBuffer>, EndpointError> {
        Ok(self.receiver.recv().ok())
    }
}

/// How a socket endpoint's event ids are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdPolicy {
    /// Ids already name channels and are kept.
    Preserve,
    /// Every event is stamped with the endpoint's id (region streams).
    Stamp(u64),
}

/// One upstream endpoint record and its id policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Path of the endpoint record.
    pub path: PathBuf,
    /// Id policy.
    pub ids: IdPolicy,
}

struct Connection {
    reader: BufReader<TcpStream>,
    ids: IdPolicy,
}

/// Receives intervals from simulators connecting to published endpoints.
///
/// Every endpoint delivers one frame per interval. Frames of the same
/// interval are merged in endpoint order.
pub struct SocketSource {
    pending: Vec<(PublishedListener, IdPolicy)>,
    connections: Vec<Connection>,
    options: WaitOptions,
    finished: bool,
}

impl SocketSource {
    /// Binds and publishes every endpoint. Does not block.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Transport`] if binding or publishing fails.
    pub fn bind(endpoints: Vec<Endpoint>, options: WaitOptions) -> Result<Self, EndpointError> {
        let pending = endpoints
            .into_iter()
            .map(|endpoint| Ok((PublishedListener::bind(&endpoint.path)?, endpoint.ids)))
            .collect::<Result<Vec<_>, EndpointError>>()?;
        Ok(Self {
            pending,
            connections: Vec::new(),
            options,
            finished: false,
        })
    }

    /// Number of endpoints.
    #[must_use]
    pub fn endpoints(&self) -> usize {
        self.pending.len() + self.connections.len()
    }

    fn accept_all(&mut self) -> Result<(), EndpointError> {
        let clock = SystemClock::new();
        for (listener, ids) in self.pending.drain(..) {
            let stream = listener.accept(&self.options, &clock)?;
            self.connections.push(Connection {
                reader: BufReader::new(stream),
                ids,
            });
        }
        tracing::info!(endpoints = self.connections.len(), "upstream simulator connected");
        Ok(())
    }
}

impl UpstreamSource for SocketSource {
    fn next_interval(&mut self) -> Result<Option<SynchronizationBuffer>, EndpointError> {
        if self.finished {
            return Ok(None);
        }
        if !self.pending.is_empty() {
            self.accept_all()?;
        }

        let mut merged: Option<SynchronizationBuffer> = None;
        let mut ended: Option<usize> = None;
        for (endpoint, connection) in self.connections.iter_mut().enumerate() {
            let mut buffer = match read_message(&mut connection.reader)? {
                Some(Message::Interval(buffer)) => buffer,
                Some(Message::EndOfStream) | None => {
                    // All endpoints end on the same interval or none does.
                    if merged.is_some() {
                        self.finished = true;
                        return Err(EndpointError::UnevenEnd { endpoint });
                    }
                    ended.get_or_insert(endpoint);
                    continue;
                }
                Some(Message::Error(reason)) => return Err(EndpointError::Simulator(reason)),
            };
            if let Some(first) = ended {
                self.finished = true;
                return Err(EndpointError::UnevenEnd { endpoint: first });
            }
            if let IdPolicy::Stamp(id) = connection.ids {
                for event in &mut buffer.events {
                    event.id = id;
                }
            }
            match merged.as_mut() {
                None => merged = Some(buffer),
                Some(interval) => {
                    if interval.interval.index != buffer.interval.index {
                        return Err(EndpointError::Misaligned {
                            endpoint,
                            expected: interval.interval.index,
                            received: buffer.interval.index,
                        });
                    }
                    interval.events.extend_from_slice(&buffer.events);
                }
            }
        }
        if ended.is_some() {
            tracing::debug!("upstream end of stream");
            self.finished = true;
            return Ok(None);
        }
        Ok(merged)
    }

    fn close(&mut self) {
        for connection in &self.connections {
            let _ = connection.reader.get_ref().shutdown(Shutdown::Both);
        }
        self.finished = true;
    }
}

/// Simulator side of a [`SocketSource`] endpoint.
pub struct EndpointClient {
    writer: BufWriter<TcpStream>,
}

impl EndpointClient {
    /// Waits for the endpoint record at `path` and connects.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Transport`] if the record never appears or
    /// the connection fails.
    pub fn connect(path: &std::path::Path, options: &WaitOptions) -> Result<Self, EndpointError> {
        let stream = connect_published(path, options, &SystemClock::new())?;
        Ok(Self {
            writer: BufWriter::new(stream),
        })
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Wire`] if the socket fails.
    pub fn send(&mut self, message: &Message) -> Result<(), EndpointError> {
        write_message(&mut self.writer, message)?;
        self.writer.flush().map_err(interscale_transport::WireError::from)?;
        Ok(())
    }

    /// Sends end of stream and closes the connection.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn finish(mut self) -> Result<(), EndpointError> {
        self.send(&Message::EndOfStream)?;
        let _ = self.writer.get_ref().shutdown(Shutdown::Write);
        Ok(())
    }
}
