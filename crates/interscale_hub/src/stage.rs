//! # Pipeline Stages
//!
//! ```text
//!  UpstreamSource ──► Consumer ──link──► Transformer ──link──► Producer ──► DownstreamSink
//!                                         (Transform)
//! ```
//!
//! Every stage runs one blocking loop on its own execution unit and only
//! talks to its neighbours through `dyn Transport`. A failing stage sends
//! `Message::Error` downstream and closes its upstream, so every sibling
//! leaves its loop.

use std::fmt;

use interscale_core::Message;
use interscale_transport::Transport;

use crate::error::StageError;
use crate::sink::DownstreamSink;
use crate::source::UpstreamSource;
use crate::transform::Transform;

/// The three stage roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Pulls intervals from the upstream simulator.
    Consumer,
    /// Applies the transformation.
    Transformer,
    /// Pushes intervals to the downstream simulator.
    Producer,
}

impl StageKind {
    /// Every role in pipeline order.
    pub const ALL: [Self; 3] = [Self::Consumer, Self::Transformer, Self::Producer];

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Consumer => "consumer",
            Self::Transformer => "transformer",
            Self::Producer => "producer",
        }
    }

    /// Process mode rank of the role.
    #[must_use]
    pub const fn rank(self) -> usize {
        match self {
            Self::Producer => 0,
            Self::Consumer => 1,
            Self::Transformer => 2,
        }
    }

    /// Role of a process mode rank.
    #[must_use]
    pub const fn from_rank(rank: usize) -> Option<Self> {
        match rank {
            0 => Some(Self::Producer),
            1 => Some(Self::Consumer),
            2 => Some(Self::Transformer),
            _ => None,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a stage did before it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageReport {
    /// Stage role.
    pub stage: StageKind,
    /// Intervals handled.
    pub intervals: u64,
    /// Events emitted (sent or delivered).
    pub events: u64,
}

impl StageReport {
    fn new(stage: StageKind) -> Self {
        Self {
            stage,
            intervals: 0,
            events: 0,
        }
    }
}

/// Sends a failure downstream. The link may already be gone.
fn forward_failure(downstream: &mut dyn Transport, error: &StageError) {
    if let Err(e) = downstream.send(Message::Error(error.to_string())) {
        tracing::debug!(error = %e, "failure could not be forwarded");
    }
}

/// Pulls intervals from an [`UpstreamSource`] into the pipeline.
pub struct Consumer {
    source: Box<dyn UpstreamSource>,
    downstream: Box<dyn Transport>,
}

impl Consumer {
    /// Creates the stage.
    #[must_use]
    pub fn new(source: Box<dyn UpstreamSource>, downstream: Box<dyn Transport>) -> Self {
        Self { source, downstream }
    }

    /// Runs until the source ends or something fails.
    ///
    /// # Errors
    ///
    /// Returns the first [`StageError`].
    pub fn run(mut self) -> Result<StageReport, StageError> {
        let _span = tracing::info_span!("consumer", backend = self.downstream.backend()).entered();
        let result = self.pump();
        if let Err(error) = &result {
            tracing::error!(%error, "consumer failed");
            forward_failure(self.downstream.as_mut(), error);
        }
        self.source.close();
        self.downstream.close();
        result
    }

    fn pump(&mut self) -> Result<StageReport, StageError> {
        let mut report = StageReport::new(StageKind::Consumer);
        while let Some(buffer) = self.source.next_interval()? {
            tracing::debug!(index = buffer.interval.index, events = buffer.len(), "interval received");
            report.intervals += 1;
            report.events += buffer.len() as u64;
            self.downstream.send(Message::Interval(buffer))?;
        }
        self.downstream.send(Message::EndOfStream)?;
        tracing::info!(intervals = report.intervals, events = report.events, "consumer done");
        Ok(report)
    }
}

/// Converts intervals strictly in arrival order.
pub struct Transformer {
    transform: Box<dyn Transform>,
    upstream: Box<dyn Transport>,
    downstream: Box<dyn Transport>,
    last_index: Option<u64>,
}

impl Transformer {
    /// Creates the stage.
    #[must_use]
    pub fn new(transform: Box<dyn Transform>, upstream: Box<dyn Transport>, downstream: Box<dyn Transport>) -> Self {
        Self {
            transform,
            upstream,
            downstream,
            last_index: None,
        }
    }

    /// Runs until end of stream or a failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`StageError`], including
    /// [`StageError::OutOfOrder`] for a non-increasing interval index.
    pub fn run(mut self) -> Result<StageReport, StageError> {
        let _span = tracing::info_span!(
            "transformer",
            transform = self.transform.name(),
            backend = self.upstream.backend()
        )
        .entered();
        let result = self.pump();
        if let Err(error) = &result {
            tracing::error!(%error, "transformer failed");
            forward_failure(self.downstream.as_mut(), error);
        }
        self.upstream.close();
        self.downstream.close();
        result
    }

    fn pump(&mut self) -> Result<StageReport, StageError> {
        let mut report = StageReport::new(StageKind::Transformer);
        loop {
            match self.upstream.receive()? {
                Message::Interval(buffer) => {
                    let index = buffer.interval.index;
                    if let Some(previous) = self.last_index {
                        if index <= previous {
                            return Err(StageError::OutOfOrder {
                                previous,
                                received: index,
                            });
                        }
                    }
                    self.last_index = Some(index);

                    let output = self.transform.transform(&buffer)?;
                    tracing::debug!(index, input = buffer.len(), output = output.len(), "interval transformed");
                    report.intervals += 1;
                    report.events += output.len() as u64;
                    self.downstream.send(Message::Interval(output))?;
                }
                Message::EndOfStream => {
                    self.downstream.send(Message::EndOfStream)?;
                    tracing::info!(intervals = report.intervals, "transformer done");
                    return Ok(report);
                }
                Message::Error(reason) => return Err(StageError::Upstream(reason)),
            }
        }
    }
}

/// Delivers intervals to a [`DownstreamSink`].
pub struct Producer {
    upstream: Box<dyn Transport>,
    sink: Box<dyn DownstreamSink>,
}

impl Producer {
    /// Creates the stage.
    #[must_use]
    pub fn new(upstream: Box<dyn Transport>, sink: Box<dyn DownstreamSink>) -> Self {
        Self { upstream, sink }
    }

    /// Runs until end of stream or a failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`StageError`].
    pub fn run(mut self) -> Result<StageReport, StageError> {
        let _span = tracing::info_span!("producer", backend = self.upstream.backend()).entered();
        let result = self.pump();
        if let Err(error) = &result {
            tracing::error!(%error, "producer failed");
        }
        self.upstream.close();
        result
    }

    fn pump(&mut self) -> Result<StageReport, StageError> {
        let mut report = StageReport::new(StageKind::Producer);
        loop {
            match self.upstream.receive()? {
                Message::Interval(buffer) => {
                    self.sink.deliver(&buffer)?;
                    report.intervals += 1;
                    report.events += buffer.len() as u64;
                }
                Message::EndOfStream => {
                    self.sink.finish()?;
                    tracing::info!(intervals = report.intervals, events = report.events, "producer done");
                    return Ok(report);
                }
                Message::Error(reason) => return Err(StageError::Upstream(reason)),
            }
        }
    }
}
