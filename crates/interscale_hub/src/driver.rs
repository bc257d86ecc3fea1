//! # Pipeline Driver
//!
//! Composes Consumer, Transformer and Producer for one direction.
//!
//! ## Thread Mode (1 execution unit)
//!
//! ```text
//!            ThreadTransport                ThreadTransport
//! [consumer] ───────────────► [transformer] ───────────────► [producer]
//!     │                             │                             │
//!     └────────── StageReport over crossbeam channel ─────────────┴──► driver joins all
//! ```
//!
//! ## Process Mode (3 execution units)
//!
//! ```text
//! rank 1 consumer ──link 1_to_2──► rank 2 transformer ──link 2_to_0──► rank 0 producer
//! ```
//!
//! Each rank runs its single stage on the calling thread. Links are
//! loopback sockets whose endpoints are published in
//! `transformation/internal/`.
//!
//! ## Channel Table Ownership
//!
//! Every execution unit reads the channel table and leaves a receipt per
//! instance and role it serves. The unit running the Consumer for
//! instance 0 owns the marker: at teardown it waits for every receipt,
//! then removes the marker and the receipts.

use std::thread;

use crossbeam_channel::bounded;
use interscale_core::{
    CancelToken, ChannelTable, CleanupOutcome, HandshakeError, HandshakeRecord, IdentifierMapping,
    SystemClock, WaitOptions,
};
use interscale_transport::{ProcessTransport, ThreadTransport, Transport};

use crate::error::{ConfigError, HubError, HubResult, StageError};
use crate::layout::{Direction, RunLayout};
use crate::parameters::Parameters;
use crate::sink::{ChannelFileFormat, ChannelFileSink, DownstreamSink};
use crate::source::{Endpoint, IdPolicy, SocketSource, UpstreamSource};
use crate::stage::{Consumer, Producer, StageKind, StageReport, Transformer};
use crate::topology::{ExecutionMode, Topology};
use crate::transform::{RateToSpike, SpikeToRate, Transform};

/// Which channel table rows a pipeline serves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TransformerSelection {
    /// Every row.
    #[default]
    All,
    /// One row.
    Instance(usize),
}

impl TransformerSelection {
    /// Label used in link and log names.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::All => "all".to_string(),
            Self::Instance(i) => i.to_string(),
        }
    }

    /// Instances served out of `rows`.
    #[must_use]
    pub fn instances(&self, rows: usize) -> Vec<usize> {
        match self {
            Self::All => (0..rows).collect(),
            Self::Instance(i) => vec![*i],
        }
    }
}

/// Outcome of a successful run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSummary {
    /// Direction of the pipeline.
    pub direction: Direction,
    /// Reports of the stages run by this execution unit.
    pub reports: Vec<StageReport>,
    /// Marker cleanup, if this unit owns the marker.
    pub marker: Option<CleanupOutcome>,
}

impl PipelineSummary {
    /// Report of one stage, if it ran here.
    #[must_use]
    pub fn report(&self, stage: StageKind) -> Option<&StageReport> {
        self.reports.iter().find(|r| r.stage == stage)
    }
}

/// Configures a [`PipelineDriver`].
///
/// Injected pieces replace the run layout defaults. Only the pieces the
/// local execution unit needs are used.
pub struct PipelineBuilder {
    layout: RunLayout,
    direction: Direction,
    parameters: Parameters,
    topology: Topology,
    selection: TransformerSelection,
    source: Option<Box<dyn UpstreamSource>>,
    transform: Option<Box<dyn Transform>>,
    sink: Option<Box<dyn DownstreamSink>>,
    cancel: CancelToken,
}

impl PipelineBuilder {
    /// Starts a builder for `direction` in the run at `layout`.
    #[must_use]
    pub fn new(layout: RunLayout, direction: Direction, parameters: Parameters) -> Self {
        Self {
            layout,
            direction,
            parameters,
            topology: Topology::single(),
            selection: TransformerSelection::All,
            source: None,
            transform: None,
            sink: None,
            cancel: CancelToken::new(),
        }
    }

    /// Sets the execution topology.
    #[must_use]
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Sets the served table rows.
    #[must_use]
    pub fn selection(mut self, selection: TransformerSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Replaces the upstream source.
    #[must_use]
    pub fn source(mut self, source: Box<dyn UpstreamSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the transformation.
    #[must_use]
    pub fn transform(mut self, transform: Box<dyn Transform>) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Replaces the downstream sink.
    #[must_use]
    pub fn sink(mut self, sink: Box<dyn DownstreamSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Token that aborts every handshake wait of the run.
    #[must_use]
    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validates the configuration. Opens no link.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Config`] for an unsupported topology or an
    /// instance without a region, and [`HubError::Io`] if the run
    /// directories cannot be created.
    pub fn build(self) -> HubResult<PipelineDriver> {
        let mode = self.topology.mode()?;
        if let TransformerSelection::Instance(instance) = self.selection {
            if instance >= self.parameters.id_nest_region.len() {
                return Err(ConfigError::Parameter {
                    name: "transformer",
                    reason: format!(
                        "instance {instance} has no entry in id_nest_region ({} regions)",
                        self.parameters.id_nest_region.len()
                    ),
                }
                .into());
            }
        }
        self.layout.create_dirs()?;

        let options = self
            .parameters
            .interscale_hub
            .wait_options()
            .with_cancel(self.cancel.clone());
        Ok(PipelineDriver {
            mode,
            options,
            builder: self,
        })
    }
}

/// Runs one pipeline on this execution unit.
pub struct PipelineDriver {
    mode: ExecutionMode,
    options: WaitOptions,
    builder: PipelineBuilder,
}

impl PipelineDriver {
    /// Execution mode chosen from the topology.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Instance label used in names.
    #[must_use]
    pub fn instance_label(&self) -> String {
        self.builder.selection.label()
    }

    fn local_roles(&self) -> Vec<StageKind> {
        match (self.mode, self.builder.topology.role()) {
            (ExecutionMode::Process, Some(role)) => vec![role],
            _ => StageKind::ALL.to_vec(),
        }
    }

    /// Reads the channel table, runs the local stages and cleans up.
    ///
    /// # Errors
    ///
    /// Returns the first failure: handshake, table, link setup or stage.
    pub fn run(mut self) -> HubResult<PipelineSummary> {
        let direction = self.builder.direction;
        let _span = tracing::info_span!(
            "pipeline",
            %direction,
            instance = %self.instance_label(),
            rank = self.builder.topology.rank
        )
        .entered();

        let clock = SystemClock::new();
        let record = HandshakeRecord::new(self.builder.layout.channel_table(direction));
        let data = record.await_and_consume(&self.options, &clock)?;
        let table = ChannelTable::parse(&String::from_utf8_lossy(&data))?;
        let regions = &self.builder.parameters.id_nest_region;
        let mapping = match self.builder.selection {
            TransformerSelection::All => IdentifierMapping::all(&table, regions)?,
            TransformerSelection::Instance(i) => IdentifierMapping::instance(&table, regions, i)?,
        };
        tracing::info!(rows = table.len(), channels = table.total_channels(), "channel table loaded");

        let instances = self.builder.selection.instances(table.len());
        let roles = self.local_roles();
        for instance in &instances {
            for role in &roles {
                record.record_receipt(*instance, role.as_str())?;
            }
        }

        let result = match self.mode {
            ExecutionMode::Thread => self.run_threads(&mapping),
            ExecutionMode::Process => self.run_rank(&mapping),
        };

        let owner = instances.contains(&0) && roles.contains(&StageKind::Consumer);
        let marker = if owner {
            self.cleanup(&record, table.len())
        } else {
            None
        };

        let reports = result?;
        for report in &reports {
            tracing::info!(stage = %report.stage, intervals = report.intervals, events = report.events, "stage finished");
        }
        Ok(PipelineSummary {
            direction,
            reports,
            marker,
        })
    }

    fn cleanup(&self, record: &HandshakeRecord, rows: usize) -> Option<CleanupOutcome> {
        let expected: Vec<(usize, &str)> = (0..rows)
            .flat_map(|instance| StageKind::ALL.into_iter().map(move |role| (instance, role.as_str())))
            .collect();
        let options = self.builder.parameters.interscale_hub.cleanup_options();
        let outcome = record
            .await_receipts(&expected, &options, &SystemClock::new())
            .and_then(|()| {
                let outcome = record.remove_marker()?;
                record.clear_receipts(&expected)?;
                Ok(outcome)
            });
        match outcome {
            Ok(outcome) => {
                tracing::info!(marker = %record.marker_path().display(), ?outcome, "channel table marker cleaned up");
                Some(outcome)
            }
            Err(HandshakeError::Timeout { waited, .. }) => {
                tracing::warn!(?waited, "not every reader confirmed the channel table, marker left in place");
                None
            }
            Err(error) => {
                tracing::warn!(%error, "channel table cleanup failed");
                None
            }
        }
    }

    fn take_source(&mut self, mapping: &IdentifierMapping) -> HubResult<Box<dyn UpstreamSource>> {
        if let Some(source) = self.builder.source.take() {
            return Ok(source);
        }
        let layout = &self.builder.layout;
        let direction = self.builder.direction;
        let endpoints: Vec<Endpoint> = match direction {
            Direction::TvbToNest => mapping
                .regions()
                .map(|region| Endpoint {
                    path: layout.upstream_endpoint(direction, region),
                    ids: IdPolicy::Stamp(region),
                })
                .collect(),
            Direction::NestToTvb => mapping
                .entries()
                .iter()
                .map(|(_, range)| Endpoint {
                    path: layout.upstream_endpoint(direction, range.first),
                    ids: IdPolicy::Preserve,
                })
                .collect(),
        };
        let source = SocketSource::bind(endpoints, self.options.clone()).map_err(|e| HubError::Stage {
            stage: StageKind::Consumer,
            source: e.into(),
        })?;
        Ok(Box::new(source))
    }

    fn take_transform(&mut self, mapping: &IdentifierMapping) -> HubResult<Box<dyn Transform>> {
        if let Some(transform) = self.builder.transform.take() {
            return Ok(transform);
        }
        let parameters = &self.builder.parameters;
        let transform: Box<dyn Transform> = match self.builder.direction {
            Direction::TvbToNest => Box::new(
                RateToSpike::new(
                    mapping.clone(),
                    parameters.tvb_to_nest.seed,
                    parameters.tvb_to_nest.rate_scale,
                )
                .map_err(invalid_transform)?,
            ),
            Direction::NestToTvb => Box::new(
                SpikeToRate::new(mapping.clone(), parameters.nest_to_tvb.width).map_err(invalid_transform)?,
            ),
        };
        Ok(transform)
    }

    fn take_sink(&mut self, mapping: &IdentifierMapping) -> Box<dyn DownstreamSink> {
        if let Some(sink) = self.builder.sink.take() {
            return sink;
        }
        let direction = self.builder.direction;
        let dir = self.builder.layout.downstream_dir(direction);
        let sink = match direction {
            Direction::TvbToNest => {
                ChannelFileSink::new(dir, mapping.channels().collect(), ChannelFileFormat::SpikeTimes, self.options.clone())
            }
            Direction::NestToTvb => {
                ChannelFileSink::new(dir, mapping.regions().collect(), ChannelFileFormat::Rates, self.options.clone())
            }
        };
        Box::new(sink)
    }

    fn run_threads(&mut self, mapping: &IdentifierMapping) -> HubResult<Vec<StageReport>> {
        let capacity = self.builder.parameters.interscale_hub.buffer_capacity;
        let (consumer_link, transformer_in) = ThreadTransport::pair(capacity);
        let (transformer_out, producer_link) = ThreadTransport::pair(capacity);

        let source = self.take_source(mapping)?;
        let transform = self.take_transform(mapping)?;
        let sink = self.take_sink(mapping);

        let (report_tx, report_rx) = bounded::<(StageKind, Result<StageReport, StageError>)>(3);
        let name = |stage: StageKind| format!("{}-{stage}", self.builder.direction);

        let mut handles = Vec::with_capacity(3);
        {
            let tx = report_tx.clone();
            handles.push((
                StageKind::Consumer,
                thread::Builder::new().name(name(StageKind::Consumer)).spawn(move || {
                    let _ = tx.send((StageKind::Consumer, Consumer::new(source, Box::new(consumer_link)).run()));
                })?,
            ));
        }
        {
            let tx = report_tx.clone();
            handles.push((
                StageKind::Transformer,
                thread::Builder::new().name(name(StageKind::Transformer)).spawn(move || {
                    let stage = Transformer::new(transform, Box::new(transformer_in), Box::new(transformer_out));
                    let _ = tx.send((StageKind::Transformer, stage.run()));
                })?,
            ));
        }
        {
            let tx = report_tx;
            handles.push((
                StageKind::Producer,
                thread::Builder::new().name(name(StageKind::Producer)).spawn(move || {
                    let _ = tx.send((StageKind::Producer, Producer::new(Box::new(producer_link), sink).run()));
                })?,
            ));
        }

        let mut reports = Vec::with_capacity(3);
        let mut failures: Vec<(StageKind, StageError)> = Vec::new();
        // Ends once every stage thread has dropped its sender.
        while let Ok((stage, outcome)) = report_rx.recv() {
            match outcome {
                Ok(report) => reports.push(report),
                Err(error) => {
                    if failures.is_empty() {
                        tracing::error!(%stage, %error, "stage failed, stopping pipeline");
                        self.builder.cancel.cancel();
                    }
                    failures.push((stage, error));
                }
            }
        }

        for (stage, handle) in handles {
            if handle.join().is_err() {
                tracing::error!(%stage, "stage thread panicked");
                failures.push((stage, StageError::Panicked));
            }
        }

        let root = failures.iter().position(|(_, e)| !e.is_secondary()).unwrap_or(0);
        match failures.into_iter().nth(root) {
            Some((stage, source)) => Err(HubError::Stage { stage, source }),
            None => {
                reports.sort_by_key(|r| r.stage.rank());
                Ok(reports)
            }
        }
    }

    fn run_rank(&mut self, mapping: &IdentifierMapping) -> HubResult<Vec<StageReport>> {
        let layout = &self.builder.layout;
        let direction = self.builder.direction;
        let label = self.builder.selection.label();
        let link = |from: StageKind, to: StageKind| layout.internal_link(direction, &label, from.rank(), to.rank());
        let into_transformer = link(StageKind::Consumer, StageKind::Transformer);
        let into_producer = link(StageKind::Transformer, StageKind::Producer);
        let clock = SystemClock::new();

        let Some(role) = self.builder.topology.role() else {
            return Err(ConfigError::WorldSize(self.builder.topology.world_size).into());
        };
        let report = match role {
            StageKind::Consumer => {
                let downstream = ProcessTransport::connect(&into_transformer, &self.options, &clock)?;
                let source = self.take_source(mapping)?;
                Consumer::new(source, boxed(downstream)).run()
            }
            StageKind::Transformer => {
                let upstream = ProcessTransport::listen(&into_transformer, &self.options, &clock)?;
                let downstream = ProcessTransport::connect(&into_producer, &self.options, &clock)?;
                let transform = self.take_transform(mapping)?;
                Transformer::new(transform, boxed(upstream), boxed(downstream)).run()
            }
            StageKind::Producer => {
                let upstream = ProcessTransport::listen(&into_producer, &self.options, &clock)?;
                let sink = self.take_sink(mapping);
                Producer::new(boxed(upstream), sink).run()
            }
        };
        report
            .map(|report| vec![report])
            .map_err(|source| HubError::Stage { stage: role, source })
    }
}

fn boxed(transport: ProcessTransport) -> Box<dyn Transport> {
    Box::new(transport)
}

fn invalid_transform(error: crate::transform::TransformError) -> HubError {
    ConfigError::Parameter {
        name: "transform",
        reason: error.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection() {
        assert_eq!(TransformerSelection::All.label(), "all");
        assert_eq!(TransformerSelection::Instance(2).label(), "2");
        assert_eq!(TransformerSelection::All.instances(3), vec![0, 1, 2]);
        assert_eq!(TransformerSelection::Instance(1).instances(3), vec![1]);
    }

    fn parameters() -> Parameters {
        Parameters::from_json(r#"{"id_nest_region": [0, 1]}"#, std::path::Path::new("p.json")).unwrap()
    }

    #[test]
    fn test_build_rejects_bad_world_before_anything_opens() {
        let dir = tempfile::tempdir().unwrap();
        let result = PipelineBuilder::new(RunLayout::new(dir.path()), Direction::TvbToNest, parameters())
            .topology(Topology::new(0, 2))
            .build();
        assert!(matches!(result, Err(HubError::Config(ConfigError::WorldSize(2)))));
        assert!(!dir.path().join("transformation").exists());
    }

    #[test]
    fn test_build_rejects_instance_without_region() {
        let dir = tempfile::tempdir().unwrap();
        let result = PipelineBuilder::new(RunLayout::new(dir.path()), Direction::TvbToNest, parameters())
            .selection(TransformerSelection::Instance(2))
            .build();
        assert!(matches!(result, Err(HubError::Config(ConfigError::Parameter { .. }))));
    }

    #[test]
    fn test_modes() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let thread = PipelineBuilder::new(layout.clone(), Direction::NestToTvb, parameters()).build().unwrap();
        assert_eq!(thread.mode(), ExecutionMode::Thread);
        let process = PipelineBuilder::new(layout, Direction::NestToTvb, parameters())
            .topology(Topology::new(1, 3))
            .build()
            .unwrap();
        assert_eq!(process.mode(), ExecutionMode::Process);
        assert_eq!(process.local_roles(), vec![StageKind::Consumer]);
    }
}
