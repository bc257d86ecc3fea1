//! # Interscale Hub
//!
//! Moves data between two co-simulated simulators, one synchronization
//! interval at a time, through a three stage pipeline.
//!
//! ```text
//!   upstream simulator                                  downstream simulator
//!          │                                                     ▲
//!   ┌──────┴─────┐   Transport   ┌─────────────┐  Transport  ┌───┴──────┐
//!   │  Consumer  │──────────────►│ Transformer │────────────►│ Producer │
//!   └────────────┘               └─────────────┘             └──────────┘
//!   UpstreamSource                dyn Transform              DownstreamSink
//! ```
//!
//! Two directions exist. `tvb_to_nest` turns region rates into channel
//! spike trains, `nest_to_tvb` turns channel spikes into region rates.
//!
//! A [`PipelineDriver`] runs the stages as three threads of one process
//! (world size 1) or as three ranks (world size 3). The
//! [`Launcher`] spawns those ranks when no external launcher does.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod driver;
pub mod error;
pub mod launcher;
pub mod layout;
pub mod logging;
pub mod parameters;
pub mod sink;
pub mod source;
pub mod stage;
pub mod topology;
pub mod transform;

pub use driver::{PipelineBuilder, PipelineDriver, PipelineSummary, TransformerSelection};
pub use error::{ConfigError, EndpointError, HubError, HubResult, StageError};
pub use launcher::Launcher;
pub use layout::{Direction, RunLayout};
pub use parameters::{HubSettings, LogLevel, NestToTvbParams, Parameters, TvbToNestParams};
pub use sink::{ChannelFileFormat, ChannelFileSink, DownstreamSink, MemorySink, MemorySinkHandle, SimulatorSink};
pub use source::{
    Endpoint, EndpointClient, FeedbackSource, IdPolicy, MemorySource, Simulator, SimulatorSource, SocketSource, UpstreamSource,
};
pub use stage::{Consumer, Producer, StageKind, StageReport, Transformer};
pub use topology::{ExecutionMode, Topology};
pub use transform::{Identity, RateToSpike, SpikeToRate, Transform, TransformError};
