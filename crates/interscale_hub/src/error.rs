//! # Hub Error Types
//!
//! ```text
//! ConfigError ──┐
//! TableError ───┤
//! Handshake ────┼──► HubError ──► exit code (2 config, 3 runtime)
//! StageError ───┘        ▲
//!   ├ TransportError     │
//!   ├ EndpointError      │
//!   └ TransformError     │
//! ```

use std::io;
use std::path::PathBuf;

use interscale_core::{HandshakeError, TableError};
use interscale_transport::{TransportError, WireError};
use thiserror::Error;

use crate::stage::StageKind;
use crate::transform::TransformError;

/// Invalid run configuration. Always detected before any link is opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// `parameter.json` could not be read.
    #[error("cannot read {}: {source}", .path.display())]
    Unreadable {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// `parameter.json` is not valid.
    #[error("invalid {}: {source}", .path.display())]
    Invalid {
        /// File path.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A parameter value is out of range.
    #[error("parameter `{name}`: {reason}")]
    Parameter {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// Only one or three execution units are supported.
    #[error("unsupported execution unit count {0} (expected 1 for threads or 3 for processes)")]
    WorldSize(usize),

    /// The rank does not fit the world.
    #[error("rank {rank} out of range for {world_size} execution units")]
    Rank {
        /// Resolved rank.
        rank: usize,
        /// Resolved world size.
        world_size: usize,
    },

    /// A launcher environment variable is not a number.
    #[error("environment variable {name}=`{value}` is not a number")]
    Environment {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },

    /// The log file could not be opened.
    #[error("cannot open log file {}: {source}", .path.display())]
    LogFile {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Failure talking to an external simulator.
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Endpoint discovery or connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame from the simulator.
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),

    /// Handshake artifact failure.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Endpoints disagree on the interval being delivered.
    #[error("endpoint {endpoint} sent interval {received}, expected {expected}")]
    Misaligned {
        /// Endpoint position.
        endpoint: usize,
        /// Expected interval index.
        expected: u64,
        /// Received interval index.
        received: u64,
    },

    /// An endpoint ended while others were still streaming.
    #[error("endpoint {endpoint} ended while the other endpoints were still streaming")]
    UnevenEnd {
        /// Endpoint position.
        endpoint: usize,
    },

    /// The simulator reported a failure.
    #[error("simulator failed: {0}")]
    Simulator(String),

    /// File i/o on a channel file.
    #[error("i/o on {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Failure of one pipeline stage.
#[derive(Error, Debug)]
pub enum StageError {
    /// The link to a neighbouring stage failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The simulator side failed.
    #[error("endpoint: {0}")]
    Endpoint(#[from] EndpointError),

    /// The transformation function failed.
    #[error("transform: {0}")]
    Transform(#[from] TransformError),

    /// An interval arrived with a non-increasing index.
    #[error("interval {received} arrived after {previous}")]
    OutOfOrder {
        /// Last accepted index.
        previous: u64,
        /// Offending index.
        received: u64,
    },

    /// An upstream stage failed and said so.
    #[error("upstream failed: {0}")]
    Upstream(String),

    /// The stage thread panicked.
    #[error("stage thread panicked")]
    Panicked,
}

impl StageError {
    /// True if this failure only follows from a neighbour's failure.
    #[must_use]
    pub fn is_secondary(&self) -> bool {
        matches!(
            self,
            Self::Upstream(_) | Self::Transport(TransportError::Closed | TransportError::Disconnected { .. })
        )
    }
}

/// Top-level hub failure.
#[derive(Error, Debug)]
pub enum HubError {
    /// Invalid configuration.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// Invalid channel table.
    #[error("channel table: {0}")]
    Table(#[from] TableError),

    /// Handshake failure.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// Link setup failure.
    #[error("link setup: {0}")]
    Transport(#[from] TransportError),

    /// A stage failed.
    #[error("{stage} stage failed: {source}")]
    Stage {
        /// Failed stage.
        stage: StageKind,
        /// Cause.
        #[source]
        source: StageError,
    },

    /// A spawned rank exited unsuccessfully.
    #[error("rank {rank} exited with {status}")]
    RankFailed {
        /// Rank of the child.
        rank: usize,
        /// Exit status description.
        status: String,
    },

    /// Process or filesystem error.
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

impl HubError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Table(_) => 2,
            _ => 3,
        }
    }
}

/// Result type for hub operations.
pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(HubError::Config(ConfigError::WorldSize(2)).exit_code(), 2);
        assert_eq!(HubError::Table(TableError::Empty).exit_code(), 2);
        let stage = HubError::Stage {
            stage: StageKind::Transformer,
            source: StageError::Upstream("boom".into()),
        };
        assert_eq!(stage.exit_code(), 3);
        assert_eq!(stage.to_string(), "transformer stage failed: upstream failed: boom");
    }

    #[test]
    fn test_secondary_failures() {
        assert!(StageError::Upstream("x".into()).is_secondary());
        assert!(StageError::Transport(TransportError::Closed).is_secondary());
        assert!(!StageError::OutOfOrder { previous: 2, received: 1 }.is_secondary());
        assert!(!StageError::Panicked.is_secondary());
    }
}
