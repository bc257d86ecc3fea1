//! # Run Directory Layout
//!
//! ```text
//! <run>/
//! ├── parameter.json
//! ├── log/<name>.txt
//! ├── nest/
//! │   ├── spike_generator.txt (+ .unlock)     channel table, TVB -> NEST
//! │   └── spike_detector.txt  (+ .unlock)     channel table, NEST -> TVB
//! └── transformation/
//!     ├── receive_from_tvb/<region>.txt       TVB endpoint records
//!     ├── spike_generator/<channel>.txt       spike trains for NEST
//!     ├── spike_detector/<channel>.txt        NEST endpoint records
//!     ├── send_to_tvb/<region>.txt            rates for TVB
//!     └── internal/<link>.txt                 rank to rank endpoint records
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Data direction of one pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Region rates from TVB become spike trains for NEST.
    TvbToNest,
    /// Spikes from NEST become region rates for TVB.
    NestToTvb,
}

impl Direction {
    /// Both directions.
    pub const ALL: [Self; 2] = [Self::TvbToNest, Self::NestToTvb];

    /// Name used in file and log names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TvbToNest => "tvb_to_nest",
            Self::NestToTvb => "nest_to_tvb",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").to_ascii_lowercase().as_str() {
            "tvb_to_nest" => Ok(Self::TvbToNest),
            "nest_to_tvb" => Ok(Self::NestToTvb),
            other => Err(format!("unknown direction `{other}` (tvb_to_nest or nest_to_tvb)")),
        }
    }
}

/// Paths inside one run directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    /// Layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<run>/parameter.json`.
    #[must_use]
    pub fn parameter_file(&self) -> PathBuf {
        self.root.join("parameter.json")
    }

    /// `<run>/log/<name>.txt`.
    #[must_use]
    pub fn log_file(&self, name: &str) -> PathBuf {
        self.root.join("log").join(format!("{name}.txt"))
    }

    /// Channel table published by the spiking simulator.
    #[must_use]
    pub fn channel_table(&self, direction: Direction) -> PathBuf {
        let name = match direction {
            Direction::TvbToNest => "spike_generator.txt",
            Direction::NestToTvb => "spike_detector.txt",
        };
        self.root.join("nest").join(name)
    }

    /// Directory of the upstream endpoint records.
    #[must_use]
    pub fn upstream_dir(&self, direction: Direction) -> PathBuf {
        let name = match direction {
            Direction::TvbToNest => "receive_from_tvb",
            Direction::NestToTvb => "spike_detector",
        };
        self.root.join("transformation").join(name)
    }

    /// Directory of the downstream channel files.
    #[must_use]
    pub fn downstream_dir(&self, direction: Direction) -> PathBuf {
        let name = match direction {
            Direction::TvbToNest => "spike_generator",
            Direction::NestToTvb => "send_to_tvb",
        };
        self.root.join("transformation").join(name)
    }

    /// Upstream endpoint record for one id.
    #[must_use]
    pub fn upstream_endpoint(&self, direction: Direction, id: u64) -> PathBuf {
        self.upstream_dir(direction).join(format!("{id}.txt"))
    }

    /// Endpoint record of the rank to rank link `from -> to`.
    #[must_use]
    pub fn internal_link(&self, direction: Direction, instance: &str, from: usize, to: usize) -> PathBuf {
        self.root
            .join("transformation")
            .join("internal")
            .join(format!("{direction}_{instance}_{from}_to_{to}.txt"))
    }

    /// Creates every directory the hub writes into.
    ///
    /// # Errors
    ///
    /// Returns the first directory creation error.
    pub fn create_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.root.join("log"))?;
        std::fs::create_dir_all(self.root.join("nest"))?;
        std::fs::create_dir_all(self.root.join("transformation").join("internal"))?;
        for direction in Direction::ALL {
            std::fs::create_dir_all(self.upstream_dir(direction))?;
            std::fs::create_dir_all(self.downstream_dir(direction))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths() {
        let layout = RunLayout::new("/run");
        assert_eq!(
            layout.channel_table(Direction::TvbToNest),
            PathBuf::from("/run/nest/spike_generator.txt")
        );
        assert_eq!(
            layout.upstream_endpoint(Direction::TvbToNest, 3),
            PathBuf::from("/run/transformation/receive_from_tvb/3.txt")
        );
        assert_eq!(
            layout.downstream_dir(Direction::NestToTvb),
            PathBuf::from("/run/transformation/send_to_tvb")
        );
        assert_eq!(
            layout.internal_link(Direction::NestToTvb, "all", 2, 0),
            PathBuf::from("/run/transformation/internal/nest_to_tvb_all_2_to_0.txt")
        );
        assert_eq!(layout.log_file("tvb_to_nest_0"), PathBuf::from("/run/log/tvb_to_nest_0.txt"));
    }

    #[test]
    fn test_direction_parse() {
        assert_eq!("tvb-to-nest".parse::<Direction>(), Ok(Direction::TvbToNest));
        assert_eq!("NEST_TO_TVB".parse::<Direction>(), Ok(Direction::NestToTvb));
        assert!("sideways".parse::<Direction>().is_err());
    }
}
