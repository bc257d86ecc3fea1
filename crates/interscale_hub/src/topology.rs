//! Execution units: how many there are and which one we are.

use crate::error::ConfigError;
use crate::stage::StageKind;

/// Rank variable set by the hub's own launcher.
pub const RANK_VAR: &str = "INTERSCALE_RANK";
/// World size variable set by the hub's own launcher.
pub const WORLD_SIZE_VAR: &str = "INTERSCALE_WORLD_SIZE";

/// Launcher variables checked in order, `(rank, world size)`.
const LAUNCHER_VARIABLES: [(&str, &str); 3] = [
    (RANK_VAR, WORLD_SIZE_VAR),
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
];

/// How the three stages are scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// One process, three cooperating threads.
    Thread,
    /// Three processes, one stage each.
    Process,
}

/// Rank of this execution unit and the number of units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Topology {
    /// Rank of this unit.
    pub rank: usize,
    /// Number of units.
    pub world_size: usize,
}

impl Default for Topology {
    fn default() -> Self {
        Self::single()
    }
}

impl Topology {
    /// Thread mode: rank 0 of 1.
    #[must_use]
    pub const fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Explicit rank and world size.
    #[must_use]
    pub const fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }

    /// Resolves from explicit values, then the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Environment`] for a non-numeric variable.
    pub fn resolve(rank: Option<usize>, world_size: Option<usize>) -> Result<Self, ConfigError> {
        Self::resolve_with(rank, world_size, |name| std::env::var(name).ok())
    }

    /// Like [`resolve`](Self::resolve) with a custom variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Environment`] for a non-numeric variable.
    pub fn resolve_with(
        rank: Option<usize>,
        world_size: Option<usize>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let parse = |name: &'static str| -> Result<Option<usize>, ConfigError> {
            lookup(name)
                .map(|value| {
                    let parsed = value.trim().parse::<usize>();
                    parsed.map_err(|_| ConfigError::Environment { name, value })
                })
                .transpose()
        };

        let mut resolved = Self::single();
        let mut rank = rank;
        let mut world_size = world_size;
        for (rank_var, size_var) in LAUNCHER_VARIABLES {
            if rank.is_none() {
                rank = parse(rank_var)?;
            }
            if world_size.is_none() {
                world_size = parse(size_var)?;
            }
        }
        if let Some(rank) = rank {
            resolved.rank = rank;
        }
        if let Some(world_size) = world_size {
            resolved.world_size = world_size;
        }
        Ok(resolved)
    }

    /// Execution mode for this world size.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::WorldSize`] unless the world has 1 or 3
    /// units, and [`ConfigError::Rank`] if the rank does not fit.
    pub fn mode(&self) -> Result<ExecutionMode, ConfigError> {
        let mode = match self.world_size {
            1 => ExecutionMode::Thread,
            3 => ExecutionMode::Process,
            other => return Err(ConfigError::WorldSize(other)),
        };
        if self.rank >= self.world_size {
            return Err(ConfigError::Rank {
                rank: self.rank,
                world_size: self.world_size,
            });
        }
        Ok(mode)
    }

    /// Stage this unit runs in process mode.
    #[must_use]
    pub fn role(&self) -> Option<StageKind> {
        match self.world_size {
            3 => StageKind::from_rank(self.rank),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_is_thread_mode() {
        let topology = Topology::resolve_with(None, None, env(&[])).unwrap();
        assert_eq!(topology, Topology::single());
        assert_eq!(topology.mode().unwrap(), ExecutionMode::Thread);
        assert_eq!(topology.role(), None);
    }

    #[test]
    fn test_explicit_values_win() {
        let topology = Topology::resolve_with(Some(2), Some(3), env(&[("INTERSCALE_RANK", "0")])).unwrap();
        assert_eq!(topology, Topology::new(2, 3));
        assert_eq!(topology.role(), Some(StageKind::Transformer));
    }

    #[test]
    fn test_mpi_launcher_variables() {
        let topology = Topology::resolve_with(
            None,
            None,
            env(&[("OMPI_COMM_WORLD_RANK", "1"), ("OMPI_COMM_WORLD_SIZE", "3")]),
        )
        .unwrap();
        assert_eq!(topology, Topology::new(1, 3));
        assert_eq!(topology.mode().unwrap(), ExecutionMode::Process);
        assert_eq!(topology.role(), Some(StageKind::Consumer));

        let pmi = Topology::resolve_with(None, None, env(&[("PMI_RANK", "0"), ("PMI_SIZE", "3")])).unwrap();
        assert_eq!(pmi.role(), Some(StageKind::Producer));
    }

    #[test]
    fn test_bad_world_sizes() {
        assert!(matches!(Topology::new(0, 2).mode(), Err(ConfigError::WorldSize(2))));
        assert!(matches!(Topology::new(0, 4).mode(), Err(ConfigError::WorldSize(4))));
        assert!(matches!(Topology::new(3, 3).mode(), Err(ConfigError::Rank { .. })));
        assert!(matches!(
            Topology::resolve_with(None, None, env(&[("INTERSCALE_RANK", "x")])),
            Err(ConfigError::Environment { .. })
        ));
    }
}
