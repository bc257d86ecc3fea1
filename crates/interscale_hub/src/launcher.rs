//! Spawns the three ranks of a process-mode pipeline.
//!
//! Each child is the same program with `INTERSCALE_RANK` and
//! `INTERSCALE_WORLD_SIZE` set. The first child to fail takes the others
//! down with it.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::Duration;

use crate::error::{HubError, HubResult};
use crate::topology::{RANK_VAR, WORLD_SIZE_VAR};

/// Ranks in a process-mode pipeline.
pub const WORLD_SIZE: usize = 3;

const POLL: Duration = Duration::from_millis(50);

/// Launches one child per rank and supervises them.
#[derive(Clone, Debug)]
pub struct Launcher {
    program: PathBuf,
    args: Vec<OsString>,
}

impl Launcher {
    /// Launcher running `program args..` for each rank.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Launcher re-running the current executable.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Io`] if the executable path is unknown.
    pub fn current(args: impl IntoIterator<Item = impl Into<OsString>>) -> HubResult<Self> {
        Ok(Self::new(std::env::current_exe()?, args))
    }

    fn spawn(&self, rank: usize) -> HubResult<Child> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(RANK_VAR, rank.to_string())
            .env(WORLD_SIZE_VAR, WORLD_SIZE.to_string())
            .spawn()?;
        tracing::info!(rank, pid = child.id(), "rank spawned");
        Ok(child)
    }

    /// Spawns every rank and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::RankFailed`] for the first rank that exits
    /// unsuccessfully, after the remaining ranks were killed.
    pub fn run(&self) -> HubResult<()> {
        let mut children: Vec<(usize, Child)> = Vec::with_capacity(WORLD_SIZE);
        for rank in 0..WORLD_SIZE {
            match self.spawn(rank) {
                Ok(child) => children.push((rank, child)),
                Err(error) => {
                    terminate(&mut children);
                    return Err(error);
                }
            }
        }

        while !children.is_empty() {
            let mut failed: Option<(usize, ExitStatus)> = None;
            let mut index = 0;
            while index < children.len() {
                let (rank, child) = &mut children[index];
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let rank = *rank;
                        children.remove(index);
                        if status.success() {
                            tracing::info!(rank, "rank finished");
                        } else {
                            failed.get_or_insert((rank, status));
                        }
                    }
                    Ok(None) => index += 1,
                    Err(error) => {
                        terminate(&mut children);
                        return Err(error.into());
                    }
                }
            }

            if let Some((rank, status)) = failed {
                tracing::error!(rank, %status, "rank failed, stopping the others");
                terminate(&mut children);
                return Err(HubError::RankFailed {
                    rank,
                    status: status.to_string(),
                });
            }
            if !children.is_empty() {
                thread::sleep(POLL);
            }
        }
        Ok(())
    }
}

fn terminate(children: &mut Vec<(usize, Child)>) {
    for (rank, mut child) in children.drain(..) {
        if let Err(error) = child.kill() {
            tracing::debug!(rank, %error, "kill failed");
        }
        let _ = child.wait();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_all_ranks_succeed() {
        Launcher::new("true", Vec::<OsString>::new()).run().unwrap();
    }

    #[test]
    fn test_failing_rank_is_reported() {
        let result = Launcher::new("false", Vec::<OsString>::new()).run();
        assert!(matches!(result, Err(HubError::RankFailed { .. })));
    }

    #[test]
    fn test_rank_environment() {
        let script = r#"[ "$INTERSCALE_WORLD_SIZE" = 3 ] && [ "$INTERSCALE_RANK" -lt 3 ]"#;
        Launcher::new("sh", ["-c", script]).run().unwrap();
    }
}
