//! # Interscale Hub
//!
//! Runs one direction of the hub for a co-simulation run directory.
//!
//! ## Usage
//!
//! ```bash
//! # three stages as threads of this process
//! interscale_hub /path/to/run --direction tvb_to_nest
//!
//! # three ranks, spawned here
//! interscale_hub /path/to/run --direction nest_to_tvb --spawn
//!
//! # one rank of an externally launched world (mpirun -n 3 ...)
//! interscale_hub /path/to/run --direction nest_to_tvb --transformer 0
//! ```
//!
//! Exit codes: 0 success, 1 usage, 2 configuration, 3 runtime failure.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use interscale_hub::logging::{self, log_name};
use interscale_hub::{
    Direction, HubResult, Launcher, Parameters, PipelineBuilder, RunLayout, Topology, TransformerSelection,
};

#[derive(Parser, Debug)]
#[command(name = "interscale_hub")]
#[command(version, about = "Interscale hub between two co-simulated simulators")]
struct Cli {
    /// Run directory holding parameter.json and the exchange folders
    run_path: PathBuf,

    /// Direction of the pipeline
    #[arg(long, env = "INTERSCALE_DIRECTION", default_value = "tvb_to_nest")]
    direction: Direction,

    /// Serve one channel table row instead of all of them
    #[arg(long, value_name = "INDEX")]
    transformer: Option<usize>,

    /// Rank of this process (overrides launcher variables)
    #[arg(long)]
    rank: Option<usize>,

    /// Number of processes: 1 for threads, 3 for processes
    #[arg(long)]
    world_size: Option<usize>,

    /// Spawn the three ranks from this process
    #[arg(long, conflicts_with_all = ["rank", "world_size"])]
    spawn: bool,
}

impl Cli {
    fn selection(&self) -> TransformerSelection {
        self.transformer
            .map_or(TransformerSelection::All, TransformerSelection::Instance)
    }

    /// Arguments handed to every spawned rank.
    fn rank_args(&self) -> Vec<OsString> {
        let mut args = vec![
            self.run_path.clone().into_os_string(),
            "--direction".into(),
            self.direction.as_str().into(),
        ];
        if let Some(transformer) = self.transformer {
            args.push("--transformer".into());
            args.push(transformer.to_string().into());
        }
        args
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return if error.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "interscale hub failed");
            eprintln!("interscale_hub: {error}");
            ExitCode::from(error.exit_code())
        }
    }
}

fn run(cli: &Cli) -> HubResult<()> {
    let layout = RunLayout::new(&cli.run_path);
    let parameters = Parameters::load(&layout.parameter_file())?;
    let label = cli.selection().label();

    if cli.spawn {
        logging::init(
            &layout.log_file(&log_name(cli.direction.as_str(), &label, None)),
            parameters.level_log,
        )?;
        tracing::info!(direction = %cli.direction, instance = %label, "spawning ranks");
        return Launcher::current(cli.rank_args())?.run();
    }

    let topology = Topology::resolve(cli.rank, cli.world_size)?;
    topology.mode()?;
    let rank = (topology.world_size > 1).then_some(topology.rank);
    logging::init(
        &layout.log_file(&log_name(cli.direction.as_str(), &label, rank)),
        parameters.level_log,
    )?;

    let summary = PipelineBuilder::new(layout, cli.direction, parameters)
        .topology(topology)
        .selection(cli.selection())
        .build()?
        .run()?;
    tracing::info!(stages = summary.reports.len(), marker = ?summary.marker, "pipeline finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_args_forward_selection() {
        let cli = Cli::try_parse_from(["interscale_hub", "/run", "--direction", "nest-to-tvb", "--transformer", "1"])
            .unwrap();
        let args: Vec<String> = cli
            .rank_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["/run", "--direction", "nest_to_tvb", "--transformer", "1"]);
    }

    #[test]
    fn test_spawn_conflicts_with_rank() {
        assert!(Cli::try_parse_from(["interscale_hub", "/run", "--spawn", "--rank", "0"]).is_err());
    }
}
