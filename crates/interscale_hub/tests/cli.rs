//! # Binary Tests
//!
//! Runs the `interscale_hub` executable against temporary run directories,
//! with the test acting as the rate simulator.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use interscale_core::{Event, HandshakeRecord, Interval, Message, SynchronizationBuffer, WaitOptions};
use interscale_hub::{Direction, EndpointClient, RunLayout};

const PARAMETERS: &str = r#"{
    "level_log": "debug",
    "id_nest_region": [0, 1],
    "interscale_hub": { "poll_interval_ms": 5, "handshake_timeout_ms": 20000, "cleanup_timeout_ms": 10000 }
}"#;

fn hub() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_interscale_hub"));
    command.env_remove("INTERSCALE_DIRECTION");
    for var in ["INTERSCALE_RANK", "INTERSCALE_WORLD_SIZE", "OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE", "PMI_RANK", "PMI_SIZE"] {
        command.env_remove(var);
    }
    command
}

fn code(output: &Output) -> Option<i32> {
    output.status.code()
}

fn prepared_run(dir: &Path) -> RunLayout {
    let layout = RunLayout::new(dir);
    layout.create_dirs().unwrap();
    fs::write(layout.parameter_file(), PARAMETERS).unwrap();
    HandshakeRecord::new(layout.channel_table(Direction::TvbToNest))
        .publish(b"5 2\n7 3\n")
        .unwrap();
    layout
}

// ============================================================================
// EXIT CODES
// ============================================================================

#[test]
fn test_missing_run_path_is_usage_error() {
    let output = hub().output().unwrap();
    assert_eq!(code(&output), Some(1));
}

#[test]
fn test_help_succeeds() {
    let output = hub().arg("--help").output().unwrap();
    assert_eq!(code(&output), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("--direction"));
}

#[test]
fn test_unknown_direction_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = hub().arg(dir.path()).args(["--direction", "sideways"]).output().unwrap();
    assert_eq!(code(&output), Some(1));
}

#[test]
fn test_missing_parameter_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = hub().arg(dir.path()).output().unwrap();
    assert_eq!(code(&output), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("parameter.json"));
}

#[test]
fn test_two_processes_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let layout = prepared_run(dir.path());
    let output = hub().arg(layout.root()).args(["--world-size", "2"]).output().unwrap();
    assert_eq!(code(&output), Some(2));
    assert!(!layout.root().join("transformation").join("internal").read_dir().unwrap().any(|_| true));
}

#[test]
fn test_malformed_table_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let layout = RunLayout::new(dir.path());
    layout.create_dirs().unwrap();
    fs::write(layout.parameter_file(), PARAMETERS).unwrap();
    HandshakeRecord::new(layout.channel_table(Direction::TvbToNest))
        .publish(b"5 two\n")
        .unwrap();
    let output = hub().arg(layout.root()).output().unwrap();
    assert_eq!(code(&output), Some(2));
}

// ============================================================================
// END TO END
// ============================================================================

fn feed_rates(layout: &RunLayout) {
    let options = WaitOptions::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_timeout(Some(Duration::from_secs(20)));
    let mut clients: Vec<EndpointClient> = [0, 1]
        .into_iter()
        .map(|region| EndpointClient::connect(&layout.upstream_endpoint(Direction::TvbToNest, region), &options).unwrap())
        .collect();
    for client in &mut clients {
        let rates = SynchronizationBuffer::with_events(Interval::new(0, 0.0, 10.0), vec![Event::new(0.0, 0, 1.0e6)]);
        client.send(&Message::Interval(rates)).unwrap();
    }
    for client in clients {
        client.finish().unwrap();
    }
}

fn assert_channel_files(layout: &RunLayout) {
    let out = layout.downstream_dir(Direction::TvbToNest);
    for channel in 5..10 {
        let text = fs::read_to_string(out.join(format!("{channel}.txt"))).unwrap();
        assert_eq!(text.lines().count(), 1, "channel {channel}");
    }
}

#[test]
fn test_thread_mode_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let layout = prepared_run(dir.path());

    let child = hub().arg(layout.root()).args(["--direction", "tvb_to_nest"]).spawn().unwrap();
    feed_rates(&layout);
    let output = child.wait_with_output().unwrap();

    assert_eq!(code(&output), Some(0));
    assert_channel_files(&layout);
    assert!(layout.log_file("tvb_to_nest_all").exists());
    assert!(!HandshakeRecord::new(layout.channel_table(Direction::TvbToNest)).is_unlocked());
}

#[test]
fn test_spawned_ranks_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let layout = prepared_run(dir.path());

    let child = hub().arg(layout.root()).arg("--spawn").spawn().unwrap();
    feed_rates(&layout);
    let output = child.wait_with_output().unwrap();

    assert_eq!(code(&output), Some(0));
    assert_channel_files(&layout);
    for rank in 0..3 {
        assert!(layout.log_file(&format!("tvb_to_nest_all_rank{rank}")).exists());
    }
}
