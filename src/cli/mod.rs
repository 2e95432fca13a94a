//! Command-line interface for taskforge.
//!
//! Provides operator commands for inspecting and repairing the durable queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
