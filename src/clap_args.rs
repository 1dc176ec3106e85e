/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the paxbench config file
    #[arg(short, long, default_value = "paxbench.toml")]
    pub file: PathBuf,

    /// Log level of paxbench itself, RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    pub verbosity: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Launcher {
    /// Run roles as OS processes using the role commands of the config file
    Command,
    /// Run roles in process with simulated latencies
    Simulated,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a benchmark suite
    Run {
        /// Name of the suite to run
        suite: String,

        /// Directory under which the suite run is created
        #[arg(short, long, default_value = "suites")]
        suite_directory: PathBuf,

        /// Resume an unfinished suite run instead of starting a new one
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Profile every role
        #[arg(long)]
        profile: bool,

        /// Serve runner metrics and write a prometheus.yml for every trial
        #[arg(long)]
        monitor: bool,

        /// Log level passed to every role
        #[arg(long, default_value = "info")]
        log_level: String,

        #[arg(long, value_enum, default_value_t = Launcher::Command)]
        launcher: Launcher,

        /// Network to place roles on, `single_switch` or `multi_segment`. Defaults to the config
        #[arg(long)]
        topology: Option<String>,

        /// Override the number of times every combination is run
        #[arg(short, long)]
        replication: Option<usize>,

        /// Stop the suite after this many seconds
        #[arg(long)]
        budget: Option<u64>,

        /// Cancel any single trial after this many seconds
        #[arg(long)]
        trial_budget: Option<u64>,
    },

    /// Print the trials a suite would run without running them
    Plan {
        suite: String,

        #[arg(short, long)]
        replication: Option<usize>,
    },

    /// Write an example paxbench.toml
    Init,
}

pub fn parse() -> Args {
    Args::parse()
}
