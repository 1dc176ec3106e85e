/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod config;
pub mod errors;
pub mod monitoring;
pub mod options;
pub mod roles;
pub mod suite_controller;
pub mod suite_directory;
pub mod suites;
pub mod summary;
pub mod sweep;
pub mod telemetry;
pub mod topology;
pub mod trial_input;
pub mod trial_output;
pub mod trial_runner;

use tracing::{subscriber::set_global_default, Subscriber};
use tracing_subscriber::EnvFilter;

/// Builds the subscriber paxbench logs through. `RUST_LOG` overrides the given filter.
pub fn get_subscriber(env_filter: String) -> impl Subscriber + Sync + Send {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .pretty()
        .finish()
}

pub fn init_subscriber(subscriber: impl Subscriber + Sync + Send) -> anyhow::Result<()> {
    set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set subscriber: {}", e))
}
