/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The predefined benchmark sweeps.

pub mod epaxos;
pub mod fast_multipaxos;

use crate::{
    sweep::Sweep,
    trial_input::{LogLevels, Observability},
};
use anyhow::anyhow;
use std::time::Duration;

/// Command line settings shared by every suite.
#[derive(Debug, Clone)]
pub struct SuiteArgs {
    pub profiled: bool,
    pub monitored: bool,
    pub log_level: String,
}

impl Default for SuiteArgs {
    fn default() -> Self {
        Self {
            profiled: false,
            monitored: false,
            log_level: "info".to_string(),
        }
    }
}

impl SuiteArgs {
    fn observability(&self) -> Observability {
        Observability {
            profiled: self.profiled,
            monitored: self.monitored,
            scrape_interval: Duration::from_millis(200),
        }
    }

    fn log_levels(&self) -> LogLevels {
        LogLevels::uniform(&self.log_level)
    }
}

pub const SUITES: [&str; 3] = [
    epaxos::NUM_KEYS,
    fast_multipaxos::THRIFTY,
    fast_multipaxos::ALL,
];

/// Looks up a predefined suite by name.
///
/// # Arguments
/// * name - one of [`SUITES`]
/// * args - settings applied to every trial of the suite
///
/// # Returns
/// The suite's sweep or an error naming the known suites
pub fn find(name: &str, args: &SuiteArgs) -> anyhow::Result<Sweep> {
    match name {
        epaxos::NUM_KEYS => Ok(epaxos::num_keys(args)),
        fast_multipaxos::THRIFTY => Ok(fast_multipaxos::thrifty(args)),
        fast_multipaxos::ALL => Ok(fast_multipaxos::all(args)),
        _ => Err(anyhow!(
            "Unknown suite {}, expected one of {}",
            name,
            SUITES.join(", ")
        )),
    }
}

/// Converts fractional milliseconds, e.g. a wait period of `0.01`, into a duration.
pub fn millis(ms: f64) -> Duration {
    Duration::from_nanos((ms * 1_000_000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_suite_can_be_found() -> anyhow::Result<()> {
        for name in SUITES {
            let sweep = find(name, &SuiteArgs::default())?;
            assert_eq!(sweep.name, name);
        }
        assert!(find("raft", &SuiteArgs::default()).is_err());
        Ok(())
    }

    #[test]
    fn fractional_millis() {
        assert_eq!(millis(0.01), Duration::from_micros(10));
        assert_eq!(millis(0.1), Duration::from_micros(100));
        assert_eq!(millis(50.0), Duration::from_millis(50));
    }
}
