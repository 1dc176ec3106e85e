/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{topology::RoleKind, trial_runner::Phase};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Problems with the shape of a sweep or of a trial input. These are fatal and are always raised
/// before the first trial starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config file: {0}")]
    InvalidConfigFile(String),

    #[error("no command configured for {kind} roles of protocol {protocol}")]
    MissingRoleCommand { kind: RoleKind, protocol: String },

    #[error("axis `{0}` is declared more than once")]
    DuplicateAxis(String),

    #[error("`{referenced_by}` refers to unknown axis `{axis}`")]
    UnknownAxis { axis: String, referenced_by: String },

    #[error("axis dependencies form a cycle through: {0}")]
    CyclicAxes(String),

    #[error("axis `{axis}` was expected to hold a {expected}, found {found}")]
    AxisType {
        axis: String,
        expected: &'static str,
        found: String,
    },

    #[error("replication count must be at least 1")]
    InvalidReplication,

    #[error("fault tolerance f must be at least 1, got {0}")]
    InvalidFaultTolerance(u32),

    #[error("invalid client configuration: {0}")]
    InvalidClients(String),

    #[error("topology {network} cannot place {roles} roles: {reason}")]
    AddressSpace {
        network: &'static str,
        roles: usize,
        reason: String,
    },

    #[error("topology {0} assigned the same address twice")]
    DuplicateAddress(&'static str),

    #[error("trial {index} in the existing suite run was planned with a different input")]
    ResumeMismatch { index: usize },
}

/// Process exit code for an error that ended paxbench: 2 when a [`ConfigError`] is anywhere in
/// the chain, 1 for everything else.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<ConfigError>() {
        Some(_) => 2,
        None => 1,
    }
}

/// Everything that can go wrong inside a single trial. The runner converts these into a failed
/// outcome; none of them stop the suite.
#[derive(Debug, thiserror::Error)]
pub enum TrialError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("{phase} exceeded its bound of {}ms", bound.as_millis())]
    Timeout { phase: Phase, bound: Duration },

    #[error("telemetry unusable: {0}")]
    Telemetry(String),

    #[error("role {role} exited during {phase}")]
    RoleExited { role: String, phase: Phase },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse classification stored in failure records and summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Provisioning,
    Timeout,
    Telemetry,
    RoleExited,
    Io,
}

impl TrialError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TrialError::Provisioning(_) => FailureKind::Provisioning,
            TrialError::Timeout { .. } => FailureKind::Timeout,
            TrialError::Telemetry(_) => FailureKind::Telemetry,
            TrialError::RoleExited { .. } => FailureKind::RoleExited,
            TrialError::Io(_) => FailureKind::Io,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Provisioning => "provisioning",
            FailureKind::Timeout => "timeout",
            FailureKind::Telemetry => "telemetry",
            FailureKind::RoleExited => "role exited",
            FailureKind::Io => "io",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_phase_and_bound() {
        let err = TrialError::Timeout {
            phase: Phase::Measuring,
            bound: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "measuring exceeded its bound of 60000ms");
        assert_eq!(err.kind(), FailureKind::Timeout);
    }

    #[test]
    fn configuration_errors_exit_with_two() {
        let err = anyhow::Error::from(ConfigError::InvalidFaultTolerance(0))
            .context("Unable to plan suite epaxos_num_keys");
        assert_eq!(exit_code(&err), 2);

        let err = anyhow::anyhow!("Unable to install the ctrl-c handler");
        assert_eq!(exit_code(&err), 1);

        let err = anyhow::Error::from(TrialError::Telemetry("empty".to_string()));
        assert_eq!(exit_code(&err), 1);
    }
}
