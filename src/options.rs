/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Per-role option bundles.
//!
//! A bundle is an immutable group of knobs for one role. Suites start from `Default` and
//! override individual knobs with the `with_*` methods, each of which returns a new bundle.
//! Role processes receive a bundle as a flat list of knob/value pairs (see [`OptionBundle`]).

use crate::trial_input::duration_ms;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Flattens a bundle into the knob/value pairs handed to a role process.
pub trait OptionBundle {
    fn knobs(&self) -> Vec<(&'static str, String)>;
}

/// Renders a duration the way role processes expect it, as fractional milliseconds.
pub fn format_duration(duration: Duration) -> String {
    format!("{}ms", duration.as_nanos() as f64 / 1_000_000.0)
}

/// Strategy used by Fast Multi-Paxos leaders to assign rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundSystemType {
    ClassicRoundRobin,
    RoundZeroFast,
    MixedRoundRobin,
}

impl RoundSystemType {
    pub fn name(&self) -> &'static str {
        match self {
            RoundSystemType::ClassicRoundRobin => "CLASSIC_ROUND_ROBIN",
            RoundSystemType::RoundZeroFast => "ROUND_ZERO_FAST",
            RoundSystemType::MixedRoundRobin => "MIXED_ROUND_ROBIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "CLASSIC_ROUND_ROBIN" => Some(RoundSystemType::ClassicRoundRobin),
            "ROUND_ZERO_FAST" => Some(RoundSystemType::RoundZeroFast),
            "MIXED_ROUND_ROBIN" => Some(RoundSystemType::MixedRoundRobin),
            _ => None,
        }
    }
}

/// Which acceptors a leader contacts for each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThriftySystem {
    NotThrifty,
    Random,
    Closest,
}

impl ThriftySystem {
    pub fn name(&self) -> &'static str {
        match self {
            ThriftySystem::NotThrifty => "NotThrifty",
            ThriftySystem::Random => "Random",
            ThriftySystem::Closest => "Closest",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "NotThrifty" => Some(ThriftySystem::NotThrifty),
            "Random" => Some(ThriftySystem::Random),
            "Closest" => Some(ThriftySystem::Closest),
            _ => None,
        }
    }
}

// ******** ******** ********
// **    FAST MULTI-PAXOS   **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptorOptions {
    #[serde(with = "duration_ms")]
    pub wait_period: Duration,
    #[serde(with = "duration_ms")]
    pub wait_stagger: Duration,
}

impl Default for AcceptorOptions {
    fn default() -> Self {
        Self {
            wait_period: Duration::from_millis(25),
            wait_stagger: Duration::from_millis(25),
        }
    }
}

impl AcceptorOptions {
    pub fn with_wait_period(&self, wait_period: Duration) -> Self {
        Self {
            wait_period,
            ..self.clone()
        }
    }

    pub fn with_wait_stagger(&self, wait_stagger: Duration) -> Self {
        Self {
            wait_stagger,
            ..self.clone()
        }
    }
}

impl OptionBundle for AcceptorOptions {
    fn knobs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("wait_period", format_duration(self.wait_period)),
            ("wait_stagger", format_duration(self.wait_stagger)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderOptions {
    pub thrifty_system: ThriftySystem,
    #[serde(with = "duration_ms")]
    pub resend_phase1as_timer_period: Duration,
    #[serde(with = "duration_ms")]
    pub resend_phase2as_timer_period: Duration,
    pub phase2a_max_buffer_size: u32,
    #[serde(with = "duration_ms")]
    pub phase2a_buffer_flush_period: Duration,
    #[serde(with = "duration_ms")]
    pub election_ping_period: Duration,
    #[serde(with = "duration_ms")]
    pub election_no_ping_timeout_min: Duration,
    #[serde(with = "duration_ms")]
    pub election_no_ping_timeout_max: Duration,
}

impl Default for LeaderOptions {
    fn default() -> Self {
        Self {
            thrifty_system: ThriftySystem::NotThrifty,
            resend_phase1as_timer_period: Duration::from_secs(5),
            resend_phase2as_timer_period: Duration::from_secs(5),
            phase2a_max_buffer_size: 1,
            phase2a_buffer_flush_period: Duration::from_secs(1),
            election_ping_period: Duration::from_secs(1),
            election_no_ping_timeout_min: Duration::from_secs(10),
            election_no_ping_timeout_max: Duration::from_secs(12),
        }
    }
}

impl LeaderOptions {
    pub fn with_thrifty_system(&self, thrifty_system: ThriftySystem) -> Self {
        Self {
            thrifty_system,
            ..self.clone()
        }
    }
}

impl OptionBundle for LeaderOptions {
    fn knobs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("thrifty_system", self.thrifty_system.name().to_string()),
            (
                "resend_phase1as_timer_period",
                format_duration(self.resend_phase1as_timer_period),
            ),
            (
                "resend_phase2as_timer_period",
                format_duration(self.resend_phase2as_timer_period),
            ),
            (
                "phase2a_max_buffer_size",
                self.phase2a_max_buffer_size.to_string(),
            ),
            (
                "phase2a_buffer_flush_period",
                format_duration(self.phase2a_buffer_flush_period),
            ),
            (
                "election.ping_period",
                format_duration(self.election_ping_period),
            ),
            (
                "election.no_ping_timeout_min",
                format_duration(self.election_no_ping_timeout_min),
            ),
            (
                "election.no_ping_timeout_max",
                format_duration(self.election_no_ping_timeout_max),
            ),
        ]
    }
}

// ******** ******** ********
// **        EPAXOS         **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaOptions {
    pub thrifty: bool,
    #[serde(with = "duration_ms")]
    pub resend_pre_accepts_timer_period: Duration,
    #[serde(with = "duration_ms")]
    pub default_to_slow_path_timer_period: Duration,
    #[serde(with = "duration_ms")]
    pub resend_accepts_timer_period: Duration,
    #[serde(with = "duration_ms")]
    pub resend_prepares_timer_period: Duration,
    #[serde(with = "duration_ms")]
    pub recover_instance_timer_min_period: Duration,
    #[serde(with = "duration_ms")]
    pub recover_instance_timer_max_period: Duration,
    pub execute_graph_batch_size: u32,
    #[serde(with = "duration_ms")]
    pub execute_graph_timer_period: Duration,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            thrifty: false,
            resend_pre_accepts_timer_period: Duration::from_secs(1),
            default_to_slow_path_timer_period: Duration::from_secs(1),
            resend_accepts_timer_period: Duration::from_secs(1),
            resend_prepares_timer_period: Duration::from_secs(1),
            recover_instance_timer_min_period: Duration::from_millis(500),
            recover_instance_timer_max_period: Duration::from_millis(1500),
            execute_graph_batch_size: 1,
            execute_graph_timer_period: Duration::from_secs(1),
        }
    }
}

impl OptionBundle for ReplicaOptions {
    fn knobs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("thrifty", self.thrifty.to_string()),
            (
                "resend_pre_accepts_timer_period",
                format_duration(self.resend_pre_accepts_timer_period),
            ),
            (
                "default_to_slow_path_timer_period",
                format_duration(self.default_to_slow_path_timer_period),
            ),
            (
                "resend_accepts_timer_period",
                format_duration(self.resend_accepts_timer_period),
            ),
            (
                "resend_prepares_timer_period",
                format_duration(self.resend_prepares_timer_period),
            ),
            (
                "recover_instance_timer_min_period",
                format_duration(self.recover_instance_timer_min_period),
            ),
            (
                "recover_instance_timer_max_period",
                format_duration(self.recover_instance_timer_max_period),
            ),
            (
                "execute_graph_batch_size",
                self.execute_graph_batch_size.to_string(),
            ),
            (
                "execute_graph_timer_period",
                format_duration(self.execute_graph_timer_period),
            ),
        ]
    }
}

// ******** ******** ********
// **        CLIENTS        **
// ******** ******** ********

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(with = "duration_ms")]
    pub repropose_period: Duration,
    /// How long a client waits on a single request before giving up on it.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            repropose_period: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
        }
    }
}

impl ClientOptions {
    pub fn with_repropose_period(&self, repropose_period: Duration) -> Self {
        Self {
            repropose_period,
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

impl OptionBundle for ClientOptions {
    fn knobs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("repropose_period", format_duration(self.repropose_period)),
            ("timeout", format_duration(self.timeout)),
        ]
    }
}
