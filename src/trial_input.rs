/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    options::{
        AcceptorOptions, ClientOptions, LeaderOptions, OptionBundle, ReplicaOptions,
        RoundSystemType,
    },
    topology::RoleKind,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Serializes durations as fractional milliseconds, which keeps persisted inputs readable.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_nanos() as f64 / 1_000_000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = f64::deserialize(deserializer)?;
        if !ms.is_finite() || ms < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid duration of {ms}ms"
            )));
        }
        Ok(Duration::from_nanos((ms * 1_000_000.0).round() as u64))
    }
}

/// The protocol under test together with its variant-specific option bundles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum Protocol {
    #[serde(rename = "epaxos")]
    EPaxos {
        replica: ReplicaOptions,
        num_keys: u32,
    },
    #[serde(rename = "fast_multipaxos")]
    FastMultiPaxos {
        round_system: RoundSystemType,
        acceptor: AcceptorOptions,
        leader: LeaderOptions,
    },
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::EPaxos { .. } => "epaxos",
            Protocol::FastMultiPaxos { .. } => "fast_multipaxos",
        }
    }

    /// Short human readable description of the variant, used in logs and summaries.
    pub fn variant(&self) -> String {
        match self {
            Protocol::EPaxos { replica, num_keys } => {
                format!("epaxos(keys={}, thrifty={})", num_keys, replica.thrifty)
            }
            Protocol::FastMultiPaxos {
                round_system,
                leader,
                ..
            } => format!(
                "fast_multipaxos({}, {})",
                round_system.name(),
                leader.thrifty_system.name()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConcurrency {
    pub num_client_procs: u32,
    pub num_warmup_clients_per_proc: u32,
    pub num_clients_per_proc: u32,
}

impl Default for ClientConcurrency {
    fn default() -> Self {
        Self {
            num_client_procs: 1,
            num_warmup_clients_per_proc: 1,
            num_clients_per_proc: 1,
        }
    }
}

/// Bounds and durations of every phase of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    #[serde(with = "duration_ms")]
    pub provisioning_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub warmup_duration: Duration,
    #[serde(with = "duration_ms")]
    pub warmup_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub warmup_sleep: Duration,
    #[serde(with = "duration_ms")]
    pub client_lag: Duration,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            provisioning_timeout: Duration::from_secs(30),
            warmup_duration: Duration::from_secs(5),
            warmup_timeout: Duration::from_secs(10),
            warmup_sleep: Duration::ZERO,
            client_lag: Duration::from_secs(5),
            duration: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Timing {
    /// Total pause between the end of warmup and the start of measurement.
    pub fn lag(&self) -> Duration {
        self.warmup_sleep + self.client_lag
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observability {
    pub profiled: bool,
    pub monitored: bool,
    #[serde(with = "duration_ms")]
    pub scrape_interval: Duration,
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            profiled: false,
            monitored: false,
            scrape_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevels {
    pub leader: String,
    pub acceptor: String,
    pub replica: String,
    pub client: String,
}

impl Default for LogLevels {
    fn default() -> Self {
        LogLevels::uniform("info")
    }
}

impl LogLevels {
    pub fn uniform(level: &str) -> Self {
        Self {
            leader: level.to_string(),
            acceptor: level.to_string(),
            replica: level.to_string(),
            client: level.to_string(),
        }
    }

    pub fn for_role(&self, kind: RoleKind) -> &str {
        match kind {
            RoleKind::Leader => &self.leader,
            RoleKind::Acceptor => &self.acceptor,
            RoleKind::Replica => &self.replica,
            RoleKind::Client => &self.client,
        }
    }
}

/// A fully resolved configuration of one trial.
///
/// Inputs are only produced by [`TrialInputBuilder`]. To derive a variation of an existing input
/// call [`TrialInput::to_builder`], which copies it into a fresh builder and leaves the original
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialInput {
    f: u32,
    clients: ClientConcurrency,
    protocol: Protocol,
    client_options: ClientOptions,
    timing: Timing,
    observability: Observability,
    log_levels: LogLevels,
}

impl TrialInput {
    pub fn builder(protocol: Protocol) -> TrialInputBuilder {
        TrialInputBuilder {
            f: 1,
            clients: ClientConcurrency::default(),
            protocol,
            client_options: ClientOptions::default(),
            timing: Timing::default(),
            observability: Observability::default(),
            log_levels: LogLevels::default(),
        }
    }

    pub fn to_builder(&self) -> TrialInputBuilder {
        TrialInputBuilder {
            f: self.f,
            clients: self.clients,
            protocol: self.protocol.clone(),
            client_options: self.client_options.clone(),
            timing: self.timing,
            observability: self.observability,
            log_levels: self.log_levels.clone(),
        }
    }

    pub fn f(&self) -> u32 {
        self.f
    }

    pub fn clients(&self) -> &ClientConcurrency {
        &self.clients
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.client_options
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    pub fn log_levels(&self) -> &LogLevels {
        &self.log_levels
    }

    /// The knobs a role of the given kind is started with.
    pub fn role_options(&self, kind: RoleKind) -> Vec<(&'static str, String)> {
        match (kind, &self.protocol) {
            (RoleKind::Client, Protocol::EPaxos { num_keys, .. }) => {
                let mut knobs = self.client_options.knobs();
                knobs.push(("num_keys", num_keys.to_string()));
                knobs
            }
            (RoleKind::Client, Protocol::FastMultiPaxos { .. }) => self.client_options.knobs(),
            (RoleKind::Replica, Protocol::EPaxos { replica, .. }) => replica.knobs(),
            (RoleKind::Acceptor, Protocol::FastMultiPaxos { acceptor, .. }) => acceptor.knobs(),
            (RoleKind::Leader, Protocol::FastMultiPaxos { leader, .. }) => leader.knobs(),
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrialInputBuilder {
    f: u32,
    clients: ClientConcurrency,
    protocol: Protocol,
    client_options: ClientOptions,
    timing: Timing,
    observability: Observability,
    log_levels: LogLevels,
}

impl TrialInputBuilder {
    pub fn f(mut self, f: u32) -> Self {
        self.f = f;
        self
    }

    pub fn num_client_procs(mut self, num_client_procs: u32) -> Self {
        self.clients.num_client_procs = num_client_procs;
        self
    }

    pub fn num_warmup_clients_per_proc(mut self, num_warmup_clients_per_proc: u32) -> Self {
        self.clients.num_warmup_clients_per_proc = num_warmup_clients_per_proc;
        self
    }

    pub fn num_clients_per_proc(mut self, num_clients_per_proc: u32) -> Self {
        self.clients.num_clients_per_proc = num_clients_per_proc;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn client_options(mut self, client_options: ClientOptions) -> Self {
        self.client_options = client_options;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn observability(mut self, observability: Observability) -> Self {
        self.observability = observability;
        self
    }

    pub fn log_levels(mut self, log_levels: LogLevels) -> Self {
        self.log_levels = log_levels;
        self
    }

    pub fn build(self) -> TrialInput {
        TrialInput {
            f: self.f,
            clients: self.clients,
            protocol: self.protocol,
            client_options: self.client_options,
            timing: self.timing,
            observability: self.observability,
            log_levels: self.log_levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ThriftySystem;

    fn fast_multipaxos() -> Protocol {
        Protocol::FastMultiPaxos {
            round_system: RoundSystemType::ClassicRoundRobin,
            acceptor: AcceptorOptions::default(),
            leader: LeaderOptions::default().with_thrifty_system(ThriftySystem::Closest),
        }
    }

    #[test]
    fn to_builder_derives_a_new_input() {
        let base = TrialInput::builder(fast_multipaxos())
            .f(1)
            .num_client_procs(4)
            .build();
        let derived = base.to_builder().f(2).build();

        assert_eq!(base.f(), 1);
        assert_eq!(derived.f(), 2);
        assert_eq!(derived.clients().num_client_procs, 4);
    }

    #[test]
    fn role_options_follow_the_protocol() {
        let input = TrialInput::builder(Protocol::EPaxos {
            replica: ReplicaOptions::default(),
            num_keys: 100,
        })
        .build();

        let client = input.role_options(RoleKind::Client);
        assert!(client.contains(&("num_keys", "100".to_string())));
        assert!(input.role_options(RoleKind::Leader).is_empty());
        assert!(!input.role_options(RoleKind::Replica).is_empty());
    }

    #[test]
    fn inputs_survive_json() -> anyhow::Result<()> {
        let input = TrialInput::builder(fast_multipaxos())
            .client_options(ClientOptions::default().with_repropose_period(Duration::from_millis(50)))
            .build();

        let json = serde_json::to_string(&input)?;
        let back: TrialInput = serde_json::from_str(&json)?;
        assert_eq!(back, input);
        Ok(())
    }
}
