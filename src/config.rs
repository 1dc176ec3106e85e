/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::ConfigError,
    topology::{MultiSegmentNet, RoleKind, SingleSwitchNet, TopologyProvider},
    trial_input::Protocol,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{Read, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

static EXAMPLE_CONFIG: &str = include_str!("templates/paxbench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default, rename(serialize = "role", deserialize = "role"))]
    pub roles: Vec<RoleCommand>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<File> {
        let mut file = File::create_new(path)
            .context(format!("Unable to create {}, does it already exist?", path.display()))?;
        File::write_all(&mut file, EXAMPLE_CONFIG.as_bytes())?;
        Ok(file)
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let mut config_str = String::new();
        fs::File::open(path)
            .context(format!("Unable to open config file {}", path.display()))?
            .read_to_string(&mut config_str)?;
        let config = Config::try_from_str(&config_str)
            .context(format!("Unable to load config file {}", path.display()))?;
        Ok(config)
    }

    pub fn try_from_str(conf_str: &str) -> Result<Config, ConfigError> {
        toml::from_str::<Config>(conf_str).map_err(|e| ConfigError::InvalidConfigFile(e.to_string()))
    }

    /// Finds the command that launches roles of the given kind for the given protocol. Commands
    /// without a protocol apply to every protocol; a protocol specific command wins.
    ///
    /// # Arguments
    /// * protocol - the protocol name, e.g. `epaxos`
    /// * kind - the kind of role to launch
    ///
    /// # Returns
    /// The matching role command or an error if none is configured
    pub fn find_role_command(
        &self,
        protocol: &str,
        kind: RoleKind,
    ) -> Result<&RoleCommand, ConfigError> {
        self.roles
            .iter()
            .filter(|role| role.kind == kind)
            .find(|role| role.protocol.as_deref() == Some(protocol))
            .or_else(|| {
                self.roles
                    .iter()
                    .find(|role| role.kind == kind && role.protocol.is_none())
            })
            .ok_or_else(|| ConfigError::MissingRoleCommand {
                kind,
                protocol: protocol.to_string(),
            })
    }

    /// Checks that every role the given protocol needs has a command.
    pub fn check_role_commands(&self, protocol: &Protocol) -> Result<(), ConfigError> {
        let kinds = match protocol {
            Protocol::EPaxos { .. } => vec![RoleKind::Replica, RoleKind::Client],
            Protocol::FastMultiPaxos { .. } => {
                vec![RoleKind::Leader, RoleKind::Acceptor, RoleKind::Client]
            }
        };
        for kind in kinds {
            self.find_role_command(protocol.name(), kind)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy, Serialize)]
#[serde(tag = "to", rename_all = "lowercase")]
pub enum Redirect {
    Null,
    Parent,
    File,
}

/// How to start one kind of role as an OS process. The command is a template, see
/// [`crate::roles::command`] for the placeholders it may contain.
#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
pub struct RoleCommand {
    pub kind: RoleKind,
    pub protocol: Option<String>,
    pub command: String,
    pub redirect: Option<Redirect>,
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone, Copy, Default)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    #[default]
    SingleSwitch,
    MultiSegment,
}

impl NetworkKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "single_switch" => Some(NetworkKind::SingleSwitch),
            "multi_segment" => Some(NetworkKind::MultiSegment),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct TopologyConfig {
    pub network: NetworkKind,
    pub host: IpAddr,
    pub base_port: u16,
    pub base_metrics_port: u16,
    pub segment_port: u16,
    pub segment_metrics_port: u16,
    pub link_latency_ms: u64,
    pub bandwidth_mbps: u32,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        let single = SingleSwitchNet::default();
        let multi = MultiSegmentNet::default();
        Self {
            network: NetworkKind::default(),
            host: single.host,
            base_port: single.base_port,
            base_metrics_port: single.base_metrics_port,
            segment_port: multi.port,
            segment_metrics_port: multi.metrics_port,
            link_latency_ms: multi.link_latency.as_millis() as u64,
            bandwidth_mbps: multi.bandwidth_mbps,
        }
    }
}

impl TopologyConfig {
    pub fn provider(&self, network: NetworkKind) -> Box<dyn TopologyProvider> {
        match network {
            NetworkKind::SingleSwitch => Box::new(SingleSwitchNet {
                host: self.host,
                base_port: self.base_port,
                base_metrics_port: self.base_metrics_port,
            }),
            NetworkKind::MultiSegment => Box::new(MultiSegmentNet {
                port: self.segment_port,
                metrics_port: self.segment_metrics_port,
                link_latency: Duration::from_millis(self.link_latency_ms),
                bandwidth_mbps: self.bandwidth_mbps,
            }),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct MonitoringConfig {
    pub listen: SocketAddr,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9464),
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(default)]
pub struct SimulationConfig {
    pub latency_ms: u64,
    pub ready_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latency_ms: 2,
            ready_delay_ms: 100,
        }
    }
}
