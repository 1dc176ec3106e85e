/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::ConfigError,
    options::RoundSystemType,
    trial_input::{Protocol, TrialInput},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleKind {
    Leader,
    Acceptor,
    Replica,
    Client,
}

impl RoleKind {
    pub fn name(&self) -> &'static str {
        match self {
            RoleKind::Leader => "leader",
            RoleKind::Acceptor => "acceptor",
            RoleKind::Replica => "replica",
            RoleKind::Client => "client",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Where one role process lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub kind: RoleKind,
    pub index: usize,
    pub address: SocketAddr,
    pub metrics_address: SocketAddr,
}

impl Placement {
    pub fn name(&self) -> String {
        format!("{}_{}", self.kind, self.index)
    }
}

/// Link characteristics of one network segment, applied by simulated network backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkParams {
    pub segment: String,
    #[serde(with = "crate::trial_input::duration_ms")]
    pub latency: Duration,
    pub bandwidth_mbps: u32,
}

/// The concrete deployment of one trial. Built fresh for every trial and dropped with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub network: String,
    pub f: u32,
    pub round_system: Option<RoundSystemType>,
    pub placements: Vec<Placement>,
    pub links: Vec<LinkParams>,
}

impl Topology {
    pub fn role(&self, kind: RoleKind) -> impl Iterator<Item = &Placement> {
        self.placements.iter().filter(move |p| p.kind == kind)
    }

    pub fn count(&self, kind: RoleKind) -> usize {
        self.role(kind).count()
    }

    fn check_unique(&self, network: &'static str) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for placement in self.placements.iter() {
            if !seen.insert(placement.address) || !seen.insert(placement.metrics_address) {
                return Err(ConfigError::DuplicateAddress(network));
            }
        }
        Ok(())
    }
}

/// How many processes of each kind a trial needs, derived from the protocol's quorum rules.
///
/// EPaxos runs `2f + 1` replicas. Fast Multi-Paxos runs `f + 1` leaders and `2f + 1` acceptors.
/// Both run one client process per `num_client_procs`.
pub fn role_counts(input: &TrialInput) -> Result<Vec<(RoleKind, usize)>, ConfigError> {
    let f = input.f();
    if f == 0 {
        return Err(ConfigError::InvalidFaultTolerance(f));
    }

    let clients = input.clients();
    if clients.num_client_procs == 0 {
        return Err(ConfigError::InvalidClients(
            "num_client_procs must be at least 1".to_string(),
        ));
    }
    if clients.num_clients_per_proc == 0 {
        return Err(ConfigError::InvalidClients(
            "num_clients_per_proc must be at least 1".to_string(),
        ));
    }

    let f = f as usize;
    let mut counts = match input.protocol() {
        Protocol::EPaxos { .. } => vec![(RoleKind::Replica, 2 * f + 1)],
        Protocol::FastMultiPaxos { .. } => {
            vec![(RoleKind::Leader, f + 1), (RoleKind::Acceptor, 2 * f + 1)]
        }
    };
    counts.push((RoleKind::Client, clients.num_client_procs as usize));
    Ok(counts)
}

fn round_system(input: &TrialInput) -> Option<RoundSystemType> {
    match input.protocol() {
        Protocol::EPaxos { .. } => None,
        Protocol::FastMultiPaxos { round_system, .. } => Some(*round_system),
    }
}

pub trait TopologyProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn topology_for(&self, input: &TrialInput) -> Result<Topology, ConfigError>;
}

/// Every role on one host behind a single switch, on consecutive ports.
#[derive(Debug, Clone)]
pub struct SingleSwitchNet {
    pub host: IpAddr,
    pub base_port: u16,
    pub base_metrics_port: u16,
}

impl Default for SingleSwitchNet {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            base_port: 10000,
            base_metrics_port: 12000,
        }
    }
}

impl TopologyProvider for SingleSwitchNet {
    fn name(&self) -> &'static str {
        "single_switch"
    }

    fn topology_for(&self, input: &TrialInput) -> Result<Topology, ConfigError> {
        let counts = role_counts(input)?;
        let total: usize = counts.iter().map(|(_, n)| n).sum();

        let port = |base: u16, offset: usize| -> Result<u16, ConfigError> {
            u16::try_from(base as usize + offset).map_err(|_| ConfigError::AddressSpace {
                network: "single_switch",
                roles: total,
                reason: format!("port range starting at {base} overflows"),
            })
        };

        let mut placements = Vec::with_capacity(total);
        let mut offset = 0;
        for (kind, n) in counts {
            for index in 0..n {
                placements.push(Placement {
                    kind,
                    index,
                    address: SocketAddr::new(self.host, port(self.base_port, offset)?),
                    metrics_address: SocketAddr::new(
                        self.host,
                        port(self.base_metrics_port, offset)?,
                    ),
                });
                offset += 1;
            }
        }

        let topology = Topology {
            network: self.name().to_string(),
            f: input.f(),
            round_system: round_system(input),
            placements,
            links: vec![LinkParams {
                segment: "switch".to_string(),
                latency: Duration::ZERO,
                bandwidth_mbps: 0,
            }],
        };
        topology.check_unique(self.name())?;
        Ok(topology)
    }
}

/// One /24 segment per role kind, e.g. acceptors on `10.0.2.0/24`. Hosts get one address each,
/// so ports stay fixed across the topology.
#[derive(Debug, Clone)]
pub struct MultiSegmentNet {
    pub port: u16,
    pub metrics_port: u16,
    pub link_latency: Duration,
    pub bandwidth_mbps: u32,
}

impl Default for MultiSegmentNet {
    fn default() -> Self {
        Self {
            port: 9000,
            metrics_port: 9100,
            link_latency: Duration::from_millis(1),
            bandwidth_mbps: 1000,
        }
    }
}

impl MultiSegmentNet {
    fn segment(kind: RoleKind) -> u8 {
        match kind {
            RoleKind::Leader => 1,
            RoleKind::Acceptor => 2,
            RoleKind::Replica => 3,
            RoleKind::Client => 4,
        }
    }
}

impl TopologyProvider for MultiSegmentNet {
    fn name(&self) -> &'static str {
        "multi_segment"
    }

    fn topology_for(&self, input: &TrialInput) -> Result<Topology, ConfigError> {
        let counts = role_counts(input)?;
        let total: usize = counts.iter().map(|(_, n)| n).sum();

        let mut placements = vec![];
        let mut links = vec![];
        for (kind, n) in counts {
            if n > 254 {
                return Err(ConfigError::AddressSpace {
                    network: "multi_segment",
                    roles: total,
                    reason: format!("{n} {kind}s do not fit in one /24 segment"),
                });
            }

            let segment = Self::segment(kind);
            links.push(LinkParams {
                segment: format!("10.0.{segment}.0/24"),
                latency: self.link_latency,
                bandwidth_mbps: self.bandwidth_mbps,
            });
            for index in 0..n {
                let host = IpAddr::V4(Ipv4Addr::new(10, 0, segment, index as u8 + 1));
                placements.push(Placement {
                    kind,
                    index,
                    address: SocketAddr::new(host, self.port),
                    metrics_address: SocketAddr::new(host, self.metrics_port),
                });
            }
        }

        let topology = Topology {
            network: self.name().to_string(),
            f: input.f(),
            round_system: round_system(input),
            placements,
            links,
        };
        topology.check_unique(self.name())?;
        Ok(topology)
    }
}
