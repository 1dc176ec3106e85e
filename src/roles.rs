/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The contract between the trial runner and protocol role processes.
//!
//! A [`RoleLauncher`] turns a placement into a running role and hands back a [`RoleHandle`].
//! Every role reports to the runner through one shared event channel; the runner steers roles
//! with [`RoleCommand`]s. Dropping a handle tears the role down, so a trial can never leak a
//! process no matter how it ends.

pub mod command;
pub mod simulated;

use crate::{
    telemetry::{ClientPhase, Completion},
    topology::{Placement, RoleKind},
};
use futures_util::future::join_all;
use std::{path::PathBuf, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleCommand {
    /// Clients only: run `workers` request loops for `duration`, then report the phase as done.
    Start {
        phase: ClientPhase,
        workers: u32,
        duration: Duration,
    },
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RoleEventKind {
    Ready,
    PhaseDone(ClientPhase),
    Completion(Completion),
    Malformed(String),
    Exited(Option<i32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoleEvent {
    /// Index of the role in the trial's topology.
    pub role: usize,
    pub kind: RoleEventKind,
}

/// Everything a launcher needs to start one role.
#[derive(Debug, Clone)]
pub struct RoleLaunch {
    pub trial: usize,
    pub role: usize,
    pub placement: Placement,
    pub options: Vec<(&'static str, String)>,
    pub log_level: String,
    pub profiled: bool,
    /// Path of the trial's `topology.json`, which every role reads to find its peers.
    pub config_path: PathBuf,
    pub workdir: PathBuf,
    pub events: mpsc::UnboundedSender<RoleEvent>,
}

impl RoleLaunch {
    pub fn name(&self) -> String {
        self.placement.name()
    }

    pub fn emit(&self, kind: RoleEventKind) {
        // the runner may already have stopped listening
        let _ = self.events.send(RoleEvent {
            role: self.role,
            kind,
        });
    }
}

/// A running role. The role lives inside `task`; aborting the task releases the role.
pub struct RoleHandle {
    pub name: String,
    pub kind: RoleKind,
    control: mpsc::UnboundedSender<RoleCommand>,
    task: Option<JoinHandle<()>>,
}

impl RoleHandle {
    pub fn new(
        name: String,
        kind: RoleKind,
        control: mpsc::UnboundedSender<RoleCommand>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name,
            kind,
            control,
            task: Some(task),
        }
    }

    pub fn send(&self, command: RoleCommand) {
        if self.control.send(command).is_err() {
            debug!("role {} no longer accepts commands", self.name);
        }
    }
}

impl Drop for RoleHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
pub trait RoleLauncher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, launch: RoleLaunch) -> anyhow::Result<RoleHandle>;
}

/// The roles of one trial. Owns every handle until the trial is drained.
#[derive(Default)]
pub struct RoleSet {
    handles: Vec<RoleHandle>,
}

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handle: RoleHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn name(&self, role: usize) -> &str {
        self.handles
            .get(role)
            .map(|h| h.name.as_str())
            .unwrap_or("unknown")
    }

    pub fn clients(&self) -> impl Iterator<Item = &RoleHandle> {
        self.handles.iter().filter(|h| h.kind == RoleKind::Client)
    }

    pub fn client_count(&self) -> usize {
        self.clients().count()
    }

    pub fn start_clients(&self, phase: ClientPhase, workers: u32, duration: Duration) {
        for client in self.clients() {
            client.send(RoleCommand::Start {
                phase,
                workers,
                duration,
            });
        }
    }

    /// Asks every role to stop and waits up to `bound` for all of them to exit. Roles still
    /// running after that are killed and their names returned as the error.
    pub async fn drain(&mut self, bound: Duration) -> Result<(), Vec<String>> {
        for handle in self.handles.iter() {
            handle.send(RoleCommand::Stop);
        }

        let mut tasks = self
            .handles
            .iter_mut()
            .filter_map(|h| h.task.take().map(|t| (h.name.clone(), t)))
            .collect::<Vec<_>>();

        let joined = tokio::time::timeout(bound, join_all(tasks.iter_mut().map(|(_, t)| t))).await;
        if joined.is_ok() {
            return Ok(());
        }

        let mut killed = vec![];
        for (name, task) in tasks {
            if !task.is_finished() {
                warn!("role {} did not stop within {}ms, killing it", name, bound.as_millis());
                task.abort();
                killed.push(name);
            }
        }
        Err(killed)
    }
}
