/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! In-process roles for dry runs and tests.
//!
//! Servers only report ready and wait to be stopped. Clients run closed loop workers whose
//! requests take a fixed, deterministic latency. Everything runs on tokio time, so a paused
//! runtime replays a whole suite instantly.
//!
//! Faults can be injected per trial and per role to exercise the runner's failure paths.

use crate::{
    config::SimulationConfig,
    roles::{RoleCommand, RoleEventKind, RoleHandle, RoleLaunch, RoleLauncher},
    telemetry::{ClientPhase, Completion},
    topology::RoleKind,
};
use anyhow::anyhow;
use std::time::Duration;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{sleep, Instant},
};

#[derive(Debug, Clone, PartialEq)]
pub enum FaultKind {
    /// `launch` itself fails.
    FailToLaunch,
    /// The role starts but never reports ready.
    NeverReady,
    /// Client workers stop issuing requests this long into measurement and never finish.
    StallMeasurement { after: Duration },
    /// The client finishes measurement without reporting a single completion.
    NoCompletions,
    /// The client emits this many unparseable telemetry lines when measurement starts.
    Malformed(u32),
    /// The role exits as soon as the given client phase starts.
    Crash(ClientPhase),
    /// The role ignores stop requests.
    IgnoreStop,
}

#[derive(Debug, Clone)]
pub struct Fault {
    /// Trial index the fault applies to, every trial when `None`.
    pub trial: Option<usize>,
    /// Role name the fault applies to, e.g. `client_0`. Every role when `None`.
    pub role: Option<String>,
    pub kind: FaultKind,
}

impl Fault {
    pub fn new(kind: FaultKind) -> Self {
        Self {
            trial: None,
            role: None,
            kind,
        }
    }

    pub fn in_trial(mut self, trial: usize) -> Self {
        self.trial = Some(trial);
        self
    }

    pub fn on_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    fn applies(&self, launch: &RoleLaunch) -> bool {
        self.trial.map_or(true, |t| t == launch.trial)
            && self.role.as_ref().map_or(true, |r| *r == launch.name())
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedLauncher {
    latency: Duration,
    ready_delay: Duration,
    epoch: Instant,
    faults: Vec<Fault>,
}

impl SimulatedLauncher {
    pub fn new(latency: Duration, ready_delay: Duration) -> Self {
        Self {
            latency,
            ready_delay,
            epoch: Instant::now(),
            faults: vec![],
        }
    }

    pub fn from_config(config: &SimulationConfig) -> Self {
        Self::new(
            Duration::from_millis(config.latency_ms.max(1)),
            Duration::from_millis(config.ready_delay_ms),
        )
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }
}

/// What one simulated role does, resolved from the faults that apply to it.
#[derive(Debug, Clone, Default)]
struct Behaviour {
    never_ready: bool,
    stall_after: Option<Duration>,
    no_completions: bool,
    malformed: u32,
    crash: Option<ClientPhase>,
    ignore_stop: bool,
}

impl Behaviour {
    fn resolve(faults: &[Fault], launch: &RoleLaunch) -> anyhow::Result<Self> {
        let mut behaviour = Behaviour::default();
        for fault in faults.iter().filter(|f| f.applies(launch)) {
            match &fault.kind {
                FaultKind::FailToLaunch => {
                    return Err(anyhow!("simulated launch failure for {}", launch.name()))
                }
                FaultKind::NeverReady => behaviour.never_ready = true,
                FaultKind::StallMeasurement { after } => behaviour.stall_after = Some(*after),
                FaultKind::NoCompletions => behaviour.no_completions = true,
                FaultKind::Malformed(n) => behaviour.malformed += n,
                FaultKind::Crash(phase) => behaviour.crash = Some(*phase),
                FaultKind::IgnoreStop => behaviour.ignore_stop = true,
            }
        }
        Ok(behaviour)
    }
}

#[derive(Clone)]
struct Worker {
    launch: RoleLaunch,
    epoch: Instant,
    latency: Duration,
    behaviour: Behaviour,
}

impl Worker {
    fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    async fn run(self, phase: ClientPhase, worker: u32, duration: Duration) {
        let started = Instant::now();
        let deadline = started + duration;
        // spread workers a little so that their completions interleave
        let latency = self.latency + Duration::from_millis((worker % 4) as u64);

        while Instant::now() < deadline {
            if phase == ClientPhase::Measure {
                if let Some(after) = self.behaviour.stall_after {
                    if started.elapsed() >= after {
                        std::future::pending::<()>().await;
                    }
                }
            }

            let start_us = self.now_us();
            sleep(latency).await;
            let stop_us = self.now_us();

            if phase == ClientPhase::Measure && self.behaviour.no_completions {
                continue;
            }
            self.launch.emit(RoleEventKind::Completion(Completion {
                phase,
                worker,
                start_us,
                stop_us,
                ok: true,
            }));
        }
    }

    async fn run_phase(self, phase: ClientPhase, workers: u32, duration: Duration) {
        if phase == ClientPhase::Measure {
            for i in 0..self.behaviour.malformed {
                self.launch
                    .emit(RoleEventKind::Malformed(format!("completion measure {i} garbage")));
            }
        }

        let mut set = JoinSet::new();
        for worker in 0..workers {
            set.spawn(self.clone().run(phase, worker, duration));
        }
        while set.join_next().await.is_some() {}

        self.launch.emit(RoleEventKind::PhaseDone(phase));
    }
}

#[async_trait::async_trait]
impl RoleLauncher for SimulatedLauncher {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn launch(&self, launch: RoleLaunch) -> anyhow::Result<RoleHandle> {
        let behaviour = Behaviour::resolve(&self.faults, &launch)?;
        let name = launch.name();
        let kind = launch.placement.kind;
        let ready_delay = self.ready_delay;
        let worker = Worker {
            launch,
            epoch: self.epoch,
            latency: self.latency,
            behaviour,
        };

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if !worker.behaviour.never_ready {
                sleep(ready_delay).await;
                worker.launch.emit(RoleEventKind::Ready);
            }

            // dropping the set aborts a phase still in flight
            let mut phases = JoinSet::new();
            loop {
                tokio::select! {
                    command = control_rx.recv() => match command {
                        Some(RoleCommand::Start { phase, workers, duration }) => {
                            if worker.behaviour.crash == Some(phase) {
                                worker.launch.emit(RoleEventKind::Exited(Some(1)));
                                return;
                            }
                            if kind == RoleKind::Client {
                                phases.spawn(worker.clone().run_phase(phase, workers, duration));
                            }
                        }
                        Some(RoleCommand::Stop) | None => {
                            if worker.behaviour.ignore_stop {
                                std::future::pending::<()>().await;
                            }
                            return;
                        }
                    },

                    Some(_) = phases.join_next(), if !phases.is_empty() => {}
                }
            }
        });

        Ok(RoleHandle::new(name, kind, control_tx, task))
    }
}
