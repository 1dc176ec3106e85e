/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Runs one trial through its phases:
//!
//! ```text
//! Provisioning -> Warmup -> MeasurementLagWait -> Measuring -> Draining -> Completed
//! ```
//!
//! `Failed` and `Cancelled` are reachable from every non-terminal phase. Whatever happens, the
//! trial passes through `Draining` so that no role outlives it.

use crate::{
    errors::TrialError,
    monitoring::{self, DiscardReason, RunnerMetrics},
    roles::{RoleEvent, RoleEventKind, RoleLaunch, RoleLauncher, RoleSet},
    telemetry::{ClientPhase, TelemetryLog},
    topology::{RoleKind, Topology},
    trial_input::TrialInput,
    trial_output::{self, TrialOutput},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fmt, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    time::{sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provisioning,
    Warmup,
    MeasurementLagWait,
    Measuring,
    Draining,
    Completed,
    Failed,
    Cancelled,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Provisioning,
        Phase::Warmup,
        Phase::MeasurementLagWait,
        Phase::Measuring,
        Phase::Draining,
        Phase::Completed,
        Phase::Failed,
        Phase::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed | Phase::Cancelled)
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Phase::Provisioning => "provisioning",
            Phase::Warmup => "warmup",
            Phase::MeasurementLagWait => "measurement_lag_wait",
            Phase::Measuring => "measuring",
            Phase::Draining => "draining",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::MeasurementLagWait => "measurement lag wait",
            other => other.metric_label(),
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug)]
pub enum TrialOutcome {
    Completed(TrialOutput),
    Failed { phase: Phase, error: TrialError },
    Cancelled { phase: Phase },
}

impl TrialOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            TrialOutcome::Completed(_) => Phase::Completed,
            TrialOutcome::Failed { .. } => Phase::Failed,
            TrialOutcome::Cancelled { .. } => Phase::Cancelled,
        }
    }

    pub fn output(&self) -> Option<&TrialOutput> {
        match self {
            TrialOutcome::Completed(output) => Some(output),
            _ => None,
        }
    }
}

/// When the trial entered a phase, relative to the start of the trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub at_ms: u64,
}

#[derive(Debug)]
pub struct TrialReport {
    pub outcome: TrialOutcome,
    pub timeline: Vec<PhaseTiming>,
    /// Roles that had to be killed because they did not stop within the drain bound.
    pub killed_roles: Vec<String>,
    pub elapsed: Duration,
}

impl TrialReport {
    /// The phases entered, in order.
    pub fn phases(&self) -> Vec<Phase> {
        self.timeline.iter().map(|t| t.phase).collect()
    }
}

/// Why a trial left the normal path.
enum Interrupt {
    Failed(Phase, TrialError),
    Cancelled(Phase),
}

pub struct TrialRunner {
    launcher: Arc<dyn RoleLauncher>,
    metrics: Arc<RunnerMetrics>,
    monitor_listen: Option<SocketAddr>,
}

impl TrialRunner {
    pub fn new(launcher: Arc<dyn RoleLauncher>) -> Self {
        Self {
            launcher,
            metrics: Arc::new(RunnerMetrics::default()),
            monitor_listen: None,
        }
    }

    /// Serve `/metrics` on the given address for trials that ask to be monitored.
    pub fn with_monitoring(mut self, listen: SocketAddr) -> Self {
        self.monitor_listen = Some(listen);
        self
    }

    pub fn metrics(&self) -> Arc<RunnerMetrics> {
        self.metrics.clone()
    }

    /// Runs one trial to a terminal phase. Every role is stopped before this returns.
    ///
    /// # Arguments
    ///
    /// * index - the trial index within the suite
    /// * input - the resolved trial input
    /// * topology - where each role lives
    /// * workdir - the trial's directory, receives `topology.json`, `telemetry.csv` and role logs
    /// * cancel - cancels the trial, observed at every wait
    ///
    /// # Returns
    ///
    /// The outcome together with the phases the trial went through
    pub async fn run(
        &self,
        index: usize,
        input: &TrialInput,
        topology: &Topology,
        workdir: &Path,
        cancel: CancellationToken,
    ) -> TrialReport {
        self.metrics.begin_trial(index);

        let observability = input.observability();
        let _server = match (observability.monitored, self.monitor_listen) {
            (true, Some(listen)) => {
                let server = monitoring::serve(listen, self.metrics.clone()).await;
                let runner_addr = server.as_ref().map(|s| s.addr);
                if let Err(err) = monitoring::write_prometheus_config(
                    &workdir.join("prometheus.yml"),
                    topology,
                    runner_addr,
                    observability.scrape_interval,
                ) {
                    warn!("Unable to write prometheus.yml for trial {}: {:#}", index, err);
                }
                server
            }
            _ => None,
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let trial = Trial {
            index,
            input,
            topology,
            workdir: workdir.to_path_buf(),
            launcher: self.launcher.as_ref(),
            metrics: &self.metrics,
            cancel,
            events_tx,
            events,
            roles: RoleSet::new(),
            telemetry: TelemetryLog::new(),
            phase: Phase::Provisioning,
            started: Instant::now(),
            timeline: vec![],
        };
        trial.run().await
    }
}

struct Trial<'a> {
    index: usize,
    input: &'a TrialInput,
    topology: &'a Topology,
    workdir: PathBuf,
    launcher: &'a dyn RoleLauncher,
    metrics: &'a RunnerMetrics,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<RoleEvent>,
    events: mpsc::UnboundedReceiver<RoleEvent>,
    roles: RoleSet,
    telemetry: TelemetryLog,
    phase: Phase,
    started: Instant,
    timeline: Vec<PhaseTiming>,
}

/// Signals the phases wait for. Everything else is absorbed by [`Trial::absorb`].
enum Signal {
    Ready(usize),
    PhaseDone(usize, ClientPhase),
}

impl<'a> Trial<'a> {
    async fn run(mut self) -> TrialReport {
        let result = self.advance().await;

        self.enter(Phase::Draining);
        let drain_bound = self.input.timing().drain_timeout;
        let drained = self.roles.drain(drain_bound).await;
        while let Ok(event) = self.events.try_recv() {
            // the phase gate counts leftovers as late
            let _ = self.absorb(event);
        }

        let killed_roles = drained.clone().err().unwrap_or_default();
        let outcome = match result {
            Err(Interrupt::Cancelled(phase)) => TrialOutcome::Cancelled { phase },
            Err(Interrupt::Failed(phase, error)) => TrialOutcome::Failed { phase, error },
            Ok(()) => match drained {
                Err(_) => TrialOutcome::Failed {
                    phase: Phase::Draining,
                    error: TrialError::Timeout {
                        phase: Phase::Draining,
                        bound: drain_bound,
                    },
                },
                Ok(()) => match trial_output::reduce(&self.telemetry) {
                    Ok(output) => TrialOutcome::Completed(output),
                    Err(error) => TrialOutcome::Failed {
                        phase: Phase::Measuring,
                        error,
                    },
                },
            },
        };

        if let Err(err) = self.telemetry.write_csv(&self.workdir.join("telemetry.csv")) {
            warn!("Unable to write telemetry of trial {}: {:#}", self.index, err);
        }

        self.enter(outcome.phase());
        match &outcome {
            TrialOutcome::Completed(_) => info!("trial {} completed", self.index),
            TrialOutcome::Failed { phase, error } => {
                warn!("trial {} failed during {}: {}", self.index, phase, error)
            }
            TrialOutcome::Cancelled { phase } => {
                warn!("trial {} cancelled during {}", self.index, phase)
            }
        }

        TrialReport {
            outcome,
            timeline: self.timeline,
            killed_roles,
            elapsed: self.started.elapsed(),
        }
    }

    async fn advance(&mut self) -> Result<(), Interrupt> {
        self.provision().await?;
        self.warmup().await?;
        self.lag().await?;
        self.measure().await
    }

    fn enter(&mut self, phase: Phase) {
        debug!("trial {} entering {}", self.index, phase);
        self.phase = phase;
        self.metrics.set_phase(phase);
        self.timeline.push(PhaseTiming {
            phase,
            at_ms: self.started.elapsed().as_millis() as u64,
        });
    }

    fn fail(&self, error: TrialError) -> Interrupt {
        Interrupt::Failed(self.phase, error)
    }

    fn timeout(&self, bound: Duration) -> Interrupt {
        self.fail(TrialError::Timeout {
            phase: self.phase,
            bound,
        })
    }

    /// Waits for the next role event until `deadline`. `Ok(None)` means the deadline passed.
    async fn next_event(&mut self, deadline: Instant) -> Result<Option<RoleEvent>, Interrupt> {
        tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled(self.phase)),

            event = self.events.recv() => match event {
                Some(event) => Ok(Some(event)),
                None => Err(self.fail(TrialError::Provisioning(
                    "role event channel closed".to_string(),
                ))),
            },

            _ = sleep_until(deadline) => Ok(None),
        }
    }

    /// Applies the phase gate to an event. Returns the events phases wait on.
    fn absorb(&mut self, event: RoleEvent) -> Result<Option<Signal>, Interrupt> {
        let role = event.role;
        match event.kind {
            RoleEventKind::Ready => Ok(Some(Signal::Ready(role))),
            RoleEventKind::PhaseDone(phase) => Ok(Some(Signal::PhaseDone(role, phase))),

            RoleEventKind::Completion(completion) => {
                match (completion.phase, self.phase) {
                    (ClientPhase::Warmup, _) => {
                        self.telemetry.discard_warmup();
                        self.metrics.discard(DiscardReason::Warmup);
                    }
                    (ClientPhase::Measure, Phase::Measuring) => {
                        let name = self.roles.name(role).to_string();
                        self.telemetry.accept(&name, completion);
                        self.metrics.accept();
                    }
                    (ClientPhase::Measure, _) => {
                        self.telemetry.discard_late();
                        self.metrics.discard(DiscardReason::Late);
                    }
                }
                Ok(None)
            }

            RoleEventKind::Malformed(line) => {
                if self.phase == Phase::Measuring {
                    debug!("malformed telemetry from {}: {}", self.roles.name(role), line);
                    self.telemetry.record_malformed();
                    self.metrics.discard(DiscardReason::Malformed);
                }
                Ok(None)
            }

            RoleEventKind::Exited(code) => {
                if self.phase == Phase::Draining || self.phase.is_terminal() {
                    return Ok(None);
                }
                let name = self.roles.name(role).to_string();
                warn!("role {} exited with {:?} during {}", name, code, self.phase);
                Err(self.fail(TrialError::RoleExited {
                    role: name,
                    phase: self.phase,
                }))
            }
        }
    }

    async fn provision(&mut self) -> Result<(), Interrupt> {
        self.enter(Phase::Provisioning);
        let bound = self.input.timing().provisioning_timeout;
        let deadline = Instant::now() + bound;

        let config_path = self.workdir.join("topology.json");
        let write_topology = || -> Result<(), TrialError> {
            let json = serde_json::to_vec_pretty(self.topology).map_err(std::io::Error::from)?;
            fs::write(&config_path, json)?;
            Ok(())
        };
        write_topology().map_err(|e| self.fail(e))?;

        for (role, placement) in self.topology.placements.iter().enumerate() {
            let launch = RoleLaunch {
                trial: self.index,
                role,
                placement: placement.clone(),
                options: self.input.role_options(placement.kind),
                log_level: self.input.log_levels().for_role(placement.kind).to_string(),
                profiled: self.input.observability().profiled,
                config_path: config_path.clone(),
                workdir: self.workdir.clone(),
                events: self.events_tx.clone(),
            };

            let handle = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled(self.phase)),
                launched = timeout_at(deadline, self.launcher.launch(launch)) => match launched {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(err)) => {
                        return Err(self.fail(TrialError::Provisioning(format!(
                            "unable to launch {}: {:#}",
                            placement.name(),
                            err
                        ))))
                    }
                    Err(_) => return Err(self.timeout(bound)),
                },
            };
            if placement.kind == RoleKind::Client {
                self.telemetry.expect_client(&handle.name);
            }
            self.roles.push(handle);
        }

        let mut ready = HashSet::new();
        while ready.len() < self.roles.len() {
            let Some(event) = self.next_event(deadline).await? else {
                let missing = (0..self.roles.len())
                    .filter(|r| !ready.contains(r))
                    .map(|r| self.roles.name(r).to_string())
                    .collect::<Vec<_>>();
                warn!("roles never became ready: {}", missing.join(", "));
                return Err(self.timeout(bound));
            };
            if let Some(Signal::Ready(role)) = self.absorb(event)? {
                ready.insert(role);
            }
        }
        info!("trial {}: {} roles ready", self.index, self.roles.len());
        Ok(())
    }

    /// Runs one client phase on every client and waits until all of them report it as done.
    async fn client_phase(
        &mut self,
        phase: ClientPhase,
        workers: u32,
        duration: Duration,
        bound: Duration,
    ) -> Result<(), Interrupt> {
        let deadline = Instant::now() + bound;
        self.roles.start_clients(phase, workers, duration);

        let clients = self.roles.client_count();
        let mut done = HashSet::new();
        while done.len() < clients {
            let Some(event) = self.next_event(deadline).await? else {
                return Err(self.timeout(bound));
            };
            if let Some(Signal::PhaseDone(role, p)) = self.absorb(event)? {
                if p == phase {
                    done.insert(role);
                }
            }
        }
        Ok(())
    }

    async fn warmup(&mut self) -> Result<(), Interrupt> {
        self.enter(Phase::Warmup);
        let timing = self.input.timing();
        let workers = self.input.clients().num_warmup_clients_per_proc;
        if workers == 0 || timing.warmup_duration.is_zero() {
            debug!("trial {}: skipping warmup", self.index);
            return Ok(());
        }
        self.client_phase(
            ClientPhase::Warmup,
            workers,
            timing.warmup_duration,
            timing.warmup_timeout,
        )
        .await
    }

    async fn lag(&mut self) -> Result<(), Interrupt> {
        self.enter(Phase::MeasurementLagWait);
        let deadline = Instant::now() + self.input.timing().lag();
        while let Some(event) = self.next_event(deadline).await? {
            self.absorb(event)?;
        }
        Ok(())
    }

    async fn measure(&mut self) -> Result<(), Interrupt> {
        self.enter(Phase::Measuring);
        let timing = self.input.timing();
        self.client_phase(
            ClientPhase::Measure,
            self.input.clients().num_clients_per_proc,
            timing.duration,
            timing.timeout,
        )
        .await
    }
}
