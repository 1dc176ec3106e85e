/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::{ConfigError, FailureKind},
    summary::{Summary, SummaryEntry},
    suite_directory::{SuiteDirectory, SuiteRun, TrialDir},
    sweep::{PlannedTrial, Sweep},
    topology::{Topology, TopologyProvider},
    trial_output::TrialOutput,
    trial_runner::{Phase, PhaseTiming, TrialOutcome, TrialReport, TrialRunner},
};
use anyhow::Context;
use colored::*;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    Completed,
    Failed,
    Cancelled,
    /// Never started because the suite was stopped first.
    Skipped,
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrialStatus::Completed => "completed",
            TrialStatus::Failed => "failed",
            TrialStatus::Cancelled => "cancelled",
            TrialStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// Contents of `failure.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub phase: Phase,
    pub message: String,
    pub killed_roles: Vec<String>,
}

/// Contents of `record.json`, the final word on one trial attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub index: usize,
    pub repetition: usize,
    pub attempt: usize,
    pub status: TrialStatus,
    /// Phase the trial was in when it failed or was cancelled.
    pub phase: Option<Phase>,
    pub failure: Option<FailureRecord>,
    pub elapsed_ms: u64,
    pub timeline: Vec<PhaseTiming>,
}

#[derive(Debug)]
pub struct TrialResult {
    pub planned: PlannedTrial,
    pub record: TrialRecord,
    pub output: Option<TrialOutput>,
    /// Set when the result was carried over from an earlier run of the suite.
    pub resumed: bool,
}

#[derive(Debug)]
pub struct SuiteReport {
    pub name: String,
    pub path: PathBuf,
    pub results: Vec<TrialResult>,
    pub summary: Summary,
    /// Set when the suite was stopped before every trial ran.
    pub halted: bool,
}

impl SuiteReport {
    pub fn count(&self, status: TrialStatus) -> usize {
        self.results
            .iter()
            .filter(|r| r.record.status == status)
            .count()
    }

    pub fn exit_code(&self) -> u8 {
        match self.count(TrialStatus::Completed) == self.results.len() {
            true => 0,
            false => 1,
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    fs::write(path, serde_json::to_vec_pretty(value)?)
        .context(format!("Unable to write {}", path.display()))
}

fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let bytes = fs::read(path).context(format!("Unable to read {}", path.display()))?;
    serde_json::from_slice(&bytes).context(format!("Unable to parse {}", path.display()))
}

/// Cancels `token` once `budget` has elapsed. The timer stops when the handle is aborted.
fn arm_budget(token: &CancellationToken, budget: Option<Duration>) -> Option<JoinHandle<()>> {
    budget.map(|budget| {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            token.cancel();
        })
    })
}

pub struct SuiteController {
    runner: TrialRunner,
    provider: Box<dyn TopologyProvider>,
    stop: CancellationToken,
    trial_budget: Option<Duration>,
    suite_budget: Option<Duration>,
}

impl SuiteController {
    pub fn new(runner: TrialRunner, provider: Box<dyn TopologyProvider>) -> Self {
        Self {
            runner,
            provider,
            stop: CancellationToken::new(),
            trial_budget: None,
            suite_budget: None,
        }
    }

    /// Cancelling this token stops the running trial and halts the suite.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_trial_budget(mut self, budget: Option<Duration>) -> Self {
        self.trial_budget = budget;
        self
    }

    pub fn with_suite_budget(mut self, budget: Option<Duration>) -> Self {
        self.suite_budget = budget;
        self
    }

    /// Expands the sweep and builds every trial's topology so that configuration errors surface
    /// before anything runs.
    pub fn plan(&self, sweep: &Sweep) -> Result<Vec<(PlannedTrial, Topology)>, ConfigError> {
        sweep
            .plan()?
            .into_iter()
            .map(|planned| {
                let topology = self.provider.topology_for(&planned.input)?;
                Ok((planned, topology))
            })
            .collect()
    }

    /// Runs the sweep in a freshly allocated suite directory.
    pub async fn run(&self, sweep: &Sweep, directory: &SuiteDirectory) -> anyhow::Result<SuiteReport> {
        let plan = self.plan(sweep)?;
        let run = directory.allocate(&sweep.name)?;
        write_json(&run.path().join("sweep.json"), &plan.iter().map(|(p, _)| p).collect::<Vec<_>>())?;
        self.execute(sweep, plan, run, false).await
    }

    /// Continues an unfinished suite run. Trials that already completed with the same input are
    /// kept, everything else runs again in a new attempt directory.
    pub async fn resume(&self, sweep: &Sweep, path: &Path) -> anyhow::Result<SuiteReport> {
        let plan = self.plan(sweep)?;
        let run = SuiteDirectory::reopen(path)?;

        // every stored input must match before anything runs
        for (planned, _) in plan.iter() {
            if let Some(latest) = run.attempts(planned.index).last() {
                let input_path = latest.join("input.json");
                if !input_path.exists() {
                    continue;
                }
                let stored: serde_json::Value = read_json(&input_path)?;
                if stored != serde_json::to_value(&planned.input)? {
                    return Err(ConfigError::ResumeMismatch {
                        index: planned.index,
                    }
                    .into());
                }
            }
        }

        self.execute(sweep, plan, run, true).await
    }

    /// Loads the result of an earlier attempt if it completed.
    fn completed_attempt(run: &SuiteRun, planned: &PlannedTrial) -> Option<(TrialRecord, TrialOutput)> {
        let latest = run.attempts(planned.index).pop()?;
        let record: TrialRecord = read_json(&latest.join("record.json")).ok()?;
        if record.status != TrialStatus::Completed {
            return None;
        }
        let output: TrialOutput = read_json(&latest.join("output.json")).ok()?;
        Some((record, output))
    }

    async fn execute(
        &self,
        sweep: &Sweep,
        plan: Vec<(PlannedTrial, Topology)>,
        mut run: SuiteRun,
        resuming: bool,
    ) -> anyhow::Result<SuiteReport> {
        let suite_token = self.stop.child_token();
        let suite_timer = arm_budget(&suite_token, self.suite_budget);

        let total = plan.len();
        let mut results = Vec::with_capacity(total);
        let mut halted = false;

        for (planned, topology) in plan {
            if halted || suite_token.is_cancelled() {
                halted = true;
                results.push(TrialResult {
                    record: TrialRecord {
                        index: planned.index,
                        repetition: planned.repetition,
                        attempt: 0,
                        status: TrialStatus::Skipped,
                        phase: None,
                        failure: None,
                        elapsed_ms: 0,
                        timeline: vec![],
                    },
                    planned,
                    output: None,
                    resumed: false,
                });
                continue;
            }

            if resuming {
                if let Some((record, output)) = Self::completed_attempt(&run, &planned) {
                    println!(
                        "> trial {}/{} already completed {}",
                        planned.index + 1,
                        total,
                        "✓".green()
                    );
                    results.push(TrialResult {
                        planned,
                        record,
                        output: Some(output),
                        resumed: true,
                    });
                    continue;
                }
            }

            let dir = run.allocate_trial(planned.index)?;
            write_json(&dir.join("input.json"), &planned.input)?;

            println!(
                "> running trial {}/{} ({}) {}",
                planned.index + 1,
                total,
                planned.input.protocol().variant(),
                planned
                    .assignment
                    .iter()
                    .map(|(axis, value)| format!("{}={}", axis, value))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .bright_black()
            );

            let trial_token = suite_token.child_token();
            let trial_timer = arm_budget(&trial_token, self.trial_budget);
            let report = self
                .runner
                .run(planned.index, &planned.input, &topology, &dir.path, trial_token)
                .await;
            if let Some(timer) = trial_timer {
                timer.abort();
            }

            let (record, output) = Self::persist(&planned, &dir, report)?;
            match &record.failure {
                None if record.status == TrialStatus::Completed => {
                    println!("\t{}", "✓".green())
                }
                Some(failure) => println!(
                    "\t{} {}",
                    "✗".red(),
                    format!("{} during {}: {}", failure.kind, failure.phase, failure.message).red()
                ),
                None => println!("\t{} {}", "✗".red(), record.status.to_string().red()),
            }

            if suite_token.is_cancelled() {
                warn!("suite {} stopped, remaining trials are skipped", sweep.name);
                halted = true;
            }
            results.push(TrialResult {
                planned,
                record,
                output,
                resumed: false,
            });
        }

        if let Some(timer) = suite_timer {
            timer.abort();
        }

        let entries = results
            .iter()
            .map(|r| SummaryEntry {
                index: r.planned.index,
                status: r.record.status,
                assignment: &r.planned.assignment,
                output: r.output.as_ref(),
            })
            .collect::<Vec<_>>();
        let summary = Summary::build(sweep.projection(), &entries);
        summary.write(run.path())?;

        println!("\n{}", " Summary ".reversed().green());
        println!("{}", summary.render(true));

        // a halted run stays open so that it can be resumed
        let path = match halted {
            true => run.path().to_path_buf(),
            false => run.finish()?,
        };
        info!("suite {} written to {}", sweep.name, path.display());

        Ok(SuiteReport {
            name: sweep.name.clone(),
            path,
            results,
            summary,
            halted,
        })
    }

    /// Writes the artifacts of a finished trial attempt.
    fn persist(
        planned: &PlannedTrial,
        dir: &TrialDir,
        report: TrialReport,
    ) -> anyhow::Result<(TrialRecord, Option<TrialOutput>)> {
        let TrialReport {
            outcome,
            timeline,
            killed_roles,
            elapsed,
        } = report;

        let (status, phase, failure, output) = match outcome {
            TrialOutcome::Completed(output) => (TrialStatus::Completed, None, None, Some(output)),
            TrialOutcome::Failed { phase, error } => (
                TrialStatus::Failed,
                Some(phase),
                Some(FailureRecord {
                    kind: error.kind(),
                    phase,
                    message: error.to_string(),
                    killed_roles,
                }),
                None,
            ),
            TrialOutcome::Cancelled { phase } => (TrialStatus::Cancelled, Some(phase), None, None),
        };

        if let Some(output) = output.as_ref() {
            write_json(&dir.join("output.json"), output)?;
        }
        if let Some(failure) = failure.as_ref() {
            write_json(&dir.join("failure.json"), failure)?;
        }

        let record = TrialRecord {
            index: planned.index,
            repetition: planned.repetition,
            attempt: dir.attempt,
            status,
            phase,
            failure,
            elapsed_ms: elapsed.as_millis() as u64,
            timeline,
        };
        write_json(&dir.join("record.json"), &record)?;
        Ok((record, output))
    }
}
