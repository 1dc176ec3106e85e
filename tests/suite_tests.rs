/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use paxbench::{
    errors::{exit_code, ConfigError, FailureKind},
    options::ReplicaOptions,
    roles::simulated::{Fault, FaultKind, SimulatedLauncher},
    suite_controller::{SuiteController, SuiteReport, TrialStatus},
    suite_directory::{SuiteDirectory, SuiteMeta},
    suites::{self, SuiteArgs},
    summary::Projection,
    sweep::{AxisSet, Sweep, Value},
    telemetry::ClientPhase,
    topology::SingleSwitchNet,
    trial_input::{Protocol, Timing, TrialInput},
    trial_runner::{Phase, TrialRunner},
};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A fresh suite root inside a directory that is removed when the guard drops.
fn scratch() -> anyhow::Result<(TempDir, PathBuf)> {
    let dir = tempfile::tempdir()?;
    let root = dir.path().join("suites");
    Ok((dir, root))
}

fn short_timing() -> Timing {
    Timing {
        provisioning_timeout: Duration::from_secs(5),
        warmup_duration: Duration::from_secs(1),
        warmup_timeout: Duration::from_secs(3),
        warmup_sleep: Duration::ZERO,
        client_lag: Duration::from_millis(500),
        duration: Duration::from_secs(2),
        timeout: Duration::from_secs(4),
        drain_timeout: Duration::from_secs(2),
    }
}

/// Three small EPaxos trials, one per key count. A trial takes a little over 3.5s.
fn tiny(num_keys: [u32; 3], timing: Timing) -> Sweep {
    Sweep::new(
        "tiny",
        AxisSet::new().axis("num_keys", num_keys),
        1,
        move |a| {
            Ok(TrialInput::builder(Protocol::EPaxos {
                replica: ReplicaOptions::default(),
                num_keys: a.uint("num_keys")?,
            })
            .f(1)
            .num_client_procs(2)
            .num_warmup_clients_per_proc(1)
            .num_clients_per_proc(2)
            .timing(timing)
            .build())
        },
        Projection::new().axis("num_keys").stop_throughput_p90(),
    )
}

fn launcher() -> SimulatedLauncher {
    SimulatedLauncher::new(Duration::from_millis(10), Duration::from_millis(50))
}

fn controller(launcher: SimulatedLauncher) -> SuiteController {
    SuiteController::new(
        TrialRunner::new(Arc::new(launcher)),
        Box::new(SingleSwitchNet::default()),
    )
}

fn statuses(report: &SuiteReport) -> Vec<TrialStatus> {
    report.results.iter().map(|r| r.record.status).collect()
}

fn read_meta(path: &Path) -> anyhow::Result<SuiteMeta> {
    Ok(serde_json::from_slice(&fs::read(path.join("suite.json"))?)?)
}

#[tokio::test(start_paused = true)]
async fn epaxos_num_keys_fills_every_summary_row() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let sweep = suites::find(suites::epaxos::NUM_KEYS, &SuiteArgs::default())?;
    let launcher =
        SimulatedLauncher::new(Duration::from_millis(250), Duration::from_millis(100));

    let report = controller(launcher)
        .run(&sweep, &SuiteDirectory::new(&root))
        .await?;

    assert_eq!(report.results.len(), 30);
    assert_eq!(report.count(TrialStatus::Completed), 30);
    assert_eq!(report.exit_code(), 0);
    assert!(!report.halted);

    assert_eq!(
        report.summary.headers,
        vec![
            "trial",
            "status",
            "f",
            "client_num_keys",
            "stop_throughput_1s.p90"
        ]
    );
    assert_eq!(report.summary.rows.len(), 30);
    for row in report.summary.rows.iter() {
        assert_eq!(row[1], serde_json::json!("completed"));
        assert!(row[4].as_f64().is_some_and(|p90| p90 > 0.0));
    }
    assert_eq!(report.summary.rows[9][2], serde_json::json!(2));
    assert_eq!(report.summary.rows[9][3], serde_json::json!(10000));

    assert!(report.path.join("summary.txt").exists());
    assert!(report.path.join("summary.json").exists());
    assert!(report.path.join("sweep.json").exists());
    assert!(read_meta(&report.path)?.finished_at.is_some());

    let trial = report.path.join("trials").join("0000");
    for file in ["input.json", "output.json", "record.json", "topology.json", "telemetry.csv"] {
        assert!(trial.join(file).exists(), "missing {}", file);
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failed_trials_do_not_stop_the_suite() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let launcher = launcher()
        .with_fault(
            Fault::new(FaultKind::StallMeasurement {
                after: Duration::from_millis(500),
            })
            .in_trial(1)
            .on_role("client_0"),
        )
        .with_fault(
            Fault::new(FaultKind::Crash(ClientPhase::Measure))
                .in_trial(2)
                .on_role("client_1"),
        );

    let report = controller(launcher)
        .run(&tiny([1, 10, 100], short_timing()), &SuiteDirectory::new(&root))
        .await?;

    assert_eq!(
        statuses(&report),
        vec![
            TrialStatus::Completed,
            TrialStatus::Failed,
            TrialStatus::Failed
        ]
    );
    assert_eq!(report.exit_code(), 1);
    assert!(!report.halted);

    let stalled = report.results[1]
        .record
        .failure
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("trial 1 has no failure record"))?;
    assert_eq!(stalled.kind, FailureKind::Timeout);
    assert_eq!(stalled.phase, Phase::Measuring);

    let crashed = report.results[2]
        .record
        .failure
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("trial 2 has no failure record"))?;
    assert_eq!(crashed.kind, FailureKind::RoleExited);
    assert_eq!(crashed.phase, Phase::Measuring);

    let trials = report.path.join("trials");
    assert!(trials.join("0000").join("output.json").exists());
    assert!(trials.join("0001").join("failure.json").exists());
    assert!(!trials.join("0001").join("output.json").exists());

    assert!(report.summary.rows[0][3].is_f64());
    assert_eq!(report.summary.rows[1][1], serde_json::json!("failed"));
    assert!(report.summary.rows[1][3].is_null());
    assert!(read_meta(&report.path)?.finished_at.is_some());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn measurement_longer_than_its_timeout_fails() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let timing = Timing {
        duration: Duration::from_secs(5),
        timeout: Duration::from_secs(3),
        ..short_timing()
    };

    let report = controller(launcher())
        .run(&tiny([1, 10, 100], timing), &SuiteDirectory::new(&root))
        .await?;

    assert_eq!(report.count(TrialStatus::Failed), 3);
    for result in report.results.iter() {
        assert_eq!(result.record.phase, Some(Phase::Measuring));
        assert_eq!(
            result.record.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Timeout)
        );
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn suite_runs_never_share_a_directory() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let directory = SuiteDirectory::new(&root);
    let sweep = tiny([1, 10, 100], short_timing()).with_replication(1);

    let first = controller(launcher()).run(&sweep, &directory).await?;
    let second = controller(launcher()).run(&sweep, &directory).await?;

    assert_ne!(first.path, second.path);
    assert!(first.path.join("summary.json").exists());
    assert!(second.path.join("summary.json").exists());
    assert_eq!(fs::read_dir(&root)?.count(), 2);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopping_the_suite_skips_remaining_trials() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let stop = CancellationToken::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let report = controller(launcher())
        .with_stop(stop)
        .run(&tiny([1, 10, 100], short_timing()), &SuiteDirectory::new(&root))
        .await?;

    assert_eq!(
        statuses(&report),
        vec![
            TrialStatus::Completed,
            TrialStatus::Cancelled,
            TrialStatus::Skipped
        ]
    );
    assert!(report.halted);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.summary.rows.len(), 3);
    assert_eq!(report.summary.rows[2][1], serde_json::json!("skipped"));
    // halted runs stay open
    assert!(read_meta(&report.path)?.finished_at.is_none());
    assert!(!report.path.join("trials").join("0002").exists());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn trial_budget_cancels_single_trials() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;

    let report = controller(launcher())
        .with_trial_budget(Some(Duration::from_secs(2)))
        .run(&tiny([1, 10, 100], short_timing()), &SuiteDirectory::new(&root))
        .await?;

    assert_eq!(report.count(TrialStatus::Cancelled), 3);
    for result in report.results.iter() {
        assert_eq!(result.record.phase, Some(Phase::Measuring));
    }
    // the suite itself was never stopped
    assert!(!report.halted);
    assert!(read_meta(&report.path)?.finished_at.is_some());

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn halted_suites_resume_where_they_stopped() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let sweep = tiny([1, 10, 100], short_timing());

    let halted = controller(launcher())
        .with_suite_budget(Some(Duration::from_secs(5)))
        .run(&sweep, &SuiteDirectory::new(&root))
        .await?;
    assert!(halted.halted);
    assert_eq!(
        statuses(&halted),
        vec![
            TrialStatus::Completed,
            TrialStatus::Cancelled,
            TrialStatus::Skipped
        ]
    );

    // a different plan must not be mixed into the stored run
    let changed = tiny([2, 10, 100], short_timing());
    let err = match controller(launcher()).resume(&changed, &halted.path).await {
        Ok(_) => anyhow::bail!("resuming with a different plan should fail"),
        Err(err) => err,
    };
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::ResumeMismatch { index: 0 })
    ));

    let resumed = controller(launcher()).resume(&sweep, &halted.path).await?;
    assert_eq!(resumed.count(TrialStatus::Completed), 3);
    assert_eq!(resumed.exit_code(), 0);
    assert!(resumed.results[0].resumed);
    assert!(!resumed.results[1].resumed);
    assert_eq!(resumed.results[1].record.attempt, 1);
    assert_eq!(resumed.results[2].record.attempt, 0);

    let trials = resumed.path.join("trials");
    assert!(trials.join("0001").join("record.json").exists());
    assert!(trials.join("0001_1").join("output.json").exists());
    assert!(read_meta(&resumed.path)?.finished_at.is_some());

    // finished runs are closed for good
    assert!(controller(launcher()).resume(&sweep, &resumed.path).await.is_err());

    Ok(())
}

fn single_epaxos(name: &str, axes: AxisSet, f: u32) -> Sweep {
    Sweep::new(
        name,
        axes,
        1,
        move |_| {
            Ok(TrialInput::builder(Protocol::EPaxos {
                replica: ReplicaOptions::default(),
                num_keys: 1,
            })
            .f(f)
            .num_client_procs(1)
            .timing(short_timing())
            .build())
        },
        Projection::new(),
    )
}

#[tokio::test(start_paused = true)]
async fn configuration_errors_stop_the_suite_before_any_trial() -> anyhow::Result<()> {
    let (_scratch, root) = scratch()?;
    let zero_f = single_epaxos("zero_f", AxisSet::new().axis("num_keys", [1, 10]), 0);
    let cyclic = single_epaxos(
        "cyclic",
        AxisSet::new()
            .derived("a", &["b"], |_| vec![Value::from(1)])
            .derived("b", &["a"], |_| vec![Value::from(1)]),
        1,
    );

    for sweep in [zero_f, cyclic] {
        let err = match controller(launcher())
            .run(&sweep, &SuiteDirectory::new(&root))
            .await
        {
            Ok(_) => anyhow::bail!("suite {} should not run", sweep.name),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidFaultTolerance(0)) | Some(ConfigError::CyclicAxes(_))
        ));
        assert_eq!(exit_code(&err), 2);
    }

    // no suite directory was ever allocated
    assert!(!root.exists());
    Ok(())
}
