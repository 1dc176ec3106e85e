/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use colored::Colorize;
use paxbench::{
    clap_args::{self, Commands, Launcher},
    config::{Config, NetworkKind},
    errors,
    get_subscriber, init_subscriber,
    roles::{command::CommandLauncher, simulated::SimulatedLauncher, RoleLauncher},
    suite_controller::{SuiteController, TrialStatus},
    suite_directory::SuiteDirectory,
    suites::{self, SuiteArgs},
    trial_runner::TrialRunner,
};
use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Config::try_from_path(path)
    } else {
        warn!(
            "{} not found, using defaults. Run `paxbench init` to create one",
            path.display()
        );
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = clap_args::parse();

    let subscriber = get_subscriber(args.verbosity.clone());
    if let Err(e) = init_subscriber(subscriber) {
        eprintln!("{}", e);
    }

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(errors::exit_code(&e))
        }
    }
}

async fn run(args: clap_args::Args) -> anyhow::Result<u8> {
    match args.command {
        Commands::Init => {
            Config::write_example_to_file(&args.file)?;
            println!("> {} written", args.file.display().to_string().green());
            Ok(0)
        }

        Commands::Plan { suite, replication } => {
            let mut sweep = suites::find(&suite, &SuiteArgs::default())?;
            if let Some(replication) = replication {
                sweep = sweep.with_replication(replication);
            }
            let plan = sweep.plan()?;
            println!("> suite {} plans {} trials", suite.green(), plan.len());
            for planned in plan.iter() {
                println!(
                    "\t{:>4} {}",
                    planned.index,
                    planned
                        .assignment
                        .iter()
                        .map(|(axis, value)| format!("{}={}", axis, value))
                        .collect::<Vec<_>>()
                        .join(" ")
                );
            }
            Ok(0)
        }

        Commands::Run {
            suite,
            suite_directory,
            resume,
            profile,
            monitor,
            log_level,
            launcher,
            topology,
            replication,
            budget,
            trial_budget,
        } => {
            let config = Arc::new(load_config(&args.file)?);

            let suite_args = SuiteArgs {
                profiled: profile,
                monitored: monitor,
                log_level,
            };
            let mut sweep = suites::find(&suite, &suite_args)?;
            if let Some(replication) = replication {
                sweep = sweep.with_replication(replication);
            }

            let network = match topology {
                Some(name) => NetworkKind::from_name(&name)
                    .context(format!("Unknown topology {}", name))?,
                None => config.topology.network,
            };

            let launcher: Arc<dyn RoleLauncher> = match launcher {
                Launcher::Simulated => Arc::new(SimulatedLauncher::from_config(&config.simulation)),
                Launcher::Command => {
                    let plan = sweep.plan()?;
                    let protocol = plan
                        .first()
                        .map(|p| p.input.protocol().clone())
                        .context(format!("Suite {} plans no trials", suite))?;
                    config.check_role_commands(&protocol)?;
                    Arc::new(CommandLauncher::new(config.clone(), protocol.name()))
                }
            };
            info!("launching roles with the {} launcher", launcher.name());

            let mut runner = TrialRunner::new(launcher);
            if monitor {
                runner = runner.with_monitoring(config.monitoring.listen);
            }

            let stop = CancellationToken::new();
            let handler_stop = stop.clone();
            ctrlc::set_handler(move || {
                println!("\n{}", "> stopping suite".yellow());
                handler_stop.cancel();
            })
            .context("Unable to install the ctrl-c handler")?;

            let controller = SuiteController::new(runner, config.topology.provider(network))
                .with_stop(stop)
                .with_suite_budget(budget.map(Duration::from_secs))
                .with_trial_budget(trial_budget.map(Duration::from_secs));

            let report = match resume {
                Some(path) => controller.resume(&sweep, &path).await?,
                None => {
                    controller
                        .run(&sweep, &SuiteDirectory::new(suite_directory))
                        .await?
                }
            };

            println!(
                "> {} completed, {} failed, {} cancelled, {} skipped. Results in {}",
                report.count(TrialStatus::Completed).to_string().green(),
                report.count(TrialStatus::Failed).to_string().red(),
                report.count(TrialStatus::Cancelled),
                report.count(TrialStatus::Skipped),
                report.path.display()
            );
            Ok(report.exit_code())
        }
    }
}
