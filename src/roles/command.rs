/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Runs roles as OS processes.
//!
//! Commands come from the `[[role]]` tables of `paxbench.toml` and may contain the placeholders
//! `{name}`, `{kind}`, `{index}`, `{host}`, `{port}`, `{metrics_port}`, `{config}`,
//! `{log_level}`, `{profiled}`, `{workdir}` and `{options}`. `{options}` expands to one
//! `--options.<key> <value>` pair per protocol knob.
//!
//! The runner talks to a role over its stdin and stdout, one line per message:
//!
//! | direction | line                                                        |
//! |-----------|-------------------------------------------------------------|
//! | to role   | `warmup <workers> <duration_ms>`                            |
//! | to role   | `measure <workers> <duration_ms>`                           |
//! | to role   | `stop`                                                      |
//! | from role | `ready`                                                     |
//! | from role | `done warmup` / `done measure`                              |
//! | from role | `completion <phase> <worker> <start_us> <stop_us> <ok|err>` |
//!
//! Any other stdout line is treated as log output.

use crate::{
    config::{Config, Redirect},
    roles::{RoleCommand, RoleEventKind, RoleHandle, RoleLaunch, RoleLauncher},
    telemetry::{ClientPhase, Completion},
};
use anyhow::{anyhow, Context};
use std::{
    fs::OpenOptions,
    path::Path,
    process::Stdio,
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

pub struct CommandLauncher {
    config: Arc<Config>,
    protocol: String,
}

impl CommandLauncher {
    pub fn new(config: Arc<Config>, protocol: &str) -> Self {
        Self {
            config,
            protocol: protocol.to_string(),
        }
    }
}

/// Substitutes every placeholder in the command template.
///
/// # Arguments
///
/// * template - the command from the role table
/// * launch - the role being launched
///
/// # Returns
///
/// The command string, ready to be split into POSIX words
pub fn render(template: &str, launch: &RoleLaunch) -> anyhow::Result<String> {
    let mut options = vec![];
    for (key, value) in launch.options.iter() {
        let value = shlex::try_quote(value)
            .map_err(|e| anyhow!("Unable to quote option {}: {}", key, e))?;
        options.push(format!("--options.{} {}", key, value));
    }

    let quote = |path: &Path| -> anyhow::Result<String> {
        let path = path.to_string_lossy();
        shlex::try_quote(&path)
            .map(|p| p.into_owned())
            .map_err(|e| anyhow!("Unable to quote path {}: {}", path, e))
    };

    let placement = &launch.placement;
    Ok(template
        .replace("{name}", &launch.name())
        .replace("{kind}", placement.kind.name())
        .replace("{index}", &placement.index.to_string())
        .replace("{host}", &placement.address.ip().to_string())
        .replace("{port}", &placement.address.port().to_string())
        .replace("{metrics_port}", &placement.metrics_address.port().to_string())
        .replace("{config}", &quote(&launch.config_path)?)
        .replace("{log_level}", &launch.log_level)
        .replace("{profiled}", &launch.profiled.to_string())
        .replace("{workdir}", &quote(&launch.workdir)?)
        .replace("{options}", &options.join(" ")))
}

/// Turns one stdout line into an event. `None` means the line is plain log output.
pub fn parse_line(line: &str) -> Option<RoleEventKind> {
    let line = line.trim();
    if line == "ready" {
        return Some(RoleEventKind::Ready);
    }
    if let Some(phase) = line.strip_prefix("done ") {
        return Some(match ClientPhase::parse(phase.trim()) {
            Some(phase) => RoleEventKind::PhaseDone(phase),
            None => RoleEventKind::Malformed(line.to_string()),
        });
    }
    if let Some(fields) = line.strip_prefix("completion ") {
        return Some(match Completion::parse(fields) {
            Some(completion) => RoleEventKind::Completion(completion),
            None => RoleEventKind::Malformed(line.to_string()),
        });
    }
    None
}

fn command_line(command: &RoleCommand) -> String {
    match command {
        RoleCommand::Start {
            phase,
            workers,
            duration,
        } => format!("{} {} {}\n", phase.name(), workers, duration.as_millis()),
        RoleCommand::Stop => "stop\n".to_string(),
    }
}

async fn write_command(stdin: &mut ChildStdin, name: &str, command: &RoleCommand) {
    let line = command_line(command);
    if let Err(err) = stdin.write_all(line.as_bytes()).await {
        debug!("Unable to send {:?} to role {}: {}", line.trim(), name, err);
    }
}

#[async_trait::async_trait]
impl RoleLauncher for CommandLauncher {
    fn name(&self) -> &'static str {
        "command"
    }

    async fn launch(&self, launch: RoleLaunch) -> anyhow::Result<RoleHandle> {
        let name = launch.name();
        let role_command = self
            .config
            .find_role_command(&self.protocol, launch.placement.kind)?;
        let redirect = role_command.redirect.unwrap_or(Redirect::File);
        let command = render(&role_command.command, &launch)?;

        // break command string into POSIX words
        let words = shlex::split(&command).context("Command string is not POSIX compliant.")?;
        let [program, args @ ..] = &words[..] else {
            return Err(anyhow!("Empty command for role {}", name));
        };

        let stderr = match redirect {
            Redirect::Null => Stdio::null(),
            Redirect::Parent => Stdio::inherit(),
            Redirect::File => Stdio::from(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(launch.workdir.join(format!("{}.stderr", name)))?,
            ),
        };
        let mut log = match redirect {
            Redirect::File => {
                Some(File::create(launch.workdir.join(format!("{}.stdout", name))).await?)
            }
            _ => None,
        };

        debug!("Launching role {} with command {}", name, command);
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&launch.workdir)
            .env("PAXBENCH_ROLE", &name)
            .env("PAXBENCH_TRIAL", launch.trial.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .context(format!("Failed to spawn role {}, command: {}", name, command))?;

        let mut stdin = child.stdin.take().context("Role should have a stdin")?;
        let stdout = child.stdout.take().context("Role should have a stdout")?;

        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let kind = launch.placement.kind;
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut control_open = true;

            loop {
                tokio::select! {
                    command = control_rx.recv(), if control_open => match command {
                        Some(command) => write_command(&mut stdin, &task_name, &command).await,
                        None => {
                            write_command(&mut stdin, &task_name, &RoleCommand::Stop).await;
                            control_open = false;
                        }
                    },

                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_line(&line) {
                            Some(event) => launch.emit(event),
                            None => match (&mut log, redirect) {
                                (Some(file), _) => {
                                    let _ = file.write_all(format!("{}\n", line).as_bytes()).await;
                                }
                                (None, Redirect::Parent) => info!("[{}] {}", task_name, line),
                                _ => {}
                            },
                        },
                        Ok(None) => break,
                        Err(err) => {
                            warn!("Unable to read output of role {}: {}", task_name, err);
                            break;
                        }
                    }
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!("Unable to wait for role {}: {}", task_name, err);
                    None
                }
            };
            if let Some(file) = log.as_mut() {
                let _ = file.flush().await;
            }
            launch.emit(RoleEventKind::Exited(code));
        });

        Ok(RoleHandle::new(name, kind, control_tx, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Placement, RoleKind};
    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    fn launch() -> (RoleLaunch, mpsc::UnboundedReceiver<crate::roles::RoleEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launch = RoleLaunch {
            trial: 3,
            role: 4,
            placement: Placement {
                kind: RoleKind::Acceptor,
                index: 1,
                address: "10.0.2.2:9000".parse::<SocketAddr>().expect("addr"),
                metrics_address: "10.0.2.2:9100".parse::<SocketAddr>().expect("addr"),
            },
            options: vec![
                ("wait_period", "0.01ms".to_string()),
                ("thrifty_system", "NOT_THRIFTY".to_string()),
            ],
            log_level: "debug".to_string(),
            profiled: false,
            config_path: PathBuf::from("/runs/trial 0/topology.json"),
            workdir: PathBuf::from("/runs/trial 0"),
            events: tx,
        };
        (launch, rx)
    }

    #[test]
    fn renders_every_placeholder() -> anyhow::Result<()> {
        let (launch, _rx) = launch();
        let cmd = render(
            "acceptor --name {name} --kind {kind} --index {index} --host {host} --port {port} \
             --prometheus_port {metrics_port} --config {config} --log_level {log_level} \
             --profiled {profiled} --cwd {workdir} {options}",
            &launch,
        )?;

        let words = shlex::split(&cmd).expect("valid POSIX words");
        assert_eq!(
            words,
            vec![
                "acceptor",
                "--name",
                "acceptor_1",
                "--kind",
                "acceptor",
                "--index",
                "1",
                "--host",
                "10.0.2.2",
                "--port",
                "9000",
                "--prometheus_port",
                "9100",
                "--config",
                "/runs/trial 0/topology.json",
                "--log_level",
                "debug",
                "--profiled",
                "false",
                "--cwd",
                "/runs/trial 0",
                "--options.wait_period",
                "0.01ms",
                "--options.thrifty_system",
                "NOT_THRIFTY",
            ]
        );
        Ok(())
    }

    #[test]
    fn parses_protocol_lines() {
        assert_eq!(parse_line("ready"), Some(RoleEventKind::Ready));
        assert_eq!(
            parse_line("done measure"),
            Some(RoleEventKind::PhaseDone(ClientPhase::Measure))
        );
        assert!(matches!(
            parse_line("completion measure 0 10 20 ok"),
            Some(RoleEventKind::Completion(_))
        ));
        assert!(matches!(
            parse_line("completion measure 0 20 10 ok"),
            Some(RoleEventKind::Malformed(_))
        ));
        assert!(matches!(
            parse_line("done lunch"),
            Some(RoleEventKind::Malformed(_))
        ));
        assert_eq!(parse_line("INFO leader elected"), None);
    }

    #[test]
    fn commands_are_line_encoded() {
        assert_eq!(
            command_line(&RoleCommand::Start {
                phase: ClientPhase::Warmup,
                workers: 4,
                duration: Duration::from_secs(5),
            }),
            "warmup 4 5000\n"
        );
        assert_eq!(command_line(&RoleCommand::Stop), "stop\n");
    }

    #[cfg(target_family = "unix")]
    #[tokio::test]
    async fn runs_a_role_process() -> anyhow::Result<()> {
        let scratch = tempfile::tempdir()?;
        let dir = scratch.path().to_path_buf();

        let config = Config::try_from_str(
            r#"
            [[role]]
            kind = "acceptor"
            command = "sh -c 'echo ready; echo hello; read line; echo \"got $line\" >&2'"
            "#,
        )?;
        let launcher = CommandLauncher::new(Arc::new(config), "fast_multipaxos");

        let (mut launch, mut rx) = launch();
        launch.workdir = dir.clone();
        let mut handle_set = crate::roles::RoleSet::new();
        handle_set.push(launcher.launch(launch).await?);

        let first = rx.recv().await.expect("ready event");
        assert_eq!(first.role, 4);
        assert_eq!(first.kind, RoleEventKind::Ready);

        assert!(handle_set.drain(Duration::from_secs(10)).await.is_ok());

        let exited = rx.recv().await.expect("exit event");
        assert_eq!(exited.kind, RoleEventKind::Exited(Some(0)));

        let stdout = std::fs::read_to_string(dir.join("acceptor_1.stdout"))?;
        assert_eq!(stdout, "hello\n");
        let stderr = std::fs::read_to_string(dir.join("acceptor_1.stderr"))?;
        assert_eq!(stderr, "got stop\n");
        Ok(())
    }
}
