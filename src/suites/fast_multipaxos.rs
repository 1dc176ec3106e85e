/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::ConfigError,
    options::{AcceptorOptions, ClientOptions, LeaderOptions, RoundSystemType, ThriftySystem},
    summary::Projection,
    suites::{millis, SuiteArgs},
    sweep::{Assignment, AxisSet, Sweep, Value},
    trial_input::{Protocol, Timing, TrialInput, TrialInputBuilder},
};
use std::time::Duration;

pub const THRIFTY: &str = "fmp_thrifty";
pub const ALL: &str = "fmp_all";

/// Settings shared by the Fast Multi-Paxos suites. These suites skip warmup, one client
/// process per client with a single worker each.
fn base(protocol: Protocol, args: &SuiteArgs, num_clients: u32, timeout: Duration) -> TrialInputBuilder {
    TrialInput::builder(protocol)
        .f(1)
        .num_client_procs(num_clients)
        .num_warmup_clients_per_proc(0)
        .num_clients_per_proc(1)
        .timing(Timing {
            duration: Duration::from_secs(20),
            timeout,
            client_lag: Duration::from_secs(5),
            ..Timing::default()
        })
        .observability(args.observability())
        .log_levels(args.log_levels())
}

fn projection() -> Projection {
    Projection::new()
        .axis("num_clients")
        .stop_throughput_p90()
        .median_latency()
}

fn thrifty_system(a: &Assignment) -> Result<ThriftySystem, ConfigError> {
    let name = a.str("thrifty_system")?;
    ThriftySystem::from_name(name).ok_or_else(|| ConfigError::AxisType {
        axis: "thrifty_system".to_string(),
        expected: "thrifty system",
        found: name.to_string(),
    })
}

fn round_system(a: &Assignment) -> Result<RoundSystemType, ConfigError> {
    let name = a.str("round_system")?;
    RoundSystemType::from_name(name).ok_or_else(|| ConfigError::AxisType {
        axis: "round_system".to_string(),
        expected: "round system",
        found: name.to_string(),
    })
}

/// Fast Multi-Paxos with every thrifty system as the number of clients grows.
pub fn thrifty(args: &SuiteArgs) -> Sweep {
    let axes = AxisSet::new()
        .axis("num_clients", 1..15)
        .axis(
            "thrifty_system",
            [
                ThriftySystem::NotThrifty,
                ThriftySystem::Random,
                ThriftySystem::Closest,
            ]
            .map(|t| t.name()),
        );

    let args = args.clone();
    Sweep::new(
        THRIFTY,
        axes,
        3,
        move |a| {
            let protocol = Protocol::FastMultiPaxos {
                round_system: RoundSystemType::ClassicRoundRobin,
                acceptor: AcceptorOptions::default()
                    .with_wait_period(Duration::ZERO)
                    .with_wait_stagger(Duration::ZERO),
                leader: LeaderOptions::default().with_thrifty_system(thrifty_system(a)?),
            };
            Ok(base(protocol, &args, a.uint("num_clients")?, Duration::from_secs(60))
                .client_options(
                    ClientOptions::default()
                        .with_repropose_period(Duration::from_millis(50))
                        .with_timeout(Duration::from_secs(60)),
                )
                .build())
        },
        projection().axis("thrifty_system"),
    )
}

/// Fast Multi-Paxos under both round systems. Mixed round robin is swept over acceptor wait
/// periods, and clients never repropose faster than twice the wait period or 50ms.
pub fn all(args: &SuiteArgs) -> Sweep {
    let axes = AxisSet::new()
        .axis("num_clients", [1, 10, 20, 30])
        .axis(
            "round_system",
            [
                RoundSystemType::ClassicRoundRobin,
                RoundSystemType::MixedRoundRobin,
            ]
            .map(|r| r.name()),
        )
        .derived("wait", &["round_system"], |a| {
            match a.str("round_system") {
                Ok(name) if name == RoundSystemType::ClassicRoundRobin.name() => {
                    vec![Value::from((0.0, 0.0))]
                }
                _ => [0.01, 0.1, 1.0, 10.0]
                    .into_iter()
                    .map(|wait| Value::from((wait, 0.0)))
                    .collect(),
            }
        })
        .derived("repropose_period_ms", &["wait"], |a| {
            let wait = a
                .tuple("wait")
                .ok()
                .and_then(|w| w.first())
                .and_then(|w| w.as_f64())
                .unwrap_or(0.0);
            vec![Value::from(f64::max(50.0, wait * 2.0))]
        });

    let args = args.clone();
    Sweep::new(
        ALL,
        axes,
        3,
        move |a| {
            let wait = a.tuple("wait")?;
            let period = |i: usize| {
                wait.get(i)
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| ConfigError::AxisType {
                        axis: "wait".to_string(),
                        expected: "pair of numbers",
                        found: Value::Tuple(wait.to_vec()).to_string(),
                    })
            };

            let protocol = Protocol::FastMultiPaxos {
                round_system: round_system(a)?,
                acceptor: AcceptorOptions::default()
                    .with_wait_period(millis(period(0)?))
                    .with_wait_stagger(millis(period(1)?)),
                leader: LeaderOptions::default().with_thrifty_system(ThriftySystem::NotThrifty),
            };
            Ok(base(protocol, &args, a.uint("num_clients")?, Duration::from_secs(120))
                .client_options(
                    ClientOptions::default()
                        .with_repropose_period(millis(a.float("repropose_period_ms")?)),
                )
                .build())
        },
        projection().axis("round_system").axis("wait"),
    )
}
