/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    options::{ClientOptions, ReplicaOptions},
    summary::Projection,
    suites::SuiteArgs,
    sweep::{AxisSet, Sweep},
    trial_input::{Protocol, Timing, TrialInput},
};
use std::time::Duration;

pub const NUM_KEYS: &str = "epaxos_num_keys";

/// EPaxos throughput as the number of keys clients spread their commands over grows.
pub fn num_keys(args: &SuiteArgs) -> Sweep {
    let axes = AxisSet::new()
        .axis("f", [1, 2])
        .axis("client_num_keys", [1, 10, 100, 1000, 10000]);

    let timing = Timing {
        warmup_duration: Duration::from_secs(5),
        warmup_timeout: Duration::from_secs(10),
        warmup_sleep: Duration::from_secs(5),
        duration: Duration::from_secs(20),
        timeout: Duration::from_secs(60),
        client_lag: Duration::from_secs(5),
        ..Timing::default()
    };
    let observability = args.observability();
    let log_levels = args.log_levels();

    Sweep::new(
        NUM_KEYS,
        axes,
        3,
        move |a| {
            Ok(TrialInput::builder(Protocol::EPaxos {
                replica: ReplicaOptions::default(),
                num_keys: a.uint("client_num_keys")?,
            })
            .f(a.uint("f")?)
            .num_client_procs(4)
            .num_warmup_clients_per_proc(10)
            .num_clients_per_proc(10)
            .client_options(
                ClientOptions::default().with_repropose_period(Duration::from_millis(500)),
            )
            .timing(timing)
            .observability(observability)
            .log_levels(log_levels.clone())
            .build())
        },
        Projection::new()
            .axis("f")
            .axis("client_num_keys")
            .stop_throughput_p90(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plans_thirty_trials() -> anyhow::Result<()> {
        let plan = num_keys(&SuiteArgs::default()).plan()?;
        assert_eq!(plan.len(), 30);

        let first = &plan[0].input;
        assert_eq!(first.f(), 1);
        assert_eq!(first.clients().num_client_procs, 4);
        assert_eq!(first.clients().num_clients_per_proc, 10);
        assert_eq!(first.timing().lag(), Duration::from_secs(10));
        assert_eq!(
            first.client_options().repropose_period,
            Duration::from_millis(500)
        );
        assert!(matches!(
            first.protocol(),
            Protocol::EPaxos { num_keys: 1, .. }
        ));

        // the second pass repeats the first
        for i in 0..10 {
            assert_eq!(plan[i].input, plan[i + 10].input);
            assert_eq!(plan[i + 10].repetition, 1);
        }
        assert!(matches!(
            plan[9].input.protocol(),
            Protocol::EPaxos { num_keys: 10000, .. }
        ));
        assert_eq!(plan[9].input.f(), 2);
        Ok(())
    }
}
