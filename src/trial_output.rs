/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    errors::TrialError,
    telemetry::{Completion, TelemetryLog},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fewer successful measurement completions than this and percentiles stop meaning anything.
pub const MIN_SAMPLES: usize = 10;

/// Rolling windows over which throughput is computed.
pub const THROUGHPUT_WINDOWS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl Percentiles {
    /// Summarises the given samples. Percentiles interpolate linearly between the closest ranks.
    pub fn of(mut samples: Vec<f64>) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(Self {
            mean,
            median: percentile(&samples, 50.0),
            min: samples[0],
            max: samples[samples.len() - 1],
            p90: percentile(&samples, 90.0),
            p95: percentile(&samples, 95.0),
            p99: percentile(&samples, 99.0),
        })
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// Requests per second seen over a rolling window ending at every sample.
fn rolling_throughput(sorted_us: &[i64], window: Duration) -> Vec<f64> {
    let window_us = window.as_micros() as i64;
    let window_secs = window.as_secs_f64();

    let mut lo = 0;
    sorted_us
        .iter()
        .enumerate()
        .map(|(i, t)| {
            while sorted_us[lo] <= t - window_us {
                lo += 1;
            }
            (i - lo + 1) as f64 / window_secs
        })
        .collect()
}

/// Throughput of one rolling window, once over request start times and once over stop times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedThroughput {
    pub window_ms: u64,
    pub start: Percentiles,
    pub stop: Percentiles,
}

/// The reduced result of one trial's measurement phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutput {
    pub num_requests: u64,
    pub num_failed_requests: u64,
    pub warmup_discarded: u64,
    pub late_discarded: u64,
    pub malformed_records: u64,
    /// Set when some telemetry was malformed or a client reported nothing.
    pub incomplete: bool,
    pub latency_ms: Percentiles,
    pub throughput: Vec<WindowedThroughput>,
}

impl TrialOutput {
    fn window(&self, window: Duration) -> Option<&WindowedThroughput> {
        let window_ms = window.as_millis() as u64;
        self.throughput.iter().find(|w| w.window_ms == window_ms)
    }

    pub fn stop_throughput(&self, window: Duration) -> Option<&Percentiles> {
        self.window(window).map(|w| &w.stop)
    }

    pub fn stop_throughput_1s(&self) -> Option<&Percentiles> {
        self.stop_throughput(Duration::from_secs(1))
    }
}

/// Reduces raw measurement telemetry into a [`TrialOutput`].
///
/// Malformed records or silent clients only flag the output as incomplete. Too few successful
/// completions to compute percentiles fails the trial.
pub fn reduce(log: &TelemetryLog) -> Result<TrialOutput, TrialError> {
    let (ok, failed): (Vec<&Completion>, Vec<&Completion>) =
        log.completions().partition(|c| c.ok);

    if ok.len() < MIN_SAMPLES {
        return Err(TrialError::Telemetry(format!(
            "only {} successful completions were recorded, at least {} are needed",
            ok.len(),
            MIN_SAMPLES
        )));
    }

    let silent = log.silent_clients();
    if !silent.is_empty() {
        tracing::warn!("clients {} reported no completions", silent.join(", "));
    }
    if log.malformed() > 0 {
        tracing::warn!("{} malformed telemetry records were dropped", log.malformed());
    }

    let latencies = ok
        .iter()
        .map(|c| c.latency_us() as f64 / 1000.0)
        .collect_vec();
    let latency_ms = Percentiles::of(latencies)
        .ok_or_else(|| TrialError::Telemetry("no latency samples".to_string()))?;

    let starts = ok.iter().map(|c| c.start_us).sorted().collect_vec();
    let stops = ok.iter().map(|c| c.stop_us).sorted().collect_vec();

    let mut throughput = vec![];
    for window in THROUGHPUT_WINDOWS {
        let start = Percentiles::of(rolling_throughput(&starts, window));
        let stop = Percentiles::of(rolling_throughput(&stops, window));
        if let (Some(start), Some(stop)) = (start, stop) {
            throughput.push(WindowedThroughput {
                window_ms: window.as_millis() as u64,
                start,
                stop,
            });
        }
    }

    Ok(TrialOutput {
        num_requests: ok.len() as u64,
        num_failed_requests: failed.len() as u64,
        warmup_discarded: log.warmup_discarded(),
        late_discarded: log.late_discarded(),
        malformed_records: log.malformed(),
        incomplete: log.malformed() > 0 || !silent.is_empty(),
        latency_ms,
        throughput,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ClientPhase;

    fn completion(start_us: i64, latency_us: i64, ok: bool) -> Completion {
        Completion {
            phase: ClientPhase::Measure,
            worker: 0,
            start_us,
            stop_us: start_us + latency_us,
            ok,
        }
    }

    #[test]
    fn percentiles_interpolate() {
        let p = Percentiles::of(vec![4.0, 1.0, 3.0, 2.0, 5.0]).expect("non-empty");
        assert_eq!(p.min, 1.0);
        assert_eq!(p.max, 5.0);
        assert_eq!(p.median, 3.0);
        assert_eq!(p.mean, 3.0);
        assert!((p.p90 - 4.6).abs() < 1e-9);
        assert!(Percentiles::of(vec![]).is_none());
    }

    #[test]
    fn steady_rate_gives_steady_throughput() -> anyhow::Result<()> {
        // one request every 10ms for 10s
        let mut log = TelemetryLog::new();
        for i in 0..1000 {
            log.accept("client_0", completion(i * 10_000, 2_000, true));
        }

        let output = reduce(&log)?;
        let stop = output.stop_throughput_1s().expect("1s window");
        assert_eq!(stop.min, 1.0);
        assert_eq!(stop.max, 100.0);
        assert_eq!(stop.median, 100.0);
        assert_eq!(stop.p90, 100.0);
        assert_eq!(output.latency_ms.median, 2.0);
        assert_eq!(output.num_requests, 1000);
        assert!(!output.incomplete);
        assert!(output.stop_throughput(Duration::from_secs(5)).is_some());
        Ok(())
    }

    #[test]
    fn too_few_samples_is_a_telemetry_failure() {
        let mut log = TelemetryLog::new();
        for i in 0..(MIN_SAMPLES as i64 - 1) {
            log.accept("client_0", completion(i, 1, true));
        }
        log.accept("client_0", completion(100, 1, false));

        assert!(matches!(reduce(&log), Err(TrialError::Telemetry(_))));
    }

    #[test]
    fn malformed_records_degrade_instead_of_failing() -> anyhow::Result<()> {
        let mut log = TelemetryLog::new();
        log.expect_client("client_1");
        for i in 0..50 {
            log.accept("client_0", completion(i * 1000, 500, i % 10 != 0));
        }
        log.record_malformed();

        let output = reduce(&log)?;
        assert!(output.incomplete);
        assert_eq!(output.num_requests, 45);
        assert_eq!(output.num_failed_requests, 5);
        assert_eq!(output.malformed_records, 1);
        Ok(())
    }
}
