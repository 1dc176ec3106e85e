/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::Path};

/// The client phase a request was issued in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientPhase {
    Warmup,
    Measure,
}

impl ClientPhase {
    pub fn name(&self) -> &'static str {
        match self {
            ClientPhase::Warmup => "warmup",
            ClientPhase::Measure => "measure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "warmup" => Some(ClientPhase::Warmup),
            "measure" => Some(ClientPhase::Measure),
            _ => None,
        }
    }
}

/// One finished client request. Timestamps are microseconds on a clock shared by all clients of
/// a trial; only differences between them are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub phase: ClientPhase,
    pub worker: u32,
    pub start_us: i64,
    pub stop_us: i64,
    pub ok: bool,
}

impl Completion {
    pub fn latency_us(&self) -> i64 {
        self.stop_us - self.start_us
    }

    /// Parses the fields that follow the `completion` keyword:
    /// `<phase> <worker> <start_us> <stop_us> <ok|err>`.
    pub fn parse(fields: &str) -> Option<Completion> {
        let mut parts = fields.split_whitespace();
        let phase = ClientPhase::parse(parts.next()?)?;
        let worker = parts.next()?.parse().ok()?;
        let start_us: i64 = parts.next()?.parse().ok()?;
        let stop_us: i64 = parts.next()?.parse().ok()?;
        let ok = match parts.next()? {
            "ok" => true,
            "err" => false,
            _ => return None,
        };
        if parts.next().is_some() || stop_us < start_us {
            return None;
        }

        Some(Completion {
            phase,
            worker,
            start_us,
            stop_us,
            ok,
        })
    }
}

/// Everything the runner saw from clients over the course of a trial.
///
/// Only completions accepted while measuring end up in `accepted`; everything else is counted
/// and dropped.
#[derive(Debug, Default)]
pub struct TelemetryLog {
    accepted: Vec<(String, Completion)>,
    per_client: BTreeMap<String, u64>,
    warmup_discarded: u64,
    late_discarded: u64,
    malformed: u64,
}

impl TelemetryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client so that one which never reports anything is noticed.
    pub fn expect_client(&mut self, client: &str) {
        self.per_client.entry(client.to_string()).or_insert(0);
    }

    pub fn accept(&mut self, client: &str, completion: Completion) {
        *self.per_client.entry(client.to_string()).or_insert(0) += 1;
        self.accepted.push((client.to_string(), completion));
    }

    pub fn discard_warmup(&mut self) {
        self.warmup_discarded += 1;
    }

    pub fn discard_late(&mut self) {
        self.late_discarded += 1;
    }

    pub fn record_malformed(&mut self) {
        self.malformed += 1;
    }

    pub fn completions(&self) -> impl Iterator<Item = &Completion> {
        self.accepted.iter().map(|(_, c)| c)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.len()
    }

    pub fn warmup_discarded(&self) -> u64 {
        self.warmup_discarded
    }

    pub fn late_discarded(&self) -> u64 {
        self.late_discarded
    }

    pub fn malformed(&self) -> u64 {
        self.malformed
    }

    /// Clients that were expected but delivered no measurement completions.
    pub fn silent_clients(&self) -> Vec<&str> {
        self.per_client
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Writes the accepted completions as CSV, one [`TelemetryRow`] per completion.
    pub fn write_csv(&self, path: &Path) -> anyhow::Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Unable to create telemetry log {}", path.display()))?;
        for (client, c) in self.accepted.iter() {
            writer.serialize(TelemetryRow {
                client: client.clone(),
                worker: c.worker,
                start_us: c.start_us,
                stop_us: c.stop_us,
                latency_us: c.latency_us(),
                ok: c.ok,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One line of `telemetry.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub client: String,
    pub worker: u32,
    pub start_us: i64,
    pub stop_us: i64,
    pub latency_us: i64,
    pub ok: bool,
}
