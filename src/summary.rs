/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    suite_controller::TrialStatus,
    sweep::Assignment,
    trial_output::TrialOutput,
};
use anyhow::Context;
use colored::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::{fs, path::Path};
use term_table::{row::Row, table_cell::TableCell, Table, TableStyle};

type OutputFn = fn(&TrialOutput) -> Option<f64>;

#[derive(Debug, Clone)]
pub enum Column {
    /// The value a sweep axis took.
    Axis(String),
    /// A statistic of the trial output.
    Output { header: String, value: OutputFn },
}

impl Column {
    pub fn header(&self) -> &str {
        match self {
            Column::Axis(axis) => axis,
            Column::Output { header, .. } => header,
        }
    }
}

/// Which input fields and output statistics a suite's summary shows.
#[derive(Debug, Clone, Default)]
pub struct Projection {
    columns: Vec<Column>,
}

impl Projection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis(mut self, axis: &str) -> Self {
        self.columns.push(Column::Axis(axis.to_string()));
        self
    }

    pub fn output(mut self, header: &str, value: OutputFn) -> Self {
        self.columns.push(Column::Output {
            header: header.to_string(),
            value,
        });
        self
    }

    /// p90 of the 1s rolling throughput over request stop times.
    pub fn stop_throughput_p90(self) -> Self {
        self.output("stop_throughput_1s.p90", |o| o.stop_throughput_1s().map(|p| p.p90))
    }

    pub fn median_latency(self) -> Self {
        self.output("latency_ms.median", |o| Some(o.latency_ms.median))
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

/// One trial as the summary sees it.
pub struct SummaryEntry<'a> {
    pub index: usize,
    pub status: TrialStatus,
    pub assignment: &'a Assignment,
    pub output: Option<&'a TrialOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Json>>,
}

fn cell_text(value: &Json) -> String {
    match value {
        Json::Null => "--".to_string(),
        Json::String(s) => s.clone(),
        Json::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format!("{:.1}", f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

impl Summary {
    pub fn build(projection: &Projection, entries: &[SummaryEntry]) -> Self {
        let mut headers = vec!["trial".to_string(), "status".to_string()];
        headers.extend(projection.columns().iter().map(|c| c.header().to_string()));

        let rows = entries
            .iter()
            .map(|entry| {
                let mut row = vec![
                    Json::from(entry.index),
                    Json::from(entry.status.to_string()),
                ];
                for column in projection.columns() {
                    let value = match column {
                        Column::Axis(axis) => entry
                            .assignment
                            .get(axis)
                            .and_then(|v| serde_json::to_value(v).ok())
                            .unwrap_or(Json::Null),
                        Column::Output { value, .. } => entry
                            .output
                            .and_then(value)
                            .map(Json::from)
                            .unwrap_or(Json::Null),
                    };
                    row.push(value);
                }
                row
            })
            .collect();

        Self { headers, rows }
    }

    /// Renders the summary as a table. Styling adds ANSI colours and is meant for terminals only.
    pub fn render(&self, styled: bool) -> String {
        let header = Row::new(
            self.headers
                .iter()
                .map(|h| match styled {
                    true => TableCell::new(h.bold()),
                    false => TableCell::new(h),
                })
                .collect::<Vec<_>>(),
        );

        let mut rows = vec![header];
        for row in self.rows.iter() {
            let cells = row
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let text = cell_text(value);
                    match (styled, i) {
                        (true, 1) if text == "completed" => TableCell::new(text.green()),
                        (true, 1) => TableCell::new(text.red()),
                        _ => TableCell::new(text),
                    }
                })
                .collect::<Vec<_>>();
            rows.push(Row::new(cells));
        }

        Table::builder()
            .rows(rows)
            .style(TableStyle::rounded())
            .build()
            .render()
    }

    /// Writes `summary.txt` and `summary.json` into the suite directory.
    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        fs::write(dir.join("summary.txt"), self.render(false))
            .context(format!("Unable to write summary to {}", dir.display()))?;
        fs::write(dir.join("summary.json"), serde_json::to_vec_pretty(self)?)
            .context(format!("Unable to write summary to {}", dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sweep::AxisSet,
        trial_output::{Percentiles, WindowedThroughput},
    };

    fn percentiles(v: f64) -> Percentiles {
        Percentiles {
            mean: v,
            median: v,
            min: v,
            max: v,
            p90: v,
            p95: v,
            p99: v,
        }
    }

    fn output(throughput: f64) -> TrialOutput {
        TrialOutput {
            num_requests: 100,
            num_failed_requests: 0,
            warmup_discarded: 0,
            late_discarded: 0,
            malformed_records: 0,
            incomplete: false,
            latency_ms: percentiles(1.5),
            throughput: vec![WindowedThroughput {
                window_ms: 1000,
                start: percentiles(throughput),
                stop: percentiles(throughput),
            }],
        }
    }

    #[test]
    fn projects_axes_and_outputs() -> anyhow::Result<()> {
        let assignments = AxisSet::new()
            .axis("f", [1, 2])
            .axis("client_num_keys", [10])
            .expand(1)?;
        let out = output(1234.0);

        let entries = vec![
            SummaryEntry {
                index: 0,
                status: TrialStatus::Completed,
                assignment: &assignments[0],
                output: Some(&out),
            },
            SummaryEntry {
                index: 1,
                status: TrialStatus::Failed,
                assignment: &assignments[1],
                output: None,
            },
        ];
        let projection = Projection::new()
            .axis("f")
            .axis("client_num_keys")
            .stop_throughput_p90();
        let summary = Summary::build(&projection, &entries);

        assert_eq!(
            summary.headers,
            vec!["trial", "status", "f", "client_num_keys", "stop_throughput_1s.p90"]
        );
        assert_eq!(summary.rows[0][4], Json::from(1234.0));
        assert_eq!(summary.rows[1][1], Json::from("failed"));
        assert_eq!(summary.rows[1][4], Json::Null);

        let text = summary.render(false);
        assert!(text.contains("1234.0"));
        assert!(text.contains("--"));
        assert!(text.contains("client_num_keys"));
        Ok(())
    }

    #[test]
    fn writes_both_artifacts() -> anyhow::Result<()> {
        let scratch = tempfile::tempdir()?;
        let dir = scratch.path();

        let summary = Summary {
            headers: vec!["trial".to_string()],
            rows: vec![vec![Json::from(0)]],
        };
        summary.write(dir)?;

        let json: Summary = serde_json::from_slice(&fs::read(dir.join("summary.json"))?)?;
        assert_eq!(json, summary);
        assert!(dir.join("summary.txt").exists());
        Ok(())
    }
}
