/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Live trial metrics and the scrape configuration of monitored trials.
//!
//! Exposes a Prometheus registry at `/metrics`:
//! - `paxbench_trial_index`: index of the running trial
//! - `paxbench_trial_phase{phase}`: 1 for the phase the running trial is in
//! - `paxbench_completions_accepted_total`: measurement completions accepted
//! - `paxbench_completions_discarded_total{reason}`: completions dropped by the phase gate

use crate::{
    topology::{RoleKind, Topology},
    trial_runner::Phase,
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PhaseLabels {
    phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReasonLabels {
    reason: String,
}

/// Why the phase gate dropped a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Warmup,
    Late,
    Malformed,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; 3] = [
        DiscardReason::Warmup,
        DiscardReason::Late,
        DiscardReason::Malformed,
    ];

    fn labels(&self) -> ReasonLabels {
        let reason = match self {
            DiscardReason::Warmup => "warmup",
            DiscardReason::Late => "late",
            DiscardReason::Malformed => "malformed",
        };
        ReasonLabels {
            reason: reason.to_string(),
        }
    }
}

/// Live metrics of the running trial, shared between the runner and the scrape endpoint.
/// Completion counters accumulate over every trial the runner has run.
#[derive(Debug)]
pub struct RunnerMetrics {
    registry: Registry,
    trial: Gauge,
    phase: Family<PhaseLabels, Gauge>,
    accepted: Counter,
    discarded: Family<ReasonLabels, Counter>,
}

impl Default for RunnerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("paxbench");
        let trial = Gauge::default();
        let phase = Family::<PhaseLabels, Gauge>::default();
        let accepted = Counter::default();
        let discarded = Family::<ReasonLabels, Counter>::default();

        registry.register("trial_index", "Index of the running trial", trial.clone());
        registry.register("trial_phase", "Phase the running trial is in", phase.clone());
        registry.register(
            "completions_accepted",
            "Measurement completions accepted",
            accepted.clone(),
        );
        registry.register(
            "completions_discarded",
            "Completions dropped by the phase gate",
            discarded.clone(),
        );

        let metrics = Self {
            registry,
            trial,
            phase,
            accepted,
            discarded,
        };
        // every label shows up in a scrape, even at zero
        for reason in DiscardReason::ALL {
            metrics.discarded.get_or_create(&reason.labels());
        }
        metrics.set_phase(Phase::Provisioning);
        metrics
    }

    pub fn begin_trial(&self, trial: usize) {
        self.trial.set(trial as i64);
        self.set_phase(Phase::Provisioning);
    }

    pub fn set_phase(&self, current: Phase) {
        for phase in Phase::ALL {
            let labels = PhaseLabels {
                phase: phase.metric_label().to_string(),
            };
            self.phase
                .get_or_create(&labels)
                .set(i64::from(phase == current));
        }
    }

    pub fn accept(&self) {
        self.accepted.inc();
    }

    pub fn discard(&self, reason: DiscardReason) {
        self.discarded.get_or_create(&reason.labels()).inc();
    }

    pub fn accepted_total(&self) -> u64 {
        self.accepted.get()
    }

    pub fn discarded_total(&self, reason: DiscardReason) -> u64 {
        self.discarded.get_or_create(&reason.labels()).get()
    }

    /// Encodes the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

async fn metrics_handler(State(metrics): State<Arc<RunnerMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => body.into_response(),
        Err(err) => {
            warn!("Unable to encode metrics: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The `/metrics` endpoint. Stops serving when dropped.
pub struct MetricsServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Serves the runner's metrics on `listen`. A failure to bind is only logged, the trial runs
/// unobserved.
pub async fn serve(listen: SocketAddr, metrics: Arc<RunnerMetrics>) -> Option<MetricsServer> {
    let listener = match tokio::net::TcpListener::bind(listen).await {
        Ok(listener) => listener,
        Err(err) => {
            warn!("Unable to serve metrics on {}: {}", listen, err);
            return None;
        }
    };
    let addr = listener.local_addr().unwrap_or(listen);

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    info!("Serving trial metrics on http://{}/metrics", addr);
    let task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("Metrics endpoint stopped: {}", err);
        }
    });
    Some(MetricsServer { addr, task })
}

// ******** ******** ********
// **   PROMETHEUS CONFIG   **
// ******** ******** ********
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    pub global: GlobalConfig,
    pub scrape_configs: Vec<ScrapeConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub scrape_interval: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,
    pub static_configs: Vec<StaticConfig>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct StaticConfig {
    pub targets: Vec<String>,
}

impl PrometheusConfig {
    /// One job for the runner, if it serves metrics, and one per role kind of the topology.
    pub fn for_topology(
        topology: &Topology,
        runner: Option<SocketAddr>,
        scrape_interval: Duration,
    ) -> Self {
        let job = |name: String, targets: Vec<String>| ScrapeConfig {
            job_name: name,
            static_configs: vec![StaticConfig { targets }],
        };

        let mut scrape_configs = vec![];
        if let Some(runner) = runner {
            scrape_configs.push(job("paxbench".to_string(), vec![runner.to_string()]));
        }
        for kind in [
            RoleKind::Leader,
            RoleKind::Acceptor,
            RoleKind::Replica,
            RoleKind::Client,
        ] {
            let targets = topology
                .role(kind)
                .map(|p| p.metrics_address.to_string())
                .collect::<Vec<_>>();
            if !targets.is_empty() {
                scrape_configs.push(job(kind.to_string(), targets));
            }
        }

        Self {
            global: GlobalConfig {
                scrape_interval: format!("{}ms", scrape_interval.as_millis()),
            },
            scrape_configs,
        }
    }
}

/// Writes a `prometheus.yml` that scrapes the runner and every role of the topology.
pub fn write_prometheus_config(
    path: &Path,
    topology: &Topology,
    runner: Option<SocketAddr>,
    scrape_interval: Duration,
) -> anyhow::Result<()> {
    let config = PrometheusConfig::for_topology(topology, runner, scrape_interval);
    fs::write(path, serde_yaml::to_string(&config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        options::ReplicaOptions,
        topology::{SingleSwitchNet, TopologyProvider},
        trial_input::{Protocol, TrialInput},
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn renders_current_phase_and_counters() -> anyhow::Result<()> {
        let metrics = RunnerMetrics::new();
        metrics.begin_trial(7);
        metrics.set_phase(Phase::Measuring);
        metrics.accept();
        metrics.accept();
        metrics.discard(DiscardReason::Late);

        assert_eq!(metrics.accepted_total(), 2);
        assert_eq!(metrics.discarded_total(DiscardReason::Late), 1);
        assert_eq!(metrics.discarded_total(DiscardReason::Warmup), 0);

        let text = metrics.render()?;
        assert!(text.contains("paxbench_trial_index 7\n"));
        assert!(text.contains("paxbench_trial_phase{phase=\"measuring\"} 1\n"));
        assert!(text.contains("paxbench_trial_phase{phase=\"warmup\"} 0\n"));
        assert!(text.contains("paxbench_completions_accepted_total 2\n"));
        assert!(text.contains("paxbench_completions_discarded_total{reason=\"late\"} 1\n"));
        assert!(text.contains("paxbench_completions_discarded_total{reason=\"malformed\"} 0\n"));
        Ok(())
    }

    #[tokio::test]
    async fn serves_metrics_over_http() -> anyhow::Result<()> {
        let metrics = Arc::new(RunnerMetrics::new());
        metrics.set_phase(Phase::Warmup);

        let server = serve("127.0.0.1:0".parse()?, metrics.clone())
            .await
            .expect("should bind an ephemeral port");

        let mut stream = tokio::net::TcpStream::connect(server.addr).await?;
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await?;
        let mut response = String::new();
        stream.read_to_string(&mut response).await?;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("paxbench_trial_phase{phase=\"warmup\"} 1"));
        Ok(())
    }

    #[test]
    fn prometheus_config_targets_every_role() -> anyhow::Result<()> {
        let input = TrialInput::builder(Protocol::EPaxos {
            replica: ReplicaOptions::default(),
            num_keys: 1,
        })
        .f(1)
        .num_client_procs(2)
        .build();
        let topology = SingleSwitchNet::default().topology_for(&input)?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prometheus.yml");
        write_prometheus_config(
            &path,
            &topology,
            Some("127.0.0.1:9464".parse()?),
            Duration::from_millis(200),
        )?;
        let config: PrometheusConfig = serde_yaml::from_str(&fs::read_to_string(&path)?)?;

        assert_eq!(config.global.scrape_interval, "200ms");
        let jobs = config
            .scrape_configs
            .iter()
            .map(|c| c.job_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(jobs, vec!["paxbench", "replica", "client"]);
        assert_eq!(
            config.scrape_configs[1].static_configs[0].targets,
            vec!["127.0.0.1:12000", "127.0.0.1:12001", "127.0.0.1:12002"]
        );
        assert_eq!(
            config.scrape_configs[2].static_configs[0].targets,
            vec!["127.0.0.1:12003", "127.0.0.1:12004"]
        );
        Ok(())
    }
}
