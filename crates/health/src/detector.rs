//! Periodic node assessment
//!
//! The detector keeps only the outcome of the latest poll. Every verdict is
//! derived from that snapshot and the current time, so a detector whose
//! polls keep failing drifts from healthy to degraded on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::error::HealthError;
use crate::probe::{NodeProbe, NodeSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// No poll has succeeded yet
    Down,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorSettings {
    pub poll_interval: Duration,
    pub staleness: Duration,
}

impl DetectorSettings {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            staleness: config.staleness(),
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    sample: Option<NodeSample>,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Verdict at a point in time
#[derive(Debug, Clone, Serialize)]
pub struct Assessment {
    pub status: HealthStatus,
    pub reasons: Vec<String>,
    pub sample: Option<NodeSample>,
    pub last_poll: Option<DateTime<Utc>>,
}

pub struct Detector {
    probe: Arc<dyn NodeProbe>,
    settings: DetectorSettings,
    snapshot: RwLock<Snapshot>,
}

impl Detector {
    pub fn new(probe: Arc<dyn NodeProbe>, settings: DetectorSettings) -> Self {
        Self {
            probe,
            settings,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    pub fn endpoint(&self) -> String {
        self.probe.endpoint()
    }

    /// Sample the node once and record the outcome
    pub async fn poll(&self) -> Result<(), HealthError> {
        let result = self.probe.sample().await;
        let mut snapshot = self.snapshot.write().await;
        match result {
            Ok(sample) => {
                debug!(
                    "Node at block {} ({} peers, {} behind)",
                    sample.head_number, sample.peer_count, sample.behind
                );
                snapshot.sample = Some(sample);
                snapshot.last_success = Some(Utc::now());
                snapshot.last_error = None;
                Ok(())
            }
            Err(e) => {
                snapshot.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Poll immediately, then every `poll_interval` until aborted
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            "Polling {} every {:?}",
            self.probe.endpoint(),
            self.settings.poll_interval
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll().await {
                    warn!("Health poll failed: {}", e);
                }
            }
        })
    }

    pub async fn assess(&self) -> Assessment {
        self.assess_at(Utc::now()).await
    }

    pub async fn assess_at(&self, now: DateTime<Utc>) -> Assessment {
        let snapshot = self.snapshot.read().await;
        evaluate(&snapshot, now, self.settings.staleness)
    }
}

fn evaluate(snapshot: &Snapshot, now: DateTime<Utc>, staleness: Duration) -> Assessment {
    let mut reasons = Vec::new();

    let (Some(sample), Some(last_success)) = (&snapshot.sample, snapshot.last_success) else {
        reasons.push("no successful poll yet".to_string());
        if let Some(e) = &snapshot.last_error {
            reasons.push(format!("last poll failed: {}", e));
        }
        return Assessment {
            status: HealthStatus::Down,
            reasons,
            sample: None,
            last_poll: None,
        };
    };

    let limit = staleness.as_secs() as i64;

    let poll_age = (now - last_success).num_seconds();
    if poll_age > limit {
        let mut reason = format!("last successful poll was {}s ago", poll_age);
        if let Some(e) = &snapshot.last_error {
            reason.push_str(&format!(" (last error: {})", e));
        }
        reasons.push(reason);
    }

    let head_age = now.timestamp() - sample.head_timestamp as i64;
    if head_age > limit {
        reasons.push(format!(
            "head block {} is {}s old",
            sample.head_number, head_age
        ));
    }
    if sample.behind > 0 {
        reasons.push(format!("syncing, {} blocks behind", sample.behind));
    }
    if sample.peer_count == 0 {
        reasons.push("no peers".to_string());
    }

    Assessment {
        status: if reasons.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        },
        reasons,
        sample: Some(sample.clone()),
        last_poll: Some(last_success),
    }
}
