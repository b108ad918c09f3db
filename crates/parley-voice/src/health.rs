//! HTTP liveness probing for the local inference servers.
//!
//! Probe results are values, never errors: a failed request, a non-2xx status
//! and a timeout all read as `Unreachable`.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a single health request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reachability {
    Reachable,
    Unreachable { reason: String },
}

impl Reachability {
    pub fn is_reachable(&self) -> bool {
        matches!(self, Reachability::Reachable)
    }
}

/// Most recent probe result for one server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub server_name: String,
    pub reachable: bool,
    pub last_checked_at: DateTime<Utc>,
}

/// A named health endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTarget {
    pub name: String,
    pub url: String,
}

impl HealthTarget {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// Result of [`HealthProbe::wait_until_ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessReport {
    AllReady,
    /// The attempt budget ran out; lists the targets still unreachable on the last round.
    PartialTimeout { unreachable: Vec<String> },
}

/// Optional JSON body of the local servers' `/health` route.
#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    model_loaded: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    /// Create a probe whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Issue one bounded GET against `url`.
    pub async fn check(&self, url: &str, timeout: Duration) -> Reachability {
        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Reachability::Unreachable {
                    reason: format!("timed out after {:?}", timeout),
                }
            }
            Err(e) => {
                return Reachability::Unreachable {
                    reason: e.to_string(),
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Reachability::Unreachable {
                reason: format!("unexpected status: {}", status),
            };
        }

        // A server that is up but still loading its model is not ready yet.
        match response.json::<HealthBody>().await {
            Ok(HealthBody {
                model_loaded: Some(false),
            }) => Reachability::Unreachable {
                reason: "model not loaded".to_string(),
            },
            _ => Reachability::Reachable,
        }
    }

    /// Probe a target with the default timeout and stamp the result.
    pub async fn probe(&self, target: &HealthTarget) -> HealthStatus {
        let result = self.check(&target.url, self.timeout).await;
        if let Reachability::Unreachable { reason } = &result {
            debug!(server = %target.name, url = %target.url, %reason, "health check failed");
        }
        HealthStatus {
            server_name: target.name.clone(),
            reachable: result.is_reachable(),
            last_checked_at: Utc::now(),
        }
    }

    /// Poll every target each `interval` until all answer in the same round,
    /// or `max_attempts` rounds have passed.
    pub async fn wait_until_ready(
        &self,
        targets: &[HealthTarget],
        max_attempts: u32,
        interval: Duration,
    ) -> ReadinessReport {
        let max_attempts = max_attempts.max(1);
        let mut unreachable = Vec::new();

        for attempt in 1..=max_attempts {
            let statuses = join_all(targets.iter().map(|t| self.probe(t))).await;
            unreachable = statuses
                .into_iter()
                .filter(|s| !s.reachable)
                .map(|s| s.server_name)
                .collect();

            if unreachable.is_empty() {
                info!(attempt, "all servers healthy");
                return ReadinessReport::AllReady;
            }
            debug!(attempt, max_attempts, ?unreachable, "waiting for servers");

            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(?unreachable, max_attempts, "servers did not become ready");
        ReadinessReport::PartialTimeout { unreachable }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
