//! Periodic process and endpoint sampling, reported through a hook.

use chrono::{DateTime, Utc};
use hookdrive_core::{EndpointHealth, EndpointStats, Manager};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct DiagnosticsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// `None` where the platform does not expose it.
    pub rss_bytes: Option<u64>,
    pub endpoints: Vec<EndpointStats>,
}

impl DiagnosticsSnapshot {
    pub fn capture(manager: &Manager) -> Self {
        Self {
            taken_at: Utc::now(),
            rss_bytes: process_rss(),
            endpoints: manager.endpoint_stats(),
        }
    }

    pub fn healthy_endpoints(&self) -> usize {
        self.endpoints
            .iter()
            .filter(|stats| stats.health == EndpointHealth::Healthy)
            .count()
    }

    pub fn total_load(&self) -> u64 {
        self.endpoints.iter().map(|stats| stats.load).sum()
    }
}

pub trait MetricsHook: Send + Sync {
    fn sample(&self, snapshot: &DiagnosticsSnapshot);
}

/// Writes each sample to the log.
#[derive(Debug, Default)]
pub struct LoggingHook;

impl MetricsHook for LoggingHook {
    fn sample(&self, snapshot: &DiagnosticsSnapshot) {
        tracing::info!(
            "memory usage: rss {} | endpoints healthy {}/{} | chunks placed {}",
            snapshot
                .rss_bytes
                .map(format_memory_size)
                .unwrap_or_else(|| "unknown".to_string()),
            snapshot.healthy_endpoints(),
            snapshot.endpoints.len(),
            snapshot.total_load()
        );
        for stats in &snapshot.endpoints {
            tracing::debug!(
                "endpoint {}: {:?} load={} failures={}",
                stats.address,
                stats.health,
                stats.load,
                stats.failures
            );
        }
    }
}

pub fn spawn_sampler(
    manager: Arc<Manager>,
    hook: Arc<dyn MetricsHook>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            hook.sample(&DiagnosticsSnapshot::capture(&manager));
        }
    })
}

/// Resident set size of this process in bytes.
pub fn process_rss() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

pub fn format_memory_size(bytes: u64) -> String {
    if bytes > 1024 * 1024 * 1024 {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes > 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes > 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} bytes", bytes)
    }
}
