//! Pool of upload endpoints with round-robin selection and cool-down tracking.

use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointHealth {
    Healthy,
    CoolingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub address: String,
    pub health: EndpointHealth,
    pub load: u64,
    pub failures: u64,
}

#[derive(Debug)]
struct Endpoint {
    address: String,
    cooling_until: Mutex<Option<Instant>>,
    load: AtomicU64,
    failures: AtomicU64,
}

impl Endpoint {
    fn is_healthy_at(&self, now: Instant) -> bool {
        let mut cooling_until = self
            .cooling_until
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match *cooling_until {
            Some(until) if until > now => false,
            Some(_) => {
                *cooling_until = None;
                true
            }
            None => true,
        }
    }
}

#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    cursor: AtomicUsize,
    cooldown: Duration,
}

impl EndpointPool {
    pub fn new(addresses: Vec<String>, cooldown: Duration) -> Self {
        let endpoints = addresses
            .into_iter()
            .map(|address| Endpoint {
                address,
                cooling_until: Mutex::new(None),
                load: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
            .collect();

        Self {
            endpoints,
            cursor: AtomicUsize::new(0),
            cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Next healthy endpoint in round-robin order, or `None` when every
    /// endpoint is cooling down.
    pub fn select(&self) -> Option<String> {
        let count = self.endpoints.len();
        if count == 0 {
            return None;
        }

        let now = Instant::now();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        (0..count)
            .map(|step| &self.endpoints[(start + step) % count])
            .find(|endpoint| endpoint.is_healthy_at(now))
            .map(|endpoint| endpoint.address.clone())
    }

    pub fn record_success(&self, address: &str) {
        if let Some(endpoint) = self.find(address) {
            endpoint.load.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Excludes the endpoint from rotation for the configured cool-down.
    pub fn mark_unhealthy(&self, address: &str) {
        if let Some(endpoint) = self.find(address) {
            endpoint.failures.fetch_add(1, Ordering::Relaxed);
            let mut cooling_until = endpoint
                .cooling_until
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *cooling_until = Some(Instant::now() + self.cooldown);
            tracing::warn!(
                "Endpoint {} marked unhealthy for {}s",
                redact(address),
                self.cooldown.as_secs()
            );
        }
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        let now = Instant::now();
        self.endpoints
            .iter()
            .map(|endpoint| EndpointStats {
                address: redact(&endpoint.address),
                health: if endpoint.is_healthy_at(now) {
                    EndpointHealth::Healthy
                } else {
                    EndpointHealth::CoolingDown
                },
                load: endpoint.load.load(Ordering::Relaxed),
                failures: endpoint.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    fn find(&self, address: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.address == address)
    }
}

/// Webhook urls embed their secret token as the last path segment.
pub fn redact(address: &str) -> String {
    match address.rsplit_once('/') {
        Some((head, tail)) if tail.len() > 8 => {
            let visible: String = tail.chars().take(4).collect();
            format!("{}/{}…", head, visible)
        }
        _ => address.to_string(),
    }
}
