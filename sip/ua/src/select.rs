//! Outbound destination selection.
//!
//! Endpoints are filtered by health, grouped by priority and picked by
//! accumulated weight inside the best group. The set itself is
//! immutable after construction, only the per-endpoint health state
//! changes.

use crate::config::EndpointConfig;
use crate::error::Error;
use crate::transport::TransportType;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

/// Consecutive failures after which an endpoint is taken out of
/// rotation until the next success
const FAILURE_THRESHOLD: u32 = 5;

/// A remote destination with selection metadata and health state
#[derive(Debug)]
pub struct RemoteEndpoint {
    pub name: String,
    pub host: IpAddr,
    pub port: u16,
    pub transport_type: TransportType,
    pub priority: u16,
    pub weight: u16,

    healthy: AtomicBool,
    failure_count: AtomicU32,
    last_used: Mutex<Option<Instant>>,
}

impl RemoteEndpoint {
    fn from_config(config: &EndpointConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host,
            port: config.port,
            transport_type: config.transport_type,
            priority: config.priority,
            weight: config.weight,
            healthy: AtomicBool::new(true),
            failure_count: AtomicU32::new(0),
            last_used: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Resets the failure counter and returns the endpoint into
    /// rotation
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.healthy.store(true, Ordering::Release);
    }

    /// After [`FAILURE_THRESHOLD`] consecutive failures the endpoint is
    /// marked unhealthy
    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;

        if failures >= FAILURE_THRESHOLD {
            self.healthy.store(false, Ordering::Release);
        }
    }

    fn mark_used(&self) {
        *self.last_used.lock() = Some(Instant::now());
    }

    pub fn last_used(&self) -> Option<Instant> {
        *self.last_used.lock()
    }
}

/// Ordered collection of remote endpoints, one is picked per outbound
/// dialog
#[derive(Debug, Default)]
pub struct EndpointSet {
    endpoints: Vec<RemoteEndpoint>,
}

impl EndpointSet {
    pub fn from_configs(configs: &[EndpointConfig]) -> Result<Self, Error> {
        let mut names = HashSet::new();

        for config in configs {
            if !names.insert(config.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate endpoint name {:?}",
                    config.name
                )));
            }
        }

        Ok(Self {
            endpoints: configs.iter().map(RemoteEndpoint::from_config).collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Priority-then-weight selection over the healthy endpoints.
    ///
    /// The lowest priority value wins; within that group the pick is
    /// random, proportional to weight. Returns `None` when every
    /// endpoint is unhealthy.
    pub fn select(&self) -> Option<&RemoteEndpoint> {
        let healthy: Vec<&RemoteEndpoint> =
            self.endpoints.iter().filter(|e| e.is_healthy()).collect();

        let best_priority = healthy.iter().map(|e| e.priority).min()?;

        let group: Vec<&RemoteEndpoint> = healthy
            .into_iter()
            .filter(|e| e.priority == best_priority)
            .collect();

        // zero-weight entries still get a minimal share
        let total: u64 = group.iter().map(|e| u64::from(e.weight.max(1))).sum();

        let mut threshold = rand::rng().random_range(0..total);

        for endpoint in group {
            let weight = u64::from(endpoint.weight.max(1));

            if threshold < weight {
                endpoint.mark_used();
                return Some(endpoint);
            }

            threshold -= weight;
        }

        unreachable!("threshold is below the summed weights")
    }

    pub fn get(&self, name: &str) -> Option<&RemoteEndpoint> {
        self.endpoints.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemoteEndpoint> {
        self.endpoints.iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config(name: &str, priority: u16, weight: u16) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            host: "127.0.0.1".parse().unwrap(),
            port: 5060,
            transport_type: TransportType::Udp,
            priority,
            weight,
        }
    }

    #[test]
    fn prefers_lowest_priority_group() {
        let set =
            EndpointSet::from_configs(&[config("backup", 2, 100), config("primary", 1, 1)])
                .unwrap();

        for _ in 0..50 {
            assert_eq!(set.select().unwrap().name, "primary");
        }
    }

    #[test]
    fn skips_unhealthy() {
        let set =
            EndpointSet::from_configs(&[config("primary", 1, 10), config("backup", 2, 10)])
                .unwrap();

        for _ in 0..FAILURE_THRESHOLD {
            set.get("primary").unwrap().record_failure();
        }

        assert_eq!(set.select().unwrap().name, "backup");
    }

    #[test]
    fn health_flips_at_exactly_five_failures() {
        let set = EndpointSet::from_configs(&[config("only", 1, 1)]).unwrap();
        let endpoint = set.get("only").unwrap();

        for _ in 0..(FAILURE_THRESHOLD - 1) {
            endpoint.record_failure();
        }
        assert!(endpoint.is_healthy());

        endpoint.record_failure();
        assert!(!endpoint.is_healthy());
        assert!(set.select().is_none());

        endpoint.record_success();
        assert!(endpoint.is_healthy());
        assert_eq!(endpoint.failure_count(), 0);
    }

    #[test]
    fn weight_split_is_roughly_proportional() {
        let set =
            EndpointSet::from_configs(&[config("heavy", 1, 90), config("light", 1, 10)]).unwrap();

        let mut heavy = 0;
        for _ in 0..1000 {
            if set.select().unwrap().name == "heavy" {
                heavy += 1;
            }
        }

        assert!((700..=1000).contains(&heavy), "heavy picked {heavy} times");
    }

    #[test]
    fn concurrent_failure_counting() {
        let set = EndpointSet::from_configs(&[config("only", 1, 1)]).unwrap();
        let endpoint = set.get("only").unwrap();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        endpoint.record_failure();
                    }
                });
            }
        });

        assert_eq!(endpoint.failure_count(), 400);
        assert!(!endpoint.is_healthy());
    }
}
