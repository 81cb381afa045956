//! Worker endpoint selection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::RelayConfig;
use crate::gateway::worker::WorkerEndpoint;

/// Configured workers, chosen round-robin. The list can be swapped at runtime.
#[derive(Debug)]
pub struct WorkerPool {
    endpoints: ArcSwap<Vec<WorkerEndpoint>>,
    counter: AtomicUsize,
}

impl WorkerPool {
    pub fn new(endpoints: Vec<WorkerEndpoint>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            counter: AtomicUsize::new(0),
        }
    }

    /// Build from configuration, falling back to the default worker when none
    /// are listed. Unparsable addresses are skipped and logged.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(parse_endpoints(&config.worker_addresses()))
    }

    /// Next endpoint in rotation, or `None` when no workers are configured.
    pub fn next(&self) -> Option<WorkerEndpoint> {
        let endpoints = self.endpoints.load();
        if endpoints.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % endpoints.len();
        Some(endpoints[index].clone())
    }

    /// Replace the endpoint list. Selections already made are unaffected.
    pub fn replace(&self, endpoints: Vec<WorkerEndpoint>) {
        tracing::info!(count = endpoints.len(), "Worker endpoints updated");
        self.endpoints.store(Arc::new(endpoints));
    }

    pub fn endpoints(&self) -> Arc<Vec<WorkerEndpoint>> {
        self.endpoints.load_full()
    }

    pub fn len(&self) -> usize {
        self.endpoints.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn parse_endpoints<S: AsRef<str>>(addresses: &[S]) -> Vec<WorkerEndpoint> {
    addresses
        .iter()
        .filter_map(|address| match WorkerEndpoint::parse(address.as_ref()) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                tracing::warn!(error = %e, "Skipping worker");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;

    #[test]
    fn rotates_through_endpoints() {
        let pool = WorkerPool::new(vec![WorkerEndpoint::new("a", 1), WorkerEndpoint::new("b", 2)]);
        assert_eq!(pool.next().unwrap().host, "a");
        assert_eq!(pool.next().unwrap().host, "b");
        assert_eq!(pool.next().unwrap().host, "a");
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let pool = WorkerPool::new(Vec::new());
        assert!(pool.next().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn replace_swaps_list() {
        let pool = WorkerPool::from_config(&RelayConfig::default());
        assert_eq!(pool.next().unwrap(), WorkerEndpoint::new("127.0.0.1", 6000));

        pool.replace(vec![WorkerEndpoint::new("w2", 7000)]);
        assert_eq!(pool.next().unwrap(), WorkerEndpoint::new("w2", 7000));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn bad_addresses_are_skipped() {
        let pool = WorkerPool::new(parse_endpoints(&["nope", "ok:1"]));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn configured_workers_replace_the_default() {
        let mut config = RelayConfig::default();
        assert_eq!(WorkerPool::from_config(&config).len(), 1);

        config.workers = vec![
            WorkerConfig { address: "10.0.0.1:6000".into() },
            WorkerConfig { address: "10.0.0.2:6000".into() },
        ];
        let pool = WorkerPool::from_config(&config);
        assert_eq!(pool.len(), 2);
        assert!(!pool.endpoints().contains(&WorkerEndpoint::new("127.0.0.1", 6000)));
    }
}
