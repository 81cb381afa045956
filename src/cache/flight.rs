//! Per-key single-flight claims.
//!
//! The first caller to claim a key leads; everyone else gets a [`FlightWait`]
//! that resolves when the leader's [`FlightGuard`] is dropped, however the
//! leader finished.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

type Flights = Arc<Mutex<HashMap<String, watch::Sender<()>>>>;

/// Outcome of claiming a key.
#[derive(Debug)]
pub enum Flight {
    /// This caller resolves the key. Drop the guard when done.
    Leader(FlightGuard),
    /// Another caller is resolving the key.
    Follower(FlightWait),
}

/// Registry of in-flight keys.
#[derive(Debug, Default, Clone)]
pub(crate) struct FlightTable {
    flights: Flights,
}

impl FlightTable {
    pub(crate) fn claim(&self, key: &str) -> Flight {
        let mut flights = lock(&self.flights);
        if let Some(leader) = flights.get(key) {
            return Flight::Follower(FlightWait { rx: leader.subscribe() });
        }

        let (tx, _) = watch::channel(());
        flights.insert(key.to_string(), tx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            flights: self.flights.clone(),
        })
    }

    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Held by the leader; releasing it wakes every follower.
#[derive(Debug)]
pub struct FlightGuard {
    key: String,
    flights: Flights,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Dropping the sender closes every follower's receiver.
        lock(&self.flights).remove(&self.key);
    }
}

/// Handed to followers.
#[derive(Debug)]
pub struct FlightWait {
    rx: watch::Receiver<()>,
}

impl FlightWait {
    /// Resolves once the leader has released the key.
    pub async fn wait(mut self) {
        while self.rx.changed().await.is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_claim_follows_until_leader_drops() {
        let table = FlightTable::default();
        let Flight::Leader(guard) = table.claim("k") else {
            panic!("first claim must lead");
        };
        let Flight::Follower(wait) = table.claim("k") else {
            panic!("second claim must follow");
        };
        assert_eq!(table.in_flight(), 1);

        let waiter = tokio::spawn(wait.wait());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(table.in_flight(), 0);
        assert!(matches!(table.claim("k"), Flight::Leader(_)));
    }

    #[test]
    fn distinct_keys_lead_independently() {
        let table = FlightTable::default();
        let a = table.claim("a");
        let b = table.claim("b");
        assert!(matches!(a, Flight::Leader(_)));
        assert!(matches!(b, Flight::Leader(_)));
    }
}
