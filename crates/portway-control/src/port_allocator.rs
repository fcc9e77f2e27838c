//! Public port allocation
//!
//! Picks a free remote port for a new route: a bounded number of random
//! probes first, then an ascending scan of the whole range. A chosen port is
//! held as pending until the caller has committed the route to storage and
//! drops the returned [`PortReservation`].

use crate::error::ControlError;
use crate::storage::RouteStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const DEFAULT_RANDOM_ATTEMPTS: usize = 100;

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, ControlError> {
        if start == 0 || start > end {
            return Err(ControlError::InvalidPortRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range
    pub fn size(&self) -> usize {
        (self.end - self.start) as usize + 1
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 10000,
            end: 20000,
        }
    }
}

/// A port held for a route that is about to be committed
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    pending: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.port);
        }
    }
}

pub struct PortAllocator {
    routes: Arc<dyn RouteStore>,
    pending: Arc<Mutex<HashSet<u16>>>,
    lock: tokio::sync::Mutex<()>,
    max_random_attempts: usize,
}

impl PortAllocator {
    pub fn new(routes: Arc<dyn RouteStore>) -> Self {
        Self::with_attempts(routes, DEFAULT_RANDOM_ATTEMPTS)
    }

    pub fn with_attempts(routes: Arc<dyn RouteStore>, max_random_attempts: usize) -> Self {
        Self {
            routes,
            pending: Arc::new(Mutex::new(HashSet::new())),
            lock: tokio::sync::Mutex::new(()),
            max_random_attempts,
        }
    }

    fn is_pending(&self, port: u16) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.contains(&port))
            .unwrap_or(true)
    }

    fn hold(&self, port: u16) -> PortReservation {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(port);
        }
        PortReservation {
            port,
            pending: self.pending.clone(),
        }
    }

    /// Allocate a free port in `range`
    pub async fn allocate(&self, range: PortRange) -> Result<PortReservation, ControlError> {
        let PortRange { start, end } = PortRange::new(range.start, range.end)?;
        let _guard = self.lock.lock().await;

        for _ in 0..self.max_random_attempts {
            let candidate = rand::thread_rng().gen_range(start..=end);
            if self.is_pending(candidate) {
                continue;
            }
            if !self.routes.is_remote_port_used(candidate).await? {
                debug!(port = candidate, "Allocated port by random probe");
                return Ok(self.hold(candidate));
            }
        }

        let used = self.routes.used_remote_ports(start, end).await?;
        for candidate in start..=end {
            if !used.contains(&candidate) && !self.is_pending(candidate) {
                debug!(port = candidate, "Allocated port by linear scan");
                return Ok(self.hold(candidate));
            }
        }

        warn!(start, end, "Port range exhausted");
        Err(ControlError::PortRangeExhausted { start, end })
    }

    /// Reserve a specific port requested by the caller
    pub async fn reserve(&self, port: u16) -> Result<PortReservation, ControlError> {
        if port == 0 {
            return Err(ControlError::InvalidInput("remote port must be non-zero".into()));
        }
        let _guard = self.lock.lock().await;
        if self.is_pending(port) || self.routes.is_remote_port_used(port).await? {
            return Err(ControlError::PortInUse(port));
        }
        Ok(self.hold(port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RouteDraft;
    use crate::storage::MemoryStore;
    use portway_proto::Protocol;

    async fn commit(store: &MemoryStore, port: u16) {
        store
            .insert_route(RouteDraft {
                name: format!("r{}", port),
                description: None,
                node_id: "node_a".to_string(),
                local_ip: "127.0.0.1".to_string(),
                local_port: port,
                remote_port: port,
                protocol: Protocol::Tcp,
                max_connections: 10,
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_invalid_range() {
        assert!(PortRange::new(20000, 10000).is_err());
        assert!(PortRange::new(0, 10).is_err());
        assert_eq!(PortRange::new(5, 5).unwrap().size(), 1);
    }

    #[tokio::test]
    async fn test_allocates_within_range() {
        let store = Arc::new(MemoryStore::new());
        let allocator = PortAllocator::new(store.clone());
        let range = PortRange::default();

        let reservation = allocator.allocate(range).await.unwrap();
        assert!(range.contains(reservation.port()));
    }

    #[tokio::test]
    async fn test_linear_fallback_finds_last_free_port() {
        let store = Arc::new(MemoryStore::new());
        for port in 10000..10009 {
            commit(&store, port).await;
        }
        // No random probes at all forces the ascending scan
        let allocator = PortAllocator::with_attempts(store.clone(), 0);
        let reservation = allocator
            .allocate(PortRange::new(10000, 10009).unwrap())
            .await
            .unwrap();
        assert_eq!(reservation.port(), 10009);
    }

    #[tokio::test]
    async fn test_pending_reservation_blocks_reuse() {
        let store = Arc::new(MemoryStore::new());
        let allocator = PortAllocator::new(store.clone());
        let range = PortRange::new(10000, 10001).unwrap();

        let a = allocator.allocate(range).await.unwrap();
        let b = allocator.allocate(range).await.unwrap();
        assert_ne!(a.port(), b.port());

        let err = allocator.allocate(range).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::PortRangeExhausted {
                start: 10000,
                end: 10001
            }
        ));

        drop(a);
        assert!(allocator.allocate(range).await.is_ok());
    }

    #[tokio::test]
    async fn test_reserve_specific_port() {
        let store = Arc::new(MemoryStore::new());
        commit(&store, 10500).await;
        let allocator = PortAllocator::new(store.clone());

        assert!(matches!(
            allocator.reserve(10500).await,
            Err(ControlError::PortInUse(10500))
        ));
        let held = allocator.reserve(10501).await.unwrap();
        assert!(matches!(
            allocator.reserve(10501).await,
            Err(ControlError::PortInUse(10501))
        ));
        drop(held);
        assert!(allocator.reserve(10501).await.is_ok());
    }
}
