//! PortAllocator: exclusive per-worker reservation of two TCP ports from
//! configured ranges, with availability probing.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PortError {
    #[error("api port range [{0}, {1}) exhausted")]
    ApiRangeExhausted(u16, u16),
    #[error("web port range [{0}, {1}) exhausted")]
    WebRangeExhausted(u16, u16),
}

pub type Result<T> = std::result::Result<T, PortError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub api_port: u16,
    pub web_port: u16,
}

/// Allocates `(api_port, web_port)` pairs per agent out of two disjoint
/// ranges, mirroring the `Arc<Mutex<HashMap<...>>>`-guarded state shape used
/// elsewhere in this crate's process-supervision code.
pub struct PortAllocator {
    api_range: (u16, u16),
    web_range: (u16, u16),
    verify_availability: bool,
    reserved: Mutex<HashMap<String, PortPair>>,
}

impl PortAllocator {
    pub fn new(api_range: (u16, u16), web_range: (u16, u16), verify_availability: bool) -> Self {
        Self {
            api_range,
            web_range,
            verify_availability,
            reserved: Mutex::new(HashMap::new()),
        }
    }

    /// Seed reservations from already-ACTIVE heartbeats on startup, so a
    /// restarted Orchestrator doesn't hand out a port still owned by a live
    /// worker it didn't spawn this process.
    pub fn seed_reservations(&self, active: impl IntoIterator<Item = (String, PortPair)>) {
        let mut guard = self.reserved.lock().unwrap();
        for (agent_id, pair) in active {
            guard.insert(agent_id, pair);
        }
    }

    pub fn allocate_ports(&self, agent_id: &str) -> Result<PortPair> {
        let mut guard = self.reserved.lock().unwrap();

        if let Some(existing) = guard.get(agent_id) {
            return Ok(*existing);
        }

        let used_api: Vec<u16> = guard.values().map(|p| p.api_port).collect();
        let used_web: Vec<u16> = guard.values().map(|p| p.web_port).collect();

        let api_port = self.find_free_port(self.api_range, &used_api).ok_or(
            PortError::ApiRangeExhausted(self.api_range.0, self.api_range.1),
        )?;
        let web_port = self.find_free_port(self.web_range, &used_web).ok_or(
            PortError::WebRangeExhausted(self.web_range.0, self.web_range.1),
        )?;

        let pair = PortPair {
            api_port,
            web_port,
        };
        guard.insert(agent_id.to_string(), pair);
        debug!(agent_id, api_port, web_port, "allocated ports");
        Ok(pair)
    }

    pub fn reserve_ports(&self, agent_id: &str, api_port: u16, web_port: u16) {
        let mut guard = self.reserved.lock().unwrap();
        guard.insert(
            agent_id.to_string(),
            PortPair {
                api_port,
                web_port,
            },
        );
    }

    pub fn release_ports(&self, agent_id: &str) {
        let mut guard = self.reserved.lock().unwrap();
        guard.remove(agent_id);
    }

    pub fn get_agent_ports(&self, agent_id: &str) -> Option<PortPair> {
        self.reserved.lock().unwrap().get(agent_id).copied()
    }

    fn find_free_port(&self, range: (u16, u16), excluded: &[u16]) -> Option<u16> {
        for port in range.0..range.1 {
            if excluded.contains(&port) {
                continue;
            }
            if !self.verify_availability || Self::is_bindable(port) {
                return Some(port);
            }
            warn!(port, "port in use by external process, skipping");
        }
        None
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ports_per_agent() {
        let allocator = PortAllocator::new((6000, 6010), (6100, 6110), false);
        let a = allocator.allocate_ports("agent-a").unwrap();
        let b = allocator.allocate_ports("agent-b").unwrap();
        assert_ne!(a.api_port, b.api_port);
        assert_ne!(a.web_port, b.web_port);
    }

    #[test]
    fn allocation_is_idempotent_per_agent() {
        let allocator = PortAllocator::new((6000, 6010), (6100, 6110), false);
        let a1 = allocator.allocate_ports("agent-a").unwrap();
        let a2 = allocator.allocate_ports("agent-a").unwrap();
        assert_eq!(a1, a2);
    }

    #[test]
    fn release_frees_the_slot() {
        let allocator = PortAllocator::new((6000, 6001), (6100, 6101), false);
        allocator.allocate_ports("agent-a").unwrap();
        allocator.release_ports("agent-a");
        let b = allocator.allocate_ports("agent-b").unwrap();
        assert_eq!(b.api_port, 6000);
    }

    #[test]
    fn exhausted_range_errors() {
        let allocator = PortAllocator::new((7000, 7001), (7100, 7101), false);
        allocator.allocate_ports("agent-a").unwrap();
        let err = allocator.allocate_ports("agent-b").unwrap_err();
        assert!(matches!(err, PortError::ApiRangeExhausted(7000, 7001)));
    }

    #[test]
    fn skips_externally_bound_port() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound_port = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new((bound_port, bound_port + 2), (8100, 8101), true);
        let allocated = allocator.allocate_ports("agent-a").unwrap();
        assert_ne!(allocated.api_port, bound_port);
    }
}
