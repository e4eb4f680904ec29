//! UDP/TCP port pair allocation.
//!
//! Slot `i` maps to `(udp_base + i, tcp_base + i)`. Allocation always hands out
//! the lowest free slot, so freed pairs are reused first.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::PortConfig;
use crate::error::{AppError, Result};

/// The (UDP, TCP) ports reserved for one instance. Never split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PortPair {
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl PortPair {
    pub fn new(udp_port: u16, tcp_port: u16) -> Self {
        Self { udp_port, tcp_port }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP {} / TCP {}", self.udp_port, self.tcp_port)
    }
}

pub struct PortAllocator {
    udp_base: u16,
    tcp_base: u16,
    max_instances: usize,
    used: Mutex<BTreeSet<PortPair>>,
}

impl PortAllocator {
    pub fn new(config: &PortConfig) -> Self {
        Self {
            udp_base: config.udp_base,
            tcp_base: config.tcp_base,
            max_instances: config.max_instances,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    fn candidate(&self, slot: usize) -> Option<PortPair> {
        let offset = u16::try_from(slot).ok()?;
        Some(PortPair::new(
            self.udp_base.checked_add(offset)?,
            self.tcp_base.checked_add(offset)?,
        ))
    }

    /// Reserve the lowest free pair.
    pub fn allocate(&self) -> Result<PortPair> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        if used.len() >= self.max_instances {
            return Err(AppError::resource_exhausted(self.max_instances));
        }

        let pair = (0..self.max_instances)
            .filter_map(|slot| self.candidate(slot))
            .find(|pair| !used.contains(pair))
            .ok_or_else(|| AppError::resource_exhausted(self.max_instances))?;
        used.insert(pair);
        drop(used);

        log::info!("Allocated ports: {}", pair);
        Ok(pair)
    }

    /// Return a pair to the pool. Unknown pairs are ignored with a warning.
    pub fn release(&self, pair: PortPair) {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let removed = used.remove(&pair);
        drop(used);

        if removed {
            log::info!("Released ports: {}", pair);
        } else {
            log::warn!("Attempted to release unallocated ports: {}", pair);
        }
    }

    pub fn in_use(&self) -> usize {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_reserved(&self, pair: PortPair) -> bool {
        self.used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pair)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::error::ErrorKind;

    fn allocator(max_instances: usize) -> PortAllocator {
        PortAllocator::new(&PortConfig {
            udp_base: 14550,
            tcp_base: 5760,
            max_instances,
        })
    }

    #[test]
    fn allocates_sequentially_and_reuses_lowest_slot() {
        let ports = allocator(10);
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        assert_eq!(a, PortPair::new(14550, 5760));
        assert_eq!(b, PortPair::new(14551, 5761));

        ports.release(a);
        assert_eq!(ports.allocate().unwrap(), PortPair::new(14550, 5760));
        assert_eq!(ports.allocate().unwrap(), PortPair::new(14552, 5762));
    }

    #[test]
    fn exhaustion_leaves_pool_untouched() {
        let ports = allocator(3);
        for _ in 0..3 {
            ports.allocate().unwrap();
        }
        let err = ports.allocate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(ports.in_use(), 3);
        assert!(!ports.is_reserved(PortPair::new(14553, 5763)));
    }

    #[test]
    fn releasing_unknown_pair_is_noop() {
        let ports = allocator(2);
        let a = ports.allocate().unwrap();
        ports.release(PortPair::new(1, 2));
        ports.release(a);
        ports.release(a);
        assert_eq!(ports.in_use(), 0);
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let ports = Arc::new(allocator(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || ports.allocate().unwrap())
            })
            .collect();
        let pairs: Vec<PortPair> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let udp: HashSet<u16> = pairs.iter().map(|p| p.udp_port).collect();
        let tcp: HashSet<u16> = pairs.iter().map(|p| p.tcp_port).collect();
        assert_eq!(udp.len(), 10);
        assert_eq!(tcp.len(), 10);
        assert!(ports.allocate().is_err());
    }
}
