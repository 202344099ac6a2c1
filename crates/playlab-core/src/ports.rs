use crate::PlayError;
use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;

/// How many fresh ephemeral ports to request before giving up on a duplicate
/// or a refused bind.
const ALLOCATE_ATTEMPTS: usize = 16;

/// Hands out ephemeral ports that are pairwise distinct within this allocator.
///
/// Each call binds a transient listener to port 0, reads back the OS-assigned
/// port, and releases the socket. The OS may reissue a released port to an
/// unrelated process before our service binds it; that race is accepted as-is
/// (low probability, same exposure as any "pick a free port" scheme) rather
/// than mitigated.
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Result<u16, PlayError> {
        let mut last_refusal = None;
        for _ in 0..ALLOCATE_ATTEMPTS {
            match TcpListener::bind(("127.0.0.1", 0)) {
                Ok(listener) => {
                    let port = listener
                        .local_addr()
                        .map_err(|e| PlayError::PortAllocation(e.to_string()))?
                        .port();
                    drop(listener);
                    if self.issued.insert(port) {
                        return Ok(port);
                    }
                    // OS reissued a port we already handed out; ask again.
                }
                Err(e) => {
                    let err = PlayError::PortAllocation(format!("bind refused: {e}"));
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_refusal = Some(err);
                }
            }
        }
        Err(last_refusal.unwrap_or_else(|| {
            PlayError::PortAllocation(format!(
                "no distinct port after {ALLOCATE_ATTEMPTS} attempts"
            ))
        }))
    }

    /// Record an externally fixed port so later allocations cannot collide
    /// with it.
    pub fn reserve(&mut self, port: u16) {
        self.issued.insert(port);
    }
}

/// Logical port name → allocated port, for one service.
///
/// Values are immutable once written into a config artifact; the set is built
/// in full before the owning process starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet(BTreeMap<String, u16>);

impl PortSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, port: u16) {
        self.0.insert(name.into(), port);
    }

    pub fn get(&self, name: &str) -> Option<u16> {
        self.0.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u16)> {
        self.0.iter().map(|(name, port)| (name.as_str(), *port))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_allocations_are_pairwise_distinct() {
        let mut allocator = PortAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let port = allocator.allocate().unwrap();
            assert!(seen.insert(port), "duplicate port {port}");
        }
    }

    #[test]
    fn reserved_ports_are_never_reissued() {
        let mut allocator = PortAllocator::new();
        let first = allocator.allocate().unwrap();
        let mut probe = PortAllocator::new();
        probe.reserve(first);
        for _ in 0..32 {
            assert_ne!(probe.allocate().unwrap(), first);
        }
    }

    #[test]
    fn exhausted_allocation_yields_a_retryable_error() {
        let mut allocator = PortAllocator::new();
        // With every port already issued the loop can never find a fresh one.
        for port in 0..=u16::MAX {
            allocator.reserve(port);
        }
        let err = allocator.allocate().unwrap_err();
        assert!(matches!(err, PlayError::PortAllocation(_)), "got {err}");
        assert!(err.is_retryable());
    }

    #[test]
    fn port_set_keeps_named_assignments() {
        let mut ports = PortSet::new();
        ports.insert("http", 9000);
        ports.insert("sql", 8812);
        assert_eq!(ports.get("http"), Some(9000));
        assert_eq!(ports.get("sql"), Some(8812));
        assert_eq!(ports.get("ilp"), None);
        assert_eq!(ports.len(), 2);
    }
}
