//! TCP port bookkeeping for services launched by this host process.
//!
//! The allocator only knows about ports it handed out itself (or that were
//! marked explicitly). With probing enabled it additionally test-binds each
//! candidate so ports taken by unrelated processes are skipped; that check is
//! best effort and must be repeated by whoever finally binds the port.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr, TcpListener};

/// First allocatable port.
pub const PORT_RANGE_START: u16 = 1024;
/// Last allocatable port (top of the registered range).
pub const PORT_RANGE_END: u16 = 49151;

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no host configured for port allocation")]
    HostNotSet,
    #[error("base port {0} is outside the allocatable range 1024..=49151")]
    BaseOutOfRange(u16),
    #[error("port range exhausted: no free port in {base}..=49151")]
    Exhausted { base: u16 },
}

/// Hands out unique ports from `[base, 49151]`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: Option<IpAddr>,
    base: u16,
    probe: bool,
    in_use: HashSet<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            host: None,
            base: PORT_RANGE_START,
            probe: false,
            in_use: HashSet::new(),
        }
    }

    /// Create an allocator scanning upward from `base`.
    pub fn with_base(base: u16) -> Result<Self, PortError> {
        if !(PORT_RANGE_START..=PORT_RANGE_END).contains(&base) {
            return Err(PortError::BaseOutOfRange(base));
        }
        Ok(Self {
            base,
            ..Self::new()
        })
    }

    /// Configure the address used for liveness probing. Required before
    /// [`allocate`](Self::allocate).
    pub fn set_host(&mut self, host: IpAddr) {
        self.host = Some(host);
    }

    pub fn host(&self) -> Option<IpAddr> {
        self.host
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Enable or disable test-binding candidates before handing them out.
    pub fn set_probe(&mut self, probe: bool) {
        self.probe = probe;
    }

    /// Unknown ports are considered free.
    pub fn is_in_use(&self, port: u16) -> bool {
        self.in_use.contains(&port)
    }

    pub fn mark_in_use(&mut self, port: u16, in_use: bool) {
        if in_use {
            self.in_use.insert(port);
        } else {
            self.in_use.remove(&port);
        }
    }

    pub fn release(&mut self, port: u16) {
        self.mark_in_use(port, false);
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.len()
    }

    /// Claim the lowest free port at or above the base port.
    ///
    /// Exhausting the range means the host is out of ports; this is a
    /// configuration failure and is not retried.
    pub fn allocate(&mut self) -> Result<u16, PortError> {
        let host = self.host.ok_or(PortError::HostNotSet)?;

        for port in self.base..=PORT_RANGE_END {
            if self.in_use.contains(&port) {
                continue;
            }
            if self.probe && !probe_free(host, port) {
                tracing::debug!(port, %host, "port already bound by another process, skipping");
                self.in_use.insert(port);
                continue;
            }
            self.in_use.insert(port);
            tracing::debug!(port, "allocated port");
            return Ok(port);
        }

        tracing::error!(base = self.base, "port range exhausted");
        Err(PortError::Exhausted { base: self.base })
    }
}

fn probe_free(host: IpAddr, port: u16) -> bool {
    TcpListener::bind(SocketAddr::new(host, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn localhost_allocator() -> PortAllocator {
        let mut alloc = PortAllocator::new();
        alloc.set_host(IpAddr::V4(Ipv4Addr::LOCALHOST));
        alloc
    }

    #[test]
    fn fresh_allocator_hands_out_sequential_ports() {
        let mut alloc = localhost_allocator();
        assert_eq!(alloc.allocate().unwrap(), 1024);
        assert_eq!(alloc.allocate().unwrap(), 1025);
        assert_eq!(alloc.allocate().unwrap(), 1026);
    }

    #[test]
    fn allocate_requires_host() {
        let mut alloc = PortAllocator::new();
        assert!(matches!(alloc.allocate(), Err(PortError::HostNotSet)));
    }

    #[test]
    fn allocated_ports_are_pairwise_distinct() {
        let mut alloc = localhost_allocator();
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let port = alloc.allocate().unwrap();
            assert!(seen.insert(port), "port {port} handed out twice");
            assert!(alloc.is_in_use(port));
        }
        assert_eq!(alloc.in_use_count(), 500);
    }

    #[test]
    fn marked_ports_are_skipped() {
        let mut alloc = localhost_allocator();
        alloc.mark_in_use(1024, true);
        alloc.mark_in_use(1025, true);
        assert_eq!(alloc.allocate().unwrap(), 1026);
    }

    #[test]
    fn mark_in_use_is_idempotent() {
        let mut alloc = localhost_allocator();
        alloc.mark_in_use(2000, true);
        alloc.mark_in_use(2000, true);
        assert!(alloc.is_in_use(2000));
        assert_eq!(alloc.in_use_count(), 1);
        alloc.mark_in_use(2000, false);
        alloc.mark_in_use(2000, false);
        assert!(!alloc.is_in_use(2000));
    }

    #[test]
    fn unknown_ports_are_free() {
        let alloc = PortAllocator::new();
        assert!(!alloc.is_in_use(8080));
    }

    #[test]
    fn released_port_is_reused() {
        let mut alloc = localhost_allocator();
        let first = alloc.allocate().unwrap();
        let _second = alloc.allocate().unwrap();
        alloc.release(first);
        assert_eq!(alloc.allocate().unwrap(), first);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let mut alloc = PortAllocator::with_base(PORT_RANGE_END - 1).unwrap();
        alloc.set_host(IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(alloc.allocate().unwrap(), PORT_RANGE_END - 1);
        assert_eq!(alloc.allocate().unwrap(), PORT_RANGE_END);
        assert!(matches!(
            alloc.allocate(),
            Err(PortError::Exhausted { base }) if base == PORT_RANGE_END - 1
        ));
    }

    #[test]
    fn base_outside_range_is_rejected() {
        assert!(matches!(
            PortAllocator::with_base(80),
            Err(PortError::BaseOutOfRange(80))
        ));
        assert!(PortAllocator::with_base(PORT_RANGE_END + 1).is_err());
    }

    #[test]
    fn probing_skips_ports_bound_elsewhere() {
        // Hold a listener on some port inside the allocatable range.
        let (listener, port) = (20000..40000u16)
            .find_map(|p| {
                TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), p))
                    .ok()
                    .map(|l| (l, p))
            })
            .expect("no bindable port found");

        let mut alloc = PortAllocator::with_base(port).unwrap();
        alloc.set_host(IpAddr::V4(Ipv4Addr::LOCALHOST));
        alloc.set_probe(true);

        let got = alloc.allocate().unwrap();
        assert_ne!(got, port);
        assert!(got > port);
        assert!(alloc.is_in_use(port));
        drop(listener);
    }
}
