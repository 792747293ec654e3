//! Host port allocation for session containers.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::ops::RangeInclusive;

use crate::sandbox::error::{Result, SandboxError};

/// Hands out host ports from a fixed range.
///
/// A port is offered when no tracked session holds it and a throwaway bind
/// on the host succeeds. The probe listener is dropped before the port is
/// returned, so another process may still grab it before the container
/// publishes it.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    probe_host: IpAddr,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            probe_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn range(&self) -> &RangeInclusive<u16> {
        &self.range
    }

    /// Lowest port in range that is neither in `claimed` nor bound on the host.
    pub fn allocate(&self, claimed: &HashSet<u16>) -> Result<u16> {
        for port in self.range.clone() {
            if claimed.contains(&port) {
                continue;
            }
            if self.is_bindable(port) {
                return Ok(port);
            }
            tracing::trace!(port, "Port in use on host, skipping");
        }

        Err(SandboxError::PortExhausted {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    fn is_bindable(&self, port: u16) -> bool {
        TcpListener::bind((self.probe_host, port)).is_ok()
    }
}
