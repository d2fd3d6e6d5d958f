//! Round-robin rotation over the configured range servers.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::error::RangeError;

/// Strict round-robin selection from a non-empty address list.
///
/// Holds no per-server health state; deciding whether a failed server is
/// worth retrying belongs to the retry layer.
#[derive(Debug)]
pub struct RoundRobinPool {
    addresses: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinPool {
    /// Create a pool over `addresses`; at least one address is required.
    pub fn new(addresses: Vec<String>) -> Result<Self, RangeError> {
        if addresses.is_empty() {
            return Err(RangeError::NoServers);
        }
        Ok(Self {
            addresses,
            next: AtomicUsize::new(0),
        })
    }

    /// The next address in rotation. Safe under concurrent use.
    pub fn next(&self) -> &str {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.addresses[n % self.addresses.len()]
    }

    /// Number of configured addresses.
    pub fn server_count(&self) -> usize {
        self.addresses.len()
    }
}
