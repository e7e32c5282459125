//! Host port allocation.
//!
//! One allocator per manager. Allocation is serialized by a plain flag:
//! callers that find it held sleep a random 0-300 ms and try again. The
//! holder scans upward from the range start for a port that is neither
//! blacklisted nor bound on the host, blacklists it and releases the flag.
//! Blacklisted ports are never handed out again, even after their service
//! stops, so a late-starting container never collides with a recycled port.

use crate::constants::PORT_LOCK_JITTER_MS;
use crate::error::{Error, Result};
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::trace;

/// Releases the allocation flag on drop.
struct FlagGuard<'a>(&'a AtomicBool);

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Hands out unique host ports from a fixed range.
#[derive(Debug)]
pub struct PortAllocator {
    host: String,
    start: u16,
    end: u16,
    locked: AtomicBool,
    blacklist: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Allocator for `start..=end` probing on `host`.
    #[must_use]
    pub fn new(host: impl Into<String>, start: u16, end: u16) -> Self {
        Self {
            host: host.into(),
            start,
            end,
            locked: AtomicBool::new(false),
            blacklist: Mutex::new(HashSet::new()),
        }
    }

    /// Returns a port that was never returned before and was free on the
    /// host when checked.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortsExhausted`] if no such port is left in range.
    pub async fn allocate(&self) -> Result<u16> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            let jitter = rand::rng().random_range(0..PORT_LOCK_JITTER_MS);
            trace!(jitter_ms = jitter, "port lock held, backing off");
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
        let _guard = FlagGuard(&self.locked);

        for port in self.start..=self.end {
            if self.is_blacklisted(port)? {
                continue;
            }
            if TcpListener::bind((self.host.as_str(), port)).await.is_ok() {
                self.blacklist
                    .lock()
                    .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
                    .insert(port);
                trace!(port, "port allocated");
                return Ok(port);
            }
        }
        Err(Error::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Returns true if `port` has been handed out.
    ///
    /// # Errors
    ///
    /// Returns error if the blacklist lock is poisoned.
    pub fn is_blacklisted(&self, port: u16) -> Result<bool> {
        Ok(self
            .blacklist
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))?
            .contains(&port))
    }

    /// Number of ports handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.blacklist.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Port range as `(start, end)`.
    #[must_use]
    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skips_bound_port() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let allocator = PortAllocator::new("127.0.0.1", busy_port, busy_port.saturating_add(20));

        let port = allocator.allocate().await.unwrap();
        assert_ne!(port, busy_port);
        assert!(allocator.is_blacklisted(port).unwrap());
    }

    #[tokio::test]
    async fn test_exhausted() {
        let busy = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = busy.local_addr().unwrap().port();
        let allocator = PortAllocator::new("127.0.0.1", port, port);
        let err = allocator.allocate().await.unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { .. }));
    }
}
