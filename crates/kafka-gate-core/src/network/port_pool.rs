//! Port pool for dynamic listener allocation.
//!
//! Two modes:
//!
//! - **sequential** — hands out ports from a bounded `[min_port, max_port]`
//!   range in order. Combined with a stable provisioning order (ascending
//!   broker id) this gives the same broker the same port across process
//!   restarts, which clients that hard-code proxy ports depend on.
//! - **ephemeral** — binds an OS-assigned port and records it as leased.
//!
//! Exhaustion of the sequential range is a hard allocation failure; the pool
//! never wraps around.

use std::collections::HashSet;
use std::net::IpAddr;
use tokio::net::TcpListener;

use crate::error::{ProxyError, Result};

/// One successful lease. In ephemeral mode the pool already bound the
/// listener; in sequential mode the caller binds the returned port itself so
/// a bind failure can surface as a provisioning error without the pool
/// holding a dead socket.
#[derive(Debug)]
pub struct PortLease {
    pub port: u16,
    pub socket: Option<TcpListener>,
}

/// Bounded pool of local ports for dynamic listeners.
#[derive(Debug)]
pub struct PortPool {
    min_port: u16,
    max_port: u16,
    /// Next port to hand out in sequential mode. Kept as u32 so the value
    /// `max_port + 1` (exhausted) is representable.
    next_candidate: u32,
    leased: HashSet<u16>,
    sequential: bool,
}

impl PortPool {
    /// Create a pool over the inclusive sequential range `[min_port, max_port]`.
    #[must_use]
    pub fn sequential(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            next_candidate: u32::from(min_port),
            leased: HashSet::new(),
            sequential: true,
        }
    }

    /// Create a pool that delegates to OS-assigned ephemeral ports.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self {
            min_port: 0,
            max_port: 0,
            next_candidate: 0,
            leased: HashSet::new(),
            sequential: false,
        }
    }

    /// Whether this pool allocates from the bounded sequential range.
    #[must_use]
    pub fn is_sequential(&self) -> bool {
        self.sequential
    }

    /// Lease the next port.
    ///
    /// # Errors
    ///
    /// Returns `PoolExhausted` when the sequential range is used up, or
    /// `Bind` when the ephemeral bind fails.
    pub async fn lease(&mut self, bind_ip: IpAddr) -> Result<PortLease> {
        if self.sequential {
            if self.next_candidate > u32::from(self.max_port) {
                return Err(ProxyError::PoolExhausted {
                    min_port: self.min_port,
                    max_port: self.max_port,
                });
            }
            let port = self.next_candidate as u16;
            self.next_candidate += 1;
            self.leased.insert(port);
            return Ok(PortLease { port, socket: None });
        }

        let socket = TcpListener::bind((bind_ip, 0))
            .await
            .map_err(|source| ProxyError::Bind {
                address: format!("{bind_ip}:0"),
                source,
            })?;
        let port = socket
            .local_addr()
            .map_err(|source| ProxyError::Bind {
                address: format!("{bind_ip}:0"),
                source,
            })?
            .port();
        self.leased.insert(port);
        Ok(PortLease {
            port,
            socket: Some(socket),
        })
    }

    /// Mark a port free again. Only called on shutdown; mappings are never
    /// torn down individually mid-run.
    pub fn release(&mut self, port: u16) {
        self.leased.remove(&port);
    }

    /// Number of currently leased ports.
    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[tokio::test]
    async fn test_sequential_lease_order() {
        let mut pool = PortPool::sequential(10000, 10002);
        for expected in [10000, 10001, 10002] {
            let lease = pool.lease(LOOPBACK).await.unwrap();
            assert_eq!(lease.port, expected);
            assert!(lease.socket.is_none());
        }
        assert_eq!(pool.leased_count(), 3);
    }

    #[tokio::test]
    async fn test_sequential_exhaustion() {
        let mut pool = PortPool::sequential(10000, 10000);
        assert_eq!(pool.lease(LOOPBACK).await.unwrap().port, 10000);

        let result = pool.lease(LOOPBACK).await;
        assert!(matches!(
            result,
            Err(ProxyError::PoolExhausted {
                min_port: 10000,
                max_port: 10000
            })
        ));

        // The first lease stays valid after exhaustion.
        assert_eq!(pool.leased_count(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_lease_binds() {
        let mut pool = PortPool::ephemeral();
        let lease = pool.lease(LOOPBACK).await.unwrap();
        assert!(lease.port > 0);
        let socket = lease.socket.expect("ephemeral lease carries the socket");
        assert_eq!(socket.local_addr().unwrap().port(), lease.port);
    }

    #[tokio::test]
    async fn test_ephemeral_leases_are_distinct() {
        let mut pool = PortPool::ephemeral();
        let a = pool.lease(LOOPBACK).await.unwrap();
        let b = pool.lease(LOOPBACK).await.unwrap();
        assert_ne!(a.port, b.port);
        assert_eq!(pool.leased_count(), 2);
    }

    #[tokio::test]
    async fn test_release_frees_tracking_only() {
        let mut pool = PortPool::sequential(10000, 10001);
        let lease = pool.lease(LOOPBACK).await.unwrap();
        pool.release(lease.port);
        assert_eq!(pool.leased_count(), 0);

        // Sequential allocation never rewinds.
        assert_eq!(pool.lease(LOOPBACK).await.unwrap().port, 10001);
    }
}
