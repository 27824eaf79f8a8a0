//! Bounded loopback port allocator
//!
//! Hands out TCP ports from `[start, start + size)` to MCP instances. Two
//! disjoint sets are tracked: ports currently assigned (`in_use`) and ports
//! that were assigned once and released since (`free_for_reuse`). Released
//! ports are handed out again before the range is scanned, which keeps the
//! numbers clustered at the bottom of the range.
//!
//! A fresh port is only handed out after a bind probe on loopback succeeds, so
//! ports held by other processes on the host are skipped.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, thiserror::Error)]
pub enum PortPoolError {
    #[error("No free ports available in range {start}..{end}")]
    Exhausted { start: u16, end: u32 },
}

#[derive(Debug, Default)]
struct PortSets {
    in_use: BTreeSet<u16>,
    free_for_reuse: BTreeSet<u16>,
}

/// Thread-safe allocator over a contiguous port range
///
/// # Examples
///
/// ```rust,no_run
/// use etendo_mcp_gateway::mcp::PortPool;
///
/// let pool = PortPool::new(5008, 1000);
/// let port = pool.acquire()?;
/// pool.release(port);
/// assert_eq!(pool.acquire()?, port);
/// # Ok::<(), etendo_mcp_gateway::mcp::PortPoolError>(())
/// ```
#[derive(Debug)]
pub struct PortPool {
    start: u16,
    size: u16,
    sets: Mutex<PortSets>,
}

/// Point-in-time copy of both port sets, sorted ascending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortPoolSnapshot {
    pub in_use: Vec<u16>,
    pub free_for_reuse: Vec<u16>,
}

impl PortPoolSnapshot {
    pub fn total_tracked(&self) -> usize {
        self.in_use.len() + self.free_for_reuse.len()
    }
}

impl PortPool {
    /// Creates a pool over `[start, start + size)`, clamped to the valid port space
    pub fn new(start: u16, size: u16) -> Self {
        Self {
            start,
            size,
            sets: Mutex::new(PortSets::default()),
        }
    }

    /// The configured range; `end` is exclusive and may be 65536
    pub fn range(&self) -> Range<u32> {
        let start = u32::from(self.start);
        let end = (start + u32::from(self.size)).min(u32::from(u16::MAX) + 1);
        start..end
    }

    /// Allocates a port
    ///
    /// Pops a released port if one exists. Otherwise scans the range upward,
    /// skipping ports in use, and returns the first port a loopback bind
    /// probe succeeds on. The probe socket is closed before returning.
    ///
    /// # Errors
    ///
    /// * `PortPoolError::Exhausted` - No port in the range passed the probe
    pub fn acquire(&self) -> Result<u16, PortPoolError> {
        let mut sets = self.lock();

        if let Some(port) = sets.free_for_reuse.pop_first() {
            sets.in_use.insert(port);
            tracing::debug!(port, "Reusing released port");
            return Ok(port);
        }

        let range = self.range();
        for candidate in range.clone() {
            let Ok(port) = u16::try_from(candidate) else {
                break;
            };
            if sets.in_use.contains(&port) {
                continue;
            }
            if probe(port) {
                sets.in_use.insert(port);
                tracing::debug!(port, "Allocated new port");
                return Ok(port);
            }
        }

        Err(PortPoolError::Exhausted {
            start: self.start,
            end: range.end,
        })
    }

    /// Returns a port to the reuse set
    ///
    /// Releasing a port that is not in use (double release on a crash path,
    /// or a port this pool never handed out) still leaves it in the reuse set
    /// and never errors.
    pub fn release(&self, port: u16) {
        let mut sets = self.lock();
        sets.in_use.remove(&port);
        sets.free_for_reuse.insert(port);
        tracing::debug!(port, "Port returned to reuse pool");
    }

    /// Forgets every tracked port
    pub fn clear(&self) {
        let mut sets = self.lock();
        sets.in_use.clear();
        sets.free_for_reuse.clear();
    }

    pub fn is_in_use(&self, port: u16) -> bool {
        self.lock().in_use.contains(&port)
    }

    pub fn snapshot(&self) -> PortPoolSnapshot {
        let sets = self.lock();
        PortPoolSnapshot {
            in_use: sets.in_use.iter().copied().collect(),
            free_for_reuse: sets.free_for_reuse.iter().copied().collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PortSets> {
        // Both sets are updated together under the guard, so a panic elsewhere
        // cannot leave them half-written.
        self.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn probe(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Binds an ephemeral port and keeps it held for the duration of the test
    fn hold_port() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind ephemeral port");
        let port = listener.local_addr().expect("local addr").port();
        (listener, port)
    }

    #[test]
    fn test_release_then_acquire_prefers_reuse() {
        let (held, port) = hold_port();
        drop(held);

        let pool = PortPool::new(port, 1);
        let first = pool.acquire().expect("first acquire");
        assert_eq!(first, port);

        pool.release(first);
        assert_eq!(pool.snapshot().free_for_reuse, vec![port]);

        // Reuse path does not probe, so holding the port externally does not matter
        let _guard = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).ok();
        let second = pool.acquire().expect("reuse acquire");
        assert_eq!(second, port);
        assert!(pool.snapshot().free_for_reuse.is_empty());
    }

    #[test]
    fn test_acquire_skips_ports_in_use() {
        let (held, port) = hold_port();
        drop(held);

        let pool = PortPool::new(port, 200);
        let a = pool.acquire().expect("acquire a");
        let b = pool.acquire().expect("acquire b");
        assert_ne!(a, b);
        assert!(pool.is_in_use(a));
        assert!(pool.is_in_use(b));
    }

    #[test]
    fn test_exhausted_when_probe_fails_everywhere() {
        let (_held, port) = hold_port();

        let pool = PortPool::new(port, 1);
        let result = pool.acquire();
        assert!(matches!(result, Err(PortPoolError::Exhausted { .. })));
        assert!(pool.snapshot().in_use.is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortPool::new(40000, 10);
        pool.release(40001);
        let once = pool.snapshot();
        pool.release(40001);
        assert_eq!(pool.snapshot(), once);
        assert_eq!(once.free_for_reuse, vec![40001]);
        assert!(once.in_use.is_empty());
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let (held, port) = hold_port();
        drop(held);

        let pool = PortPool::new(port, 50);
        let ports: Vec<u16> = (0..3).map(|_| pool.acquire().expect("acquire")).collect();
        pool.release(ports[1]);
        pool.release(ports[1]);

        let snapshot = pool.snapshot();
        for p in &snapshot.in_use {
            assert!(!snapshot.free_for_reuse.contains(p));
        }
        assert_eq!(snapshot.total_tracked(), 3);
    }

    #[test]
    fn test_range_clamps_to_port_space() {
        let pool = PortPool::new(65000, 1000);
        assert_eq!(pool.range(), 65000..65536);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let pool = PortPool::new(40000, 10);
        pool.release(40002);
        pool.clear();
        assert_eq!(pool.snapshot(), PortPoolSnapshot::default());
    }
}
