//! Public port allocation.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tokio::net::TcpSocket;
use tracing::{debug, warn};

use porthop_core::config::PortRange;

use crate::error::{Error, Result};

/// Reports whether a port is already taken by something outside the pool.
pub trait PortProbe: Send + Sync {
    fn in_use(&self, port: u16) -> bool;
}

/// Probes by trying to bind the port on the listener address.
///
/// The trial socket sets `SO_REUSEADDR` like the tunnel listeners do, so a
/// port whose previous owner left it in `TIME_WAIT` still counts as free.
#[derive(Debug, Clone, Copy)]
pub struct BindProbe {
    pub address: IpAddr,
}

impl BindProbe {
    fn try_bind(&self, port: u16) -> std::io::Result<()> {
        let addr = SocketAddr::new(self.address, port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)
    }
}

impl PortProbe for BindProbe {
    fn in_use(&self, port: u16) -> bool {
        self.try_bind(port).is_err()
    }
}

impl<F> PortProbe for F
where
    F: Fn(u16) -> bool + Send + Sync,
{
    fn in_use(&self, port: u16) -> bool {
        self(port)
    }
}

/// Ports of the configured range handed out to tunnel listeners.
pub struct PortPool {
    range: PortRange,
    reserved: Mutex<HashSet<u16>>,
    probe: Box<dyn PortProbe>,
    max_attempts: usize,
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("range", &self.range)
            .field("reserved", &self.reserved_count())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl PortPool {
    pub fn new(range: PortRange, probe: Box<dyn PortProbe>, max_attempts: usize) -> Self {
        Self {
            range,
            reserved: Mutex::new(HashSet::new()),
            probe,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Pool that probes with real binds on `address`.
    pub fn bind_probed(range: PortRange, address: IpAddr, max_attempts: usize) -> Self {
        Self::new(range, Box::new(BindProbe { address }), max_attempts)
    }

    fn reserved(&self) -> MutexGuard<'_, HashSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub const fn range(&self) -> PortRange {
        self.range
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved().len()
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved().contains(&port)
    }

    /// Reserve a uniformly random free port.
    ///
    /// Candidates the probe reports busy are dropped from this round. Gives
    /// up with [`Error::PortExhausted`] once `max_attempts` candidates have
    /// been tried, or immediately when every port is already reserved.
    pub fn allocate(&self) -> Result<u16> {
        let mut reserved = self.reserved();
        let mut candidates: Vec<u16> = self
            .range
            .iter()
            .filter(|port| !reserved.contains(port))
            .collect();

        let mut rng = rand::thread_rng();
        let mut attempts = 0;
        while !candidates.is_empty() && attempts < self.max_attempts {
            attempts += 1;
            let port = candidates.swap_remove(rng.gen_range(0..candidates.len()));
            if self.probe.in_use(port) {
                debug!(port, "Port in use outside the pool, skipping");
                continue;
            }
            reserved.insert(port);
            debug!(port, reserved = reserved.len(), "Port allocated");
            return Ok(port);
        }

        warn!(range = %self.range, attempts, "No free port in range");
        Err(Error::PortExhausted { attempts })
    }

    /// Reserve a specific port if it is in range, unreserved and free.
    pub fn reserve(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let mut reserved = self.reserved();
        if reserved.contains(&port) || self.probe.in_use(port) {
            return false;
        }
        reserved.insert(port)
    }

    /// Return a port to the pool. Returns false if it was not reserved.
    pub fn release(&self, port: u16) -> bool {
        let released = self.reserved().remove(&port);
        if released {
            debug!(port, "Port released");
        }
        released
    }
}
