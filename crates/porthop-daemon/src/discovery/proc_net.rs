//! Automatic discovery of local TCP listeners from procfs.
//!
//! `/proc/net/tcp` and `/proc/net/tcp6` list every socket with its state and
//! inode. Listening sockets are mapped back to their owning process through
//! the `socket:[<inode>]` links under `/proc/<pid>/fd`. Sockets whose owner
//! cannot be resolved (other users' processes without privileges) are still
//! reported, keyed by port only.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use porthop_core::config::{DiscoveryConfig, PortRange};

use super::Discovery;
use crate::error::Result;
use crate::tunnel::Application;

/// `TCP_LISTEN` in the kernel's state numbering.
const TCP_LISTEN: &str = "0A";

/// A listening socket as read from a `/proc/net/tcp*` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningSocket {
    pub address: SocketAddr,
    pub inode: u64,
}

/// Parse the listening entries out of a `/proc/net/tcp` or `/proc/net/tcp6`
/// table. Malformed rows are skipped.
pub fn parse_listeners(table: &str) -> Vec<ListeningSocket> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                return None;
            }
            let address = parse_socket_address(fields[1])?;
            let inode = fields[9].parse().ok()?;
            Some(ListeningSocket { address, inode })
        })
        .collect()
}

/// Decode `ADDR:PORT` where the address is the raw network-order words as
/// printed by the kernel in host byte order.
fn parse_socket_address(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(host_word(addr)?)),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&host_word(addr.get(i * 8..i * 8 + 8)?)?);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn host_word(hex: &str) -> Option<[u8; 4]> {
    u32::from_str_radix(hex, 16).ok().map(u32::to_ne_bytes)
}

/// What automatic discovery leaves alone.
#[derive(Debug, Clone, Default)]
pub struct ProcNetFilter {
    pub exclude_ports: HashSet<u16>,
    pub exclude_processes: HashSet<String>,
    /// The public port range; the daemon's own tunnel listeners live there.
    pub public_range: Option<PortRange>,
    /// Our own pid, so the control and tunnel sockets are never tunneled.
    pub own_pid: Option<u32>,
}

impl ProcNetFilter {
    pub fn from_config(config: &DiscoveryConfig, public_range: PortRange) -> Self {
        Self {
            exclude_ports: config.exclude_ports.iter().copied().collect(),
            exclude_processes: config.exclude_processes.iter().cloned().collect(),
            public_range: Some(public_range),
            own_pid: Some(std::process::id()),
        }
    }

    fn skips_port(&self, port: u16) -> bool {
        self.exclude_ports.contains(&port) || self.public_range.is_some_and(|r| r.contains(port))
    }

    fn skips_owner(&self, owner: Option<&Owner>) -> bool {
        owner.is_some_and(|o| {
            self.own_pid == Some(o.pid) || self.exclude_processes.contains(&o.name)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Owner {
    pid: u32,
    name: String,
}

/// Discovers every local TCP listener on Linux.
#[derive(Debug, Clone)]
pub struct ProcNetDiscovery {
    root: PathBuf,
    filter: ProcNetFilter,
}

impl ProcNetDiscovery {
    pub fn new(filter: ProcNetFilter) -> Self {
        Self::with_root("/proc", filter)
    }

    /// Read from a procfs mounted (or laid out) at `root`.
    pub fn with_root(root: impl Into<PathBuf>, filter: ProcNetFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    fn read_table(&self, name: &str) -> Result<Vec<ListeningSocket>> {
        let path = self.root.join("net").join(name);
        match fs::read_to_string(&path) {
            Ok(table) => Ok(parse_listeners(&table)),
            // No IPv6 stack.
            Err(e) if e.kind() == io::ErrorKind::NotFound && name == "tcp6" => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Map socket inodes to the processes holding them. Processes we may not
    /// inspect, or that exit mid-scan, are skipped.
    fn socket_owners(&self, wanted: &HashSet<u64>) -> HashMap<u64, Owner> {
        let mut owners = HashMap::new();
        let Ok(entries) = fs::read_dir(&self.root) else {
            return owners;
        };
        for entry in entries.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let mut name = None;
            for fd in fds.flatten() {
                let Some(inode) = fs::read_link(fd.path()).ok().as_deref().and_then(socket_inode)
                else {
                    continue;
                };
                if !wanted.contains(&inode) || owners.contains_key(&inode) {
                    continue;
                }
                let name = name
                    .get_or_insert_with(|| {
                        process_name(&entry.path()).unwrap_or_else(|| pid.to_string())
                    })
                    .clone();
                owners.insert(inode, Owner { pid, name });
            }
            if owners.len() == wanted.len() {
                break;
            }
        }
        owners
    }
}

fn socket_inode(link: &Path) -> Option<u64> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

fn process_name(proc_dir: &Path) -> Option<String> {
    let comm = fs::read_to_string(proc_dir.join("comm")).ok()?;
    let name = comm.trim();
    (!name.is_empty()).then(|| name.to_string())
}

/// Application key for a discovered listener: `<process>-<port>`, or
/// `port-<port>` when the owner is unknown.
fn application_key(owner: Option<&Owner>, port: u16) -> String {
    match owner {
        Some(owner) => {
            let name: String = owner
                .name
                .chars()
                .map(|c| if c.is_whitespace() || c == '/' { '_' } else { c })
                .collect();
            format!("{name}-{port}")
        }
        None => format!("port-{port}"),
    }
}

/// Where to reach a listener from this host. Wildcard binds are reached on
/// the loopback address of the same family.
fn backend_address(listening: SocketAddr) -> SocketAddr {
    let ip = match listening.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, listening.port())
}

impl Discovery for ProcNetDiscovery {
    fn discover(&self) -> Result<Vec<Application>> {
        let mut sockets = self.read_table("tcp")?;
        sockets.extend(self.read_table("tcp6")?);
        sockets.retain(|s| !self.filter.skips_port(s.address.port()));

        let wanted: HashSet<u64> = sockets.iter().map(|s| s.inode).collect();
        let owners = self.socket_owners(&wanted);

        let mut seen = HashSet::new();
        let mut applications = Vec::new();
        for socket in sockets {
            let owner = owners.get(&socket.inode);
            if self.filter.skips_owner(owner) {
                continue;
            }
            let key = application_key(owner, socket.address.port());
            // IPv4 rows come first, so a dual listener keeps its IPv4 side.
            if !seen.insert(key.clone()) {
                continue;
            }
            trace!(application_key = %key, address = %socket.address, "Found listener");
            let mut application = Application::new(key, backend_address(socket.address));
            if let Some(owner) = owner {
                application = application.with_pid(owner.pid);
            }
            applications.push(application);
        }
        debug!(count = applications.len(), "Scanned /proc/net for listeners");
        Ok(applications)
    }
}

#[cfg(test)]
#[path = "proc_net_tests.rs"]
mod tests;
