use std::fmt::Display;
use std::net::SocketAddr;

/// Host represents a cluster node the driver keeps a connection pool for.
///
/// The identity of a host (its address) does not change for the lifetime
/// of the pool that connects to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Host {
    /// Address used to open connections to the host.
    pub address: SocketAddr,
    /// Datacenter of the host, if known.
    pub datacenter: Option<String>,
    /// Rack of the host, if known.
    pub rack: Option<String>,
}

impl Host {
    /// Creates a host with an unknown location.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            rack: None,
        }
    }

    /// Sets the datacenter of the host.
    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }

    /// Sets the rack of the host.
    pub fn with_rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }
}

impl Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Proximity class of a host, as decided by the load balancing layer.
///
/// The distance selects which [PoolSizing](crate::policies::PoolSizing)
/// applies to the pool of that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    /// Host in the local datacenter.
    Local,
    /// Host in a remote datacenter.
    Remote,
    /// Host the driver should not send requests to.
    Ignored,
}

impl HostDistance {
    pub(crate) const ALL: [HostDistance; 3] = [
        HostDistance::Local,
        HostDistance::Remote,
        HostDistance::Ignored,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            HostDistance::Local => 0,
            HostDistance::Remote => 1,
            HostDistance::Ignored => 2,
        }
    }
}

impl Display for HostDistance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostDistance::Local => "LOCAL",
            HostDistance::Remote => "REMOTE",
            HostDistance::Ignored => "IGNORED",
        };
        f.write_str(name)
    }
}
