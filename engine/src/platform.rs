//! Platform collaborator interfaces
//!
//! The engine is embedded next to whatever owns the tunnel device. That
//! host supplies three capabilities the engine cannot provide itself:
//! exempting a real socket from tunnel routing, attributing a flow to an
//! owning process, and turning an owner id into a display name. Each is a
//! trait here, with a no-op implementation for hosts (and tests) that do
//! not care.

use std::io;
use std::net::SocketAddrV4;

use tunnat_packet::{OwnerId, TransportProtocol};

/// Exempts a raw socket from being routed back into the tunnel.
///
/// Must be invoked on every real socket before it connects; otherwise the
/// engine's own traffic is captured recursively.
pub trait SocketProtect: Send + Sync {
    fn protect(&self, socket: &socket2::Socket) -> io::Result<()>;
}

/// For hosts whose routing already excludes the engine's sockets
pub struct NoProtect;

impl SocketProtect for NoProtect {
    fn protect(&self, _socket: &socket2::Socket) -> io::Result<()> {
        Ok(())
    }
}

/// Maps a (protocol, local, remote) tuple to the owning process
pub trait OwnerLookup: Send + Sync {
    fn owner_of(
        &self,
        protocol: TransportProtocol,
        local: SocketAddrV4,
        remote: SocketAddrV4,
    ) -> Option<OwnerId>;
}

/// Owner attribution unavailable; every flow stays unattributed
pub struct NoOwner;

impl OwnerLookup for NoOwner {
    fn owner_of(
        &self,
        _protocol: TransportProtocol,
        _local: SocketAddrV4,
        _remote: SocketAddrV4,
    ) -> Option<OwnerId> {
        None
    }
}

/// Queries the lookup in both orientations.
///
/// Platform attribution may index a connection by either endpoint order,
/// so a miss on local->remote is retried as remote->local.
pub fn lookup_symmetric(
    lookup: &dyn OwnerLookup,
    protocol: TransportProtocol,
    local: SocketAddrV4,
    remote: SocketAddrV4,
) -> Option<OwnerId> {
    lookup
        .owner_of(protocol, local, remote)
        .or_else(|| lookup.owner_of(protocol, remote, local))
}

/// Resolves an owner id to something presentable (a package or process name)
pub trait OwnerResolver: Send + Sync {
    fn display_name(&self, owner: OwnerId) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    /// Lookup that only knows the remote->local orientation
    struct ReversedTable {
        local: SocketAddrV4,
        remote: SocketAddrV4,
        owner: OwnerId,
    }

    impl OwnerLookup for ReversedTable {
        fn owner_of(
            &self,
            _protocol: TransportProtocol,
            local: SocketAddrV4,
            remote: SocketAddrV4,
        ) -> Option<OwnerId> {
            (local == self.remote && remote == self.local).then_some(self.owner)
        }
    }

    #[test]
    fn symmetric_lookup_tries_both_orientations() {
        let local = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 8), 40000);
        let remote = SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, 4), 443);
        let table = ReversedTable {
            local,
            remote,
            owner: 1042,
        };

        assert_eq!(
            lookup_symmetric(&table, TransportProtocol::Tcp, local, remote),
            Some(1042)
        );
        assert_eq!(
            lookup_symmetric(&NoOwner, TransportProtocol::Tcp, local, remote),
            None
        );
    }
}
