//! Flow identification
//!
//! A flow is one TCP or UDP conversation between the tunnel device and a
//! remote peer. The device has exactly one address, so the device-side
//! address never participates in the key; the local port alone
//! disambiguates concurrent flows to the same remote endpoint.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use tunnat_packet::Packet;

/// Identifies one conversation: remote endpoint plus device-side port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub local_port: u16,
}

impl FlowKey {
    pub fn new(remote: SocketAddrV4, local_port: u16) -> Self {
        Self {
            remote_ip: *remote.ip(),
            remote_port: remote.port(),
            local_port,
        }
    }

    /// Key for a device-originated packet: destination is the remote side
    pub fn from_outbound(packet: &Packet) -> Option<Self> {
        let remote = packet.destination_endpoint()?;
        let local_port = packet.source_port()?;
        Some(Self::new(remote, local_port))
    }

    pub fn remote(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.remote_ip, self.remote_port)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ":{} <-> {}:{}",
            self.local_port, self.remote_ip, self.remote_port
        )
    }
}
