//! Decoded packet view and synthesis of reply packets

use std::net::{Ipv4Addr, SocketAddrV4};

use strum::Display;

use crate::checksum::{ipv4_checksum, tcp_checksum};
use crate::ipv4::{DEFAULT_TTL, DONT_FRAGMENT, IPV4_HEADER_LEN, Ipv4Header, TransportProtocol};
use crate::tcp::{TCP_HEADER_LEN, TcpHeader};
use crate::udp::{UDP_HEADER_LEN, UdpHeader};
use crate::DecodeError;

/// Identifier of the process owning a flow, as reported by the platform
pub type OwnerId = u32;

/// Direction of a frame relative to the tunnel device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Direction {
    /// Device to network (the device originated this frame)
    Outbound,
    /// Network to device (synthesized reply headed for the device)
    Inbound,
    Unknown,
}

/// Transport header of a decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpHeader),
    Udp(UdpHeader),
    /// Unhandled protocol, or a header-length field implying truncation;
    /// such packets carry no transport view and are never translated
    Other,
}

/// A decoded view over one raw frame
///
/// Owns its backing buffer; the transport headers are parsed copies, while
/// `payload()` borrows from the buffer. Direction and owner are filled in
/// by the device pipeline after decoding.
#[derive(Debug, Clone)]
pub struct Packet {
    pub ipv4: Ipv4Header,
    pub transport: Transport,
    payload_start: usize,
    data: Vec<u8>,
    pub direction: Direction,
    pub owner: Option<OwnerId>,
}

impl Packet {
    /// Decodes a raw frame.
    ///
    /// Buffers shorter than a minimal IPv4 header are rejected. Anything
    /// else decodes best-effort: a header-length field pointing past the
    /// buffer, or a transport header that does not fit, degrades the
    /// packet to `Transport::Other` rather than failing.
    pub fn decode(data: Vec<u8>) -> Result<Self, DecodeError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }
        let mut ipv4 = Ipv4Header::parse(&data)?;
        let hlen = ipv4.header_len;
        if hlen < IPV4_HEADER_LEN || hlen > data.len() {
            ipv4.protocol = TransportProtocol::Other;
            return Ok(Self::degraded(ipv4, data));
        }

        let (transport, payload_start) = match ipv4.protocol {
            TransportProtocol::Tcp => match TcpHeader::parse(&data[hlen..]) {
                Ok(tcp)
                    if tcp.data_offset >= TCP_HEADER_LEN
                        && hlen + tcp.data_offset <= data.len() =>
                {
                    let start = hlen + tcp.data_offset;
                    (Transport::Tcp(tcp), start)
                }
                _ => {
                    ipv4.protocol = TransportProtocol::Other;
                    return Ok(Self::degraded(ipv4, data));
                }
            },
            TransportProtocol::Udp => match UdpHeader::parse(&data[hlen..]) {
                Ok(udp) => (Transport::Udp(udp), hlen + UDP_HEADER_LEN),
                Err(_) => {
                    ipv4.protocol = TransportProtocol::Other;
                    return Ok(Self::degraded(ipv4, data));
                }
            },
            TransportProtocol::Other => (Transport::Other, data.len()),
        };

        Ok(Self {
            ipv4,
            transport,
            payload_start,
            data,
            direction: Direction::Unknown,
            owner: None,
        })
    }

    fn degraded(ipv4: Ipv4Header, data: Vec<u8>) -> Self {
        let payload_start = data.len();
        Self {
            ipv4,
            transport: Transport::Other,
            payload_start,
            data,
            direction: Direction::Unknown,
            owner: None,
        }
    }

    /// Tags the frame as outbound or inbound relative to the device address
    pub fn classify(&mut self, device_ip: Ipv4Addr) {
        self.direction = if self.ipv4.source == device_ip {
            Direction::Outbound
        } else if self.ipv4.destination == device_ip {
            Direction::Inbound
        } else {
            Direction::Unknown
        };
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self.transport, Transport::Tcp(_))
    }

    pub fn is_udp(&self) -> bool {
        matches!(self.transport, Transport::Udp(_))
    }

    pub fn protocol(&self) -> TransportProtocol {
        match self.transport {
            Transport::Tcp(_) => TransportProtocol::Tcp,
            Transport::Udp(_) => TransportProtocol::Udp,
            Transport::Other => TransportProtocol::Other,
        }
    }

    pub fn tcp(&self) -> Option<&TcpHeader> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn udp(&self) -> Option<&UdpHeader> {
        match &self.transport {
            Transport::Udp(udp) => Some(udp),
            _ => None,
        }
    }

    pub fn source_port(&self) -> Option<u16> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp.source_port),
            Transport::Udp(udp) => Some(udp.source_port),
            Transport::Other => None,
        }
    }

    pub fn destination_port(&self) -> Option<u16> {
        match &self.transport {
            Transport::Tcp(tcp) => Some(tcp.destination_port),
            Transport::Udp(udp) => Some(udp.destination_port),
            Transport::Other => None,
        }
    }

    pub fn source_endpoint(&self) -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(self.ipv4.source, self.source_port()?))
    }

    pub fn destination_endpoint(&self) -> Option<SocketAddrV4> {
        Some(SocketAddrV4::new(
            self.ipv4.destination,
            self.destination_port()?,
        ))
    }

    /// Transport payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_start.min(self.data.len())..]
    }

    /// The raw frame, as read off the wire
    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

fn synth_ipv4(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    protocol: TransportProtocol,
    total_length: u16,
    ip_id: u16,
) -> Ipv4Header {
    Ipv4Header {
        version: 4,
        header_len: IPV4_HEADER_LEN,
        tos: 0,
        total_length,
        identification: ip_id,
        flags_fragment: DONT_FRAGMENT,
        ttl: DEFAULT_TTL,
        protocol_number: protocol.number(),
        protocol,
        checksum: 0,
        source: *src.ip(),
        destination: *dst.ip(),
    }
}

/// Builds a complete raw TCP/IPv4 frame with both checksums filled in.
///
/// Synthesized headers use the fixed policy values: no IP options, no TCP
/// options (data offset 5), DF set, TTL 64, window 65535.
pub fn build_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    flags: u8,
    sequence: u32,
    acknowledgement: u32,
    ip_id: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];

    let ipv4 = synth_ipv4(src, dst, TransportProtocol::Tcp, total as u16, ip_id);
    ipv4.write(&mut frame[..IPV4_HEADER_LEN]);

    let tcp = TcpHeader {
        source_port: src.port(),
        destination_port: dst.port(),
        sequence,
        acknowledgement,
        data_offset: TCP_HEADER_LEN,
        flags,
        window: 65535,
        checksum: 0,
        urgent: 0,
    };
    tcp.write(&mut frame[IPV4_HEADER_LEN..IPV4_HEADER_LEN + TCP_HEADER_LEN]);
    frame[IPV4_HEADER_LEN + TCP_HEADER_LEN..].copy_from_slice(payload);

    let tcp_sum = tcp_checksum(*src.ip(), *dst.ip(), &frame[IPV4_HEADER_LEN..]);
    frame[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&tcp_sum.to_be_bytes());

    let ip_sum = ipv4_checksum(&frame[..IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    frame
}

/// Builds a complete raw UDP/IPv4 frame. The UDP checksum is deliberately
/// left zero; only the IPv4 header checksum is computed.
pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, ip_id: u16, payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
    let mut frame = vec![0u8; total];

    let ipv4 = synth_ipv4(src, dst, TransportProtocol::Udp, total as u16, ip_id);
    ipv4.write(&mut frame[..IPV4_HEADER_LEN]);

    let udp = UdpHeader {
        source_port: src.port(),
        destination_port: dst.port(),
        length: (UDP_HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    };
    udp.write(&mut frame[IPV4_HEADER_LEN..IPV4_HEADER_LEN + UDP_HEADER_LEN]);
    frame[IPV4_HEADER_LEN + UDP_HEADER_LEN..].copy_from_slice(payload);

    let ip_sum = ipv4_checksum(&frame[..IPV4_HEADER_LEN]);
    frame[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    frame
}
