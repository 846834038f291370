//! IPv4 header (RFC 791)

use std::net::Ipv4Addr;

use strum::Display;

use crate::DecodeError;

/// Size of an IPv4 header without options
pub const IPV4_HEADER_LEN: usize = 20;

/// Don't-fragment bit in the flags/fragment-offset field
pub const DONT_FRAGMENT: u16 = 0x4000;

/// TTL written into synthesized packets
pub const DEFAULT_TTL: u8 = 64;

/// Transport protocol carried in an IPv4 packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Other,
}

impl TransportProtocol {
    pub fn from_number(number: u8) -> Self {
        match number {
            6 => Self::Tcp,
            17 => Self::Udp,
            _ => Self::Other,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Other => 0xFF,
        }
    }
}

/// Decoded IPv4 header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes, derived from the IHL field
    pub header_len: usize,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Flags (3 bits) and fragment offset (13 bits)
    pub flags_fragment: u16,
    pub ttl: u8,
    /// Raw protocol number from the wire
    pub protocol_number: u8,
    pub protocol: TransportProtocol,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Parses the fixed 20-byte header part. The IHL field is recorded
    /// as-is; the caller decides whether a value pointing past the buffer
    /// makes the packet unusable.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < IPV4_HEADER_LEN {
            return Err(DecodeError::ShortHeader {
                what: "IPv4",
                need: IPV4_HEADER_LEN,
                got: data.len(),
            });
        }
        let protocol_number = data[9];
        Ok(Self {
            version: data[0] >> 4,
            header_len: usize::from(data[0] & 0x0F) * 4,
            tos: data[1],
            total_length: u16::from_be_bytes([data[2], data[3]]),
            identification: u16::from_be_bytes([data[4], data[5]]),
            flags_fragment: u16::from_be_bytes([data[6], data[7]]),
            ttl: data[8],
            protocol_number,
            protocol: TransportProtocol::from_number(protocol_number),
            checksum: u16::from_be_bytes([data[10], data[11]]),
            source: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            destination: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        })
    }

    /// Serializes the fixed 20-byte header into `out` (options are never
    /// emitted). The stored checksum is written verbatim; callers patch it
    /// after computing the real sum.
    pub fn write(&self, out: &mut [u8]) {
        out[0] = (self.version << 4) | ((self.header_len / 4) as u8 & 0x0F);
        out[1] = self.tos;
        out[2..4].copy_from_slice(&self.total_length.to_be_bytes());
        out[4..6].copy_from_slice(&self.identification.to_be_bytes());
        out[6..8].copy_from_slice(&self.flags_fragment.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.protocol_number;
        out[10..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..16].copy_from_slice(&self.source.octets());
        out[16..20].copy_from_slice(&self.destination.octets());
    }
}
