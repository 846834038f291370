//! UDP header (RFC 768)

use crate::DecodeError;

/// Size of a UDP header
pub const UDP_HEADER_LEN: usize = 8;

/// Decoded UDP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    /// Header plus payload length
    pub length: u16,
    /// Always written as zero on the synthesis path; relayed datagrams
    /// carry no UDP checksum
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(DecodeError::ShortHeader {
                what: "UDP",
                need: UDP_HEADER_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            length: u16::from_be_bytes([data[4], data[5]]),
            checksum: u16::from_be_bytes([data[6], data[7]]),
        })
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..8].copy_from_slice(&self.checksum.to_be_bytes());
    }
}
