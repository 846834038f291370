//! TCP header (RFC 793, options parsed over but never emitted)

use crate::DecodeError;

/// Size of a TCP header without options
pub const TCP_HEADER_LEN: usize = 20;

/// TCP flag bits
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    /// Human-readable rendition of a flag byte, for logging
    pub fn describe(flags: u8) -> String {
        let mut s = String::new();
        for (bit, name) in [
            (FIN, "FIN "),
            (SYN, "SYN "),
            (RST, "RST "),
            (PSH, "PSH "),
            (ACK, "ACK "),
            (URG, "URG "),
        ] {
            if flags & bit != 0 {
                s.push_str(name);
            }
        }
        s
    }
}

/// True if sequence number `a` comes after `b` in sequence space
/// (wrapping comparison modulo 2^32)
pub fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Decoded TCP header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence: u32,
    pub acknowledgement: u32,
    /// Header length in bytes, derived from the data offset field
    pub data_offset: usize,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

impl TcpHeader {
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < TCP_HEADER_LEN {
            return Err(DecodeError::ShortHeader {
                what: "TCP",
                need: TCP_HEADER_LEN,
                got: data.len(),
            });
        }
        Ok(Self {
            source_port: u16::from_be_bytes([data[0], data[1]]),
            destination_port: u16::from_be_bytes([data[2], data[3]]),
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgement: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset: usize::from(data[12] >> 4) * 4,
            flags: data[13],
            window: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Serializes the fixed 20-byte header into `out`
    pub fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.sequence.to_be_bytes());
        out[8..12].copy_from_slice(&self.acknowledgement.to_be_bytes());
        out[12] = ((self.data_offset / 4) as u8) << 4;
        out[13] = self.flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        out[18..20].copy_from_slice(&self.urgent.to_be_bytes());
    }

    pub fn is_fin(&self) -> bool {
        self.flags & flags::FIN != 0
    }

    pub fn is_syn(&self) -> bool {
        self.flags & flags::SYN != 0
    }

    pub fn is_rst(&self) -> bool {
        self.flags & flags::RST != 0
    }

    pub fn is_psh(&self) -> bool {
        self.flags & flags::PSH != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & flags::ACK != 0
    }

    pub fn is_urg(&self) -> bool {
        self.flags & flags::URG != 0
    }
}
