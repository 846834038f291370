//! One's-complement internet checksums (RFC 1071)

use std::net::Ipv4Addr;

use crate::ipv4::TransportProtocol;

/// Sums a byte slice as big-endian 16-bit words.
///
/// An odd trailing byte is treated as the high half of a final word,
/// padded with zero. Callers must only split buffers on even offsets or
/// word alignment is lost.
fn sum_words(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u32::from(u16::from_be_bytes([chunk[0], chunk[1]]))
        } else {
            u32::from(chunk[0]) << 8
        };
        sum += word;
    }
    sum
}

/// Folds the carries back into the low 16 bits and complements the result
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// IPv4 header checksum over `header`, treating the checksum field
/// (bytes 10..12) as zero
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let sum = sum_words(&header[..10]) + sum_words(&header[12..]);
    fold(sum)
}

/// TCP checksum over `segment` (header plus payload), prefixed by the
/// 12-byte pseudo header, treating the checksum field (bytes 16..18 of
/// the segment) as zero
pub fn tcp_checksum(source: Ipv4Addr, destination: Ipv4Addr, segment: &[u8]) -> u16 {
    let mut sum = sum_words(&source.octets()) + sum_words(&destination.octets());
    sum += u32::from(TransportProtocol::Tcp.number());
    sum += segment.len() as u32;
    sum += sum_words(&segment[..16]) + sum_words(&segment[18..]);
    fold(sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_known_vector() {
        // RFC 1071 worked example as it appears in most references
        let header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0xb8, 0x61, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_checksum(&header), 0xb861);
    }

    #[test]
    fn ipv4_stored_checksum_ignored() {
        let mut header: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let zeroed = ipv4_checksum(&header);
        header[10] = 0xde;
        header[11] = 0xad;
        assert_eq!(ipv4_checksum(&header), zeroed);
    }

    #[test]
    fn tcp_detects_payload_corruption() {
        let src = Ipv4Addr::new(10, 0, 0, 8);
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let mut segment = vec![0u8; 25];
        segment[0] = 0x1f; // source port high byte
        segment[24] = 0x41; // last payload byte
        let before = tcp_checksum(src, dst, &segment);
        segment[24] ^= 0x01;
        assert_ne!(tcp_checksum(src, dst, &segment), before);
    }

    #[test]
    fn fold_carries() {
        // 0xFFFF + 0x0001 folds to 0x0001 before complement
        assert_eq!(fold(0x0001_0000), !0x0001u16);
    }
}
