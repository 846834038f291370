//! Packet codec for the tunnat flow translation engine
//!
//! Parsing and serialization of IPv4/TCP/UDP headers over raw byte
//! buffers, plus the header checksums. Everything in this crate is pure:
//! no sockets, no threads, no state beyond the packet buffers themselves.
//!
//! The codec implements the simplified wire formats the translators rely
//! on: 20-byte IPv4 headers (options are tolerated on decode, never
//! emitted), 20-byte TCP headers with the data offset fixed to 5 words,
//! 8-byte UDP headers with the checksum left zero for relayed datagrams.

mod checksum;
pub mod ipv4;
pub mod packet;
pub mod tcp;
pub mod udp;

pub use checksum::{ipv4_checksum, tcp_checksum};
pub use ipv4::{IPV4_HEADER_LEN, Ipv4Header, TransportProtocol};
pub use packet::{Direction, OwnerId, Packet, Transport, build_tcp, build_udp};
pub use tcp::{TCP_HEADER_LEN, TcpHeader, seq_after};
pub use udp::{UDP_HEADER_LEN, UdpHeader};

use thiserror::Error;

/// Errors produced while decoding a raw frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame too short for even a minimal IPv4 header
    #[error("frame of {0} bytes is shorter than a minimal IPv4 header")]
    Truncated(usize),

    /// A header parse ran out of bytes
    #[error("{what} header needs {need} bytes, got {got}")]
    ShortHeader {
        what: &'static str,
        need: usize,
        got: usize,
    },
}
