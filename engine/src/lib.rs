//! Userspace flow translation engine
//!
//! Bridges a virtual tunnel device to real host sockets: every TCP flow
//! and UDP conversation the device originates is re-homed onto its own
//! outbound socket, with the engine speaking just enough TCP/IP back
//! into the tunnel to satisfy both sides. Flows are attributed to their
//! owning process and folded into conversation groups for inspection.
//!
//! The host supplies the tunnel byte channel and the platform
//! capabilities ([`platform::SocketProtect`], [`platform::OwnerLookup`])
//! and gets back a running [`Stack`] of worker threads.

use std::io;

use thiserror::Error;

pub mod capture;
pub mod device;
pub mod flow;
pub mod platform;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use capture::{FlowGroup, GroupSnapshot, PacketRecord};
pub use flow::FlowKey;
pub use platform::{NoOwner, NoProtect, OwnerLookup, OwnerResolver, SocketProtect};
pub use stack::{Config, Stack};

/// Failures setting the engine up; once running, errors stay local to
/// the affected flow
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Io(#[from] io::Error),
}
