//! Capture aggregation
//!
//! The device pipeline taps a decoded copy of every frame it moves into
//! a lossy channel. The aggregator drains that channel and folds the
//! records into per-owner conversation groups, one group per (owner,
//! remote endpoint) pair, for whatever presentation layer the host
//! attaches. Owner attribution happens on the outbound path only, so
//! inbound frames arrive unattributed; they are filed into the group
//! whose remote endpoint and device port they answer. Unattributed
//! frames matching no group are skipped.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::*;

use tunnat_packet::{Direction, OwnerId, Packet, TransportProtocol};

use crate::platform::OwnerResolver;

/// Lightweight summary of one captured frame
#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub direction: Direction,
    pub protocol: TransportProtocol,
    pub local_port: u16,
    pub remote_port: u16,
    pub payload_len: usize,
    pub total_len: usize,
}

/// One owner's conversation with one remote endpoint
#[derive(Debug, Clone)]
pub struct FlowGroup {
    pub owner: OwnerId,
    pub owner_name: Option<String>,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
    pub sent: Vec<PacketRecord>,
    pub received: Vec<PacketRecord>,
}

/// Shared snapshot handle the embedding application reads from
pub type GroupSnapshot = Arc<Mutex<Vec<FlowGroup>>>;

/// Drains the capture tap into conversation groups
pub struct Aggregator {
    rx: Receiver<Packet>,
    groups: GroupSnapshot,
    resolver: Option<Arc<dyn OwnerResolver>>,
    stop: Arc<AtomicBool>,
}

impl Aggregator {
    pub fn new(
        rx: Receiver<Packet>,
        resolver: Option<Arc<dyn OwnerResolver>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            groups: Arc::new(Mutex::new(Vec::new())),
            resolver,
            stop,
        }
    }

    pub fn groups(&self) -> GroupSnapshot {
        self.groups.clone()
    }

    pub fn run(self) {
        info!("capture aggregator started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(packet) => self.ingest(&packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("capture aggregator stopped");
    }

    fn ingest(&self, packet: &Packet) {
        // The remote side is whichever endpoint is not the device
        let (remote, local_port) = match packet.direction {
            Direction::Outbound => (packet.destination_endpoint(), packet.source_port()),
            Direction::Inbound => (packet.source_endpoint(), packet.destination_port()),
            Direction::Unknown => return,
        };
        let (Some(remote), Some(local_port)) = (remote, local_port) else {
            return;
        };

        let record = PacketRecord {
            direction: packet.direction,
            protocol: packet.protocol(),
            local_port,
            remote_port: remote.port(),
            payload_len: packet.payload().len(),
            total_len: packet.raw().len(),
        };

        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());

        let Some(owner) = packet.owner else {
            // Only the outbound path carries attribution; a reply is
            // filed into the group its outbound traffic opened
            if packet.direction == Direction::Inbound {
                if let Some(group) = groups.iter_mut().find(|g| {
                    g.remote_ip == *remote.ip()
                        && g.remote_port == remote.port()
                        && g.sent.iter().any(|r| r.local_port == local_port)
                }) {
                    group.received.push(record);
                }
            }
            return;
        };

        let idx = groups
            .iter()
            .position(|g| {
                g.owner == owner && g.remote_ip == *remote.ip() && g.remote_port == remote.port()
            })
            .unwrap_or_else(|| {
                let owner_name = self
                    .resolver
                    .as_ref()
                    .and_then(|r| r.display_name(owner));
                groups.push(FlowGroup {
                    owner,
                    owner_name,
                    remote_ip: *remote.ip(),
                    remote_port: remote.port(),
                    sent: Vec::new(),
                    received: Vec::new(),
                });
                groups.len() - 1
            });
        let group = &mut groups[idx];

        match packet.direction {
            Direction::Outbound => group.sent.push(record),
            Direction::Inbound => group.received.push(record),
            Direction::Unknown => {}
        }
    }
}
