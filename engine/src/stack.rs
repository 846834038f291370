//! Stack assembly and worker lifecycle
//!
//! Wires the seven workers together: tunnel read/write, the TCP
//! translator, the UDP send/receive/reaper trio, and the capture
//! aggregator. `Stack::spawn` consumes the tunnel halves, so a second
//! start needs a second tunnel; stopping is a flag plus a poll wakeup
//! followed by joining every thread.

use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;
use mio::{Poll, Waker};

use crate::EngineError;
use crate::capture::{Aggregator, GroupSnapshot};
use crate::device::{ReadLoop, WriteLoop};
use crate::platform::{OwnerLookup, OwnerResolver, SocketProtect};
use crate::tcp::TcpTranslator;
use crate::udp::{UdpReaper, UdpRecvWorker, UdpSendWorker, UdpTable, WAKER_TOKEN};

/// Engine tuning knobs; the defaults match the expected tunnel MTU and
/// load profile
#[derive(Debug, Clone)]
pub struct Config {
    /// Address assigned to the tunnel's device-side endpoint
    pub device_ip: Ipv4Addr,
    /// Tunnel read buffer; must hold one full frame
    pub read_buffer_size: usize,
    /// Capacity of every bounded queue
    pub queue_capacity: usize,
    /// UDP sessions silent this long are closed
    pub udp_idle_timeout: Duration,
    /// How often the reaper sweeps the session table
    pub udp_sweep_interval: Duration,
}

impl Config {
    pub fn new(device_ip: Ipv4Addr) -> Self {
        Self {
            device_ip,
            read_buffer_size: 16384,
            queue_capacity: 1024,
            udp_idle_timeout: Duration::from_secs(60),
            udp_sweep_interval: Duration::from_secs(5),
        }
    }
}

/// A running engine: seven named worker threads around one tunnel
pub struct Stack {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    threads: Vec<JoinHandle<()>>,
    groups: GroupSnapshot,
    bytes_read: Arc<AtomicU64>,
    bytes_written: Arc<AtomicU64>,
}

impl Stack {
    /// Spawns every worker. Consumes the tunnel halves; unblocking the
    /// tunnel read on shutdown (closing the device) stays the caller's
    /// job.
    pub fn spawn(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        protect: Arc<dyn SocketProtect>,
        owner: Arc<dyn OwnerLookup>,
        resolver: Option<Arc<dyn OwnerResolver>>,
        config: &Config,
    ) -> Result<Self, EngineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let bytes_read = Arc::new(AtomicU64::new(0));
        let bytes_written = Arc::new(AtomicU64::new(0));

        let (tcp_tx, tcp_rx) = crossbeam_channel::bounded(config.queue_capacity);
        let (udp_tx, udp_rx) = crossbeam_channel::bounded(config.queue_capacity);
        let (out_tx, out_rx) = crossbeam_channel::bounded(config.queue_capacity);
        let (cap_tx, cap_rx) = crossbeam_channel::bounded(config.queue_capacity);

        let udp_poll = Poll::new()?;
        let udp_registry = udp_poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(udp_poll.registry(), WAKER_TOKEN)?);
        let udp_table = Arc::new(Mutex::new(UdpTable::new()));

        let read_loop = ReadLoop::new(
            reader,
            config.device_ip,
            config.read_buffer_size,
            tcp_tx,
            udp_tx,
            cap_tx.clone(),
            owner,
            stop.clone(),
            bytes_read.clone(),
        );
        let write_loop = WriteLoop::new(
            writer,
            out_rx,
            config.device_ip,
            cap_tx,
            stop.clone(),
            bytes_written.clone(),
        );
        let tcp = TcpTranslator::new(tcp_rx, out_tx.clone(), protect.clone(), stop.clone())?;
        let udp_send =
            UdpSendWorker::new(udp_rx, udp_table.clone(), udp_registry, protect, stop.clone());
        let udp_recv = UdpRecvWorker::new(udp_poll, udp_table.clone(), out_tx, stop.clone());
        let udp_reaper = UdpReaper::new(
            udp_table,
            stop.clone(),
            config.udp_sweep_interval,
            config.udp_idle_timeout,
        );
        let aggregator = Aggregator::new(cap_rx, resolver, stop.clone());
        let groups = aggregator.groups();

        let mut threads = Vec::with_capacity(7);
        threads.push(named("tun-read", move || read_loop.run())?);
        threads.push(named("tun-write", move || write_loop.run())?);
        threads.push(named("tcp-translator", move || tcp.run())?);
        threads.push(named("udp-send", move || udp_send.run())?);
        threads.push(named("udp-recv", move || udp_recv.run())?);
        threads.push(named("udp-reaper", move || udp_reaper.run())?);
        threads.push(named("capture-agg", move || aggregator.run())?);

        info!("engine stack started for device {}", config.device_ip);
        Ok(Self {
            stop,
            waker,
            threads,
            groups,
            bytes_read,
            bytes_written,
        })
    }

    /// Signals every worker, wakes the UDP poll and joins the threads
    pub fn shutdown(mut self) {
        info!("engine stack shutting down");
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!("udp poll wakeup failed: {}", e);
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        info!("engine stack stopped");
    }

    /// Conversation groups collected by the capture aggregator
    pub fn flow_groups(&self) -> GroupSnapshot {
        self.groups.clone()
    }

    /// Total bytes read from the tunnel device
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Total bytes written to the tunnel device
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

fn named<F>(name: &str, f: F) -> Result<JoinHandle<()>, EngineError>
where
    F: FnOnce() + Send + 'static,
{
    Ok(thread::Builder::new().name(name.into()).spawn(f)?)
}
