//! UDP session relay
//!
//! No handshake to emulate: every flow is one real datagram socket that
//! the send worker opens lazily on the first outbound datagram. Replies
//! arrive through the receive worker's poll; a reaper closes sessions
//! the device stopped talking to.
//!
//! Three threads touch the session table, so every read-modify-write
//! goes through its mutex. The blocking outbound queue send never
//! happens while the table lock is held.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::*;
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};

use tunnat_packet::{Packet, build_udp};

use crate::flow::FlowKey;
use crate::platform::SocketProtect;

const EVENT_CAPACITY: usize = 256;
const DATAGRAM_MAX: usize = 65535;

/// Token the stack's waker fires on; session tokens count up from zero
pub const WAKER_TOKEN: Token = Token(usize::MAX);

/// One relayed datagram flow
struct UdpSession {
    socket: UdpSocket,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    last_activity: Instant,
}

/// Session table shared by the send, receive and reaper threads
pub struct UdpTable {
    by_key: HashMap<FlowKey, Token>,
    sessions: HashMap<Token, UdpSession>,
    next_token: usize,
}

impl UdpTable {
    pub fn new() -> Self {
        Self {
            by_key: HashMap::new(),
            sessions: HashMap::new(),
            next_token: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn remove_key(&mut self, key: FlowKey) {
        if let Some(token) = self.by_key.remove(&key) {
            self.sessions.remove(&token);
        }
    }

    fn remove_token(&mut self, token: Token) {
        if let Some(session) = self.sessions.remove(&token) {
            self.by_key
                .retain(|_, t| *t != token);
            debug!(
                "udp :{} <-> {}: removed",
                session.local.port(),
                session.remote
            );
        }
    }

    /// Closes every session idle longer than the threshold; returns how
    /// many were evicted. Activity is outbound-only: the timestamp is
    /// refreshed on the send path, so this measures device silence.
    fn evict_idle(&mut self, idle: Duration) -> usize {
        let stale: Vec<Token> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.last_activity.elapsed() > idle)
            .map(|(t, _)| *t)
            .collect();
        for token in &stale {
            self.remove_token(*token);
        }
        stale.len()
    }
}

impl Default for UdpTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains device-originated datagrams and writes them to real sockets,
/// creating sessions on first contact
pub struct UdpSendWorker {
    rx: Receiver<Packet>,
    table: Arc<Mutex<UdpTable>>,
    registry: Registry,
    protect: Arc<dyn SocketProtect>,
    stop: Arc<AtomicBool>,
}

impl UdpSendWorker {
    pub fn new(
        rx: Receiver<Packet>,
        table: Arc<Mutex<UdpTable>>,
        registry: Registry,
        protect: Arc<dyn SocketProtect>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rx,
            table,
            registry,
            protect,
            stop,
        }
    }

    pub fn run(self) {
        info!("udp send worker started");
        while !self.stop.load(Ordering::Relaxed) {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(packet) => self.handle(&packet),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("udp send worker stopped");
    }

    fn handle(&self, packet: &Packet) {
        let (Some(local), Some(key)) = (packet.source_endpoint(), FlowKey::from_outbound(packet))
        else {
            return;
        };

        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if !table.by_key.contains_key(&key) {
            match self.open_session(&mut table, key, local) {
                Ok(()) => debug!("udp {}: new session", key),
                Err(e) => {
                    warn!("udp {}: connect failed: {:#}", key, e);
                    return;
                }
            }
        }

        let token = table.by_key[&key];
        let session = match table.sessions.get_mut(&token) {
            Some(s) => s,
            None => return,
        };
        session.last_activity = Instant::now();
        match session.socket.send(packet.payload()) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("udp {}: send would block, datagram dropped", key);
            }
            Err(e) => {
                warn!("udp {}: send failed: {}", key, e);
                table.remove_key(key);
            }
        }
    }

    /// Opens, protects and connects the real socket, then registers it
    /// with the receive worker's poll. Failure drops the datagram and
    /// leaves no entry behind.
    fn open_session(
        &self,
        table: &mut UdpTable,
        key: FlowKey,
        local: SocketAddrV4,
    ) -> anyhow::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("socket creation")?;
        socket.set_nonblocking(true)?;
        self.protect.protect(&socket).context("socket protect")?;
        socket.connect(&key.remote().into()).context("connect")?;

        let mut socket = UdpSocket::from_std(socket.into());
        let token = table.alloc_token();
        self.registry
            .register(&mut socket, token, Interest::READABLE)
            .context("poll registration")?;

        table.by_key.insert(key, token);
        table.sessions.insert(
            token,
            UdpSession {
                socket,
                local,
                remote: key.remote(),
                last_activity: Instant::now(),
            },
        );
        Ok(())
    }
}

/// Owns the poll; wraps inbound replies in synthesized IPv4+UDP headers
/// and queues them for the device
pub struct UdpRecvWorker {
    poll: Poll,
    events: Events,
    table: Arc<Mutex<UdpTable>>,
    tx: Sender<Vec<u8>>,
    stop: Arc<AtomicBool>,
    ip_id: u16,
}

impl UdpRecvWorker {
    pub fn new(
        poll: Poll,
        table: Arc<Mutex<UdpTable>>,
        tx: Sender<Vec<u8>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            table,
            tx,
            stop,
            ip_id: 1,
        }
    }

    pub fn run(mut self) {
        info!("udp receive worker started");
        while !self.stop.load(Ordering::Relaxed) {
            if let Err(e) = self.turn(Some(Duration::from_millis(100))) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!("udp receive worker: poll failed: {}", e);
                    break;
                }
            }
        }
        info!("udp receive worker stopped");
    }

    /// One poll round. Frames are collected under the table lock and
    /// queued (blocking) only after it is released.
    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        let ready: Vec<Token> = self
            .events
            .iter()
            .map(|ev| ev.token())
            .filter(|t| *t != WAKER_TOKEN)
            .collect();
        if ready.is_empty() {
            return Ok(());
        }

        let mut frames = Vec::new();
        {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            for token in ready {
                Self::drain_session(&mut self.ip_id, &mut table, token, &mut frames);
            }
        }
        for frame in frames {
            if self.tx.send(frame).is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Associated function so the session table's lock guard and the ip
    /// id counter can be borrowed side by side
    fn drain_session(
        ip_id: &mut u16,
        table: &mut UdpTable,
        token: Token,
        frames: &mut Vec<Vec<u8>>,
    ) {
        let Some(session) = table.sessions.get_mut(&token) else {
            // Evicted between readiness and now
            return;
        };
        let mut buf = [0u8; DATAGRAM_MAX];
        loop {
            match session.socket.recv(&mut buf) {
                Ok(n) => {
                    frames.push(build_udp(session.remote, session.local, *ip_id, &buf[..n]));
                    *ip_id = ip_id.wrapping_add(1);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(
                        "udp :{} <-> {}: receive failed: {}",
                        session.local.port(),
                        session.remote,
                        e
                    );
                    table.remove_token(token);
                    break;
                }
            }
        }
    }
}

/// Periodically sweeps the table for idle sessions
pub struct UdpReaper {
    table: Arc<Mutex<UdpTable>>,
    stop: Arc<AtomicBool>,
    sweep_interval: Duration,
    idle_timeout: Duration,
}

impl UdpReaper {
    pub fn new(
        table: Arc<Mutex<UdpTable>>,
        stop: Arc<AtomicBool>,
        sweep_interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            table,
            stop,
            sweep_interval,
            idle_timeout,
        }
    }

    pub fn run(self) {
        info!("udp reaper started");
        let mut last_sweep = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(100));
            if last_sweep.elapsed() < self.sweep_interval {
                continue;
            }
            last_sweep = Instant::now();

            let evicted = {
                let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
                table.evict_idle(self.idle_timeout)
            };
            if evicted > 0 {
                debug!("udp reaper: evicted {} idle sessions", evicted);
            }
        }
        info!("udp reaper stopped");
    }
}
