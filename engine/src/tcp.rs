//! TCP flow translation
//!
//! One real outbound socket per tunnel TCP flow. The translator owns a
//! single loop: it drains device-originated segments from its inbound
//! queue, drives the per-flow state machine, and multiplexes every real
//! socket through one `mio::Poll`. Replies to the device are synthesized
//! segments queued on the shared outbound channel.
//!
//! The loop never blocks. Both the queue and the poll are checked
//! non-blockingly and the thread yields briefly when neither had work, so
//! no flow can stall another and shutdown is observed promptly.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use log::*;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, Socket, Type};
use strum::Display;

use tunnat_packet::tcp::flags;
use tunnat_packet::{Packet, TcpHeader, build_tcp, seq_after};

use crate::flow::FlowKey;
use crate::platform::SocketProtect;

const EVENT_CAPACITY: usize = 256;
const READ_CHUNK: usize = 16384;

/// State of one translated flow, device-relative
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TcpState {
    /// Pipe created, handshake reply not yet sent
    SynSent,
    /// SYN+ACK sent, waiting for the device's ACK
    SynReceived,
    Established,
    /// Device sent FIN; its send side is done
    CloseWait,
    /// Our FIN is out as well, waiting for the device's final ACK
    LastAck,
    Closed,
}

/// Result of one non-blocking socket operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketOutcome {
    Complete,
    /// The socket would block; write interest stays armed
    Blocked,
}

fn connect_pending(e: &io::Error) -> bool {
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    e.kind() == io::ErrorKind::WouldBlock
}

/// Per-flow translation state: the real socket plus both sides' sequence
/// bookkeeping. "My" counters are the translator speaking as the remote
/// peer towards the device; "their" counters mirror the device.
struct TcpPipe {
    key: FlowKey,
    token: Token,
    local: SocketAddrV4,
    remote: SocketAddrV4,
    socket: TcpStream,
    state: TcpState,
    my_seq: u32,
    my_ack: u32,
    their_seq: u32,
    their_ack: u32,
    /// Device payload awaiting the real socket
    pending: Vec<u8>,
    connected: bool,
    /// Device -> network direction still open
    up_active: bool,
    /// Network -> device direction still open
    down_active: bool,
    /// Write half-close requested before the connect finished
    up_shutdown: bool,
    syn_count: u32,
    ip_id: u16,
}

impl TcpPipe {
    fn new(key: FlowKey, token: Token, local: SocketAddrV4, socket: TcpStream) -> Self {
        Self {
            key,
            token,
            local,
            remote: key.remote(),
            socket,
            state: TcpState::SynSent,
            my_seq: 0,
            my_ack: 0,
            their_seq: 0,
            their_ack: 0,
            pending: Vec::new(),
            connected: false,
            up_active: true,
            down_active: true,
            up_shutdown: false,
            syn_count: 0,
            ip_id: 1,
        }
    }

    /// Both half-closes have completed; the pipe can be dropped
    fn finished(&self) -> bool {
        !self.up_active && !self.down_active
    }

    /// Queues a synthesized segment for the device and advances my_seq by
    /// the sequence space the segment consumes (one for SYN, one for FIN,
    /// one per payload byte).
    fn emit(&mut self, tx: &Sender<Vec<u8>>, flag_bits: u8, payload: &[u8]) {
        let frame = build_tcp(
            self.remote,
            self.local,
            flag_bits,
            self.my_seq,
            self.my_ack,
            self.ip_id,
            payload,
        );
        self.ip_id = self.ip_id.wrapping_add(1);

        let mut advance = payload.len() as u32;
        if flag_bits & flags::SYN != 0 {
            advance = advance.wrapping_add(1);
        }
        if flag_bits & flags::FIN != 0 {
            advance = advance.wrapping_add(1);
        }
        self.my_seq = self.my_seq.wrapping_add(advance);

        if tx.send(frame).is_err() {
            debug!("tcp {}: outbound queue closed", self.key);
        }
    }

    fn handle_syn(&mut self, tcp: &TcpHeader, tx: &Sender<Vec<u8>>) {
        if self.syn_count == 0 {
            self.my_seq = 1;
            self.their_seq = tcp.sequence;
            self.my_ack = tcp.sequence.wrapping_add(1);
            self.emit(tx, flags::SYN | flags::ACK, &[]);
            self.state = TcpState::SynReceived;
            debug!("tcp {}: {} ({})", self.key, self.state, flags::describe(tcp.flags));
        } else {
            // Retransmitted SYN; keep the acknowledgment fresh, no reply
            self.my_ack = tcp.sequence.wrapping_add(1);
        }
        self.syn_count += 1;
    }

    fn handle_fin(&mut self, tcp: &TcpHeader, tx: &Sender<Vec<u8>>) {
        self.their_seq = tcp.sequence;
        self.my_ack = tcp.sequence.wrapping_add(1);
        self.emit(tx, flags::ACK, &[]);
        self.up_active = false;
        self.state = TcpState::CloseWait;

        // The real socket's write half closes once buffered payload has
        // drained; until then only mark the intent.
        self.up_shutdown = true;
        if self.connected && self.pending.is_empty() {
            if let Err(e) = self.socket.shutdown(Shutdown::Write) {
                debug!("tcp {}: shutdown: {}", self.key, e);
            }
        }
        debug!("tcp {}: device closed its send side", self.key);
    }

    fn handle_rst(&mut self) {
        debug!("tcp {}: reset by device", self.key);
        self.up_active = false;
        self.down_active = false;
        self.state = TcpState::Closed;
    }

    fn handle_ack(&mut self, packet: &Packet, tcp: &TcpHeader, tx: &Sender<Vec<u8>>) {
        if self.state == TcpState::SynReceived {
            self.state = TcpState::Established;
            debug!("tcp {}: established", self.key);
        }
        if self.state == TcpState::LastAck {
            // Final ACK for our FIN
            self.down_active = false;
            self.state = TcpState::Closed;
            return;
        }
        self.their_ack = tcp.acknowledgement;

        let payload = packet.payload();
        if payload.is_empty() || !self.up_active {
            return;
        }

        // Only strictly newer data is forwarded; replayed segments are
        // dropped so the at-least-once delivery from the device stays
        // idempotent against the real socket.
        let new_ack = tcp.sequence.wrapping_add(payload.len() as u32);
        if !seq_after(new_ack, self.my_ack) {
            debug!(
                "tcp {}: stale segment (seq {}, {} bytes)",
                self.key,
                tcp.sequence,
                payload.len()
            );
            return;
        }

        self.pending.extend_from_slice(payload);
        self.their_seq = tcp.sequence;
        self.my_ack = new_ack;
        self.emit(tx, flags::ACK, &[]);
    }

    /// Writes buffered device payload to the real socket
    fn flush(&mut self) -> io::Result<SocketOutcome> {
        while !self.pending.is_empty() {
            match self.socket.write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(SocketOutcome::Blocked);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.up_shutdown {
            let _ = self.socket.shutdown(Shutdown::Write);
        }
        Ok(SocketOutcome::Complete)
    }

    fn on_writable(&mut self) -> io::Result<()> {
        if !self.connected {
            if let Some(e) = self.socket.take_error()? {
                return Err(e);
            }
            match self.socket.peer_addr() {
                Ok(_) => {
                    self.connected = true;
                    debug!("tcp {}: connected", self.key);
                }
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.flush().map(|_| ())
    }

    /// Drains the real socket, synthesizing ACK segments towards the
    /// device. EOF closes the network -> device direction with a FIN.
    fn on_readable(&mut self, tx: &Sender<Vec<u8>>) -> io::Result<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut buf) {
                Ok(0) => {
                    if self.down_active {
                        self.emit(tx, flags::FIN | flags::ACK, &[]);
                        self.down_active = false;
                        if self.state == TcpState::CloseWait {
                            self.state = TcpState::LastAck;
                        }
                        debug!("tcp {}: remote closed", self.key);
                    }
                    return Ok(());
                }
                Ok(n) => {
                    // Once the device has closed its side the flow is
                    // winding down; late remote data is discarded
                    let delivering = !matches!(
                        self.state,
                        TcpState::CloseWait | TcpState::LastAck | TcpState::Closed
                    );
                    if self.down_active && delivering {
                        self.emit(tx, flags::ACK, &buf[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-arms poll interest: always readable, writable while the connect
    /// or a buffered flush is outstanding
    fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let mut interest = Interest::READABLE;
        if !self.connected || !self.pending.is_empty() {
            interest = interest.add(Interest::WRITABLE);
        }
        registry.reregister(&mut self.socket, self.token, interest)
    }

    /// Error teardown: the device sees a RST, the flow is gone
    fn reset(&mut self, tx: &Sender<Vec<u8>>) {
        self.emit(tx, flags::RST, &[]);
        self.up_active = false;
        self.down_active = false;
        self.state = TcpState::Closed;
    }
}

/// The single-threaded TCP translation loop
pub struct TcpTranslator {
    rx: Receiver<Packet>,
    tx: Sender<Vec<u8>>,
    protect: Arc<dyn SocketProtect>,
    stop: Arc<AtomicBool>,
    poll: Poll,
    events: Events,
    pipes: HashMap<FlowKey, TcpPipe>,
    tokens: HashMap<Token, FlowKey>,
    next_token: usize,
}

impl TcpTranslator {
    pub fn new(
        rx: Receiver<Packet>,
        tx: Sender<Vec<u8>>,
        protect: Arc<dyn SocketProtect>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        Ok(Self {
            rx,
            tx,
            protect,
            stop,
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            pipes: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 0,
        })
    }

    pub fn run(mut self) {
        info!("tcp translator started");
        while !self.stop.load(Ordering::Relaxed) {
            if !self.turn() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        info!("tcp translator stopped ({} live flows)", self.pipes.len());
    }

    /// One non-blocking iteration; returns whether any work was done
    fn turn(&mut self) -> bool {
        let mut work = false;

        while let Ok(packet) = self.rx.try_recv() {
            work = true;
            self.handle_packet(&packet);
        }

        if let Err(e) = self.poll.poll(&mut self.events, Some(Duration::ZERO)) {
            if e.kind() != io::ErrorKind::Interrupted {
                error!("tcp translator: poll failed: {}", e);
            }
            return work;
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                (
                    ev.token(),
                    ev.is_readable() || ev.is_read_closed(),
                    ev.is_writable(),
                )
            })
            .collect();
        for (token, readable, writable) in ready {
            work = true;
            self.socket_event(token, readable, writable);
        }

        work
    }

    /// A device-originated segment; creates the pipe on first contact
    fn handle_packet(&mut self, packet: &Packet) {
        let Some(tcp) = packet.tcp() else { return };
        let (Some(local), Some(key)) = (packet.source_endpoint(), FlowKey::from_outbound(packet))
        else {
            return;
        };

        if !self.pipes.contains_key(&key) {
            if let Err(e) = self.create_pipe(key, local) {
                warn!("tcp {}: connect failed: {:#}", key, e);
                return;
            }
        }
        let Some(pipe) = self.pipes.get_mut(&key) else {
            return;
        };

        if tcp.is_rst() {
            pipe.handle_rst();
        } else if tcp.is_syn() {
            pipe.handle_syn(tcp, &self.tx);
        } else if tcp.is_fin() {
            pipe.handle_fin(tcp, &self.tx);
        } else if tcp.is_ack() {
            pipe.handle_ack(packet, tcp, &self.tx);
        }

        if pipe.finished() {
            self.remove(key);
            return;
        }
        if let Err(e) = pipe.update_interest(self.poll.registry()) {
            warn!("tcp {}: reregister failed: {}", key, e);
            self.teardown(key);
        }
    }

    /// Opens, protects and connects the real socket for a new flow.
    /// Failure here drops the segment; no table entry is left behind.
    fn create_pipe(&mut self, key: FlowKey, local: SocketAddrV4) -> anyhow::Result<()> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .context("socket creation")?;
        socket.set_nonblocking(true)?;
        self.protect.protect(&socket).context("socket protect")?;
        match socket.connect(&key.remote().into()) {
            Ok(()) => {}
            Err(e) if connect_pending(&e) => {}
            Err(e) => return Err(e).context("connect"),
        }

        let mut stream = TcpStream::from_std(socket.into());
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .context("poll registration")?;

        debug!("tcp {}: new pipe", key);
        self.tokens.insert(token, key);
        self.pipes.insert(key, TcpPipe::new(key, token, local, stream));
        Ok(())
    }

    fn socket_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(&key) = self.tokens.get(&token) else {
            return;
        };
        let Some(pipe) = self.pipes.get_mut(&key) else {
            return;
        };

        let mut result = Ok(());
        if writable {
            result = pipe.on_writable();
        }
        if result.is_ok() && readable {
            result = pipe.on_readable(&self.tx);
        }
        if result.is_ok() {
            result = pipe.update_interest(self.poll.registry());
        }

        match result {
            Ok(()) => {
                if pipe.finished() {
                    self.remove(key);
                }
            }
            Err(e) => {
                warn!("tcp {}: socket error: {}", key, e);
                self.teardown(key);
            }
        }
    }

    /// Eager teardown on I/O failure, surfaced to the device as RST
    fn teardown(&mut self, key: FlowKey) {
        if let Some(pipe) = self.pipes.get_mut(&key) {
            pipe.reset(&self.tx);
        }
        self.remove(key);
    }

    /// Drops the pipe; closing the socket deregisters it from the poll
    fn remove(&mut self, key: FlowKey) {
        if let Some(pipe) = self.pipes.remove(&key) {
            self.tokens.remove(&pipe.token);
            debug!("tcp {}: removed ({})", key, pipe.state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoProtect;
    use std::net::{Ipv4Addr, SocketAddr, TcpListener};
    use std::time::Instant;

    const DEVICE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 8);

    fn translator() -> (TcpTranslator, Sender<Packet>, Receiver<Vec<u8>>) {
        let (in_tx, in_rx) = crossbeam_channel::bounded(64);
        let (out_tx, out_rx) = crossbeam_channel::bounded(64);
        let translator = TcpTranslator::new(
            in_rx,
            out_tx,
            Arc::new(NoProtect),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();
        (translator, in_tx, out_rx)
    }

    fn segment(local: SocketAddrV4, remote: SocketAddrV4, flag_bits: u8, seq: u32, payload: &[u8]) -> Packet {
        Packet::decode(build_tcp(local, remote, flag_bits, seq, 0, 1, payload)).unwrap()
    }

    fn loopback_v4(listener: &TcpListener) -> SocketAddrV4 {
        match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => panic!("expected v4 listener"),
        }
    }

    /// Runs translator iterations until the predicate holds
    fn pump_until(t: &mut TcpTranslator, mut done: impl FnMut(&TcpTranslator) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !done(t) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            t.turn();
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn syn_creates_pipe_and_replies_syn_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41000);
        let (mut t, _in_tx, out_rx) = translator();

        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));

        let key = FlowKey::new(remote, 41000);
        let pipe = t.pipes.get(&key).expect("pipe created");
        assert_eq!(pipe.state, TcpState::SynReceived);
        assert_eq!(pipe.my_ack, 101);

        let reply = Packet::decode(out_rx.try_recv().unwrap()).unwrap();
        let tcp = reply.tcp().unwrap();
        assert!(tcp.is_syn() && tcp.is_ack());
        assert_eq!(tcp.sequence, 1);
        assert_eq!(tcp.acknowledgement, 101);
        assert_eq!(reply.ipv4.source, *remote.ip());
        assert_eq!(reply.ipv4.destination, DEVICE_IP);
    }

    #[test]
    fn duplicate_syn_updates_ack_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41001);
        let (mut t, _in_tx, out_rx) = translator();

        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));
        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));

        let key = FlowKey::new(remote, 41001);
        let pipe = t.pipes.get(&key).unwrap();
        assert_eq!(pipe.syn_count, 2);
        assert_eq!(pipe.my_ack, 101);
        assert_eq!(out_rx.len(), 1);
    }

    #[test]
    fn payload_forwarded_once_and_stale_segments_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41002);
        let (mut t, _in_tx, out_rx) = translator();
        let key = FlowKey::new(remote, 41002);

        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));
        let _syn_ack = out_rx.try_recv().unwrap();
        t.handle_packet(&segment(local, remote, flags::ACK, 101, &[]));
        assert_eq!(t.pipes.get(&key).unwrap().state, TcpState::Established);

        let (mut server, _) = listener.accept().unwrap();
        server
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        let payload = [0x41u8; 50];
        t.handle_packet(&segment(local, remote, flags::ACK | flags::PSH, 101, &payload));
        assert_eq!(t.pipes.get(&key).unwrap().my_ack, 151);

        // Bare ACK back to the device
        let ack = Packet::decode(out_rx.try_recv().unwrap()).unwrap();
        assert!(ack.tcp().unwrap().is_ack());
        assert_eq!(ack.tcp().unwrap().acknowledgement, 151);
        assert!(ack.payload().is_empty());

        pump_until(&mut t, |t| t.pipes.get(&key).unwrap().pending.is_empty());
        let mut got = [0u8; 64];
        let n = server.read(&mut got).unwrap();
        assert_eq!(&got[..n], &payload[..]);

        // Replaying the same segment advances nothing and writes nothing
        t.handle_packet(&segment(local, remote, flags::ACK | flags::PSH, 101, &payload));
        assert_eq!(t.pipes.get(&key).unwrap().my_ack, 151);
        assert!(t.pipes.get(&key).unwrap().pending.is_empty());
        assert!(server.read(&mut got).is_err());
    }

    #[test]
    fn remote_eof_sends_fin_and_device_fin_removes_pipe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41003);
        let (mut t, _in_tx, out_rx) = translator();
        let key = FlowKey::new(remote, 41003);

        t.handle_packet(&segment(local, remote, flags::SYN, 200, &[]));
        t.handle_packet(&segment(local, remote, flags::ACK, 201, &[]));
        let (server, _) = listener.accept().unwrap();
        pump_until(&mut t, |t| t.pipes.get(&key).unwrap().connected);
        drop(server);

        pump_until(&mut t, |t| !t.pipes.get(&key).unwrap().down_active);
        let fin = loop {
            let frame = Packet::decode(out_rx.try_recv().unwrap()).unwrap();
            if frame.tcp().unwrap().is_fin() {
                break frame;
            }
        };
        assert!(fin.tcp().unwrap().is_ack());

        t.handle_packet(&segment(local, remote, flags::FIN | flags::ACK, 201, &[]));
        assert!(!t.pipes.contains_key(&key));
    }

    #[test]
    fn rst_tears_down_immediately() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41004);
        let (mut t, _in_tx, _out_rx) = translator();
        let key = FlowKey::new(remote, 41004);

        t.handle_packet(&segment(local, remote, flags::SYN, 300, &[]));
        assert!(t.pipes.contains_key(&key));
        t.handle_packet(&segment(local, remote, flags::RST, 301, &[]));
        assert!(!t.pipes.contains_key(&key));
    }

    #[test]
    fn flows_are_isolated() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let (mut t, _in_tx, _out_rx) = translator();

        let a = SocketAddrV4::new(DEVICE_IP, 41005);
        let b = SocketAddrV4::new(DEVICE_IP, 41006);
        t.handle_packet(&segment(a, remote, flags::SYN, 100, &[]));
        t.handle_packet(&segment(b, remote, flags::SYN, 500, &[]));

        let pa = t.pipes.get(&FlowKey::new(remote, 41005)).unwrap();
        let pb = t.pipes.get(&FlowKey::new(remote, 41006)).unwrap();
        assert_eq!(pa.my_ack, 101);
        assert_eq!(pb.my_ack, 501);
        assert_ne!(pa.token, pb.token);

        t.handle_packet(&segment(a, remote, flags::ACK, 101, &[]));
        assert_eq!(
            t.pipes.get(&FlowKey::new(remote, 41005)).unwrap().state,
            TcpState::Established
        );
        assert_eq!(
            t.pipes.get(&FlowKey::new(remote, 41006)).unwrap().state,
            TcpState::SynReceived
        );
    }

    #[test]
    fn refused_connect_resets_flow() {
        // Bind then drop to get a port with no listener
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            loopback_v4(&l).port()
        };
        let remote = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let local = SocketAddrV4::new(DEVICE_IP, 41007);
        let (mut t, _in_tx, out_rx) = translator();
        let key = FlowKey::new(remote, 41007);

        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));
        pump_until(&mut t, |t| !t.pipes.contains_key(&key));

        let mut saw_rst = false;
        while let Ok(frame) = out_rx.try_recv() {
            if Packet::decode(frame).unwrap().tcp().unwrap().is_rst() {
                saw_rst = true;
            }
        }
        assert!(saw_rst);
    }

    #[test]
    fn sequence_advances_per_event() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let remote = loopback_v4(&listener);
        let local = SocketAddrV4::new(DEVICE_IP, 41008);
        let (mut t, _in_tx, out_rx) = translator();
        let key = FlowKey::new(remote, 41008);

        t.handle_packet(&segment(local, remote, flags::SYN, 100, &[]));
        assert_eq!(t.pipes.get(&key).unwrap().my_seq, 2); // SYN consumed one
        t.handle_packet(&segment(local, remote, flags::ACK, 101, &[]));
        let (mut server, _) = listener.accept().unwrap();
        pump_until(&mut t, |t| t.pipes.get(&key).unwrap().connected);

        server.write_all(b"hello").unwrap();
        pump_until(&mut t, |t| t.pipes.get(&key).unwrap().my_seq == 7);

        // The data segment towards the device carries sequence 2
        let data = loop {
            let frame = Packet::decode(out_rx.try_recv().unwrap()).unwrap();
            if !frame.payload().is_empty() {
                break frame;
            }
        };
        assert_eq!(data.tcp().unwrap().sequence, 2);
        assert_eq!(data.payload(), b"hello");
    }
}
