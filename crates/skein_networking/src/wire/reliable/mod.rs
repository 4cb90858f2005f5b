//! # Reliable Wire Peer
//!
//! Reliable ordered delivery over a single UDP socket.
//!
//! ## Design
//!
//! ```text
//!  poll thread                 I/O thread (one per peer)
//! ┌──────────────┐  command   ┌──────────────────────────────────┐
//! │ send()       │──────────> │ Driver                           │
//! │ disconnect() │            │  socket (1 ms read timeout)      │
//! │ poll()       │ <───────── │  links: id -> ReliableLink       │
//! └──────────────┘   event    │  resends, pings, idle checks     │
//!                             └──────────────────────────────────┘
//! ```
//!
//! - Every `Data` datagram is acked individually and resent until acked
//! - The receiver releases frames strictly in sequence
//! - One frame per datagram, no fragmentation: frames larger than
//!   [`MAX_PAYLOAD_SIZE`] are refused by `send`
//!
//! A client repeats `Connect` every 250 ms until the server answers with
//! `ConnectAck`, refuses with `Disconnect`, or the connect timeout passes.

pub mod datagram;
pub mod link;

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use skein_core::{BufferPool, Packet, SharedPacket};
use tracing::{debug, info, trace, warn};

use self::datagram::{Kind, MAX_DATAGRAM_SIZE};
use self::link::ReliableLink;
use super::{discard_events, drain_events, resolve, IdAllocator, StartMode, WireEvent, WirePeer};
use crate::config::{NetSettings, Protocol};
use crate::connection::ConnectionId;
use crate::error::{NetError, NetResult};

pub use self::datagram::MAX_PAYLOAD_SIZE;

const READ_TIMEOUT: Duration = Duration::from_millis(1);
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(250);
const MAX_DATAGRAMS_PER_PASS: usize = 256;

#[derive(Clone, Copy, Debug)]
struct LinkConfig {
    ping_interval: Duration,
    idle_timeout: Duration,
    connect_timeout: Duration,
}

enum Command {
    Send(ConnectionId, SharedPacket),
    Disconnect(ConnectionId),
}

/// State shared between the peer handle and its driver.
#[derive(Default)]
struct Shared {
    running: AtomicBool,
    /// Live links and their round-trip times.
    links: RwLock<HashMap<ConnectionId, u32>>,
}

/// Reliable UDP backend.
pub struct ReliablePeer {
    pool: Arc<BufferPool>,
    shared: Arc<Shared>,
    events_tx: Sender<WireEvent>,
    events: Receiver<WireEvent>,
    commands: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    config: LinkConfig,
}

impl ReliablePeer {
    /// Creates an idle peer.
    #[must_use]
    pub fn new(settings: &NetSettings, pool: Arc<BufferPool>) -> Self {
        let (events_tx, events) = unbounded();
        Self {
            pool,
            shared: Arc::new(Shared::default()),
            events_tx,
            events,
            commands: None,
            thread: None,
            local_addr: None,
            config: LinkConfig {
                ping_interval: settings.ping_interval(),
                idle_timeout: settings.idle_timeout(),
                connect_timeout: settings.connect_timeout(),
            },
        }
    }

    fn spawn_driver(&mut self, socket: UdpSocket, role: Role) -> NetResult<()> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        self.local_addr = Some(socket.local_addr()?);

        let (commands_tx, commands_rx) = unbounded();
        self.shared.links.write().clear();
        self.shared.running.store(true, Ordering::Release);

        let driver = Driver {
            socket,
            role,
            links: HashMap::new(),
            by_addr: HashMap::new(),
            ids: IdAllocator::new(),
            commands: commands_rx,
            events: self.events_tx.clone(),
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
            config: self.config,
            scratch: vec![0; MAX_DATAGRAM_SIZE * 2],
        };

        let spawned = std::thread::Builder::new()
            .name("skein-reliable".into())
            .spawn(move || driver.run());
        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.commands = Some(commands_tx);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(err.into())
            }
        }
    }
}

impl WirePeer for ReliablePeer {
    fn protocol(&self) -> Protocol {
        Protocol::Reliable
    }

    fn start(&mut self, mode: StartMode) -> NetResult<()> {
        if self.is_running() {
            return Err(NetError::InvalidState("reliable peer already running".into()));
        }

        match mode {
            StartMode::Listen {
                address,
                port,
                max_clients,
            } => {
                let socket = UdpSocket::bind(resolve(&address, port)?)?;
                self.spawn_driver(socket, Role::Server { max_clients })?;
                info!(address = ?self.local_addr, max_clients, "Reliable peer listening");
            }
            StartMode::Connect { address, port } => {
                let server = resolve(&address, port)?;
                let any = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(any)?;
                let now = Instant::now();
                self.spawn_driver(
                    socket,
                    Role::Client {
                        server,
                        started: now,
                        last_attempt: None,
                        phase: ClientPhase::Connecting,
                    },
                )?;
                info!(%server, "Reliable peer connecting");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.commands = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Reliable driver panicked");
            }
            info!("Reliable peer stopped");
        }
        discard_events(&self.events, &self.pool);
        self.local_addr = None;
    }

    fn poll(&mut self, events: &mut Vec<WireEvent>) {
        drain_events(&self.events, events);
    }

    fn send(&mut self, id: ConnectionId, packet: SharedPacket) -> bool {
        if packet.len() > MAX_PAYLOAD_SIZE {
            warn!(%id, len = packet.len(), max = MAX_PAYLOAD_SIZE, "Frame too large for one datagram, not sent");
            Packet::recycle(packet, &self.pool);
            return false;
        }
        let Some(commands) = self.commands.as_ref().filter(|_| self.shared.links.read().contains_key(&id))
        else {
            Packet::recycle(packet, &self.pool);
            return false;
        };
        match commands.send(Command::Send(id, packet)) {
            Ok(()) => true,
            Err(err) => {
                if let Command::Send(_, packet) = err.into_inner() {
                    Packet::recycle(packet, &self.pool);
                }
                false
            }
        }
    }

    fn disconnect(&mut self, id: ConnectionId) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Disconnect(id));
        }
    }

    fn round_trip_time(&self, id: ConnectionId) -> u32 {
        self.shared.links.read().get(&id).copied().unwrap_or(0)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl Drop for ReliablePeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ClientPhase {
    Connecting,
    Connected,
    /// Refused, timed out or disconnected; the driver idles until shutdown.
    Done,
}

enum Role {
    Server {
        max_clients: usize,
    },
    Client {
        server: SocketAddr,
        started: Instant,
        last_attempt: Option<Instant>,
        phase: ClientPhase,
    },
}

struct Driver {
    socket: UdpSocket,
    role: Role,
    links: HashMap<ConnectionId, ReliableLink>,
    by_addr: HashMap<SocketAddr, ConnectionId>,
    ids: IdAllocator,
    commands: Receiver<Command>,
    events: Sender<WireEvent>,
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    config: LinkConfig,
    scratch: Vec<u8>,
}

fn transmit(socket: &UdpSocket, to: SocketAddr, datagram: &[u8]) {
    if let Err(err) = socket.send_to(datagram, to) {
        debug!(%to, error = %err, "Datagram send failed");
    }
}

impl Driver {
    fn run(mut self) {
        debug!("Reliable driver started");
        while self.shared.running.load(Ordering::Acquire) {
            let now = Instant::now();
            self.handshake(now);
            self.drain_commands(now);
            self.receive();
            self.maintain(Instant::now());
        }
        self.stop();
        debug!("Reliable driver exited");
    }

    fn handshake(&mut self, now: Instant) {
        let Role::Client {
            server,
            started,
            last_attempt,
            phase,
        } = &mut self.role
        else {
            return;
        };
        if *phase != ClientPhase::Connecting {
            return;
        }
        if now.saturating_duration_since(*started) >= self.config.connect_timeout {
            warn!(%server, "Connect timed out");
            *phase = ClientPhase::Done;
            let _ = self.events.send(WireEvent::Disconnected {
                id: ConnectionId::SERVER,
            });
            return;
        }
        if last_attempt.map_or(true, |at| now.saturating_duration_since(at) >= CONNECT_RETRY_INTERVAL) {
            *last_attempt = Some(now);
            transmit(&self.socket, *server, &datagram::control(Kind::Connect, 0, &[]));
        }
    }

    fn drain_commands(&mut self, now: Instant) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Send(id, packet) => {
                    if let Some(link) = self.links.get_mut(&id) {
                        let (socket, address) = (&self.socket, link.address());
                        link.send_data(&self.pool, packet.as_slice(), now, &mut |bytes| {
                            transmit(socket, address, bytes);
                        });
                    }
                    Packet::recycle(packet, &self.pool);
                }
                Command::Disconnect(id) => self.drop_link(id, true, "closed locally"),
            }
        }
    }

    fn receive(&mut self) {
        for _ in 0..MAX_DATAGRAMS_PER_PASS {
            let (len, from) = match self.socket.recv_from(&mut self.scratch) {
                Ok(received) => received,
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return;
                }
                // Windows reports ICMP port unreachable on the next read.
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    warn!(error = %err, "Socket read failed");
                    return;
                }
            };
            if len > MAX_DATAGRAM_SIZE {
                debug!(%from, len, "Oversized datagram dropped");
                continue;
            }
            let datagram = std::mem::take(&mut self.scratch);
            self.handle(from, &datagram[..len]);
            self.scratch = datagram;
        }
    }

    fn handle(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some((kind, seq, body)) = datagram::parse(datagram) else {
            debug!(%from, len = datagram.len(), "Malformed datagram dropped");
            return;
        };
        trace!(%from, ?kind, seq, "Datagram received");
        let now = Instant::now();

        let Some(id) = self.by_addr.get(&from).copied() else {
            self.handle_unknown(from, kind, now);
            return;
        };

        match kind {
            Kind::Disconnect => {
                self.drop_link(id, false, "closed by remote");
                return;
            }
            Kind::Connect => {
                transmit(&self.socket, from, &datagram::control(Kind::ConnectAck, 0, &[]));
            }
            Kind::ConnectAck => {}
            Kind::Data => {
                if let Some(link) = self.links.get_mut(&id) {
                    let (socket, events, pool) = (&self.socket, &self.events, &self.pool);
                    link.on_data(
                        pool,
                        seq,
                        body,
                        &mut |bytes| transmit(socket, from, bytes),
                        &mut |packet| {
                            if let Err(err) = events.send(WireEvent::Data { id, packet }) {
                                if let WireEvent::Data { packet, .. } = err.into_inner() {
                                    packet.release(pool);
                                }
                            }
                        },
                    );
                }
            }
            Kind::Ack => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.on_ack(&self.pool, seq, now);
                }
            }
            Kind::Ping => {
                transmit(&self.socket, from, &datagram::control(Kind::Pong, seq, body));
            }
            Kind::Pong => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.on_pong(body);
                    self.shared.links.write().insert(id, link.round_trip_time());
                }
            }
        }

        if let Some(link) = self.links.get_mut(&id) {
            link.heard(now);
        }
    }

    fn handle_unknown(&mut self, from: SocketAddr, kind: Kind, now: Instant) {
        match &mut self.role {
            Role::Server { max_clients } => {
                if kind != Kind::Connect {
                    trace!(%from, ?kind, "Datagram from unknown address ignored");
                    return;
                }
                let max_clients = *max_clients;
                if self.links.len() >= max_clients {
                    warn!(%from, max_clients, "Refusing connection, server full");
                    transmit(&self.socket, from, &datagram::control(Kind::Disconnect, 0, &[]));
                    return;
                }
                let id = self.ids.allocate();
                transmit(&self.socket, from, &datagram::control(Kind::ConnectAck, 0, &[]));
                self.open_link(id, from, now);
            }
            Role::Client { server, phase, .. } => {
                if *server != from || *phase != ClientPhase::Connecting {
                    trace!(%from, ?kind, "Datagram from unknown address ignored");
                    return;
                }
                match kind {
                    Kind::ConnectAck => {
                        *phase = ClientPhase::Connected;
                        self.open_link(ConnectionId::SERVER, from, now);
                    }
                    Kind::Disconnect => {
                        *phase = ClientPhase::Done;
                        warn!(%from, "Connection refused");
                        let _ = self.events.send(WireEvent::Disconnected {
                            id: ConnectionId::SERVER,
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    fn open_link(&mut self, id: ConnectionId, address: SocketAddr, now: Instant) {
        self.links.insert(id, ReliableLink::new(id, address, now));
        self.by_addr.insert(address, id);
        self.shared.links.write().insert(id, 0);
        let _ = self.events.send(WireEvent::Connected { id, address });
        info!(%id, %address, "Connection opened");
    }

    fn drop_link(&mut self, id: ConnectionId, notify_remote: bool, reason: &str) {
        let Some(link) = self.links.remove(&id) else {
            return;
        };
        let address = link.address();
        if notify_remote {
            transmit(&self.socket, address, &datagram::control(Kind::Disconnect, 0, &[]));
        }
        link.release(&self.pool);
        self.by_addr.remove(&address);
        self.shared.links.write().remove(&id);
        let _ = self.events.send(WireEvent::Disconnected { id });
        self.ids.release(id);
        if let Role::Client { phase, .. } = &mut self.role {
            *phase = ClientPhase::Done;
        }
        info!(%id, %address, reason, "Connection closed");
    }

    fn maintain(&mut self, now: Instant) {
        let mut dead = Vec::new();
        for (id, link) in &mut self.links {
            let (socket, address) = (&self.socket, link.address());
            let mut out = |bytes: &[u8]| transmit(socket, address, bytes);
            if link.is_idle(now, self.config.idle_timeout) {
                dead.push((*id, "idle timeout"));
            } else if !link.resend_due(now, &mut out) {
                dead.push((*id, "too many resends"));
            } else {
                link.ping_due(now, self.config.ping_interval, &mut out);
            }
        }
        for (id, reason) in dead {
            warn!(%id, reason, "Dropping link");
            self.drop_link(id, true, reason);
        }
    }

    fn stop(&mut self) {
        let ids: Vec<_> = self.links.keys().copied().collect();
        for id in ids {
            self.drop_link(id, true, "peer shut down");
        }
        for command in self.commands.try_iter() {
            if let Command::Send(_, packet) = command {
                Packet::recycle(packet, &self.pool);
            }
        }
        self.shared.links.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> NetSettings {
        NetSettings {
            connect_timeout_ms: 2000,
            ping_interval_ms: 50,
            ..NetSettings::default()
        }
    }

    fn wait_for(peer: &mut ReliablePeer, events: &mut Vec<WireEvent>, mut done: impl FnMut(&[WireEvent]) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(events) {
            assert!(Instant::now() < deadline, "timed out waiting, got {events:?}");
            peer.poll(events);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn listen(server: &mut ReliablePeer, max_clients: usize) -> u16 {
        server
            .start(StartMode::Listen {
                address: "127.0.0.1".into(),
                port: 0,
                max_clients,
            })
            .unwrap();
        server.local_addr().unwrap().port()
    }

    fn connect(client: &mut ReliablePeer, port: u16) {
        client
            .start(StartMode::Connect {
                address: "127.0.0.1".into(),
                port,
            })
            .unwrap();
    }

    #[test]
    fn test_connect_exchange_and_disconnect() {
        let pool = Arc::new(BufferPool::new());
        let mut server = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let mut client = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let port = listen(&mut server, 4);
        connect(&mut client, port);

        let mut client_events = Vec::new();
        wait_for(&mut client, &mut client_events, |events| !events.is_empty());
        assert!(matches!(client_events[0], WireEvent::Connected { id: ConnectionId::SERVER, .. }));

        let mut server_events = Vec::new();
        wait_for(&mut server, &mut server_events, |events| !events.is_empty());
        let WireEvent::Connected { id, .. } = server_events[0] else {
            panic!("expected Connected, got {server_events:?}");
        };
        assert_eq!(id, ConnectionId(1));
        server_events.clear();

        for i in 0..20u8 {
            let packet = Arc::new(Packet::copy_from(&pool, &[i, 0, i]));
            assert!(client.send(ConnectionId::SERVER, packet));
        }
        wait_for(&mut server, &mut server_events, |events| events.len() == 20);
        for (i, event) in server_events.drain(..).enumerate() {
            let WireEvent::Data { packet, .. } = event else {
                panic!("expected Data");
            };
            assert_eq!(packet.as_slice(), [i as u8, 0, i as u8]);
            packet.release(&pool);
        }

        server.disconnect(id);
        client_events.clear();
        wait_for(&mut client, &mut client_events, |events| {
            events.iter().any(|event| matches!(event, WireEvent::Disconnected { .. }))
        });
        wait_for(&mut server, &mut server_events, |events| !events.is_empty());
        assert!(matches!(server_events[0], WireEvent::Disconnected { id: ConnectionId(1) }));

        client.shutdown();
        server.shutdown();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_oversized_frame_refused() {
        let pool = Arc::new(BufferPool::new());
        let mut server = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let mut client = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let port = listen(&mut server, 4);
        connect(&mut client, port);

        let mut events = Vec::new();
        wait_for(&mut client, &mut events, |events| !events.is_empty());

        let big = Arc::new(Packet::copy_from(&pool, &vec![0; MAX_PAYLOAD_SIZE + 1]));
        assert!(!client.send(ConnectionId::SERVER, big));
        assert!(!client.send(ConnectionId(42), Arc::new(Packet::copy_from(&pool, b"\x01\x00"))));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_server_full_refuses() {
        let pool = Arc::new(BufferPool::new());
        let mut server = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let port = listen(&mut server, 1);

        let mut first = ReliablePeer::new(&settings(), Arc::clone(&pool));
        connect(&mut first, port);
        let mut events = Vec::new();
        wait_for(&mut first, &mut events, |events| !events.is_empty());
        assert!(matches!(events[0], WireEvent::Connected { .. }));

        let mut second = ReliablePeer::new(&settings(), Arc::clone(&pool));
        connect(&mut second, port);
        events.clear();
        wait_for(&mut second, &mut events, |events| !events.is_empty());
        assert!(matches!(events[0], WireEvent::Disconnected { id: ConnectionId::SERVER }));
    }

    #[test]
    fn test_round_trip_measured() {
        let pool = Arc::new(BufferPool::new());
        let mut server = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let mut client = ReliablePeer::new(&settings(), Arc::clone(&pool));
        let port = listen(&mut server, 4);
        connect(&mut client, port);

        let deadline = Instant::now() + Duration::from_secs(5);
        while client.round_trip_time(ConnectionId::SERVER) == 0 {
            assert!(Instant::now() < deadline, "no round trip measured");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
