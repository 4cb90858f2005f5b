//! # WebSocket Wire Peer
//!
//! Binary WebSocket messages over TCP, one message per frame.
//!
//! Each connection is driven by a single thread that alternates between
//! flushing its send queue and a short-timeout read. Round-trip time is
//! measured with ping frames carrying a microsecond timestamp; the remote
//! echoes it in the pong.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use skein_core::codec::FRAME_HEADER_SIZE;
use skein_core::{BufferPool, Packet, SharedPacket};
use tracing::{debug, info, warn};
use tungstenite::{Message, WebSocket};

use super::links::{LinkHandle, LinkTable, Outgoing};
use super::{discard_events, drain_events, now_micros, pooled_packet, resolve, StartMode, WireEvent, WirePeer};
use crate::config::{NetSettings, Protocol};
use crate::connection::ConnectionId;
use crate::error::{NetError, NetResult};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const READ_TIMEOUT: Duration = Duration::from_millis(2);

#[derive(Clone, Copy, Debug)]
struct LinkConfig {
    max_frame_size: usize,
    no_delay: bool,
    ping_interval: Duration,
    handshake_timeout: Duration,
}

/// WebSocket backend.
pub struct WebSocketPeer {
    table: Arc<LinkTable>,
    events: Receiver<WireEvent>,
    config: LinkConfig,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl WebSocketPeer {
    /// Creates an idle peer.
    #[must_use]
    pub fn new(settings: &NetSettings, pool: Arc<BufferPool>) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            table: Arc::new(LinkTable::new(pool, events_tx)),
            events: events_rx,
            config: LinkConfig {
                max_frame_size: settings.max_frame_size,
                no_delay: settings.no_delay,
                ping_interval: settings.ping_interval(),
                handshake_timeout: settings.connect_timeout(),
            },
            local_addr: Arc::new(Mutex::new(None)),
        }
    }
}

impl WirePeer for WebSocketPeer {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn start(&mut self, mode: StartMode) -> NetResult<()> {
        if self.table.is_running() {
            return Err(NetError::InvalidState("websocket peer already running".into()));
        }

        match mode {
            StartMode::Listen {
                address,
                port,
                max_clients,
            } => {
                let listener = TcpListener::bind(resolve(&address, port)?)?;
                listener.set_nonblocking(true)?;
                let bound = listener.local_addr()?;
                *self.local_addr.lock() = Some(bound);

                self.table.running.store(true, Ordering::Release);
                let table = Arc::clone(&self.table);
                let config = self.config;
                self.table.spawn("skein-ws-accept".into(), move || {
                    accept_loop(&table, &listener, config, max_clients);
                });
                info!(address = %bound, max_clients, "WebSocket peer listening");
            }
            StartMode::Connect { address, port } => {
                let remote = resolve(&address, port)?;
                let url = format!("ws://{address}:{port}/");
                self.table.running.store(true, Ordering::Release);

                let table = Arc::clone(&self.table);
                let config = self.config;
                let local_addr = Arc::clone(&self.local_addr);
                self.table.spawn("skein-ws-connect".into(), move || {
                    if let Err(err) = connect(&table, config, remote, &url, &local_addr) {
                        warn!(%remote, error = %err, "WebSocket connect failed");
                        table.fail(ConnectionId::SERVER);
                    }
                });
                info!(%remote, "WebSocket peer connecting");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.table.is_running() {
            self.table.stop();
            info!("WebSocket peer stopped");
        }
        discard_events(&self.events, &self.table.pool);
        *self.local_addr.lock() = None;
    }

    fn poll(&mut self, events: &mut Vec<WireEvent>) {
        drain_events(&self.events, events);
    }

    fn send(&mut self, id: ConnectionId, packet: SharedPacket) -> bool {
        if packet.len() > self.config.max_frame_size {
            warn!(%id, len = packet.len(), max = self.config.max_frame_size, "Frame too large, not sent");
            Packet::recycle(packet, &self.table.pool);
            return false;
        }
        self.table.send(id, packet)
    }

    fn disconnect(&mut self, id: ConnectionId) {
        self.table.close(id);
    }

    fn round_trip_time(&self, id: ConnectionId) -> u32 {
        self.table.round_trip_time(id)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn is_running(&self) -> bool {
        self.table.is_running()
    }
}

impl Drop for WebSocketPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(table: &Arc<LinkTable>, listener: &TcpListener, config: LinkConfig, max_clients: usize) {
    while table.is_running() {
        match listener.accept() {
            Ok((stream, address)) => {
                // The slot is held through the handshake so overlapping
                // handshakes cannot overshoot `max_clients`.
                let Some(id) = table.reserve(max_clients) else {
                    warn!(%address, max_clients, "Refusing connection, server full");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                };
                let link_table = Arc::clone(table);
                table.spawn(format!("skein-ws-{}", id.0), move || {
                    if let Err(err) = serve(&link_table, config, stream, id, address) {
                        warn!(%address, error = %err, "WebSocket handshake failed");
                        link_table.abandon(id);
                    }
                });
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(err) => {
                warn!(error = %err, "Accept failed");
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    debug!("Accept loop exited");
}

fn prepare(stream: &TcpStream, config: LinkConfig) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(config.no_delay)?;
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    stream.try_clone()
}

fn serve(
    table: &LinkTable,
    config: LinkConfig,
    stream: TcpStream,
    id: ConnectionId,
    address: SocketAddr,
) -> NetResult<()> {
    let control = prepare(&stream, config)?;
    let ws = tungstenite::accept(stream).map_err(|err| NetError::WebSocket(err.to_string()))?;
    run_link(table, config, ws, id, address, control)
}

fn connect(
    table: &LinkTable,
    config: LinkConfig,
    remote: SocketAddr,
    url: &str,
    local_addr: &Mutex<Option<SocketAddr>>,
) -> NetResult<()> {
    let stream = TcpStream::connect_timeout(&remote, config.handshake_timeout)?;
    *local_addr.lock() = stream.local_addr().ok();
    let control = prepare(&stream, config)?;
    let (ws, _response) =
        tungstenite::client(url, stream).map_err(|err| NetError::WebSocket(err.to_string()))?;
    run_link(table, config, ws, ConnectionId::SERVER, remote, control)
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn record_pong(handle: &LinkHandle, data: &[u8]) {
    let Ok(stamp) = <[u8; 8]>::try_from(data) else {
        return;
    };
    let sample = u32::try_from(now_micros().saturating_sub(u64::from_le_bytes(stamp)) / 1000)
        .unwrap_or(u32::MAX);
    let previous = handle.rtt_ms.load(Ordering::Relaxed);
    let smoothed = if previous == 0 {
        sample.max(1)
    } else {
        ((u64::from(previous) * 7 + u64::from(sample)) / 8) as u32
    };
    handle.rtt_ms.store(smoothed.max(1), Ordering::Relaxed);
}

fn run_link(
    table: &LinkTable,
    config: LinkConfig,
    mut ws: WebSocket<TcpStream>,
    id: ConnectionId,
    address: SocketAddr,
    control: TcpStream,
) -> NetResult<()> {
    ws.get_ref().set_read_timeout(Some(READ_TIMEOUT))?;
    let Some(handle) = table.open(id, address, control) else {
        let _ = ws.close(None);
        let _ = ws.flush();
        return Ok(());
    };

    let mut last_ping = Instant::now();
    'link: loop {
        if !table.is_running() {
            let _ = ws.close(None);
            let _ = ws.flush();
            break;
        }

        for outgoing in handle.outbox.try_iter() {
            match outgoing {
                Outgoing::Frame(packet) => {
                    let message = Message::Binary(packet.as_slice().to_vec());
                    Packet::recycle(packet, &table.pool);
                    if let Err(err) = ws.write(message) {
                        debug!(%id, error = %err, "Write failed");
                        break 'link;
                    }
                }
                Outgoing::Close => {
                    let _ = ws.close(None);
                    let _ = ws.flush();
                    break 'link;
                }
            }
        }

        if last_ping.elapsed() >= config.ping_interval {
            last_ping = Instant::now();
            if ws.write(Message::Ping(now_micros().to_le_bytes().to_vec())).is_err() {
                break;
            }
        }

        match ws.flush() {
            Ok(()) => {}
            Err(tungstenite::Error::Io(err)) if would_block(&err) => {}
            Err(err) => {
                debug!(%id, error = %err, "Flush failed");
                break;
            }
        }

        match ws.read() {
            Ok(Message::Binary(data)) => {
                if data.len() < FRAME_HEADER_SIZE || data.len() > config.max_frame_size {
                    warn!(%id, len = data.len(), "Malformed frame, closing connection");
                    break;
                }
                tracing::trace!(%id, len = data.len(), "Frame received");
                table.deliver(id, handle.epoch, pooled_packet(&table.pool, &data));
            }
            Ok(Message::Pong(data)) => record_pong(&handle, &data),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::Io(err)) if would_block(&err) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => {
                debug!(%id, error = %err, "Read failed");
                break;
            }
        }
    }

    table.drain_outbox(&handle.outbox);
    table.close_link(id, handle.epoch);
    Ok(())
}
