//! # Stream Wire Peer
//!
//! Length-prefixed frames over TCP.
//!
//! ## Threads
//!
//! - Server: one accept thread polling a non-blocking listener
//! - Client: one connector thread, gone once connected
//! - Per connection: a reader feeding a [`FrameDecoder`] and a writer
//!   draining the send queue through a `BufWriter`, flushed whenever the
//!   queue runs empty
//!
//! Round-trip time is not measured on this protocol and reads as 0.

use std::io::{self, BufWriter, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use skein_core::{BufferPool, Packet, SharedPacket};
use tracing::{debug, info, warn};

use super::links::{LinkHandle, LinkTable, Outgoing};
use super::{
    discard_events, drain_events, length_prefix, pooled_packet, resolve, FrameDecoder,
    StartMode, WireEvent, WirePeer,
};
use crate::config::{NetSettings, Protocol};
use crate::connection::ConnectionId;
use crate::error::{NetError, NetResult};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const READ_CHUNK_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug)]
struct LinkConfig {
    max_frame_size: usize,
    no_delay: bool,
}

/// TCP backend.
pub struct StreamPeer {
    table: Arc<LinkTable>,
    events: Receiver<WireEvent>,
    config: LinkConfig,
    connect_timeout: Duration,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
}

impl StreamPeer {
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
            },
            connect_timeout: settings.connect_timeout(),
            local_addr: Arc::new(Mutex::new(None)),
        }
    }
}

impl WirePeer for StreamPeer {
    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    fn start(&mut self, mode: StartMode) -> NetResult<()> {
        if self.table.is_running() {
            return Err(NetError::InvalidState("stream peer already running".into()));
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
                self.table.spawn("skein-stream-accept".into(), move || {
                    accept_loop(&table, &listener, config, max_clients);
                });
                info!(address = %bound, max_clients, "Stream peer listening");
            }
            StartMode::Connect { address, port } => {
                let remote = resolve(&address, port)?;
                self.table.running.store(true, Ordering::Release);

                let table = Arc::clone(&self.table);
                let config = self.config;
                let timeout = self.connect_timeout;
                let local_addr = Arc::clone(&self.local_addr);
                self.table.spawn("skein-stream-connect".into(), move || {
                    match TcpStream::connect_timeout(&remote, timeout) {
                        Ok(stream) => {
                            *local_addr.lock() = stream.local_addr().ok();
                            if let Err(err) =
                                spawn_link(&table, config, stream, ConnectionId::SERVER, remote)
                            {
                                warn!(%remote, error = %err, "Failed to set up connection");
                                table.fail(ConnectionId::SERVER);
                            }
                        }
                        Err(err) => {
                            warn!(%remote, error = %err, "Connect failed");
                            table.fail(ConnectionId::SERVER);
                        }
                    }
                });
                info!(%remote, "Stream peer connecting");
            }
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.table.is_running() {
            self.table.stop();
            info!("Stream peer stopped");
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

    fn round_trip_time(&self, _id: ConnectionId) -> u32 {
        0
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn is_running(&self) -> bool {
        self.table.is_running()
    }
}

impl Drop for StreamPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(table: &Arc<LinkTable>, listener: &TcpListener, config: LinkConfig, max_clients: usize) {
    while table.is_running() {
        match listener.accept() {
            Ok((stream, address)) => {
                let Some(id) = table.reserve(max_clients) else {
                    warn!(%address, max_clients, "Refusing connection, server full");
                    let _ = stream.shutdown(Shutdown::Both);
                    continue;
                };
                if let Err(err) = spawn_link(table, config, stream, id, address) {
                    warn!(%address, error = %err, "Failed to set up connection");
                    table.abandon(id);
                }
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

fn spawn_link(
    table: &Arc<LinkTable>,
    config: LinkConfig,
    stream: TcpStream,
    id: ConnectionId,
    address: SocketAddr,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(config.no_delay)?;
    let reader = stream.try_clone()?;
    let control = stream.try_clone()?;

    let Some(handle) = table.open(id, address, control) else {
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    };
    let epoch = handle.epoch;

    let writer_table = Arc::clone(table);
    table.spawn(format!("skein-stream-write-{}", id.0), move || {
        write_loop(&writer_table, stream, &handle);
    });

    let reader_table = Arc::clone(table);
    table.spawn(format!("skein-stream-read-{}", id.0), move || {
        read_loop(&reader_table, reader, id, epoch, config.max_frame_size);
    });
    Ok(())
}

fn write_frame(writer: &mut impl Write, frame: &[u8]) -> io::Result<()> {
    let prefix = length_prefix(frame.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "frame length overflows u32"))?;
    writer.write_all(&prefix)?;
    writer.write_all(frame)
}

fn write_loop(table: &LinkTable, stream: TcpStream, handle: &LinkHandle) {
    let mut writer = BufWriter::new(stream);

    while let Ok(outgoing) = handle.outbox.recv() {
        let Outgoing::Frame(packet) = outgoing else {
            break;
        };
        let mut result = write_frame(&mut writer, packet.as_slice());
        Packet::recycle(packet, &table.pool);
        if result.is_ok() && handle.outbox.is_empty() {
            result = writer.flush();
        }
        if let Err(err) = result {
            debug!(id = %handle.id, error = %err, "Write failed");
            break;
        }
    }

    table.drain_outbox(&handle.outbox);
    table.close_link(handle.id, handle.epoch);
}

fn read_loop(table: &LinkTable, mut stream: TcpStream, id: ConnectionId, epoch: u64, max_frame_size: usize) {
    let mut decoder = FrameDecoder::new(max_frame_size);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    'read: loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                decoder.push(&chunk[..n]);
                loop {
                    match decoder.next_frame() {
                        Ok(Some(frame)) => {
                            tracing::trace!(%id, len = frame.len(), "Frame received");
                            table.deliver(id, epoch, pooled_packet(&table.pool, frame));
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(%id, error = %err, "Malformed frame, closing connection");
                            break 'read;
                        }
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                debug!(%id, error = %err, "Read failed");
                break;
            }
        }
    }

    table.close_link(id, epoch);
}
