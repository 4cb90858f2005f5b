//! # Wire Peers
//!
//! Transport backends producing a uniform event stream.
//!
//! ## Threading
//!
//! ```text
//!  I/O threads (per backend)              poll thread
//! ┌──────────────────────────┐         ┌────────────────────┐
//! │ socket read ─> Packet    │──event─>│ WirePeer::poll     │
//! │ send queue  <─ Shared    │<─send───│ WirePeer::send     │
//! └──────────────────────────┘         └────────────────────┘
//! ```
//!
//! I/O threads only enqueue. Events are consumed on the thread calling
//! [`WirePeer::poll`], so application code never runs on an I/O thread.

#[cfg(target_arch = "wasm32")]
pub mod browser;
mod frame;
mod ids;
#[cfg(not(target_arch = "wasm32"))]
mod links;
#[cfg(not(target_arch = "wasm32"))]
pub mod reliable;
#[cfg(not(target_arch = "wasm32"))]
pub mod stream;
#[cfg(not(target_arch = "wasm32"))]
pub mod websocket;

pub use frame::{length_prefix, FrameDecoder, FrameError, LENGTH_PREFIX_SIZE};
pub(crate) use ids::IdAllocator;

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use crossbeam_channel::Receiver;
use skein_core::{BufferPool, Packet, SharedPacket};

use crate::config::{NetSettings, Protocol};
use crate::connection::ConnectionId;
use crate::error::{NetError, NetResult};

/// How a wire peer opens its transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Accept connections.
    Listen {
        /// Bind address.
        address: String,
        /// Bind port (0 picks an ephemeral port).
        port: u16,
        /// Connections beyond this are refused.
        max_clients: usize,
    },
    /// Connect to a server.
    Connect {
        /// Server address or host name.
        address: String,
        /// Server port.
        port: u16,
    },
}

/// Transport event, drained by [`WirePeer::poll`].
#[derive(Debug)]
pub enum WireEvent {
    /// A connection was established.
    Connected {
        /// Connection ID.
        id: ConnectionId,
        /// Remote address.
        address: SocketAddr,
    },
    /// A frame (`[id][payload]`) arrived.
    Data {
        /// Source connection.
        id: ConnectionId,
        /// Frame bytes in a pooled buffer.
        packet: Packet,
    },
    /// A connection closed. Emitted exactly once per connection.
    Disconnected {
        /// Connection ID.
        id: ConnectionId,
    },
}

/// A transport backend.
pub trait WirePeer {
    /// Backend protocol.
    fn protocol(&self) -> Protocol;

    /// Opens the transport and spawns I/O threads. Does not block on the
    /// remote side: a client learns the outcome from a `Connected` or
    /// `Disconnected` event.
    fn start(&mut self, mode: StartMode) -> NetResult<()>;

    /// Stops I/O, closes sockets and returns queued buffers to the pool.
    /// Idempotent.
    fn shutdown(&mut self);

    /// Moves every queued event into `events`.
    fn poll(&mut self, events: &mut Vec<WireEvent>);

    /// Queues a frame for `id`. Returns false if `id` is not connected or
    /// the frame is too large for the transport.
    fn send(&mut self, id: ConnectionId, packet: SharedPacket) -> bool;

    /// Closes one connection. Its `Disconnected` event follows.
    fn disconnect(&mut self, id: ConnectionId);

    /// Smoothed round-trip time in milliseconds, 0 if unknown.
    fn round_trip_time(&self, id: ConnectionId) -> u32;

    /// Bound local address once started.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Returns true between `start` and `shutdown`.
    fn is_running(&self) -> bool;
}

/// Creates the backend for `protocol`.
///
/// Returns `None` for protocols the target cannot provide.
#[must_use]
pub fn create(
    protocol: Protocol,
    settings: &NetSettings,
    pool: Arc<BufferPool>,
) -> Option<Box<dyn WirePeer>> {
    #[cfg(not(target_arch = "wasm32"))]
    {
        Some(match protocol {
            Protocol::Reliable => Box::new(reliable::ReliablePeer::new(settings, pool)),
            Protocol::Stream => Box::new(stream::StreamPeer::new(settings, pool)),
            Protocol::WebSocket => Box::new(websocket::WebSocketPeer::new(settings, pool)),
        })
    }
    #[cfg(target_arch = "wasm32")]
    {
        let _ = settings;
        match protocol {
            Protocol::WebSocket => Some(Box::new(browser::BrowserWebSocketPeer::new(pool))),
            Protocol::Reliable | Protocol::Stream => None,
        }
    }
}

/// Resolves `address:port`, preferring the first result.
pub(crate) fn resolve(address: &str, port: u16) -> NetResult<SocketAddr> {
    (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| NetError::Config(format!("address '{address}' did not resolve")))
}

/// Moves queued events into `out`.
pub(crate) fn drain_events(events: &Receiver<WireEvent>, out: &mut Vec<WireEvent>) {
    out.extend(events.try_iter());
}

/// Drops queued events, returning their buffers to `pool`.
pub(crate) fn discard_events(events: &Receiver<WireEvent>, pool: &BufferPool) -> usize {
    let mut discarded = 0;
    for event in events.try_iter() {
        if let WireEvent::Data { packet, .. } = event {
            packet.release(pool);
        }
        discarded += 1;
    }
    discarded
}

/// Copies a received frame into a pooled packet.
#[inline]
pub(crate) fn pooled_packet(pool: &BufferPool, frame: &[u8]) -> Packet {
    Packet::copy_from(pool, frame)
}

/// Current time in microseconds since the Unix epoch, for probe payloads.
pub(crate) fn now_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
}
