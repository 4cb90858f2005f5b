//! Views handed to handlers while a peer dispatches.
//!
//! A context borrows the parts of its peer that handlers may touch (the
//! wire, the pool, the endpoint) so a handler can reply, broadcast or start
//! calls without holding the peer itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use skein_core::codec::{Message, MessageId};
use skein_core::{BufferPool, Packet};
use tracing::{debug, warn};

use super::rpc::{RpcHeader, COOKIE_OFFSET};
use super::{encode_packet, encode_rpc_packet};
use crate::config::NetSettings;
use crate::connection::{Connection, ConnectionId};
use crate::endpoint::{EndPoint, FanOutCall, PendingCall};
use crate::wire::WirePeer;

/// Server-side handler context.
pub struct ServerContext<'a> {
    pub(crate) wire: &'a mut dyn WirePeer,
    pub(crate) pool: &'a Arc<BufferPool>,
    pub(crate) connections: &'a BTreeMap<ConnectionId, Connection>,
    pub(crate) endpoint: &'a mut EndPoint,
    pub(crate) settings: &'a NetSettings,
}

impl ServerContext<'_> {
    /// Sends `message` to one connection.
    pub fn send<T: Message>(&mut self, id: ConnectionId, message: &T) -> bool {
        if !self.connections.contains_key(&id) {
            debug!(%id, "Send to unknown connection ignored");
            return false;
        }
        match encode_packet(self.pool, message, self.settings.max_frame_size) {
            Some(packet) => self.send_packet(id, packet),
            None => false,
        }
    }

    pub(crate) fn send_packet(&mut self, id: ConnectionId, packet: Packet) -> bool {
        self.wire.send(id, Arc::new(packet))
    }

    /// Sends `message` to every connection. Returns how many accepted it.
    pub fn broadcast<T: Message>(&mut self, message: &T) -> usize {
        let connections = self.connections;
        self.fan_out(connections.keys().copied(), message)
    }

    /// Sends `message` to the listed connections. Unknown ids are skipped.
    pub fn broadcast_to<T: Message>(&mut self, ids: &[ConnectionId], message: &T) -> usize {
        let connections = self.connections;
        self.fan_out(ids.iter().copied().filter(|id| connections.contains_key(id)), message)
    }

    /// Encodes once and shares the packet between every send queue.
    fn fan_out<T: Message>(&mut self, ids: impl Iterator<Item = ConnectionId>, message: &T) -> usize {
        let Some(packet) = encode_packet(self.pool, message, self.settings.max_frame_size) else {
            return 0;
        };
        let shared = Arc::new(packet);
        let sent = ids.filter(|&id| self.wire.send(id, Arc::clone(&shared))).count();
        Packet::recycle(shared, self.pool);
        sent
    }

    /// Closes a connection. Its disconnect is reported by a later update.
    pub fn disconnect(&mut self, id: ConnectionId) -> bool {
        if !self.connections.contains_key(&id) {
            return false;
        }
        self.wire.disconnect(id);
        true
    }

    /// Sends a request to `id` and returns the handle for its response.
    ///
    /// Returns `None` if `id` is not connected or the request cannot be
    /// encoded or queued.
    pub fn call<Req: Message, Resp: Message>(
        &mut self,
        id: ConnectionId,
        request: &Req,
        timeout: Duration,
    ) -> Option<PendingCall<Resp>> {
        if !self.connections.contains_key(&id) {
            warn!(%id, "Call to unknown connection");
            return None;
        }
        let (serial, call) = self.endpoint.acquire::<Resp>(timeout, Some(id));
        let header = RpcHeader { serial, cookie: 0 };
        let sent = encode_rpc_packet(self.pool, MessageId::RPC_REQUEST, header, request, self.settings.max_frame_size)
            .is_some_and(|packet| self.wire.send(id, Arc::new(packet)));
        if !sent {
            self.endpoint.cancel(serial);
            return None;
        }
        Some(call)
    }

    /// Sends the same request to several connections, using each
    /// connection id as the cookie. Ids that are not connected are skipped.
    pub fn call_many<Req: Message, Resp: Message>(
        &mut self,
        ids: &[ConnectionId],
        request: &Req,
        timeout: Duration,
    ) -> Option<FanOutCall<Resp>> {
        let targets: Vec<(u32, ConnectionId)> = ids
            .iter()
            .filter(|id| self.connections.contains_key(*id))
            .map(|&id| (id.0, id))
            .collect();
        let (serial, call) = self.endpoint.acquire_fan_out::<Resp>(timeout, &targets);
        let header = RpcHeader { serial, cookie: 0 };
        let Some(template) =
            encode_rpc_packet(self.pool, MessageId::RPC_REQUEST, header, request, self.settings.max_frame_size)
        else {
            self.endpoint.cancel(serial);
            return None;
        };

        for &(cookie, id) in &targets {
            let mut buffer = self.pool.rent(template.len());
            buffer.extend_from_slice(template.as_slice());
            buffer.as_mut_vec()[COOKIE_OFFSET..COOKIE_OFFSET + 4].copy_from_slice(&cookie.to_le_bytes());
            if !self.wire.send(id, Arc::new(Packet::new(buffer))) {
                self.endpoint.cancel_target(serial, id);
            }
        }
        template.release(self.pool);
        Some(call)
    }

    /// Connection by id.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Every live connection, in id order.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values()
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Round-trip time to `id` in milliseconds.
    #[must_use]
    pub fn round_trip_time(&self, id: ConnectionId) -> u32 {
        self.wire.round_trip_time(id)
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &NetSettings {
        self.settings
    }

    /// Buffer pool used for outgoing frames.
    #[must_use]
    pub fn pool(&self) -> &Arc<BufferPool> {
        self.pool
    }
}

/// Client-side handler context.
pub struct ClientContext<'a> {
    pub(crate) wire: &'a mut dyn WirePeer,
    pub(crate) pool: &'a Arc<BufferPool>,
    pub(crate) connection: Option<&'a Connection>,
    pub(crate) endpoint: &'a mut EndPoint,
    pub(crate) settings: &'a NetSettings,
}

impl ClientContext<'_> {
    /// Sends `message` to the server. False while not connected.
    pub fn send<T: Message>(&mut self, message: &T) -> bool {
        if self.connection.is_none() {
            return false;
        }
        match encode_packet(self.pool, message, self.settings.max_frame_size) {
            Some(packet) => self.send_packet(packet),
            None => false,
        }
    }

    pub(crate) fn send_packet(&mut self, packet: Packet) -> bool {
        self.wire.send(ConnectionId::SERVER, Arc::new(packet))
    }

    /// Sends a request to the server.
    pub fn call<Req: Message, Resp: Message>(
        &mut self,
        request: &Req,
        timeout: Duration,
    ) -> Option<PendingCall<Resp>> {
        if self.connection.is_none() {
            warn!("Call while not connected");
            return None;
        }
        let (serial, call) = self.endpoint.acquire::<Resp>(timeout, Some(ConnectionId::SERVER));
        let header = RpcHeader { serial, cookie: 0 };
        let sent = encode_rpc_packet(self.pool, MessageId::RPC_REQUEST, header, request, self.settings.max_frame_size)
            .is_some_and(|packet| self.wire.send(ConnectionId::SERVER, Arc::new(packet)));
        if !sent {
            self.endpoint.cancel(serial);
            return None;
        }
        Some(call)
    }

    /// Closes the connection. The disconnect is reported by a later update.
    pub fn disconnect(&mut self) {
        if self.connection.is_some() {
            self.wire.disconnect(ConnectionId::SERVER);
        }
    }

    /// The server connection, if established.
    #[must_use]
    pub fn connection(&self) -> Option<&Connection> {
        self.connection
    }

    /// Round-trip time to the server in milliseconds.
    #[must_use]
    pub fn round_trip_time(&self) -> u32 {
        self.wire.round_trip_time(ConnectionId::SERVER)
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &NetSettings {
        self.settings
    }
}
