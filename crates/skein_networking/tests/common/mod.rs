//! In-memory wire peer for driving a server without sockets.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use skein_core::codec::{decode, encode_frame, split_frame, Message, MessageId};
use skein_core::{BufferPool, Packet, SharedPacket};
use skein_networking::peer::rpc::{parse_rpc, write_rpc_header, RpcHeader};
use skein_networking::{ConnectionId, NetResult, Protocol, StartMode, WireEvent, WirePeer};

struct MemoryState {
    pool: Arc<BufferPool>,
    queue: VecDeque<WireEvent>,
    sent: Vec<(ConnectionId, Vec<u8>)>,
    connected: BTreeSet<ConnectionId>,
    next_id: u32,
    running: bool,
}

/// Wire side, owned by the server under test.
pub struct MemoryPeer {
    state: Rc<RefCell<MemoryState>>,
}

/// Test side: scripts remote peers and inspects what the server sent.
#[derive(Clone)]
pub struct MemoryHandle {
    state: Rc<RefCell<MemoryState>>,
}

/// Creates a connected wire/handle pair.
pub fn memory_wire(pool: Arc<BufferPool>) -> (Box<dyn WirePeer>, MemoryHandle) {
    let state = Rc::new(RefCell::new(MemoryState {
        pool,
        queue: VecDeque::new(),
        sent: Vec::new(),
        connected: BTreeSet::new(),
        next_id: 0,
        running: false,
    }));
    let peer = MemoryPeer {
        state: Rc::clone(&state),
    };
    (Box::new(peer), MemoryHandle { state })
}

impl WirePeer for MemoryPeer {
    fn protocol(&self) -> Protocol {
        Protocol::Stream
    }

    fn start(&mut self, _mode: StartMode) -> NetResult<()> {
        self.state.borrow_mut().running = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        let mut state = self.state.borrow_mut();
        state.running = false;
        state.connected.clear();
        let pool = Arc::clone(&state.pool);
        for event in state.queue.drain(..) {
            if let WireEvent::Data { packet, .. } = event {
                packet.release(&pool);
            }
        }
    }

    fn poll(&mut self, events: &mut Vec<WireEvent>) {
        events.extend(self.state.borrow_mut().queue.drain(..));
    }

    fn send(&mut self, id: ConnectionId, packet: SharedPacket) -> bool {
        let mut state = self.state.borrow_mut();
        let accepted = state.connected.contains(&id);
        if accepted {
            state.sent.push((id, packet.as_slice().to_vec()));
        }
        Packet::recycle(packet, &state.pool);
        accepted
    }

    fn disconnect(&mut self, id: ConnectionId) {
        let mut state = self.state.borrow_mut();
        if state.connected.remove(&id) {
            state.queue.push_back(WireEvent::Disconnected { id });
        }
    }

    fn round_trip_time(&self, _id: ConnectionId) -> u32 {
        0
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_running(&self) -> bool {
        self.state.borrow().running
    }
}

impl MemoryHandle {
    /// Queues a new connection from `address`.
    pub fn connect(&self, address: &str) -> ConnectionId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = ConnectionId(state.next_id);
        state.connected.insert(id);
        state.queue.push_back(WireEvent::Connected {
            id,
            address: address.parse().unwrap(),
        });
        id
    }

    /// Queues a remote close.
    pub fn close(&self, id: ConnectionId) {
        self.state.borrow_mut().connected.remove(&id);
        self.state.borrow_mut().queue.push_back(WireEvent::Disconnected { id });
    }

    /// Queues raw frame bytes from `id`.
    pub fn deliver_raw(&self, id: ConnectionId, frame: &[u8]) {
        let mut state = self.state.borrow_mut();
        let packet = Packet::copy_from(&state.pool, frame);
        state.queue.push_back(WireEvent::Data { id, packet });
    }

    /// Queues `message` from `id`.
    pub fn deliver<T: Message>(&self, id: ConnectionId, message: &T) {
        let mut frame = Vec::new();
        encode_frame(message, &mut frame).unwrap();
        self.deliver_raw(id, &frame);
    }

    /// Queues an RPC request from `id`.
    pub fn request<T: Message>(&self, id: ConnectionId, serial: u32, message: &T) {
        let mut frame = Vec::new();
        write_rpc_header(&mut frame, MessageId::RPC_REQUEST, RpcHeader { serial, cookie: 0 });
        encode_frame(message, &mut frame).unwrap();
        self.deliver_raw(id, &frame);
    }

    /// Queues an RPC response from `id`.
    pub fn respond<T: Message>(&self, id: ConnectionId, header: RpcHeader, message: &T) {
        let mut frame = Vec::new();
        write_rpc_header(&mut frame, MessageId::RPC_RESPONSE, header);
        encode_frame(message, &mut frame).unwrap();
        self.deliver_raw(id, &frame);
    }

    /// Frames the server sent, drained.
    pub fn take_sent(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Decodes every sent `T`, in send order, dropping other frames.
    pub fn sent_messages<T: Message>(&self) -> Vec<(ConnectionId, T)> {
        self.take_sent()
            .into_iter()
            .filter_map(|(id, frame)| {
                let (message, payload) = split_frame(&frame).ok()?;
                (message == T::ID).then(|| decode(payload)).flatten().map(|decoded| (id, decoded))
            })
            .collect()
    }

    /// Decodes every sent RPC frame of `kind` carrying a `T`.
    pub fn sent_rpc<T: Message>(&self, kind: MessageId) -> Vec<(ConnectionId, RpcHeader, T)> {
        self.take_sent()
            .into_iter()
            .filter_map(|(id, frame)| {
                let (message, payload) = split_frame(&frame).ok()?;
                if message != kind {
                    return None;
                }
                let (header, inner) = parse_rpc(payload)?;
                let (inner_id, body) = split_frame(inner).ok()?;
                if inner_id != T::ID {
                    return None;
                }
                Some((id, header, decode(body)?))
            })
            .collect()
    }

    /// Returns true while `id` is open.
    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.state.borrow().connected.contains(&id)
    }
}
