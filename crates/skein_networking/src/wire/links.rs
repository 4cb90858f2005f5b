//! Connection table shared by the thread-per-connection backends.

use std::collections::{HashMap, HashSet};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use skein_core::{BufferPool, Packet, SharedPacket};
use tracing::{debug, info};

use super::{IdAllocator, WireEvent};
use crate::connection::ConnectionId;

/// Work for a connection's writer.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Frame(SharedPacket),
    Close,
}

struct Link {
    epoch: u64,
    outbox: Sender<Outgoing>,
    socket: TcpStream,
    rtt_ms: Arc<AtomicU32>,
}

/// Handle held by a connection's own threads.
pub(crate) struct LinkHandle {
    pub(crate) id: ConnectionId,
    /// Distinguishes this connection from a later one that reuses `id`.
    pub(crate) epoch: u64,
    pub(crate) outbox: Receiver<Outgoing>,
    pub(crate) rtt_ms: Arc<AtomicU32>,
}

/// Connections, id allocation and the event queue of one peer.
pub(crate) struct LinkTable {
    links: RwLock<HashMap<ConnectionId, Link>>,
    /// Accepted ids whose connection is not open yet. Lock after `links`.
    reserved: Mutex<HashSet<ConnectionId>>,
    ids: Mutex<IdAllocator>,
    next_epoch: AtomicU64,
    events: Sender<WireEvent>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LinkTable {
    pub(crate) fn new(pool: Arc<BufferPool>, events: Sender<WireEvent>) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            ids: Mutex::new(IdAllocator::new()),
            next_epoch: AtomicU64::new(1),
            events,
            pool,
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Allocates an id for an accepted connection if fewer than
    /// `max_clients` are open or setting up. The slot stays taken until
    /// `open` registers the connection or `abandon` gives it back.
    pub(crate) fn reserve(&self, max_clients: usize) -> Option<ConnectionId> {
        let links = self.links.read();
        let mut reserved = self.reserved.lock();
        if links.len() + reserved.len() >= max_clients {
            return None;
        }
        let id = self.ids.lock().allocate();
        reserved.insert(id);
        Some(id)
    }

    /// Returns a reserved id whose connection never opened.
    pub(crate) fn abandon(&self, id: ConnectionId) {
        if self.reserved.lock().remove(&id) {
            self.release_id(id);
        }
    }

    fn release_id(&self, id: ConnectionId) {
        self.ids.lock().release(id);
    }

    /// Registers a connection and emits `Connected`.
    ///
    /// `socket` must be a clone of the connection's stream so the table
    /// can unblock its reader on close.
    /// Returns `None` once the table is stopping; the caller then drops
    /// the connection.
    pub(crate) fn open(
        &self,
        id: ConnectionId,
        address: SocketAddr,
        socket: TcpStream,
    ) -> Option<LinkHandle> {
        let (outbox_tx, outbox_rx) = unbounded();
        let rtt_ms = Arc::new(AtomicU32::new(0));
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut links = self.links.write();
            let was_reserved = self.reserved.lock().remove(&id);
            // Checked under the lock so `stop` either sees this link or
            // we see the stop.
            if !self.is_running() {
                if was_reserved {
                    self.release_id(id);
                }
                return None;
            }
            links.insert(
                id,
                Link {
                    epoch,
                    outbox: outbox_tx,
                    socket,
                    rtt_ms: Arc::clone(&rtt_ms),
                },
            );
            let _ = self.events.send(WireEvent::Connected { id, address });
        }
        info!(%id, %address, "Connection opened");

        Some(LinkHandle {
            id,
            epoch,
            outbox: outbox_rx,
            rtt_ms,
        })
    }

    /// Closes a connection. Only the first call for an id has an effect,
    /// so `Disconnected` is emitted exactly once.
    pub(crate) fn close(&self, id: ConnectionId) -> bool {
        self.close_matching(id, None)
    }

    /// Closes `id` only while it still belongs to the connection opened
    /// as `epoch`. Used by a connection's own threads, which may outlive
    /// their id.
    pub(crate) fn close_link(&self, id: ConnectionId, epoch: u64) -> bool {
        self.close_matching(id, Some(epoch))
    }

    fn close_matching(&self, id: ConnectionId, epoch: Option<u64>) -> bool {
        let link = {
            let mut links = self.links.write();
            let owned = links
                .get(&id)
                .is_some_and(|link| epoch.map_or(true, |epoch| link.epoch == epoch));
            if owned {
                links.remove(&id)
            } else {
                None
            }
        };
        let Some(link) = link else {
            return false;
        };
        let _ = link.socket.shutdown(Shutdown::Both);
        let _ = link.outbox.send(Outgoing::Close);
        let _ = self.events.send(WireEvent::Disconnected { id });
        // Released after the event so a reused id is always announced
        // after the old connection's disconnect.
        self.release_id(id);
        info!(%id, "Connection closed");
        true
    }

    /// Emits `Disconnected` for a connection that never opened (failed
    /// client connect).
    pub(crate) fn fail(&self, id: ConnectionId) {
        let _ = self.events.send(WireEvent::Disconnected { id });
    }

    /// Queues a received frame. Frames from a connection that has already
    /// been closed are dropped, even when its id has been handed out again.
    pub(crate) fn deliver(&self, id: ConnectionId, epoch: u64, packet: Packet) {
        // Held across the send so `close` cannot slip its `Disconnected`
        // in ahead of this frame.
        let links = self.links.read();
        if !links.get(&id).is_some_and(|link| link.epoch == epoch) {
            tracing::trace!(%id, "Frame from closed connection dropped");
            packet.release(&self.pool);
            return;
        }
        if let Err(err) = self.events.send(WireEvent::Data { id, packet }) {
            if let WireEvent::Data { packet, .. } = err.into_inner() {
                packet.release(&self.pool);
            }
        }
    }

    pub(crate) fn send(&self, id: ConnectionId, packet: SharedPacket) -> bool {
        let links = self.links.read();
        let Some(link) = links.get(&id) else {
            Packet::recycle(packet, &self.pool);
            return false;
        };
        match link.outbox.send(Outgoing::Frame(packet)) {
            Ok(()) => true,
            Err(err) => {
                if let Outgoing::Frame(packet) = err.into_inner() {
                    Packet::recycle(packet, &self.pool);
                }
                false
            }
        }
    }

    pub(crate) fn round_trip_time(&self, id: ConnectionId) -> u32 {
        self.links
            .read()
            .get(&id)
            .map_or(0, |link| link.rtt_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn ids(&self) -> Vec<ConnectionId> {
        self.links.read().keys().copied().collect()
    }

    pub(crate) fn spawn(&self, name: String, body: impl FnOnce() + Send + 'static) {
        match std::thread::Builder::new().name(name).spawn(body) {
            Ok(handle) => self.threads.lock().push(handle),
            Err(err) => tracing::error!(error = %err, "Failed to spawn I/O thread"),
        }
    }

    /// Stops every connection and joins I/O threads.
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);

        loop {
            for id in self.ids() {
                self.close(id);
            }
            let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("I/O thread panicked");
                }
            }
        }
        self.reserved.lock().clear();
        *self.ids.lock() = IdAllocator::new();
        debug!("Link table stopped");
    }

    /// Returns every frame still queued in `outbox` to the pool.
    pub(crate) fn drain_outbox(&self, outbox: &Receiver<Outgoing>) {
        for outgoing in outbox.try_iter() {
            if let Outgoing::Frame(packet) = outgoing {
                Packet::recycle(packet, &self.pool);
            }
        }
    }
}
