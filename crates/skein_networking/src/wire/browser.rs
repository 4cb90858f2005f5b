//! # Browser WebSocket Peer
//!
//! Client-only backend for `wasm32` builds on top of the browser's
//! `WebSocket`. The browser invokes callbacks on the page's event loop;
//! they push into a queue that [`WirePeer::poll`] drains, so the rest of
//! the runtime sees the same event stream as on native targets.
//!
//! Browsers do not expose WebSocket ping frames, so the round-trip time
//! always reads 0.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;

use js_sys::{ArrayBuffer, Uint8Array};
use skein_core::codec::FRAME_HEADER_SIZE;
use skein_core::{BufferPool, Packet, SharedPacket};
use tracing::{debug, info, warn};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use super::{StartMode, WireEvent, WirePeer};
use crate::config::Protocol;
use crate::connection::ConnectionId;
use crate::error::{NetError, NetResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SocketState {
    Connecting,
    Open,
    Closed,
}

type EventQueue = Rc<RefCell<VecDeque<WireEvent>>>;

/// Keeps the JS callbacks alive while the socket is in use.
struct Callbacks {
    _on_open: Closure<dyn FnMut()>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
    _on_error: Closure<dyn FnMut(ErrorEvent)>,
}

/// WebSocket backend for browsers.
pub struct BrowserWebSocketPeer {
    pool: Arc<BufferPool>,
    queue: EventQueue,
    state: Rc<Cell<SocketState>>,
    socket: Option<WebSocket>,
    callbacks: Option<Callbacks>,
}

impl BrowserWebSocketPeer {
    /// Creates an idle peer.
    #[must_use]
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            queue: Rc::new(RefCell::new(VecDeque::new())),
            state: Rc::new(Cell::new(SocketState::Closed)),
            socket: None,
            callbacks: None,
        }
    }

    fn attach(&self, socket: &WebSocket, remote: SocketAddr) -> Callbacks {
        let on_open = {
            let queue = Rc::clone(&self.queue);
            let state = Rc::clone(&self.state);
            Closure::<dyn FnMut()>::new(move || {
                state.set(SocketState::Open);
                queue.borrow_mut().push_back(WireEvent::Connected {
                    id: ConnectionId::SERVER,
                    address: remote,
                });
                info!(%remote, "WebSocket open");
            })
        };

        let on_message = {
            let queue = Rc::clone(&self.queue);
            let pool = Arc::clone(&self.pool);
            Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
                let Ok(buffer) = event.data().dyn_into::<ArrayBuffer>() else {
                    debug!("Ignoring non-binary WebSocket message");
                    return;
                };
                let bytes = Uint8Array::new(&buffer);
                let len = bytes.length() as usize;
                if len < FRAME_HEADER_SIZE {
                    warn!(len, "Frame shorter than its header dropped");
                    return;
                }
                let mut data = pool.rent(len);
                data.as_mut_vec().resize(len, 0);
                bytes.copy_to(data.as_mut_vec());
                queue.borrow_mut().push_back(WireEvent::Data {
                    id: ConnectionId::SERVER,
                    packet: Packet::new(data),
                });
            })
        };

        let on_close = {
            let queue = Rc::clone(&self.queue);
            let state = Rc::clone(&self.state);
            Closure::<dyn FnMut(CloseEvent)>::new(move |event: CloseEvent| {
                if state.replace(SocketState::Closed) == SocketState::Closed {
                    return;
                }
                queue.borrow_mut().push_back(WireEvent::Disconnected {
                    id: ConnectionId::SERVER,
                });
                info!(code = event.code(), reason = %event.reason(), "WebSocket closed");
            })
        };

        let on_error = Closure::<dyn FnMut(ErrorEvent)>::new(move |event: ErrorEvent| {
            warn!(message = %event.message(), "WebSocket error");
        });

        socket.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        socket.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        socket.set_onclose(Some(on_close.as_ref().unchecked_ref()));
        socket.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        Callbacks {
            _on_open: on_open,
            _on_message: on_message,
            _on_close: on_close,
            _on_error: on_error,
        }
    }

    fn detach(socket: &WebSocket) {
        socket.set_onopen(None);
        socket.set_onmessage(None);
        socket.set_onclose(None);
        socket.set_onerror(None);
    }
}

impl WirePeer for BrowserWebSocketPeer {
    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn start(&mut self, mode: StartMode) -> NetResult<()> {
        if self.socket.is_some() {
            return Err(NetError::InvalidState("browser peer already running".into()));
        }
        let StartMode::Connect { address, port } = mode else {
            return Err(NetError::InvalidState("browser peer cannot listen".into()));
        };

        let url = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.clone()
        } else {
            format!("ws://{address}:{port}/")
        };
        let remote = address
            .parse::<IpAddr>()
            .map_or_else(|_| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port), |ip| SocketAddr::new(ip, port));

        let socket = WebSocket::new(&url).map_err(|err| NetError::WebSocket(format!("{err:?}")))?;
        socket.set_binary_type(BinaryType::Arraybuffer);
        self.state.set(SocketState::Connecting);
        self.callbacks = Some(self.attach(&socket, remote));
        self.socket = Some(socket);
        info!(%url, "WebSocket connecting");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(socket) = self.socket.take() {
            Self::detach(&socket);
            let _ = socket.close();
            info!("WebSocket peer stopped");
        }
        self.callbacks = None;
        self.state.set(SocketState::Closed);
        for event in self.queue.borrow_mut().drain(..) {
            if let WireEvent::Data { packet, .. } = event {
                packet.release(&self.pool);
            }
        }
    }

    fn poll(&mut self, events: &mut Vec<WireEvent>) {
        events.extend(self.queue.borrow_mut().drain(..));
    }

    fn send(&mut self, id: ConnectionId, packet: SharedPacket) -> bool {
        let sent = match &self.socket {
            Some(socket) if id == ConnectionId::SERVER && self.state.get() == SocketState::Open => {
                socket.send_with_u8_array(packet.as_slice()).is_ok()
            }
            _ => false,
        };
        Packet::recycle(packet, &self.pool);
        sent
    }

    fn disconnect(&mut self, id: ConnectionId) {
        if id != ConnectionId::SERVER {
            return;
        }
        if let Some(socket) = &self.socket {
            // The close callback emits `Disconnected`.
            let _ = socket.close();
        }
    }

    fn round_trip_time(&self, _id: ConnectionId) -> u32 {
        0
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_running(&self) -> bool {
        self.socket.is_some()
    }
}

impl Drop for BrowserWebSocketPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
