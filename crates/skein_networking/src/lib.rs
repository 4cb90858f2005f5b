//! # SKEIN Networking
//!
//! Client/server runtime over interchangeable transports.
//!
//! ## Architecture
//!
//! - **Wire**: reliable ordered UDP, TCP stream and WebSocket backends
//!   behind one [`WirePeer`] trait, each feeding a uniform event queue
//! - **Peer**: [`Server`] and [`Client`] dispatch typed messages to
//!   registered handlers
//! - **EndPoint**: request/response correlation with timeouts
//! - **Gate**: one session object per connection
//!
//! ## Threading
//!
//! ```text
//!  socket threads ──> event queue ──> update() on the poll thread
//!                                       ├─ message handlers
//!                                       ├─ request handlers ─> response
//!                                       └─ EndPoint (responses, timeouts)
//! ```
//!
//! Application code only runs inside `update()`. Received buffers come
//! from a shared [`BufferPool`](skein_core::BufferPool) and go back once
//! dispatched.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use skein_networking::{Client, NetSettings, Protocol, TickLoop};
//! use skein_shared::{EchoRequest, EchoResponse};
//!
//! let settings = NetSettings::default();
//! let mut client = Client::new(settings.clone());
//! client.initialize(Protocol::Stream);
//! client.start("127.0.0.1", 7777);
//!
//! let mut tick_loop = TickLoop::from_settings(&settings);
//! let mut call = None;
//! tick_loop.run(|_| {
//!     client.update();
//!     if client.is_connected() && call.is_none() {
//!         let request = EchoRequest { text: "hello".into() };
//!         call = client.call::<_, EchoResponse>(&request, Duration::from_secs(5));
//!     }
//!     !call.as_mut().is_some_and(|call| call.try_outcome().is_some())
//! });
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod blacklist;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod peer;
pub mod tick;
pub mod wire;

pub use blacklist::Blacklist;
pub use config::{NetSettings, Protocol};
pub use connection::{Connection, ConnectionId};
pub use endpoint::{CallOutcome, EndPoint, FanOutCall, PendingCall};
pub use error::{NetError, NetResult};
pub use gate::{Session, SessionGate, SessionRegistry};
pub use peer::{Client, ClientContext, PeerState, Server, ServerContext};
pub use tick::{TickLoop, TickStats};
pub use wire::{StartMode, WireEvent, WirePeer};
