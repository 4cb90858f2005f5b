//! # Loopback Round Trips
//!
//! Server and client on real sockets for every native protocol:
//! connect, ping/pong, echo RPC and disconnect.
//!
//! Run with: cargo test --test round_trip -- --nocapture

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_core::BufferPool;
use skein_networking::{CallOutcome, Client, NetSettings, Protocol, Server};
use skein_shared::{Chat, EchoRequest, EchoResponse, Ping, Pong};

const DEADLINE: Duration = Duration::from_secs(5);

fn pump(server: &mut Server, client: &mut Client, mut done: impl FnMut(&Server, &Client) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        server.update();
        client.update();
        if done(server, client) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

fn demo_server(protocol: Protocol, pool: &Arc<BufferPool>) -> Server {
    let settings = NetSettings {
        protocol,
        ..NetSettings::default()
    };
    let mut server = Server::with_pool(settings, Arc::clone(pool));
    assert!(server.initialize(protocol));
    server.register_handler::<Ping, _>(|ctx, id, ping| {
        ctx.send(id, &Pong::answer(ping));
    });
    server.register_handler::<Chat, _>(|ctx, id, chat| {
        ctx.broadcast(&Chat {
            sender: id.0,
            text: chat.text.clone(),
        });
    });
    let mut served = 0;
    server.register_request_handler::<EchoRequest, EchoResponse, _>(move |_, _, request| {
        served += 1;
        EchoResponse {
            text: request.text.clone(),
            served,
        }
    });
    assert!(server.start(0, 4));
    server
}

fn round_trip(protocol: Protocol) {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).try_init();

    let server_pool = Arc::new(BufferPool::new());
    let mut server = demo_server(protocol, &server_pool);
    let port = server.local_addr().unwrap().port();

    let client_pool = Arc::new(BufferPool::new());
    let mut client = Client::with_pool(NetSettings::default(), Arc::clone(&client_pool));
    assert!(client.initialize(protocol));

    let pongs = Rc::new(RefCell::new(Vec::new()));
    let received = Rc::clone(&pongs);
    client.register_handler::<Pong, _>(move |_, pong| received.borrow_mut().push(*pong));
    let chats = Rc::new(RefCell::new(Vec::new()));
    let heard = Rc::clone(&chats);
    client.register_handler::<Chat, _>(move |_, chat| heard.borrow_mut().push(chat.clone()));
    let lost = Rc::new(RefCell::new(0));
    let on_lost = Rc::clone(&lost);
    client.on_disconnected(move || *on_lost.borrow_mut() += 1);

    assert!(client.start("127.0.0.1", port));
    assert!(
        pump(&mut server, &mut client, |s, c| c.is_connected() && s.connection_count() == 1),
        "{protocol}: connect"
    );

    // Ping/Pong, in order.
    for sequence in 0..10 {
        assert!(client.send(&Ping {
            sent_at_micros: 7,
            sequence,
            _pad: 0,
        }));
    }
    assert!(pump(&mut server, &mut client, |_, _| pongs.borrow().len() == 10), "{protocol}: pongs");
    let sequences: Vec<u32> = pongs.borrow().iter().map(|p| p.sequence).collect();
    assert_eq!(sequences, (0..10).collect::<Vec<_>>());

    // Chat relay with the sender stamped by the server.
    assert!(client.send(&Chat {
        sender: 0,
        text: "hello".into(),
    }));
    assert!(pump(&mut server, &mut client, |_, _| !chats.borrow().is_empty()), "{protocol}: chat");
    assert_eq!(chats.borrow()[0].text, "hello");
    assert_ne!(chats.borrow()[0].sender, 0);

    // Echo RPC.
    let mut call = client
        .call::<EchoRequest, EchoResponse>(&EchoRequest { text: "rpc".into() }, Duration::from_secs(5))
        .unwrap();
    let mut outcome = None;
    assert!(
        pump(&mut server, &mut client, |_, _| {
            outcome = call.try_outcome();
            outcome.is_some()
        }),
        "{protocol}: rpc"
    );
    match outcome {
        Some(CallOutcome::Completed(response)) => {
            assert_eq!(response.text, "rpc");
            assert_eq!(response.served, 1);
        }
        other => panic!("{protocol}: unexpected outcome {other:?}"),
    }

    // Disconnect is seen by both sides exactly once.
    client.disconnect();
    assert!(
        pump(&mut server, &mut client, |s, c| !c.is_connected() && s.connection_count() == 0),
        "{protocol}: disconnect"
    );
    assert_eq!(*lost.borrow(), 1);

    client.shutdown();
    server.shutdown();
    assert_eq!(*lost.borrow(), 1);
    assert_eq!(server_pool.outstanding(), 0, "{protocol}: server buffers");
    assert_eq!(client_pool.outstanding(), 0, "{protocol}: client buffers");
}

#[test]
fn test_round_trip_reliable() {
    round_trip(Protocol::Reliable);
}

#[test]
fn test_round_trip_stream() {
    round_trip(Protocol::Stream);
}

#[test]
fn test_round_trip_websocket() {
    round_trip(Protocol::WebSocket);
}

fn pump_many(server: &mut Server, clients: &mut [Client], mut done: impl FnMut(&Server, &[Client]) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        server.update();
        for client in clients.iter_mut() {
            client.update();
        }
        if done(server, clients) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Broadcast packets are shared by every connection's writer thread; each
/// must come back to the pool exactly once.
fn broadcast_recycles(protocol: Protocol) {
    const CLIENTS: usize = 3;
    const MESSAGES: usize = 200;

    let server_pool = Arc::new(BufferPool::new());
    let mut server = demo_server(protocol, &server_pool);
    let port = server.local_addr().unwrap().port();

    let mut clients = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..CLIENTS {
        let mut client = Client::new(NetSettings::default());
        assert!(client.initialize(protocol));
        let heard = Rc::new(RefCell::new(0usize));
        let counter = Rc::clone(&heard);
        client.register_handler::<Chat, _>(move |_, _| *counter.borrow_mut() += 1);
        assert!(client.start("127.0.0.1", port));
        clients.push(client);
        counters.push(heard);
    }
    assert!(
        pump_many(&mut server, &mut clients, |s, cs| {
            s.connection_count() == CLIENTS && cs.iter().all(Client::is_connected)
        }),
        "{protocol}: connect"
    );

    for index in 0..MESSAGES {
        let sent = server.broadcast(&Chat {
            sender: 0,
            text: format!("news {index}"),
        });
        assert_eq!(sent, CLIENTS);
    }
    assert!(
        pump_many(&mut server, &mut clients, |_, _| counters.iter().all(|c| *c.borrow() == MESSAGES)),
        "{protocol}: broadcast delivery"
    );

    for client in &mut clients {
        client.shutdown();
    }
    server.shutdown();
    assert_eq!(server_pool.outstanding(), 0, "{protocol}: server buffers");
}

#[test]
fn test_broadcast_recycles_stream() {
    broadcast_recycles(Protocol::Stream);
}

#[test]
fn test_broadcast_recycles_websocket() {
    broadcast_recycles(Protocol::WebSocket);
}

#[test]
fn test_connect_to_closed_port_fails() {
    let vacant = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = vacant.local_addr().unwrap().port();
    drop(vacant);

    let settings = NetSettings {
        connect_timeout_ms: 500,
        ..NetSettings::default()
    };
    let mut client = Client::new(settings);
    assert!(client.initialize(Protocol::Stream));
    assert!(client.start("127.0.0.1", port));

    let start = Instant::now();
    while client.state().is_active() && start.elapsed() < DEADLINE {
        client.update();
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!client.is_connected());
    assert!(!client.state().is_active());
    assert!(client.call::<EchoRequest, EchoResponse>(&EchoRequest::default(), Duration::from_secs(1)).is_none());
}
