//! # Server Dispatch Tests
//!
//! Drives a `Server` through an in-memory wire peer: handler routing,
//! RPC correlation, observers, blacklisting and buffer accounting.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use common::{memory_wire, MemoryHandle};
use skein_core::codec::{Message, MessageId};
use skein_core::{CodecResult, MessageReader, MessageWriter};
use skein_core::BufferPool;
use skein_networking::peer::rpc::RpcHeader;
use skein_networking::{CallOutcome, ConnectionId, NetSettings, PeerState, Server};
use skein_shared::{Chat, EchoRequest, EchoResponse, Ping, Pong};

fn started_server() -> (Server, MemoryHandle, Arc<BufferPool>) {
    let pool = Arc::new(BufferPool::new());
    let (wire, handle) = memory_wire(Arc::clone(&pool));
    let mut server = Server::with_pool(NetSettings::default(), Arc::clone(&pool));
    assert!(server.initialize_with(wire));
    assert!(server.start(0, 8));
    (server, handle, pool)
}

fn ping(sequence: u32) -> Ping {
    Ping {
        sent_at_micros: 1_000 + u64::from(sequence),
        sequence,
        _pad: 0,
    }
}

// ============================================================================
// MESSAGE HANDLERS
// ============================================================================

#[test]
fn test_ping_answered_and_buffers_returned() {
    let (mut server, handle, pool) = started_server();
    server.register_handler::<Ping, _>(|ctx, id, ping| {
        ctx.send(id, &Pong::answer(ping));
    });

    let id = handle.connect("127.0.0.1:4000");
    for sequence in 0..5 {
        handle.deliver(id, &ping(sequence));
    }
    server.update();
    assert_eq!(server.state(), PeerState::Running);

    let pongs = handle.sent_messages::<Pong>();
    assert_eq!(pongs.len(), 5);
    for (sequence, (to, pong)) in pongs.iter().enumerate() {
        assert_eq!(*to, id);
        assert_eq!(pong.sequence as usize, sequence);
        assert_eq!(pong.sent_at_micros, 1_000 + sequence as u64);
    }
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_unhandled_message_dropped() {
    let (mut server, handle, pool) = started_server();
    let id = handle.connect("127.0.0.1:4000");
    handle.deliver(
        id,
        &Chat {
            sender: 0,
            text: "nobody listens".into(),
        },
    );
    server.update();

    assert!(handle.take_sent().is_empty());
    assert!(handle.is_connected(id));
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_malformed_payload_dropped_without_disconnect() {
    let (mut server, handle, _pool) = started_server();
    let seen = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&seen);
    server.register_handler::<Chat, _>(move |_, _, _| *counter.borrow_mut() += 1);

    let id = handle.connect("127.0.0.1:4000");
    // Chat id with a string length running past the end.
    handle.deliver_raw(id, &[3, 0, 1, 0, 0, 0, 50, 0, 0, 0, b'x']);
    server.update();

    assert_eq!(*seen.borrow(), 0);
    assert!(handle.is_connected(id));
}

#[test]
fn test_undersized_frame_disconnects() {
    let (mut server, handle, pool) = started_server();
    let closed = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&closed);
    server.on_disconnected(move |id| log.borrow_mut().push(id));

    let id = handle.connect("127.0.0.1:4000");
    handle.deliver_raw(id, &[1]);
    server.update();
    assert!(!handle.is_connected(id));

    server.update();
    assert_eq!(*closed.borrow(), vec![id]);
    assert_eq!(server.connection_count(), 0);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_reregistration_rejected() {
    let (mut server, _handle, _pool) = started_server();
    assert!(server.register_handler::<Ping, _>(|_, _, _| {}));
    assert!(!server.register_handler::<Ping, _>(|_, _, _| {}));
    assert!(server.unregister_handler::<Ping>());
    assert!(!server.unregister_handler::<Ping>());
    assert!(server.register_handler::<Ping, _>(|_, _, _| {}));
}

/// Shares `Chat`'s wire id.
#[derive(Default)]
struct Shout;

impl Message for Shout {
    const ID: MessageId = Chat::ID;

    fn write(&self, _writer: &mut MessageWriter<'_>) -> CodecResult<()> {
        Ok(())
    }

    fn read(&mut self, _reader: &mut MessageReader<'_>) -> CodecResult<()> {
        Ok(())
    }
}

#[test]
fn test_colliding_message_id_refused() {
    let (mut server, handle, pool) = started_server();
    let chats = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&chats);
    assert!(server.register_handler::<Chat, _>(move |_, _, _| *counter.borrow_mut() += 1));
    assert!(!server.register_handler::<Shout, _>(|_, _, _| panic!("decoded as the wrong type")));

    let id = handle.connect("127.0.0.1:4000");
    handle.deliver(
        id,
        &Chat {
            sender: 0,
            text: "hi".into(),
        },
    );
    server.update();
    assert_eq!(*chats.borrow(), 1);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_broadcast_reaches_every_connection() {
    let (mut server, handle, pool) = started_server();
    server.register_handler::<Chat, _>(|ctx, id, chat| {
        ctx.broadcast(&Chat {
            sender: id.0,
            text: chat.text.clone(),
        });
    });

    let ids: Vec<ConnectionId> = (0..3).map(|i| handle.connect(&format!("127.0.0.1:{}", 5000 + i))).collect();
    server.update();
    handle.deliver(
        ids[1],
        &Chat {
            sender: 99,
            text: "hi all".into(),
        },
    );
    server.update();

    let relayed = handle.sent_messages::<Chat>();
    assert_eq!(relayed.len(), 3);
    let targets: Vec<ConnectionId> = relayed.iter().map(|(id, _)| *id).collect();
    assert_eq!(targets, ids);
    assert!(relayed.iter().all(|(_, chat)| chat.sender == ids[1].0 && chat.text == "hi all"));

    assert_eq!(server.broadcast_to(&[ids[0], ConnectionId(77)], &ping(1)), 1);
    assert_eq!(pool.outstanding(), 0);
}

// ============================================================================
// CONNECTIONS AND OBSERVERS
// ============================================================================

#[test]
fn test_observers_fire_in_order_once() {
    let (mut server, handle, _pool) = started_server();
    let log = Rc::new(RefCell::new(Vec::new()));
    for tag in ["first", "second"] {
        let log = Rc::clone(&log);
        server.on_connected(move |connection| log.borrow_mut().push(format!("{tag} +{}", connection.id)));
    }
    let disconnect_log = Rc::clone(&log);
    server.on_disconnected(move |id| disconnect_log.borrow_mut().push(format!("-{id}")));

    let id = handle.connect("127.0.0.1:4000");
    server.update();
    assert_eq!(server.connection(id).map(|c| c.address.port()), Some(4000));

    handle.close(id);
    server.update();
    server.update();

    assert_eq!(*log.borrow(), vec!["first +#1", "second +#1", "-#1"]);
    assert!(server.connection(id).is_none());
}

#[test]
fn test_blacklisted_address_refused() {
    let (mut server, handle, _pool) = started_server();
    server.blacklist_mut().insert("10.0.0.9".parse().unwrap());
    let events = Rc::new(RefCell::new(0));
    let on_connect = Rc::clone(&events);
    server.on_connected(move |_| *on_connect.borrow_mut() += 1);
    let on_disconnect = Rc::clone(&events);
    server.on_disconnected(move |_| *on_disconnect.borrow_mut() += 1);

    let banned = handle.connect("10.0.0.9:5000");
    let allowed = handle.connect("10.0.0.10:5000");
    server.update();
    server.update();

    assert!(!handle.is_connected(banned));
    assert!(handle.is_connected(allowed));
    assert_eq!(server.connection_count(), 1);
    assert_eq!(*events.borrow(), 1);
}

#[test]
fn test_shutdown_reports_every_connection() {
    let (mut server, handle, _pool) = started_server();
    let closed = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&closed);
    server.on_disconnected(move |id| log.borrow_mut().push(id));

    let a = handle.connect("127.0.0.1:4000");
    let b = handle.connect("127.0.0.1:4001");
    server.update();
    server.shutdown();

    assert_eq!(*closed.borrow(), vec![a, b]);
    assert_eq!(server.state(), PeerState::Shutdown);
    assert!(!server.send(a, &ping(0)));
}

// ============================================================================
// RPC
// ============================================================================

#[test]
fn test_request_answered_with_same_serial() {
    let (mut server, handle, pool) = started_server();
    let mut served = 0;
    server.register_request_handler::<EchoRequest, EchoResponse, _>(move |_, _, request| {
        served += 1;
        EchoResponse {
            text: request.text.to_uppercase(),
            served,
        }
    });

    let id = handle.connect("127.0.0.1:4000");
    handle.request(id, 41, &EchoRequest { text: "abc".into() });
    handle.request(id, 42, &EchoRequest { text: "def".into() });
    server.update();

    let responses = handle.sent_rpc::<EchoResponse>(MessageId::RPC_RESPONSE);
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].1, RpcHeader { serial: 41, cookie: 0 });
    assert_eq!(responses[0].2.text, "ABC");
    assert_eq!(responses[1].1.serial, 42);
    assert_eq!(responses[1].2.served, 2);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_unanswered_request_sends_nothing() {
    let (mut server, handle, pool) = started_server();
    let id = handle.connect("127.0.0.1:4000");
    handle.request(id, 7, &EchoRequest { text: "lost".into() });
    server.update();

    assert!(handle.take_sent().is_empty());
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_call_resolves_with_response() {
    let (mut server, handle, _pool) = started_server();
    let id = handle.connect("127.0.0.1:4000");
    server.update();

    let mut call = server
        .call::<EchoRequest, EchoResponse>(id, &EchoRequest { text: "q".into() }, Duration::from_secs(5))
        .unwrap();
    let sent = handle.sent_rpc::<EchoRequest>(MessageId::RPC_REQUEST);
    assert_eq!(sent.len(), 1);
    let (to, header, request) = &sent[0];
    assert_eq!(*to, id);
    assert_eq!(header.serial, call.serial());
    assert_eq!(request.text, "q");
    assert!(call.try_outcome().is_none());

    handle.respond(
        id,
        *header,
        &EchoResponse {
            text: "a".into(),
            served: 1,
        },
    );
    server.update();

    let outcome = call.try_outcome().unwrap();
    assert_eq!(outcome.completed().map(|r| r.text), Some("a".to_string()));
    assert_eq!(server.pending_calls(), 0);
}

#[test]
fn test_call_times_out_and_late_response_dropped() {
    let (mut server, handle, pool) = started_server();
    let id = handle.connect("127.0.0.1:4000");
    server.update();

    let mut call = server
        .call::<EchoRequest, EchoResponse>(id, &EchoRequest::default(), Duration::from_millis(1))
        .unwrap();
    let header = handle.sent_rpc::<EchoRequest>(MessageId::RPC_REQUEST)[0].1;
    std::thread::sleep(Duration::from_millis(10));
    server.update();
    assert_eq!(call.try_outcome(), Some(CallOutcome::Timeout));

    handle.respond(id, header, &EchoResponse::default());
    server.update();
    assert_eq!(server.pending_calls(), 0);
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_disconnect_fails_pending_call() {
    let (mut server, handle, _pool) = started_server();
    let id = handle.connect("127.0.0.1:4000");
    server.update();

    let mut call = server
        .call::<EchoRequest, EchoResponse>(id, &EchoRequest::default(), Duration::from_secs(5))
        .unwrap();
    handle.close(id);
    server.update();

    assert_eq!(call.try_outcome(), Some(CallOutcome::Disconnected));
    assert!(server.call::<EchoRequest, EchoResponse>(id, &EchoRequest::default(), Duration::from_secs(5)).is_none());
}

#[test]
fn test_call_many_collects_per_target() {
    let (mut server, handle, _pool) = started_server();
    let a = handle.connect("127.0.0.1:4000");
    let b = handle.connect("127.0.0.1:4001");
    let c = handle.connect("127.0.0.1:4002");
    server.update();

    let mut call = server
        .call_many::<EchoRequest, EchoResponse>(&[a, b, c], &EchoRequest { text: "all".into() }, Duration::from_secs(5))
        .unwrap();
    assert_eq!(call.targets(), &[a, b, c]);

    let sent = handle.sent_rpc::<EchoRequest>(MessageId::RPC_REQUEST);
    assert_eq!(sent.len(), 3);
    for (to, header, _) in &sent {
        assert_eq!(header.serial, call.serial());
        assert_eq!(header.cookie, to.0);
    }

    handle.respond(
        a,
        sent[0].1,
        &EchoResponse {
            text: "from a".into(),
            served: 1,
        },
    );
    handle.close(b);
    handle.respond(
        c,
        sent[2].1,
        &EchoResponse {
            text: "from c".into(),
            served: 1,
        },
    );
    server.update();

    let results = call.try_outcome().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].0, a);
    assert!(matches!(&results[0].1, CallOutcome::Completed(r) if r.text == "from a"));
    assert_eq!(results[1], (b, CallOutcome::Disconnected));
    assert!(matches!(&results[2].1, CallOutcome::Completed(r) if r.text == "from c"));
}

#[test]
fn test_response_from_other_connection_ignored() {
    let (mut server, handle, pool) = started_server();
    let victim = handle.connect("127.0.0.1:4000");
    let intruder = handle.connect("127.0.0.1:4001");
    server.update();

    let mut call = server
        .call::<EchoRequest, EchoResponse>(victim, &EchoRequest { text: "q".into() }, Duration::from_secs(5))
        .unwrap();
    let header = handle.sent_rpc::<EchoRequest>(MessageId::RPC_REQUEST)[0].1;

    handle.respond(
        intruder,
        header,
        &EchoResponse {
            text: "forged".into(),
            served: 0,
        },
    );
    server.update();
    assert!(call.try_outcome().is_none());
    assert_eq!(server.pending_calls(), 1);

    handle.respond(
        victim,
        header,
        &EchoResponse {
            text: "real".into(),
            served: 1,
        },
    );
    server.update();
    let outcome = call.try_outcome().unwrap();
    assert_eq!(outcome.completed().map(|r| r.text), Some("real".to_string()));
    assert_eq!(pool.outstanding(), 0);
}

#[test]
fn test_fan_out_part_cannot_be_answered_by_another_target() {
    let (mut server, handle, _pool) = started_server();
    let a = handle.connect("127.0.0.1:4000");
    let b = handle.connect("127.0.0.1:4001");
    server.update();

    let mut call = server
        .call_many::<EchoRequest, EchoResponse>(&[a, b], &EchoRequest::default(), Duration::from_secs(5))
        .unwrap();
    let sent = handle.sent_rpc::<EchoRequest>(MessageId::RPC_REQUEST);

    // `b` replays `a`'s header, then answers its own.
    handle.respond(b, sent[0].1, &EchoResponse { text: "forged".into(), served: 0 });
    handle.respond(b, sent[1].1, &EchoResponse { text: "from b".into(), served: 1 });
    server.update();
    assert!(call.try_outcome().is_none());

    handle.respond(a, sent[0].1, &EchoResponse { text: "from a".into(), served: 1 });
    server.update();
    let results = call.try_outcome().unwrap();
    assert!(matches!(&results[0].1, CallOutcome::Completed(r) if r.text == "from a"));
    assert!(matches!(&results[1].1, CallOutcome::Completed(r) if r.text == "from b"));
}
