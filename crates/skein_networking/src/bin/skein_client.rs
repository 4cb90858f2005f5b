//! # SKEIN Demo Client
//!
//! Connects to a `skein_server`, sends pings, issues one echo request and
//! prints round-trip times.
//!
//! ## Usage
//!
//! ```bash
//! skein_client --protocol stream --address 127.0.0.1 --port 7777 --pings 10
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use skein_networking::{CallOutcome, Client, NetSettings, PendingCall, Protocol, TickLoop};
use skein_shared::{EchoRequest, EchoResponse, Ping, Pong};
use tracing::Level;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let mut settings = NetSettings::default();
    let mut pings = 10u32;
    let mut level = Level::INFO;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                if let Some(path) = value {
                    match NetSettings::load(path) {
                        Ok(loaded) => settings = loaded,
                        Err(err) => {
                            eprintln!("Failed to load {path}: {err}");
                            std::process::exit(1);
                        }
                    }
                }
                i += 1;
            }
            "--protocol" => {
                if let Some(protocol) = value.and_then(|v| v.parse::<Protocol>().ok()) {
                    settings.protocol = protocol;
                }
                i += 1;
            }
            "--address" | "-a" => {
                if let Some(address) = value {
                    settings.address.clone_from(address);
                }
                i += 1;
            }
            "--port" | "-p" => {
                if let Some(port) = value.and_then(|v| v.parse().ok()) {
                    settings.port = port;
                }
                i += 1;
            }
            "--pings" | "-n" => {
                pings = value.and_then(|v| v.parse().ok()).unwrap_or(pings);
                i += 1;
            }
            "--verbose" | "-v" => level = Level::DEBUG,
            "--help" | "-h" => {
                println!("Usage: skein_client [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>        Settings file (TOML)");
                println!("      --protocol <NAME>      reliable | stream | websocket");
                println!("  -a, --address <HOST>       Server address (default: 127.0.0.1)");
                println!("  -p, --port <PORT>          Server port (default: 7777)");
                println!("  -n, --pings <NUM>          Pings to send (default: 10)");
                println!("  -v, --verbose              Debug logging");
                println!("  -h, --help                 Show this help");
                return;
            }
            _ => {}
        }
        i += 1;
    }

    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();

    let mut client = Client::new(settings.clone());
    let pongs = Rc::new(Cell::new(0u32));
    let total_rtt_us = Rc::new(Cell::new(0u64));
    {
        let pongs = Rc::clone(&pongs);
        let total_rtt_us = Rc::clone(&total_rtt_us);
        client.register_handler::<Pong, _>(move |_, pong| {
            let rtt = now_micros().saturating_sub(pong.sent_at_micros);
            pongs.set(pongs.get() + 1);
            total_rtt_us.set(total_rtt_us.get() + rtt);
            println!("pong #{:<4} {:>8} μs", pong.sequence, rtt);
        });
    }
    let lost = Rc::new(Cell::new(false));
    {
        let lost = Rc::clone(&lost);
        client.on_disconnected(move || lost.set(true));
    }
    client.on_connected(|connection| println!("connected to {}", connection.address));

    if !client.start_with(&settings) {
        eprintln!("Client failed to start");
        std::process::exit(1);
    }

    let deadline = Instant::now() + settings.connect_timeout() + Duration::from_secs(u64::from(pings) + 5);
    let mut tick_loop = TickLoop::from_settings(&settings);
    let mut echo: Option<PendingCall<EchoResponse>> = None;
    let mut echoed = false;
    let mut sent = 0u32;
    let mut last_ping: Option<Instant> = None;

    tick_loop.run(|_| {
        client.update();
        if lost.get() || Instant::now() >= deadline {
            return false;
        }
        if !client.is_connected() {
            return client.state().is_active();
        }

        if sent < pings && last_ping.map_or(true, |at| at.elapsed() >= Duration::from_secs(1)) {
            let ping = Ping {
                sent_at_micros: now_micros(),
                sequence: sent,
                _pad: 0,
            };
            if client.send(&ping) {
                sent += 1;
                last_ping = Some(Instant::now());
            }
        }

        if echo.is_none() && !echoed {
            let request = EchoRequest {
                text: "hello from skein".into(),
            };
            echo = client.call(&request, settings.rpc_timeout());
        }
        if let Some(outcome) = echo.as_mut().and_then(PendingCall::try_outcome) {
            match outcome {
                CallOutcome::Completed(response) => {
                    println!("echo: \"{}\" (served {})", response.text, response.served);
                }
                other => println!("echo failed: {other:?}"),
            }
            echo = None;
            echoed = true;
        }

        !(echoed && pongs.get() >= pings)
    });

    let received = pongs.get();
    println!();
    println!("┌─ SUMMARY ───────────────────────────────────────────────────────┐");
    println!("│ Pings Sent:         {sent}");
    println!("│ Pongs Received:     {received}");
    if received > 0 {
        println!("│ Avg Ping RTT:       {} μs", total_rtt_us.get() / u64::from(received));
    }
    println!("│ Wire RTT:           {} ms", client.round_trip_time());
    println!("└──────────────────────────────────────────────────────────────────┘");

    client.shutdown();
}
