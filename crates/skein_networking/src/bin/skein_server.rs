//! # SKEIN Demo Server
//!
//! Answers pings, serves echo requests and relays chat to every client.
//!
//! ## Usage
//!
//! ```bash
//! skein_server --config skein.toml --protocol stream --port 7777
//! ```

use std::time::Instant;

use skein_networking::{NetSettings, Protocol, Server, TickLoop};
use skein_shared::{Chat, EchoRequest, EchoResponse, Ping, Pong};
use tracing::Level;

fn main() {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║         SKEIN SERVER                                             ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let args: Vec<String> = std::env::args().collect();
    let mut config_path: Option<String> = None;
    let mut protocol: Option<Protocol> = None;
    let mut port: Option<u16> = None;
    let mut max_clients: Option<usize> = None;
    let mut duration_secs: Option<u64> = None;
    let mut level = Level::INFO;

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1);
        match args[i].as_str() {
            "--config" | "-c" => {
                config_path = value.cloned();
                i += 1;
            }
            "--protocol" => {
                protocol = value.and_then(|v| v.parse().ok());
                i += 1;
            }
            "--port" | "-p" => {
                port = value.and_then(|v| v.parse().ok());
                i += 1;
            }
            "--max-clients" | "-m" => {
                max_clients = value.and_then(|v| v.parse().ok());
                i += 1;
            }
            "--duration" | "-d" => {
                duration_secs = value.and_then(|v| v.parse().ok());
                i += 1;
            }
            "--verbose" | "-v" => level = Level::DEBUG,
            "--help" | "-h" => {
                println!("Usage: skein_server [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>        Settings file (TOML)");
                println!("      --protocol <NAME>      reliable | stream | websocket");
                println!("  -p, --port <PORT>          Port to bind (default: 7777)");
                println!("  -m, --max-clients <NUM>    Maximum clients (default: 100)");
                println!("  -d, --duration <SECS>      Run for N seconds then exit");
                println!("  -v, --verbose              Debug logging");
                println!("  -h, --help                 Show this help");
                return;
            }
            _ => {}
        }
        i += 1;
    }

    let _ = tracing_subscriber::fmt().with_max_level(level).try_init();

    let mut settings = match config_path {
        Some(path) => match NetSettings::load(&path) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("Failed to load {path}: {err}");
                std::process::exit(1);
            }
        },
        None => NetSettings::default(),
    };
    if let Some(protocol) = protocol {
        settings.protocol = protocol;
    }
    if let Some(port) = port {
        settings.port = port;
    }
    if let Some(max_clients) = max_clients {
        settings.max_clients = max_clients;
    }

    println!("┌─ CONFIGURATION ─────────────────────────────────────────────────┐");
    println!("│ Protocol:           {}", settings.protocol);
    println!("│ Bind Address:       {}:{}", settings.bind_address(), settings.port);
    println!("│ Tick Interval:      {} ms", settings.tick_interval_ms);
    println!("│ Max Clients:        {}", settings.max_clients);
    match duration_secs {
        Some(d) => println!("│ Duration:           {d} seconds"),
        None => println!("│ Duration:           infinite"),
    }
    println!("└──────────────────────────────────────────────────────────────────┘");
    println!();

    let mut server = Server::new(settings.clone());
    server.register_handler::<Ping, _>(|ctx, id, ping| {
        ctx.send(id, &Pong::answer(ping));
    });
    server.register_handler::<Chat, _>(|ctx, id, chat| {
        let stamped = Chat {
            sender: id.0,
            text: chat.text.clone(),
        };
        ctx.broadcast(&stamped);
    });
    let mut served = 0u32;
    server.register_request_handler::<EchoRequest, EchoResponse, _>(move |_, _, request| {
        served += 1;
        EchoResponse {
            text: request.text.clone(),
            served,
        }
    });
    server.on_connected(|connection| println!("+ {} from {}", connection.id, connection.address));
    server.on_disconnected(|id| println!("- {id}"));

    if !server.start_with(&settings) {
        eprintln!("Server failed to start");
        std::process::exit(1);
    }

    let start = Instant::now();
    let mut tick_loop = TickLoop::from_settings(&settings);
    let stats_interval = (5_000 / settings.tick_interval_ms.max(1)).max(1);

    tick_loop.run(|tick| {
        server.update();

        if tick % stats_interval == 0 {
            println!("┌─ SERVER STATUS (Tick {tick}) ────────────────────────────────────");
            println!("│ Uptime:             {:.1}s", start.elapsed().as_secs_f64());
            println!("│ Clients:            {}", server.connection_count());
            println!("│ Pending Calls:      {}", server.pending_calls());
            println!("│ Buffers Out:        {}", server.pool().outstanding());
            println!("└──────────────────────────────────────────────────────────────────");
            println!();
        }

        duration_secs.map_or(true, |d| start.elapsed().as_secs() < d)
    });

    server.shutdown();

    let stats = tick_loop.stats();
    println!();
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                    SERVER SHUTDOWN                               ║");
    println!("╠══════════════════════════════════════════════════════════════════╣");
    println!("║ Total Ticks:        {:>10}                                   ║", stats.total_ticks);
    println!("║ Avg Tick Time:      {:>10} μs                                ║", stats.avg_tick_us);
    println!("║ Max Tick Time:      {:>10} μs                                ║", stats.max_tick_us);
    println!("║ Late Ticks:         {:>10} ({:.2}%)                          ║", stats.late_ticks, stats.late_percent());
    println!("╚══════════════════════════════════════════════════════════════════╝");
}
