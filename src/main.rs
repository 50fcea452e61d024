//! Service tunnel (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!   client process                                   relay server
//!  ┌──────────────────────┐                       ┌──────────────────────────┐
//!  │ Service ("chat")     │                       │ net::Server (accept loop)│
//!  │   │ broadcast        │                       │   │ one remote Tunnel    │
//!  │   ▼                  │   WS / HTTP frames    │   ▼ per connection       │
//!  │ Tunnel (client) ─────┼──────────────────────▶│ Tunnel (remote) ─ relay  │
//!  │   │ Socket + codec   │◀──────────────────────┼── Service ("chat")       │
//!  └──────────────────────┘                       │   │ BroadcastRegistry    │
//!                                                 │   ▼ fan-out to others    │
//!                                                 └──────────────────────────┘
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use service_tunnel::config::{load_config, Config};
use service_tunnel::lifecycle::{wait_for_signal, Shutdown};
use service_tunnel::observability::{logging, metrics};
use service_tunnel::{relay, Role, Server, Service, Tunnel, Value};

#[derive(Parser)]
#[command(name = "service-tunnel")]
#[command(about = "Service multiplexing over WebSocket or HTTP framing", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve,
    /// Plug a client service, broadcast stdin lines and print what arrives
    Connect {
        #[arg(short, long, default_value = "chat")]
        service: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    logging::init(&config.observability.log_level);

    tracing::info!(
        host = %config.tunnel.host,
        port = config.tunnel.port,
        transport = ?config.tunnel.transport,
        codec = ?config.tunnel.codec,
        "service-tunnel v0.1.0 starting"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match cli.command {
        Commands::Serve => serve(&config).await?,
        Commands::Connect { service } => connect(&config, service).await,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::bind(config).await?;
    tracing::info!(address = %server.local_addr()?, "Relay listening");

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    server
        .run(
            |tunnel| {
                relay::serve_relay(tunnel);
            },
            shutdown.subscribe(),
        )
        .await?;
    Ok(())
}

async fn connect(config: &Config, id: String) {
    let tunnel = Tunnel::new(config.tunnel.clone(), Role::Client);
    let service = Service::new(id, &tunnel, Role::Client);

    for event in ["broadcast", "multicast"] {
        service.on(event, |message| {
            let from = message.origin().unwrap_or("?");
            println!("[{}] {}", from, message.value);
        });
    }

    // services are dropped on every disconnect, so plug again on each connect
    let weak = tunnel.downgrade();
    let plug = service.clone();
    tunnel.events().connect.bind(move |_| {
        if let Some(tunnel) = weak.upgrade() {
            tunnel.add_service(&plug);
        }
    });
    tunnel.events().error.bind(|error| {
        eprintln!("tunnel error: {}", error);
    });

    tunnel.connect(None);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = Shutdown::new();
    let mut stop = shutdown.subscribe();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    if !service.broadcast(Value::from(line), None) {
                        eprintln!("not connected; line dropped");
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            },
            _ = stop.recv() => break,
        }
    }

    tunnel.disconnect();
}
