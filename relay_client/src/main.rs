//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p relay_client -- [--addr 127.0.0.1:40001] [--id 7] [--maps-dir maps]
//!                                [--layout compact|legacy] [--config relay.json]
//!
//! The client connects to the relay, places its entity on a spawn tile and
//! mirrors everyone else in its scene.
//!
//! Console commands:
//!   status                       - Show client status
//!   who                          - List visible entities
//!   links                        - List scene links on this map
//!   move <up|down|left|right>    - Step one tile
//!   use                          - Travel through the link or exit underfoot
//!   scene <name>                 - Change scene
//!   say <message>                - Send chat message
//!   generate                     - Ask the relay for a generated line
//!   quit                         - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use relay_client::client::{ClientState, GameClient};
use relay_client::sync::SyncEvent;
use relay_shared::config::RelayConfig;
use relay_shared::entity::EntityId;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<(RelayConfig, EntityId)> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => RelayConfig::load(&args[i + 1])?,
        _ => RelayConfig::default(),
    };
    let mut id = EntityId(rand::thread_rng().gen());

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--id" if i + 1 < args.len() => {
                id = EntityId(args[i + 1].parse().context("parse --id")?);
                i += 2;
            }
            "--maps-dir" if i + 1 < args.len() => {
                cfg.maps_dir = args[i + 1].clone();
                i += 2;
            }
            "--map-size" if i + 1 < args.len() => {
                cfg.map_size = args[i + 1].parse().unwrap_or(cfg.map_size);
                i += 2;
            }
            "--layout" if i + 1 < args.len() => {
                cfg.layout = args[i + 1].parse().context("parse --layout")?;
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(cfg.tick_hz);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok((cfg, id))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (cfg, id) = parse_args().context("parse arguments")?;
    info!(server = %cfg.server_addr, entity = %id, maps_dir = %cfg.maps_dir, "Starting client");

    let mut client = GameClient::connect(&cfg, id).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32);
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => {
                    println!("Error: {}", e);
                }
            }
        }

        for event in client.tick().await? {
            match event {
                SyncEvent::Joined(id) => info!(entity = %id, "Entity joined"),
                SyncEvent::Left(id) => info!(entity = %id, "Entity left"),
                SyncEvent::LocalPlacementRequired => {}
            }
        }

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    client.close().await
}
