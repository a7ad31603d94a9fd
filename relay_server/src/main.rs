//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p relay_server -- [--addr 127.0.0.1:40001] [--map-size 64]
//!                                [--layout compact|legacy] [--queue 64] [--config relay.json]
//!
//! The server accepts WebSocket clients and relays entity updates between
//! them.
//!
//! Console commands:
//!   status                                     - Show server status
//!   roster                                     - List entities
//!   login <entity> <identity> <#rrggbb> <name> - Link an external identity
//!   quit                                       - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use relay_server::generate::{PhraseBook, Silent, TextGenerator};
use relay_server::server::RelayServer;
use relay_shared::config::RelayConfig;
use tokio::sync::mpsc;
use tracing::{info, warn};

fn parse_args() -> anyhow::Result<RelayConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => RelayConfig::load(&args[i + 1])?,
        _ => RelayConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
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
            "--queue" if i + 1 < args.len() => {
                cfg.outbound_queue = args[i + 1].parse().unwrap_or(cfg.outbound_queue);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args().context("parse arguments")?;
    info!(
        addr = %cfg.server_addr,
        map_size = cfg.map_size,
        layout = ?cfg.layout,
        "Starting server"
    );

    let phrases = PhraseBook::new(cfg.phrases.clone());
    let generator: Arc<dyn TextGenerator> = if phrases.is_empty() {
        warn!("No phrases configured, generated chat is disabled");
        Arc::new(Silent)
    } else {
        Arc::new(phrases)
    };

    let server = Arc::new(
        RelayServer::bind(cfg, generator)
            .await
            .context("create server")?,
    );
    let local = server.local_addr()?;
    info!(%local, "Server listening");

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

    println!("Server ready. Type 'status' for info, 'roster' for entities, 'quit' to exit.");
    println!();

    let mut runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    loop {
        tokio::select! {
            result = &mut runner => {
                result.context("server task")??;
                break;
            }
            Some(line) = console_rx.recv() => {
                match server.exec_console(&line).await {
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
        }
    }

    Ok(())
}
