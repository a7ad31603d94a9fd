//! Server implementation.
//!
//! A WebSocket relay. Each accepted socket gets its own task pair:
//! - a reader that decodes frames and drives its [`RelayConnection`]
//! - a writer that drains the connection's bounded outbound queue
//!
//! The relay keeps no simulation of its own. It stores the last known state
//! of every entity so late joiners get a full roster, and fans deltas out to
//! everyone else.
//!
//! Console commands:
//!   status                                    - Show connection counts
//!   roster                                    - List entities
//!   login <entity> <identity> <#rrggbb> <name> - Link an external identity
//!   quit                                      - Shutdown server

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use relay_shared::{
    config::RelayConfig,
    entity::{EntityId, Rgb},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::connection::RelayConnection;
use crate::generate::TextGenerator;
use crate::registry::{ConnectionRegistry, IdentityClaim, IdentityId, Outbound};

/// Relay server.
pub struct RelayServer {
    pub cfg: RelayConfig,
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    generator: Arc<dyn TextGenerator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Binds the listener at `cfg.server_addr`.
    pub async fn bind(cfg: RelayConfig, generator: Arc<dyn TextGenerator>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new(cfg.codec())),
            cfg,
            listener,
            generator,
            shutdown_tx,
        })
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accepts connections until [`RelayServer::shutdown`] is called.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!(%addr, "New connection");
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let registry = self.registry.clone();
        let generator = self.generator.clone();
        let queue = self.cfg.outbound_queue.max(1);
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(serve_socket(
            stream,
            addr,
            registry,
            generator,
            queue,
            shutdown_rx,
        ));
    }

    /// Stops the accept loop and closes every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Executes a console command.
    pub async fn exec_console(&self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let roster = self.registry.roster().await;
                Ok(vec![
                    format!("Listening: {}", self.local_addr()?),
                    format!("Layout: {:?}", self.cfg.layout),
                    format!("Connections: {}", self.registry.connection_count().await),
                    format!("Entities: {}", roster.len()),
                ])
            }
            "roster" => {
                let roster = self.registry.roster().await;
                if roster.is_empty() {
                    return Ok(vec!["No entities".to_string()]);
                }
                Ok(roster
                    .iter()
                    .map(|e| {
                        format!(
                            "  #{} {:?} scene={} pos=({}, {}) color={}",
                            e.id, e.display_name, e.scene, e.x, e.y, e.color
                        )
                    })
                    .collect())
            }
            "login" => {
                if tokens.len() < 5 {
                    return Ok(vec![
                        "Usage: login <entity> <identity> <#rrggbb> <name>".to_string()
                    ]);
                }
                let entity: u16 = tokens[1]
                    .parse()
                    .with_context(|| format!("invalid entity id {}", tokens[1]))?;
                let color: Rgb = tokens[3].parse()?;
                let claim = IdentityClaim {
                    identity: IdentityId(tokens[2].to_string()),
                    display_name: tokens[4..].join(" "),
                    color,
                };
                if self.registry.link_identity(EntityId(entity), claim).await {
                    Ok(vec![format!("Linked entity #{entity}")])
                } else {
                    Ok(vec![format!("No entity #{entity}")])
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.shutdown();
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

async fn serve_socket(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    generator: Arc<dyn TextGenerator>,
    queue: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(queue);
    let mut conn = RelayConnection::open(registry, generator, out_tx).await;
    info!(%addr, conn = ?conn.id(), "Client connected");

    let sender_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let msg = match msg {
                Outbound::Roster(text) => Message::Text(text),
                Outbound::Delta(bytes) => Message::Binary(bytes.to_vec()),
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => conn.on_binary(&data).await,
                    Some(Ok(Message::Text(text))) => conn.on_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(%addr, "Client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(%addr, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    conn.close().await;
    sender_task.abort();
    info!(%addr, conn = ?conn.id(), "Client removed");
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(
    generator: Arc<dyn TextGenerator>,
) -> anyhow::Result<(RelayServer, RelayConfig)> {
    let cfg = RelayConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        ..Default::default()
    };
    let mut server = RelayServer::bind(cfg, generator).await?;
    server.cfg.server_addr = server.local_addr()?.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
