//! Helpers shared by the socket-level tests.
//!
//! [`RelayHarness`] runs a real relay on an ephemeral port. [`RawPeer`] speaks
//! the wire protocol directly so tests can observe exactly what the relay
//! sends, while `GameClient` covers the full client stack.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use relay_client::GameClient;
use relay_server::generate::TextGenerator;
use relay_server::server::{bind_ephemeral, RelayServer};
use relay_shared::{
    config::RelayConfig,
    entity::{EntityId, RemoteEntity},
    map::SparseMap,
    net::{Frame, Inbound, WireCodec},
};
use tokio::{net::TcpStream, task::JoinHandle, time::Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

/// How long a test waits for something that should happen.
pub const SETTLE: Duration = Duration::from_secs(3);

/// How long a test waits to conclude that nothing arrives.
pub const QUIET: Duration = Duration::from_millis(150);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A relay accepting connections in a background task.
pub struct RelayHarness {
    pub server: Arc<RelayServer>,
    pub cfg: RelayConfig,
    runner: JoinHandle<anyhow::Result<()>>,
}

impl RelayHarness {
    /// Relay with default configuration on an ephemeral port.
    pub async fn start(generator: Arc<dyn TextGenerator>) -> anyhow::Result<Self> {
        let (server, cfg) = bind_ephemeral(generator).await?;
        Ok(Self::spawn(server, cfg))
    }

    /// Relay with `cfg` on an ephemeral port.
    pub async fn start_with(
        mut cfg: RelayConfig,
        generator: Arc<dyn TextGenerator>,
    ) -> anyhow::Result<Self> {
        cfg.server_addr = "127.0.0.1:0".to_string();
        let mut server = RelayServer::bind(cfg, generator).await?;
        server.cfg.server_addr = server.local_addr()?.to_string();
        let cfg = server.cfg.clone();
        Ok(Self::spawn(server, cfg))
    }

    fn spawn(server: RelayServer, cfg: RelayConfig) -> Self {
        let server = Arc::new(server);
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        Self {
            server,
            cfg,
            runner,
        }
    }

    pub fn codec(&self) -> WireCodec {
        self.cfg.codec()
    }

    /// Signals shutdown and waits for the accept loop to end.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.server.shutdown();
        tokio::time::timeout(SETTLE, self.runner)
            .await
            .context("accept loop did not stop")???;
        Ok(())
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A WebSocket peer that sends and receives raw protocol frames.
pub struct RawPeer {
    socket: Socket,
    codec: WireCodec,
}

impl RawPeer {
    pub async fn connect(cfg: &RelayConfig) -> anyhow::Result<Self> {
        let url = format!("ws://{}", cfg.server_addr);
        let (socket, _) = connect_async(url.as_str()).await.context("connect")?;
        Ok(Self {
            socket,
            codec: cfg.codec(),
        })
    }

    /// Connects and announces `id`, consuming the join snapshot.
    pub async fn join(cfg: &RelayConfig, id: u16) -> anyhow::Result<Self> {
        let mut peer = Self::connect(cfg).await?;
        peer.send(&Frame::Load { id: EntityId(id) }).await?;
        let roster = peer.expect_roster().await?;
        anyhow::ensure!(
            roster.iter().any(|e| e.id == EntityId(id)),
            "join snapshot is missing entity {id}"
        );
        Ok(peer)
    }

    pub async fn send(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.send_raw(Message::Binary(bytes.to_vec())).await
    }

    pub async fn send_raw(&mut self, msg: Message) -> anyhow::Result<()> {
        self.socket.send(msg).await.context("send")
    }

    /// Next decoded message, skipping control frames.
    pub async fn recv(&mut self) -> anyhow::Result<Inbound> {
        let deadline = Instant::now() + SETTLE;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.socket.next())
                .await
                .context("timed out waiting for a message")?
                .context("socket closed")??;
            match msg {
                Message::Text(text) => return Ok(self.codec.decode_text(&text)?),
                Message::Binary(data) => return Ok(self.codec.decode_binary(&data)?),
                Message::Close(_) => anyhow::bail!("socket closed"),
                _ => continue,
            }
        }
    }

    pub async fn expect_roster(&mut self) -> anyhow::Result<Vec<RemoteEntity>> {
        match self.recv().await? {
            Inbound::Roster(clients) => Ok(clients),
            Inbound::Delta(frame) => anyhow::bail!("expected roster, got {frame:?}"),
        }
    }

    pub async fn expect_delta(&mut self) -> anyhow::Result<Frame> {
        match self.recv().await? {
            Inbound::Delta(frame) => Ok(frame),
            Inbound::Roster(clients) => anyhow::bail!("expected delta, got roster {clients:?}"),
        }
    }

    /// Fails if anything but control frames arrives within [`QUIET`].
    pub async fn expect_silence(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + QUIET;
        loop {
            match tokio::time::timeout_at(deadline, self.socket.next()).await {
                Err(_) => return Ok(()),
                Ok(Some(Ok(Message::Text(_) | Message::Binary(_)))) => {
                    anyhow::bail!("unexpected message")
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => anyhow::bail!("socket closed"),
            }
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.socket.close(None).await.context("close")
    }
}

/// Sorted ids of a roster snapshot.
pub fn roster_ids(roster: &[RemoteEntity]) -> Vec<u16> {
    let mut ids: Vec<u16> = roster.iter().map(|e| e.id.0).collect();
    ids.sort_unstable();
    ids
}

/// 8×8 open field: Ground everywhere, a row of Spawn tiles, two Channel
/// tiles and one Exit.
pub fn open_field() -> anyhow::Result<SparseMap> {
    let mut grid = [1u8; 64];
    for cell in &mut grid[24..32] {
        *cell = 3;
    }
    grid[0] = 4;
    grid[7] = 4;
    grid[63] = 5;
    Ok(SparseMap::author(8, &grid)?)
}

/// Ticks both clients until `done` holds.
pub async fn tick_until<F>(a: &mut GameClient, b: &mut GameClient, done: F) -> anyhow::Result<()>
where
    F: Fn(&GameClient, &GameClient) -> bool,
{
    let deadline = Instant::now() + SETTLE;
    loop {
        a.tick().await?;
        b.tick().await?;
        if done(a, b) {
            return Ok(());
        }
        anyhow::ensure!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Ticks one client until `done` holds.
pub async fn tick_one_until<F>(client: &mut GameClient, done: F) -> anyhow::Result<()>
where
    F: Fn(&GameClient) -> bool,
{
    let deadline = Instant::now() + SETTLE;
    loop {
        client.tick().await?;
        if done(client) {
            return Ok(());
        }
        anyhow::ensure!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
