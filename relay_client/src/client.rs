//! Client implementation.
//!
//! The client maintains:
//! - One WebSocket to the relay, split into a reader and a writer task
//! - A buffered inbound queue, applied only between ticks
//! - The roster mirror and its interpolator
//! - Lazily loaded scene maps and the scene links placed on them
//! - Console for user commands

use std::collections::{hash_map::Entry, HashMap};
use std::path::Path;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use relay_shared::{
    chat::{truncate_message, ChatBody},
    config::RelayConfig,
    entity::EntityId,
    map::{SparseMap, Tile},
    net::{Frame, Inbound, WireCodec},
    scene::{link_at, SceneDirectory, SceneLink},
};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    input::{try_step, Direction},
    interp::MovementInterpolator,
    sync::{ClientSyncModel, SyncEvent},
};

/// Inbound messages buffered between ticks.
const INBOUND_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 64;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    Disconnected,
}

/// High-level game client.
pub struct GameClient {
    pub cfg: RelayConfig,
    pub state: ClientState,
    pub model: ClientSyncModel,

    codec: WireCodec,
    interp: MovementInterpolator,
    directory: SceneDirectory,
    maps: HashMap<String, SparseMap>,
    links: Vec<SceneLink>,
    tick: u64,

    inbound_rx: mpsc::Receiver<Inbound>,
    outbound_tx: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// WebSocket URL for a configured server address.
pub fn ws_url(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{addr}")
    }
}

fn load_map<'a>(
    maps: &'a mut HashMap<String, SparseMap>,
    cfg: &RelayConfig,
    scene: &str,
) -> anyhow::Result<&'a SparseMap> {
    match maps.entry(scene.to_string()) {
        Entry::Occupied(e) => Ok(&*e.into_mut()),
        Entry::Vacant(e) => {
            let path = Path::new(&cfg.maps_dir).join(format!("{scene}.map"));
            let map = SparseMap::load(&path, cfg.map_size)?;
            info!(scene, path = %path.display(), "Map loaded");
            Ok(&*e.insert(map))
        }
    }
}

impl GameClient {
    /// Connects to the relay and announces entity `id`.
    pub async fn connect(cfg: &RelayConfig, id: EntityId) -> anyhow::Result<Self> {
        let url = ws_url(&cfg.server_addr);
        info!(server = %url, entity = %id, "Connecting to server");

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("websocket connect {url}"))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let codec = cfg.codec();
        let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(INBOUND_QUEUE);
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                let decoded = match msg {
                    Ok(Message::Text(text)) => codec.decode_text(&text),
                    Ok(Message::Binary(data)) => codec.decode_binary(&data),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "WebSocket error");
                        break;
                    }
                };
                match decoded {
                    Ok(inbound) => {
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(error = %e, "Dropping malformed frame"),
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let client = Self {
            model: ClientSyncModel::new(id, cfg.home_scene.clone()),
            directory: cfg.scene_directory(),
            cfg: cfg.clone(),
            state: ClientState::Connected,
            codec,
            interp: MovementInterpolator::default(),
            maps: HashMap::new(),
            links: Vec::new(),
            tick: 0,
            inbound_rx,
            outbound_tx,
            reader,
            writer,
        };
        client.send(&Frame::Load { id }).await?;

        info!(entity = %id, "Connected to server");
        Ok(client)
    }

    /// Provides the map of `scene` instead of reading it from `maps_dir`.
    pub fn insert_map(&mut self, scene: impl Into<String>, map: SparseMap) {
        self.maps.insert(scene.into(), map);
    }

    pub fn links(&self) -> &[SceneLink] {
        &self.links
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub async fn send(&self, frame: &Frame) -> anyhow::Result<()> {
        let bytes = self.codec.encode(frame).context("encode frame")?;
        self.outbound_tx
            .send(Message::Binary(bytes.to_vec()))
            .await
            .context("connection closed")
    }

    /// Applies everything received since the last tick, places the local
    /// entity if needed and advances interpolation.
    pub async fn tick(&mut self) -> anyhow::Result<Vec<SyncEvent>> {
        let mut events = Vec::new();
        loop {
            match self.inbound_rx.try_recv() {
                Ok(inbound) => events.extend(self.model.apply(inbound)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.state == ClientState::Connected {
                        info!("Disconnected from server");
                    }
                    self.state = ClientState::Disconnected;
                    break;
                }
            }
        }

        if events.contains(&SyncEvent::LocalPlacementRequired) {
            self.place_local().await?;
        }

        self.interp.tick(&mut self.model);
        self.tick += 1;
        Ok(events)
    }

    /// Puts the local entity on a random spawn tile of its scene and tells
    /// the relay.
    async fn place_local(&mut self) -> anyhow::Result<()> {
        let scene = self.model.scene().to_string();
        let ((x, y), links) = {
            let map = load_map(&mut self.maps, &self.cfg, &scene)?;
            let mut rng = rand::thread_rng();
            let spawn = map
                .random_spawn(&mut rng)
                .with_context(|| format!("scene {scene} has no spawn tiles"))?;
            (spawn, self.directory.place_links(map, &scene, &mut rng))
        };

        if !self.model.place_local(x, y) {
            warn!("Placement requested before the local entity exists");
            return Ok(());
        }
        self.links = links;

        let id = self.model.local_id();
        self.send(&Frame::Move { id, x, y }).await?;
        info!(scene = %scene, x, y, "Local entity placed");
        Ok(())
    }

    /// Leaves the current scene for `scene` and respawns there.
    pub async fn change_scene(&mut self, scene: &str) -> anyhow::Result<()> {
        anyhow::ensure!(self.directory.contains(scene), "unknown scene {scene}");
        load_map(&mut self.maps, &self.cfg, scene)?;

        self.model.set_scene(scene);
        let id = self.model.local_id();
        self.send(&Frame::Scene {
            id,
            scene: scene.to_string(),
        })
        .await?;
        self.place_local().await
    }

    /// Sends a chat line. Empty text asks the relay for a generated line.
    pub async fn say(&mut self, text: &str) -> anyhow::Result<()> {
        let body = ChatBody::from_input(&truncate_message(text));
        if let ChatBody::Text(line) = &body {
            if let Some(local) = self.model.local_mut() {
                local.show_message(line.clone());
            }
        }
        let id = self.model.local_id();
        self.send(&Frame::Message { id, body }).await
    }

    pub async fn request_generated(&mut self) -> anyhow::Result<()> {
        let id = self.model.local_id();
        self.send(&Frame::Message {
            id,
            body: ChatBody::Generate,
        })
        .await
    }

    /// Tries to move the local entity by `(dx, dy)`. Returns whether the
    /// move was accepted.
    pub async fn step(&mut self, dx: i32, dy: i32) -> anyhow::Result<bool> {
        let scene = self.model.scene().to_string();
        let map = load_map(&mut self.maps, &self.cfg, &scene)?;
        match try_step(&mut self.model, map, dx, dy) {
            Some(frame) => {
                self.send(&frame).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Travels through the scene link or Exit tile under the local entity.
    /// Returns the scene travelled to.
    pub async fn activate(&mut self) -> anyhow::Result<Option<String>> {
        let Some(local) = self.model.local() else {
            return Ok(None);
        };
        if local.moving || !local.has_position() {
            return Ok(None);
        }
        let (x, y) = local.settled();

        let destination = match link_at(&self.links, x, y) {
            Some(link) => Some(link.scene.clone()),
            None => {
                let scene = self.model.scene().to_string();
                let map = load_map(&mut self.maps, &self.cfg, &scene)?;
                (map.tile_at(x, y) == Tile::Exit && scene != self.directory.home)
                    .then(|| self.directory.home.clone())
            }
        };

        match destination {
            Some(scene) => {
                self.change_scene(&scene).await?;
                Ok(Some(scene))
            }
            None => Ok(None),
        }
    }

    pub fn status(&self) -> Vec<String> {
        let mut out = vec![
            format!("State: {:?}", self.state),
            format!("Tick: {}", self.tick),
            format!("Scene: {}", self.model.scene()),
            format!("Entities: {}", self.model.len()),
        ];
        if let Some(local) = self.model.local() {
            let (x, y) = local.settled();
            out.push(format!(
                "Local: #{} {:?} at ({x}, {y}) moving={}",
                local.id(),
                local.entity.display_name,
                local.moving
            ));
        }
        out
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let line = line.trim();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        match cmd {
            "" => Ok(Vec::new()),
            "status" => Ok(self.status()),
            "who" => Ok(self
                .model
                .visible()
                .iter()
                .map(|e| {
                    let (x, y) = e.settled();
                    format!("  #{} {} ({x}, {y})", e.id(), e.label())
                })
                .collect()),
            "links" => Ok(self
                .links
                .iter()
                .map(|l| format!("  {} at ({}, {})", l.scene, l.x, l.y))
                .collect()),
            "say" => {
                if rest.is_empty() {
                    return Ok(vec!["Usage: say <message>".to_string()]);
                }
                self.say(rest).await?;
                Ok(Vec::new())
            }
            "generate" => {
                self.request_generated().await?;
                Ok(Vec::new())
            }
            "move" => {
                let Some(direction) = Direction::parse(rest) else {
                    return Ok(vec!["Usage: move <up|down|left|right>".to_string()]);
                };
                let (dx, dy) = direction.delta();
                if self.step(dx, dy).await? {
                    Ok(Vec::new())
                } else {
                    Ok(vec!["Blocked".to_string()])
                }
            }
            "use" => match self.activate().await? {
                Some(scene) => Ok(vec![format!("Entered {scene}")]),
                None => Ok(vec!["Nothing here".to_string()]),
            },
            "scene" => {
                if rest.is_empty() {
                    return Ok(vec!["Usage: scene <name>".to_string()]);
                }
                self.change_scene(rest).await?;
                Ok(vec![format!("Entered {rest}")])
            }
            "quit" | "exit" => {
                self.state = ClientState::Disconnected;
                Ok(vec!["Disconnecting".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }

    /// Sends a close frame and stops the socket tasks.
    pub async fn close(self) -> anyhow::Result<()> {
        let _ = self.outbound_tx.send(Message::Close(None)).await;
        drop(self.outbound_tx);
        let _ = self.writer.await;
        self.reader.abort();
        Ok(())
    }
}
