//! Per-socket relay state machine.
//!
//! A connection starts unidentified, becomes identified by its first `Load`,
//! and is removed when the socket closes. Only identified connections have
//! their frames applied and relayed.

use std::sync::Arc;

use relay_shared::{
    chat::{truncate_message, ChatBody},
    entity::EntityId,
    net::Frame,
};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::generate::TextGenerator;
use crate::registry::{ConnectionId, ConnectionRegistry, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unidentified,
    Identified(EntityId),
    Removed,
}

pub struct RelayConnection {
    id: ConnectionId,
    state: ConnectionState,
    registry: Arc<ConnectionRegistry>,
    generator: Arc<dyn TextGenerator>,
}

impl RelayConnection {
    /// Registers a new connection whose outbound messages go to `outbound`.
    pub async fn open(
        registry: Arc<ConnectionRegistry>,
        generator: Arc<dyn TextGenerator>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let id = ConnectionId::new_unique();
        registry.register(id, outbound).await;
        Self {
            id,
            state: ConnectionState::Unidentified,
            registry,
            generator,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handles one binary frame. Malformed frames are dropped; the socket
    /// stays open.
    pub async fn on_binary(&mut self, data: &[u8]) {
        match self.registry.codec().decode(data) {
            Ok(frame) => self.on_frame(frame).await,
            Err(e) => debug!(conn = ?self.id, error = %e, "Dropping malformed frame"),
        }
    }

    /// Clients never send text frames.
    pub async fn on_text(&mut self, text: &str) {
        debug!(conn = ?self.id, len = text.len(), "Ignoring text frame");
    }

    pub async fn on_frame(&mut self, frame: Frame) {
        match (self.state, frame) {
            (ConnectionState::Removed, _) => {}
            (ConnectionState::Unidentified, Frame::Load { id }) => {
                if self.registry.identify(self.id, id).await {
                    self.state = ConnectionState::Identified(id);
                }
            }
            (ConnectionState::Unidentified, frame) => {
                debug!(conn = ?self.id, kind = ?frame.kind(), "Ignoring frame before Load");
            }
            (ConnectionState::Identified(_), Frame::Load { .. }) => {
                trace!(conn = ?self.id, "Ignoring repeated Load");
            }
            (
                ConnectionState::Identified(entity),
                Frame::Message {
                    body: ChatBody::Generate,
                    ..
                },
            ) => self.relay_generated(entity).await,
            (
                ConnectionState::Identified(entity),
                Frame::Message {
                    body: ChatBody::Text(text),
                    ..
                },
            ) => {
                let frame = Frame::Message {
                    id: entity,
                    body: ChatBody::Text(truncate_message(&text)),
                };
                self.registry.apply(self.id, &frame).await;
            }
            (ConnectionState::Identified(_), frame) => {
                self.registry.apply(self.id, &frame).await;
            }
        }
    }

    async fn relay_generated(&mut self, entity: EntityId) {
        let Some(identity) = self.registry.identity_of(self.id).await else {
            debug!(conn = ?self.id, "Generation requested without linked identity");
            return;
        };

        let text = self.generator.generate(&identity).await;
        if text.is_empty() {
            trace!(conn = ?self.id, identity = %identity, "Generator returned nothing");
            return;
        }

        let frame = Frame::Message {
            id: entity,
            body: ChatBody::Text(truncate_message(&text)),
        };
        self.registry.apply(self.id, &frame).await;
    }

    /// Removes the connection from the registry. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Removed {
            return;
        }
        self.registry.remove(self.id).await;
        self.state = ConnectionState::Removed;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::generate::{PhraseBook, Silent};
    use crate::registry::{IdentityClaim, IdentityId};
    use relay_shared::chat::MAX_MESSAGE_LENGTH;
    use relay_shared::entity::Rgb;
    use relay_shared::net::{FrameLayout, WireCodec};

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(WireCodec::new(
            64,
            FrameLayout::Compact,
        )))
    }

    async fn open(
        registry: &Arc<ConnectionRegistry>,
        generator: Arc<dyn TextGenerator>,
    ) -> (RelayConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (
            RelayConnection::open(registry.clone(), generator, tx).await,
            rx,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn deltas(codec: &WireCodec, rx: &mut mpsc::Receiver<Outbound>) -> Vec<Frame> {
        drain(rx)
            .into_iter()
            .filter_map(|msg| match msg {
                Outbound::Delta(bytes) => Some(codec.decode(&bytes).unwrap()),
                Outbound::Roster(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn load_identifies_once() {
        let registry = registry();
        let (mut conn, _rx) = open(&registry, Arc::new(Silent)).await;
        assert_eq!(conn.state(), ConnectionState::Unidentified);

        conn.on_frame(Frame::Move {
            id: EntityId(1),
            x: 0,
            y: 0,
        })
        .await;
        assert!(registry.entity_of(conn.id()).await.is_none());

        conn.on_frame(Frame::Load { id: EntityId(4) }).await;
        assert_eq!(conn.state(), ConnectionState::Identified(EntityId(4)));

        conn.on_frame(Frame::Load { id: EntityId(9) }).await;
        assert_eq!(conn.state(), ConnectionState::Identified(EntityId(4)));
        assert_eq!(registry.roster().await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let registry = registry();
        let (mut conn, _rx) = open(&registry, Arc::new(Silent)).await;
        conn.on_binary(&[]).await;
        conn.on_binary(&[42, 1, 0]).await;
        conn.on_text("{\"cmd\":\"client_list\",\"clients\":[]}").await;
        assert_eq!(conn.state(), ConnectionState::Unidentified);

        let load = registry
            .codec()
            .encode(&Frame::Load { id: EntityId(2) })
            .unwrap();
        conn.on_binary(&load).await;
        assert_eq!(conn.state(), ConnectionState::Identified(EntityId(2)));
    }

    #[tokio::test]
    async fn chat_is_truncated_and_relayed() {
        let registry = registry();
        let codec = registry.codec();
        let (mut a, _rx_a) = open(&registry, Arc::new(Silent)).await;
        let (mut b, mut rx_b) = open(&registry, Arc::new(Silent)).await;
        a.on_frame(Frame::Load { id: EntityId(1) }).await;
        b.on_frame(Frame::Load { id: EntityId(2) }).await;
        drain(&mut rx_b);

        let long = "x".repeat(MAX_MESSAGE_LENGTH + 40);
        a.on_frame(Frame::Message {
            id: EntityId(1),
            body: ChatBody::Text(long),
        })
        .await;

        let frames = deltas(&codec, &mut rx_b);
        assert_eq!(
            frames,
            vec![Frame::Message {
                id: EntityId(1),
                body: ChatBody::Text("x".repeat(MAX_MESSAGE_LENGTH)),
            }]
        );
    }

    #[tokio::test]
    async fn generation_needs_a_linked_identity() {
        let registry = registry();
        let codec = registry.codec();
        let mut phrases = HashMap::new();
        phrases.insert("ada".to_string(), vec!["beep".to_string()]);
        let generator: Arc<dyn TextGenerator> = Arc::new(PhraseBook::new(phrases));

        let (mut a, _rx_a) = open(&registry, generator.clone()).await;
        let (mut b, mut rx_b) = open(&registry, generator).await;
        a.on_frame(Frame::Load { id: EntityId(1) }).await;
        b.on_frame(Frame::Load { id: EntityId(2) }).await;
        drain(&mut rx_b);

        let request = Frame::Message {
            id: EntityId(1),
            body: ChatBody::Generate,
        };
        a.on_frame(request.clone()).await;
        assert!(deltas(&codec, &mut rx_b).is_empty());

        registry
            .link_identity(
                EntityId(1),
                IdentityClaim {
                    identity: IdentityId("ada".into()),
                    display_name: "Ada".into(),
                    color: Rgb::new(1, 2, 3),
                },
            )
            .await;
        drain(&mut rx_b);

        a.on_frame(request).await;
        assert_eq!(
            deltas(&codec, &mut rx_b),
            vec![Frame::Message {
                id: EntityId(1),
                body: ChatBody::Text("beep".into()),
            }]
        );
        assert_eq!(registry.entity_of(a.id()).await.unwrap().message, None);
    }

    #[tokio::test]
    async fn close_removes_and_is_idempotent() {
        let registry = registry();
        let (mut a, _rx_a) = open(&registry, Arc::new(Silent)).await;
        a.on_frame(Frame::Load { id: EntityId(1) }).await;

        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ConnectionState::Removed);
        assert_eq!(registry.connection_count().await, 0);

        a.on_frame(Frame::Load { id: EntityId(1) }).await;
        assert_eq!(a.state(), ConnectionState::Removed);
    }
}
