//! Network front end of the [`SyncCoordinator`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::now_us;
use crate::control::connection::{ControlConnection, ControlSender};
use crate::control::dispatch::{self, PeerId, PerfHandler, SessionHandler, StreamHandler, SyncHandler};
use crate::control::message::{ControlMessage, SessionMessage, SyncMessage};
use crate::error::WallError;
use crate::sync::{SyncConfig, SyncCoordinator, SyncOutput, Target};

/// Accepts node control links and runs the coordinator over them.
pub struct SyncServer {
    listener: TcpListener,
    config: SyncConfig,
    cancel: CancellationToken,
}

enum PeerEvent {
    Message(PeerId, ControlMessage),
    Closed(PeerId),
}

struct Hub {
    coordinator: SyncCoordinator,
    peers: HashMap<PeerId, ControlSender>,
    /// Peer each node last spoke on.
    node_peers: HashMap<u32, PeerId>,
    cancel: CancellationToken,
}

impl SyncServer {
    pub async fn bind(host: &str, config: SyncConfig, cancel: CancellationToken) -> Result<Self, WallError> {
        let listener = TcpListener::bind((host, config.port)).await?;
        info!(addr = %listener.local_addr()?, "sync coordinator listening");
        Ok(Self {
            listener,
            config,
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WallError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the token is cancelled or a peer asks for shutdown.
    pub async fn run(self) -> Result<(), WallError> {
        let (events_tx, mut events) = mpsc::channel::<PeerEvent>(256);
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut hub = Hub {
            coordinator: SyncCoordinator::new(self.config.clone()),
            peers: HashMap::new(),
            node_peers: HashMap::new(),
            cancel: self.cancel.clone(),
        };
        let mut next_peer: PeerId = 1;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true)?;
                    let peer = next_peer;
                    next_peer += 1;
                    debug!(peer, %addr, "sync peer connected");
                    let conn = ControlConnection::new(stream, self.cancel.child_token());
                    let (tx, mut rx, token) = conn.into_parts();
                    hub.peers.insert(peer, tx);
                    let events_tx = events_tx.clone();
                    tokio::spawn(async move {
                        while let Some(msg) = rx.recv().await {
                            if events_tx.send(PeerEvent::Message(peer, msg)).await.is_err() {
                                break;
                            }
                        }
                        token.cancel();
                        let _ = events_tx.send(PeerEvent::Closed(peer)).await;
                    });
                }
                Some(event) = events.recv() => match event {
                    PeerEvent::Message(peer, msg) => {
                        if let Err(e) = dispatch::dispatch(&mut hub, peer, msg).await {
                            warn!(peer, error = %e, "sync message failed");
                        }
                    }
                    PeerEvent::Closed(peer) => hub.peer_closed(peer).await,
                },
                _ = tick.tick() => {
                    let out = hub.coordinator.tick(Instant::now(), now_us());
                    hub.deliver(out).await;
                }
            }
        }
        info!("sync coordinator stopped");
        Ok(())
    }
}

fn speaking_node(msg: &SyncMessage) -> Option<u32> {
    match *msg {
        SyncMessage::Join { node, .. }
        | SyncMessage::Leave { node, .. }
        | SyncMessage::Ready { node, .. }
        | SyncMessage::BarrierEnter { node, .. }
        | SyncMessage::ClockProbe { node, .. } => Some(node),
        _ => None,
    }
}

impl Hub {
    async fn deliver(&mut self, outputs: Vec<SyncOutput>) {
        for SyncOutput { to, msg } in outputs {
            let nodes: Vec<u32> = match to {
                Target::Node(node) => vec![node],
                Target::Group(group) => match self.coordinator.group(group) {
                    Some(g) => g.members().collect(),
                    None => continue,
                },
            };
            for node in nodes {
                let Some(tx) = self.node_peers.get(&node).and_then(|p| self.peers.get(p)) else {
                    debug!(node, "no link for sync output");
                    continue;
                };
                if tx.send(msg.into()).await.is_err() {
                    debug!(node, "sync link gone");
                }
            }
        }
    }

    async fn peer_closed(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let gone: Vec<u32> = self
            .node_peers
            .iter()
            .filter(|(_, p)| **p == peer)
            .map(|(n, _)| *n)
            .collect();
        for node in gone {
            self.node_peers.remove(&node);
            info!(node, "sync node disconnected");
            let out = self.coordinator.forget_node(node, Instant::now(), now_us());
            self.deliver(out).await;
        }
    }
}

#[async_trait]
impl SyncHandler for Hub {
    async fn on_sync(&mut self, from: PeerId, msg: SyncMessage) -> Result<(), WallError> {
        if let Some(node) = speaking_node(&msg) {
            self.node_peers.insert(node, from);
        }
        let out = self.coordinator.handle(msg, Instant::now(), now_us());
        self.deliver(out).await;
        Ok(())
    }
}

#[async_trait]
impl SessionHandler for Hub {
    async fn on_session(&mut self, from: PeerId, msg: SessionMessage) -> Result<(), WallError> {
        if msg == SessionMessage::Shutdown {
            info!(from, "shutdown requested");
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl StreamHandler for Hub {}
impl PerfHandler for Hub {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncMode;

    async fn start() -> (SocketAddr, CancellationToken) {
        let cancel = CancellationToken::new();
        let config = SyncConfig {
            port: 0,
            ..SyncConfig::default()
        };
        let server = SyncServer::bind("127.0.0.1", config, cancel.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, cancel)
    }

    async fn next_sync(conn: &mut ControlConnection) -> SyncMessage {
        match conn.recv().await {
            Some(ControlMessage::Sync(m)) => m,
            other => panic!("expected sync message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn releases_over_the_network() {
        let (addr, cancel) = start().await;
        let mut a = ControlConnection::connect(&addr.to_string(), cancel.child_token()).await.unwrap();
        let mut b = ControlConnection::connect(&addr.to_string(), cancel.child_token()).await.unwrap();
        for (conn, node) in [(&a, 1), (&b, 2)] {
            conn.send(SyncMessage::Join {
                group: 5,
                node,
                mode: SyncMode::DataSync,
            })
            .await
            .unwrap();
        }
        // Links are served independently; make sure b's join has landed
        // before a reports ready.
        b.send(SyncMessage::ClockProbe { node: 2, sent_us: 0 }).await.unwrap();
        assert!(matches!(next_sync(&mut b).await, SyncMessage::ClockReply { .. }));
        for (conn, node) in [(&a, 1), (&b, 2)] {
            conn.send(SyncMessage::Ready {
                group: 5,
                node,
                frame: 1,
            })
            .await
            .unwrap();
        }
        let release = SyncMessage::Release { group: 5, frame: 1 };
        assert_eq!(next_sync(&mut a).await, release);
        assert_eq!(next_sync(&mut b).await, release);
        cancel.cancel();
    }

    #[tokio::test]
    async fn clock_probe_round_trip() {
        let (addr, cancel) = start().await;
        let mut a = ControlConnection::connect(&addr.to_string(), cancel.child_token()).await.unwrap();
        let sent_us = now_us();
        a.send(SyncMessage::ClockProbe { node: 3, sent_us }).await.unwrap();
        match next_sync(&mut a).await {
            SyncMessage::ClockReply {
                node,
                sent_us: echoed,
                coordinator_us,
            } => {
                assert_eq!(node, 3);
                assert_eq!(echoed, sent_us);
                assert!(coordinator_us >= sent_us);
            }
            other => panic!("unexpected {other:?}"),
        }
        cancel.cancel();
    }
}
