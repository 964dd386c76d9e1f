//! Data plane of a bridge member: reads groups from producers and fans
//! each one out to every destination of its instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::group::{BlockGroup, GroupSpec};
use crate::block::header::GroupFlag;
use crate::block::pool::{BlockPool, GroupKind, PoolOptions};
use crate::control::message::StreamInfo;
use crate::error::WallError;
use crate::streamer::config::Destination;
use crate::transport::{ConnId, Handshake, StreamType, Transport};

/// What the relay tells the bridge event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    ProducerConnected { instance: u32, conn: ConnId },
    ProducerClosed { instance: u32, conn: ConnId, reason: String },
    FrameRelayed { instance: u32, frame: u32, bytes: u64, blocks: u64 },
    DestinationLost { instance: u32, node_id: u32, reason: String },
}

#[derive(Debug, Clone, Copy)]
struct Target {
    node_id: u32,
    conn: ConnId,
}

struct Lane {
    pool: BlockPool,
    frame_rate: u32,
    targets: Vec<Target>,
    producers: Vec<ConnId>,
    /// `(frame, config_id)` of the last CONFIG_UPDATE relayed.
    last_config: Option<(u32, u32)>,
}

struct RelayInner {
    member_id: u32,
    transport: Arc<dyn Transport>,
    pool_groups: usize,
    lanes: Mutex<HashMap<u32, Lane>>,
    events: mpsc::Sender<RelayEvent>,
    cancel: CancellationToken,
}

/// Cheaply cloneable handle to a member's relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    pub fn new(
        member_id: u32,
        transport: Arc<dyn Transport>,
        pool_groups: usize,
        events: mpsc::Sender<RelayEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                member_id,
                transport,
                pool_groups,
                lanes: Mutex::new(HashMap::new()),
                events,
                cancel,
            }),
        }
    }

    /// Prepare to receive `instance`. Producers connecting for unknown
    /// instances are turned away.
    pub fn register(&self, instance: u32, stream: &StreamInfo) -> Result<(), WallError> {
        let pool = BlockPool::new(
            stream.group_spec(),
            self.inner.pool_groups,
            PoolOptions::MULTI_READER,
        )?;
        self.lanes().entry(instance).or_insert(Lane {
            pool,
            frame_rate: stream.frame_rate,
            targets: Vec::new(),
            producers: Vec::new(),
            last_config: None,
        });
        Ok(())
    }

    pub fn is_registered(&self, instance: u32) -> bool {
        self.lanes().contains_key(&instance)
    }

    pub fn destination_count(&self, instance: u32) -> usize {
        self.lanes().get(&instance).map_or(0, |l| l.targets.len())
    }

    /// Open relay links to `destinations`. A new link first gets the
    /// last CONFIG_UPDATE relayed, then picks up at the next group.
    pub async fn add_destinations(&self, instance: u32, destinations: &[Destination]) -> Result<(), WallError> {
        let (frame_rate, spec) = self
            .lanes()
            .get(&instance)
            .map(|l| (l.frame_rate, *l.pool.spec()))
            .ok_or(WallError::UnknownInstance(instance))?;
        let handshake = Handshake::new(self.inner.member_id, StreamType::Relay, frame_rate, instance);
        for destination in destinations {
            let conn = self
                .inner
                .transport
                .connect(&destination.host, destination.port, &handshake)
                .await?;
            info!(
                instance,
                node = destination.node_id,
                conn,
                "relay destination connected"
            );
            let target = Target {
                node_id: destination.node_id,
                conn,
            };
            if let Err(e) = self.attach(instance, target, &spec).await {
                let _ = self.inner.transport.close(conn).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Bring `target` up to the current layout and add it to the lane.
    /// The config is re-checked under the lock so a layout change
    /// relayed meanwhile is not missed.
    async fn attach(&self, instance: u32, target: Target, spec: &GroupSpec) -> Result<(), WallError> {
        let mut announced = None;
        loop {
            let current = {
                let mut lanes = self.lanes();
                let lane = lanes
                    .get_mut(&instance)
                    .ok_or(WallError::UnknownInstance(instance))?;
                if lane.last_config == announced {
                    lane.targets.push(target);
                    return Ok(());
                }
                lane.last_config
            };
            if let Some((frame, config_id)) = current {
                let mut config = BlockGroup::control(spec);
                config.seal_control(GroupFlag::ConfigUpdate, frame, config_id);
                self.inner.transport.send_group(target.conn, &config).await?;
                debug!(instance, node = target.node_id, config_id, "layout replayed to new destination");
            }
            announced = current;
        }
    }

    /// Forget `instance` and close all its links.
    pub async fn drop_instance(&self, instance: u32) {
        let Some(lane) = self.lanes().remove(&instance) else {
            return;
        };
        let conns = lane
            .targets
            .iter()
            .map(|t| t.conn)
            .chain(lane.producers.iter().copied());
        for conn in conns {
            let _ = self.inner.transport.close(conn).await;
        }
        debug!(instance, "relay lane dropped");
    }

    /// Accept producer links until cancelled.
    pub async fn serve(self) -> Result<(), WallError> {
        loop {
            let accepted = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                accepted = self.inner.transport.accept_connection() => accepted,
            };
            let (conn, handshake) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if e.is_fatal_to_connection() => {
                    warn!(error = %e, "producer handshake failed");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let instance = handshake.instance_id;
            if handshake.stream_type != StreamType::Pixel {
                warn!(conn, %handshake, "relay accepts pixel streams only");
                let _ = self.inner.transport.close(conn).await;
                continue;
            }
            let pool = self.lanes().get_mut(&instance).map(|lane| {
                lane.producers.push(conn);
                lane.pool.clone()
            });
            let Some(pool) = pool else {
                warn!(conn, error = %WallError::UnknownInstance(instance), "producer rejected");
                let _ = self.inner.transport.close(conn).await;
                continue;
            };
            info!(instance, conn, sender = handshake.sender_id, "producer connected");
            let _ = self
                .inner
                .events
                .send(RelayEvent::ProducerConnected { instance, conn })
                .await;
            let relay = self.clone();
            tokio::spawn(async move {
                let reason = match relay.forward(instance, conn, pool).await {
                    Ok(()) => return,
                    Err(e) => e.to_string(),
                };
                let _ = relay.inner.transport.close(conn).await;
                let _ = relay
                    .inner
                    .events
                    .send(RelayEvent::ProducerClosed {
                        instance,
                        conn,
                        reason,
                    })
                    .await;
            });
        }
    }

    /// Pump groups from one producer link until it fails or the lane is
    /// dropped.
    async fn forward(&self, instance: u32, conn: ConnId, pool: BlockPool) -> Result<(), WallError> {
        let transport = &self.inner.transport;
        let mut frame_bytes = 0u64;
        let mut frame_blocks = 0u64;
        loop {
            let mut group = match pool.acquire_or_cancel(GroupKind::Data, &self.inner.cancel).await {
                Ok(group) => group,
                Err(WallError::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };
            let received = match transport.recv_group(conn, &mut group).await {
                Ok(n) => n,
                Err(e) => {
                    pool.release(group);
                    return Err(e);
                }
            };
            let flag = group.flag();
            let frame = group.frame_id();
            let blocks = group.len() as u64;

            let targets = match self.lanes().get_mut(&instance) {
                Some(lane) => {
                    if flag == GroupFlag::ConfigUpdate {
                        lane.last_config = Some((frame, group.config_id()));
                    }
                    lane.targets.clone()
                }
                None => {
                    pool.release(group);
                    return Ok(());
                }
            };
            let handles = pool.share(group, targets.len())?;
            let sends = targets
                .iter()
                .zip(&handles)
                .map(|(t, handle)| transport.send_group(t.conn, handle));
            let results = join_all(sends).await;
            drop(handles);

            for (target, result) in targets.iter().zip(results) {
                if let Err(e) = result {
                    self.lose_target(instance, *target, e).await;
                }
            }

            frame_bytes += received as u64;
            frame_blocks += blocks;
            if flag == GroupFlag::EndFrame {
                let _ = self.inner.events.try_send(RelayEvent::FrameRelayed {
                    instance,
                    frame,
                    bytes: frame_bytes,
                    blocks: frame_blocks,
                });
                frame_bytes = 0;
                frame_blocks = 0;
            }
        }
    }

    async fn lose_target(&self, instance: u32, target: Target, error: WallError) {
        warn!(instance, node = target.node_id, error = %error, "relay destination lost");
        if let Some(lane) = self.lanes().get_mut(&instance) {
            lane.targets.retain(|t| t.conn != target.conn);
        }
        let _ = self.inner.transport.close(target.conn).await;
        let _ = self
            .inner
            .events
            .send(RelayEvent::DestinationLost {
                instance,
                node_id: target.node_id,
                reason: error.to_string(),
            })
            .await;
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<u32, Lane>> {
        self.inner.lanes.lock().unwrap_or_else(|p| p.into_inner())
    }
}
