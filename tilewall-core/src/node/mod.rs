//! Display-node manager: receives pixel streams, reassembles them per
//! instance and swaps frames when the sync group allows.
//!
//! One event loop owns every [`Downloader`]. Workers (accept, receive,
//! sync wait) only feed [`Event`]s into its queue. Presentation is left
//! to the owner of the [`NodeEvent`] receiver.
//!
//! [`Downloader`]: crate::download::Downloader

mod lane;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::group::BlockGroup;
use crate::block::pool::{BlockPool, PoolOptions};
use crate::context::{WallContext, now_us};
use crate::control::connection::{ControlConnection, ControlSender};
use crate::control::dispatch::{self, PeerId, PerfHandler, SessionHandler, StreamHandler, SyncHandler};
use crate::control::message::{
    ControlMessage, PerfMessage, SessionMessage, StreamInit, StreamMessage, SyncMessage,
};
use crate::download::{Downloader, Montage};
use crate::error::WallError;
use crate::sync::{SyncClient, SyncDirective, wait_until};
use crate::task::WorkerSet;
use crate::transport::{ConnId, Handshake, StreamType, Transport};

use lane::{Effects, Lane};

const LINK_RETRY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: u32,
    /// Port stream inits and layout updates arrive on.
    pub control_port: u16,
    /// Port pixel streams connect to.
    pub data_port: u16,
    /// Control address of the sync coordinator.
    pub sync_server: Option<String>,
    /// Receive groups per instance.
    pub pool_groups: usize,
    /// How long to wait for a release before showing a frame anyway.
    /// `None` waits forever.
    pub node_timeout_ms: Option<u64>,
    pub tick_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            control_port: 14000,
            data_port: 14001,
            sync_server: None,
            pool_groups: 32,
            node_timeout_ms: Some(5000),
            tick_ms: 50,
        }
    }
}

impl NodeConfig {
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }
}

/// What the node hands to presentation.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The front montages of `instance` now show `frame`.
    Swapped {
        instance: u32,
        frame: u32,
        depth: f32,
        front: Arc<Vec<Option<Montage>>>,
    },
    /// Every node of the barrier swapped; redraw.
    Refresh { instance: u32, frame: u32 },
    /// The window left this node.
    Cleared { instance: u32 },
    Depth { instance: u32, depth: f32 },
    /// The instance ended or lost its stream.
    Quit { instance: u32, reason: String },
}

pub(crate) enum Event {
    Message(PeerId, ControlMessage),
    Closed(PeerId),
    SyncLinked(ControlConnection),
    Accepted(ConnId, Handshake),
    Group {
        instance: u32,
        conn: ConnId,
        group: BlockGroup,
    },
    SourceClosed {
        instance: u32,
        conn: ConnId,
        reason: String,
    },
    SwapDue { instance: u32, frame: u32 },
}

pub struct DisplayNode {
    ctx: WallContext,
    config: NodeConfig,
    control: TcpListener,
    data_addr: SocketAddr,
}

impl DisplayNode {
    pub async fn bind(ctx: WallContext, config: NodeConfig) -> Result<Self, WallError> {
        if config.pool_groups == 0 {
            return Err(WallError::InvalidConfig("receive pool must not be empty".into()));
        }
        let control = TcpListener::bind((ctx.net().bind_host.as_str(), config.control_port)).await?;
        let data_addr = ctx.transport().listen(config.data_port).await?;
        info!(
            node = config.node_id,
            control = %control.local_addr()?,
            data = %data_addr,
            "display node listening"
        );
        Ok(Self {
            ctx,
            config,
            control,
            data_addr,
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr, WallError> {
        Ok(self.control.local_addr()?)
    }

    pub fn data_addr(&self) -> SocketAddr {
        self.data_addr
    }

    /// Serve until the context is cancelled or a peer asks for shutdown.
    pub async fn run(self, published: mpsc::Sender<NodeEvent>) -> Result<(), WallError> {
        let cancel = self.ctx.cancel_token().clone();
        let (events_tx, mut events) = mpsc::channel::<Event>(256);
        let mut workers = WorkerSet::new(cancel.child_token());

        {
            let transport = self.ctx.transport().clone();
            let tx = events_tx.clone();
            workers.spawn("accept", move |token| accept(transport, tx, token));
        }
        if let Some(addr) = self.config.sync_server.clone() {
            let tx = events_tx.clone();
            workers.spawn("sync-link", move |token| async move {
                let conn = ControlConnection::connect_retrying(&addr, LINK_RETRY, token).await?;
                tx.send(Event::SyncLinked(conn)).await?;
                Ok(())
            });
        }

        let mut node = NodeState {
            node_id: self.config.node_id,
            pool_groups: self.config.pool_groups,
            node_timeout: self.config.node_timeout(),
            transport: self.ctx.transport().clone(),
            lanes: HashMap::new(),
            unclaimed: HashMap::new(),
            peers: HashMap::new(),
            sync_peer: None,
            sync_pending: self.config.sync_server.is_some(),
            sync_backlog: Vec::new(),
            next_peer: 1,
            workers,
            events: events_tx.clone(),
            published,
            cancel: cancel.clone(),
        };
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.control.accept() => {
                    let (stream, addr) = accepted?;
                    stream.set_nodelay(true)?;
                    let peer = node.attach(ControlConnection::new(stream, cancel.child_token()));
                    debug!(peer, %addr, "control peer connected");
                }
                Some(event) = events.recv() => node.on_event(event).await,
                Some(done) = node.workers.recv() => node.workers.process_event(&done),
                _ = tick.tick() => node.tick(Instant::now()).await,
            }
        }

        let ids: Vec<u32> = node.lanes.keys().copied().collect();
        for id in ids {
            node.drop_lane(id).await;
        }
        node.workers.shutdown(Duration::from_secs(1)).await;
        info!(node = self.config.node_id, "display node stopped");
        Ok(())
    }
}

async fn accept(
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<(), WallError> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Err(WallError::Cancelled),
            accepted = transport.accept_connection() => accepted,
        };
        match accepted {
            Ok((conn, handshake)) => events.send(Event::Accepted(conn, handshake)).await?,
            Err(e) if e.is_fatal_to_connection() => warn!(error = %e, "stream handshake failed"),
            Err(e) => return Err(e),
        }
    }
}

struct NodeState {
    node_id: u32,
    pool_groups: usize,
    node_timeout: Option<Duration>,
    transport: Arc<dyn Transport>,
    lanes: HashMap<u32, Lane>,
    /// Data links that arrived before their instance's init.
    unclaimed: HashMap<u32, Vec<(ConnId, Handshake)>>,
    peers: HashMap<PeerId, ControlSender>,
    sync_peer: Option<PeerId>,
    /// A coordinator link is being established.
    sync_pending: bool,
    /// Sync messages produced before the coordinator link was up.
    sync_backlog: Vec<SyncMessage>,
    next_peer: PeerId,
    workers: WorkerSet,
    events: mpsc::Sender<Event>,
    published: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
}

impl NodeState {
    fn attach(&mut self, conn: ControlConnection) -> PeerId {
        let peer = self.next_peer;
        self.next_peer += 1;
        let (tx, mut rx, token) = conn.into_parts();
        self.peers.insert(peer, tx);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if events.send(Event::Message(peer, msg)).await.is_err() {
                    break;
                }
            }
            token.cancel();
            let _ = events.send(Event::Closed(peer)).await;
        });
        peer
    }

    async fn send_to(&self, peer: PeerId, msg: impl Into<ControlMessage>) {
        match self.peers.get(&peer) {
            Some(tx) => {
                if tx.send(msg.into()).await.is_err() {
                    debug!(peer, "control peer gone");
                }
            }
            None => debug!(peer, "control peer gone"),
        }
    }

    async fn send_sync(&mut self, msgs: Vec<SyncMessage>) {
        match self.sync_peer {
            Some(peer) => {
                for msg in msgs {
                    self.send_to(peer, msg).await;
                }
            }
            None if self.sync_pending => self.sync_backlog.extend(msgs),
            None => debug!(count = msgs.len(), "no sync coordinator, messages dropped"),
        }
    }

    async fn publish(&self, events: Vec<NodeEvent>) {
        for event in events {
            if self.published.send(event).await.is_err() {
                debug!("nobody is presenting");
            }
        }
    }

    async fn apply(&mut self, effects: Effects) {
        self.send_sync(effects.sync).await;
        self.publish(effects.published).await;
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Message(peer, msg) => {
                if let Err(e) = dispatch::dispatch(self, peer, msg).await {
                    warn!(peer, error = %e, "control message failed");
                }
            }
            Event::Closed(peer) => {
                self.peers.remove(&peer);
                if self.sync_peer == Some(peer) {
                    warn!("sync coordinator link lost");
                    self.sync_peer = None;
                }
                for lane in self.lanes.values_mut() {
                    if lane.perf_subscriber.is_some_and(|(p, _, _)| p == peer) {
                        lane.perf_subscriber = None;
                    }
                }
            }
            Event::SyncLinked(conn) => {
                let peer = self.attach(conn);
                info!(peer, "sync coordinator linked");
                self.sync_peer = Some(peer);
                self.sync_pending = false;
                let backlog = std::mem::take(&mut self.sync_backlog);
                self.send_sync(backlog).await;
            }
            Event::Accepted(conn, handshake) => self.on_accepted(conn, handshake).await,
            Event::Group {
                instance,
                conn,
                group,
            } => {
                let mut effects = Effects::default();
                let Some(lane) = self.lanes.get_mut(&instance) else {
                    return;
                };
                let result = lane
                    .downloader
                    .process_group(conn, group)
                    .and_then(|events| lane.settle(events, &mut effects));
                if let Err(e) = result {
                    warn!(instance, conn, error = %e, "group rejected");
                }
                self.apply(effects).await;
            }
            Event::SourceClosed {
                instance,
                conn,
                reason,
            } => self.on_source_closed(instance, conn, reason).await,
            Event::SwapDue { instance, frame } => self.release(instance, frame).await,
        }
    }

    async fn on_accepted(&mut self, conn: ConnId, handshake: Handshake) {
        let instance = handshake.instance_id;
        if handshake.stream_type == StreamType::Audio {
            debug!(conn, instance, "audio links are not handled here");
            let _ = self.transport.close(conn).await;
            return;
        }
        if self.lanes.contains_key(&instance) {
            self.add_source(instance, conn, handshake);
        } else {
            debug!(conn, instance, "data link before init, parked");
            self.unclaimed.entry(instance).or_default().push((conn, handshake));
        }
    }

    fn add_source(&mut self, instance: u32, conn: ConnId, handshake: Handshake) {
        let Some(lane) = self.lanes.get_mut(&instance) else {
            return;
        };
        let route = lane.init.route_for(handshake.sender_id, handshake.stream_type);
        lane.downloader.add_source(conn, route);
        lane.conns.push(conn);
        info!(instance, conn, sender = handshake.sender_id, "stream source attached");

        let transport = self.transport.clone();
        let pool = lane.pool.clone();
        let events = self.events.clone();
        let lane_cancel = lane.cancel.clone();
        self.workers.spawn("receive", move |_| {
            lane::receive(transport, instance, conn, pool, events, lane_cancel)
        });
    }

    async fn on_source_closed(&mut self, instance: u32, conn: ConnId, reason: String) {
        let Some(lane) = self.lanes.get_mut(&instance) else {
            return;
        };
        lane.downloader.remove_source(conn);
        lane.conns.retain(|c| *c != conn);
        let _ = self.transport.close(conn).await;
        warn!(instance, conn, %reason, "stream source lost");
        if lane.downloader.source_count() > 0 {
            return;
        }
        let owner = lane.owner;
        self.drop_lane(instance).await;
        self.send_to(owner, SessionMessage::Quit { instance }).await;
        self.publish(vec![NodeEvent::Quit { instance, reason }]).await;
    }

    async fn init(&mut self, from: PeerId, init: StreamInit) -> Result<(), WallError> {
        let instance = init.instance;
        if self.lanes.contains_key(&instance) {
            warn!(instance, "instance initialised twice, restarting it");
            self.drop_lane(instance).await;
        }
        let pool = BlockPool::new(init.stream.group_spec(), self.pool_groups, PoolOptions::CTRL_GROUP)?;
        let downloader = Downloader::new(&init, pool.clone())?;
        let mut sync = init
            .sync_group
            .filter(|_| init.stream.sync_mode.is_synchronized())
            .map(|group| SyncClient::new(group, self.node_id, init.stream.sync_mode, self.node_timeout));
        let mut join = Vec::new();
        if let Some(client) = sync.as_mut() {
            join.push(client.join());
            join.push(client.probe());
        }
        info!(
            instance,
            tiles = init.tiles.len(),
            sync_group = ?init.sync_group,
            "stream init"
        );
        self.lanes.insert(
            instance,
            Lane {
                init,
                downloader,
                pool,
                sync,
                owner: from,
                conns: Vec::new(),
                cancel: self.cancel.child_token(),
                perf_subscriber: None,
            },
        );
        self.send_sync(join).await;
        for (conn, handshake) in self.unclaimed.remove(&instance).unwrap_or_default() {
            self.add_source(instance, conn, handshake);
        }
        self.send_to(
            from,
            SessionMessage::NodeReady {
                instance,
                node_id: self.node_id,
            },
        )
        .await;
        Ok(())
    }

    async fn drop_lane(&mut self, instance: u32) {
        let Some(mut lane) = self.lanes.remove(&instance) else {
            return;
        };
        lane.cancel.cancel();
        for conn in lane.conns.drain(..) {
            let _ = self.transport.close(conn).await;
        }
        if let Some(client) = lane.sync.as_mut() {
            let leave = client.leave();
            self.send_sync(vec![leave]).await;
        }
        lane.downloader.shutdown();
        debug!(instance, "lane dropped");
    }

    /// Swap `instance` to the released `frame`.
    async fn release(&mut self, instance: u32, frame: u32) {
        let mut effects = Effects::default();
        let Some(lane) = self.lanes.get_mut(&instance) else {
            return;
        };
        let result = lane
            .downloader
            .process_sync(frame)
            .and_then(|events| lane.settle(events, &mut effects));
        if let Err(e) = result {
            warn!(instance, frame, error = %e, "release failed");
        }
        self.apply(effects).await;
    }

    async fn on_directive(&mut self, instance: u32, directive: SyncDirective) {
        match directive {
            SyncDirective::Swap(frame) => self.release(instance, frame).await,
            SyncDirective::SwapThenEnter(frame) => {
                self.release(instance, frame).await;
                let enter = self
                    .lanes
                    .get(&instance)
                    .and_then(|l| l.sync.as_ref())
                    .map(|c| c.barrier_enter(frame));
                self.send_sync(enter.into_iter().collect()).await;
            }
            SyncDirective::Refresh(frame) => {
                self.publish(vec![NodeEvent::Refresh { instance, frame }]).await;
            }
            SyncDirective::SwapAt {
                frame,
                local_deadline_us,
            } => {
                let events = self.events.clone();
                self.workers.spawn("sync-wait", move |_| async move {
                    wait_until(local_deadline_us).await;
                    events.send(Event::SwapDue { instance, frame }).await?;
                    Ok(())
                });
            }
            SyncDirective::Evicted => {
                let mut effects = Effects::default();
                let Some(lane) = self.lanes.get_mut(&instance) else {
                    return;
                };
                let result = lane
                    .downloader
                    .release_local()
                    .and_then(|events| lane.settle(events, &mut effects));
                if let Err(e) = result {
                    warn!(instance, error = %e, "local release failed");
                }
                self.apply(effects).await;
            }
        }
    }

    async fn tick(&mut self, now: Instant) {
        let mut overdue = Vec::new();
        let mut reports = Vec::new();
        for (id, lane) in &mut self.lanes {
            if let Some(client) = lane.sync.as_mut() {
                let frame = client.waiting_for();
                if let (Err(e), Some(frame)) = (client.check_timeout(now), frame) {
                    warn!(instance = *id, frame, error = %e, "showing frame without release");
                    overdue.push((*id, frame));
                }
            }
            if let Some((peer, interval, last)) = lane.perf_subscriber {
                if now.saturating_duration_since(last) >= interval {
                    lane.perf_subscriber = Some((peer, interval, now));
                    reports.push((peer, *id, lane.downloader.perf_report()));
                }
            }
        }
        for (instance, frame) in overdue {
            self.release(instance, frame).await;
        }
        for (peer, instance, report) in reports {
            self.send_to(
                peer,
                PerfMessage::Report {
                    instance,
                    node_id: self.node_id,
                    report,
                },
            )
            .await;
        }
    }
}

#[async_trait]
impl SessionHandler for NodeState {
    async fn on_session(&mut self, from: PeerId, msg: SessionMessage) -> Result<(), WallError> {
        match msg {
            SessionMessage::Quit { instance } | SessionMessage::TimedOut { instance } => {
                if self.lanes.contains_key(&instance) {
                    self.drop_lane(instance).await;
                    self.publish(vec![NodeEvent::Quit {
                        instance,
                        reason: "quit requested".into(),
                    }])
                    .await;
                }
            }
            SessionMessage::Shutdown => {
                info!(from, "shutdown requested");
                self.cancel.cancel();
            }
            other => debug!(from, ?other, "session message ignored"),
        }
        Ok(())
    }
}

#[async_trait]
impl StreamHandler for NodeState {
    async fn on_stream(&mut self, from: PeerId, msg: StreamMessage) -> Result<(), WallError> {
        match msg {
            StreamMessage::Init(init) => self.init(from, init).await,
            StreamMessage::DisplayUpdate {
                instance,
                config_id,
                layout,
            } => {
                let mut effects = Effects::default();
                let lane = self
                    .lanes
                    .get_mut(&instance)
                    .ok_or(WallError::UnknownInstance(instance))?;
                let events = lane.downloader.enqueue_config(config_id, layout)?;
                lane.settle(events, &mut effects)?;
                self.apply(effects).await;
                Ok(())
            }
            StreamMessage::Depth { instance, depth } => {
                let lane = self
                    .lanes
                    .get_mut(&instance)
                    .ok_or(WallError::UnknownInstance(instance))?;
                lane.downloader.set_depth(depth);
                self.publish(vec![NodeEvent::Depth { instance, depth }]).await;
                Ok(())
            }
            other => {
                debug!(from, ?other, "stream message ignored");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl PerfHandler for NodeState {
    async fn on_perf(&mut self, from: PeerId, msg: PerfMessage) -> Result<(), WallError> {
        match msg {
            PerfMessage::Request {
                instance,
                interval_ms,
            } => {
                let lane = self
                    .lanes
                    .get_mut(&instance)
                    .ok_or(WallError::UnknownInstance(instance))?;
                let interval = Duration::from_millis(interval_ms.max(1));
                lane.perf_subscriber = Some((from, interval, Instant::now()));
            }
            PerfMessage::Stop { instance } => {
                if let Some(lane) = self.lanes.get_mut(&instance) {
                    lane.perf_subscriber = None;
                }
            }
            PerfMessage::Report { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl SyncHandler for NodeState {
    async fn on_sync(&mut self, _from: PeerId, msg: SyncMessage) -> Result<(), WallError> {
        let recv_us = now_us();
        let mut directives = Vec::new();
        for (id, lane) in &mut self.lanes {
            if let Some(directive) = lane.sync.as_mut().and_then(|c| c.on_message(msg, recv_us)) {
                directives.push((*id, directive));
            }
        }
        for (instance, directive) in directives {
            self.on_directive(instance, directive).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::header::GroupFlag;
    use crate::block::partition::Route;
    use crate::block::types::PixelFormat;
    use crate::control::message::StreamInfo;
    use crate::geometry::{Rect, WindowLayout};
    use crate::sync::SyncMode;
    use crate::transport::{NetConfig, TcpTransport};

    const W: u32 = 8;

    fn net() -> NetConfig {
        NetConfig {
            bind_host: "127.0.0.1".into(),
            send_buffer: 64 * 1024,
            recv_buffer: 64 * 1024,
            ..NetConfig::default()
        }
    }

    fn init(instance: u32) -> StreamInit {
        StreamInit {
            instance,
            stream: StreamInfo {
                image_width: W,
                image_height: W,
                block_width: 4,
                block_height: 4,
                format: PixelFormat::Luminance8,
                blocks_per_group: 4,
                sync_mode: SyncMode::None,
                frame_rate: 0,
            },
            route: Route::Tiles(vec![Rect::new(0, 0, W, W)]),
            tiles: vec![Rect::new(0, 0, W, W)],
            sync_group: None,
            relays: None,
        }
    }

    async fn start() -> (SocketAddr, SocketAddr, mpsc::Receiver<NodeEvent>, WallContext) {
        let ctx = WallContext::new(1, net());
        let config = NodeConfig {
            control_port: 0,
            data_port: 0,
            tick_ms: 10,
            ..NodeConfig::default()
        };
        let node = DisplayNode::bind(ctx.clone(), config).await.unwrap();
        let control = node.control_addr().unwrap();
        let data = node.data_addr();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(node.run(tx));
        (control, data, rx, ctx)
    }

    async fn ready(ctl: &mut ControlConnection) {
        assert_eq!(
            ctl.recv().await,
            Some(ControlMessage::Session(SessionMessage::NodeReady { instance: 1, node_id: 1 }))
        );
    }

    #[tokio::test]
    async fn shows_a_streamed_frame() {
        let (control, data, mut published, ctx) = start().await;
        let mut ctl = ControlConnection::connect(&control.to_string(), CancellationToken::new())
            .await
            .unwrap();
        ctl.send(StreamMessage::Init(init(1))).await.unwrap();
        ready(&mut ctl).await;
        ctl.send(StreamMessage::DisplayUpdate {
            instance: 1,
            config_id: 1,
            layout: WindowLayout::new(Rect::new(0, 0, W, W), Default::default()),
        })
        .await
        .unwrap();

        let producer = TcpTransport::new(net());
        let conn = producer
            .connect("127.0.0.1", data.port(), &Handshake::new(9, StreamType::Pixel, 0, 1))
            .await
            .unwrap();
        let spec = init(1).stream.group_spec();
        let mut config = BlockGroup::control(&spec);
        config.seal_control(GroupFlag::ConfigUpdate, 1, 1);
        producer.send_group(conn, &config).await.unwrap();
        let mut g = BlockGroup::data(&spec);
        for value in 1..=4u8 {
            g.next_block_mut().unwrap().data_mut().fill(value);
        }
        g.seal(1, 1, Some(0));
        producer.send_group(conn, &g).await.unwrap();

        match published.recv().await.unwrap() {
            NodeEvent::Swapped { instance, frame, front, .. } => {
                assert_eq!((instance, frame), (1, 1));
                let m = front[0].as_ref().unwrap();
                assert_eq!(m.buffer().row(0), &[1, 1, 1, 1, 2, 2, 2, 2]);
                assert_eq!(m.buffer().row(7), &[3, 3, 3, 3, 4, 4, 4, 4]);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Closing the only source ends the instance.
        producer.close(conn).await.unwrap();
        assert_eq!(ctl.recv().await, Some(ControlMessage::Session(SessionMessage::Quit { instance: 1 })));
        assert!(matches!(
            published.recv().await.unwrap(),
            NodeEvent::Quit { instance: 1, .. }
        ));
        ctx.shutdown();
    }

    #[tokio::test]
    async fn depth_and_quit_reach_presentation() {
        let (control, _data, mut published, ctx) = start().await;
        let mut ctl = ControlConnection::connect(&control.to_string(), CancellationToken::new())
            .await
            .unwrap();
        ctl.send(StreamMessage::Init(init(1))).await.unwrap();
        ready(&mut ctl).await;
        ctl.send(StreamMessage::Depth { instance: 1, depth: 0.5 }).await.unwrap();
        assert!(matches!(
            published.recv().await.unwrap(),
            NodeEvent::Depth { instance: 1, depth } if depth == 0.5
        ));
        ctl.send(SessionMessage::Quit { instance: 1 }).await.unwrap();
        assert!(matches!(
            published.recv().await.unwrap(),
            NodeEvent::Quit { instance: 1, .. }
        ));
        ctx.shutdown();
    }
}
