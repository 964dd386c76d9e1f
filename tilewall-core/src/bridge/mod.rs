//! Distribution bridge: accepts producer registrations, allocates
//! cluster members and relays each instance to its display nodes.
//!
//! Every member runs a [`Bridge`]. The master member allocates and
//! forwards registrations, shares and readiness reports to the other
//! members it allocated; each member relays its own block range. The
//! master also keeps an external coordinator informed.

pub mod alloc;
pub mod instance;
pub mod relay;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::WallContext;
use crate::control::connection::{ControlConnection, ControlSender};
use crate::control::dispatch::{self, PeerId, PerfHandler, SessionHandler, StreamHandler, SyncHandler};
use crate::control::message::{ControlMessage, PerfMessage, SessionMessage, StreamMessage};
use crate::error::WallError;
use crate::task::WorkerSet;

pub use alloc::{Allocation, AllocationPolicy, Allocator, MemberLoad, NodeRange};
pub use instance::{AppInstance, InstancePhase, Share};
pub use relay::{Relay, RelayEvent};

const LINK_RETRY: Duration = Duration::from_millis(500);

/// Address book entry for one bridge member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberConfig {
    pub node_id: u32,
    pub host: String,
    pub control_port: u16,
    pub data_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// This member's id; must appear in `members`.
    pub node_id: u32,
    pub control_port: u16,
    /// Port producers stream pixels to.
    pub data_port: u16,
    /// The master allocates; the others follow its lead.
    pub master: bool,
    pub members: Vec<MemberConfig>,
    pub policy: AllocationPolicy,
    /// How long an instance may wait for its first share to become
    /// ready. `None` waits forever.
    pub ready_timeout_ms: Option<u64>,
    /// Groups in each instance's relay pool.
    pub pool_groups: usize,
    /// Control address of the external coordinator.
    pub coordinator: Option<String>,
    pub tick_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            control_port: 13000,
            data_port: 13001,
            master: true,
            members: vec![MemberConfig {
                node_id: 0,
                host: "127.0.0.1".to_string(),
                control_port: 13000,
                data_port: 13001,
            }],
            policy: AllocationPolicy::SingleNode,
            ready_timeout_ms: None,
            pool_groups: 32,
            coordinator: None,
            tick_ms: 100,
        }
    }
}

impl BridgeConfig {
    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn member(&self, node_id: u32) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.node_id == node_id)
    }

    pub fn validate(&self) -> Result<(), WallError> {
        if self.member(self.node_id).is_none() {
            return Err(WallError::InvalidConfig(format!(
                "bridge member {} is missing from the member list",
                self.node_id
            )));
        }
        if self.pool_groups == 0 {
            return Err(WallError::InvalidConfig("relay pool must not be empty".into()));
        }
        Ok(())
    }
}

/// Sync group of the `share`-th share of `instance`. Derived rather
/// than counted so every member agrees on it.
pub fn share_sync_group(instance: u32, share: usize) -> u32 {
    (instance << 8) | (share as u32 & 0xff)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Member(u32),
    Coordinator,
}

enum Event {
    Message(PeerId, ControlMessage),
    Closed(PeerId),
    Linked(Link, ControlConnection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Quit,
    TimedOut,
    Lost,
}

pub struct Bridge {
    ctx: WallContext,
    config: BridgeConfig,
    control: TcpListener,
    data_addr: SocketAddr,
}

impl Bridge {
    /// Bind the control listener and the relay's data port.
    pub async fn bind(ctx: WallContext, config: BridgeConfig) -> Result<Self, WallError> {
        config.validate()?;
        let control = TcpListener::bind((ctx.net().bind_host.as_str(), config.control_port)).await?;
        let data_addr = ctx.transport().listen(config.data_port).await?;
        info!(
            node = config.node_id,
            control = %control.local_addr()?,
            data = %data_addr,
            master = config.master,
            "bridge listening"
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
    pub async fn run(self) -> Result<(), WallError> {
        let cancel = self.ctx.cancel_token().clone();
        let (events_tx, mut events) = mpsc::channel::<Event>(256);
        let (relay_tx, mut relay_events) = mpsc::channel::<RelayEvent>(256);
        let relay = Relay::new(
            self.config.node_id,
            self.ctx.transport().clone(),
            self.config.pool_groups,
            relay_tx,
            cancel.child_token(),
        );

        let mut workers = WorkerSet::new(cancel.child_token());
        {
            let relay = relay.clone();
            workers.spawn("relay", move |_| relay.serve());
        }
        if self.config.master {
            for member in self.config.members.iter().filter(|m| m.node_id != self.config.node_id) {
                let addr = format!("{}:{}", member.host, member.control_port);
                let link = Link::Member(member.node_id);
                let tx = events_tx.clone();
                workers.spawn("member-link", move |token| connect_link(addr, link, tx, token));
            }
        }
        if let Some(addr) = self.config.coordinator.clone() {
            let tx = events_tx.clone();
            workers.spawn("coordinator-link", move |token| {
                connect_link(addr, Link::Coordinator, tx, token)
            });
        }

        let allocator = if self.config.master {
            let members = self.config.members.iter().map(|m| m.node_id);
            Some(Allocator::new(self.config.policy, members)?)
        } else {
            None
        };
        let mut state = BridgeState {
            node_id: self.config.node_id,
            ready_timeout: self.config.ready_timeout(),
            allocator,
            instances: HashMap::new(),
            relay,
            peers: HashMap::new(),
            members: HashMap::new(),
            coordinator: None,
            next_peer: 1,
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
                    let peer = state.attach(ControlConnection::new(stream, cancel.child_token()), None, &events_tx);
                    debug!(peer, %addr, "control peer connected");
                }
                Some(event) = events.recv() => match event {
                    Event::Message(peer, msg) => {
                        if let Err(e) = dispatch::dispatch(&mut state, peer, msg).await {
                            warn!(peer, error = %e, "control message failed");
                        }
                    }
                    Event::Closed(peer) => state.peer_closed(peer).await,
                    Event::Linked(link, conn) => {
                        let peer = state.attach(conn, Some(link), &events_tx);
                        info!(peer, ?link, "link established");
                    }
                },
                Some(event) = relay_events.recv() => state.on_relay(event).await,
                Some(event) = workers.recv() => workers.process_event(&event),
                _ = tick.tick() => state.tick(Instant::now()).await,
            }
        }

        workers.shutdown(Duration::from_secs(1)).await;
        let ids: Vec<u32> = state.instances.keys().copied().collect();
        for id in ids {
            state.relay.drop_instance(id).await;
        }
        info!(node = self.config.node_id, "bridge stopped");
        Ok(())
    }
}

async fn connect_link(
    addr: String,
    link: Link,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<(), WallError> {
    let conn = ControlConnection::connect_retrying(&addr, LINK_RETRY, cancel).await?;
    events.send(Event::Linked(link, conn)).await?;
    Ok(())
}

struct BridgeState {
    node_id: u32,
    ready_timeout: Option<Duration>,
    /// Present on the master only.
    allocator: Option<Allocator>,
    instances: HashMap<u32, AppInstance>,
    relay: Relay,
    peers: HashMap<PeerId, ControlSender>,
    /// Master's links to the other members.
    members: HashMap<u32, PeerId>,
    coordinator: Option<PeerId>,
    next_peer: PeerId,
    cancel: CancellationToken,
}

impl BridgeState {
    fn is_master(&self) -> bool {
        self.allocator.is_some()
    }

    fn attach(&mut self, conn: ControlConnection, link: Option<Link>, events: &mpsc::Sender<Event>) -> PeerId {
        let peer = self.next_peer;
        self.next_peer += 1;
        let (tx, mut rx, token) = conn.into_parts();
        self.peers.insert(peer, tx);
        match link {
            Some(Link::Member(id)) => {
                self.members.insert(id, peer);
            }
            Some(Link::Coordinator) => self.coordinator = Some(peer),
            None => {}
        }
        let events = events.clone();
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
        let Some(tx) = self.peers.get(&peer) else {
            debug!(peer, "control peer gone");
            return;
        };
        if tx.send(msg.into()).await.is_err() {
            debug!(peer, "control peer gone");
        }
    }

    async fn report(&self, msg: impl Into<ControlMessage>) {
        if let Some(peer) = self.coordinator {
            self.send_to(peer, msg).await;
        }
    }

    /// Forward `msg` to the other members relaying `instance`.
    async fn forward(&self, instance: u32, msg: ControlMessage) {
        if !self.is_master() {
            return;
        }
        let Some(allocation) = self.instances.get(&instance).and_then(|i| i.allocation()) else {
            return;
        };
        for node in allocation.nodes().filter(|n| *n != self.node_id) {
            match self.members.get(&node) {
                Some(&peer) => self.send_to(peer, msg.clone()).await,
                None => warn!(instance, member = node, "no link to bridge member"),
            }
        }
    }

    fn instance_mut(&mut self, instance: u32) -> Result<&mut AppInstance, WallError> {
        self.instances
            .get_mut(&instance)
            .ok_or(WallError::UnknownInstance(instance))
    }

    fn relays_locally(&self, instance: u32) -> bool {
        self.instances
            .get(&instance)
            .and_then(|i| i.allocation())
            .is_some_and(|a| a.contains(self.node_id))
    }

    async fn register(
        &mut self,
        from: PeerId,
        instance: AppInstance,
    ) -> Result<(), WallError> {
        let id = instance.id;
        if self.instances.contains_key(&id) {
            warn!(instance = id, "instance registered twice");
            return Ok(());
        }
        let stream = instance.stream;
        let register = SessionMessage::Register {
            instance: id,
            app_name: instance.app_name.clone(),
            stream,
            layout: instance.layout,
            audio: instance.audio,
        };
        self.instances.insert(id, instance);

        let Some(allocator) = self.allocator.as_mut() else {
            debug!(instance = id, "registration noted, waiting for allocation");
            return Ok(());
        };
        let allocation = allocator.allocate(id, stream.partition()?.block_count())?;
        info!(
            instance = id,
            primary = allocation.primary,
            members = allocation.ranges.len(),
            "instance allocated"
        );
        let inst = self.instance_mut(id)?;
        inst.producer = Some(from);
        inst.set_allocation(allocation.clone())?;
        if allocation.contains(self.node_id) {
            self.relay.register(id, &stream)?;
        }

        let allocated = SessionMessage::Allocated {
            instance: id,
            allocation,
        };
        self.forward(id, register.into()).await;
        self.forward(id, allocated.clone().into()).await;
        self.send_to(from, allocated.clone()).await;
        self.report(allocated).await;
        Ok(())
    }

    /// Open every share whose nodes are all ready.
    async fn start_ready_shares(&mut self, instance: u32) {
        let local = self.relays_locally(instance);
        let Some(inst) = self.instances.get(&instance) else {
            return;
        };
        if local && !inst.phase().is_connected() {
            return;
        }
        for index in inst.startable_shares() {
            let Some(share) = self.instances.get(&instance).and_then(|i| i.shares().get(index).cloned()) else {
                continue;
            };
            if local {
                if let Err(e) = self.relay.add_destinations(instance, &share.destinations).await {
                    warn!(instance, error = %e, "relay destinations failed");
                    self.tear_down(instance, Teardown::Lost).await;
                    return;
                }
            }
            let Ok(inst) = self.instance_mut(instance) else {
                return;
            };
            inst.activate_share(index);
            if local && !inst.phase().is_streaming() {
                if let Err(e) = inst.phase_mut().start_streaming() {
                    warn!(instance, error = %e, "phase change refused");
                }
            }
            let Some(allocation) = inst.allocation().cloned() else {
                continue;
            };
            info!(instance, share = index, nodes = share.destinations.len(), "share started");
            if self.is_master() {
                self.report(StreamMessage::Shared {
                    instance,
                    allocation,
                    nodes: share.nodes().into_iter().collect(),
                    sync_group: share.sync_group,
                })
                .await;
            }
        }
    }

    async fn tear_down(&mut self, instance: u32, why: Teardown) {
        let Some(mut inst) = self.instances.remove(&instance) else {
            return;
        };
        // Forward before the allocation is forgotten.
        if self.is_master() {
            if let Some(allocation) = inst.allocation() {
                for node in allocation.nodes().filter(|n| *n != self.node_id) {
                    if let Some(&peer) = self.members.get(&node) {
                        self.send_to(peer, SessionMessage::Quit { instance }).await;
                    }
                }
            }
        }
        let _ = inst.phase_mut().tear_down();
        self.relay.drop_instance(instance).await;
        if let Some(allocator) = self.allocator.as_mut() {
            allocator.release(instance);
        }
        info!(instance, ?why, "instance torn down");

        if !self.is_master() {
            return;
        }
        match why {
            Teardown::TimedOut => {
                let msg = SessionMessage::TimedOut { instance };
                if let Some(producer) = inst.producer {
                    self.send_to(producer, msg.clone()).await;
                }
                self.report(msg).await;
            }
            Teardown::Lost => self.report(SessionMessage::Quit { instance }).await,
            Teardown::Quit => self.report(SessionMessage::Quit { instance }).await,
        }
    }

    async fn on_relay(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::ProducerConnected { instance, conn } => {
                let Ok(inst) = self.instance_mut(instance) else {
                    return;
                };
                if let Err(e) = inst.phase_mut().connect() {
                    debug!(instance, conn, error = %e, "extra producer link");
                }
                self.start_ready_shares(instance).await;
            }
            RelayEvent::ProducerClosed {
                instance,
                conn,
                reason,
            } => {
                warn!(instance, conn, %reason, "producer link lost");
                self.tear_down(instance, Teardown::Lost).await;
            }
            RelayEvent::FrameRelayed {
                instance,
                frame,
                bytes,
                blocks,
            } => {
                let member = self.node_id;
                if let Ok(inst) = self.instance_mut(instance) {
                    inst.record_relayed(member, bytes, blocks);
                    debug!(instance, frame, bytes, blocks, "frame relayed");
                }
            }
            RelayEvent::DestinationLost {
                instance,
                node_id,
                reason,
            } => {
                warn!(instance, node = node_id, %reason, "display node dropped from relay");
            }
        }
    }

    async fn tick(&mut self, now: Instant) {
        if self.is_master() {
            let expired: Vec<u32> = self
                .instances
                .values()
                .filter(|i| i.ready_expired(now, self.ready_timeout))
                .map(|i| i.id)
                .collect();
            for instance in expired {
                if let Some(after) = self.ready_timeout {
                    warn!(
                        error = %WallError::RegistrationTimeout { instance, after },
                        "instance never became ready"
                    );
                }
                self.tear_down(instance, Teardown::TimedOut).await;
            }
        }

        let mut reports = Vec::new();
        for inst in self.instances.values_mut() {
            if let Some(allocator) = self.allocator.as_mut() {
                allocator.set_bandwidth(inst.id, inst.perf.current_bps());
            }
            let Some((peer, interval, last)) = inst.perf_subscriber else {
                continue;
            };
            if now.saturating_duration_since(last) >= interval {
                let report = inst.perf.report_at(now);
                inst.perf_subscriber = Some((peer, interval, now));
                reports.push((peer, inst.id, report));
            }
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

    async fn peer_closed(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        if self.coordinator == Some(peer) {
            warn!("coordinator link lost");
            self.coordinator = None;
        }
        self.members.retain(|node, p| {
            if *p == peer {
                warn!(member = *node, "bridge member link lost");
            }
            *p != peer
        });
        let orphaned: Vec<u32> = self
            .instances
            .values()
            .filter(|i| i.producer == Some(peer))
            .map(|i| i.id)
            .collect();
        for instance in orphaned {
            self.tear_down(instance, Teardown::Lost).await;
        }
        for inst in self.instances.values_mut() {
            if inst.perf_subscriber.is_some_and(|(p, _, _)| p == peer) {
                inst.perf_subscriber = None;
            }
        }
    }
}

#[async_trait]
impl SessionHandler for BridgeState {
    async fn on_session(&mut self, from: PeerId, msg: SessionMessage) -> Result<(), WallError> {
        match msg {
            SessionMessage::Register {
                instance,
                app_name,
                stream,
                layout,
                audio,
            } => {
                let inst = AppInstance::new(instance, app_name, stream, layout, audio);
                self.register(from, inst).await
            }
            SessionMessage::Allocated {
                instance,
                allocation,
            } => {
                let local = allocation.contains(self.node_id);
                let inst = self.instance_mut(instance)?;
                inst.set_allocation(allocation)?;
                let stream = inst.stream;
                if local {
                    self.relay.register(instance, &stream)?;
                }
                Ok(())
            }
            SessionMessage::NodeReady { instance, node_id } => {
                self.instance_mut(instance)?.mark_ready(node_id);
                self.forward(instance, SessionMessage::NodeReady { instance, node_id }.into())
                    .await;
                self.start_ready_shares(instance).await;
                Ok(())
            }
            SessionMessage::Quit { instance } | SessionMessage::TimedOut { instance } => {
                self.tear_down(instance, Teardown::Quit).await;
                Ok(())
            }
            SessionMessage::Shutdown => {
                info!(from, "shutdown requested");
                self.cancel.cancel();
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StreamHandler for BridgeState {
    async fn on_stream(&mut self, from: PeerId, msg: StreamMessage) -> Result<(), WallError> {
        match msg {
            StreamMessage::Share { instance, nodes } => {
                let inst = self.instance_mut(instance)?;
                let index = inst.shares().len();
                let distinct = nodes
                    .iter()
                    .map(|d| d.node_id)
                    .collect::<std::collections::BTreeSet<_>>()
                    .len();
                let sync_group = (inst.stream.sync_mode.is_synchronized() && distinct > 1)
                    .then(|| share_sync_group(instance, index));
                inst.add_share(nodes.clone(), sync_group);
                debug!(instance, share = index, ?sync_group, "share added");
                self.forward(instance, StreamMessage::Share { instance, nodes }.into())
                    .await;
                self.start_ready_shares(instance).await;
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
impl PerfHandler for BridgeState {
    async fn on_perf(&mut self, from: PeerId, msg: PerfMessage) -> Result<(), WallError> {
        match msg {
            PerfMessage::Request {
                instance,
                interval_ms,
            } => {
                let interval = Duration::from_millis(interval_ms.max(1));
                self.instance_mut(instance)?.perf_subscriber = Some((from, interval, Instant::now()));
            }
            PerfMessage::Stop { instance } => {
                self.instance_mut(instance)?.perf_subscriber = None;
            }
            PerfMessage::Report { .. } => {}
        }
        Ok(())
    }
}

impl SyncHandler for BridgeState {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::BlockGroup;
    use crate::block::header::GroupFlag;
    use crate::block::partition::Route;
    use crate::block::types::PixelFormat;
    use crate::control::message::StreamInfo;
    use crate::geometry::{Rect, WindowLayout};
    use crate::streamer::config::Destination;
    use crate::sync::SyncMode;
    use crate::transport::{Handshake, NetConfig, StreamType, TcpTransport, Transport};
    use std::sync::Arc;

    fn net() -> NetConfig {
        NetConfig {
            bind_host: "127.0.0.1".into(),
            send_buffer: 64 * 1024,
            recv_buffer: 64 * 1024,
            ..NetConfig::default()
        }
    }

    fn stream() -> StreamInfo {
        StreamInfo {
            image_width: 8,
            image_height: 8,
            block_width: 4,
            block_height: 4,
            format: PixelFormat::Luminance8,
            blocks_per_group: 4,
            sync_mode: SyncMode::None,
            frame_rate: 0,
        }
    }

    fn register(instance: u32) -> ControlMessage {
        SessionMessage::Register {
            instance,
            app_name: "viewer".into(),
            stream: stream(),
            layout: WindowLayout::new(Rect::new(0, 0, 8, 8), Default::default()),
            audio: false,
        }
        .into()
    }

    async fn start(ready_timeout_ms: Option<u64>) -> (SocketAddr, SocketAddr, WallContext) {
        let ctx = WallContext::new(50, net());
        let config = BridgeConfig {
            node_id: 50,
            control_port: 0,
            data_port: 0,
            members: vec![MemberConfig {
                node_id: 50,
                host: "127.0.0.1".into(),
                control_port: 0,
                data_port: 0,
            }],
            ready_timeout_ms,
            tick_ms: 10,
            ..BridgeConfig::default()
        };
        let bridge = Bridge::bind(ctx.clone(), config).await.unwrap();
        let control = bridge.control_addr().unwrap();
        let data = bridge.data_addr();
        tokio::spawn(bridge.run());
        (control, data, ctx)
    }

    #[test]
    fn config_requires_self_in_members() {
        let c = BridgeConfig {
            node_id: 9,
            ..BridgeConfig::default()
        };
        assert!(c.validate().is_err());
        BridgeConfig::default().validate().unwrap();
        assert_eq!(share_sync_group(3, 1), 0x301);
    }

    #[tokio::test]
    async fn relays_registered_instance_to_ready_nodes() {
        let (control, data, ctx) = start(None).await;
        let mut producer = ControlConnection::connect(&control.to_string(), CancellationToken::new())
            .await
            .unwrap();
        producer.send(register(1)).await.unwrap();
        match producer.recv().await {
            Some(ControlMessage::Session(SessionMessage::Allocated { instance, allocation })) => {
                assert_eq!(instance, 1);
                assert_eq!(allocation.primary, 50);
                assert_eq!(allocation.range_of(50).unwrap().len(), 4);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Display node listening for the relay.
        let node: Arc<dyn Transport> = Arc::new(TcpTransport::new(net()));
        let node_addr = node.listen(0).await.unwrap();
        let accept = {
            let node = node.clone();
            tokio::spawn(async move { node.accept_connection().await })
        };
        producer
            .send(StreamMessage::Share {
                instance: 1,
                nodes: vec![Destination {
                    node_id: 7,
                    host: "127.0.0.1".into(),
                    port: node_addr.port(),
                    route: Route::Blocks { start: 0, end: 4 },
                }],
            })
            .await
            .unwrap();
        producer
            .send(SessionMessage::NodeReady { instance: 1, node_id: 7 })
            .await
            .unwrap();

        // Producer data link; the share opens once it is up.
        let pixels: Arc<dyn Transport> = Arc::new(TcpTransport::new(net()));
        let conn = pixels
            .connect("127.0.0.1", data.port(), &Handshake::new(1, StreamType::Pixel, 0, 1))
            .await
            .unwrap();
        let (node_conn, hs) = accept.await.unwrap().unwrap();
        assert_eq!(hs.stream_type, StreamType::Relay);
        assert_eq!(hs.sender_id, 50);

        // The relay may still be attaching the node link, so keep
        // sending frames until one gets through.
        let spec = stream().group_spec();
        let sender = {
            let pixels = pixels.clone();
            tokio::spawn(async move {
                let mut config = BlockGroup::control(&spec);
                config.seal_control(GroupFlag::ConfigUpdate, 1, 1);
                pixels.send_group(conn, &config).await?;
                let mut g = BlockGroup::data(&spec);
                for _ in 0..4 {
                    g.next_block_mut().unwrap().data_mut().fill(3);
                }
                for frame in 1.. {
                    g.seal(frame, 1, Some(0));
                    pixels.send_group(conn, &g).await?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok::<(), WallError>(())
            })
        };

        let mut got = BlockGroup::data(&spec);
        loop {
            node.recv_group(node_conn, &mut got).await.unwrap();
            if got.flag() == GroupFlag::PixelData {
                break;
            }
        }
        assert_eq!(got.len(), 4);
        assert!(got.blocks().iter().all(|b| b.data().iter().all(|p| *p == 3)));
        sender.abort();
        ctx.shutdown();
    }

    #[tokio::test]
    async fn unready_instance_times_out() {
        let (control, _data, ctx) = start(Some(50)).await;
        let mut producer = ControlConnection::connect(&control.to_string(), CancellationToken::new())
            .await
            .unwrap();
        producer.send(register(2)).await.unwrap();
        assert!(matches!(
            producer.recv().await,
            Some(ControlMessage::Session(SessionMessage::Allocated { .. }))
        ));
        assert_eq!(
            producer.recv().await,
            Some(ControlMessage::Session(SessionMessage::TimedOut { instance: 2 }))
        );
        ctx.shutdown();
    }
}
