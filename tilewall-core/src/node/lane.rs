//! One streamed instance on a display node.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::block::header::GroupHeader;
use crate::block::pool::{BlockPool, GroupKind};
use crate::control::dispatch::PeerId;
use crate::control::message::{StreamInit, SyncMessage};
use crate::download::{DownloadEvent, Downloader};
use crate::error::WallError;
use crate::node::{Event, NodeEvent};
use crate::sync::SyncClient;
use crate::transport::{ConnId, Transport};

pub(crate) struct Lane {
    pub init: StreamInit,
    pub downloader: Downloader,
    pub pool: BlockPool,
    pub sync: Option<SyncClient>,
    /// Peer that sent the init; quit notices go there.
    pub owner: PeerId,
    pub conns: Vec<ConnId>,
    pub cancel: CancellationToken,
    pub perf_subscriber: Option<(PeerId, Duration, Instant)>,
}

/// Output of feeding events through a lane.
#[derive(Default)]
pub(crate) struct Effects {
    pub sync: Vec<SyncMessage>,
    pub published: Vec<NodeEvent>,
}

impl Lane {
    /// Act on downloader events until none are left. Frames of an
    /// instance without a sync group are released on the spot.
    pub fn settle(&mut self, events: Vec<DownloadEvent>, effects: &mut Effects) -> Result<(), WallError> {
        let instance = self.init.instance;
        let mut queue: VecDeque<DownloadEvent> = events.into();
        while let Some(event) = queue.pop_front() {
            match event {
                DownloadEvent::FrameReady(frame) => match self.sync.as_mut() {
                    Some(client) if !client.is_evicted() => {
                        effects.sync.push(client.ready(frame, Instant::now()));
                    }
                    _ => queue.extend(self.downloader.process_sync(frame)?),
                },
                DownloadEvent::Swapped(frame) => effects.published.push(NodeEvent::Swapped {
                    instance,
                    frame,
                    depth: self.downloader.depth(),
                    front: Arc::new(self.downloader.front().to_vec()),
                }),
                DownloadEvent::Reconfigured { config_id } => {
                    debug!(instance, config_id, "lane reconfigured");
                }
                DownloadEvent::Cleared => effects.published.push(NodeEvent::Cleared { instance }),
            }
        }
        Ok(())
    }
}

/// Pump groups from one data connection into the event loop.
pub(crate) async fn receive(
    transport: Arc<dyn Transport>,
    instance: u32,
    conn: ConnId,
    pool: BlockPool,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<(), WallError> {
    loop {
        // Signals already waiting go into payload-free groups.
        let control = transport
            .peek_header(conn)
            .await
            .ok()
            .flatten()
            .filter(GroupHeader::is_control)
            .and_then(|_| pool.try_acquire(GroupKind::Control));
        let mut group = match control {
            Some(group) => group,
            None => pool.acquire_or_cancel(GroupKind::Data, &cancel).await?,
        };
        let received = tokio::select! {
            _ = cancel.cancelled() => None,
            received = transport.recv_group(conn, &mut group) => Some(received),
        };
        let Some(received) = received else {
            pool.release(group);
            return Err(WallError::Cancelled);
        };
        if let Err(e) = received {
            pool.release(group);
            let _ = events
                .send(Event::SourceClosed {
                    instance,
                    conn,
                    reason: e.to_string(),
                })
                .await;
            return Err(e);
        }
        if let Err(mpsc::error::SendError(event)) = events.send(Event::Group { instance, conn, group }).await {
            if let Event::Group { group, .. } = event {
                pool.release(group);
            }
            return Err(WallError::ChannelClosed);
        }
    }
}
