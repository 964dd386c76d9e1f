//! Background half of the streamer: cuts frames into groups and sends
//! them to every destination.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::header::GroupFlag;
use crate::block::partition::BlockPartition;
use crate::block::pool::{BlockPool, GroupKind};
use crate::block::types::FrameBuffer;
use crate::error::WallError;
use crate::geometry::WindowLayout;
use crate::streamer::StreamEvent;
use crate::streamer::config::Destination;
use crate::transport::{ConnId, Handshake, Transport};

pub(crate) enum Job {
    Frame { frame: u32, buffer: FrameBuffer },
    Reconfigure { config_id: u32, layout: WindowLayout },
    AddDestinations { config_id: u32, destinations: Vec<Destination> },
}

pub(crate) struct Link {
    pub destination: Destination,
    pub conn: ConnId,
    /// Block ids in wire order under the current layout.
    pub table: Vec<u32>,
    /// Config id this link was last told about.
    pub announced: Option<u32>,
}

pub(crate) struct Worker {
    pub instance: u32,
    pub handshake: Handshake,
    pub transport: Arc<dyn Transport>,
    pub partition: BlockPartition,
    pub pool: BlockPool,
    pub layout: WindowLayout,
    pub config_id: u32,
    pub links: Vec<Link>,
    pub frame_interval: Option<Duration>,
    pub jobs: mpsc::Receiver<Job>,
    pub spare: mpsc::Sender<FrameBuffer>,
    pub events: mpsc::Sender<StreamEvent>,
    pub cancel: CancellationToken,
    /// Cancelled when the worker stops for any reason.
    pub closed: CancellationToken,
}

impl Worker {
    pub async fn run(mut self) {
        let reason = match self.serve().await {
            Err(WallError::Cancelled) => Ok(()),
            other => other,
        };
        match &reason {
            Ok(()) => debug!(instance = self.instance, "streamer stopped"),
            Err(e) => warn!(instance = self.instance, error = %e, "streamer lost its transport"),
        }
        self.closed.cancel();
        for link in &self.links {
            let _ = self.transport.close(link.conn).await;
        }
        if let Err(e) = reason {
            let _ = self
                .events
                .send(StreamEvent::Quit {
                    instance: self.instance,
                    reason: e.to_string(),
                })
                .await;
        }
    }

    async fn serve(&mut self) -> Result<(), WallError> {
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => return Ok(()),
                },
            };
            match job {
                Job::Frame { frame, buffer } => {
                    let started = Instant::now();
                    let cancel = self.cancel.clone();
                    let sent = tokio::select! {
                        sent = self.transmit(frame, &buffer) => sent,
                        _ = cancel.cancelled() => Err(WallError::Cancelled),
                    };
                    // The buffer is free again whatever happened to it.
                    let _ = self.spare.send(buffer).await;
                    let bytes = sent?;
                    let _ = self.events.try_send(StreamEvent::FrameSent {
                        instance: self.instance,
                        frame,
                        bytes,
                    });
                    if let Some(interval) = self.frame_interval {
                        pace(started, interval).await;
                    }
                }
                Job::Reconfigure { config_id, layout } => {
                    self.layout = layout;
                    self.config_id = config_id;
                    self.rebuild_tables();
                    info!(instance = self.instance, config_id, "layout changed");
                }
                Job::AddDestinations {
                    config_id,
                    destinations,
                } => {
                    for destination in destinations {
                        let link = connect(&self.transport, &self.handshake, destination).await?;
                        self.links.push(link);
                    }
                    self.config_id = config_id;
                    self.rebuild_tables();
                    info!(
                        instance = self.instance,
                        config_id,
                        links = self.links.len(),
                        "destinations added"
                    );
                }
            }
        }
    }

    pub fn rebuild_tables(&mut self) {
        for link in &mut self.links {
            link.table = self
                .partition
                .route_table(&self.layout, &link.destination.route);
        }
    }

    /// Send one frame to every link concurrently. Returns bytes sent.
    async fn transmit(&mut self, frame: u32, buffer: &FrameBuffer) -> Result<usize, WallError> {
        let config_id = self.config_id;
        let sends = self.links.iter_mut().map(|link| {
            send_frame(
                self.transport.as_ref(),
                &self.pool,
                &self.partition,
                link,
                frame,
                config_id,
                buffer,
            )
        });
        let sent = try_join_all(sends).await?;
        Ok(sent.into_iter().sum())
    }
}

pub(crate) async fn connect(
    transport: &Arc<dyn Transport>,
    handshake: &Handshake,
    destination: Destination,
) -> Result<Link, WallError> {
    let conn = transport
        .connect(&destination.host, destination.port, handshake)
        .await?;
    info!(
        node = destination.node_id,
        host = %destination.host,
        port = destination.port,
        conn,
        "destination connected"
    );
    Ok(Link {
        destination,
        conn,
        table: Vec::new(),
        announced: None,
    })
}

async fn send_frame(
    transport: &dyn Transport,
    pool: &BlockPool,
    partition: &BlockPartition,
    link: &mut Link,
    frame: u32,
    config_id: u32,
    buffer: &FrameBuffer,
) -> Result<usize, WallError> {
    let mut bytes = 0;
    if link.announced != Some(config_id) {
        bytes += send_control(transport, pool, link.conn, GroupFlag::ConfigUpdate, frame, config_id).await?;
        link.announced = Some(config_id);
    }

    for (index, ids) in link.table.chunks(pool.spec().blocks_per_group).enumerate() {
        let mut group = pool.acquire(GroupKind::Data).await?;
        let filled = ids.iter().try_for_each(|&id| match group.next_block_mut() {
            Some(block) => partition.extract_block(buffer, id, block),
            None => Ok(()),
        });
        if let Err(e) = filled {
            pool.release(group);
            return Err(e);
        }
        let first = (index * pool.spec().blocks_per_group) as u32;
        group.seal(frame, config_id, Some(first));
        let sent = transport.send_group(link.conn, &group).await;
        pool.release(group);
        bytes += sent?;
    }

    bytes += send_control(transport, pool, link.conn, GroupFlag::EndFrame, frame, config_id).await?;
    Ok(bytes)
}

async fn send_control(
    transport: &dyn Transport,
    pool: &BlockPool,
    conn: ConnId,
    flag: GroupFlag,
    frame: u32,
    config_id: u32,
) -> Result<usize, WallError> {
    let mut group = pool.acquire(GroupKind::Control).await?;
    group.seal_control(flag, frame, config_id);
    let sent = transport.send_group(conn, &group).await;
    pool.release(group);
    sent
}

/// Sleep for the remainder of the frame interval.
async fn pace(started: Instant, interval: Duration) {
    let elapsed = started.elapsed();
    if elapsed < interval {
        tokio::time::sleep(interval - elapsed).await;
    }
}
