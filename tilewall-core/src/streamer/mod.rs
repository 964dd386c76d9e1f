//! Producer side: double-buffered frames cut into groups and sent to
//! every destination in the background.
//!
//! The caller draws into [`Streamer::get_buffer`] and hands the frame
//! off with [`Streamer::swap_buffer`]. Only one frame is in flight at a
//! time; while it drains, a non-blocking swap reports
//! [`SwapOutcome::Busy`] and a blocking swap waits.
//!
//! Frame ids count transmitted frames only: a swap skipped by the
//! throttle leaves the counter alone, so receivers always see
//! consecutive ids.

pub mod config;
mod worker;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::block::pool::{BlockPool, PoolOptions};
use crate::block::types::FrameBuffer;
use crate::context::WallContext;
use crate::control::message::StreamInfo;
use crate::error::WallError;
use crate::geometry::WindowLayout;
use crate::transport::{Handshake, StreamType};

pub use config::{Destination, StreamerConfig};

use worker::{Job, Worker};

const JOB_QUEUE: usize = 8;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapMode {
    NonBlocking,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The frame was handed off under this frame id.
    Swapped(u32),
    /// The previous frame is still draining; nothing changed.
    Busy,
    /// The throttle dropped this swap. The write buffer keeps its
    /// contents and no frame id was used.
    Throttled,
}

/// Transmit one frame out of every `skip + 1` swaps.
#[derive(Debug, Default)]
struct Throttle {
    skip: u32,
    position: u32,
}

impl Throttle {
    fn set(&mut self, skip: u32) {
        self.skip = skip;
        self.position = 0;
    }

    /// Whether the next swap falls outside the transmit slot.
    fn skips_next(&self) -> bool {
        self.position != 0
    }

    fn advance(&mut self) {
        self.position = (self.position + 1) % (self.skip + 1);
    }
}

/// Reported by the background path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    FrameSent { instance: u32, frame: u32, bytes: usize },
    /// The transport failed; the stream is closed for good.
    Quit { instance: u32, reason: String },
}

pub struct Streamer {
    info: StreamInfo,
    write: FrameBuffer,
    spare: mpsc::Receiver<FrameBuffer>,
    jobs: mpsc::Sender<Job>,
    frame: u32,
    config_id: u32,
    layout: WindowLayout,
    throttle: Throttle,
    closed: CancellationToken,
    worker: JoinHandle<()>,
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("frame", &self.frame)
            .field("config_id", &self.config_id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl Streamer {
    /// Connect to every configured destination and start the
    /// background path. Config id 1 carries `config.layout`.
    pub async fn start(
        ctx: &WallContext,
        config: StreamerConfig,
    ) -> Result<(Self, mpsc::Receiver<StreamEvent>), WallError> {
        config.validate()?;
        let info = config.stream_info();
        let partition = info.partition()?;
        let pool = BlockPool::new(info.group_spec(), config.pool_groups, PoolOptions::CTRL_GROUP)?;
        let handshake = Handshake::new(
            config.sender_id,
            StreamType::Pixel,
            config.frame_rate,
            config.instance,
        );

        let transport = ctx.transport().clone();
        let mut links = Vec::with_capacity(config.destinations.len());
        for destination in config.destinations {
            links.push(worker::connect(&transport, &handshake, destination).await?);
        }

        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE);
        let (spare_tx, spare_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        spare_tx
            .try_send(FrameBuffer::new(info.image_width, info.image_height, info.format))
            .map_err(|_| WallError::ChannelClosed)?;

        let closed = CancellationToken::new();
        let config_id = 1;
        let mut worker = Worker {
            instance: config.instance,
            handshake,
            transport,
            partition,
            pool,
            layout: config.layout,
            config_id,
            links,
            frame_interval: (config.frame_rate > 0)
                .then(|| Duration::from_secs_f64(1.0 / config.frame_rate as f64)),
            jobs: jobs_rx,
            spare: spare_tx,
            events: events_tx,
            cancel: ctx.cancel_token().child_token(),
            closed: closed.clone(),
        };
        worker.rebuild_tables();
        info!(
            instance = config.instance,
            app = %config.app_name,
            destinations = worker.links.len(),
            "streamer started"
        );
        let handle = tokio::spawn(worker.run());

        Ok((
            Self {
                info,
                write: FrameBuffer::new(info.image_width, info.image_height, info.format),
                spare: spare_rx,
                jobs: jobs_tx,
                frame: 0,
                config_id,
                layout: config.layout,
                throttle: Throttle::default(),
                closed,
                worker: handle,
            },
            events_rx,
        ))
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Id of the last frame handed off for transmission.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    pub fn config_id(&self) -> u32 {
        self.config_id
    }

    pub fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// The buffer to draw the next frame into.
    pub fn get_buffer(&mut self) -> &mut FrameBuffer {
        &mut self.write
    }

    pub async fn swap_buffer(&mut self, mode: SwapMode) -> Result<SwapOutcome, WallError> {
        if self.is_closed() {
            return Err(WallError::StreamClosed);
        }
        if self.throttle.skips_next() {
            self.throttle.advance();
            debug!(frame = self.frame, "swap throttled");
            return Ok(SwapOutcome::Throttled);
        }
        let next = match mode {
            SwapMode::NonBlocking => match self.spare.try_recv() {
                Ok(buffer) => buffer,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(SwapOutcome::Busy),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(WallError::StreamClosed),
            },
            SwapMode::Blocking => tokio::select! {
                buffer = self.spare.recv() => buffer.ok_or(WallError::StreamClosed)?,
                _ = self.closed.cancelled() => return Err(WallError::StreamClosed),
            },
        };
        self.throttle.advance();
        let buffer = std::mem::replace(&mut self.write, next);
        self.frame += 1;
        let frame = self.frame;
        self.jobs
            .send(Job::Frame { frame, buffer })
            .await
            .map_err(|_| WallError::StreamClosed)?;
        Ok(SwapOutcome::Swapped(frame))
    }

    /// Move or rotate the window. Returns the config id receivers must
    /// be told about alongside `layout`.
    pub async fn update_layout(&mut self, layout: WindowLayout) -> Result<u32, WallError> {
        self.config_id += 1;
        self.layout = layout;
        self.send_job(Job::Reconfigure {
            config_id: self.config_id,
            layout,
        })
        .await?;
        Ok(self.config_id)
    }

    /// Start sending to more destinations. Every receiver sees a new
    /// config id carrying the current layout.
    pub async fn add_destinations(&mut self, destinations: Vec<Destination>) -> Result<u32, WallError> {
        self.config_id += 1;
        self.send_job(Job::AddDestinations {
            config_id: self.config_id,
            destinations,
        })
        .await?;
        Ok(self.config_id)
    }

    /// Transmit only one of every `skip + 1` swaps. The next swap is
    /// always transmitted.
    pub fn set_throttle(&mut self, skip: u32) -> Result<(), WallError> {
        if self.is_closed() {
            return Err(WallError::StreamClosed);
        }
        self.throttle.set(skip);
        Ok(())
    }

    async fn send_job(&self, job: Job) -> Result<(), WallError> {
        if self.is_closed() {
            return Err(WallError::StreamClosed);
        }
        self.jobs.send(job).await.map_err(|_| WallError::StreamClosed)
    }

    /// Let the background path drain and stop.
    pub async fn close(self) {
        let Self { jobs, worker, .. } = self;
        drop(jobs);
        let _ = worker.await;
    }
}
