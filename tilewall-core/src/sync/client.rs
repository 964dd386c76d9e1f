use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::context::now_us;
use crate::control::message::SyncMessage;
use crate::error::WallError;
use crate::sync::SyncMode;

/// Difference between the coordinator clock and the local clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    offset_us: i64,
}

impl ClockOffset {
    /// Estimate from one probe, assuming a symmetric path.
    pub fn from_probe(sent_us: u64, coordinator_us: u64, recv_us: u64) -> Self {
        let midpoint = (sent_us as i128 + recv_us as i128) / 2;
        Self {
            offset_us: (coordinator_us as i128 - midpoint) as i64,
        }
    }

    pub fn micros(&self) -> i64 {
        self.offset_us
    }

    /// Convert a coordinator timestamp to the local clock.
    pub fn to_local(&self, coordinator_us: u64) -> u64 {
        (coordinator_us as i64).saturating_sub(self.offset_us).max(0) as u64
    }
}

/// What the display node should do after a coordinator message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirective {
    Swap(u32),
    /// Swap, then report [`SyncClient::barrier_enter`].
    SwapThenEnter(u32),
    /// Everyone swapped; refresh the screen.
    Refresh(u32),
    /// Swap once the local clock reaches the deadline.
    SwapAt { frame: u32, local_deadline_us: u64 },
    /// The coordinator dropped this node from the group.
    Evicted,
}

/// Node-side half of frame synchronization for one group.
#[derive(Debug, Clone)]
pub struct SyncClient {
    group: u32,
    node: u32,
    mode: SyncMode,
    offset: ClockOffset,
    node_timeout: Option<Duration>,
    /// Frame reported ready and when, until the coordinator answers.
    waiting: Option<(u32, Instant)>,
    evicted: bool,
}

impl SyncClient {
    pub fn new(group: u32, node: u32, mode: SyncMode, node_timeout: Option<Duration>) -> Self {
        Self {
            group,
            node,
            mode,
            offset: ClockOffset::default(),
            node_timeout,
            waiting: None,
            evicted: false,
        }
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn offset(&self) -> ClockOffset {
        self.offset
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted
    }

    pub fn waiting_for(&self) -> Option<u32> {
        self.waiting.map(|(frame, _)| frame)
    }

    pub fn join(&mut self) -> SyncMessage {
        self.evicted = false;
        SyncMessage::Join {
            group: self.group,
            node: self.node,
            mode: self.mode,
        }
    }

    pub fn leave(&mut self) -> SyncMessage {
        self.waiting = None;
        SyncMessage::Leave {
            group: self.group,
            node: self.node,
        }
    }

    pub fn probe(&self) -> SyncMessage {
        SyncMessage::ClockProbe {
            node: self.node,
            sent_us: now_us(),
        }
    }

    pub fn ready(&mut self, frame: u32, now: Instant) -> SyncMessage {
        if self.waiting.is_none() {
            self.waiting = Some((frame, now));
        }
        SyncMessage::Ready {
            group: self.group,
            node: self.node,
            frame,
        }
    }

    pub fn barrier_enter(&self, frame: u32) -> SyncMessage {
        SyncMessage::BarrierEnter {
            group: self.group,
            node: self.node,
            frame,
        }
    }

    /// Interpret a coordinator message received at local `recv_us`.
    pub fn on_message(&mut self, msg: SyncMessage, recv_us: u64) -> Option<SyncDirective> {
        let directive = match msg {
            SyncMessage::ClockReply {
                node,
                sent_us,
                coordinator_us,
            } if node == self.node => {
                self.offset = ClockOffset::from_probe(sent_us, coordinator_us, recv_us);
                debug!(node, offset_us = self.offset.micros(), "clock offset measured");
                return None;
            }
            SyncMessage::Release { group, frame } if group == self.group => SyncDirective::Swap(frame),
            SyncMessage::Swap { group, frame } if group == self.group => {
                SyncDirective::SwapThenEnter(frame)
            }
            SyncMessage::BarrierRelease { group, frame } if group == self.group => {
                return Some(SyncDirective::Refresh(frame));
            }
            SyncMessage::SwapAt {
                group,
                frame,
                deadline_us,
            } if group == self.group => SyncDirective::SwapAt {
                frame,
                local_deadline_us: self.offset.to_local(deadline_us),
            },
            SyncMessage::Evicted { group, node } if group == self.group && node == self.node => {
                warn!(group, node, "evicted from sync group");
                self.evicted = true;
                self.waiting = None;
                return Some(SyncDirective::Evicted);
            }
            _ => return None,
        };
        let released = match directive {
            SyncDirective::Swap(f) | SyncDirective::SwapThenEnter(f) => f,
            SyncDirective::SwapAt { frame, .. } => frame,
            SyncDirective::Refresh(_) | SyncDirective::Evicted => return Some(directive),
        };
        if self.waiting.is_some_and(|(f, _)| f <= released) {
            self.waiting = None;
        }
        Some(directive)
    }

    /// Give up on the pending frame once the node timeout has passed.
    pub fn check_timeout(&mut self, now: Instant) -> Result<(), WallError> {
        let (Some(limit), Some((frame, since))) = (self.node_timeout, self.waiting) else {
            return Ok(());
        };
        if now.duration_since(since) < limit {
            return Ok(());
        }
        warn!(group = self.group, frame, ?limit, "no release from coordinator");
        self.waiting = None;
        Err(WallError::SyncTimeout(limit))
    }
}

/// Sleep most of the way to `deadline_us` on the local clock, then
/// spin the rest.
pub async fn wait_until(deadline_us: u64) {
    const SPIN_US: u64 = 2_000;
    let now = now_us();
    if deadline_us > now + SPIN_US {
        tokio::time::sleep(Duration::from_micros(deadline_us - now - SPIN_US)).await;
    }
    while now_us() < deadline_us {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_uses_probe_midpoint() {
        let off = ClockOffset::from_probe(1_000, 5_500, 2_000);
        assert_eq!(off.micros(), 4_000);
        assert_eq!(off.to_local(10_000), 6_000);

        let behind = ClockOffset::from_probe(9_000, 4_000, 11_000);
        assert_eq!(behind.micros(), -6_000);
        assert_eq!(behind.to_local(4_000), 10_000);
    }

    #[test]
    fn messages_map_to_directives() {
        let mut c = SyncClient::new(2, 7, SyncMode::BarrierSync, None);
        assert_eq!(c.on_message(SyncMessage::Swap { group: 2, frame: 3 }, 0), Some(SyncDirective::SwapThenEnter(3)));
        assert_eq!(
            c.on_message(SyncMessage::BarrierRelease { group: 2, frame: 3 }, 0),
            Some(SyncDirective::Refresh(3))
        );
        assert_eq!(c.on_message(SyncMessage::Release { group: 9, frame: 3 }, 0), None);
        assert_eq!(
            c.on_message(SyncMessage::Evicted { group: 2, node: 7 }, 0),
            Some(SyncDirective::Evicted)
        );
        assert!(c.is_evicted());
    }

    #[test]
    fn swap_at_deadline_is_local() {
        let mut c = SyncClient::new(1, 1, SyncMode::ClockCompensated, None);
        c.on_message(
            SyncMessage::ClockReply {
                node: 1,
                sent_us: 100,
                coordinator_us: 1_150,
            },
            200,
        );
        assert_eq!(c.offset().micros(), 1_000);
        assert_eq!(
            c.on_message(
                SyncMessage::SwapAt {
                    group: 1,
                    frame: 2,
                    deadline_us: 5_000
                },
                0
            ),
            Some(SyncDirective::SwapAt {
                frame: 2,
                local_deadline_us: 4_000
            })
        );
    }

    #[test]
    fn node_timeout_fires_once() {
        let t0 = Instant::now();
        let mut c = SyncClient::new(1, 1, SyncMode::DataSync, Some(Duration::from_millis(10)));
        c.ready(1, t0);
        assert!(c.check_timeout(t0).is_ok());
        assert!(matches!(
            c.check_timeout(t0 + Duration::from_millis(20)),
            Err(WallError::SyncTimeout(_))
        ));
        assert!(c.check_timeout(t0 + Duration::from_millis(40)).is_ok());
    }

    #[test]
    fn release_clears_wait() {
        let t0 = Instant::now();
        let mut c = SyncClient::new(1, 1, SyncMode::DataSync, Some(Duration::from_millis(10)));
        c.ready(4, t0);
        c.on_message(SyncMessage::Release { group: 1, frame: 4 }, 0);
        assert_eq!(c.waiting_for(), None);
        assert!(c.check_timeout(t0 + Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn wait_until_reaches_deadline() {
        let deadline = now_us() + 5_000;
        wait_until(deadline).await;
        assert!(now_us() >= deadline);
    }
}
