//! Routing of control messages to per-subsystem handlers.
//!
//! Each role implements the handler traits for the subsystems it takes
//! part in; the default methods log and drop messages a role does not
//! expect.

use async_trait::async_trait;
use tracing::debug;

use crate::control::message::{
    ControlMessage, PerfMessage, SessionMessage, StreamMessage, SyncMessage,
};
use crate::error::WallError;

/// Identifies the control link a message arrived on.
pub type PeerId = u64;

#[async_trait]
pub trait SessionHandler: Send {
    async fn on_session(&mut self, from: PeerId, msg: SessionMessage) -> Result<(), WallError> {
        debug!(from, ?msg, "session message ignored");
        Ok(())
    }
}

#[async_trait]
pub trait StreamHandler: Send {
    async fn on_stream(&mut self, from: PeerId, msg: StreamMessage) -> Result<(), WallError> {
        debug!(from, ?msg, "stream message ignored");
        Ok(())
    }
}

#[async_trait]
pub trait PerfHandler: Send {
    async fn on_perf(&mut self, from: PeerId, msg: PerfMessage) -> Result<(), WallError> {
        debug!(from, ?msg, "perf message ignored");
        Ok(())
    }
}

#[async_trait]
pub trait SyncHandler: Send {
    async fn on_sync(&mut self, from: PeerId, msg: SyncMessage) -> Result<(), WallError> {
        debug!(from, ?msg, "sync message ignored");
        Ok(())
    }
}

/// Hand `msg` to the handler of its subsystem.
pub async fn dispatch<H>(handler: &mut H, from: PeerId, msg: ControlMessage) -> Result<(), WallError>
where
    H: SessionHandler + StreamHandler + PerfHandler + SyncHandler,
{
    match msg {
        ControlMessage::Session(m) => handler.on_session(from, m).await,
        ControlMessage::Stream(m) => handler.on_stream(from, m).await,
        ControlMessage::Perf(m) => handler.on_perf(from, m).await,
        ControlMessage::Sync(m) => handler.on_sync(from, m).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        sync: Vec<SyncMessage>,
        quits: Vec<u32>,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_session(&mut self, _from: PeerId, msg: SessionMessage) -> Result<(), WallError> {
            if let SessionMessage::Quit { instance } = msg {
                self.quits.push(instance);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SyncHandler for Recorder {
        async fn on_sync(&mut self, _from: PeerId, msg: SyncMessage) -> Result<(), WallError> {
            self.sync.push(msg);
            Ok(())
        }
    }

    impl StreamHandler for Recorder {}
    impl PerfHandler for Recorder {}

    #[tokio::test]
    async fn routes_by_subsystem() {
        let mut r = Recorder::default();
        dispatch(&mut r, 1, SessionMessage::Quit { instance: 4 }.into())
            .await
            .unwrap();
        dispatch(&mut r, 1, SyncMessage::Release { group: 1, frame: 9 }.into())
            .await
            .unwrap();
        dispatch(&mut r, 1, PerfMessage::Stop { instance: 4 }.into())
            .await
            .unwrap();
        assert_eq!(r.quits, vec![4]);
        assert_eq!(r.sync, vec![SyncMessage::Release { group: 1, frame: 9 }]);
    }
}
