use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::control::codec::ControlCodec;
use crate::control::message::ControlMessage;
use crate::error::WallError;

const CHANNEL_DEPTH: usize = 64;

pub type ControlSender = mpsc::Sender<ControlMessage>;

/// A framed control-plane link backed by a writer task and a reader
/// task. Dropping the connection, or cancelling its token, stops both.
#[derive(Debug)]
pub struct ControlConnection {
    tx: ControlSender,
    rx: mpsc::Receiver<ControlMessage>,
    cancel: CancellationToken,
}

impl ControlConnection {
    pub fn new<S>(stream: S, cancel: CancellationToken) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut net_writer, mut net_reader) = Framed::new(stream, ControlCodec).split();
        let (user_tx, mut outgoing) = mpsc::channel::<ControlMessage>(CHANNEL_DEPTH);
        let (incoming_tx, user_rx) = mpsc::channel(CHANNEL_DEPTH);

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    msg = outgoing.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                if let Err(e) = net_writer.send(msg).await {
                    warn!(error = %e, "control write failed");
                    break;
                }
            }
            let _ = net_writer.close().await;
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    next = net_reader.next() => next,
                };
                match next {
                    Some(Ok(msg)) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "control read failed");
                        break;
                    }
                    None => {
                        debug!("control peer closed");
                        break;
                    }
                }
            }
        });

        Self {
            tx: user_tx,
            rx: user_rx,
            cancel,
        }
    }

    pub async fn connect(addr: &str, cancel: CancellationToken) -> Result<Self, WallError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, cancel))
    }

    /// Keep trying `addr` every `retry` until it answers or `cancel`
    /// fires.
    pub async fn connect_retrying(
        addr: &str,
        retry: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, WallError> {
        loop {
            match Self::connect(addr, cancel.child_token()).await {
                Ok(conn) => return Ok(conn),
                Err(e) => debug!(%addr, error = %e, "control peer not up yet"),
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(WallError::Cancelled),
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }

    pub async fn send(&self, msg: impl Into<ControlMessage>) -> Result<(), WallError> {
        self.tx.send(msg.into()).await?;
        Ok(())
    }

    /// Next message from the peer, `None` once the link is gone.
    pub async fn recv(&mut self) -> Option<ControlMessage> {
        self.rx.recv().await
    }

    pub fn sender(&self) -> ControlSender {
        self.tx.clone()
    }

    /// Split into an outgoing handle and the incoming stream.
    pub fn into_parts(self) -> (ControlSender, mpsc::Receiver<ControlMessage>, CancellationToken) {
        (self.tx, self.rx, self.cancel)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::message::{SessionMessage, SyncMessage};

    #[tokio::test]
    async fn messages_cross_a_duplex_pipe() {
        let (a, b) = tokio::io::duplex(4096);
        let left = ControlConnection::new(a, CancellationToken::new());
        let mut right = ControlConnection::new(b, CancellationToken::new());

        left.send(SyncMessage::Ready {
            group: 1,
            node: 2,
            frame: 3,
        })
        .await
        .unwrap();
        left.send(SessionMessage::Shutdown).await.unwrap();

        assert_eq!(
            right.recv().await,
            Some(ControlMessage::Sync(SyncMessage::Ready {
                group: 1,
                node: 2,
                frame: 3
            }))
        );
        assert_eq!(
            right.recv().await,
            Some(ControlMessage::Session(SessionMessage::Shutdown))
        );
    }

    #[tokio::test]
    async fn closing_one_side_ends_the_other() {
        let (a, b) = tokio::io::duplex(1024);
        let left = ControlConnection::new(a, CancellationToken::new());
        let mut right = ControlConnection::new(b, CancellationToken::new());
        left.close();
        drop(left);
        assert_eq!(right.recv().await, None);
    }
}
