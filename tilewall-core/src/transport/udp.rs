//! Best-effort transport: one block group per UDP datagram.
//!
//! The listening side owns one socket and a demux task. A datagram from
//! an unknown address must be a handshake and registers a connection;
//! later datagrams from that address are queued for it. Lost datagrams
//! are simply missing groups; the receiver's block accounting reports
//! them as loss. Groups larger than `max_datagram` cannot be sent.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::{UdpSocket, lookup_host};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace, warn};

use crate::block::group::BlockGroup;
use crate::block::header::GroupHeader;
use crate::block::io::{decode_group, encode_group};
use crate::error::WallError;
use crate::transport::handshake::{HANDSHAKE_SIZE, Handshake};
use crate::transport::{ConnId, NetConfig, RecvState, Transport, TransportKind};

const INBOX_DEPTH: usize = 256;

enum Source {
    /// Datagrams routed by the listener's demux task.
    Demuxed(mpsc::Receiver<Bytes>),
    /// A connected socket owned by this connection.
    Direct,
}

struct Inbox {
    source: Source,
    /// Datagram already pulled by `peek_header`.
    pending: Option<Bytes>,
    state: RecvState,
}

struct UdpConn {
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    /// Connected sockets send with `send`, the shared listener socket
    /// with `send_to`.
    connected: bool,
    inbox: tokio::sync::Mutex<Inbox>,
}

type Routes = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;
type Conns = Arc<Mutex<HashMap<ConnId, Arc<UdpConn>>>>;

pub struct UdpTransport {
    config: NetConfig,
    conns: Conns,
    routes: Routes,
    accepted: tokio::sync::Mutex<Option<mpsc::Receiver<(ConnId, Handshake)>>>,
    next_id: Arc<AtomicU64>,
}

impl UdpTransport {
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            conns: Arc::new(Mutex::new(HashMap::new())),
            routes: Arc::new(Mutex::new(HashMap::new())),
            accepted: tokio::sync::Mutex::new(None),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn conn(&self, id: ConnId) -> Result<Arc<UdpConn>, WallError> {
        lock(&self.conns)
            .get(&id)
            .cloned()
            .ok_or(WallError::UnknownConnection(id))
    }

    async fn next_datagram(&self, conn: &UdpConn, inbox: &mut Inbox) -> Result<Bytes, WallError> {
        if let Some(datagram) = inbox.pending.take() {
            return Ok(datagram);
        }
        match &mut inbox.source {
            Source::Demuxed(rx) => rx.recv().await.ok_or(WallError::PeerClosed),
            Source::Direct => {
                let mut buf = vec![0u8; self.config.max_datagram];
                let n = conn.socket.recv(&mut buf).await?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Route datagrams arriving on the shared socket to their connections.
async fn demux(
    socket: Arc<UdpSocket>,
    max_datagram: usize,
    routes: Routes,
    conns: Conns,
    next_id: Arc<AtomicU64>,
    accepted: mpsc::Sender<(ConnId, Handshake)>,
) {
    let mut buf = vec![0u8; max_datagram];
    loop {
        let (n, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "udp receive failed, demux stopping");
                return;
            }
        };
        let route = lock(&routes).get(&peer).cloned();
        match route {
            Some(tx) => {
                if tx.try_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    trace!(%peer, "udp inbox full or closed, datagram dropped");
                }
            }
            None if n == HANDSHAKE_SIZE => {
                let handshake = match Handshake::from_bytes(&buf[..n]) {
                    Ok(h) => h,
                    Err(e) => {
                        debug!(%peer, error = %e, "bad udp handshake");
                        continue;
                    }
                };
                let (tx, rx) = mpsc::channel(INBOX_DEPTH);
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let conn = Arc::new(UdpConn {
                    peer,
                    socket: Arc::clone(&socket),
                    connected: false,
                    inbox: tokio::sync::Mutex::new(Inbox {
                        source: Source::Demuxed(rx),
                        pending: None,
                        state: RecvState::default(),
                    }),
                });
                lock(&routes).insert(peer, tx);
                lock(&conns).insert(id, conn);
                if accepted.send((id, handshake)).await.is_err() {
                    return;
                }
            }
            None => trace!(%peer, n, "datagram from unknown peer dropped"),
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn listen(&self, port: u16) -> Result<SocketAddr, WallError> {
        let addr = format!("{}:{port}", self.config.bind_host);
        let socket = Arc::new(UdpSocket::bind(&addr).await?);
        let local = socket.local_addr()?;

        let (accept_tx, accept_rx) = mpsc::channel(16);
        *self.accepted.lock().await = Some(accept_rx);
        tokio::spawn(demux(
            socket,
            self.config.max_datagram,
            Arc::clone(&self.routes),
            Arc::clone(&self.conns),
            Arc::clone(&self.next_id),
            accept_tx,
        ));
        info!(%local, "udp transport listening");
        Ok(local)
    }

    async fn accept_connection(&self) -> Result<(ConnId, Handshake), WallError> {
        let mut guard = self.accepted.lock().await;
        let rx = guard
            .as_mut()
            .ok_or_else(|| WallError::InvalidConfig("accept before listen".into()))?;
        let (id, handshake) = rx.recv().await.ok_or(WallError::ChannelClosed)?;
        drop(guard);
        debug!(conn = id, %handshake, "udp connection accepted");
        Ok((id, handshake))
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        handshake: &Handshake,
    ) -> Result<ConnId, WallError> {
        let peer = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| WallError::InvalidConfig(format!("cannot resolve {host}:{port}")))?;
        let local = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        socket.send(&handshake.to_bytes()).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(UdpConn {
            peer,
            socket: Arc::new(socket),
            connected: true,
            inbox: tokio::sync::Mutex::new(Inbox {
                source: Source::Direct,
                pending: None,
                state: RecvState::default(),
            }),
        });
        lock(&self.conns).insert(id, conn);
        debug!(conn = id, %peer, "udp connection established");
        Ok(id)
    }

    async fn send_group(&self, conn: ConnId, group: &BlockGroup) -> Result<usize, WallError> {
        let conn = self.conn(conn)?;
        let size = group.wire_size();
        if size > self.config.max_datagram {
            return Err(WallError::PayloadTooLarge {
                size,
                max: self.config.max_datagram,
            });
        }
        let mut buf = BytesMut::with_capacity(size);
        encode_group(group, &mut buf);
        let sent = if conn.connected {
            conn.socket.send(&buf).await?
        } else {
            conn.socket.send_to(&buf, conn.peer).await?
        };
        Ok(sent)
    }

    async fn recv_group(&self, conn: ConnId, group: &mut BlockGroup) -> Result<usize, WallError> {
        let conn = self.conn(conn)?;
        let mut inbox = conn.inbox.lock().await;
        let datagram = self.next_datagram(&conn, &mut inbox).await?;
        let n = decode_group(&datagram, group)?;
        inbox.state.classify(group);
        Ok(n)
    }

    async fn peek_header(&self, conn: ConnId) -> Result<Option<GroupHeader>, WallError> {
        let conn = self.conn(conn)?;
        let Ok(mut inbox) = conn.inbox.try_lock() else {
            return Ok(None);
        };
        if inbox.pending.is_none() {
            let datagram = match &mut inbox.source {
                Source::Demuxed(rx) => match rx.try_recv() {
                    Ok(datagram) => datagram,
                    Err(TryRecvError::Empty) => return Ok(None),
                    Err(TryRecvError::Disconnected) => return Err(WallError::PeerClosed),
                },
                Source::Direct => {
                    let mut buf = vec![0u8; self.config.max_datagram];
                    match conn.socket.try_recv(&mut buf) {
                        Ok(n) => {
                            buf.truncate(n);
                            Bytes::from(buf)
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                        Err(e) => return Err(e.into()),
                    }
                }
            };
            inbox.pending = Some(datagram);
        }
        match &inbox.pending {
            Some(datagram) => GroupHeader::from_bytes(datagram).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&self, conn: ConnId) -> Result<(), WallError> {
        let removed = lock(&self.conns)
            .remove(&conn)
            .ok_or(WallError::UnknownConnection(conn))?;
        lock(&self.routes).remove(&removed.peer);
        debug!(conn, peer = %removed.peer, "udp connection closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::group::GroupSpec;
    use crate::block::header::GroupFlag;
    use crate::block::types::PixelFormat;
    use crate::transport::handshake::StreamType;

    fn loopback() -> NetConfig {
        NetConfig {
            transport: TransportKind::Udp,
            bind_host: "127.0.0.1".into(),
            ..NetConfig::default()
        }
    }

    fn spec() -> GroupSpec {
        GroupSpec {
            block_width: 8,
            block_height: 8,
            format: PixelFormat::Rgb8,
            blocks_per_group: 2,
        }
    }

    #[tokio::test]
    async fn groups_cross_as_datagrams() {
        let server = UdpTransport::new(loopback());
        let addr = server.listen(0).await.unwrap();

        let client = UdpTransport::new(loopback());
        let hs = Handshake::new(2, StreamType::Pixel, 0, 9);
        let out = client.connect("127.0.0.1", addr.port(), &hs).await.unwrap();
        let (inc, got) = server.accept_connection().await.unwrap();
        assert_eq!(got, hs);
        assert_eq!(server.peek_header(inc).await.unwrap(), None);

        let mut g = BlockGroup::data(&spec());
        g.next_block_mut().unwrap().data_mut().fill(0x5A);
        g.seal(1, 1, Some(3));
        client.send_group(out, &g).await.unwrap();

        let header = loop {
            if let Some(header) = server.peek_header(inc).await.unwrap() {
                break header;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };
        assert_eq!(header.first_ordinal, Some(3));

        let mut r = BlockGroup::data(&spec());
        server.recv_group(inc, &mut r).await.unwrap();
        assert_eq!(r.flag(), GroupFlag::PixelData);
        assert_eq!(r.len(), 1);
        assert!(r.blocks()[0].data().iter().all(|&b| b == 0x5A));
    }

    #[tokio::test]
    async fn oversized_group_is_refused() {
        let config = NetConfig {
            max_datagram: 200,
            ..loopback()
        };
        let server = UdpTransport::new(loopback());
        let addr = server.listen(0).await.unwrap();
        let client = UdpTransport::new(config);
        let hs = Handshake::new(1, StreamType::Pixel, 0, 1);
        let out = client.connect("127.0.0.1", addr.port(), &hs).await.unwrap();

        let mut g = BlockGroup::data(&spec());
        g.next_block_mut().unwrap();
        g.seal(1, 1, None);
        assert!(matches!(
            client.send_group(out, &g).await,
            Err(WallError::PayloadTooLarge { .. })
        ));
    }
}
