//! Reliable, ordered transport over TCP.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tracing::{debug, info};

use crate::block::group::BlockGroup;
use crate::block::header::{GROUP_HEADER_SIZE, GroupHeader};
use crate::block::io::{finish_header, read_payloads, write_group};
use crate::error::WallError;
use crate::transport::handshake::Handshake;
use crate::transport::{ConnId, NetConfig, RecvState, Transport, TransportKind};

struct ReadSide {
    half: OwnedReadHalf,
    state: RecvState,
    /// Header bytes taken by `peek_header` before the rest arrived.
    partial: Vec<u8>,
}

struct TcpConn {
    peer: SocketAddr,
    reader: tokio::sync::Mutex<ReadSide>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

pub struct TcpTransport {
    config: NetConfig,
    listener: tokio::sync::Mutex<Option<TcpListener>>,
    conns: Mutex<HashMap<ConnId, Arc<TcpConn>>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(config: NetConfig) -> Self {
        Self {
            config,
            listener: tokio::sync::Mutex::new(None),
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn tuned_socket(&self, addr: &SocketAddr) -> Result<TcpSocket, WallError> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_send_buffer_size(self.config.send_buffer)?;
        socket.set_recv_buffer_size(self.config.recv_buffer)?;
        Ok(socket)
    }

    fn register(&self, stream: TcpStream, peer: SocketAddr) -> Result<ConnId, WallError> {
        stream.set_nodelay(self.config.nodelay)?;
        let (read, write) = stream.into_split();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(TcpConn {
            peer,
            reader: tokio::sync::Mutex::new(ReadSide {
                half: read,
                state: RecvState::default(),
                partial: Vec::with_capacity(GROUP_HEADER_SIZE),
            }),
            writer: tokio::sync::Mutex::new(write),
        });
        self.lock_conns().insert(id, conn);
        Ok(id)
    }

    fn conn(&self, id: ConnId) -> Result<Arc<TcpConn>, WallError> {
        self.lock_conns()
            .get(&id)
            .cloned()
            .ok_or(WallError::UnknownConnection(id))
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, HashMap<ConnId, Arc<TcpConn>>> {
        self.conns.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remote address of `conn`.
    pub fn peer_addr(&self, conn: ConnId) -> Result<SocketAddr, WallError> {
        Ok(self.conn(conn)?.peer)
    }

    pub fn connection_count(&self) -> usize {
        self.lock_conns().len()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen(&self, port: u16) -> Result<SocketAddr, WallError> {
        let addr: SocketAddr = format!("{}:{port}", self.config.bind_host)
            .parse()
            .map_err(|e| WallError::InvalidConfig(format!("bind address: {e}")))?;
        let socket = self.tuned_socket(&addr)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(128)?;
        let local = listener.local_addr()?;
        *self.listener.lock().await = Some(listener);
        info!(%local, "tcp transport listening");
        Ok(local)
    }

    async fn accept_connection(&self) -> Result<(ConnId, Handshake), WallError> {
        let guard = self.listener.lock().await;
        let listener = guard
            .as_ref()
            .ok_or_else(|| WallError::InvalidConfig("accept before listen".into()))?;
        let (mut stream, peer) = listener.accept().await?;
        drop(guard);

        let handshake = Handshake::read_from(&mut stream).await?;
        let id = self.register(stream, peer)?;
        debug!(conn = id, %peer, %handshake, "tcp connection accepted");
        Ok((id, handshake))
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        handshake: &Handshake,
    ) -> Result<ConnId, WallError> {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| WallError::InvalidConfig(format!("cannot resolve {host}:{port}")))?;
        let socket = self.tuned_socket(&addr)?;
        let mut stream = socket.connect(addr).await?;
        handshake.write_to(&mut stream).await?;
        let id = self.register(stream, addr)?;
        debug!(conn = id, %addr, "tcp connection established");
        Ok(id)
    }

    async fn send_group(&self, conn: ConnId, group: &BlockGroup) -> Result<usize, WallError> {
        let conn = self.conn(conn)?;
        let mut writer = conn.writer.lock().await;
        write_group(&mut *writer, group).await
    }

    async fn recv_group(&self, conn: ConnId, group: &mut BlockGroup) -> Result<usize, WallError> {
        let conn = self.conn(conn)?;
        let mut reader = conn.reader.lock().await;
        let ReadSide { half, state, partial } = &mut *reader;
        let header = match state.pending.take() {
            Some(header) => header,
            None => finish_header(half, partial).await?,
        };
        let n = read_payloads(half, header, group).await?;
        state.classify(group);
        Ok(n)
    }

    async fn peek_header(&self, conn: ConnId) -> Result<Option<GroupHeader>, WallError> {
        let conn = self.conn(conn)?;
        // A receive in progress owns the read side.
        let Ok(mut reader) = conn.reader.try_lock() else {
            return Ok(None);
        };
        let ReadSide { half, state, partial } = &mut *reader;
        if state.pending.is_some() {
            return Ok(state.pending);
        }
        let mut buf = [0u8; GROUP_HEADER_SIZE];
        while partial.len() < GROUP_HEADER_SIZE {
            let want = GROUP_HEADER_SIZE - partial.len();
            match half.try_read(&mut buf[..want]) {
                Ok(0) => return Err(WallError::PeerClosed),
                Ok(n) => partial.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        let header = GroupHeader::from_bytes(partial)?;
        partial.clear();
        state.pending = Some(header);
        Ok(Some(header))
    }

    async fn close(&self, conn: ConnId) -> Result<(), WallError> {
        let removed = self.lock_conns().remove(&conn);
        let Some(removed) = removed else {
            return Err(WallError::UnknownConnection(conn));
        };
        let mut writer = removed.writer.lock().await;
        // The peer may already be gone; shutting down is best effort.
        let _ = writer.shutdown().await;
        debug!(conn, peer = %removed.peer, "tcp connection closed");
        Ok(())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}
