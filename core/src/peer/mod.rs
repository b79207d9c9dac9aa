//! Peer connection — uniform abstraction over outbound and inbound links
//!
//! Each peer carries an id, a guarded write half, and a detached receive
//! loop feeding the relay router. Tearing down the transport destroys the
//! record; the owning table drops it and a disconnect event fires.

pub mod listener;

use crate::keys::KeyManager;
use crate::protocol::ProtocolMessage;
use crate::relay::{router, Mesh};
use crate::transport::codec;
use crate::NodeEvent;
use parking_lot::{Mutex, RwLock};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

/// Which side initiated the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Self-initiated (we dialed out).
    Outbound,
    /// Accepted by our listener.
    Inbound,
}

pub struct PeerConnection {
    /// Remote's overlay peer id. Inbound links start at 0 until the id ack
    /// arrives.
    peer_id: AtomicU32,
    pub role: PeerRole,
    pub addr: SocketAddr,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    io_timeout: Duration,
}

impl PeerConnection {
    pub fn new(
        role: PeerRole,
        addr: SocketAddr,
        writer: OwnedWriteHalf,
        io_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_id: AtomicU32::new(0),
            role,
            addr,
            writer: tokio::sync::Mutex::new(writer),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            io_timeout,
        })
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub fn set_peer_id(&self, id: u32) {
        self.peer_id.store(id, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Write one message within the socket send timeout.
    pub async fn send(&self, msg: &ProtocolMessage) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "peer closed"));
        }
        let bytes = codec::encode_line(&msg.to_line());
        let mut writer = self.writer.lock().await;
        time::timeout(self.io_timeout, writer.write_all(&bytes))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "peer send timed out"))??;
        trace!(peer_id = self.peer_id(), line = %msg, "peer sent");
        Ok(())
    }

    /// Tear the link down: stop the receive loop and keep-alive timer, shut
    /// the write half. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// One lock-guarded peer collection (the node owns the outbound set, the
/// listener the inbound one).
pub struct PeerTable {
    peers: RwLock<Vec<Arc<PeerConnection>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, peer: Arc<PeerConnection>) {
        self.peers.write().push(peer);
    }

    /// Remove by identity; true when the record was present.
    pub fn remove(&self, peer: &Arc<PeerConnection>) -> bool {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|p| !Arc::ptr_eq(p, peer));
        peers.len() != before
    }

    pub fn snapshot(&self) -> Vec<Arc<PeerConnection>> {
        self.peers.read().clone()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.peers.read().iter().map(|p| p.peer_id()).collect()
    }

    pub fn find(&self, peer_id: u32) -> Option<Arc<PeerConnection>> {
        self.peers
            .read()
            .iter()
            .find(|p| p.peer_id() == peer_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn drain(&self) -> Vec<Arc<PeerConnection>> {
        std::mem::take(&mut *self.peers.write())
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read every immediately-available byte, decode, split into lines.
async fn read_burst(read: &mut OwnedReadHalf) -> io::Result<Vec<String>> {
    let mut buf = vec![0u8; 4096];
    let n = read.read(&mut buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ));
    }
    let mut data = buf[..n].to_vec();
    loop {
        if data.len() >= codec::MAX_BURST_SIZE {
            break;
        }
        match read.try_read(&mut buf) {
            Ok(0) => break,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(codec::split_lines(&codec::decode(&data)))
}

/// Run this peer's receive loop until the socket dies or the node shuts
/// down, routing each line. The loop owns the peer's removal from the mesh.
pub(crate) fn spawn_receive_loop(
    mesh: Arc<Mesh>,
    keys: Arc<KeyManager>,
    peer: Arc<PeerConnection>,
    mut read: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let handle = tokio::spawn({
        let peer = Arc::clone(&peer);
        let mesh = Arc::clone(&mesh);
        async move {
            loop {
                if peer.is_closed() {
                    break;
                }
                let lines = tokio::select! {
                    _ = shutdown.changed() => break,
                    result = read_burst(&mut read) => match result {
                        Ok(lines) => lines,
                        Err(e) => {
                            debug!(peer_id = peer.peer_id(), error = %e, "peer read ended");
                            break;
                        }
                    },
                };
                for line in lines {
                    match ProtocolMessage::parse(&line) {
                        Ok(msg) => router::route(&mesh, &keys, &peer, msg).await,
                        Err(e) => {
                            mesh.emit(NodeEvent::Error(format!("unparseable line: {e}")));
                        }
                    }
                }
            }
            // Remove first: close() aborts this very task, so nothing after
            // it is guaranteed to run.
            mesh.remove(&peer);
            peer.close().await;
        }
    });
    peer.attach_task(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let server = listener.accept();
        let (client, server) = tokio::join!(client, server);
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_send_writes_crlf_line() {
        let (local, mut remote) = socket_pair().await;
        let addr = local.peer_addr().unwrap();
        let (_r, w) = local.into_split();
        let peer = PeerConnection::new(PeerRole::Outbound, addr, w, Duration::from_secs(1));
        peer.set_peer_id(3);

        peer.send(&ProtocolMessage::new(611, 1, Vec::new()))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = remote.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"611 1\r\n");
    }

    #[tokio::test]
    async fn test_send_after_close_is_rejected() {
        let (local, _remote) = socket_pair().await;
        let addr = local.peer_addr().unwrap();
        let (_r, w) = local.into_split();
        let peer = PeerConnection::new(PeerRole::Inbound, addr, w, Duration::from_secs(1));

        peer.close().await;
        peer.close().await; // idempotent
        let err = peer
            .send(&ProtocolMessage::new(611, 1, Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_table_add_remove_find() {
        let (a, _ra) = socket_pair().await;
        let (b, _rb) = socket_pair().await;
        let table = PeerTable::new();

        let addr_a = a.peer_addr().unwrap();
        let (_r, w) = a.into_split();
        let peer_a = PeerConnection::new(PeerRole::Outbound, addr_a, w, Duration::from_secs(1));
        peer_a.set_peer_id(3);

        let addr_b = b.peer_addr().unwrap();
        let (_r, w) = b.into_split();
        let peer_b = PeerConnection::new(PeerRole::Outbound, addr_b, w, Duration::from_secs(1));
        peer_b.set_peer_id(9);

        table.add(Arc::clone(&peer_a));
        table.add(Arc::clone(&peer_b));
        assert_eq!(table.len(), 2);
        assert_eq!(table.ids(), vec![3, 9]);
        assert!(table.find(9).is_some());
        assert!(table.find(42).is_none());

        assert!(table.remove(&peer_a));
        assert!(!table.remove(&peer_a));
        assert_eq!(table.len(), 1);
    }
}
