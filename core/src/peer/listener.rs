//! Inbound listener — accepts mesh peers and greets them
//!
//! Every accepted socket gets the version announcement and an id request
//! before its receive loop starts. Capacity drops to zero while the overlay
//! tells us our port is unreachable, which parks the accept loop.

use crate::config::NodeConfig;
use crate::keys::KeyManager;
use crate::peer::{self, PeerConnection, PeerRole};
use crate::protocol::{codes, ProtocolMessage};
use crate::relay::Mesh;
use crate::NodeEvent;
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

pub struct Listener {
    mesh: Arc<Mesh>,
    keys: Arc<KeyManager>,
    client_version: String,
    keepalive_delay: Duration,
    keepalive_interval: Duration,
    io_timeout: Duration,
    capacity: AtomicUsize,
    local_port: AtomicU16,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    pub fn new(
        mesh: Arc<Mesh>,
        keys: Arc<KeyManager>,
        config: &NodeConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            mesh,
            keys,
            client_version: config.client_version.clone(),
            keepalive_delay: config.keepalive_delay,
            keepalive_interval: config.keepalive_interval,
            io_timeout: config.io_timeout,
            capacity: AtomicUsize::new(config.max_inbound),
            local_port: AtomicU16::new(0),
            accept_task: Mutex::new(None),
            shutdown,
        })
    }

    /// Bind the port and start accepting. Returns the bound port (useful
    /// when asked to bind port 0).
    pub async fn open(self: &Arc<Self>, port: u16) -> io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let bound = listener.local_addr()?.port();
        self.local_port.store(bound, Ordering::Relaxed);
        info!(port = bound, "listening for inbound peers");

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            this.accept_loop(listener).await;
        });
        *self.accept_task.lock() = Some(handle);
        Ok(bound)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            if self.mesh.inbound.len() >= self.capacity.load(Ordering::Relaxed) {
                // Full (or parked because our port is unreachable); poll.
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = time::sleep(Duration::from_millis(200)) => continue,
                }
            }
            let accepted = tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "inbound peer accepted");
                    if let Err(e) = self.admit(stream, addr).await {
                        warn!(%addr, error = %e, "inbound greeting failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    async fn admit(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: std::net::SocketAddr,
    ) -> io::Result<()> {
        let (read, write) = stream.into_split();
        let peer = PeerConnection::new(PeerRole::Inbound, addr, write, self.io_timeout);

        // Greet before the record becomes visible to the mesh: a socket that
        // dies mid-greeting must never occupy an inbound slot, since no
        // receive loop exists yet to tear it down.
        let greeting = async {
            peer.send(&ProtocolMessage::new(
                codes::PEER_VERSION,
                1,
                vec![self.client_version.clone()],
            ))
            .await?;
            peer.send(&ProtocolMessage::new(codes::PEER_ID_REQUEST, 1, Vec::new()))
                .await
        };
        if let Err(e) = greeting.await {
            peer.close().await;
            return Err(e);
        }

        self.mesh.inbound.add(Arc::clone(&peer));
        peer::spawn_receive_loop(
            Arc::clone(&self.mesh),
            Arc::clone(&self.keys),
            Arc::clone(&peer),
            read,
            self.shutdown.clone(),
        );
        self.spawn_keepalive(Arc::clone(&peer));
        self.mesh.emit(NodeEvent::PeerConnected {
            peer_id: peer.peer_id(),
            role: PeerRole::Inbound,
        });
        Ok(())
    }

    /// After an idle grace period, probe the peer on a fixed cadence so NAT
    /// mappings stay open.
    fn spawn_keepalive(&self, peer: Arc<PeerConnection>) {
        let delay = self.keepalive_delay;
        let interval = self.keepalive_interval;
        let mut shutdown = self.shutdown.clone();
        let handle = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = time::sleep(delay) => {}
                }
                loop {
                    if peer.is_closed() {
                        return;
                    }
                    let probe = ProtocolMessage::new(codes::PEER_PROBE, 1, Vec::new());
                    if peer.send(&probe).await.is_err() {
                        return;
                    }
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = time::sleep(interval) => {}
                    }
                }
            }
        });
        peer.attach_task(handle);
    }

    /// Shrink or restore the accept ceiling; zero parks the loop.
    pub fn set_capacity(&self, max: usize) {
        self.capacity.store(max, Ordering::Relaxed);
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Relaxed)
    }

    /// Stop accepting and drop every inbound peer.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.local_port.store(0, Ordering::Relaxed);
        for peer in self.mesh.inbound.drain() {
            peer.close().await;
        }
    }
}
