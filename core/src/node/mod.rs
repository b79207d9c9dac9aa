//! Node — orchestrates the rendezvous conversations and owns the mesh
//!
//! The node drives the join/echo/leave sequences against a rendezvous
//! server, dials outbound peers from the returned candidate list, and
//! originates broadcasts into the mesh. Everything long-lived (receive
//! loops, the listener, keep-alive timers) observes the node's shutdown
//! signal.

pub mod handshake;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::keys::{self, KeyManager, TrustAnchors};
use crate::peer::listener::Listener;
use crate::peer::{self, PeerConnection, PeerRole};
use crate::protocol::{codes, ProtocolMessage};
use crate::relay::{DedupCache, Mesh};
use crate::transport::Transport;
use crate::NodeEvent;
use chrono::TimeDelta;
use handshake::{BootstrapSession, HandshakeState};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

/// Snapshot of the node for status displays.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub peer_id: u32,
    pub connected: bool,
    pub outbound_peers: usize,
    pub inbound_peers: usize,
    /// Network-wide peer count as last reported by the rendezvous server.
    pub network_peer_count: usize,
}

#[derive(Default)]
struct NodeState {
    network_peer_count: usize,
    connected: bool,
}

pub struct Node {
    config: NodeConfig,
    mesh: Arc<Mesh>,
    keys: Arc<KeyManager>,
    listener: Arc<Listener>,
    state: RwLock<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    /// Build a node with the embedded trust anchors. Returns the node and
    /// the event stream it reports on.
    pub fn new(
        config: NodeConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>), NodeError> {
        let anchors = TrustAnchors::builtin()?;
        let keys = KeyManager::new(anchors, config.key_file.clone());
        Ok(Self::with_key_manager(config, keys))
    }

    /// Build a node around an existing key manager (custom anchors).
    pub fn with_key_manager(
        config: NodeConfig,
        keys: KeyManager,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mesh = Arc::new(Mesh::new(
            config.client_version.clone(),
            config.min_remote_version.clone(),
            DedupCache::new(config.dedup_ttl),
            events_tx,
        ));
        let keys = Arc::new(keys);
        let listener = Listener::new(
            Arc::clone(&mesh),
            Arc::clone(&keys),
            &config,
            shutdown_rx.clone(),
        );
        let node = Arc::new(Self {
            config,
            mesh,
            keys,
            listener,
            state: RwLock::new(NodeState::default()),
            shutdown_tx,
            shutdown_rx,
        });
        (node, events_rx)
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state.read();
        NodeStatus {
            peer_id: self.mesh.local_peer_id(),
            connected: state.connected,
            outbound_peers: self.mesh.outbound.len(),
            inbound_peers: self.mesh.inbound.len(),
            network_peer_count: state.network_peer_count,
        }
    }

    pub fn key_manager(&self) -> &KeyManager {
        &self.keys
    }

    pub fn listener_port(&self) -> u16 {
        self.listener.local_port()
    }

    /// Open the inbound listener without a rendezvous join (static meshes).
    pub async fn open_listener(&self) -> std::io::Result<u16> {
        self.listener.open(self.config.listen_port).await
    }

    /// Join the network. On any failure the bootstrap link, the listener,
    /// and any partially-dialed peers are torn down and false is returned.
    pub async fn connect(self: &Arc<Self>) -> bool {
        match self.join().await {
            Ok(()) => {
                info!(peer_id = self.mesh.local_peer_id(), "joined the network");
                true
            }
            Err(e) => {
                warn!(error = %e, "join failed");
                self.mesh.emit(NodeEvent::Error(format!("join failed: {e}")));
                self.teardown().await;
                false
            }
        }
    }

    /// Periodic keep-alive re-registration with the rendezvous server.
    pub async fn echo(self: &Arc<Self>) -> bool {
        match self.run_echo().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "echo failed");
                self.mesh.emit(NodeEvent::Error(format!("echo failed: {e}")));
                false
            }
        }
    }

    /// Leave the network: revoke the key at the rendezvous server, then tear
    /// everything down. Teardown happens even when the revocation fails.
    pub async fn disconnect(self: &Arc<Self>) -> bool {
        let result = self.leave().await;
        let _ = self.shutdown_tx.send(true);
        self.teardown().await;
        self.state.write().connected = false;
        match result {
            Ok(()) => {
                info!("left the network");
                true
            }
            Err(e) => {
                warn!(error = %e, "leave failed");
                self.mesh.emit(NodeEvent::Error(format!("leave failed: {e}")));
                false
            }
        }
    }

    /// Originate a broadcast into the mesh and remember its identity so
    /// echoes of it are not re-relayed.
    pub async fn broadcast(&self, fields: Vec<String>, exclude: Option<u32>) {
        let msg = ProtocolMessage::new(codes::RELAY, 1, fields);
        self.mesh
            .dedup
            .insert(msg.identity(), self.mesh.local_peer_id());
        self.mesh.broadcast_all(&msg, exclude).await;
        self.mesh.emit(NodeEvent::BroadcastSent(msg));
    }

    /// Build, sign, and flood a user-originated quake report for `area_code`.
    pub async fn create_user_broadcast(
        &self,
        area_code: u32,
    ) -> Result<ProtocolMessage, NodeError> {
        let msg = self.keys.create_user_broadcast(area_code)?;
        self.mesh
            .dedup
            .insert(msg.identity(), self.mesh.local_peer_id());
        self.mesh.broadcast_all(&msg, None).await;
        self.mesh.emit(NodeEvent::BroadcastSent(msg.clone()));
        Ok(msg)
    }

    // ---- rendezvous sequences -------------------------------------------

    async fn open_session(&self) -> Result<BootstrapSession, NodeError> {
        let addr = self
            .config
            .bootstrap_servers
            .choose(&mut rand::thread_rng())
            .ok_or(NodeError::NoBootstrap)?
            .clone();
        debug!(%addr, "contacting rendezvous server");
        let mut link = Transport::new(self.config.io_timeout);
        if !link.connect(&addr, self.config.connect_timeout).await? {
            return Err(NodeError::TransportTimeout);
        }
        Ok(BootstrapSession::new(link))
    }

    /// The 211→239 join conversation (spelled out in the state machine).
    async fn join(self: &Arc<Self>) -> Result<(), NodeError> {
        if self.config.max_inbound > 0 {
            // A previous join may have degraded the node to outbound-only;
            // each join re-runs the port check from a clean slate.
            self.listener.set_capacity(self.config.max_inbound);
            if self.listener.local_port() == 0 {
                self.listener.open(self.config.listen_port).await?;
            }
        }
        let mut session = self.open_session().await?;
        let result = self.join_steps(&mut session).await;
        session.link.close();
        result
    }

    async fn join_steps(self: &Arc<Self>, session: &mut BootstrapSession) -> Result<(), NodeError> {
        session.expect(HandshakeState::Connect).await?;
        self.send_version(session).await?;

        let msg = session.expect(HandshakeState::ServerVersion).await?;
        self.check_server_version(session, &msg).await?;
        session
            .send(&ProtocolMessage::new(codes::REQ_PEER_ID, 1, Vec::new()))
            .await?;

        let msg = session.expect(HandshakeState::PeerId).await?;
        let id: u32 = required_field(&msg, 0)?
            .parse()
            .map_err(|_| NodeError::MissingField { code: msg.code })?;
        self.mesh.set_local_peer_id(id);
        debug!(peer_id = id, "peer id assigned");
        let port = match self.listener.local_port() {
            0 => self.config.listen_port,
            bound => bound,
        };
        session
            .send(&ProtocolMessage::new(
                codes::REQ_PORT_CHECK,
                1,
                vec![port.to_string()],
            ))
            .await?;

        let msg = session.expect(HandshakeState::PortCheck).await?;
        if msg.field(0) == Some("0") {
            // Unreachable from outside; degrade to outbound-only.
            info!("inbound port unreachable, closing the listener");
            self.listener.set_capacity(0);
            self.listener.close().await;
        }
        session
            .send(&ProtocolMessage::new(codes::REQ_PEER_LIST, 1, Vec::new()))
            .await?;

        let msg = session.expect(HandshakeState::PeerConnection).await?;
        let connected = self.connect_listed_peers(&msg).await;
        if connected == 0 {
            return Err(NodeError::NoPeers);
        }
        let ids: Vec<String> = self
            .mesh
            .outbound
            .ids()
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        session
            .send(&ProtocolMessage::new(codes::REQ_ALLOCATE, 1, ids))
            .await?;

        let msg = session.expect(HandshakeState::AllocatePeer).await?;
        if let Ok(count) = required_field(&msg, 0)?.parse::<usize>() {
            self.state.write().network_peer_count = count;
        }
        self.send_own_id(session, codes::REQ_KEYS).await?;

        let msg = session.expect(HandshakeState::AllocateKeys).await?;
        self.adopt_key_bundle(&msg);
        self.send_own_id(session, codes::REQ_AREA_PEERS).await?;

        session.expect(HandshakeState::AreaPeers).await?;
        session
            .send(&ProtocolMessage::new(codes::REQ_TIME, 1, Vec::new()))
            .await?;

        let msg = session.expect(HandshakeState::ProtocolTime).await?;
        self.adopt_clock_offset(&msg)?;
        self.send_own_id(session, codes::REQ_BYE).await?;

        session.expect(HandshakeState::DisconnectServer).await?;
        self.state.write().connected = true;
        Ok(())
    }

    async fn run_echo(self: &Arc<Self>) -> Result<(), NodeError> {
        let mut session = self.open_session().await?;
        let result = self.echo_steps(&mut session).await;
        session.link.close();
        result
    }

    async fn echo_steps(self: &Arc<Self>, session: &mut BootstrapSession) -> Result<(), NodeError> {
        session.expect(HandshakeState::Connect).await?;
        self.send_version(session).await?;

        let msg = session.expect(HandshakeState::ServerVersion).await?;
        self.check_server_version(session, &msg).await?;
        let hello = format!(
            "{},{}",
            self.mesh.local_peer_id(),
            self.mesh.connected_count()
        );
        session
            .send(&ProtocolMessage::new(codes::REQ_ECHO_HELLO, 1, vec![hello]))
            .await?;

        session.expect(HandshakeState::EchoServer).await?;
        self.send_key_renewal(session).await?;

        let msg = session.expect(HandshakeState::ReallocateKeys).await?;
        self.adopt_key_bundle(&msg);

        // Running low on peers: ask for fresh candidates before leaving.
        if self.mesh.connected_count() <= self.config.low_peer_threshold {
            session
                .send(&ProtocolMessage::new(codes::REQ_PEER_LIST, 1, Vec::new()))
                .await?;
            let msg = session.expect(HandshakeState::PeerConnection).await?;
            self.connect_listed_peers(&msg).await;
            let ids: Vec<String> = self
                .mesh
                .outbound
                .ids()
                .into_iter()
                .map(|id| id.to_string())
                .collect();
            session
                .send(&ProtocolMessage::new(codes::REQ_ALLOCATE, 1, ids))
                .await?;
            let msg = session.expect(HandshakeState::AllocatePeer).await?;
            if let Ok(count) = required_field(&msg, 0)?.parse::<usize>() {
                self.state.write().network_peer_count = count;
            }
        }
        session
            .send(&ProtocolMessage::new(codes::REQ_TIME, 1, Vec::new()))
            .await?;

        let msg = session.expect(HandshakeState::ProtocolTime).await?;
        self.adopt_clock_offset(&msg)?;
        self.send_own_id(session, codes::REQ_BYE).await?;

        session.expect(HandshakeState::DisconnectServer).await?;
        Ok(())
    }

    async fn leave(self: &Arc<Self>) -> Result<(), NodeError> {
        let addr = self
            .config
            .bootstrap_servers
            .choose(&mut rand::thread_rng())
            .ok_or(NodeError::NoBootstrap)?
            .clone();
        // Unconditional reconnect loop; the revocation must reach a server.
        let mut link = Transport::new(self.config.io_timeout);
        loop {
            match link.connect(&addr, self.config.connect_timeout).await {
                Ok(true) => break,
                Ok(false) | Err(_) => time::sleep(std::time::Duration::from_millis(100)).await,
            }
        }
        self.teardown().await;

        let mut session = BootstrapSession::new(link);
        let result = self.leave_steps(&mut session).await;
        session.link.close();
        result
    }

    async fn leave_steps(
        self: &Arc<Self>,
        session: &mut BootstrapSession,
    ) -> Result<(), NodeError> {
        session.expect(HandshakeState::Connect).await?;
        self.send_version(session).await?;

        let msg = session.expect(HandshakeState::ServerVersion).await?;
        self.check_server_version(session, &msg).await?;

        let mut fields = vec![self.mesh.local_peer_id().to_string()];
        if let Some(keys) = self.keys.current() {
            fields.push(keys.private_key_b64()?);
        }
        session
            .send(&ProtocolMessage::new(codes::REQ_KEY_RENEW, 1, fields))
            .await?;

        session.expect(HandshakeState::FinalizeServer).await?;
        self.send_own_id(session, codes::REQ_BYE).await?;
        session.expect(HandshakeState::DisconnectServer).await?;
        Ok(())
    }

    // ---- shared steps ----------------------------------------------------

    async fn send_version(&self, session: &mut BootstrapSession) -> Result<(), NodeError> {
        session
            .send(&ProtocolMessage::new(
                codes::REQ_VERSION,
                1,
                vec![self.config.client_version.clone()],
            ))
            .await
    }

    /// Reject and abort when the server's announced version is below the
    /// minimum we speak.
    async fn check_server_version(
        &self,
        session: &mut BootstrapSession,
        msg: &ProtocolMessage,
    ) -> Result<(), NodeError> {
        let version = required_field(msg, 0)?.to_string();
        if !self.mesh.version_supported(&version) {
            session
                .send(&ProtocolMessage::new(codes::VERSION_REJECT, 1, Vec::new()))
                .await?;
            return Err(NodeError::UnsupportedVersion(version));
        }
        Ok(())
    }

    async fn send_own_id(&self, session: &mut BootstrapSession, code: u16) -> Result<(), NodeError> {
        session
            .send(&ProtocolMessage::new(
                code,
                1,
                vec![self.mesh.local_peer_id().to_string()],
            ))
            .await
    }

    /// Key step of the echo: re-present the current material, or ask for a
    /// fresh key when none is held or expiry is near.
    async fn send_key_renewal(&self, session: &mut BootstrapSession) -> Result<(), NodeError> {
        let margin = TimeDelta::from_std(self.config.key_renew_margin)
            .unwrap_or_else(|_| TimeDelta::minutes(30));
        let mut fields = vec![self.mesh.local_peer_id().to_string()];
        if !self.keys.expires_within(margin) {
            if let Some(keys) = self.keys.current() {
                fields.push(keys.private_key_b64()?);
                fields.push(keys.public_key_b64.clone());
                fields.push(keys::format_wire_time(&keys.invalidation_date));
                fields.push(keys.signature_b64.clone());
            }
        }
        session
            .send(&ProtocolMessage::new(codes::REQ_KEY_RENEW, 1, fields))
            .await
    }

    /// Install a 237/244 bundle; 295 means keep what we have. A malformed
    /// bundle is logged and skipped, never fatal.
    fn adopt_key_bundle(&self, msg: &ProtocolMessage) {
        if msg.code == codes::KEY_UNCHANGED {
            return;
        }
        if let Err(e) = self.keys.accept_bundle(&msg.fields) {
            warn!(error = %e, "key bundle rejected");
        }
    }

    fn adopt_clock_offset(&self, msg: &ProtocolMessage) -> Result<(), NodeError> {
        let stated = keys::parse_wire_time(&msg.raw_body())
            .map_err(|_| NodeError::MissingField { code: msg.code })?;
        let offset = (stated - keys::now()).num_seconds();
        self.keys.set_clock_offset(offset);
        debug!(offset_secs = offset, "server clock offset adopted");
        Ok(())
    }

    /// Dial the `host,port,peerId` triples from a 235 reply, stopping after
    /// `max_outbound` successes. Returns how many connected.
    async fn connect_listed_peers(self: &Arc<Self>, msg: &ProtocolMessage) -> usize {
        let mut connected = 0;
        for triple in &msg.fields {
            if connected >= self.config.max_outbound {
                break;
            }
            let mut parts = triple.split(',');
            let (host, port, id) = match (parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(i)) => (h, p, i),
                _ => continue,
            };
            let (port, id): (u16, u32) = match (port.parse(), id.parse()) {
                (Ok(p), Ok(i)) => (p, i),
                _ => continue,
            };
            if self.mesh.outbound.find(id).is_some() || id == self.mesh.local_peer_id() {
                continue;
            }
            match self.dial_peer(host, port, id).await {
                Ok(()) => connected += 1,
                Err(e) => debug!(host, port, peer_id = id, error = %e, "peer dial failed"),
            }
        }
        connected
    }

    async fn dial_peer(self: &Arc<Self>, host: &str, port: u16, id: u32) -> std::io::Result<()> {
        let stream = time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "peer connect timed out"))??;
        let addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        let peer = PeerConnection::new(PeerRole::Outbound, addr, write, self.config.io_timeout);
        peer.set_peer_id(id);
        self.mesh.outbound.add(Arc::clone(&peer));
        peer::spawn_receive_loop(
            Arc::clone(&self.mesh),
            Arc::clone(&self.keys),
            Arc::clone(&peer),
            read,
            self.shutdown_rx.clone(),
        );
        self.mesh.emit(NodeEvent::PeerConnected {
            peer_id: id,
            role: PeerRole::Outbound,
        });
        Ok(())
    }

    /// Close every owned peer and the listener.
    async fn teardown(&self) {
        for peer in self.mesh.outbound.drain() {
            peer.close().await;
        }
        self.listener.close().await;
    }
}

fn required_field(msg: &ProtocolMessage, index: usize) -> Result<&str, NodeError> {
    msg.field(index)
        .ok_or(NodeError::MissingField { code: msg.code })
}
