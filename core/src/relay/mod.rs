//! Relay — shared mesh state and the flood routing rules

pub mod dedup;
pub mod router;

pub use dedup::DedupCache;

use crate::peer::{PeerConnection, PeerRole, PeerTable};
use crate::protocol::ProtocolMessage;
use crate::NodeEvent;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// State shared between the node, the listener, and every peer receive loop:
/// both peer tables, the dedup cache, and the event channel. Each collection
/// guards itself; nothing here is held across an await.
pub struct Mesh {
    pub outbound: PeerTable,
    pub inbound: PeerTable,
    pub dedup: DedupCache,
    pub client_version: String,
    pub min_remote_version: String,
    local_peer_id: AtomicU32,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Mesh {
    pub fn new(
        client_version: String,
        min_remote_version: String,
        dedup: DedupCache,
        events: mpsc::UnboundedSender<NodeEvent>,
    ) -> Self {
        Self {
            outbound: PeerTable::new(),
            inbound: PeerTable::new(),
            dedup,
            client_version,
            min_remote_version,
            local_peer_id: AtomicU32::new(0),
            events,
        }
    }

    pub fn local_peer_id(&self) -> u32 {
        self.local_peer_id.load(Ordering::Relaxed)
    }

    pub fn set_local_peer_id(&self, id: u32) {
        self.local_peer_id.store(id, Ordering::Relaxed);
    }

    /// Ids of every connected peer, both roles, unknown ids skipped.
    pub fn known_peer_ids(&self) -> Vec<u32> {
        let mut ids = self.outbound.ids();
        for id in self.inbound.ids() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids.retain(|id| *id != 0);
        ids
    }

    pub fn connected_count(&self) -> usize {
        self.outbound.len() + self.inbound.len()
    }

    pub fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// True when a remote's announced version meets the minimum supported.
    pub fn version_supported(&self, version: &str) -> bool {
        match (
            version.trim().parse::<f64>(),
            self.min_remote_version.parse::<f64>(),
        ) {
            (Ok(remote), Ok(min)) => remote >= min,
            _ => false,
        }
    }

    /// Flood to all connected peers except the sender. The exclusion is by
    /// peer id within the sender's own role group only; the other role group
    /// receives the message regardless of id match. This mirrors the legacy
    /// two-branch relay code on the wire.
    pub async fn flood(&self, msg: &ProtocolMessage, sender: &PeerConnection) {
        let (same_role, other_role) = match sender.role {
            PeerRole::Outbound => (&self.outbound, &self.inbound),
            PeerRole::Inbound => (&self.inbound, &self.outbound),
        };
        for peer in same_role.snapshot() {
            if peer.peer_id() == sender.peer_id() {
                continue;
            }
            send_quiet(&peer, msg).await;
        }
        for peer in other_role.snapshot() {
            send_quiet(&peer, msg).await;
        }
    }

    /// Send to every connected peer, both roles, skipping `exclude` by id.
    /// Used when this node originates a broadcast.
    pub async fn broadcast_all(&self, msg: &ProtocolMessage, exclude: Option<u32>) {
        for peer in self
            .outbound
            .snapshot()
            .into_iter()
            .chain(self.inbound.snapshot())
        {
            if exclude == Some(peer.peer_id()) {
                continue;
            }
            send_quiet(&peer, msg).await;
        }
    }

    /// Unicast to the single connected peer with this id. Returns false when
    /// no such peer exists.
    pub async fn unicast(&self, msg: &ProtocolMessage, peer_id: u32) -> bool {
        let target = self
            .outbound
            .find(peer_id)
            .or_else(|| self.inbound.find(peer_id));
        match target {
            Some(peer) => {
                send_quiet(&peer, msg).await;
                true
            }
            None => false,
        }
    }

    /// Drop a peer record from whichever table holds it.
    pub fn remove(&self, peer: &Arc<PeerConnection>) {
        if self.outbound.remove(peer) || self.inbound.remove(peer) {
            self.emit(NodeEvent::PeerDisconnected {
                peer_id: peer.peer_id(),
            });
        }
    }
}

async fn send_quiet(peer: &Arc<PeerConnection>, msg: &ProtocolMessage) {
    if let Err(e) = peer.send(msg).await {
        trace!(peer_id = peer.peer_id(), error = %e, "relay send failed");
    }
}
