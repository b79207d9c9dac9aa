//! Relay router — decision logic mapping an incoming message + sender to the
//! outgoing sends: flood, reply, or unicast-back.

use super::Mesh;
use crate::keys::KeyManager;
use crate::peer::PeerConnection;
use crate::protocol::{codes, ProtocolMessage};
use crate::NodeEvent;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Dispatch one received message. Mesh-maintenance codes get a one-step
/// reply; relay requests flood with a unicast acknowledgment back to the
/// sender; everything else floods dedup-guarded.
pub async fn route(
    mesh: &Arc<Mesh>,
    keys: &Arc<KeyManager>,
    sender: &Arc<PeerConnection>,
    msg: ProtocolMessage,
) {
    trace!(code = msg.code, peer_id = sender.peer_id(), "routing");
    match msg.code {
        codes::PEER_VERSION => {
            let remote = msg.field(0).unwrap_or_default();
            if mesh.version_supported(remote) {
                let ack = ProtocolMessage::new(
                    codes::PEER_VERSION_ACK,
                    1,
                    vec![mesh.client_version.clone()],
                );
                send_or_log(sender, &ack).await;
            } else {
                debug!(peer_id = sender.peer_id(), %remote, "rejecting peer version");
                let reject = ProtocolMessage::new(codes::PEER_VERSION_REJECT, 1, Vec::new());
                send_or_log(sender, &reject).await;
                drop_peer(mesh, sender).await;
            }
        }
        codes::PEER_VERSION_ACK => {}
        codes::PEER_VERSION_REJECT => {
            debug!(peer_id = sender.peer_id(), "remote rejected our version");
            drop_peer(mesh, sender).await;
        }
        codes::PEER_ID_REQUEST => {
            let ack = ProtocolMessage::new(
                codes::PEER_ID_ACK,
                1,
                vec![mesh.local_peer_id().to_string()],
            );
            send_or_log(sender, &ack).await;
        }
        codes::PEER_ID_ACK => {
            if let Some(id) = msg.field(0).and_then(|f| f.parse::<u32>().ok()) {
                sender.set_peer_id(id);
            }
        }
        codes::PEER_PROBE => {
            let ack = ProtocolMessage::new(codes::PEER_PROBE_ACK, 1, Vec::new());
            send_or_log(sender, &ack).await;
        }
        codes::PEER_PROBE_ACK => {}
        codes::RELAY => relay_request(mesh, sender, msg).await,
        codes::RELAY_ACK => relay_ack(mesh, sender, msg).await,
        _ => default_flood(mesh, keys, sender, msg).await,
    }
}

/// Primary flood propagation. First sighting: forward with the relay count
/// bumped, unicast an acknowledgment back carrying our known peer ids, then
/// remember the identity. Duplicates drop silently.
async fn relay_request(mesh: &Arc<Mesh>, sender: &Arc<PeerConnection>, msg: ProtocolMessage) {
    mesh.dedup.purge_expired();
    let identity = msg.identity();
    if identity.is_empty() || mesh.dedup.contains(&identity) {
        trace!(%identity, "duplicate relay request dropped");
        return;
    }

    mesh.flood(&msg.forwarded(), sender).await;

    let ids = mesh
        .known_peer_ids()
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");
    let ack = ProtocolMessage::new(
        codes::RELAY_ACK,
        msg.relay_count.saturating_sub(1),
        vec![identity.clone(), ids],
    );
    send_or_log(sender, &ack).await;

    mesh.dedup.insert(identity, sender.peer_id());
    mesh.emit(NodeEvent::BroadcastReceived(msg));
}

/// Route the acknowledgment back to whichever connected peer first asked for
/// this identity. An ack to our own broadcast terminates here: its peer-id
/// list is surfaced as mesh candidates. No match means the path died, drop.
async fn relay_ack(mesh: &Arc<Mesh>, _sender: &Arc<PeerConnection>, msg: ProtocolMessage) {
    mesh.dedup.purge_expired();
    let identity = msg.identity();
    match mesh.dedup.origin_of(&identity) {
        Some(origin) if origin == mesh.local_peer_id() => {
            let known = mesh.known_peer_ids();
            let candidates: Vec<u32> = msg
                .field(1)
                .unwrap_or_default()
                .split(',')
                .filter_map(|s| s.parse().ok())
                .filter(|id| *id != 0 && *id != mesh.local_peer_id() && !known.contains(id))
                .collect();
            if !candidates.is_empty() {
                mesh.emit(NodeEvent::PeerCandidates {
                    peer_ids: candidates,
                });
            }
        }
        Some(origin) => {
            if !mesh.unicast(&msg.forwarded(), origin).await {
                trace!(%identity, origin, "relay ack origin no longer connected");
            }
        }
        None => trace!(%identity, "relay ack without a matching request, dropped"),
    }
}

/// Any other informational/broadcast code: authenticate, then dedup-guarded
/// flood without the unicast acknowledgment.
async fn default_flood(
    mesh: &Arc<Mesh>,
    keys: &Arc<KeyManager>,
    sender: &Arc<PeerConnection>,
    msg: ProtocolMessage,
) {
    if msg.has_body() {
        if let Err(e) = keys.verify_message(&msg) {
            warn!(code = msg.code, error = %e, "broadcast failed authentication, dropped");
            mesh.emit(NodeEvent::Error(format!(
                "authentication failure on code {}: {e}",
                msg.code
            )));
            return;
        }
    }

    mesh.dedup.purge_expired();
    let identity = msg.identity();
    if mesh.dedup.contains(&identity) {
        trace!(%identity, "duplicate broadcast dropped");
        return;
    }
    mesh.flood(&msg.forwarded(), sender).await;
    mesh.dedup.insert(identity, sender.peer_id());
    mesh.emit(NodeEvent::BroadcastReceived(msg));
}

async fn drop_peer(mesh: &Arc<Mesh>, peer: &Arc<PeerConnection>) {
    mesh.remove(peer);
    peer.close().await;
}

async fn send_or_log(peer: &Arc<PeerConnection>, msg: &ProtocolMessage) {
    if let Err(e) = peer.send(msg).await {
        trace!(peer_id = peer.peer_id(), error = %e, "reply send failed");
    }
}
