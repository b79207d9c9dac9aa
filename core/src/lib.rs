// Quakemesh — peer-to-peer earthquake-alert distribution engine
//
// A node joins the overlay by handshaking with a rendezvous server, keeps a
// small mesh of direct peer links, and relays short authenticated broadcast
// lines across that mesh with a deduplicating flood. Rendering, history and
// UI live in external consumers; this crate only surfaces "a broadcast
// arrived" / "a broadcast was sent" and accepts requests to originate one.

pub mod config;
pub mod error;
pub mod keys;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use config::NodeConfig;
pub use error::NodeError;
pub use keys::{KeyManager, QuakeKeys, TrustAnchors};
pub use node::{Node, NodeStatus};
pub use peer::PeerRole;
pub use protocol::ProtocolMessage;

/// Notifications surfaced to the external (visualization) layer.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A new broadcast reached this node and was relayed onward.
    BroadcastReceived(ProtocolMessage),
    /// A locally-originated broadcast was handed to the mesh.
    BroadcastSent(ProtocolMessage),
    /// A peer link was established.
    PeerConnected { peer_id: u32, role: PeerRole },
    /// A peer link went away and its record was dropped.
    PeerDisconnected { peer_id: u32 },
    /// A relay acknowledgment to one of our own broadcasts carried peer ids
    /// we are not connected to; candidates for future dials.
    PeerCandidates { peer_ids: Vec<u32> },
    /// A non-fatal error (protocol violation, authentication failure, I/O).
    Error(String),
}
