//! Wire protocol — message framing and code assignments

pub mod message;

pub use message::ProtocolMessage;

/// Protocol message codes.
///
/// Handshake responses arrive from the rendezvous server; client requests go
/// back to it; mesh codes travel between peers.
pub mod codes {
    // Rendezvous responses
    pub const HELLO: u16 = 211;
    pub const SERVER_VERSION: u16 = 212;
    pub const PEER_ID_ASSIGN: u16 = 233;
    pub const PORT_CHECK_RESULT: u16 = 234;
    pub const PEER_LIST: u16 = 235;
    pub const ALLOCATION: u16 = 236;
    pub const KEY_ALLOCATION: u16 = 237;
    pub const PROTOCOL_TIME: u16 = 238;
    pub const BOOTSTRAP_BYE: u16 = 239;
    pub const ECHO_OK: u16 = 243;
    pub const KEY_REALLOCATION: u16 = 244;
    pub const AREA_PEERS: u16 = 247;
    pub const REVOKE_OK: u16 = 248;
    /// Short-circuit: key already issued, keep the current one.
    pub const KEY_UNCHANGED: u16 = 295;

    // Client requests
    pub const REQ_VERSION: u16 = 113;
    pub const REQ_PEER_ID: u16 = 114;
    pub const REQ_PORT_CHECK: u16 = 115;
    pub const REQ_PEER_LIST: u16 = 116;
    pub const REQ_ALLOCATE: u16 = 117;
    pub const REQ_KEYS: u16 = 118;
    pub const REQ_AREA_PEERS: u16 = 119;
    pub const REQ_ECHO_HELLO: u16 = 123;
    pub const REQ_KEY_RENEW: u16 = 124;
    pub const REQ_TIME: u16 = 127;
    pub const REQ_BYE: u16 = 128;
    pub const VERSION_REJECT: u16 = 192;

    // Peer mesh
    pub const PEER_PROBE: u16 = 611;
    pub const PEER_PROBE_ACK: u16 = 631;
    pub const PEER_ID_REQUEST: u16 = 612;
    pub const PEER_ID_ACK: u16 = 632;
    pub const PEER_VERSION: u16 = 614;
    pub const PEER_VERSION_ACK: u16 = 634;
    pub const PEER_VERSION_REJECT: u16 = 694;
    /// Primary flood-relay request.
    pub const RELAY: u16 = 615;
    /// Unicast acknowledgment routed back along the flood path.
    pub const RELAY_ACK: u16 = 635;
    /// User-originated broadcast with the six-field signature bundle.
    pub const USER_QUAKE: u16 = 555;
}
