//! Rendezvous handshake — the scripted server conversation
//!
//! Every exchange with a rendezvous server walks a fixed sequence of
//! response codes; a reply outside the expected step is a protocol
//! violation and aborts the session.

use crate::error::NodeError;
use crate::protocol::{codes, ProtocolMessage};
use crate::transport::Transport;
use tracing::trace;

/// One step of the server conversation, named for the reply we wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// 211: server greeting.
    Connect,
    /// 212: server protocol version.
    ServerVersion,
    /// 233: our assigned peer id.
    PeerId,
    /// 234: port reachability verdict.
    PortCheck,
    /// 235: peer list.
    PeerConnection,
    /// 236: network peer count.
    AllocatePeer,
    /// 237: key bundle (295 when the current key stays valid).
    AllocateKeys,
    /// 247: regional peer counts.
    AreaPeers,
    /// 238: protocol time.
    ProtocolTime,
    /// 239: session end.
    DisconnectServer,
    /// 243: echo acknowledged.
    EchoServer,
    /// 244: renewed key bundle (295 when the current key stays valid).
    ReallocateKeys,
    /// 248: key revoked on leave.
    FinalizeServer,
}

impl HandshakeState {
    pub fn expected_code(&self) -> u16 {
        match self {
            Self::Connect => codes::HELLO,
            Self::ServerVersion => codes::SERVER_VERSION,
            Self::PeerId => codes::PEER_ID_ASSIGN,
            Self::PortCheck => codes::PORT_CHECK_RESULT,
            Self::PeerConnection => codes::PEER_LIST,
            Self::AllocatePeer => codes::ALLOCATION,
            Self::AllocateKeys => codes::KEY_ALLOCATION,
            Self::AreaPeers => codes::AREA_PEERS,
            Self::ProtocolTime => codes::PROTOCOL_TIME,
            Self::DisconnectServer => codes::BOOTSTRAP_BYE,
            Self::EchoServer => codes::ECHO_OK,
            Self::ReallocateKeys => codes::KEY_REALLOCATION,
            Self::FinalizeServer => codes::REVOKE_OK,
        }
    }

    /// Steps where the server may answer 295 (keep the current key) instead
    /// of the nominal code.
    pub fn allows_decline(&self) -> bool {
        matches!(self, Self::AllocateKeys | Self::ReallocateKeys)
    }
}

/// A live conversation with one rendezvous server.
pub struct BootstrapSession {
    pub link: Transport,
}

impl BootstrapSession {
    pub fn new(link: Transport) -> Self {
        Self { link }
    }

    pub async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), NodeError> {
        trace!(line = %msg, "handshake send");
        self.link.write_line(&msg.to_line()).await?;
        Ok(())
    }

    /// Wait for the reply this step expects. An empty read means the server
    /// went silent; a mismatched code is a violation.
    pub async fn expect(&mut self, state: HandshakeState) -> Result<ProtocolMessage, NodeError> {
        let line = self.link.read_message().await?;
        if line.is_empty() {
            return Err(NodeError::TransportTimeout);
        }
        let msg = ProtocolMessage::parse(&line)?;
        trace!(line = %msg, state = ?state, "handshake recv");
        let expected = state.expected_code();
        if msg.code == expected || (state.allows_decline() && msg.code == codes::KEY_UNCHANGED) {
            Ok(msg)
        } else {
            Err(NodeError::ProtocolViolation {
                expected,
                received: msg.code,
            })
        }
    }
}
