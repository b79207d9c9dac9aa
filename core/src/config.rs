//! Node configuration

use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration. Defaults reproduce the legacy client's constants.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Rendezvous server candidates, `host:port`. One is picked at random
    /// per bootstrap call.
    pub bootstrap_servers: Vec<String>,
    /// Inbound listen port (0 = ephemeral).
    pub listen_port: u16,
    /// Inbound connection cap. Forced to 0 when the port check reports the
    /// node unreachable.
    pub max_inbound: usize,
    /// Outbound connections attempted per peer-list response.
    pub max_outbound: usize,
    /// Version announced to the rendezvous server and to peers.
    pub client_version: String,
    /// Remotes below this version are rejected.
    pub min_remote_version: String,
    /// Rendezvous / peer connect timeout.
    pub connect_timeout: Duration,
    /// Per-socket send/receive timeout once connected.
    pub io_timeout: Duration,
    /// Relay-loop suppression window.
    pub dedup_ttl: Duration,
    /// Key material file (four lines). `None` keeps keys in memory only.
    pub key_file: Option<PathBuf>,
    /// Initial delay before the first inbound keep-alive probe.
    pub keepalive_delay: Duration,
    /// Interval between subsequent keep-alive probes.
    pub keepalive_interval: Duration,
    /// Echo renews the key when it expires within this margin.
    pub key_renew_margin: Duration,
    /// Echo asks for more peers when at or below this count.
    pub low_peer_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Vec::new(),
            listen_port: 6911,
            max_inbound: 6,
            max_outbound: 5,
            client_version: "0.34".to_string(),
            min_remote_version: "0.20".to_string(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(1),
            dedup_ttl: Duration::from_secs(60),
            key_file: None,
            keepalive_delay: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(180),
            key_renew_margin: Duration::from_secs(30 * 60),
            low_peer_threshold: 3,
        }
    }
}
