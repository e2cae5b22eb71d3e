//! Cluster node descriptors

use crate::hrw;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a cluster member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonType {
    Proxy,
    Target,
}

/// One network identity of a node: where it listens and how to reach it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    pub node_ip_addr: String,
    pub daemon_port: String,
    /// Full URL with scheme, e.g. `http://10.0.0.1:8081`
    pub direct_url: String,
}

impl NetInfo {
    pub fn new(proto: &str, ip: &str, port: u16) -> Self {
        Self {
            node_ip_addr: ip.to_string(),
            daemon_port: port.to_string(),
            direct_url: format!("{proto}://{ip}:{port}"),
        }
    }
}

/// A cluster member: proxy (gateway) or target (storage)
///
/// Nodes carry three endpoints: public (clients), intra-control (metadata
/// sync, health) and intra-data (bulk streams). When a deployment does not
/// separate networks the three are identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snode {
    pub daemon_id: String,
    pub daemon_type: DaemonType,
    pub public_net: NetInfo,
    pub intra_control_net: NetInfo,
    pub intra_data_net: NetInfo,
    /// HRW tie-break key derived from the daemon ID; recomputed after
    /// deserialization, never transmitted
    #[serde(skip)]
    pub(crate) digest: u64,
}

impl Snode {
    pub fn new(
        daemon_id: impl Into<String>,
        daemon_type: DaemonType,
        public_net: NetInfo,
        intra_control_net: Option<NetInfo>,
        intra_data_net: Option<NetInfo>,
    ) -> Self {
        let daemon_id = daemon_id.into();
        let digest = hrw::hash64(daemon_id.as_bytes());
        let intra_control_net = intra_control_net.unwrap_or_else(|| public_net.clone());
        let intra_data_net = intra_data_net.unwrap_or_else(|| public_net.clone());
        Self {
            daemon_id,
            daemon_type,
            public_net,
            intra_control_net,
            intra_data_net,
            digest,
        }
    }

    pub fn is_proxy(&self) -> bool {
        self.daemon_type == DaemonType::Proxy
    }

    pub fn is_target(&self) -> bool {
        self.daemon_type == DaemonType::Target
    }

    /// HRW digest; valid once `init_digest` has run (constructors do)
    pub fn digest(&self) -> u64 {
        debug_assert_ne!(self.digest, 0, "digest not initialized");
        self.digest
    }

    pub(crate) fn init_digest(&mut self) {
        self.digest = hrw::hash64(self.daemon_id.as_bytes());
    }

    /// Intra-control URL (metadata, health)
    pub fn ctrl_url(&self) -> &str {
        &self.intra_control_net.direct_url
    }

    /// Intra-data URL (bulk streams)
    pub fn data_url(&self) -> &str {
        &self.intra_data_net.direct_url
    }
}

impl fmt::Display for Snode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_proxy() { "p" } else { "t" };
        write!(f, "{}[{}]", prefix, self.daemon_id)
    }
}
