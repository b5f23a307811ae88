use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine-wide configuration.
///
/// Everything here is plain data; injectable collaborators (channel
/// supplier, authentication strategy, clock) are constructor parameters on
/// the framer instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfiguration {
    /// Host the acceptor socket binds to
    pub bind_host: String,
    /// Port the acceptor socket binds to
    pub bind_port: u16,
    /// Channel URI for library traffic
    pub library_channel: String,
    /// Channel URI for cluster-replicated traffic
    pub cluster_channel: String,
    /// This node's id within the cluster
    pub node_id: u16,
    /// Peer node ids
    pub other_node_ids: Vec<u16>,
    /// A library is timed out when silent longer than this
    pub reply_timeout_ms: u64,
    /// Directory for the replicated log's files
    pub log_file_dir: PathBuf,
    /// Path of the monitoring counters file
    pub monitoring_file: PathBuf,
    /// Heartbeat interval offered on engine-initiated logons when the
    /// request does not carry one
    pub default_heartbeat_interval_s: u32,
    /// Command fragments dispatched per tick
    pub command_fragment_limit: usize,
    /// New connections accepted per tick
    pub accept_limit: usize,
    /// Complete frames consumed per connection per tick
    pub frames_per_connection: usize,
    /// Receive buffer capacity per connection, bytes
    pub receive_buffer_size: usize,
    /// Outbound buffer capacity per connection, bytes
    pub send_buffer_size: usize,
    /// Bound of the in-process publication bus; a full bus back-pressures
    pub publication_capacity: usize,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 9999,
            library_channel: "aeron:ipc".to_string(),
            cluster_channel: "aeron:udp?endpoint=224.0.1.1:40456".to_string(),
            node_id: 1,
            other_node_ids: Vec::new(),
            reply_timeout_ms: 10_000,
            log_file_dir: PathBuf::from("fixgate-logs"),
            monitoring_file: PathBuf::from("fixgate-logs/monitoring"),
            default_heartbeat_interval_s: 10,
            command_fragment_limit: 10,
            accept_limit: 8,
            frames_per_connection: 4,
            receive_buffer_size: 16 * 1024,
            send_buffer_size: 16 * 1024,
            publication_capacity: 1024,
        }
    }
}

impl EngineConfiguration {
    pub fn bind_to(mut self, host: impl Into<String>, port: u16) -> Self {
        self.bind_host = host.into();
        self.bind_port = port;
        self
    }

    pub fn reply_timeout_in_ms(mut self, timeout_ms: u64) -> Self {
        self.reply_timeout_ms = timeout_ms;
        self
    }

    pub fn library_channel(mut self, uri: impl Into<String>) -> Self {
        self.library_channel = uri.into();
        self
    }

    pub fn cluster_channel(mut self, uri: impl Into<String>) -> Self {
        self.cluster_channel = uri.into();
        self
    }

    pub fn node(mut self, node_id: u16, other_node_ids: Vec<u16>) -> Self {
        self.node_id = node_id;
        self.other_node_ids = other_node_ids;
        self
    }

    pub fn log_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_file_dir = dir.into();
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}
