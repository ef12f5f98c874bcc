use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::raft::types::ServerId;

/// A cluster member, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Network address in `host:port` form.
    pub address: String,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique identifier for this server
    pub server_id: ServerId,

    /// TCP port to listen on for clients and peers
    pub listen_port: u16,

    /// The other cluster members (excluding this server)
    pub peers: Vec<Peer>,

    /// Directory for the WAL, its metadata sidecar, and snapshots
    pub data_dir: PathBuf,

    /// Minimum election timeout in milliseconds
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds
    /// Must be strictly less than election_timeout_min_ms
    pub heartbeat_interval_ms: u64,

    /// Per-operation connect/read timeout for peer RPCs in milliseconds
    pub rpc_timeout_ms: u64,

    /// How long a client PUT waits for quorum commit before TIMEOUT
    pub replication_timeout_ms: u64,

    /// Applied entries beyond first_log_index before a snapshot is taken
    pub snapshot_threshold: u64,
}

impl ServerConfig {
    /// Build a config from CLI arguments, taking the data directory from
    /// `LOGKV_DATA_DIR` (default `.`).
    pub fn from_args(listen_port: u16, server_id: ServerId, peer_addrs: Vec<String>) -> Self {
        let data_dir = std::env::var("LOGKV_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        Self {
            server_id,
            listen_port,
            peers: peer_addrs.into_iter().map(Peer::new).collect(),
            data_dir,
            ..Self::default()
        }
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_millis(self.replication_timeout_ms)
    }

    /// Total cluster size including this server.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(format!("wal_{}.log", self.listen_port))
    }

    pub fn wal_meta_path(&self) -> PathBuf {
        self.data_dir.join(format!("wal_{}.meta", self.listen_port))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }

        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat_interval must be less than election_timeout_min".to_string());
        }

        if self.snapshot_threshold == 0 {
            return Err("snapshot_threshold must be positive".to_string());
        }

        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            listen_port: 8080,
            peers: Vec::new(),
            data_dir: PathBuf::from("."),
            election_timeout_min_ms: 1500,
            election_timeout_max_ms: 3000,
            heartbeat_interval_ms: 500,
            rpc_timeout_ms: 200,
            replication_timeout_ms: 2000,
            snapshot_threshold: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let config = ServerConfig {
            heartbeat_interval_ms: 1500,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn data_files_are_named_by_port() {
        let config = ServerConfig {
            listen_port: 8081,
            data_dir: PathBuf::from("/tmp/logkv"),
            ..ServerConfig::default()
        };
        assert_eq!(config.wal_path(), PathBuf::from("/tmp/logkv/wal_8081.log"));
        assert_eq!(
            config.wal_meta_path(),
            PathBuf::from("/tmp/logkv/wal_8081.meta")
        );
        assert_eq!(config.snapshot_dir(), PathBuf::from("/tmp/logkv/snapshots"));
    }
}
