//! Data-directory layout and the optional `rafcoin.toml` config file.
//!
//! The resolved data directory is passed down explicitly; nothing here is
//! process-global. CLI flags override config-file values, which override the
//! defaults. A missing or unparseable file falls back to defaults.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants;

/// Location of the block store under the data directory.
pub fn blocks_path(data_dir: &Path) -> PathBuf {
    data_dir.join("blocks")
}

/// Location of the wallet file under the data directory.
pub fn wallet_path(data_dir: &Path) -> PathBuf {
    data_dir.join("wallet.dat")
}

/// Top-level `rafcoin.toml` contents.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub node: NodeSection,
}

/// The `[node]` section.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub listen_ip: Ipv4Addr,
    pub port: u16,
    pub rpc_port: u16,
    pub seed: Option<String>,
    pub miner_address: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            port: constants::DEFAULT_P2P_PORT,
            rpc_port: constants::DEFAULT_RPC_PORT,
            seed: None,
            miner_address: None,
        }
    }
}

impl FileConfig {
    /// Load `rafcoin.toml` from the data directory, or defaults when absent.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join("rafcoin.toml");
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_constants() {
        let config = FileConfig::default();
        assert_eq!(config.node.port, constants::DEFAULT_P2P_PORT);
        assert_eq!(config.node.rpc_port, constants::DEFAULT_RPC_PORT);
        assert!(config.node.seed.is_none());
        assert!(config.node.miner_address.is_none());
    }

    #[test]
    fn parse_toml() {
        let toml_str = r#"
[node]
port = 9999
rpc_port = 19999
seed = "10.0.0.1:9333"
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.port, 9999);
        assert_eq!(config.node.rpc_port, 19999);
        assert_eq!(config.node.seed.as_deref(), Some("10.0.0.1:9333"));
    }

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::load(dir.path());
        assert_eq!(config.node.port, constants::DEFAULT_P2P_PORT);
    }

    #[test]
    fn paths_derive_from_data_dir() {
        let dir = Path::new("/tmp/raf");
        assert_eq!(blocks_path(dir), PathBuf::from("/tmp/raf/blocks"));
        assert_eq!(wallet_path(dir), PathBuf::from("/tmp/raf/wallet.dat"));
    }
}
