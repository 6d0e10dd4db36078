//! Node configuration

use bft_consensus::ConsensusConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Devnet configuration, optionally loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Number of validators in the devnet
    pub validators: usize,
    /// Voting power of each validator
    pub voting_power: i64,
    /// Generate a transaction every this many milliseconds (0 = never)
    pub tx_interval_ms: u64,
    pub consensus: ConsensusConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            validators: 4,
            voting_power: 10,
            tx_interval_ms: 250,
            consensus: ConsensusConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        if config.validators == 0 {
            anyhow::bail!("validators must be at least 1");
        }
        Ok(config)
    }
}
