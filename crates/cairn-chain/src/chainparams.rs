//! Per-network constants consumed by the chain database.
//!
//! These are fixed, read-only values selected when the database is opened.
//! The fields are public so that embedders (and tests) may tighten the
//! pruning window on throwaway networks.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::p2p::Magic;
use bitcoin::Block;
use bitcoin::Network;

/// Network descriptor: genesis block, wire magic and pruning thresholds.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// The network these parameters describe.
    pub network: Network,
    /// The network's genesis block. Written to storage on first open.
    pub genesis: Block,
    /// Message-start bytes, prepended to every on-disk record.
    pub magic: Magic,
    /// Number of most-recent blocks whose files must be retained when
    /// pruning is enabled.
    pub keep_blocks: u32,
    /// Height below which pruning never triggers.
    pub prune_after_height: u32,
}

impl From<Network> for ChainParams {
    fn from(network: Network) -> Self {
        let (keep_blocks, prune_after_height) = match network {
            Network::Bitcoin => (288, 100_000),
            Network::Testnet => (288, 1_000),
            Network::Signet => (288, 1_000),
            Network::Regtest => (288, 100),
            _ => (288, 1_000),
        };

        ChainParams {
            genesis: genesis_block(network),
            magic: Magic::from(network),
            network,
            keep_blocks,
            prune_after_height,
        }
    }
}
