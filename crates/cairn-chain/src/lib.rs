//! Chain storage engine for consensus-critical Bitcoin applications.
//!
//! cairn-chain persists everything a full node must remember about the
//! chain: the block-index graph, the UTXO set, raw block payloads and the
//! undo data needed to reverse a connection. Blocks and undo records live
//! in rotating append-only files addressed by `(file, offset)`. The
//! metadata binding them together (index entries, coins, tip pointer and
//! file descriptors) lives in a transactional key-value store, so every
//! mutation commits atomically.
//!
//! The entry point is [`ChainDb`]. Opening an empty data directory writes
//! the network's genesis block; from there the embedding node drives the
//! engine with [`ChainDb::save`] for new blocks, and
//! [`ChainDb::disconnect`]/[`ChainDb::reconnect`] during reorganizations.
//! Validation, script execution and the peer-to-peer layer are explicitly
//! out of scope: the engine stores what it is given.
//!
//! ```no_run
//! use bitcoin::Network;
//! use cairn_chain::{ChainDb, ChainDbConfig};
//!
//! let db = ChainDb::open(ChainDbConfig::new("/var/lib/cairn", Network::Bitcoin))?;
//! println!("tip is {} at height {}", db.tail().hash, db.height());
//! # Ok::<(), cairn_chain::ChainError>(())
//! ```

pub mod chaindb;
pub mod chainparams;
pub mod coins;
pub mod entry;
pub mod error;
pub mod index;
pub mod view;

pub use chaindb::ChainDb;
pub use chaindb::ChainDbConfig;
pub use chaindb::ChainFile;
pub use chaindb::FileKind;
pub use chaindb::MAX_FILE_SIZE;
pub use chainparams::ChainParams;
pub use coins::Coin;
pub use coins::UndoCoins;
pub use entry::BlockEntry;
pub use entry::NO_POSITION;
pub use error::ChainError;
pub use index::BlockIndex;
pub use index::EntryId;
pub use view::CoinReader;
pub use view::CoinView;
