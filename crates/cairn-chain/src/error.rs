//! Error types surfaced by the chain database.

use core::fmt;
use std::io;

use bitcoin::consensus::encode;
use bitcoin::BlockHash;
use bitcoin::OutPoint;

/// Errors returned by the chain database and its components.
///
/// Expected-optional conditions (a coin that was never created, a block file
/// pruned away, an empty database on first open) are not errors: the
/// affected operations return `Ok(None)` or `Ok(false)` instead.
#[derive(Debug)]
pub enum ChainError {
    /// A file-system call failed.
    Io(io::Error),
    /// The underlying key-value store failed.
    Database(heed::Error),
    /// The key-value map hit its size cap. Reopen with a larger
    /// `map_size` to recover.
    Exhausted,
    /// A stored record failed to deserialize or violates a length or
    /// type invariant.
    Corruption(String),
    /// The caller broke a documented contract.
    Precondition(&'static str),
    /// A transaction input refers to a coin that does not exist or was
    /// already spent.
    MissingCoin(OutPoint),
    /// The undo record needed to disconnect a block is not on disk. The
    /// chain cannot be rolled back past this entry.
    MissingUndo(BlockHash),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Io(e) => write!(f, "i/o error: {e}"),
            ChainError::Database(e) => write!(f, "database error: {e}"),
            ChainError::Exhausted => write!(f, "database map is full"),
            ChainError::Corruption(what) => write!(f, "corrupted chain data: {what}"),
            ChainError::Precondition(what) => write!(f, "precondition violated: {what}"),
            ChainError::MissingCoin(outpoint) => write!(f, "no unspent coin for {outpoint}"),
            ChainError::MissingUndo(hash) => write!(f, "missing undo data for block {hash}"),
        }
    }
}

impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainError::Io(e) => Some(e),
            ChainError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChainError {
    fn from(e: io::Error) -> Self {
        ChainError::Io(e)
    }
}

impl From<heed::Error> for ChainError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(heed::MdbError::MapFull) => ChainError::Exhausted,
            e => ChainError::Database(e),
        }
    }
}

impl From<encode::Error> for ChainError {
    fn from(e: encode::Error) -> Self {
        ChainError::Corruption(e.to_string())
    }
}
