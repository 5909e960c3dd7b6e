//! LMDB environment and table bindings.
//!
//! Five logical tables back the engine: `meta` (single-byte keys for the
//! tip pointer and the two file heads), `coin` (36-byte outpoint keys),
//! `index` (32-byte block hashes), `tip` (32-byte block hashes with a
//! one-byte presence marker) and `file` (5-byte type‖id keys). All values
//! are opaque byte strings; serialization happens at the call sites.

use std::path::Path;

use bitcoin::consensus::deserialize;
use bitcoin::OutPoint;
use heed::types::Bytes;
use heed::Database;
use heed::Env;
use heed::EnvFlags;
use heed::EnvOpenOptions;
use heed::RoTxn;
use heed::WithTls;

use super::blockfiles::FileKind;
use crate::coins::Coin;
use crate::error::ChainError;
use crate::view::CoinReader;

/// Meta key of the active-chain tip hash.
pub(crate) const TIP_KEY: &[u8] = b"R";
/// Meta key of the currently-written block file descriptor.
pub(crate) const BLOCK_FILE_KEY: &[u8] = b"B";
/// Meta key of the currently-written undo file descriptor.
pub(crate) const UNDO_FILE_KEY: &[u8] = b"U";

#[cfg(target_pointer_width = "64")]
pub(crate) const DEFAULT_MAP_SIZE: usize = 16 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub(crate) const DEFAULT_MAP_SIZE: usize = 1 << 30;

/// The transactional store. Write transactions are serialized by LMDB;
/// readers get MVCC snapshots. Locking is off; the engine's single-writer
/// discipline is enforced by ownership, not by the store.
#[derive(Debug)]
pub(crate) struct Store {
    pub(crate) env: Env,
    pub(crate) meta: Database<Bytes, Bytes>,
    pub(crate) coin: Database<Bytes, Bytes>,
    pub(crate) index: Database<Bytes, Bytes>,
    pub(crate) tip: Database<Bytes, Bytes>,
    pub(crate) file: Database<Bytes, Bytes>,
}

impl Store {
    pub(crate) fn open(dir: &Path, map_size: usize) -> Result<Self, ChainError> {
        let mut options = EnvOpenOptions::new();
        options.map_size(map_size).max_dbs(8);

        // Write-through map with explicit syncs only. NO_LOCK is safe
        // because exactly one process owns the environment and mutations go
        // through a single writer.
        let env = unsafe {
            options.flags(
                EnvFlags::WRITE_MAP
                    | EnvFlags::NO_META_SYNC
                    | EnvFlags::NO_SYNC
                    | EnvFlags::MAP_ASYNC
                    | EnvFlags::NO_TLS
                    | EnvFlags::NO_LOCK,
            );
            options.open(dir)?
        };

        // Create the tables up front so later opens cannot fail.
        let mut wtxn = env.write_txn()?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        let coin = env.create_database(&mut wtxn, Some("coin"))?;
        let index = env.create_database(&mut wtxn, Some("index"))?;
        let tip = env.create_database(&mut wtxn, Some("tip"))?;
        let file = env.create_database(&mut wtxn, Some("file"))?;
        wtxn.commit()?;

        Ok(Store {
            env,
            meta,
            coin,
            index,
            tip,
            file,
        })
    }

    /// Flushes the environment to disk. The `NO_SYNC` flags make this the
    /// only point where durability is established.
    pub(crate) fn sync(&self) -> Result<(), ChainError> {
        self.env.force_sync()?;
        Ok(())
    }
}

/// 36-byte coin-table key: tx hash followed by the output index.
pub(crate) fn coin_key(outpoint: &OutPoint) -> [u8; 36] {
    let mut key = [0u8; 36];
    key[..32].copy_from_slice(outpoint.txid.as_ref());
    key[32..].copy_from_slice(&outpoint.vout.to_le_bytes());
    key
}

/// 5-byte file-table key: file type followed by the file id.
pub(crate) fn file_key(kind: FileKind, id: i32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = kind as u8;
    key[1..].copy_from_slice(&(id as u32).to_le_bytes());
    key
}

/// Snapshot reader over the coin table, handed to [`CoinView`] operations.
/// The read transaction lives exactly as long as the view borrow.
///
/// [`CoinView`]: crate::view::CoinView
pub(crate) struct StoreCoins<'a> {
    pub(crate) store: &'a Store,
    pub(crate) rtxn: RoTxn<'a, WithTls>,
}

impl CoinReader for StoreCoins<'_> {
    fn coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, ChainError> {
        match self.store.coin.get(&self.rtxn, &coin_key(outpoint))? {
            Some(raw) => Ok(Some(deserialize(raw)?)),
            None => Ok(None),
        }
    }
}
