//! The chain database: durable storage for the block index, the UTXO set,
//! raw block payloads and undo data.
//!
//! Every mutation (`save`, `reconnect`, `disconnect`) is one key-value
//! write transaction bracketing the file appends it references: either all
//! table updates land, or none do and the in-memory state is untouched.
//! File bytes written by an aborted transaction are unreferenced and get
//! overwritten by the next successful append. Queries are snapshot reads
//! and never block the writer.
//!
//! Exactly one actor may mutate the database at a time; the store runs
//! without its own locking and relies on this crate's ownership rules plus
//! the embedder keeping the data directory single-process.

use std::fs;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::consensus::deserialize;
use bitcoin::consensus::serialize;
use bitcoin::hashes::Hash;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Network;
use bitcoin::OutPoint;
use bitcoin::Transaction;
use heed::RwTxn;
use tracing::debug;
use tracing::info;

use crate::chainparams::ChainParams;
use crate::entry::BlockEntry;
use crate::entry::NO_POSITION;
use crate::error::ChainError;
use crate::index::BlockIndex;
use crate::view::CoinView;

mod blockfiles;
mod store;

pub use blockfiles::ChainFile;
pub use blockfiles::FileKind;
pub use blockfiles::MAX_FILE_SIZE;

use blockfiles::FileStore;
use blockfiles::RECORD_HEADER_SIZE;
use store::coin_key;
use store::file_key;
use store::Store;
use store::StoreCoins;
use store::BLOCK_FILE_KEY;
use store::DEFAULT_MAP_SIZE;
use store::TIP_KEY;
use store::UNDO_FILE_KEY;

/// Configuration for [`ChainDb::open`].
#[derive(Debug, Clone)]
pub struct ChainDbConfig {
    /// Root data directory. Block files land in `<prefix>/blocks/`, the
    /// key-value environment in `<prefix>/chain/`.
    pub prefix: PathBuf,
    /// Network parameters. Public fields, so embedders may override the
    /// pruning thresholds.
    pub params: ChainParams,
    /// Delete old sealed files once they fall out of the retention window.
    pub prune: bool,
    /// Key-value map cap in bytes. Defaults to 16 GiB on 64-bit hosts and
    /// 1 GiB on 32-bit hosts.
    pub map_size: Option<usize>,
    /// Rotation threshold for block and undo files.
    pub max_file_size: u32,
}

impl ChainDbConfig {
    pub fn new(prefix: impl Into<PathBuf>, network: Network) -> Self {
        ChainDbConfig {
            prefix: prefix.into(),
            params: ChainParams::from(network),
            prune: false,
            map_size: None,
            max_file_size: MAX_FILE_SIZE,
        }
    }
}

/// The chain storage engine.
///
/// Owns the key-value environment, both currently-open append files, and
/// the in-memory block index. Opening an empty directory writes the
/// network's genesis block, so a freshly opened database always has a
/// non-empty active chain.
pub struct ChainDb {
    params: ChainParams,
    prune: bool,
    store: Store,
    files: FileStore,
    index: BlockIndex,
}

impl ChainDb {
    /// Opens (or creates) the database under `config.prefix` and rebuilds
    /// the in-memory index from the `index` table.
    pub fn open(config: ChainDbConfig) -> Result<Self, ChainError> {
        let ChainDbConfig {
            prefix,
            params,
            prune,
            map_size,
            max_file_size,
        } = config;

        let blocks_dir = prefix.join("blocks");
        let chain_dir = prefix.join("chain");
        fs::create_dir_all(&blocks_dir)?;
        fs::create_dir_all(&chain_dir)?;

        let store = Store::open(&chain_dir, map_size.unwrap_or(DEFAULT_MAP_SIZE))?;

        let (block_state, undo_state, sealed) = {
            let rtxn = store.env.read_txn()?;

            let block_state = match store.meta.get(&rtxn, BLOCK_FILE_KEY)? {
                Some(raw) => {
                    let state: ChainFile = deserialize(raw)
                        .expect("chain database corrupted: bad block file descriptor");
                    assert_eq!(state.kind, FileKind::Block);
                    state
                }
                None => ChainFile::new(FileKind::Block),
            };

            let undo_state = match store.meta.get(&rtxn, UNDO_FILE_KEY)? {
                Some(raw) => {
                    let state: ChainFile = deserialize(raw)
                        .expect("chain database corrupted: bad undo file descriptor");
                    assert_eq!(state.kind, FileKind::Undo);
                    state
                }
                None => ChainFile::new(FileKind::Undo),
            };

            let mut sealed = Vec::new();
            for row in store.file.iter(&rtxn)? {
                let (_, raw) = row?;
                let state: ChainFile =
                    deserialize(raw).expect("chain database corrupted: bad file table entry");
                sealed.push(state);
            }

            (block_state, undo_state, sealed)
        };

        let files = FileStore::open(
            blocks_dir,
            params.magic,
            max_file_size,
            block_state,
            undo_state,
            sealed,
        )?;

        let mut db = ChainDb {
            params,
            prune,
            store,
            files,
            index: BlockIndex::new(),
        };
        db.load_index()?;

        info!(
            network = %db.params.network,
            prefix = %prefix.display(),
            height = db.height(),
            "opened chain database"
        );
        Ok(db)
    }

    /// Flushes everything and closes the database. Dropping the database
    /// also fsyncs the open files, but skips the final environment sync.
    pub fn close(self) -> Result<(), ChainError> {
        self.store.sync()
    }

    fn load_index(&mut self) -> Result<(), ChainError> {
        let tip = {
            let rtxn = self.store.env.read_txn()?;
            self.store.meta.get(&rtxn, TIP_KEY)?.map(|raw| {
                BlockHash::from_slice(raw).expect("chain database corrupted: bad tip hash")
            })
        };

        // First open: persist the genesis block through the normal path.
        let Some(tip) = tip else {
            info!(network = %self.params.network, "initializing chain storage with genesis block");
            let genesis = self.params.genesis.clone();
            let entry = BlockEntry::from_block(&genesis, None);
            return self.save(entry, &genesis, Some(&CoinView::new()));
        };

        {
            let rtxn = self.store.env.read_txn()?;
            for row in self.store.index.iter(&rtxn)? {
                let (key, raw) = row?;
                let entry: BlockEntry =
                    deserialize(raw).expect("chain database corrupted: bad index entry");
                let hash: &[u8] = entry.hash.as_byte_array();
                assert_eq!(key, hash, "chain database corrupted: index key mismatch");
                self.index.insert(entry);
            }
        }
        self.index.rebuild(&tip);
        Ok(())
    }

    // ---------- Mutations ----------

    /// Persists `entry` and its block. With a view, the block is connected:
    /// the staged coin mutations are applied, undo data is written, and the
    /// entry becomes the new active tip. Without a view the entry is merely
    /// indexed off-chain (fork headers, blocks stored ahead of validation).
    pub fn save(
        &mut self,
        mut entry: BlockEntry,
        block: &Block,
        view: Option<&CoinView>,
    ) -> Result<(), ChainError> {
        if entry.height > 0 && self.index.id_of(&entry.header.prev_blockhash).is_none() {
            return Err(ChainError::Precondition("parent entry is not indexed"));
        }
        if self.index.id_of(&entry.hash).is_some() {
            return Err(ChainError::Precondition("entry is already indexed"));
        }
        if view.is_some() && entry.height as usize != self.index.chain_len() {
            return Err(ChainError::Precondition(
                "connected entry must extend the active chain",
            ));
        }

        let sync = should_sync(&entry);
        let mut doomed = Vec::new();
        let mut wtxn = self.store.env.write_txn()?;

        // Write the block payload, unless it is already on disk.
        if entry.block_pos == NO_POSITION {
            let payload = serialize(block);
            let appended = self.files.append(
                FileKind::Block,
                &payload,
                i64::from(entry.header.time),
                entry.height as i32,
                sync,
            )?;
            entry.block_file = appended.file;
            entry.block_pos = appended.pos;
            if let Some(sealed) = appended.sealed {
                self.store
                    .file
                    .put(&mut wtxn, &file_key(sealed.kind, sealed.id), &serialize(&sealed))?;
            }
            self.store.meta.put(
                &mut wtxn,
                BLOCK_FILE_KEY,
                &serialize(self.files.head(FileKind::Block)),
            )?;
        }

        if let Some(view) = view {
            Self::connect_block(
                &self.store,
                &mut self.files,
                &self.params,
                self.prune,
                &mut wtxn,
                &mut entry,
                view,
                sync,
                &mut doomed,
            )?;
        }

        // Index the entry and move the tip marker off its parent.
        self.store
            .index
            .put(&mut wtxn, entry.hash.as_byte_array(), &serialize(&entry))?;
        if entry.height > 0 {
            self.store
                .tip
                .delete(&mut wtxn, entry.header.prev_blockhash.as_byte_array())?;
        }
        self.store
            .tip
            .put(&mut wtxn, entry.hash.as_byte_array(), &[1])?;

        if view.is_some() {
            self.store
                .meta
                .put(&mut wtxn, TIP_KEY, entry.hash.as_byte_array())?;
        }

        wtxn.commit()?;
        if sync {
            self.store.sync()?;
        }

        // The transaction is durable; only now touch memory and disk state
        // that a failed commit must not see.
        self.files.unlink(&doomed);
        let on_main = view.is_some();
        let id = self.index.insert(entry);
        if on_main {
            self.index.link_tip(id);
        }
        Ok(())
    }

    /// Connects a previously saved off-chain entry during a reorganization,
    /// promoting it to the new active tip. The entry's block must already
    /// be on disk; only the view and (possibly) fresh undo data are written.
    pub fn reconnect(
        &mut self,
        hash: &BlockHash,
        block: &Block,
        view: &CoinView,
    ) -> Result<(), ChainError> {
        debug_assert_eq!(block.block_hash(), *hash);
        let id = self
            .index
            .id_of(hash)
            .ok_or(ChainError::Precondition("entry is not indexed"))?;
        let mut entry = self.index.get(id).clone();
        if entry.block_pos == NO_POSITION {
            return Err(ChainError::Precondition("entry has no stored block"));
        }
        if entry.height as usize != self.index.chain_len() {
            return Err(ChainError::Precondition(
                "reconnected entry must extend the active chain",
            ));
        }

        let sync = should_sync(&entry);
        let mut doomed = Vec::new();
        let mut wtxn = self.store.env.write_txn()?;

        Self::connect_block(
            &self.store,
            &mut self.files,
            &self.params,
            self.prune,
            &mut wtxn,
            &mut entry,
            view,
            sync,
            &mut doomed,
        )?;

        // Re-write the entry, which may have gained an undo position.
        self.store
            .index
            .put(&mut wtxn, entry.hash.as_byte_array(), &serialize(&entry))?;
        self.store
            .meta
            .put(&mut wtxn, TIP_KEY, entry.hash.as_byte_array())?;

        wtxn.commit()?;
        self.store.sync()?;

        self.files.unlink(&doomed);
        debug!(hash = %entry.hash, height = entry.height, "reconnected entry");
        *self.index.get_mut(id) = entry;
        self.index.link_tip(id);
        Ok(())
    }

    /// Disconnects the active tip, restoring the coins its connection
    /// destroyed and deleting the ones it created. Returns the applied
    /// view; its undo stack holds the restored coins. The entry itself
    /// stays indexed off-chain.
    pub fn disconnect(&mut self, hash: &BlockHash, block: &Block) -> Result<CoinView, ChainError> {
        let id = self
            .index
            .id_of(hash)
            .ok_or(ChainError::Precondition("entry is not indexed"))?;
        let entry = self.index.get(id).clone();
        if self.index.tail().map(|tail| tail.hash) != Some(entry.hash) {
            return Err(ChainError::Precondition(
                "only the active tip can be disconnected",
            ));
        }
        if entry.height == 0 {
            return Err(ChainError::Precondition(
                "the genesis block cannot be disconnected",
            ));
        }

        let mut undo = self.read_undo(&entry)?;
        let mut view = CoinView::new();
        for tx in block.txdata.iter().rev() {
            if !tx.is_coinbase() {
                for input in tx.input.iter().rev() {
                    let coin = undo.pop().ok_or_else(|| {
                        ChainError::Corruption(format!("undo record for {} is short", entry.hash))
                    })?;
                    view.restore(input.previous_output, coin);
                }
            }
            // Created coins become deletions.
            view.stage_removal(tx, entry.height);
        }
        if !undo.is_empty() {
            return Err(ChainError::Corruption(format!(
                "undo record for {} has {} unconsumed coins",
                entry.hash,
                undo.len()
            )));
        }

        let mut wtxn = self.store.env.write_txn()?;
        Self::save_view(&self.store, &mut wtxn, &view)?;
        self.store.meta.put(
            &mut wtxn,
            TIP_KEY,
            entry.header.prev_blockhash.as_byte_array(),
        )?;
        wtxn.commit()?;
        self.store.sync()?;

        self.index.unlink_tip(id);
        debug!(hash = %entry.hash, height = entry.height, "disconnected chain tip");
        Ok(view)
    }

    /// Applies a block's coin mutations and writes its undo record, then
    /// prunes files that dropped out of the retention window. No-op for the
    /// genesis block, whose coinbase is unspendable.
    #[allow(clippy::too_many_arguments)]
    fn connect_block(
        store: &Store,
        files: &mut FileStore,
        params: &ChainParams,
        prune: bool,
        wtxn: &mut RwTxn,
        entry: &mut BlockEntry,
        view: &CoinView,
        sync: bool,
        doomed: &mut Vec<ChainFile>,
    ) -> Result<(), ChainError> {
        if entry.height == 0 {
            return Ok(());
        }

        Self::save_view(store, wtxn, view)?;

        let undo = view.undo();
        if !undo.is_empty() && entry.undo_pos == NO_POSITION {
            let payload = serialize(undo);
            let appended = files.append(
                FileKind::Undo,
                &payload,
                i64::from(entry.header.time),
                entry.height as i32,
                sync,
            )?;
            entry.undo_file = appended.file;
            entry.undo_pos = appended.pos;
            if let Some(sealed) = appended.sealed {
                store
                    .file
                    .put(wtxn, &file_key(sealed.kind, sealed.id), &serialize(&sealed))?;
            }
            store
                .meta
                .put(wtxn, UNDO_FILE_KEY, &serialize(files.head(FileKind::Undo)))?;
        }

        Self::prune_files(store, files, params, prune, wtxn, entry, doomed)
    }

    /// Applies staged view mutations to the coin table: spent coins are
    /// deleted, fresh coins inserted.
    fn save_view(store: &Store, wtxn: &mut RwTxn, view: &CoinView) -> Result<(), ChainError> {
        for (outpoint, coin) in view.iter() {
            let key = coin_key(outpoint);
            if coin.spent {
                store.coin.delete(wtxn, &key)?;
            } else {
                store.coin.put(wtxn, &key, &serialize(coin))?;
            }
        }
        Ok(())
    }

    /// Marks sealed files wholly below the retention window for deletion.
    /// The `file` table rows go away inside the transaction; the disk
    /// unlink happens after commit, from the `doomed` list.
    fn prune_files(
        store: &Store,
        files: &FileStore,
        params: &ChainParams,
        prune: bool,
        wtxn: &mut RwTxn,
        entry: &BlockEntry,
        doomed: &mut Vec<ChainFile>,
    ) -> Result<(), ChainError> {
        if !prune || entry.height < params.keep_blocks {
            return Ok(());
        }
        let target = entry.height - params.keep_blocks;
        if target <= params.prune_after_height {
            return Ok(());
        }

        for file in &files.sealed {
            if file.max_height >= target as i32 {
                continue;
            }
            store.file.delete(wtxn, &file_key(file.kind, file.id))?;
            doomed.push(file.clone());
        }
        if !doomed.is_empty() {
            debug!(below = target, count = doomed.len(), "pruning chain files");
        }
        Ok(())
    }

    fn read_undo(&self, entry: &BlockEntry) -> Result<crate::coins::UndoCoins, ChainError> {
        if entry.undo_pos == NO_POSITION {
            return Ok(crate::coins::UndoCoins::default());
        }
        let record = self
            .files
            .read(FileKind::Undo, entry.undo_file, entry.undo_pos)?
            .ok_or(ChainError::MissingUndo(entry.hash))?;
        Ok(deserialize(&record[RECORD_HEADER_SIZE..])?)
    }

    // ---------- Queries ----------

    /// The genesis entry.
    pub fn head(&self) -> &BlockEntry {
        self.index.head().expect("open initializes the genesis entry")
    }

    /// The active-chain tip entry.
    pub fn tail(&self) -> &BlockEntry {
        self.index.tail().expect("open initializes the genesis entry")
    }

    /// Height of the active tip.
    pub fn height(&self) -> u32 {
        self.tail().height
    }

    /// Looks an entry up by hash; the result may be off the active chain.
    pub fn by_hash(&self, hash: &BlockHash) -> Option<&BlockEntry> {
        self.index.by_hash(hash)
    }

    /// Looks the active-chain entry at `height` up.
    pub fn by_height(&self, height: u32) -> Option<&BlockEntry> {
        self.index.by_height(height)
    }

    /// Whether `entry` is on the active chain.
    pub fn is_main(&self, entry: &BlockEntry) -> bool {
        self.index.is_main(entry)
    }

    /// The in-memory block index, for graph walks.
    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    /// The network parameters this database was opened with.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Whether any output of `tx` is still an unspent coin.
    pub fn has_coins(&self, tx: &Transaction) -> Result<bool, ChainError> {
        let rtxn = self.store.env.read_txn()?;
        let txid = tx.compute_txid();
        for vout in 0..tx.output.len() {
            let key = coin_key(&OutPoint::new(txid, vout as u32));
            if self.store.coin.get(&rtxn, &key)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Spends all of `tx`'s inputs into `view`, reading missing prevouts
    /// from a coin-table snapshot.
    pub fn spend(&self, view: &mut CoinView, tx: &Transaction) -> Result<(), ChainError> {
        let reader = StoreCoins {
            store: &self.store,
            rtxn: self.store.env.read_txn()?,
        };
        view.spend(tx, &reader)
    }

    /// Hydrates `tx`'s inputs in `view` from a coin-table snapshot without
    /// spending them. Returns whether every prevout was found.
    pub fn fill(&self, view: &mut CoinView, tx: &Transaction) -> Result<bool, ChainError> {
        let reader = StoreCoins {
            store: &self.store,
            rtxn: self.store.env.read_txn()?,
        };
        view.fill(tx, &reader)
    }

    /// Reads and decodes the block stored for `entry`. Returns `None` if
    /// the block was never stored or its file was pruned.
    pub fn get_block(&self, entry: &BlockEntry) -> Result<Option<Block>, ChainError> {
        match self.get_raw_block(entry)? {
            Some(raw) => Ok(Some(deserialize(&raw)?)),
            None => Ok(None),
        }
    }

    /// Reads the exact serialized bytes of the block stored for `entry`.
    /// Returns `None` if the block was never stored or its file was pruned.
    pub fn get_raw_block(&self, entry: &BlockEntry) -> Result<Option<Vec<u8>>, ChainError> {
        if entry.block_pos == NO_POSITION {
            return Ok(None);
        }
        match self
            .files
            .read(FileKind::Block, entry.block_file, entry.block_pos)?
        {
            Some(mut record) => {
                record.drain(..RECORD_HEADER_SIZE);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Whether committing `entry` warrants an immediate flush: recent blocks
/// always, older ones at a periodic checkpoint so initial block download
/// syncs in bulk.
fn should_sync(entry: &BlockEntry) -> bool {
    i64::from(entry.header.time) >= unix_now() - 24 * 60 * 60 || entry.height % 20_000 == 0
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use bitcoin::absolute;
    use bitcoin::block::Header;
    use bitcoin::block::Version as BlockVersion;
    use bitcoin::transaction;
    use bitcoin::Amount;
    use bitcoin::CompactTarget;
    use bitcoin::ScriptBuf;
    use bitcoin::Sequence;
    use bitcoin::TxIn;
    use bitcoin::TxMerkleNode;
    use bitcoin::TxOut;
    use bitcoin::WPubkeyHash;
    use bitcoin::Witness;

    use super::*;

    const REGTEST_GENESIS: &str = "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";
    const COIN: u64 = 100_000_000;

    fn config(dir: &Path) -> ChainDbConfig {
        ChainDbConfig::new(dir, Network::Regtest)
    }

    /// A coinbase paying `value` to P2WPKH(00…00), with the height in the
    /// script-sig so every txid is unique. `pad` appends a data output to
    /// inflate the block size.
    fn coinbase(height: u32, value: u64, pad: usize) -> Transaction {
        let mut output = vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0; 20])),
        }];
        if pad > 0 {
            output.push(TxOut {
                value: Amount::from_sat(0),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a; pad]),
            });
        }
        Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(height.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output,
        }
    }

    fn block_on(prev: BlockHash, txdata: Vec<Transaction>, nonce: u32) -> Block {
        Block {
            header: Header {
                version: BlockVersion::ONE,
                prev_blockhash: prev,
                merkle_root: TxMerkleNode::all_zeros(),
                time: 1_296_688_602,
                bits: CompactTarget::from_consensus(0x207f_ffff),
                nonce,
            },
            txdata,
        }
    }

    /// Extends the active chain by `count` coinbase-only blocks.
    fn extend(db: &mut ChainDb, count: u32, pad: usize) -> Vec<Block> {
        let mut blocks = Vec::new();
        for _ in 0..count {
            let parent = db.tail().clone();
            let height = parent.height + 1;
            let cb = coinbase(height, 50 * COIN, pad);
            let block = block_on(parent.hash, vec![cb.clone()], height);
            let entry = BlockEntry::from_block(&block, Some(&parent));
            let mut view = CoinView::new();
            view.add(&cb, height, false);
            db.save(entry, &block, Some(&view)).unwrap();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn open_empty_writes_regtest_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(config(dir.path())).unwrap();

        assert_eq!(db.head().hash, db.tail().hash);
        assert_eq!(db.height(), 0);
        assert_eq!(db.by_height(0).unwrap().hash.to_string(), REGTEST_GENESIS);
        assert!(db.by_height(1).is_none());
        assert!(db.head().has_block());

        // The genesis coinbase is unspendable; nothing enters the coin set.
        let genesis = db.params().genesis.clone();
        assert!(!db.has_coins(&genesis.txdata[0]).unwrap());
    }

    #[test]
    fn connect_one_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();

        let block1 = extend(&mut db, 1, 0).remove(0);
        let cb = &block1.txdata[0];

        assert_eq!(db.height(), 1);
        assert!(db.has_coins(cb).unwrap());
        assert_eq!(db.by_height(1).unwrap().hash, block1.block_hash());
        assert!(db.by_height(2).is_none());
        assert_eq!(db.tail().header, block1.header);
        assert!(!db.tail().has_undo());
    }

    #[test]
    fn save_then_read_raw_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();

        // Stored off-chain: no view, no tip movement.
        let cb = coinbase(1, 50 * COIN, 0);
        let block = block_on(db.head().hash, vec![cb], 7);
        let entry = BlockEntry::from_block(&block, Some(db.head()));
        db.save(entry, &block, None).unwrap();

        assert_eq!(db.height(), 0, "tip must not move without a view");
        let stored = db.by_hash(&block.block_hash()).unwrap();
        assert_eq!(stored.height, 1);
        assert!(!db.is_main(stored));
        assert!(stored.has_block());

        assert_eq!(db.get_raw_block(stored).unwrap().unwrap(), serialize(&block));
        assert_eq!(db.get_block(stored).unwrap().unwrap(), block);
    }

    #[test]
    fn duplicate_and_orphan_saves_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();

        let block1 = extend(&mut db, 1, 0).remove(0);
        let dup = BlockEntry::from_block(&block1, Some(db.head()));
        assert!(matches!(
            db.save(dup, &block1, None),
            Err(ChainError::Precondition(_))
        ));

        // Parent hash that was never indexed.
        let orphan_block = block_on(BlockHash::all_zeros(), vec![coinbase(9, COIN, 0)], 9);
        let orphan = BlockEntry::from_block(&orphan_block, Some(db.tail()));
        assert!(matches!(
            db.save(orphan, &orphan_block, None),
            Err(ChainError::Precondition(_))
        ));
    }

    #[test]
    fn spend_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();

        let block1 = extend(&mut db, 1, 0).remove(0);
        let cb1 = block1.txdata[0].clone();

        // Block 2 spends the block-1 coinbase.
        let parent = db.tail().clone();
        let spend = Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(cb1.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(49 * COIN),
                script_pubkey: ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([1; 20])),
            }],
        };
        let cb2 = coinbase(2, 50 * COIN, 0);
        let block2 = block_on(parent.hash, vec![cb2.clone(), spend.clone()], 2);

        let mut view = CoinView::new();
        db.spend(&mut view, &spend).unwrap();
        view.add(&cb2, 2, false);
        view.add(&spend, 2, false);
        let entry = BlockEntry::from_block(&block2, Some(&parent));
        db.save(entry, &block2, Some(&view)).unwrap();

        assert_eq!(db.height(), 2);
        assert!(!db.has_coins(&cb1).unwrap());
        assert!(db.has_coins(&spend).unwrap());
        assert!(db.tail().has_undo());

        // Roll block 2 back.
        let hash2 = block2.block_hash();
        let undone = db.disconnect(&hash2, &block2).unwrap();

        assert_eq!(db.tail().hash, block1.block_hash());
        assert!(db.has_coins(&cb1).unwrap());
        assert!(!db.has_coins(&spend).unwrap());
        assert!(!db.has_coins(&cb2).unwrap());

        // The restored coinbase coin is observable on the returned view.
        let undo = undone.undo();
        assert_eq!(undo.len(), 1);
        assert_eq!(undo.coins()[0].output.value.to_sat(), 50 * COIN);
        assert!(undo.coins()[0].coinbase);
        assert_eq!(undo.coins()[0].height, 1);

        // The entry survives off-chain.
        let off = db.by_hash(&hash2).unwrap();
        assert!(!db.is_main(off));
        assert!(db.by_height(2).is_none());

        // Only the tip can be disconnected; genesis never.
        let genesis_hash = db.head().hash;
        let genesis = db.params().genesis.clone();
        assert!(matches!(
            db.disconnect(&genesis_hash, &genesis),
            Err(ChainError::Precondition(_))
        ));
    }

    #[test]
    fn fork_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();

        let block1 = extend(&mut db, 1, 0).remove(0);
        let hash1 = block1.block_hash();
        let cb1 = block1.txdata[0].clone();

        // A competing block at height 1, stored without a view.
        let cb1b = coinbase(1, 49 * COIN, 0);
        let block1b = block_on(db.head().hash, vec![cb1b.clone()], 99);
        let hash1b = block1b.block_hash();
        let entry1b = BlockEntry::from_block(&block1b, Some(db.head()));
        db.save(entry1b, &block1b, None).unwrap();

        assert!(db.by_hash(&hash1b).is_some());
        assert!(!db.is_main(db.by_hash(&hash1b).unwrap()));
        assert_eq!(db.tail().hash, hash1);

        // Reorganize onto the competing branch.
        db.disconnect(&hash1, &block1).unwrap();
        assert_eq!(db.height(), 0);

        let mut view = CoinView::new();
        view.add(&cb1b, 1, false);
        db.reconnect(&hash1b, &block1b, &view).unwrap();

        assert_eq!(db.tail().hash, hash1b);
        assert_eq!(db.by_height(1).unwrap().hash, hash1b);
        assert!(!db.is_main(db.by_hash(&hash1).unwrap()));
        assert!(db.has_coins(&cb1b).unwrap());
        assert!(!db.has_coins(&cb1).unwrap());

        // The old branch can come back the same way.
        db.disconnect(&hash1b, &block1b).unwrap();
        let mut view = CoinView::new();
        view.add(&cb1, 1, false);
        db.reconnect(&hash1, &block1, &view).unwrap();
        assert_eq!(db.tail().hash, hash1);
        assert!(db.has_coins(&cb1).unwrap());
    }

    #[test]
    fn file_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_file_size = 1 << 20;
        let mut db = ChainDb::open(cfg).unwrap();

        // ~100 KiB per block; twenty of them span two files.
        extend(&mut db, 20, 100_000);

        assert_eq!(db.files.head(FileKind::Block).id, 1);
        assert_eq!(db.files.sealed.len(), 1);
        assert_eq!(db.files.sealed[0].kind, FileKind::Block);
        assert!(dir.path().join("blocks/blk00000.dat").exists());
        assert!(dir.path().join("blocks/blk00001.dat").exists());

        // Records in the sealed file stay readable.
        let entry3 = db.by_height(3).unwrap().clone();
        assert_eq!(entry3.block_file, 0);
        let block3 = db.get_block(&entry3).unwrap().unwrap();
        assert_eq!(block3.block_hash(), entry3.hash);

        // Sealed metadata and head pointer survive a reopen.
        let items = db.files.sealed[0].items;
        drop(db);
        let mut cfg = config(dir.path());
        cfg.max_file_size = 1 << 20;
        let db = ChainDb::open(cfg).unwrap();
        assert_eq!(db.files.head(FileKind::Block).id, 1);
        assert_eq!(db.files.sealed.len(), 1);
        assert_eq!(db.files.sealed[0].items, items);
    }

    #[test]
    fn pruning_deletes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.prune = true;
        cfg.max_file_size = 2048;
        cfg.params.keep_blocks = 5;
        cfg.params.prune_after_height = 0;
        let mut db = ChainDb::open(cfg).unwrap();

        extend(&mut db, 20, 300);
        let target = db.height() - 5;

        // Every surviving sealed file is within the retention window.
        for file in &db.files.sealed {
            assert!(file.max_height >= target as i32, "stale file survived pruning");
        }
        assert!(!dir.path().join("blocks/blk00000.dat").exists());

        // Old payloads are gone, recent ones remain.
        let entry3 = db.by_height(3).unwrap().clone();
        assert!(db.get_raw_block(&entry3).unwrap().is_none());
        let entry18 = db.by_height(18).unwrap().clone();
        assert_eq!(
            db.get_block(&entry18).unwrap().unwrap().block_hash(),
            entry18.hash
        );
    }

    #[test]
    fn reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();

        let (blocks, saved_tail, fork_hash) = {
            let mut db = ChainDb::open(config(dir.path())).unwrap();
            let blocks = extend(&mut db, 3, 0);

            // Leave one off-chain entry behind as well.
            let forked = coinbase(1, 49 * COIN, 0);
            let fork = block_on(db.head().hash, vec![forked], 1234);
            let entry = BlockEntry::from_block(&fork, Some(db.head()));
            db.save(entry, &fork, None).unwrap();

            (blocks, db.tail().clone(), fork.block_hash())
        };

        let db = ChainDb::open(config(dir.path())).unwrap();
        assert_eq!(db.height(), 3);
        assert_eq!(db.tail(), &saved_tail);

        for (at, block) in blocks.iter().enumerate() {
            let height = at as u32 + 1;
            let entry = db.by_height(height).unwrap();
            assert_eq!(entry.hash, block.block_hash());
            assert!(db.is_main(entry));
        }

        // Forward links were rebuilt from the tip walk.
        let mut walk = db.head();
        for height in 1..=3 {
            let next = walk.next().expect("main-chain entry must have a next link");
            walk = db.index().get(next);
            assert_eq!(walk.height, height);
        }
        assert!(walk.next().is_none());

        // The fork entry is back too, off-chain.
        let fork = db.by_hash(&fork_hash).unwrap();
        assert!(!db.is_main(fork));
        assert_eq!(fork.height, 1);
    }

    #[test]
    fn fill_and_spend_against_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = ChainDb::open(config(dir.path())).unwrap();
        let block1 = extend(&mut db, 1, 0).remove(0);
        let cb1 = block1.txdata[0].clone();

        let spend = Transaction {
            version: transaction::Version::ONE,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(cb1.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(COIN),
                script_pubkey: ScriptBuf::new(),
            }],
        };

        let mut view = CoinView::new();
        assert!(db.fill(&mut view, &spend).unwrap());
        assert!(view.undo().is_empty());

        let mut view = CoinView::new();
        db.spend(&mut view, &spend).unwrap();
        assert_eq!(view.undo().len(), 1);

        // A prevout that never existed.
        let mut bogus = spend.clone();
        bogus.input[0].previous_output.vout = 7;
        let mut view = CoinView::new();
        assert!(!db.fill(&mut view, &bogus).unwrap());
        assert!(matches!(
            db.spend(&mut view, &bogus),
            Err(ChainError::MissingCoin(_))
        ));
    }
}
