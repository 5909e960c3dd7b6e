//! In-memory block-index graph.
//!
//! The index is a DAG rooted at genesis: every entry points back at its
//! parent, and entries on the active chain additionally carry a forward
//! `next` link plus a slot in the height-indexed vector. Entries live in an
//! append-only arena so that [`EntryId`] handles stay valid for the life of
//! the database; nothing is ever removed, a disconnected entry merely loses
//! its main-chain links.

use std::collections::HashMap;

use bitcoin::BlockHash;

use crate::entry::BlockEntry;

/// Stable handle to an entry in the [`BlockIndex`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

impl EntryId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Hash-addressed block entries plus the height-indexed active chain.
#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockEntry>,
    by_hash: HashMap<BlockHash, EntryId>,
    heights: Vec<EntryId>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex::default()
    }

    /// Number of entries in the arena, on or off the active chain.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Length of the active chain, i.e. tip height + 1 once genesis exists.
    pub fn chain_len(&self) -> usize {
        self.heights.len()
    }

    /// Resolves an entry handle by block hash.
    pub fn id_of(&self, hash: &BlockHash) -> Option<EntryId> {
        self.by_hash.get(hash).copied()
    }

    /// Borrows the entry behind a handle.
    pub fn get(&self, id: EntryId) -> &BlockEntry {
        &self.entries[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: EntryId) -> &mut BlockEntry {
        &mut self.entries[id.index()]
    }

    /// Looks an entry up by hash. The result may be off the active chain.
    pub fn by_hash(&self, hash: &BlockHash) -> Option<&BlockEntry> {
        self.id_of(hash).map(|id| self.get(id))
    }

    /// Looks the active-chain entry at `height` up, if any.
    pub fn by_height(&self, height: u32) -> Option<&BlockEntry> {
        self.heights
            .get(height as usize)
            .map(|id| self.get(*id))
    }

    /// Whether `entry` is on the active chain.
    pub fn is_main(&self, entry: &BlockEntry) -> bool {
        match self.heights.get(entry.height as usize) {
            Some(id) => self.get(*id).hash == entry.hash,
            None => false,
        }
    }

    /// The genesis entry.
    pub fn head(&self) -> Option<&BlockEntry> {
        self.head.map(|id| self.get(id))
    }

    /// The active-chain tip entry.
    pub fn tail(&self) -> Option<&BlockEntry> {
        self.tail.map(|id| self.get(id))
    }

    /// Places `entry` into the arena and resolves its parent handle. The
    /// entry is not linked into the active chain; see [`Self::link_tip`].
    pub(crate) fn insert(&mut self, mut entry: BlockEntry) -> EntryId {
        entry.prev = self.by_hash.get(&entry.header.prev_blockhash).copied();
        let id = EntryId(self.entries.len() as u32);
        self.by_hash.insert(entry.hash, id);
        self.entries.push(entry);
        id
    }

    /// Extends the active chain with `id`: sets the parent's `next` link,
    /// appends to the heights vector and advances the tip.
    pub(crate) fn link_tip(&mut self, id: EntryId) {
        let (height, prev) = {
            let entry = self.get(id);
            (entry.height, entry.prev)
        };
        debug_assert_eq!(self.heights.len(), height as usize);

        if let Some(prev) = prev {
            self.get_mut(prev).next = Some(id);
        }
        self.heights.push(id);
        if height == 0 {
            self.head = Some(id);
        }
        self.tail = Some(id);
    }

    /// Removes the tip `id` from the active chain, reverting the tip to its
    /// parent. The entry itself stays in the arena.
    pub(crate) fn unlink_tip(&mut self, id: EntryId) {
        debug_assert_eq!(self.heights.last().copied(), Some(id));
        self.heights.pop();

        let prev = self.get(id).prev;
        if let Some(prev) = prev {
            self.get_mut(prev).next = None;
            self.tail = Some(prev);
        }
    }

    /// Rebuilds graph links after all persisted entries were inserted:
    /// resolves `prev` handles, then walks `tip` back to genesis filling the
    /// heights vector and the `next` links.
    ///
    /// Inconsistent persisted state aborts the process; a broken index
    /// cannot be repaired in place and must be rebuilt by reindexing.
    pub(crate) fn rebuild(&mut self, tip: &BlockHash) {
        for at in 0..self.entries.len() {
            let entry = &self.entries[at];
            if entry.height == 0 {
                self.head = Some(EntryId(at as u32));
                continue;
            }
            let prev = self
                .by_hash
                .get(&entry.header.prev_blockhash)
                .copied()
                .expect("corrupted block index: missing parent entry");
            self.entries[at].prev = Some(prev);
        }
        assert!(self.head.is_some(), "corrupted block index: no genesis entry");

        let tip_id = self
            .id_of(tip)
            .expect("corrupted block index: tip entry not found");
        let tip_height = self.get(tip_id).height;

        self.heights = vec![tip_id; tip_height as usize + 1];
        let mut walk = Some(tip_id);
        let mut height = tip_height;
        while let Some(id) = walk {
            let (entry_height, prev) = {
                let entry = self.get(id);
                (entry.height, entry.prev)
            };
            assert_eq!(entry_height, height, "corrupted block index: broken chain");
            self.heights[height as usize] = id;

            if let Some(prev) = prev {
                self.get_mut(prev).next = Some(id);
                height -= 1;
            }
            walk = prev;
        }

        self.tail = Some(tip_id);
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::hashes::Hash;
    use bitcoin::Block;
    use bitcoin::Network;
    use bitcoin::TxMerkleNode;

    use super::*;

    fn chain_of(len: u32) -> Vec<Block> {
        let genesis = genesis_block(Network::Regtest);
        let mut blocks = vec![genesis.clone()];
        for nonce in 0..len {
            let mut block = genesis.clone();
            block.header.prev_blockhash = blocks.last().unwrap().block_hash();
            block.header.merkle_root = TxMerkleNode::all_zeros();
            block.header.nonce = nonce;
            blocks.push(block);
        }
        blocks
    }

    fn linked_index(blocks: &[Block]) -> BlockIndex {
        let mut index = BlockIndex::new();
        let mut prev: Option<BlockEntry> = None;
        for block in blocks {
            let entry = BlockEntry::from_block(block, prev.as_ref());
            prev = Some(entry.clone());
            let id = index.insert(entry);
            index.link_tip(id);
        }
        index
    }

    #[test]
    fn link_and_query() {
        let blocks = chain_of(3);
        let index = linked_index(&blocks);

        assert_eq!(index.len(), 4);
        assert_eq!(index.chain_len(), 4);
        assert_eq!(index.head().unwrap().height, 0);
        assert_eq!(index.tail().unwrap().height, 3);

        for (height, block) in blocks.iter().enumerate() {
            let entry = index.by_height(height as u32).unwrap();
            assert_eq!(entry.hash, block.block_hash());
            assert!(index.is_main(entry));
        }
        assert!(index.by_height(4).is_none());
    }

    #[test]
    fn unlink_reverts_tip() {
        let blocks = chain_of(2);
        let mut index = linked_index(&blocks);

        let tip = index.id_of(&blocks[2].block_hash()).unwrap();
        index.unlink_tip(tip);

        assert_eq!(index.tail().unwrap().height, 1);
        assert!(index.by_height(2).is_none());
        // Entry survives off-chain.
        let off = index.by_hash(&blocks[2].block_hash()).unwrap();
        assert!(!index.is_main(off));
        assert!(index.tail().unwrap().next().is_none());
    }

    #[test]
    fn rebuild_walks_tip_to_genesis() {
        let blocks = chain_of(3);

        // Insert in scrambled order, as an on-disk table scan would.
        let mut index = BlockIndex::new();
        let mut entries: Vec<BlockEntry> = Vec::new();
        let mut prev: Option<BlockEntry> = None;
        for block in &blocks {
            let entry = BlockEntry::from_block(block, prev.as_ref());
            prev = Some(entry.clone());
            entries.push(entry);
        }
        for at in [2usize, 0, 3, 1] {
            index.insert(entries[at].clone());
        }

        index.rebuild(&blocks[3].block_hash());

        assert_eq!(index.tail().unwrap().hash, blocks[3].block_hash());
        assert_eq!(index.head().unwrap().hash, blocks[0].block_hash());
        for height in 0..3 {
            let entry = index.by_height(height).unwrap();
            let next = entry.next().map(|id| index.get(id).hash);
            assert_eq!(next, Some(blocks[height as usize + 1].block_hash()));
        }
    }
}
