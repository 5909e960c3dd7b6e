//! Block index entries.

use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::io::Read;
use bitcoin::io::Write;
use bitcoin::pow::Work;
use bitcoin::Block;
use bitcoin::BlockHash;

use crate::index::EntryId;

/// Sentinel file id/offset meaning "not stored in any file".
pub const NO_POSITION: i32 = -1;

/// One block known to the database, on or off the active chain.
///
/// The persisted record is the 80-byte header followed by height, chainwork
/// and the four file-position fields; the hash is recomputed from the header
/// on load. `prev`/`next` are in-memory handles into the [`BlockIndex`]
/// arena and are never serialized; `next` is only set while the entry is on
/// the active chain.
///
/// [`BlockIndex`]: crate::index::BlockIndex
#[derive(Debug, Clone)]
pub struct BlockEntry {
    /// Hash of `header`.
    pub hash: BlockHash,
    /// The full block header.
    pub header: Header,
    /// Height of this entry; 0 for genesis.
    pub height: u32,
    /// Total work of the chain ending in this entry.
    pub chainwork: Work,
    /// Block file id, or [`NO_POSITION`].
    pub block_file: i32,
    /// Byte offset of the block record, or [`NO_POSITION`].
    pub block_pos: i32,
    /// Undo file id, or [`NO_POSITION`].
    pub undo_file: i32,
    /// Byte offset of the undo record, or [`NO_POSITION`].
    pub undo_pos: i32,
    pub(crate) prev: Option<EntryId>,
    pub(crate) next: Option<EntryId>,
}

impl BlockEntry {
    /// Builds the entry for `block` as a child of `prev`, or the genesis
    /// entry when `prev` is `None`. File positions start unset.
    pub fn from_block(block: &Block, prev: Option<&BlockEntry>) -> Self {
        let header = block.header;
        let (height, chainwork) = match prev {
            Some(prev) => (prev.height + 1, prev.chainwork + header.work()),
            None => (0, header.work()),
        };

        BlockEntry {
            hash: header.block_hash(),
            header,
            height,
            chainwork,
            block_file: NO_POSITION,
            block_pos: NO_POSITION,
            undo_file: NO_POSITION,
            undo_pos: NO_POSITION,
            prev: None,
            next: None,
        }
    }

    /// Handle of the parent entry, if resolved.
    pub fn prev(&self) -> Option<EntryId> {
        self.prev
    }

    /// Handle of the child entry on the active chain.
    pub fn next(&self) -> Option<EntryId> {
        self.next
    }

    /// Whether the raw block payload is stored on disk.
    pub fn has_block(&self) -> bool {
        self.block_pos != NO_POSITION
    }

    /// Whether an undo record is stored on disk.
    pub fn has_undo(&self) -> bool {
        self.undo_pos != NO_POSITION
    }
}

// Equality covers the persisted fields; prev/next handles are rebuilt
// state, not identity.
impl PartialEq for BlockEntry {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
            && self.header == other.header
            && self.height == other.height
            && self.chainwork == other.chainwork
            && self.block_file == other.block_file
            && self.block_pos == other.block_pos
            && self.undo_file == other.undo_file
            && self.undo_pos == other.undo_pos
    }
}

impl Eq for BlockEntry {}

impl Encodable for BlockEntry {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.header.consensus_encode(w)?;
        len += self.height.consensus_encode(w)?;
        len += self.chainwork.to_le_bytes().consensus_encode(w)?;
        len += self.block_file.consensus_encode(w)?;
        len += self.block_pos.consensus_encode(w)?;
        len += self.undo_file.consensus_encode(w)?;
        len += self.undo_pos.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for BlockEntry {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let header = Header::consensus_decode(r)?;
        let height = u32::consensus_decode(r)?;
        let chainwork = Work::from_le_bytes(<[u8; 32]>::consensus_decode(r)?);
        Ok(BlockEntry {
            hash: header.block_hash(),
            header,
            height,
            chainwork,
            block_file: i32::consensus_decode(r)?,
            block_pos: i32::consensus_decode(r)?,
            undo_file: i32::consensus_decode(r)?,
            undo_pos: i32::consensus_decode(r)?,
            prev: None,
            next: None,
        })
    }
}
