//! Rotating append-only block and undo files.
//!
//! Raw block payloads live under `<prefix>/blocks/` in `blkNNNNN.dat`
//! files, undo records in `revNNNNN.dat`, both capped at
//! [`MAX_FILE_SIZE`] (tests shrink the cap through the config). Records
//! are addressed by `(file id, byte offset)` and framed with the network
//! magic, a 12-byte tag, the payload length and a truncated hash256
//! checksum. Appends are positioned writes at the externally tracked file
//! position, so bytes left behind by a torn write are overwritten by the
//! next successful append.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::path::PathBuf;

use bitcoin::consensus::encode;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::io::Read;
use bitcoin::io::Write;
use bitcoin::p2p::Magic;
use tracing::debug;

use crate::error::ChainError;

/// Default maximum size of a single block or undo file.
pub const MAX_FILE_SIZE: u32 = 128 << 20;

/// Framing overhead prepended to every record: 4-byte magic, 12-byte tag,
/// 4-byte length, 4-byte checksum.
pub(crate) const RECORD_HEADER_SIZE: usize = 24;

/// Which of the two record streams a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Block = 0,
    Undo = 1,
}

impl FileKind {
    fn prefix(self) -> &'static str {
        match self {
            FileKind::Block => "blk",
            FileKind::Undo => "rev",
        }
    }

    /// The 12-byte record tag, as three little-endian words.
    fn tag(self) -> [u32; 3] {
        match self {
            FileKind::Block => [0x636f_6c62, 0x0000_006b, 0],
            FileKind::Undo => [0, 0, 0],
        }
    }
}

fn file_name(kind: FileKind, id: i32) -> String {
    format!("{}{:05}.dat", kind.prefix(), id)
}

/// Metadata of one block or undo file, persisted in the `file` table (and
/// under the `B`/`U` meta keys for the currently-written files).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFile {
    pub kind: FileKind,
    pub id: i32,
    /// Next write offset.
    pub pos: i32,
    /// Number of records held.
    pub items: i32,
    /// Lowest/highest header timestamp seen, -1 while empty.
    pub min_time: i64,
    pub max_time: i64,
    /// Lowest/highest block height seen, -1 while empty.
    pub min_height: i32,
    pub max_height: i32,
}

impl ChainFile {
    pub(crate) fn new(kind: FileKind) -> Self {
        ChainFile {
            kind,
            id: 0,
            pos: 0,
            items: 0,
            min_time: -1,
            max_time: -1,
            min_height: -1,
            max_height: -1,
        }
    }

    fn update(&mut self, time: i64, height: i32) {
        self.items += 1;
        if self.min_time == -1 || time < self.min_time {
            self.min_time = time;
        }
        if self.max_time == -1 || time > self.max_time {
            self.max_time = time;
        }
        if self.min_height == -1 || height < self.min_height {
            self.min_height = height;
        }
        if self.max_height == -1 || height > self.max_height {
            self.max_height = height;
        }
    }
}

impl Encodable for ChainFile {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, bitcoin::io::Error> {
        let mut len = (self.kind as u8).consensus_encode(w)?;
        len += self.id.consensus_encode(w)?;
        len += self.pos.consensus_encode(w)?;
        len += self.items.consensus_encode(w)?;
        len += self.min_time.consensus_encode(w)?;
        len += self.max_time.consensus_encode(w)?;
        len += self.min_height.consensus_encode(w)?;
        len += self.max_height.consensus_encode(w)?;
        Ok(len)
    }
}

impl Decodable for ChainFile {
    fn consensus_decode<R: Read + ?Sized>(r: &mut R) -> Result<Self, encode::Error> {
        let kind = match u8::consensus_decode(r)? {
            0 => FileKind::Block,
            1 => FileKind::Undo,
            _ => return Err(encode::Error::ParseFailed("invalid chain file type")),
        };
        Ok(ChainFile {
            kind,
            id: i32::consensus_decode(r)?,
            pos: i32::consensus_decode(r)?,
            items: i32::consensus_decode(r)?,
            min_time: i64::consensus_decode(r)?,
            max_time: i64::consensus_decode(r)?,
            min_height: i32::consensus_decode(r)?,
            max_height: i32::consensus_decode(r)?,
        })
    }
}

/// A currently-open file plus its tracked metadata.
#[derive(Debug)]
pub(crate) struct OpenFile {
    file: File,
    pub(crate) state: ChainFile,
}

impl OpenFile {
    fn open(dir: &Path, state: ChainFile) -> Result<Self, ChainError> {
        let path = dir.join(file_name(state.kind, state.id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(OpenFile { file, state })
    }
}

/// Result of one append.
pub(crate) struct Append {
    /// File id the record landed in.
    pub file: i32,
    /// Byte offset of the record.
    pub pos: i32,
    /// Metadata of the file sealed by rotation, if this append rotated.
    /// The caller must record it in the `file` table within the same
    /// transaction.
    pub sealed: Option<ChainFile>,
}

/// The two open head files, the sealed-file list and the framing scratch
/// buffer. Owned exclusively by the chain database; the single-writer
/// discipline is the caller's.
#[derive(Debug)]
pub(crate) struct FileStore {
    dir: PathBuf,
    magic: Magic,
    max_file_size: u32,
    pub(crate) block: OpenFile,
    pub(crate) undo: OpenFile,
    pub(crate) sealed: Vec<ChainFile>,
    slab: Vec<u8>,
}

impl FileStore {
    pub(crate) fn open(
        dir: PathBuf,
        magic: Magic,
        max_file_size: u32,
        block_state: ChainFile,
        undo_state: ChainFile,
        sealed: Vec<ChainFile>,
    ) -> Result<Self, ChainError> {
        let block = OpenFile::open(&dir, block_state)?;
        let undo = OpenFile::open(&dir, undo_state)?;
        Ok(FileStore {
            dir,
            magic,
            max_file_size,
            block,
            undo,
            sealed,
            slab: Vec::new(),
        })
    }

    /// Metadata of the currently-written file for `kind`.
    pub(crate) fn head(&self, kind: FileKind) -> &ChainFile {
        match kind {
            FileKind::Block => &self.block.state,
            FileKind::Undo => &self.undo.state,
        }
    }

    /// Frames `payload` and appends it to the head file for `kind`,
    /// rotating to a fresh file first if the record would overflow the size
    /// cap. `time` and `height` describe the entry being written and feed
    /// the file metadata.
    pub(crate) fn append(
        &mut self,
        kind: FileKind,
        payload: &[u8],
        time: i64,
        height: i32,
        sync: bool,
    ) -> Result<Append, ChainError> {
        self.slab.clear();
        self.slab.extend_from_slice(&self.magic.to_bytes());
        for word in kind.tag() {
            self.slab.extend_from_slice(&word.to_le_bytes());
        }
        self.slab
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let checksum = sha256d::Hash::hash(payload);
        self.slab.extend_from_slice(&checksum.as_byte_array()[..4]);
        self.slab.extend_from_slice(payload);

        let head = match kind {
            FileKind::Block => &mut self.block,
            FileKind::Undo => &mut self.undo,
        };

        let mut rotated = None;
        if head.state.pos as u64 + self.slab.len() as u64 > self.max_file_size as u64 {
            let previous = head.state.clone();
            head.file.sync_all()?;

            let mut next = ChainFile::new(kind);
            next.id = previous.id + 1;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.dir.join(file_name(kind, next.id)))?;

            debug!(
                kind = kind.prefix(),
                sealed = previous.id,
                items = previous.items,
                "rotating chain file"
            );
            head.file = file;
            head.state = next;
            self.sealed.push(previous.clone());
            rotated = Some(previous);
        }

        let pos = head.state.pos;
        head.file.write_all_at(&self.slab, pos as u64)?;
        if sync {
            head.file.sync_all()?;
        }

        head.state.pos += self.slab.len() as i32;
        head.state.update(time, height);

        Ok(Append {
            file: head.state.id,
            pos,
            sealed: rotated,
        })
    }

    /// Reads the whole record (framing included) at `(kind, id, pos)`.
    /// Returns `None` if the file does not exist, e.g. after pruning.
    pub(crate) fn read(
        &self,
        kind: FileKind,
        id: i32,
        pos: i32,
    ) -> Result<Option<Vec<u8>>, ChainError> {
        let head = match kind {
            FileKind::Block => &self.block,
            FileKind::Undo => &self.undo,
        };

        let opened;
        let file = if id == head.state.id {
            &head.file
        } else {
            match File::open(self.dir.join(file_name(kind, id))) {
                Ok(file) => {
                    opened = file;
                    &opened
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        };

        let mut length = [0u8; 4];
        file.read_exact_at(&mut length, pos as u64 + 16)?;
        let length = u32::from_le_bytes(length) as usize;

        let mut record = vec![0u8; RECORD_HEADER_SIZE + length];
        file.read_exact_at(&mut record, pos as u64)?;

        #[cfg(debug_assertions)]
        {
            let checksum = sha256d::Hash::hash(&record[RECORD_HEADER_SIZE..]);
            debug_assert_eq!(
                &record[20..24],
                &checksum.as_byte_array()[..4],
                "record checksum mismatch in {}",
                file_name(kind, id)
            );
        }

        Ok(Some(record))
    }

    /// Drops pruned files: forgets them from the sealed list and unlinks
    /// them from disk. Called only after the transaction that removed them
    /// from the `file` table has committed.
    pub(crate) fn unlink(&mut self, doomed: &[ChainFile]) {
        for file in doomed {
            let path = self.dir.join(file_name(file.kind, file.id));
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "failed to unlink pruned file");
                }
            }
        }
        self.sealed
            .retain(|sealed| !doomed.iter().any(|f| f.kind == sealed.kind && f.id == sealed.id));
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.block.file.sync_all();
        let _ = self.undo.file.sync_all();
    }
}
