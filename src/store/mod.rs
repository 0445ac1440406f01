use std::{
    io,
    path::{Path, PathBuf},
    sync::RwLock,
};
use sha1::{Digest, Sha1};
use crate::bitfield::Bitfield;


#[derive(Debug, thiserror::Error)]
pub enum StoreError {

    #[error("requested block overran piece length")]
    OverranPiece,

    #[error("root directory {0:?} does not exist")]
    MissingRoot(PathBuf),

    #[error("file {0:?} already exists and is larger than its declared length")]
    OversizedFile(PathBuf),

    #[error("file path has no components")]
    EmptyPath,

    #[error(transparent)]
    Io(#[from] io::Error),

}

pub type Result<T> = std::result::Result<T, StoreError>;

// One entry of the normalised metainfo file list.
#[derive(Debug, Clone)]
pub struct FileSpec {

    // Path relative to the configured root directory.
    pub path: PathBuf,

    pub length: u64,

}

// A positional reader with a declared length. Backing files implement this;
// tests substitute in-memory buffers.
pub trait Storer: Send + Sync + 'static {

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn len(&self) -> u64;

}

// A pre-sized file on disk backing part of the torrent's byte range.
// The handle is opened read/write at creation and held for the torrent's
// lifetime.
#[derive(Debug)]
pub struct TorrentFile {

    path: PathBuf,

    length: u64,

    handle: RwLock<std::fs::File>,

}

impl TorrentFile {

    pub fn create(root: &Path, rel_path: &Path, length: u64) -> Result<Self> {

        if rel_path.as_os_str().is_empty() {
            return Err(StoreError::EmptyPath);
        }
        // The root must be prepared by the host; only subdirectories are ours
        // to create.
        if !root.is_dir() {
            return Err(StoreError::MissingRoot(root.to_owned()));
        }

        let abs_path = root.join(rel_path);
        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let handle = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&abs_path)?;

        if handle.metadata()?.len() > length {
            return Err(StoreError::OversizedFile(abs_path));
        }
        // Pad out to the declared length so positional reads always land
        // inside the file.
        handle.set_len(length)?;
        tracing::debug!("backing file ready: {:?} ({} bytes)", abs_path, length);

        Ok(Self {
            path: rel_path.to_owned(),
            length,
            handle: RwLock::new(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storer for TorrentFile {

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let mut handle = self.handle.write()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read(buf)
    }

    fn len(&self) -> u64 {
        self.length
    }
}

// Maps (piece, offset, length) addresses onto an ordered sequence of backing
// files whose declared lengths partition the torrent's byte range.
#[derive(Debug)]
pub struct FileStore<S> {

    files: Vec<S>,

    hashes: Vec<[u8; 20]>,

    piece_len: u32,

    total_len: u64,

}

impl<S: Storer> FileStore<S> {

    pub fn new(files: Vec<S>, hashes: Vec<[u8; 20]>, piece_len: u32) -> Self {
        let total_len = files.iter().map(|f| f.len()).sum();
        Self { files, hashes, piece_len, total_len }
    }

    pub fn piece_count(&self) -> u32 {
        self.hashes.len() as u32
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    // All pieces are piece_len long bar the last, which takes the remainder;
    // an exact multiple leaves the last piece full length.
    pub fn piece_length(&self, index: u32) -> u32 {
        if index == self.piece_count() - 1 {
            (self.total_len - (self.piece_count() as u64 - 1) * self.piece_len as u64) as u32
        } else {
            self.piece_len
        }
    }

    // Reads a block out of the backing files, crossing file boundaries where
    // the address does. The block must lie fully within its piece.
    pub fn get_block(&self, piece: u32, offset: u32, length: u32) -> Result<Vec<u8>> {

        if piece >= self.piece_count()
            || offset as u64 + length as u64 > self.piece_length(piece) as u64
        {
            return Err(StoreError::OverranPiece);
        }

        let mut block = vec![0u8; length as usize];
        let mut abs_offset = piece as u64 * self.piece_len as u64 + offset as u64;
        let mut filled = 0;

        for file in &self.files {
            if filled == block.len() {
                break;
            }
            // Skip files wholly before the address.
            if abs_offset >= file.len() {
                abs_offset -= file.len();
                continue;
            }

            let want = ((block.len() - filled) as u64).min(file.len() - abs_offset) as usize;
            let slice = &mut block[filled..filled + want];
            let mut read = 0;
            while read < want {
                match file.read_at(&mut slice[read..], abs_offset + read as u64)? {
                    0 => return Err(StoreError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "backing file shorter than declared length",
                    ))),
                    n => read += n,
                }
            }

            filled += want;
            abs_offset = 0;
        }

        debug_assert_eq!(filled, block.len(), "file lengths do not cover the block");
        Ok(block)
    }

    // Hashes every piece, returning the bitfield of pieces present on disk.
    pub fn validate(&self) -> Result<Bitfield> {
        let mut bitfield = Bitfield::new(self.hashes.len());
        for index in 0..self.piece_count() {
            let piece = self.get_block(index, 0, self.piece_length(index))?;
            let mut hasher = Sha1::new();
            hasher.update(&piece);
            if hasher.finalize().as_slice() == self.hashes[index as usize] {
                // Index is in range by construction.
                bitfield.set(index as usize).unwrap();
            }
        }
        tracing::debug!("validated {}/{} pieces", bitfield.count_set(), self.piece_count());
        Ok(bitfield)
    }
}
