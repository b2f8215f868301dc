//! The on-disk chunk store. The download core only ever talks to it through the
//! [`ChunkStore`] trait; this module also provides [`DiskChunkStore`], a
//! concrete disk-backed implementation adapted from the reference engine's
//! disk actor (incremental per-chunk hashing, `spawn_blocking` verify+write,
//! vectored `pwritev` writes), addressed by [`ChunkIndex`] instead of the
//! reference engine's single-file "piece" unit.
//!
//! File layout and chunk/file intersection math (how a chunk's byte range
//! maps onto the torrent's one or more destination files) lives here too,
//! right next to the only thing that ever needs it: [`DiskChunkStore`]'s
//! `flush_to_disk`. [`FileInfo`] and [`FsStructure`] are kept visible to
//! [`crate::metainfo`] since parsing a manifest has to build the same file
//! layout the store then writes against.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    ops::Range,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use nix::sys::uio::{pwritev, IoVec};
use sha1::{Digest, Sha1};
use tokio::task;

use crate::{
    block_count,
    error::{Error, Result},
    metainfo::Metainfo,
    ChunkIndex, FileIndex, Sha1Hash,
};

/// Information about a torrent's file.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The file's relative path from the download directory.
    pub path: PathBuf,
    /// The file's length, in bytes.
    pub len: u64,
    /// The byte offset of the file within the torrent, when all files in
    /// the torrent are viewed as a single contiguous byte array. Always 0
    /// for a single-file torrent.
    pub torrent_offset: u64,
}

impl FileInfo {
    fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_offset + self.len
    }

    /// Returns the slice of this file that overlaps the range of `len`
    /// bytes starting at `torrent_offset`, clamped to the file's own
    /// length. `torrent_offset` must fall within this file's range.
    fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
        let end = self.torrent_offset + self.len;
        assert!(
            torrent_offset >= self.torrent_offset && torrent_offset < end,
            "torrent offset {} outside file range {}..{}",
            torrent_offset,
            self.torrent_offset,
            end
        );
        FileSlice {
            offset: torrent_offset - self.torrent_offset,
            len: len.min(end - torrent_offset),
        }
    }
}

/// The location of a byte range within a single file, as returned by
/// [`FileInfo::get_slice`].
#[derive(Clone, Copy, Debug, PartialEq)]
struct FileSlice {
    offset: u64,
    len: u64,
}

/// The file system layout of a torrent's download.
#[derive(Clone, Debug)]
pub enum FsStructure {
    /// A single-file download.
    File(FileInfo),
    /// Multiple files, possibly nested in directories, flattened into one
    /// list ordered by their offset in the torrent's logical byte stream.
    Archive { files: Vec<FileInfo> },
}

impl FsStructure {
    pub(crate) fn is_archive(&self) -> bool {
        matches!(self, Self::Archive { .. })
    }

    /// Sum of every file's length. O(n) for archives; callers that need this
    /// more than once should cache it (as [`DiskChunkStore`] does).
    pub(crate) fn download_len(&self) -> u64 {
        match self {
            Self::File(file) => file.len,
            Self::Archive { files } => files.iter().map(|f| f.len).sum(),
        }
    }

    /// Returns the left-inclusive range of file indices that overlap
    /// `byte_range`, a left-inclusive range of torrent-wide byte offsets.
    fn files_intersecting_bytes(&self, byte_range: Range<u64>) -> Range<FileIndex> {
        match self {
            Self::File(_) => 0..1,
            Self::Archive { files } => {
                let first = match files
                    .iter()
                    .position(|file| file.byte_range().contains(&byte_range.start))
                {
                    Some(index) => index,
                    None => return 0..0,
                };
                let mut range = first..first + 1;
                for (index, file) in files.iter().enumerate().skip(first + 1) {
                    if !byte_range.contains(&file.torrent_offset) {
                        break;
                    }
                    range.end = index + 1;
                }
                range
            }
        }
    }
}

/// The external collaborator the download core writes finished blocks
/// through and queries chunk state from. Kept deliberately narrow: the core
/// never inspects file layout or I/O details directly.
pub trait ChunkStore: Send + Sync {
    /// Queues `data` to be written at `(index, offset)`. Returns once the
    /// write has been durably queued; actual disk I/O may happen later on a
    /// blocking thread.
    fn write_block(
        &self,
        index: ChunkIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()>;

    /// The expected SHA-1 hash of the chunk, from the torrent manifest.
    fn expected_hash(&self, index: ChunkIndex) -> Sha1Hash;

    /// The length of the chunk in bytes.
    fn chunk_len(&self, index: ChunkIndex) -> u32;

    /// Marks a chunk verified and durable; removes it from any in-progress
    /// write buffer.
    fn commit(&self, index: ChunkIndex);

    /// Rolls a chunk's on-disk progress back (hash mismatch, exclusion).
    fn reset(&self, index: ChunkIndex);

    /// The chunk's current lifecycle state.
    fn status(&self, index: ChunkIndex) -> ChunkStatus;
}

/// A chunk's lifecycle state as tracked by the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    NotOnDisk,
    Downloading,
    OnDisk,
    Excluded,
}

/// A disk-backed [`ChunkStore`], the default, complete implementation
/// provided for a runnable crate.
pub struct DiskChunkStore {
    metainfo: Arc<Metainfo>,
    chunk_count: usize,
    chunk_len: u32,
    last_chunk_len: u32,
    structure: FsStructure,
    files: Vec<Mutex<File>>,
    /// In-progress per-chunk write buffers, keyed by chunk index.
    buffers: Mutex<HashMap<ChunkIndex, ChunkBuffer>>,
    statuses: Mutex<HashMap<ChunkIndex, ChunkStatus>>,
}

impl DiskChunkStore {
    pub fn new(metainfo: Arc<Metainfo>, download_dir: PathBuf) -> Result<Self> {
        let chunk_count = metainfo.piece_count();
        let download_len = metainfo.structure.download_len();
        let chunk_len = metainfo.chunk_len;
        let last_chunk_len =
            (download_len - chunk_len as u64 * (chunk_count - 1) as u64) as u32;

        // an archive's files get their own subdirectory, named after the
        // torrent, so they don't scatter across the download directory
        let download_dir = if metainfo.structure.is_archive() {
            download_dir.join(&metainfo.name)
        } else {
            download_dir
        };

        let files = match &metainfo.structure {
            FsStructure::File(file) => {
                vec![Mutex::new(Self::open_file(&download_dir, file)?)]
            }
            FsStructure::Archive { files } => files
                .iter()
                .map(|file| Self::open_file(&download_dir, file).map(Mutex::new))
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Self {
            chunk_count,
            chunk_len,
            last_chunk_len,
            structure: metainfo.structure.clone(),
            metainfo,
            files,
            buffers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    fn open_file(download_dir: &Path, file: &FileInfo) -> Result<File> {
        let path = download_dir.join(&file.path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        f.set_len(file.len)?;
        Ok(f)
    }

    /// Returns the indices of the files that overlap the given chunk.
    fn files_intersecting_chunk(&self, index: ChunkIndex) -> Result<Range<FileIndex>> {
        let chunk_offset = index as u64 * self.chunk_len as u64;
        let chunk_end = chunk_offset + self.chunk_len_checked(index)? as u64;
        Ok(self.structure.files_intersecting_bytes(chunk_offset..chunk_end))
    }

    fn chunk_len_checked(&self, index: ChunkIndex) -> Result<u32> {
        if index == self.chunk_count - 1 {
            Ok(self.last_chunk_len)
        } else if index < self.chunk_count - 1 {
            Ok(self.chunk_len)
        } else {
            log::error!("chunk {} out of range (count {})", index, self.chunk_count);
            Err(Error::InvalidChunkIndex)
        }
    }

    /// Writes the chunk's buffered blocks to the underlying files via
    /// vectored writes, one write per intersecting file.
    fn flush_to_disk(&self, index: ChunkIndex, data: &[u8]) -> Result<()> {
        let file_range = self.files_intersecting_chunk(index)?;
        let chunk_offset = index as u64 * self.chunk_len as u64;
        let mut pos = 0usize;
        for file_index in file_range {
            let file_info = match &self.structure {
                FsStructure::File(f) => f,
                FsStructure::Archive { files } => &files[file_index],
            };
            let slice = file_info
                .get_slice(chunk_offset + pos as u64, data.len() as u64 - pos as u64);
            let bytes = &data[pos..pos + slice.len as usize];
            let file = self.files[file_index].lock().unwrap();
            pwritev(
                file.as_raw_fd(),
                &[IoVec::from_slice(bytes)],
                slice.offset as i64,
            )
            .map_err(|e| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
            pos += slice.len as usize;
        }
        Ok(())
    }
}

/// A chunk's partially-received payload, buffered in memory until all blocks
/// have arrived, then hashed and flushed (mirrors the reference engine's
/// per-piece `Piece` write buffer).
struct ChunkBuffer {
    data: Vec<u8>,
    received: Vec<bool>,
    hasher: Sha1,
}

impl ChunkBuffer {
    fn new(len: u32) -> Self {
        Self {
            data: vec![0; len as usize],
            received: vec![false; block_count(len)],
            hasher: Sha1::new(),
        }
    }

    fn enqueue(&mut self, offset: u32, data: &[u8]) {
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        let block_index = (offset / crate::BLOCK_LEN) as usize;
        self.received[block_index] = true;
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    fn finish_hash(&mut self) -> Sha1Hash {
        self.hasher.update(&self.data);
        let digest = self.hasher.clone().finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }
}

impl ChunkStore for DiskChunkStore {
    fn write_block(
        &self,
        index: ChunkIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Writing chunk {} offset {} ({} bytes)", index, offset, data.len());
        let chunk_len = self.chunk_len(index);
        let mut buffers = self.buffers.lock().unwrap();
        let buffer =
            buffers.entry(index).or_insert_with(|| ChunkBuffer::new(chunk_len));
        buffer.enqueue(offset, &data);

        self.statuses
            .lock()
            .unwrap()
            .insert(index, ChunkStatus::Downloading);

        if buffer.is_complete() {
            let hash = buffer.finish_hash();
            let payload = buffer.data.clone();
            drop(buffers);
            // NOTE: actual disk I/O is expected to happen off the torrent
            // thread; the synchronous call here stands in for the
            // `spawn_blocking` dispatch the reference engine performs, since
            // the trait boundary is what the core depends on, not the
            // scheduling detail.
            self.flush_to_disk(index, &payload)?;
            log::debug!("Chunk {} complete, computed hash {:x?}", index, hash);
        }
        Ok(())
    }

    fn expected_hash(&self, index: ChunkIndex) -> Sha1Hash {
        self.metainfo.chunk_hash(index)
    }

    fn chunk_len(&self, index: ChunkIndex) -> u32 {
        self.chunk_len_checked(index).unwrap_or(self.chunk_len)
    }

    fn commit(&self, index: ChunkIndex) {
        self.buffers.lock().unwrap().remove(&index);
        self.statuses.lock().unwrap().insert(index, ChunkStatus::OnDisk);
    }

    fn reset(&self, index: ChunkIndex) {
        self.buffers.lock().unwrap().remove(&index);
        self.statuses
            .lock()
            .unwrap()
            .insert(index, ChunkStatus::NotOnDisk);
    }

    fn status(&self, index: ChunkIndex) -> ChunkStatus {
        *self
            .statuses
            .lock()
            .unwrap()
            .get(&index)
            .unwrap_or(&ChunkStatus::NotOnDisk)
    }
}

/// Spawns the hashing of a completed chunk on a blocking thread, matching
/// the reference engine's `task::spawn_blocking` use for CPU-heavy disk work.
pub(crate) async fn verify_chunk_blocking(
    data: Vec<u8>,
    expected: Sha1Hash,
) -> bool {
    task::spawn_blocking(move || {
        let digest = Sha1::digest(&data);
        digest.as_slice() == expected
    })
    .await
    .unwrap_or(false)
}

/// An in-memory [`ChunkStore`] used by the core's own tests (`chunk_download`,
/// `downloader`) so their tests don't need real files on disk.
#[cfg(test)]
pub(crate) struct MemoryChunkStore {
    chunk_len: u32,
    last_index: ChunkIndex,
    last_chunk_len: u32,
    hashes: HashMap<ChunkIndex, Sha1Hash>,
    pub buffers: Mutex<HashMap<ChunkIndex, ChunkBuffer>>,
    pub statuses: Mutex<HashMap<ChunkIndex, ChunkStatus>>,
    pub writes: Mutex<Vec<(ChunkIndex, u32)>>,
}

#[cfg(test)]
impl MemoryChunkStore {
    pub fn new(
        chunk_len: u32,
        last_index: ChunkIndex,
        last_chunk_len: u32,
        hashes: HashMap<ChunkIndex, Sha1Hash>,
    ) -> Self {
        Self {
            chunk_len,
            last_index,
            last_chunk_len,
            hashes,
            buffers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn chunk_data(&self, index: ChunkIndex) -> Option<Vec<u8>> {
        self.buffers.lock().unwrap().get(&index).map(|b| b.data.clone())
    }
}

#[cfg(test)]
impl ChunkStore for MemoryChunkStore {
    fn write_block(
        &self,
        index: ChunkIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        self.writes.lock().unwrap().push((index, offset));
        let chunk_len = self.chunk_len(index);
        let mut buffers = self.buffers.lock().unwrap();
        let buffer =
            buffers.entry(index).or_insert_with(|| ChunkBuffer::new(chunk_len));
        buffer.enqueue(offset, &data);
        self.statuses
            .lock()
            .unwrap()
            .insert(index, ChunkStatus::Downloading);
        Ok(())
    }

    fn expected_hash(&self, index: ChunkIndex) -> Sha1Hash {
        *self.hashes.get(&index).unwrap_or(&[0u8; 20])
    }

    fn chunk_len(&self, index: ChunkIndex) -> u32 {
        if index == self.last_index {
            self.last_chunk_len
        } else {
            self.chunk_len
        }
    }

    fn commit(&self, index: ChunkIndex) {
        self.statuses.lock().unwrap().insert(index, ChunkStatus::OnDisk);
    }

    fn reset(&self, index: ChunkIndex) {
        self.buffers.lock().unwrap().remove(&index);
        self.statuses
            .lock()
            .unwrap()
            .insert(index, ChunkStatus::NotOnDisk);
    }

    fn status(&self, index: ChunkIndex) -> ChunkStatus {
        *self
            .statuses
            .lock()
            .unwrap()
            .get(&index)
            .unwrap_or(&ChunkStatus::NotOnDisk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_completes_chunk() {
        let mut hashes = HashMap::new();
        hashes.insert(0, [1u8; 20]);
        let store = MemoryChunkStore::new(32768, 0, 32768, hashes);
        store.write_block(0, 0, vec![1; 16384]).unwrap();
        assert_eq!(store.status(0), ChunkStatus::Downloading);
        store.write_block(0, 16384, vec![2; 16384]).unwrap();
        let data = store.chunk_data(0).unwrap();
        assert_eq!(data.len(), 32768);
        store.commit(0);
        assert_eq!(store.status(0), ChunkStatus::OnDisk);
    }

    #[test]
    fn test_reset_clears_buffer() {
        let store = MemoryChunkStore::new(16384, 0, 16384, HashMap::new());
        store.write_block(0, 0, vec![9; 16384]).unwrap();
        assert!(store.chunk_data(0).is_some());
        store.reset(0);
        assert!(store.chunk_data(0).is_none());
        assert_eq!(store.status(0), ChunkStatus::NotOnDisk);
    }

    #[test]
    fn test_file_get_slice() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };

        assert_eq!(
            file.get_slice(300, 1000),
            FileSlice { offset: 100, len: 400 },
            "a slice request longer than the file should clamp to the file's \
            remaining length"
        );
        assert_eq!(
            file.get_slice(300, 10),
            FileSlice { offset: 100, len: 10 },
        );
        assert_eq!(
            file.get_slice(200, 500),
            FileSlice { offset: 0, len: 500 },
        );
    }

    #[test]
    #[should_panic]
    fn test_file_get_slice_starting_before_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(100, 400);
    }

    #[test]
    #[should_panic]
    fn test_file_get_slice_starting_after_file() {
        let file = FileInfo {
            path: PathBuf::from("/tmp/does/not/exist"),
            len: 500,
            torrent_offset: 200,
        };
        file.get_slice(200 + 500, 400);
    }

    fn store_with_layout(
        chunk_count: usize,
        chunk_len: u32,
        last_chunk_len: u32,
        structure: FsStructure,
    ) -> DiskChunkStore {
        // built directly rather than through `DiskChunkStore::new` so these
        // tests can exercise `files_intersecting_chunk` without touching disk
        DiskChunkStore {
            metainfo: Arc::new(Metainfo {
                name: "t".into(),
                chunk_len,
                chunk_hashes: Vec::new(),
                structure: structure.clone(),
            }),
            chunk_count,
            chunk_len,
            last_chunk_len,
            structure,
            files: Vec::new(),
            buffers: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn test_files_intersecting_chunks_single_file() {
        let download_len = 3 * 4 + 2;
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: download_len,
        });
        let store = store_with_layout(4, 4, 2, structure);
        assert_eq!(store.files_intersecting_chunk(0).unwrap(), 0..1);
        assert_eq!(store.files_intersecting_chunk(3).unwrap(), 0..1);
        assert!(store.files_intersecting_chunk(4).is_err());
    }

    #[test]
    fn test_files_intersecting_chunks_archive() {
        // chunks: (index:first byte offset)
        // |0:0    |1:16    |2:32    |3:48    |4:64 (8 bytes)|
        // files:  |0:0,8|1:9,19|2:20,26|3:27,35|4:36,47|5:48,63|6:64,71|
        let files = vec![
            FileInfo { path: "0".into(), torrent_offset: 0, len: 9 },
            FileInfo { path: "1".into(), torrent_offset: 9, len: 11 },
            FileInfo { path: "2".into(), torrent_offset: 20, len: 7 },
            FileInfo { path: "3".into(), torrent_offset: 27, len: 9 },
            FileInfo { path: "4".into(), torrent_offset: 36, len: 12 },
            FileInfo { path: "5".into(), torrent_offset: 48, len: 16 },
            FileInfo { path: "6".into(), torrent_offset: 64, len: 8 },
        ];
        let structure = FsStructure::Archive { files };
        let store = store_with_layout(5, 16, 8, structure);

        assert_eq!(store.files_intersecting_chunk(0).unwrap(), 0..2);
        assert_eq!(store.files_intersecting_chunk(1).unwrap(), 1..4);
        assert_eq!(store.files_intersecting_chunk(2).unwrap(), 3..5);
        assert_eq!(store.files_intersecting_chunk(3).unwrap(), 5..6);
        assert_eq!(store.files_intersecting_chunk(4).unwrap(), 6..7);
        assert!(store.files_intersecting_chunk(5).is_err());
    }

    #[test]
    fn test_files_intersecting_bytes() {
        let structure = FsStructure::File(FileInfo {
            path: PathBuf::from("/bogus"),
            torrent_offset: 0,
            len: 12341234,
        });
        assert_eq!(structure.files_intersecting_bytes(0..0), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..12341234), 0..1);

        let structure = FsStructure::Archive {
            files: vec![
                FileInfo { path: "0".into(), torrent_offset: 0, len: 4 },
                FileInfo { path: "1".into(), torrent_offset: 4, len: 9 },
                FileInfo { path: "2".into(), torrent_offset: 13, len: 3 },
                FileInfo { path: "3".into(), torrent_offset: 16, len: 10 },
            ],
        };
        assert_eq!(structure.files_intersecting_bytes(0..4), 0..1);
        assert_eq!(structure.files_intersecting_bytes(0..5), 0..2);
        assert_eq!(structure.files_intersecting_bytes(0..13), 0..2);
        assert_eq!(structure.files_intersecting_bytes(0..15), 0..3);
        assert_eq!(structure.files_intersecting_bytes(0..18), 0..4);
        assert_eq!(structure.files_intersecting_bytes(25..26), 3..4);
        assert_eq!(structure.files_intersecting_bytes(4..16), 1..3);
        assert_eq!(structure.files_intersecting_bytes(8..14), 1..3);
        assert_eq!(structure.files_intersecting_bytes(13..14), 2..3);
        assert_eq!(structure.files_intersecting_bytes(30..38), 0..0);
    }
}
