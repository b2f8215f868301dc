//! Partial-download persistence: the on-disk layout a `Downloader` uses to
//! resume an interrupted session.
//!
//! Grounded on `examples/original_source/src/download/downloader.cpp`'s
//! `CURRENT_CHUNK_MAGIC` save/load routines and `chunkdownload.cpp`'s
//! per-chunk header, re-expressed with `bytes::{Buf, BufMut}` the way
//! `wire.rs` frames peer messages.

use bytes::{Buf, BufMut, BytesMut};

use crate::{block_count, error::{Error, Result}, ChunkIndex};

pub(crate) const CURRENT_CHUNK_MAGIC: u32 = 0xABCDEF00;
const FORMAT_MAJOR: u32 = 1;
const FORMAT_MINOR: u32 = 0;

/// File-level header, written once before any per-chunk records.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub num_chunks: u32,
}

impl FileHeader {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(CURRENT_CHUNK_MAGIC);
        buf.put_u32(FORMAT_MAJOR);
        buf.put_u32(FORMAT_MINOR);
        buf.put_u32(self.num_chunks);
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::CorruptPersistence("truncated file header".into()));
        }
        let magic = buf.get_u32();
        if magic != CURRENT_CHUNK_MAGIC {
            return Err(Error::CorruptPersistence(format!(
                "bad magic {:#x}",
                magic
            )));
        }
        let _major = buf.get_u32();
        let _minor = buf.get_u32();
        let num_chunks = buf.get_u32();
        Ok(Self { num_chunks })
    }
}

/// One present block, as recorded in a chunk's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PersistedBlock {
    pub block_idx: u32,
    pub data: Vec<u8>,
}

/// A chunk's persisted partial-download state: which blocks are present and
/// their payload, sufficient to resume `ChunkDownload` without re-fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PersistedChunk {
    pub index: ChunkIndex,
    pub num_bits: u32,
    pub blocks: Vec<PersistedBlock>,
}

impl PersistedChunk {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index as u32);
        buf.put_u32(self.num_bits);
        buf.put_u32(1); // buffered

        let num_bytes = ((self.num_bits + 7) / 8) as usize;
        let mut bitmap = vec![0u8; num_bytes];
        for b in &self.blocks {
            let byte = (b.block_idx / 8) as usize;
            let bit = 7 - (b.block_idx % 8);
            bitmap[byte] |= 1 << bit;
        }
        buf.extend_from_slice(&bitmap);

        buf.put_u32(self.blocks.len() as u32);
        for b in &self.blocks {
            buf.put_u32(b.block_idx);
            buf.put_u32(b.data.len() as u32);
            buf.put_u32(0); // mapped = 0: payload follows inline
            buf.extend_from_slice(&b.data);
        }
    }

    pub fn decode(buf: &mut BytesMut) -> Result<Self> {
        if buf.len() < 12 {
            return Err(Error::CorruptPersistence("truncated chunk header".into()));
        }
        let index = buf.get_u32() as ChunkIndex;
        let num_bits = buf.get_u32();
        let _buffered = buf.get_u32();

        let num_bytes = ((num_bits + 7) / 8) as usize;
        if buf.len() < num_bytes {
            return Err(Error::CorruptPersistence("truncated bitmap".into()));
        }
        buf.advance(num_bytes);

        if buf.len() < 4 {
            return Err(Error::CorruptPersistence("truncated piece count".into()));
        }
        let num_pieces = buf.get_u32();
        let mut blocks = Vec::with_capacity(num_pieces as usize);
        for _ in 0..num_pieces {
            if buf.len() < 12 {
                return Err(Error::CorruptPersistence("truncated piece header".into()));
            }
            let block_idx = buf.get_u32();
            let size = buf.get_u32();
            let mapped = buf.get_u32();
            if mapped != 0 {
                return Err(Error::CorruptPersistence(
                    "memory-mapped persisted blocks are unsupported".into(),
                ));
            }
            if buf.len() < size as usize {
                return Err(Error::CorruptPersistence("truncated piece payload".into()));
            }
            let data = buf.split_to(size as usize).to_vec();
            blocks.push(PersistedBlock { block_idx, data });
        }

        Ok(Self {
            index,
            num_bits,
            blocks,
        })
    }
}

/// Serialises a chunk's in-progress state, deriving `num_bits` from
/// `chunk_len` the way `ChunkDownload` would.
pub(crate) fn save_chunk(
    index: ChunkIndex,
    chunk_len: u32,
    blocks: &[(u32, Vec<u8>)],
) -> PersistedChunk {
    PersistedChunk {
        index,
        num_bits: block_count(chunk_len) as u32,
        blocks: blocks
            .iter()
            .map(|(idx, data)| PersistedBlock {
                block_idx: *idx,
                data: data.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_header_roundtrip() {
        let header = FileHeader { num_chunks: 42 };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(FileHeader::decode(&mut buf).unwrap(), header);
    }

    #[test]
    fn test_file_header_rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u32(0xdeadbeef);
        buf.put_u32(1);
        buf.put_u32(0);
        buf.put_u32(1);
        assert!(FileHeader::decode(&mut buf).is_err());
    }

    #[test]
    fn test_chunk_roundtrip_with_two_blocks() {
        let chunk = PersistedChunk {
            index: 3,
            num_bits: 4,
            blocks: vec![
                PersistedBlock { block_idx: 0, data: vec![1, 2, 3] },
                PersistedBlock { block_idx: 2, data: vec![4, 5] },
            ],
        };
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        let decoded = PersistedChunk::decode(&mut buf).unwrap();
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_chunk_roundtrip_with_no_blocks() {
        let chunk = PersistedChunk {
            index: 0,
            num_bits: 8,
            blocks: vec![],
        };
        let mut buf = BytesMut::new();
        chunk.encode(&mut buf);
        assert_eq!(PersistedChunk::decode(&mut buf).unwrap(), chunk);
    }

    #[test]
    fn test_full_file_roundtrip() {
        let header = FileHeader { num_chunks: 2 };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        save_chunk(0, 32768, &[(0, vec![9; 16384])]).encode(&mut buf);
        save_chunk(1, 32768, &[]).encode(&mut buf);

        let decoded_header = FileHeader::decode(&mut buf).unwrap();
        assert_eq!(decoded_header.num_chunks, 2);
        let chunk0 = PersistedChunk::decode(&mut buf).unwrap();
        assert_eq!(chunk0.blocks.len(), 1);
        let chunk1 = PersistedChunk::decode(&mut buf).unwrap();
        assert!(chunk1.blocks.is_empty());
    }
}
