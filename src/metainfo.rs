//! Bencoded metainfo parsing and the torrent manifest object.
//!
//! Out of the download core's direct scope but required as the ambient
//! collaborator the default [`crate::chunk_store::ChunkStore`]
//! implementation is built against.

use crate::{chunk_store::FsStructure, FileInfo, Sha1Hash};
use serde_bencode::Error;
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// A parsed torrent manifest.
#[derive(Debug)]
pub struct Metainfo {
    /// The torrent's display name (single file name, or archive directory
    /// name).
    pub name: String,
    /// The nominal length of a chunk (all but possibly the last).
    pub chunk_len: u32,
    /// Concatenated 20-byte SHA-1 hashes, one per chunk.
    pub chunk_hashes: Vec<u8>,
    /// The file layout of the download.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses a bencoded metainfo buffer into a [`Metainfo`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawMetainfo) -> Self {
        let info = raw.info;
        let structure = match info.files {
            Some(files) => {
                let mut offset = 0;
                let files = files
                    .into_iter()
                    .map(|f| {
                        let len = f.length.max(0) as u64;
                        let file = FileInfo {
                            path: PathBuf::from_iter_parts(&f.path),
                            len,
                            torrent_offset: offset,
                        };
                        offset += len;
                        file
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&info.name),
                len: info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
        };

        Self {
            name: info.name,
            chunk_len: info.piece_length as u32,
            chunk_hashes: info.pieces,
            structure,
        }
    }

    /// Returns the number of chunks in the torrent.
    pub fn piece_count(&self) -> usize {
        self.chunk_hashes.len() / 20
    }

    /// Returns the expected SHA-1 hash of the chunk at `index`.
    pub fn chunk_hash(&self, index: usize) -> Sha1Hash {
        let start = index * 20;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&self.chunk_hashes[start..start + 20]);
        hash
    }

    /// Computes the info-hash (SHA-1 of the bencoded `info` dict). This is
    /// computed directly from the raw fields rather than round-tripped
    /// through [`RawInfo`], since that's the only part of the manifest this
    /// crate treats as a black box value to hash, not to manipulate.
    pub fn create_info_hash(&self, raw_info_bytes: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(raw_info_bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        info_hash
    }
}

trait PathBufExt {
    fn from_iter_parts(parts: &[String]) -> PathBuf;
}

impl PathBufExt for PathBuf {
    fn from_iter_parts(parts: &[String]) -> PathBuf {
        parts.iter().collect()
    }
}

#[derive(Debug, Deserialize)]
struct RawMetainfo {
    info: RawInfo,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

// kept for symmetry with the bencode crate's `ByteBuf` used elsewhere in the
// reference engine's own metainfo handling
#[allow(dead_code)]
type _Unused = ByteBuf;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_metainfo() {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "foo.iso".to_string(),
                pieces: vec![0u8; 40],
                piece_length: 16384,
                length: Some(32768),
                files: None,
                private: None,
            },
        };
        let metainfo = Metainfo::from_raw(raw);
        assert_eq!(metainfo.piece_count(), 2);
        assert!(!metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 32768);
    }

    #[test]
    fn test_archive_metainfo() {
        let raw = RawMetainfo {
            info: RawInfo {
                name: "archive".to_string(),
                pieces: vec![0u8; 20],
                piece_length: 16384,
                length: None,
                files: Some(vec![
                    RawFile {
                        path: vec!["a.bin".to_string()],
                        length: 100,
                    },
                    RawFile {
                        path: vec!["sub".to_string(), "b.bin".to_string()],
                        length: 200,
                    },
                ]),
                private: None,
            },
        };
        let metainfo = Metainfo::from_raw(raw);
        assert!(metainfo.structure.is_archive());
        assert_eq!(metainfo.structure.download_len(), 300);
    }
}
