//! HTTP/1.1 range-based bulk source ("web seed"): fetches a contiguous run
//! of chunks over one keep-alive connection in competition/cooperation with
//! peer-backed downloads.
//!
//! Grounded on `examples/original_source/src/download/downloader.cpp`'s
//! web-seed integration points (range assignment, `chunk_ready` boundary
//! detection, failure-count disabling) and implemented with `reqwest`, the
//! HTTP client the reference engine already pulls in for this exact purpose.

use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::{error::{Error, Result}, ChunkIndex};

/// A completed chunk pulled from the range response, ready for hash
/// verification by the `Downloader`.
pub(crate) struct BulkChunkReady {
    pub index: ChunkIndex,
    pub data: Vec<u8>,
}

/// One HTTP web-seed source. Not `Send`-shared; owned by the `Downloader`
/// and driven from the torrent task.
pub(crate) struct WebSeedSource {
    client: reqwest::Client,
    url: String,
    consecutive_failures: usize,
    disabled: bool,
}

impl WebSeedSource {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            consecutive_failures: 0,
            disabled: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    pub fn note_failure(&mut self, threshold: usize) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= threshold {
            self.disabled = true;
        }
    }

    pub fn note_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Issues a single ranged GET covering `[from, to]` (inclusive chunk
    /// indices) and streams completed chunks to `tx` as they cross chunk
    /// boundaries in the response body.
    pub async fn fetch_range(
        &self,
        from: ChunkIndex,
        to: ChunkIndex,
        chunk_len: u32,
        last_chunk_len: u32,
        last_index: ChunkIndex,
        mut tx: mpsc::Sender<BulkChunkReady>,
    ) -> Result<()> {
        let start = from as u64 * chunk_len as u64;
        let this_chunk_len = |i: ChunkIndex| -> u32 {
            if i == last_index {
                last_chunk_len
            } else {
                chunk_len
            }
        };
        let end = to as u64 * chunk_len as u64 + this_chunk_len(to) as u64 - 1;

        let response = self
            .client
            .get(&self.url)
            .header("Range", format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::Http(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        let mut index = from;
        let mut buffer = Vec::new();
        let mut target_len = this_chunk_len(index) as usize;

        while let Some(item) = stream.next().await {
            let bytes: Bytes = item.map_err(|e| Error::Http(e.to_string()))?;
            buffer.extend_from_slice(&bytes);
            while buffer.len() >= target_len {
                let data = buffer.drain(..target_len).collect();
                if tx
                    .send(BulkChunkReady { index, data })
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                if index == to {
                    return Ok(());
                }
                index += 1;
                target_len = this_chunk_len(index) as usize;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_threshold_disables_source() {
        let mut src = WebSeedSource::new("http://example.invalid/file".into());
        src.note_failure(3);
        src.note_failure(3);
        assert!(!src.is_disabled());
        src.note_failure(3);
        assert!(src.is_disabled());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut src = WebSeedSource::new("http://example.invalid/file".into());
        src.note_failure(3);
        src.note_success();
        assert_eq!(src.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_fetch_range_sends_range_header_and_splits_chunks() {
        let _m = mockito::mock("GET", "/file")
            .match_header("range", "bytes=0-7")
            .with_status(206)
            .with_body(vec![1, 2, 3, 4, 5, 6, 7, 8])
            .create();

        let src = WebSeedSource::new(format!("{}/file", mockito::server_url()));
        let (tx, mut rx) = mpsc::channel(4);
        src.fetch_range(0, 1, 4, 4, 1, tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.data, vec![1, 2, 3, 4]);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.index, 1);
        assert_eq!(second.data, vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_fetch_range_propagates_error_status() {
        let _m = mockito::mock("GET", "/missing")
            .with_status(404)
            .create();

        let src = WebSeedSource::new(format!("{}/missing", mockito::server_url()));
        let (tx, _rx) = mpsc::channel(4);
        let result = src.fetch_range(0, 0, 4, 4, 0, tx).await;
        assert!(result.is_err());
    }
}
