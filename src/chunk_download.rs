//! Per-chunk download state machine.
//!
//! Grounded line-for-line on
//! `examples/original_source/src/download/chunkdownload.{h,cpp}` for
//! semantics (assign/release/piece_received/best_piece/send_requests/
//! endgame cancel/timeout/reject/save/load), re-expressed in the reference
//! engine's ownership idiom instead of Qt signals/slots: rather than holding
//! owned or reference-counted pointers to its downloaders, a `ChunkDownload`
//! only ever stores `DownloaderId` handles and resolves them through a
//! caller-supplied pool on every call, so the pool's owner is free to add or
//! drop downloaders between calls without invalidating anything held here.
//!

use std::{
    collections::{HashMap, HashSet},
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};

use crate::{
    block_count, block_len,
    piece_downloader::PieceDownloader,
    wire::Block,
    BlockInfo, ChunkIndex, DownloaderId, Sha1Hash,
};

/// The pool `ChunkDownload` borrows `PieceDownloader` handles from. Owned by
/// the `Downloader`/peer manager, never by `ChunkDownload` itself.
pub(crate) type DownloaderPool =
    HashMap<DownloaderId, Box<dyn PieceDownloader + Send>>;

/// Per-downloader bookkeeping kept by a `ChunkDownload` for each assigned
/// source.
#[derive(Default)]
struct Assignment {
    in_flight: HashSet<usize>,
    timeouts: u32,
}

/// The outcome of delivering a block to a `ChunkDownload`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct PieceOutcome {
    /// False when the block was a protocol-local error (bad shape,
    /// duplicate); the caller should *not* count this delivery as useful.
    pub is_needed: bool,
    /// True once every block in the chunk has been received.
    pub is_complete: bool,
}

/// Drives a single chunk to completion.
pub(crate) struct ChunkDownload {
    pub index: ChunkIndex,
    chunk_len: u32,
    num_blocks: usize,
    blocks: Vec<Option<Vec<u8>>>,
    next_hash_index: usize,
    hasher: Sha1,
    assignments: HashMap<DownloaderId, Assignment>,
    contributors: HashSet<DownloaderId>,
    last_activity: Instant,
}

impl ChunkDownload {
    pub fn new(index: ChunkIndex, chunk_len: u32) -> Self {
        let num_blocks = block_count(chunk_len);
        Self {
            index,
            chunk_len,
            num_blocks,
            blocks: vec![None; num_blocks],
            next_hash_index: 0,
            hasher: Sha1::new(),
            assignments: HashMap::new(),
            contributors: HashSet::new(),
            last_activity: Instant::now(),
        }
    }

    pub fn num_received(&self) -> usize {
        self.blocks.iter().filter(|b| b.is_some()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.num_received() == self.num_blocks
    }

    pub fn remaining_blocks(&self) -> usize {
        self.num_blocks - self.num_received()
    }

    pub fn assignee_count(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_assigned(&self, id: DownloaderId) -> bool {
        self.assignments.contains_key(&id)
    }

    pub fn contributors(&self) -> &HashSet<DownloaderId> {
        &self.contributors
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Registers `pd`, creating empty in-flight state, and attempts to emit
    /// new requests. A no-op if `pd` is already registered.
    pub fn assign(&mut self, id: DownloaderId, pool: &mut DownloaderPool) {
        if self.assignments.contains_key(&id) {
            return;
        }
        self.assignments.insert(id, Assignment::default());
        if let Some(pd) = pool.get_mut(&id) {
            pd.grab();
        }
        self.send_requests(pool);
    }

    /// Emits cancels for every block still in `pd`'s in-flight set, releases
    /// its grab count, and drops its state.
    pub fn release(&mut self, id: DownloaderId, pool: &mut DownloaderPool) {
        if let Some(assignment) = self.assignments.remove(&id) {
            if let Some(pd) = pool.get_mut(&id) {
                for block_idx in &assignment.in_flight {
                    pd.cancel(self.block_info(*block_idx));
                }
                pd.release();
            }
        }
    }

    /// Sends cancels for every outstanding block across all assigned
    /// downloaders (chunk exclusion).
    pub fn cancel_all(&mut self, pool: &mut DownloaderPool) {
        let index = self.index;
        let chunk_len = self.chunk_len;
        for (id, assignment) in self.assignments.iter_mut() {
            if let Some(pd) = pool.get_mut(id) {
                for block_idx in assignment.in_flight.drain() {
                    pd.cancel(block_info_for(index, chunk_len, block_idx));
                }
            }
        }
    }

    /// Releases every assigned downloader (used after hash verification
    /// fails and the chunk must be re-requested from scratch).
    pub fn release_all(&mut self, pool: &mut DownloaderPool) {
        let ids: Vec<_> = self.assignments.keys().copied().collect();
        for id in ids {
            self.release(id, pool);
        }
    }

    fn block_info(&self, block_idx: usize) -> BlockInfo {
        block_info_for(self.index, self.chunk_len, block_idx)
    }

    /// `best_piece`: rarest-in-flight block selection for `pd`.
    fn best_piece(&self, pd_id: DownloaderId) -> Option<usize> {
        let own_in_flight = self
            .assignments
            .get(&pd_id)
            .map(|a| &a.in_flight);

        let mut best: Option<(usize, usize)> = None; // (block_idx, other_count)
        for idx in 0..self.num_blocks {
            if self.blocks[idx].is_some() {
                continue;
            }
            if own_in_flight.map(|s| s.contains(&idx)).unwrap_or(false) {
                continue;
            }
            let other_count = self
                .assignments
                .iter()
                .filter(|(id, a)| **id != pd_id && a.in_flight.contains(&idx))
                .count();
            if other_count == 0 {
                return Some(idx);
            }
            match best {
                Some((_, best_count)) if best_count <= other_count => {}
                _ => best = Some((idx, other_count)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// `send_requests`: round-robins assigned, unchoked downloaders
    /// with capacity, handing each the rarest-in-flight block.
    pub fn send_requests(&mut self, pool: &mut DownloaderPool) {
        loop {
            let mut progressed = false;
            let ids: Vec<_> = self.assignments.keys().copied().collect();
            for id in ids {
                let can_accept = pool
                    .get(&id)
                    .map(|pd| !pd.is_choked() && pd.can_add_request())
                    .unwrap_or(false);
                if !can_accept {
                    continue;
                }
                if let Some(block_idx) = self.best_piece(id) {
                    let info = self.block_info(block_idx);
                    if let Some(pd) = pool.get_mut(&id) {
                        pd.download(info);
                    }
                    self.assignments
                        .get_mut(&id)
                        .unwrap()
                        .in_flight
                        .insert(block_idx);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let nearly_done = self.remaining_blocks() <= 2;
        for id in self.assignments.keys() {
            if let Some(pd) = pool.get_mut(id) {
                pd.set_nearly_done(nearly_done);
            }
        }
    }

    /// Opportunistically issues new requests on all assigned downloaders
    /// that can accept them.
    pub fn update(&mut self, pool: &mut DownloaderPool) {
        self.send_requests(pool);
    }

    /// `piece_received`: validates and stores an incoming block,
    /// running endgame cancel and incremental hashing.
    pub fn piece_received(
        &mut self,
        block: Block,
        contributor: DownloaderId,
        pool: &mut DownloaderPool,
    ) -> PieceOutcome {
        let block_idx = block.info.index_in_chunk();
        let expected_len = block_len(self.chunk_len, block_idx);

        if block_idx >= self.num_blocks
            || block.info.len != expected_len
            || block.data.len() != expected_len as usize
        {
            return PieceOutcome {
                is_needed: false,
                is_complete: false,
            };
        }
        if self.blocks[block_idx].is_some() {
            return PieceOutcome {
                is_needed: false,
                is_complete: false,
            };
        }

        self.last_activity = Instant::now();
        self.blocks[block_idx] = Some(block.data);
        self.contributors.insert(contributor);
        if let Some(assignment) = self.assignments.get_mut(&contributor) {
            assignment.in_flight.remove(&block_idx);
        }

        // endgame cancel: once >1 downloader is assigned, drop every
        // other in-flight copy of this exact block.
        if self.assignments.len() > 1 {
            let others: Vec<_> = self
                .assignments
                .iter()
                .filter(|(id, a)| {
                    **id != contributor && a.in_flight.contains(&block_idx)
                })
                .map(|(id, _)| *id)
                .collect();
            let info = self.block_info(block_idx);
            for id in others {
                if let Some(a) = self.assignments.get_mut(&id) {
                    a.in_flight.remove(&block_idx);
                }
                if let Some(pd) = pool.get_mut(&id) {
                    pd.cancel(info);
                }
            }
        }

        // incremental hashing: fold in any now-contiguous prefix
        while self.next_hash_index < self.num_blocks {
            match &self.blocks[self.next_hash_index] {
                Some(data) => {
                    self.hasher.update(data);
                    self.next_hash_index += 1;
                }
                None => break,
            }
        }

        PieceOutcome {
            is_needed: true,
            is_complete: self.is_complete(),
        }
    }

    /// Finalizes the running SHA-1 over all blocks. Only meaningful once
    /// `is_complete()`; the Downloader is the one that acts on the result
    /// ( failure semantics are the caller's responsibility).
    pub fn finalize_hash(&self) -> Sha1Hash {
        debug_assert_eq!(self.next_hash_index, self.num_blocks);
        let digest = self.hasher.clone().finalize();
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    /// timeout handling: drops the block, emits a cancel, bumps the
    /// timeout counter, and releases the downloader once the counter is
    /// positive *and* more than one downloader is assigned.
    pub fn on_timeout(
        &mut self,
        id: DownloaderId,
        block_idx: usize,
        pool: &mut DownloaderPool,
    ) {
        let should_release = if let Some(assignment) =
            self.assignments.get_mut(&id)
        {
            assignment.in_flight.remove(&block_idx);
            assignment.timeouts += 1;
            assignment.timeouts > 0 && self.assignments.len() > 1
        } else {
            false
        };
        if let Some(pd) = pool.get_mut(&id) {
            pd.cancel(self.block_info(block_idx));
        }
        if should_release {
            self.release(id, pool);
        }
    }

    /// an explicit peer reject unconditionally releases the
    /// downloader from this chunk.
    pub fn on_reject(&mut self, id: DownloaderId, pool: &mut DownloaderPool) {
        self.release(id, pool);
    }

    /// 60s-idle retry check.
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

fn block_info_for(
    chunk_index: ChunkIndex,
    chunk_len: u32,
    block_idx: usize,
) -> BlockInfo {
    BlockInfo {
        chunk_index,
        offset: block_idx as u32 * crate::BLOCK_LEN,
        len: block_len(chunk_len, block_idx),
    }
}
