//! Top-level per-torrent coordinator.
//!
//! Grounded on `examples/original_source/src/download/downloader.{h,cpp}`:
//! owns the pool of piece-downloaders and the set of active `ChunkDownload`s,
//! drives the per-tick update, routes inbound pieces through hash
//! verification, and manages bulk-range sources. Re-expressed in the
//! reference engine's ownership idiom: the downloader pool lives here
//! directly, and chunk downloads address it through the `DownloaderPool`
//! handle map from `chunk_download.rs`.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use crate::{
    bulk_source::WebSeedSource,
    chunk_download::{ChunkDownload, DownloaderPool},
    chunk_selector::{ChunkSelector, Priority},
    chunk_store::{verify_chunk_blocking, ChunkStatus, ChunkStore},
    conf::TorrentConf,
    error::Result,
    piece_downloader::PieceDownloader,
    wire::Block,
    ChunkIndex, DownloaderId,
};

/// Hook the `Downloader` calls out to the peer layer through. Peer
/// discovery, handshakes, and tracker communication are out of scope for
/// this crate; callers inject an implementation that knows how to reach
/// connected peers.
pub(crate) trait PeerBroadcast: Send + Sync {
    fn broadcast_have(&self, index: ChunkIndex);
    fn ban(&self, id: DownloaderId);
}

/// A no-op broadcaster, useful for tests and for torrents with no
/// connected peers yet.
pub(crate) struct NullBroadcast;

impl PeerBroadcast for NullBroadcast {
    fn broadcast_have(&self, _index: ChunkIndex) {}
    fn ban(&self, _id: DownloaderId) {}
}

/// The outcome of routing an inbound `PIECE` message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PieceResult {
    /// The block was absorbed but the chunk isn't complete yet.
    Accepted,
    /// The block didn't correspond to any active chunk download.
    Unsolicited,
    /// The chunk completed and passed hash verification.
    ChunkVerified(ChunkIndex),
    /// The chunk completed but failed hash verification; it has been reset
    /// and reinserted into the selector.
    ChunkFailed(ChunkIndex),
}

/// Owns the active chunk downloads and the piece-downloader pool for one
/// torrent.
pub(crate) struct Downloader<S: ChunkStore> {
    store: Arc<S>,
    conf: TorrentConf,
    pool: DownloaderPool,
    active: HashMap<ChunkIndex, ChunkDownload>,
    selector: ChunkSelector,
    web_seeds: Vec<WebSeedSource>,
    broadcast: Box<dyn PeerBroadcast>,
    chunk_count: usize,
    /// Chunks currently covered by an in-flight web-seed range. Consulted by
    /// `piece_received`'s failure path so a peer-backed `ChunkDownload`
    /// racing the same chunk doesn't reset a store write the bulk source may
    /// be about to commit.
    bulk_active: HashSet<ChunkIndex>,
}

impl<S: ChunkStore> Downloader<S> {
    pub fn new(
        store: Arc<S>,
        conf: TorrentConf,
        chunk_count: usize,
        broadcast: Box<dyn PeerBroadcast>,
    ) -> Self {
        Self {
            store,
            conf,
            pool: HashMap::new(),
            active: HashMap::new(),
            selector: ChunkSelector::new(chunk_count),
            web_seeds: Vec::new(),
            broadcast,
            chunk_count,
            bulk_active: HashSet::new(),
        }
    }

    pub fn selector_mut(&mut self) -> &mut ChunkSelector {
        &mut self.selector
    }

    pub fn add_piece_downloader(&mut self, id: DownloaderId, pd: Box<dyn PieceDownloader + Send>) {
        self.pool.insert(id, pd);
    }

    pub fn remove_piece_downloader(&mut self, id: DownloaderId) {
        self.pool.remove(&id);
        for cd in self.active.values_mut() {
            cd.release(id, &mut self.pool);
        }
    }

    pub fn add_web_seed(&mut self, url: String) {
        if self.conf.use_web_seeds {
            self.web_seeds.push(WebSeedSource::new(url));
        }
    }

    fn assignee_counts(&self) -> HashMap<ChunkIndex, usize> {
        self.active
            .iter()
            .map(|(&i, cd)| (i, cd.assignee_count()))
            .collect()
    }

    fn statuses(&self) -> HashMap<ChunkIndex, ChunkStatus> {
        (0..self.chunk_count)
            .map(|i| (i, self.store.status(i)))
            .collect()
    }

    /// `download_from`: asks the selector for a chunk for `pd`, assigning it
    /// to an existing or freshly created `ChunkDownload`, with a
    /// `select_worst` fallback for an unassigned downloader that found no
    /// selector candidate.
    pub fn download_from(&mut self, pd_id: DownloaderId) {
        let statuses = self.statuses();
        let assignee_counts = self.assignee_counts();

        let chosen = match self.pool.get(&pd_id) {
            Some(pd) => self.selector.select(pd.as_ref(), &statuses, &assignee_counts),
            None => return,
        };

        if let Some(index) = chosen {
            self.assign_to_chunk(index, pd_id);
            return;
        }

        let is_unassigned = self
            .pool
            .get(&pd_id)
            .map(|pd| pd.grab_count() == 0)
            .unwrap_or(false);
        if !is_unassigned {
            return;
        }

        if let Some(worst) = self.select_worst(pd_id) {
            self.active
                .get_mut(&worst)
                .unwrap()
                .assign(pd_id, &mut self.pool);
        }
    }

    fn assign_to_chunk(&mut self, index: ChunkIndex, pd_id: DownloaderId) {
        let chunk_len = self.store.chunk_len(index);
        let cd = self
            .active
            .entry(index)
            .or_insert_with(|| ChunkDownload::new(index, chunk_len));
        cd.assign(pd_id, &mut self.pool);
    }

    /// Picks the active chunk `pd` possesses but isn't assigned to, that has
    /// the lowest combined download speed among its past contributors, tie
    /// broken by fewest assignees.
    fn select_worst(&self, pd_id: DownloaderId) -> Option<ChunkIndex> {
        let pd = self.pool.get(&pd_id)?;
        let mut best: Option<(ChunkIndex, f64, usize)> = None;
        for (&index, cd) in &self.active {
            if cd.is_assigned(pd_id) || !pd.has_chunk(index) {
                continue;
            }
            let speed: f64 = cd
                .contributors()
                .iter()
                .filter_map(|id| self.pool.get(id))
                .map(|pd| pd.download_rate())
                .sum();
            let assignees = cd.assignee_count();
            let better = match best {
                None => true,
                Some((_, best_speed, best_assignees)) => {
                    speed < best_speed || (speed == best_speed && assignees < best_assignees)
                }
            };
            if better {
                best = Some((index, speed, assignees));
            }
        }
        best.map(|(index, _, _)| index)
    }

    /// `piece_received`: routes the block, verifies a completed chunk's
    /// hash, and updates store/selector/broadcast state accordingly.
    pub async fn piece_received(
        &mut self,
        block: Block,
        contributor: DownloaderId,
    ) -> Result<PieceResult> {
        let index = block.info.chunk_index;
        if !self.active.contains_key(&index) {
            return Ok(PieceResult::Unsolicited);
        }

        self.store
            .write_block(index, block.info.offset, block.data.clone())?;
        let outcome =
            self.active
                .get_mut(&index)
                .unwrap()
                .piece_received(block, contributor, &mut self.pool);
        if !outcome.is_needed {
            return Ok(PieceResult::Unsolicited);
        }
        if !outcome.is_complete {
            return Ok(PieceResult::Accepted);
        }

        let hash = self.active.get(&index).unwrap().finalize_hash();
        let expected = self.store.expected_hash(index);

        let mut cd = self.active.remove(&index).unwrap();
        if hash == expected {
            self.store.commit(index);
            self.broadcast.broadcast_have(index);
            Ok(PieceResult::ChunkVerified(index))
        } else {
            // A web-seed range covering this chunk may be about to commit
            // it; don't reset the store out from under that write.
            if !self.bulk_active.contains(&index) {
                self.store.reset(index);
            }
            self.selector.reinsert(index);
            let contributors = cd.contributors().clone();
            if contributors.len() == 1 {
                self.broadcast.ban(*contributors.iter().next().unwrap());
            }
            cd.release_all(&mut self.pool);
            Ok(PieceResult::ChunkFailed(index))
        }
    }

    /// True iff active-chunk count has reached remaining-chunk count in the
    /// store; a purely observable endgame signal.
    pub fn endgame_mode(&self) -> bool {
        let remaining = (0..self.chunk_count)
            .filter(|&i| self.store.status(i) != ChunkStatus::OnDisk)
            .count();
        self.active.len() >= remaining
    }

    /// Per-tick update: releases chunk downloads that have gone quiet past
    /// the request timeout, nudges the rest to issue any new requests their
    /// assignees now have room for, then lets every piece-downloader with
    /// spare capacity pull new work.
    pub fn update(&mut self) {
        let stall_timeout = self.conf.request_timeout;
        let stalled: Vec<_> = self
            .active
            .iter()
            .filter(|(_, cd)| cd.assignee_count() > 0 && cd.is_stalled(stall_timeout))
            .map(|(&i, _)| i)
            .collect();
        for index in stalled {
            let cd = self.active.get_mut(&index).unwrap();
            cd.cancel_all(&mut self.pool);
            cd.release_all(&mut self.pool);
        }

        let active_ids: Vec<_> = self.active.keys().copied().collect();
        for index in active_ids {
            self.active.get_mut(&index).unwrap().update(&mut self.pool);
        }

        let pd_ids: Vec<_> = self.pool.keys().copied().collect();
        for pd_id in pd_ids {
            loop {
                let can_download = match self.pool.get(&pd_id) {
                    Some(pd) => !pd.is_choked() && pd.can_download_chunk(),
                    None => break,
                };
                if !can_download {
                    break;
                }
                let before_grab = self.pool[&pd_id].grab_count();
                let before_active = self.active.len();
                self.download_from(pd_id);
                let after_grab = self.pool[&pd_id].grab_count();
                if after_grab == before_grab && self.active.len() == before_active {
                    break;
                }
            }
        }
    }

    /// Drives every enabled web-seed source over the next eligible range,
    /// excluding it from peer-driven selection while in flight so the two
    /// sources don't duplicate work; on success the chunks are committed
    /// straight to the store, on failure the range is reincluded.
    pub async fn poll_web_seeds(&mut self) {
        if !self.conf.use_web_seeds || self.chunk_count == 0 {
            return;
        }
        let last_index = self.chunk_count - 1;
        let chunk_len = self.store.chunk_len(0);
        let last_chunk_len = self.store.chunk_len(last_index);
        let threshold = self.conf.web_seed_failure_threshold;

        for seed_idx in 0..self.web_seeds.len() {
            if self.web_seeds[seed_idx].is_disabled() {
                continue;
            }
            let statuses = self.statuses();
            let range = self.selector.select_range(&statuses, 4);
            let (from, to) = match range {
                Some(r) => r,
                None => continue,
            };

            for i in from..=to {
                self.selector.set_priority(i, Priority::Excluded);
                self.bulk_active.insert(i);
            }

            let (tx, mut rx) = tokio::sync::mpsc::channel(to - from + 2);
            let result = self.web_seeds[seed_idx]
                .fetch_range(from, to, chunk_len, last_chunk_len, last_index, tx)
                .await;

            match result {
                Ok(()) => {
                    self.web_seeds[seed_idx].note_success();
                    while let Ok(ready) = rx.try_recv() {
                        let expected = self.store.expected_hash(ready.index);
                        if verify_chunk_blocking(ready.data.clone(), expected).await {
                            if self
                                .store
                                .write_block(ready.index, 0, ready.data)
                                .is_ok()
                            {
                                self.store.commit(ready.index);
                                self.broadcast.broadcast_have(ready.index);
                                // The bulk source beat any peer-backed
                                // download of the same chunk to completion;
                                // discard it rather than let it keep
                                // requesting blocks for a chunk already on
                                // disk.
                                if let Some(mut cd) = self.active.remove(&ready.index) {
                                    cd.cancel_all(&mut self.pool);
                                    cd.release_all(&mut self.pool);
                                }
                            }
                        } else {
                            self.store.reset(ready.index);
                            self.selector.reincluded(ready.index, ready.index);
                        }
                        self.bulk_active.remove(&ready.index);
                    }
                }
                Err(_) => {
                    self.web_seeds[seed_idx].note_failure(threshold);
                    self.selector.reincluded(from, to);
                    for i in from..=to {
                        self.bulk_active.remove(&i);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::MemoryChunkStore;
    use crate::piece_downloader::PeerDownloader;
    use crate::BlockInfo;

    fn make_downloader(chunk_len: u32, chunk_count: usize) -> Downloader<MemoryChunkStore> {
        let mut hashes = HashMap::new();
        for i in 0..chunk_count {
            hashes.insert(i, [0u8; 20]);
        }
        let store = Arc::new(MemoryChunkStore::new(
            chunk_len,
            chunk_count - 1,
            chunk_len,
            hashes,
        ));
        Downloader::new(store, TorrentConf::new(), chunk_count, Box::new(NullBroadcast))
    }

    #[tokio::test]
    async fn test_piece_received_unsolicited_without_active_download() {
        let mut dl = make_downloader(crate::BLOCK_LEN, 2);
        let block = Block {
            info: BlockInfo {
                chunk_index: 0,
                offset: 0,
                len: crate::BLOCK_LEN,
            },
            data: vec![0; crate::BLOCK_LEN as usize],
        };
        let result = dl.piece_received(block, 1).await.unwrap();
        assert_eq!(result, PieceResult::Unsolicited);
    }

    #[tokio::test]
    async fn test_piece_received_completes_and_fails_hash() {
        let mut dl = make_downloader(crate::BLOCK_LEN, 1);
        let mut pd = PeerDownloader::new(1, 1, 50);
        pd.set_choked(false);
        pd.set_has_chunk(0, true);
        dl.add_piece_downloader(1, Box::new(pd));
        dl.download_from(1);

        let block = Block {
            info: BlockInfo {
                chunk_index: 0,
                offset: 0,
                len: crate::BLOCK_LEN,
            },
            data: vec![1; crate::BLOCK_LEN as usize],
        };
        let result = dl.piece_received(block, 1).await.unwrap();
        // the store was seeded with an all-zero expected hash, so a
        // non-empty chunk's SHA-1 will never match.
        assert_eq!(result, PieceResult::ChunkFailed(0));
    }

    #[test]
    fn test_download_from_creates_chunk_and_assigns() {
        let mut dl = make_downloader(crate::BLOCK_LEN, 2);
        let mut pd = PeerDownloader::new(1, 2, 50);
        pd.set_choked(false);
        pd.set_has_chunk(0, true);
        dl.add_piece_downloader(1, Box::new(pd));
        dl.download_from(1);
        assert!(dl.active.contains_key(&0));
        assert!(dl.active[&0].is_assigned(1));
    }

    #[test]
    fn test_endgame_mode_true_when_all_remaining_chunks_active() {
        let mut dl = make_downloader(crate::BLOCK_LEN, 1);
        let mut pd = PeerDownloader::new(1, 1, 50);
        pd.set_choked(false);
        pd.set_has_chunk(0, true);
        dl.add_piece_downloader(1, Box::new(pd));
        dl.download_from(1);
        assert!(dl.endgame_mode());
    }
}
