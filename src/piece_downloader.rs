//! The `PieceDownloader` abstract contract and its peer-backed
//! implementation.
//!
//! Grounded on `examples/original_source/src/peer/peerdownloader.{h,cpp}`
//! for the request-queueing/timeout/rate-cap algorithm, embedded in the
//! reference engine's async task shape (`cratetorrent/src/peer.rs`: status
//! struct, command channel).

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use crate::{block_count, BlockInfo, Bitfield, ChunkIndex, DownloaderId};

/// A request that has been emitted on the wire, timestamped so timeouts can
/// be detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct InFlightRequest {
    pub info: BlockInfo,
    pub requested_at: Instant,
}

/// The tagged-variant contract shared by peer-backed and bulk-range
/// downloaders. No inheritance is required; both variants expose
/// the same operations and observable state.
pub trait PieceDownloader {
    /// Stable identity within the owning pool.
    fn id(&self) -> DownloaderId;

    /// Whether this handle still refers to a live underlying source.
    fn is_null(&self) -> bool;

    /// Enqueues `req`, buffering in the wait-queue if at the in-flight cap.
    fn download(&mut self, req: BlockInfo);

    /// Removes `req` from the wait-queue, else emits a cancel and drops it
    /// from in-flight.
    fn cancel(&mut self, req: BlockInfo);

    /// Cancels everything outstanding, clearing both queues.
    fn cancel_all(&mut self);

    /// Whether this source's availability bitmap includes `index`.
    fn has_chunk(&self, index: ChunkIndex) -> bool;

    /// Wait-queue not at cap.
    fn can_add_request(&self) -> bool;

    /// Not null, under its grab-count cap (or nearly done), and has wait
    /// queue capacity.
    fn can_download_chunk(&self) -> bool;

    /// Expires in-flight requests older than the timeout, returning the
    /// expired ones so the caller (ChunkDownload) can react.
    fn check_timeouts(&mut self, timeout: Duration) -> Vec<BlockInfo>;

    /// Current in-flight count, used for round-robin fairness in
    /// `ChunkDownload::send_requests`.
    fn in_flight_count(&self) -> usize;

    /// Number of chunks currently grabbed (assigned) to this downloader.
    fn grab_count(&self) -> usize;

    fn grab(&mut self);
    fn release(&mut self);

    fn is_choked(&self) -> bool;

    fn is_nearly_done(&self) -> bool;
    fn set_nearly_done(&mut self, nearly_done: bool);

    /// Average download rate in bytes/sec, used by rate-adaptive caps and by
    /// the StreamManager's bandwidth estimates.
    fn download_rate(&self) -> f64;

    /// rate-adaptive cap.
    fn max_chunk_downloads(&self, blocks_per_chunk: usize) -> usize {
        max_chunk_downloads(self.download_rate(), blocks_per_chunk)
    }
}

/// `max_chunk_downloads()` adapts to rate: with `kbs = rate_bytes /
/// 1024` and `extra = kbs / 25`, if blocks-per-chunk >= 16 return `1 +
/// 16*extra / blocks_per_chunk` else `1 + (16 / blocks_per_chunk) * extra`.
pub(crate) fn max_chunk_downloads(rate_bytes: f64, blocks_per_chunk: usize) -> usize {
    let kbs = rate_bytes / 1024.0;
    let extra = kbs / 25.0;
    let blocks_per_chunk = blocks_per_chunk.max(1) as f64;
    let value = if blocks_per_chunk >= 16.0 {
        1.0 + (16.0 * extra) / blocks_per_chunk
    } else {
        1.0 + (16.0 / blocks_per_chunk) * extra
    };
    value.floor().max(1.0) as usize
}

/// internal in-flight cap, `min(1 + ceil(10 * rate_MiB/s),
/// peer_declared_reqq)`.
fn max_in_flight(rate_bytes: f64, peer_reqq: usize) -> usize {
    let rate_mibs = rate_bytes / (1024.0 * 1024.0);
    let cap = 1 + (10.0 * rate_mibs).ceil() as usize;
    cap.min(peer_reqq.max(1))
}

/// wait-queue cap, `2 * max`, floored at 10.
fn wait_queue_cap(max_in_flight: usize) -> usize {
    (2 * max_in_flight).max(10)
}

/// A peer-backed [`PieceDownloader`]: one TCP connection speaking the wire
/// protocol.
pub struct PeerDownloader {
    id: DownloaderId,
    null: bool,
    wait_queue: VecDeque<BlockInfo>,
    in_flight: Vec<InFlightRequest>,
    availability: Bitfield,
    choked: bool,
    nearly_done: bool,
    grab_count: usize,
    peer_reqq: usize,
    bytes_downloaded: u64,
    rate_window_start: Instant,
    rate_bytes_in_window: u64,
    download_rate: f64,
    /// Requests moved from the wait queue into `in_flight` since the last
    /// [`Self::take_pending_sends`] call, i.e. not yet written to the wire.
    pending_sends: Vec<BlockInfo>,
}

impl PeerDownloader {
    pub fn new(id: DownloaderId, chunk_count: usize, peer_reqq: usize) -> Self {
        Self {
            id,
            null: false,
            wait_queue: VecDeque::new(),
            in_flight: Vec::new(),
            availability: Bitfield::repeat(false, chunk_count),
            choked: true,
            nearly_done: false,
            grab_count: 0,
            peer_reqq: peer_reqq.max(1),
            bytes_downloaded: 0,
            rate_window_start: Instant::now(),
            rate_bytes_in_window: 0,
            download_rate: 0.0,
            pending_sends: Vec::new(),
        }
    }

    /// Drains and returns the requests that became in-flight since the last
    /// call, for a session's wire loop to actually write out as `Request`
    /// messages.
    pub fn take_pending_sends(&mut self) -> Vec<BlockInfo> {
        std::mem::take(&mut self.pending_sends)
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    pub fn set_has_chunk(&mut self, index: ChunkIndex, has: bool) {
        if index < self.availability.len() {
            self.availability.set(index, has);
        }
    }

    /// The torrent's total chunk count, as this downloader's availability
    /// bitmap was sized with.
    pub fn chunk_count(&self) -> usize {
        self.availability.len()
    }

    /// Records a successful block delivery for rate estimation purposes.
    pub fn record_download(&mut self, bytes: u64) {
        self.bytes_downloaded += bytes;
        self.rate_bytes_in_window += bytes;
        let elapsed = self.rate_window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            self.download_rate =
                self.rate_bytes_in_window as f64 / elapsed.as_secs_f64();
            self.rate_bytes_in_window = 0;
            self.rate_window_start = Instant::now();
        }
    }

    /// Matches an incoming block payload against the head of the in-flight
    /// queue; returns true if it was expected.
    pub fn try_match_incoming(&mut self, info: BlockInfo) -> bool {
        if let Some(pos) = self.in_flight.iter().position(|r| r.info == info) {
            self.in_flight.remove(pos);
            self.drain_wait_queue();
            true
        } else {
            false
        }
    }

    fn max_in_flight(&self) -> usize {
        max_in_flight(self.download_rate, self.peer_reqq)
    }

    fn drain_wait_queue(&mut self) {
        while self.in_flight.len() < self.max_in_flight() {
            if let Some(req) = self.wait_queue.pop_front() {
                self.in_flight.push(InFlightRequest {
                    info: req,
                    requested_at: Instant::now(),
                });
                self.pending_sends.push(req);
            } else {
                break;
            }
        }
    }
}

impl PieceDownloader for PeerDownloader {
    fn id(&self) -> DownloaderId {
        self.id
    }

    fn is_null(&self) -> bool {
        self.null
    }

    fn download(&mut self, req: BlockInfo) {
        if self.null {
            return;
        }
        self.wait_queue.push_back(req);
        self.drain_wait_queue();
    }

    fn cancel(&mut self, req: BlockInfo) {
        if let Some(pos) = self.wait_queue.iter().position(|r| *r == req) {
            self.wait_queue.remove(pos);
            return;
        }
        self.in_flight.retain(|r| r.info != req);
        self.drain_wait_queue();
    }

    fn cancel_all(&mut self) {
        self.wait_queue.clear();
        self.in_flight.clear();
    }

    fn has_chunk(&self, index: ChunkIndex) -> bool {
        self.availability
            .get(index)
            .map(|b| *b)
            .unwrap_or(false)
    }

    fn can_add_request(&self) -> bool {
        self.wait_queue.len() < wait_queue_cap(self.max_in_flight())
    }

    fn can_download_chunk(&self) -> bool {
        !self.null
            && (self.grab_count < self.max_chunk_downloads(block_count(crate::BLOCK_LEN))
                || self.nearly_done)
            && self.can_add_request()
    }

    fn check_timeouts(&mut self, timeout: Duration) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.in_flight.retain(|r| {
            if now.duration_since(r.requested_at) >= timeout {
                expired.push(r.info);
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            self.drain_wait_queue();
        }
        expired
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn grab_count(&self) -> usize {
        self.grab_count
    }

    fn grab(&mut self) {
        self.grab_count += 1;
    }

    fn release(&mut self) {
        self.grab_count = self.grab_count.saturating_sub(1);
    }

    fn is_choked(&self) -> bool {
        self.choked
    }

    fn is_nearly_done(&self) -> bool {
        self.nearly_done
    }

    fn set_nearly_done(&mut self, nearly_done: bool) {
        self.nearly_done = nearly_done;
    }

    fn download_rate(&self) -> f64 {
        self.download_rate
    }
}

/// A [`PeerDownloader`] shared between the `Downloader`'s pool (which only
/// enqueues/cancels requests) and a peer session's wire loop (which actually
/// flushes the queue onto the socket and records incoming blocks). A plain
/// `std::sync::Mutex` is enough since every method is a short, non-blocking
/// field update with no `.await` while held.
#[derive(Clone)]
pub struct SharedPeerDownloader(std::sync::Arc<std::sync::Mutex<PeerDownloader>>);

impl SharedPeerDownloader {
    pub fn new(inner: PeerDownloader) -> Self {
        Self(std::sync::Arc::new(std::sync::Mutex::new(inner)))
    }

    pub fn lock(&self) -> std::sync::MutexGuard<'_, PeerDownloader> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PieceDownloader for SharedPeerDownloader {
    fn id(&self) -> DownloaderId {
        self.lock().id()
    }
    fn is_null(&self) -> bool {
        self.lock().is_null()
    }
    fn download(&mut self, req: BlockInfo) {
        self.lock().download(req)
    }
    fn cancel(&mut self, req: BlockInfo) {
        self.lock().cancel(req)
    }
    fn cancel_all(&mut self) {
        self.lock().cancel_all()
    }
    fn has_chunk(&self, index: ChunkIndex) -> bool {
        self.lock().has_chunk(index)
    }
    fn can_add_request(&self) -> bool {
        self.lock().can_add_request()
    }
    fn can_download_chunk(&self) -> bool {
        self.lock().can_download_chunk()
    }
    fn check_timeouts(&mut self, timeout: Duration) -> Vec<BlockInfo> {
        self.lock().check_timeouts(timeout)
    }
    fn in_flight_count(&self) -> usize {
        self.lock().in_flight_count()
    }
    fn grab_count(&self) -> usize {
        self.lock().grab_count()
    }
    fn grab(&mut self) {
        self.lock().grab()
    }
    fn release(&mut self) {
        self.lock().release()
    }
    fn is_choked(&self) -> bool {
        self.lock().is_choked()
    }
    fn is_nearly_done(&self) -> bool {
        self.lock().is_nearly_done()
    }
    fn set_nearly_done(&mut self, nearly_done: bool) {
        self.lock().set_nearly_done(nearly_done)
    }
    fn download_rate(&self) -> f64 {
        self.lock().download_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(i: ChunkIndex, offset: u32) -> BlockInfo {
        BlockInfo {
            chunk_index: i,
            offset,
            len: crate::BLOCK_LEN,
        }
    }

    #[test]
    fn test_max_chunk_downloads_monotone_in_rate() {
        // P8: non-decreasing in rate.
        let a = max_chunk_downloads(0.0, 4);
        let b = max_chunk_downloads(25.0 * 1024.0, 4);
        let c = max_chunk_downloads(250.0 * 1024.0, 4);
        assert!(a <= b);
        assert!(b <= c);
    }

    #[test]
    fn test_download_enqueues_and_cancel_all_clears() {
        let mut pd = PeerDownloader::new(1, 4, 50);
        pd.download(block(0, 0));
        pd.download(block(0, crate::BLOCK_LEN));
        assert!(pd.in_flight_count() > 0 || !pd.wait_queue.is_empty());
        pd.cancel_all();
        assert_eq!(pd.in_flight_count(), 0);
        assert!(pd.wait_queue.is_empty());
    }

    #[test]
    fn test_check_timeouts_expires_old_requests() {
        let mut pd = PeerDownloader::new(1, 4, 50);
        pd.download(block(0, 0));
        // not timed out yet with a generous timeout
        assert!(pd.check_timeouts(Duration::from_secs(60)).is_empty());
        // with a zero timeout everything in flight is immediately expired
        let expired = pd.check_timeouts(Duration::from_secs(0));
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_try_match_incoming() {
        let mut pd = PeerDownloader::new(1, 4, 50);
        let req = block(0, 0);
        pd.download(req);
        assert!(pd.try_match_incoming(req));
        // matching again fails, it's no longer in flight
        assert!(!pd.try_match_incoming(req));
    }

    #[test]
    fn test_take_pending_sends_drains_once() {
        let mut pd = PeerDownloader::new(1, 4, 50);
        pd.download(block(0, 0));
        pd.download(block(0, crate::BLOCK_LEN));
        let pending = pd.take_pending_sends();
        assert_eq!(pending.len(), 2);
        assert!(pd.take_pending_sends().is_empty());
    }

    #[test]
    fn test_shared_peer_downloader_delegates() {
        let mut shared = SharedPeerDownloader::new(PeerDownloader::new(7, 4, 50));
        assert_eq!(shared.id(), 7);
        shared.download(block(0, 0));
        assert!(shared.lock().in_flight_count() > 0);
    }
}
