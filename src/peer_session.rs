//! Per-connection wire I/O for an already handshaked peer.
//!
//! Handshake, availability exchange, and everything peer-discovery-related
//! are out of scope here (an embedder's [`crate::engine::PeerSource`] owns
//! that); this module only drives the steady-state message loop of a live
//! connection. Grounded on `cratetorrent/src/peer.rs`'s `run()` loop: split
//! sink/stream, `futures::select!` over incoming messages and a timer,
//! per-message dispatch. Unlike the reference session, request pacing isn't
//! driven inline by a piece-picker call; it's read off the shared
//! [`SharedPeerDownloader`]'s own queue, since that queue is also how the
//! torrent's `Downloader` assigns and cancels work for this peer.

use std::time::Duration;

use futures::{select, FutureExt, SinkExt, StreamExt};
use tokio::{net::TcpStream, time::delay_for};
use tokio_util::codec::Framed;

use crate::{
    engine::PeerFeed,
    piece_downloader::{PeerDownloader, PieceDownloader, SharedPeerDownloader},
    wire::{Message, MessageCodec},
    ChunkIndex, DownloaderId,
};

/// How often the session flushes `PeerDownloader`'s newly queued requests
/// onto the wire, independent of message arrival.
const REQUEST_FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Spawns the wire I/O task for a single already-handshaked peer connection.
///
/// Registers a [`SharedPeerDownloader`] with `feed` under `id` so the
/// torrent's `Downloader` can assign and cancel requests through it, then
/// drives the socket until it closes, errors, or the torrent removes the
/// peer.
pub fn spawn(
    socket: Framed<TcpStream, MessageCodec>,
    id: DownloaderId,
    chunk_count: usize,
    peer_reqq: usize,
    feed: PeerFeed,
) {
    let shared = SharedPeerDownloader::new(PeerDownloader::new(id, chunk_count, peer_reqq));
    feed.add_peer(id, Box::new(shared.clone()));

    tokio::spawn(async move {
        run(socket, id, shared, feed.clone()).await;
        feed.remove_peer(id);
    });
}

async fn run(
    socket: Framed<TcpStream, MessageCodec>,
    id: DownloaderId,
    shared: SharedPeerDownloader,
    feed: PeerFeed,
) {
    let (mut sink, stream) = socket.split();
    let mut stream = stream.fuse();
    let mut have_rx = feed.subscribe_have();

    loop {
        let mut flush = delay_for(REQUEST_FLUSH_INTERVAL).fuse();
        select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(msg)) => handle_message(msg, &shared, &feed),
                    Some(Err(e)) => {
                        log::warn!("peer {} session error: {}", id, e);
                        return;
                    }
                    None => return,
                }
            }
            have = have_rx.recv().fuse() => {
                // a lagged receiver just means we missed some HAVEs under
                // load; the next bitfield-equivalent (full HAVE backlog from
                // a slow peer) isn't modeled, so we simply resume.
                if let Ok(index) = have {
                    if sink.send(Message::Have(index)).await.is_err() {
                        return;
                    }
                }
            }
            _ = flush => {}
        }

        let pending = shared.lock().take_pending_sends();
        for info in pending {
            if sink.send(Message::Request(info)).await.is_err() {
                return;
            }
        }
    }
}

fn handle_message(msg: Message, shared: &SharedPeerDownloader, feed: &PeerFeed) {
    match msg {
        Message::Choke => shared.lock().set_choked(true),
        Message::Unchoke => shared.lock().set_choked(false),
        Message::Have(index) => shared.lock().set_has_chunk(index, true),
        Message::HaveAll => set_all_chunks(shared, true),
        Message::HaveNone => set_all_chunks(shared, false),
        Message::Bitfield(bitfield) => {
            let mut pd = shared.lock();
            for index in 0..bitfield.len() {
                let has = bitfield.get(index).map(|b| *b).unwrap_or(false);
                pd.set_has_chunk(index, has);
            }
        }
        Message::Piece(block) => {
            let mut pd = shared.lock();
            if pd.try_match_incoming(block.info) {
                pd.record_download(block.info.len as u64);
                let id = pd.id();
                drop(pd);
                feed.deliver_piece(block, id);
            }
        }
        // keep-alive, interest announcements and fast-extension variants we
        // don't act on yet (we never seed, so requests/rejects aimed at us
        // are simply ignored).
        _ => {}
    }
}

fn set_all_chunks(shared: &SharedPeerDownloader, has: bool) {
    let mut pd = shared.lock();
    let count = pd.chunk_count();
    for index in 0..count {
        pd.set_has_chunk(index as ChunkIndex, has);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece_downloader::PieceDownloader;

    #[test]
    fn test_handle_choke_unchoke() {
        let shared = SharedPeerDownloader::new(PeerDownloader::new(1, 4, 50));
        assert!(shared.lock().is_choked());
        let feed = test_feed();
        handle_message(Message::Unchoke, &shared, &feed);
        assert!(!shared.lock().is_choked());
        handle_message(Message::Choke, &shared, &feed);
        assert!(shared.lock().is_choked());
    }

    #[test]
    fn test_handle_have_sets_single_chunk() {
        let shared = SharedPeerDownloader::new(PeerDownloader::new(1, 4, 50));
        let feed = test_feed();
        assert!(!shared.has_chunk(2));
        handle_message(Message::Have(2), &shared, &feed);
        assert!(shared.has_chunk(2));
        assert!(!shared.has_chunk(0));
    }

    #[test]
    fn test_handle_have_all() {
        let shared = SharedPeerDownloader::new(PeerDownloader::new(1, 4, 50));
        let feed = test_feed();
        handle_message(Message::HaveAll, &shared, &feed);
        for i in 0..4 {
            assert!(shared.has_chunk(i));
        }
    }

    fn test_feed() -> PeerFeed {
        crate::engine::test_support::null_feed()
    }
}
