//! Multi-torrent engine: the top-level registry that owns one `Downloader`
//! per active torrent and drives it on its own tick.
//!
//! Grounded on the reference engine's overall module split (`lib.rs` wires
//! up one task per torrent, talking to the rest of the system over
//! `tokio::sync::mpsc` command/alert channels) and on `peer.rs`'s `run()`
//! loop for the `futures::select!`-over-a-timer-and-a-channel shape. Peer
//! discovery, handshakes, and tracker communication are out of scope and are
//! represented only by the [`PeerSource`] trait boundary below.

use std::{collections::HashMap, sync::Arc};

use futures::{select, FutureExt};
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, UnboundedReceiver, UnboundedSender},
    },
    time::delay_for,
};

use crate::{
    chunk_store::ChunkStore,
    conf::TorrentConf,
    downloader::{Downloader, PeerBroadcast, PieceResult},
    piece_downloader::PieceDownloader,
    wire::Block,
    ChunkIndex, DownloaderId, TorrentId,
};

/// Size of each torrent's HAVE fan-out channel; broad enough that a session
/// which is briefly busy writing to its socket doesn't miss announcements
/// under normal chunk-completion rates.
const HAVE_CHANNEL_CAPACITY: usize = 256;

/// Commands a torrent task accepts over its command channel.
enum Command {
    AddPeer(DownloaderId, Box<dyn PieceDownloader + Send>),
    RemovePeer(DownloaderId),
    Piece(Block, DownloaderId),
    Shutdown,
}

/// A handle a [`PeerSource`] implementation uses to feed newly connected
/// peers into a running torrent, without needing to know about `Command` or
/// any other engine-internal type.
#[derive(Clone)]
pub struct PeerFeed {
    cmd_tx: UnboundedSender<Command>,
    have_tx: broadcast::Sender<ChunkIndex>,
}

impl PeerFeed {
    pub fn add_peer(&self, id: DownloaderId, pd: Box<dyn PieceDownloader + Send>) {
        let _ = self.cmd_tx.send(Command::AddPeer(id, pd));
    }

    pub fn remove_peer(&self, id: DownloaderId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(id));
    }

    /// Delivers a received block to the torrent's downloader. Not part of the
    /// public `PeerSource` surface: a session's own wire loop is the only
    /// caller, since it's the only place a [`Block`] (a wire-level type) ever
    /// comes from.
    pub(crate) fn deliver_piece(&self, block: Block, contributor: DownloaderId) {
        let _ = self.cmd_tx.send(Command::Piece(block, contributor));
    }

    /// Subscribes to this torrent's completed-chunk announcements, so a
    /// session can relay them to its peer as `HAVE` messages.
    pub(crate) fn subscribe_have(&self) -> broadcast::Receiver<ChunkIndex> {
        self.have_tx.subscribe()
    }
}

/// Fans a torrent's chunk completions out to every subscribed peer session as
/// a `HAVE`, and turns a ban into an immediate pool removal.
struct ChannelBroadcast {
    have_tx: broadcast::Sender<ChunkIndex>,
    cmd_tx: UnboundedSender<Command>,
}

impl PeerBroadcast for ChannelBroadcast {
    fn broadcast_have(&self, index: ChunkIndex) {
        let _ = self.have_tx.send(index);
    }

    fn ban(&self, id: DownloaderId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(id));
    }
}

/// Peer discovery, handshakes, and tracker communication are implemented
/// outside this crate; an embedder supplies this trait and is handed a
/// [`PeerFeed`] for every torrent the engine spawns.
pub trait PeerSource: Send + Sync {
    fn attach(&self, torrent: TorrentId, feed: PeerFeed);
}

/// Out-of-band events the engine surfaces to its caller, mirroring the
/// reference engine's per-torrent alert channel.
#[derive(Debug)]
pub enum Alert {
    ChunkVerified(TorrentId, ChunkIndex),
    ChunkFailed(TorrentId, ChunkIndex),
    IoError(TorrentId, String),
    TorrentRemoved(TorrentId),
}

struct TorrentHandle {
    cmd_tx: UnboundedSender<Command>,
}

/// The multi-torrent registry. `S` is the [`ChunkStore`] implementation
/// every spawned torrent uses; an embedder that needs more than one store
/// type runs one `Engine` per concrete type.
pub struct Engine<S: ChunkStore + 'static> {
    torrents: HashMap<TorrentId, TorrentHandle>,
    next_id: TorrentId,
    alert_tx: UnboundedSender<Alert>,
    peer_source: Arc<dyn PeerSource>,
    _store: std::marker::PhantomData<S>,
}

impl<S: ChunkStore + 'static> Engine<S> {
    pub fn new(peer_source: Arc<dyn PeerSource>) -> (Self, UnboundedReceiver<Alert>) {
        let (alert_tx, alert_rx) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                next_id: 0,
                alert_tx,
                peer_source,
                _store: std::marker::PhantomData,
            },
            alert_rx,
        )
    }

    /// Spawns a torrent task owning its own `Downloader`, returning the
    /// `TorrentId` it was assigned. The task ticks the downloader on
    /// `conf.streaming.manager_tick` and otherwise reacts to peer/piece
    /// commands as they arrive.
    pub fn spawn_torrent(
        &mut self,
        store: Arc<S>,
        conf: TorrentConf,
        chunk_count: usize,
    ) -> TorrentId {
        let id = self.next_id;
        self.next_id += 1;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (have_tx, _have_rx) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        self.peer_source.attach(
            id,
            PeerFeed {
                cmd_tx: cmd_tx.clone(),
                have_tx: have_tx.clone(),
            },
        );

        let alert_tx = self.alert_tx.clone();
        let tick = conf.streaming.manager_tick;
        let broadcaster = Box::new(ChannelBroadcast {
            have_tx,
            cmd_tx: cmd_tx.clone(),
        });
        let mut downloader = Downloader::new(store, conf, chunk_count, broadcaster);

        tokio::spawn(async move {
            loop {
                let mut timeout = delay_for(tick).fuse();
                select! {
                    _ = timeout => {
                        downloader.update();
                        downloader.poll_web_seeds().await;
                    }
                    cmd = cmd_rx.recv().fuse() => {
                        match cmd {
                            Some(Command::AddPeer(peer_id, pd)) => {
                                downloader.add_piece_downloader(peer_id, pd);
                            }
                            Some(Command::RemovePeer(peer_id)) => {
                                downloader.remove_piece_downloader(peer_id);
                            }
                            Some(Command::Piece(block, contributor)) => {
                                match downloader.piece_received(block, contributor).await {
                                    Ok(PieceResult::ChunkVerified(index)) => {
                                        let _ = alert_tx.send(Alert::ChunkVerified(id, index));
                                    }
                                    Ok(PieceResult::ChunkFailed(index)) => {
                                        let _ = alert_tx.send(Alert::ChunkFailed(id, index));
                                    }
                                    Ok(_) => {}
                                    Err(e) => {
                                        let _ = alert_tx.send(Alert::IoError(id, e.to_string()));
                                    }
                                }
                            }
                            Some(Command::Shutdown) | None => break,
                        }
                    }
                }
            }
            let _ = alert_tx.send(Alert::TorrentRemoved(id));
        });

        self.torrents.insert(id, TorrentHandle { cmd_tx });
        id
    }

    pub fn add_peer(&self, torrent: TorrentId, id: DownloaderId, pd: Box<dyn PieceDownloader + Send>) {
        if let Some(handle) = self.torrents.get(&torrent) {
            let _ = handle.cmd_tx.send(Command::AddPeer(id, pd));
        }
    }

    pub fn remove_peer(&self, torrent: TorrentId, id: DownloaderId) {
        if let Some(handle) = self.torrents.get(&torrent) {
            let _ = handle.cmd_tx.send(Command::RemovePeer(id));
        }
    }

    pub(crate) fn deliver_piece(&self, torrent: TorrentId, block: Block, contributor: DownloaderId) {
        if let Some(handle) = self.torrents.get(&torrent) {
            let _ = handle.cmd_tx.send(Command::Piece(block, contributor));
        }
    }

    /// Requests that a torrent's task stop. The task finishes whatever
    /// command it is currently handling, then exits and emits
    /// `Alert::TorrentRemoved`.
    pub fn shutdown_torrent(&mut self, torrent: TorrentId) {
        if let Some(handle) = self.torrents.remove(&torrent) {
            let _ = handle.cmd_tx.send(Command::Shutdown);
        }
    }

    pub fn torrent_count(&self) -> usize {
        self.torrents.len()
    }
}

/// Test-only helper for other modules (`peer_session`) that need a
/// throwaway [`PeerFeed`] without spinning up a whole [`Engine`].
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn null_feed() -> PeerFeed {
        let (cmd_tx, _rx) = mpsc::unbounded_channel();
        let (have_tx, _have_rx) = broadcast::channel(HAVE_CHANNEL_CAPACITY);
        PeerFeed { cmd_tx, have_tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::MemoryChunkStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoPeers;
    impl PeerSource for NoPeers {
        fn attach(&self, _torrent: TorrentId, _feed: PeerFeed) {}
    }

    struct CountingPeerSource {
        attached: Arc<AtomicUsize>,
    }
    impl PeerSource for CountingPeerSource {
        fn attach(&self, _torrent: TorrentId, _feed: PeerFeed) {
            self.attached.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_spawn_torrent_registers_and_attaches_peer_source() {
        let attached = Arc::new(AtomicUsize::new(0));
        let source = Arc::new(CountingPeerSource {
            attached: attached.clone(),
        });
        let (mut engine, _alerts) = Engine::<MemoryChunkStore>::new(source);
        let store = Arc::new(MemoryChunkStore::new(16384, 0, 16384, HashMap::new()));
        let mut conf = TorrentConf::new();
        conf.streaming.manager_tick = std::time::Duration::from_millis(50);
        let id = engine.spawn_torrent(store, conf, 1);
        assert_eq!(id, 0);
        assert_eq!(engine.torrent_count(), 1);
        assert_eq!(attached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_torrent_removes_it_from_registry() {
        let (mut engine, mut alerts) = Engine::<MemoryChunkStore>::new(Arc::new(NoPeers));
        let store = Arc::new(MemoryChunkStore::new(16384, 0, 16384, HashMap::new()));
        let mut conf = TorrentConf::new();
        conf.streaming.manager_tick = std::time::Duration::from_millis(20);
        let id = engine.spawn_torrent(store, conf, 1);
        engine.shutdown_torrent(id);
        assert_eq!(engine.torrent_count(), 0);

        let alert = alerts.recv().await;
        assert!(matches!(alert, Some(Alert::TorrentRemoved(_))));
    }
}
