//! This module defines types used to configure the download core and its
//! parts.

use std::time::Duration;

use crate::PeerId;

/// The default client id this crate announces to peers.
pub const SWARMCORE_CLIENT_ID: &PeerId = b"swc-0000000000000000";

/// The global configuration for the download engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults. Uses the default
    /// client id, [`SWARMCORE_CLIENT_ID`].
    pub fn new() -> Self {
        Self {
            engine: EngineConf {
                client_id: *SWARMCORE_CLIENT_ID,
            },
            torrent: TorrentConf::new(),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to peers.
    pub client_id: PeerId,
}

/// Configuration for a single torrent's download core.
///
/// The engine applies a default instance of this to all torrents, but
/// individual torrents may override it.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The max number of connected peer-downloaders the torrent should have.
    pub max_connected_peer_count: usize,

    /// Hard per-request deadline: a request older than this without
    /// a matching block is considered timed out.
    pub request_timeout: Duration,

    /// A [`crate::downloader::Downloader`] considers itself in endgame mode
    /// once active-chunk count reaches remaining-chunk count; this is purely
    /// observable and does not gate any behavior on its own.
    pub endgame_threshold: usize,

    /// Whether bulk-range (HTTP web-seed) sources may be used at all.
    pub use_web_seeds: bool,

    /// The number of consecutive range failures after which a bulk-range
    /// source is skipped for a tick.
    pub web_seed_failure_threshold: usize,

    /// Streaming/VOD-specific tuning. Only consulted when a torrent is
    /// opened with a [`crate::stream::StreamingChunkSelector`].
    pub streaming: StreamingConf,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults.
    pub fn new() -> Self {
        Self {
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host.
            max_connected_peer_count: 50,
            request_timeout: Duration::from_secs(60),
            endgame_threshold: 0,
            use_web_seeds: true,
            web_seed_failure_threshold: 3,
            streaming: StreamingConf::new(),
        }
    }
}

impl Default for TorrentConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning constants for the streaming chunk selector and stream manager.
#[derive(Clone, Copy, Debug)]
pub struct StreamingConf {
    /// Target number of seconds of playback the `BufferRequired` window
    /// should cover.
    pub seconds_in_buffer_required: u32,
    /// Floor on the number of chunks in `BufferRequired`, regardless of
    /// playback speed.
    pub min_chunks_buffer_required: u32,
    /// Fixed length, in chunks, of `BufferPreferred`.
    pub buffer_preferred_len: u32,
    /// Bandwidth reserve (bytes/sec) kept when estimating whether a
    /// reassignment would satisfy a chunk's deadline.
    pub speed_reserve: u64,
    /// How often the `StreamManager` reassignment loop runs.
    pub manager_tick: Duration,
    /// Assumed playback duration of a chunk before any real measurement is
    /// available.
    pub initial_chunk_play_time: Duration,
}

impl StreamingConf {
    pub fn new() -> Self {
        Self {
            seconds_in_buffer_required: 10,
            min_chunks_buffer_required: 3,
            buffer_preferred_len: 10,
            speed_reserve: 20 * 1024,
            manager_tick: Duration::from_millis(2000),
            initial_chunk_play_time: Duration::from_millis(1000),
        }
    }
}

impl Default for StreamingConf {
    fn default() -> Self {
        Self::new()
    }
}
