use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime tunables for the playback coordinator.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Cap on downloads running at once across all chats.
    pub max_concurrent_downloads: usize,
    /// Percent, 100 = unity gain.
    pub default_volume: u16,
    /// How long a finished item's cached file sticks around before deletion.
    pub cleanup_delay: Duration,
    pub download_dir: PathBuf,
    pub download_retries: u32,
    pub audio_bitrate: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 10,
            default_volume: 100,
            cleanup_delay: Duration::from_secs(300),
            download_dir: env::temp_dir().join("voxtune_downloads"),
            download_retries: 3,
            audio_bitrate: 48_000,
        }
    }
}
