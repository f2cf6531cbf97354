use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::dto::stream_event::StreamEvent;

mod yt_dlp;

pub use yt_dlp::YtDlpProvider;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("No track found for {0}")]
    NotFound(String),
    #[error("Metadata provider error: {0}")]
    Provider(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("Acquisition failed: {0}")]
    Failed(String),
    #[error("Acquisition cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Voice transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Notification error: {0}")]
pub struct NotifyError(pub String);

/// Metadata for a track resolved from user input, before anything is
/// downloaded.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedTrack {
    pub title: String,
    pub source_locator: String,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub is_live: bool,
}

/// A playable local copy of a track produced by an [`Acquirer`].
#[derive(Clone, Debug, PartialEq)]
pub struct AcquiredSource {
    pub local_path: PathBuf,
    pub duration_seconds: Option<f64>,
}

/// What the voice transport should stream from.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamResource {
    File(PathBuf),
    Url(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamParams {
    /// Percent, 100 = unity gain.
    pub volume: u16,
    pub bitrate: u32,
    pub offset_seconds: f64,
}

/// Turns user input (a URL or free-text search) into track metadata.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, query: &str) -> Result<ResolvedTrack, ResolveError>;
}

/// Fetches a local copy of a resolved track's audio.
#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, source_locator: &str) -> Result<AcquiredSource, AcquireError>;
}

/// The group voice call the coordinator plays into.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn start(
        &self,
        chat_id: i64,
        resource: StreamResource,
        params: StreamParams,
    ) -> Result<(), TransportError>;
    async fn pause(&self, chat_id: i64) -> Result<(), TransportError>;
    async fn resume(&self, chat_id: i64) -> Result<(), TransportError>;
    /// Restarts the current stream with new parameters. Used for seeking and
    /// volume changes, which the underlying call cannot apply in place.
    async fn reissue(
        &self,
        chat_id: i64,
        resource: StreamResource,
        params: StreamParams,
    ) -> Result<(), TransportError>;
    async fn leave(&self, chat_id: i64) -> Result<(), TransportError>;
    async fn participant_count(&self, chat_id: i64) -> Result<usize, TransportError>;
    fn subscribe(&self) -> broadcast::Receiver<StreamEvent>;
}

/// Sends user-facing messages to a chat.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, message: &str) -> Result<(), NotifyError>;
}
