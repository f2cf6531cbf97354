use libvoxtune_queue::QueueItem;
use tokio::sync::oneshot;

use super::loop_mode::LoopMode;
use super::playback_state::{PlaybackStatus, SkipOutcome};
use crate::collaborator::{AcquireError, AcquiredSource};
use crate::voxtune_player::PlayerError;

pub(crate) type Responder<T> = oneshot::Sender<Result<T, PlayerError>>;

/// Mailbox messages handled by a chat's session actor.
#[derive(Debug)]
pub(crate) enum Command {
    Advance,
    /// Completion of a background acquisition task. Stale completions are
    /// identified by `generation` and dropped.
    Acquired {
        generation: u64,
        item: Box<QueueItem>,
        result: Result<AcquiredSource, AcquireError>,
    },
    StreamEnded,
    Pause(Responder<()>),
    Resume(Responder<()>),
    Stop(Responder<()>),
    SkipVote {
        requester_id: i64,
        respond_to: Responder<SkipOutcome>,
    },
    Seek {
        seconds: f64,
        respond_to: Responder<()>,
    },
    SetVolume {
        volume: u16,
        respond_to: Responder<()>,
    },
    SetLoopMode {
        mode: LoopMode,
        respond_to: Responder<()>,
    },
    GetStatus(Responder<PlaybackStatus>),
    Cleanup,
}
