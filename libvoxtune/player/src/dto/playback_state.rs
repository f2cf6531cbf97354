use std::collections::HashSet;

use libvoxtune_queue::QueueItem;

use super::loop_mode::LoopMode;

/// Per-chat playback state, exclusively owned by that chat's session actor.
#[derive(Clone, Debug)]
pub struct PlaybackState {
    pub current_item: Option<QueueItem>,
    pub is_paused: bool,
    pub loop_mode: LoopMode,
    /// Percent, 100 = unity gain, clamped to 0..=200.
    pub volume: u16,
    /// Requester ids that voted to skip the current item. Cleared whenever
    /// the current item changes.
    pub skip_votes: HashSet<i64>,
}

impl PlaybackState {
    pub(crate) fn new(volume: u16) -> Self {
        Self {
            current_item: None,
            is_paused: false,
            loop_mode: LoopMode::default(),
            volume,
            skip_votes: HashSet::new(),
        }
    }
}

/// Snapshot of a chat's playback returned by status queries.
#[derive(Clone, Debug)]
pub struct PlaybackStatus {
    pub current_item: Option<QueueItem>,
    pub is_playing: bool,
    pub is_paused: bool,
    pub queue_length: i64,
    pub volume: u16,
    pub loop_mode: LoopMode,
    pub skip_votes: usize,
}

/// Result of a skip vote: how many votes are in, how many are needed, and
/// whether the threshold was reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SkipOutcome {
    pub votes: usize,
    pub required: usize,
    pub skipped: bool,
}
