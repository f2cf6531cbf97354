use std::path::PathBuf;
use std::sync::Arc;

use libvoxtune_queue::{ItemKind, Placement, QueueItem, QueueStore};
use tap::TapFallible;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::collaborator::{
    AcquireError, AcquiredSource, Acquirer, Notifier, StreamParams, StreamResource, VoiceTransport,
};
use crate::dto::command::Command;
use crate::dto::loop_mode::LoopMode;
use crate::dto::playback_state::{PlaybackState, PlaybackStatus, SkipOutcome};
use crate::dto::player_event::PlayerEvent;
use crate::settings::Settings;
use crate::voxtune_player::PlayerError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionPhase {
    Idle,
    Resolving,
    Playing,
    Paused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdvanceReason {
    Requested,
    Ended,
    Skipped,
}

/// Handle to a running chat session actor.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) cmd_tx: flume::Sender<Command>,
}

impl SessionHandle {
    pub(crate) fn is_closed(&self) -> bool {
        self.cmd_tx.is_disconnected()
    }
}

/// Playback coordinator for a single chat. All mutation goes through the
/// actor's mailbox, so none of this needs locking.
pub(crate) struct ChatSession {
    chat_id: i64,
    queue: QueueStore,
    acquirer: Arc<dyn Acquirer>,
    transport: Arc<dyn VoiceTransport>,
    notifier: Arc<dyn Notifier>,
    event_tx: broadcast::Sender<PlayerEvent>,
    cmd_tx: flume::Sender<Command>,
    download_semaphore: Arc<Semaphore>,
    settings: Settings,
    phase: SessionPhase,
    playback: PlaybackState,
    /// Bumped for every spawned acquisition so completions from a superseded
    /// one can be discarded.
    resolve_generation: u64,
    resolve_token: Option<CancellationToken>,
    consecutive_failures: u64,
    failure_budget: u64,
}

impl ChatSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chat_id: i64,
        queue: QueueStore,
        acquirer: Arc<dyn Acquirer>,
        transport: Arc<dyn VoiceTransport>,
        notifier: Arc<dyn Notifier>,
        event_tx: broadcast::Sender<PlayerEvent>,
        cmd_tx: flume::Sender<Command>,
        download_semaphore: Arc<Semaphore>,
        settings: Settings,
    ) -> Self {
        let volume = settings.default_volume;
        Self {
            chat_id,
            queue,
            acquirer,
            transport,
            notifier,
            event_tx,
            cmd_tx,
            download_semaphore,
            settings,
            phase: SessionPhase::Idle,
            playback: PlaybackState::new(volume),
            resolve_generation: 0,
            resolve_token: None,
            consecutive_failures: 0,
            failure_budget: 0,
        }
    }

    fn publish(&self, event: PlayerEvent) {
        self.event_tx
            .send(event)
            .tap_err(|e| warn!("unable to publish event: {e:?}"))
            .ok();
    }

    async fn notify(&self, message: &str) {
        self.notifier
            .notify(self.chat_id, message)
            .await
            .tap_err(|e| warn!("unable to notify chat {}: {e:?}", self.chat_id))
            .ok();
    }

    fn stream_params(&self, offset_seconds: f64) -> StreamParams {
        StreamParams {
            volume: self.playback.volume,
            bitrate: self.settings.audio_bitrate,
            offset_seconds,
        }
    }

    fn stream_resource(item: &QueueItem) -> Option<StreamResource> {
        if let Some(path) = &item.local_path {
            Some(StreamResource::File(PathBuf::from(path)))
        } else if item.is_live {
            item.source_locator.clone().map(StreamResource::Url)
        } else {
            None
        }
    }

    fn cancel_acquisition(&mut self) {
        if let Some(token) = self.resolve_token.take() {
            token.cancel();
        }
    }

    /// Moves to the next track. `Ended` is the only reason that honors the
    /// loop mode, so a vote-skip always gets past the current item.
    pub(crate) async fn advance(&mut self, reason: AdvanceReason) {
        self.cancel_acquisition();
        if reason != AdvanceReason::Ended {
            self.consecutive_failures = 0;
            self.failure_budget = 0;
        }
        if let Some(finished) = self.playback.current_item.take() {
            match reason {
                AdvanceReason::Ended => {
                    let placement = match self.playback.loop_mode {
                        LoopMode::Single => Some(Placement::Front),
                        LoopMode::Queue => Some(Placement::Back),
                        LoopMode::None => None,
                    };
                    if let Some(placement) = placement {
                        self.queue
                            .requeue(&finished, placement)
                            .await
                            .tap_err(|e| warn!("unable to requeue finished item: {e:?}"))
                            .ok();
                    }
                    self.publish(PlayerEvent::Ended {
                        chat_id: self.chat_id,
                    });
                }
                AdvanceReason::Skipped => {
                    self.delete_cached_file(&finished).await;
                    self.publish(PlayerEvent::Skipped {
                        chat_id: self.chat_id,
                    });
                }
                AdvanceReason::Requested => {
                    self.delete_cached_file(&finished).await;
                }
            }
        }
        self.playback.skip_votes.clear();
        self.next_track().await;
    }

    /// Pops items until one starts, a download is dispatched, or the queue
    /// runs dry. Bounded: repeated failures stop once the budget set at the
    /// first failure is spent.
    async fn next_track(&mut self) {
        loop {
            let next = match self.queue.pop_next(self.chat_id).await {
                Ok(next) => next,
                Err(e) => {
                    warn!("unable to pop next item: {e:?}");
                    self.phase = SessionPhase::Idle;
                    return;
                }
            };
            let Some(item) = next else {
                self.go_idle(self.consecutive_failures > 0).await;
                return;
            };
            if item.local_path.is_some() || item.is_live {
                if self.start_stream(item).await {
                    return;
                }
                if self.register_failure().await {
                    return;
                }
                continue;
            }
            self.spawn_acquisition(item);
            return;
        }
    }

    async fn go_idle(&mut self, failed: bool) {
        self.phase = SessionPhase::Idle;
        self.playback.current_item = None;
        self.playback.skip_votes.clear();
        if failed {
            self.publish(PlayerEvent::AcquisitionFailed {
                chat_id: self.chat_id,
            });
            self.notify("Playback stopped: could not fetch any of the queued tracks.")
                .await;
        } else {
            self.publish(PlayerEvent::QueueEnded {
                chat_id: self.chat_id,
            });
            self.notify("Queue finished.").await;
        }
        self.consecutive_failures = 0;
        self.failure_budget = 0;
    }

    /// Returns true when the failure budget is spent and the session has gone
    /// idle.
    async fn register_failure(&mut self) -> bool {
        if self.consecutive_failures == 0 {
            let remaining = self.queue.length(self.chat_id).await.unwrap_or(0);
            self.failure_budget = remaining as u64 + 1;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_budget {
            self.go_idle(true).await;
            return true;
        }
        false
    }

    fn spawn_acquisition(&mut self, item: QueueItem) {
        self.resolve_generation += 1;
        let generation = self.resolve_generation;
        let token = CancellationToken::new();
        self.resolve_token = Some(token.clone());
        self.phase = SessionPhase::Resolving;

        let acquirer = self.acquirer.clone();
        let semaphore = self.download_semaphore.clone();
        let cmd_tx = self.cmd_tx.clone();
        let locator = item.source_locator.clone().unwrap_or_default();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => Err(AcquireError::Cancelled),
                result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| AcquireError::Failed(e.to_string()))?;
                    acquirer.acquire(&locator).await
                } => result,
            };
            cmd_tx
                .send_async(Command::Acquired {
                    generation,
                    item: Box::new(item),
                    result,
                })
                .await
                .tap_err(|e| warn!("session gone before acquisition finished: {e:?}"))
                .ok();
        });
    }

    pub(crate) async fn on_acquired(
        &mut self,
        generation: u64,
        mut item: Box<QueueItem>,
        result: Result<AcquiredSource, AcquireError>,
    ) {
        if generation != self.resolve_generation || self.phase != SessionPhase::Resolving {
            // Superseded by a stop, skip, or newer acquisition. A stale
            // download still produced a file nothing references.
            if let Ok(source) = result {
                remove_file_if_exists(&source.local_path).await;
            }
            return;
        }
        self.resolve_token = None;
        match result {
            Ok(source) => {
                let local_path = source.local_path.to_string_lossy().to_string();
                self.queue
                    .set_local_path(&item.item_id, &local_path)
                    .await
                    .tap_err(|e| warn!("unable to record local path: {e:?}"))
                    .ok();
                item.local_path = Some(local_path);
                if source.duration_seconds.is_some() {
                    item.duration_seconds = source.duration_seconds;
                }
                if !self.start_stream(*item).await && !self.register_failure().await {
                    self.next_track().await;
                }
            }
            Err(AcquireError::Cancelled) => {}
            Err(e) => {
                warn!("acquisition failed for chat {}: {e:?}", self.chat_id);
                if !self.register_failure().await {
                    self.next_track().await;
                }
            }
        }
    }

    async fn start_stream(&mut self, item: QueueItem) -> bool {
        let Some(resource) = Self::stream_resource(&item) else {
            warn!("item {} has nothing to stream", item.item_id);
            return false;
        };
        let params = self.stream_params(0.0);
        if let Err(e) = self.transport.start(self.chat_id, resource, params).await {
            warn!("unable to start stream for chat {}: {e:?}", self.chat_id);
            return false;
        }
        info!("now playing {:?} in chat {}", item.title, self.chat_id);
        self.phase = SessionPhase::Playing;
        self.playback.is_paused = false;
        self.playback.skip_votes.clear();
        self.consecutive_failures = 0;
        self.failure_budget = 0;
        self.publish(PlayerEvent::Started {
            chat_id: self.chat_id,
            item: item.clone(),
        });
        self.playback.current_item = Some(item);
        true
    }

    pub(crate) async fn pause(&mut self) -> Result<(), PlayerError> {
        match self.phase {
            SessionPhase::Paused => Ok(()),
            SessionPhase::Playing => {
                self.transport.pause(self.chat_id).await?;
                self.phase = SessionPhase::Paused;
                self.playback.is_paused = true;
                self.publish(PlayerEvent::Paused {
                    chat_id: self.chat_id,
                });
                Ok(())
            }
            _ => Err(PlayerError::NoActiveSession(self.chat_id)),
        }
    }

    pub(crate) async fn resume(&mut self) -> Result<(), PlayerError> {
        match self.phase {
            SessionPhase::Playing => Ok(()),
            SessionPhase::Paused => {
                self.transport.resume(self.chat_id).await?;
                self.phase = SessionPhase::Playing;
                self.playback.is_paused = false;
                self.publish(PlayerEvent::Resumed {
                    chat_id: self.chat_id,
                });
                Ok(())
            }
            _ => Err(PlayerError::NoActiveSession(self.chat_id)),
        }
    }

    /// Full teardown on user request: clears the backlog, leaves the call,
    /// and ends the actor.
    pub(crate) async fn stop(&mut self) -> Result<(), PlayerError> {
        self.cancel_acquisition();
        self.queue.clear(self.chat_id).await?;
        if let Some(item) = self.playback.current_item.take() {
            self.delete_cached_file(&item).await;
        }
        self.transport
            .leave(self.chat_id)
            .await
            .tap_err(|e| warn!("unable to leave call for chat {}: {e:?}", self.chat_id))
            .ok();
        self.phase = SessionPhase::Idle;
        self.playback = PlaybackState::new(self.settings.default_volume);
        self.publish(PlayerEvent::Stopped {
            chat_id: self.chat_id,
        });
        Ok(())
    }

    /// Teardown driven by the reactor after the transport already dropped the
    /// call. Safe to run when nothing is playing.
    pub(crate) async fn cleanup(&mut self) {
        self.cancel_acquisition();
        self.queue
            .clear(self.chat_id)
            .await
            .tap_err(|e| warn!("unable to clear queue for chat {}: {e:?}", self.chat_id))
            .ok();
        if let Some(item) = self.playback.current_item.take() {
            self.delete_cached_file(&item).await;
        }
        self.phase = SessionPhase::Idle;
        self.playback = PlaybackState::new(self.settings.default_volume);
    }

    pub(crate) async fn skip_vote(&mut self, requester_id: i64) -> Result<SkipOutcome, PlayerError> {
        if self.playback.current_item.is_none() {
            if self.phase == SessionPhase::Resolving {
                // Nothing is audible yet, so don't make voters wait: cancel
                // the download and move on.
                self.advance(AdvanceReason::Requested).await;
                return Ok(SkipOutcome {
                    votes: 1,
                    required: 1,
                    skipped: true,
                });
            }
            return Err(PlayerError::NoActiveSession(self.chat_id));
        }
        self.playback.skip_votes.insert(requester_id);
        let votes = self.playback.skip_votes.len();
        let participants = self
            .transport
            .participant_count(self.chat_id)
            .await
            .tap_err(|e| warn!("unable to count participants: {e:?}"))
            .unwrap_or(1);
        let required = (participants / 2).max(1);
        let skipped = votes >= required;
        if skipped {
            self.advance(AdvanceReason::Skipped).await;
        }
        Ok(SkipOutcome {
            votes,
            required,
            skipped,
        })
    }

    pub(crate) async fn seek(&mut self, seconds: f64) -> Result<(), PlayerError> {
        let Some(item) = &self.playback.current_item else {
            return Err(PlayerError::NoActiveSession(self.chat_id));
        };
        if item.is_live {
            return Err(PlayerError::SeekUnsupported);
        }
        let Some(resource) = Self::stream_resource(item) else {
            return Err(PlayerError::NoActiveSession(self.chat_id));
        };
        let params = self.stream_params(seconds.max(0.0));
        self.transport.reissue(self.chat_id, resource, params).await?;
        self.phase = SessionPhase::Playing;
        self.playback.is_paused = false;
        self.publish(PlayerEvent::Seeked {
            chat_id: self.chat_id,
            seconds,
        });
        Ok(())
    }

    pub(crate) async fn set_volume(&mut self, volume: u16) -> Result<(), PlayerError> {
        let volume = volume.min(200);
        self.playback.volume = volume;
        // The call cannot change gain in place, so an active stream restarts
        // with the new volume. A paused stream is left alone, it picks the
        // volume up whenever it is issued again.
        if self.phase == SessionPhase::Playing {
            if let Some(item) = &self.playback.current_item {
                if let Some(resource) = Self::stream_resource(item) {
                    let params = self.stream_params(0.0);
                    self.transport.reissue(self.chat_id, resource, params).await?;
                }
            }
        }
        self.publish(PlayerEvent::VolumeChanged {
            chat_id: self.chat_id,
            volume,
        });
        Ok(())
    }

    pub(crate) fn set_loop_mode(&mut self, mode: LoopMode) {
        self.playback.loop_mode = mode;
    }

    pub(crate) async fn status(&self) -> PlaybackStatus {
        let queue_length = self
            .queue
            .length(self.chat_id)
            .await
            .tap_err(|e| warn!("unable to read queue length: {e:?}"))
            .unwrap_or(0);
        PlaybackStatus {
            current_item: self.playback.current_item.clone(),
            is_playing: self.phase == SessionPhase::Playing,
            is_paused: self.playback.is_paused,
            queue_length,
            volume: self.playback.volume,
            loop_mode: self.playback.loop_mode,
            skip_votes: self.playback.skip_votes.len(),
        }
    }

    async fn delete_cached_file(&self, item: &QueueItem) {
        if item.kind == ItemKind::LocalFile || item.is_live {
            return;
        }
        if let Some(path) = &item.local_path {
            remove_file_if_exists(&PathBuf::from(path)).await;
        }
    }
}

pub(crate) async fn remove_file_if_exists(path: &std::path::Path) {
    if tokio::fs::metadata(path).await.is_ok() {
        tokio::fs::remove_file(path)
            .await
            .tap_err(|e| warn!("unable to remove {path:?}: {e:?}"))
            .ok();
    }
}
