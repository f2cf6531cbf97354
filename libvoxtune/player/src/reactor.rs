use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use libvoxtune_queue::{ItemKind, QueueItem, QueueStore};
use tap::TapFallible;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborator::VoiceTransport;
use crate::dto::command::Command;
use crate::dto::stream_event::StreamEvent;
use crate::session::{SessionHandle, remove_file_if_exists};
use crate::settings::Settings;

/// Listens to transport lifecycle events and drives the affected chat's
/// session. Runs as a single background task owned by the player.
pub(crate) struct StreamReactor {
    chat_sessions: Arc<Mutex<HashMap<i64, SessionHandle>>>,
    queue: QueueStore,
    transport: Arc<dyn VoiceTransport>,
    settings: Settings,
    pending_deletions: HashMap<i64, Vec<CancellationToken>>,
}

impl StreamReactor {
    pub(crate) fn new(
        chat_sessions: Arc<Mutex<HashMap<i64, SessionHandle>>>,
        queue: QueueStore,
        transport: Arc<dyn VoiceTransport>,
        settings: Settings,
    ) -> Self {
        Self {
            chat_sessions,
            queue,
            transport,
            settings,
            pending_deletions: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut events: broadcast::Receiver<StreamEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    break;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("stream reactor lagged, {skipped} events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            break;
                        }
                    }
                }
            }
        }
        info!("stream reactor stopped");
    }

    async fn handle_event(&mut self, event: StreamEvent) {
        debug!("stream event: {event}");
        match event {
            StreamEvent::PlaybackFinished { chat_id } => {
                self.on_playback_finished(chat_id).await;
            }
            StreamEvent::ParticipantsChanged { chat_id } => {
                self.on_participants_changed(chat_id).await;
            }
            StreamEvent::Disconnected { chat_id }
            | StreamEvent::Kicked { chat_id }
            | StreamEvent::Left { chat_id } => {
                self.cleanup_chat(chat_id).await;
            }
        }
    }

    async fn on_playback_finished(&mut self, chat_id: i64) {
        match self.queue.current(chat_id).await {
            Ok(Some(item)) => self.schedule_deletion(chat_id, &item),
            Ok(None) => {}
            Err(e) => warn!("unable to look up current item for chat {chat_id}: {e:?}"),
        }
        let handle = self.session_handle(chat_id);
        if let Some(handle) = handle {
            handle
                .cmd_tx
                .send_async(Command::StreamEnded)
                .await
                .tap_err(|e| warn!("no session to advance for chat {chat_id}: {e:?}"))
                .ok();
        }
    }

    async fn on_participants_changed(&mut self, chat_id: i64) {
        let count = match self.transport.participant_count(chat_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!("unable to count participants for chat {chat_id}: {e:?}");
                return;
            }
        };
        if count == 0 {
            info!("everyone left chat {chat_id}, tearing down");
            self.transport
                .leave(chat_id)
                .await
                .tap_err(|e| warn!("unable to leave call for chat {chat_id}: {e:?}"))
                .ok();
            self.cleanup_chat(chat_id).await;
        }
    }

    async fn cleanup_chat(&mut self, chat_id: i64) {
        if let Some(tokens) = self.pending_deletions.remove(&chat_id) {
            for token in tokens {
                token.cancel();
            }
        }
        let handle = {
            let mut sessions = match self.chat_sessions.lock() {
                Ok(sessions) => sessions,
                Err(poisoned) => poisoned.into_inner(),
            };
            sessions.remove(&chat_id)
        };
        if let Some(handle) = handle {
            handle
                .cmd_tx
                .send_async(Command::Cleanup)
                .await
                .tap_err(|e| warn!("session for chat {chat_id} already gone: {e:?}"))
                .ok();
        } else {
            // The actor may have exited on its own. The backlog still has to
            // go so a later session starts fresh.
            self.queue
                .clear(chat_id)
                .await
                .tap_err(|e| warn!("unable to clear queue for chat {chat_id}: {e:?}"))
                .ok();
        }
    }

    fn session_handle(&self, chat_id: i64) -> Option<SessionHandle> {
        let sessions = match self.chat_sessions.lock() {
            Ok(sessions) => sessions,
            Err(poisoned) => poisoned.into_inner(),
        };
        sessions.get(&chat_id).cloned()
    }

    /// Queues a deferred delete for the finished item's cached file. The file
    /// survives if something in the queue still points at it by the time the
    /// delay elapses, which happens under loop modes.
    fn schedule_deletion(&mut self, chat_id: i64, item: &QueueItem) {
        if item.kind == ItemKind::LocalFile || item.is_live {
            return;
        }
        let Some(path) = item.local_path.clone() else {
            return;
        };
        let token = CancellationToken::new();
        let tokens = self.pending_deletions.entry(chat_id).or_default();
        // fired timers cancel their own token, so drop those before adding
        tokens.retain(|t| !t.is_cancelled());
        tokens.push(token.clone());
        let queue = self.queue.clone();
        let delay = self.settings.cleanup_delay;
        let item_id = item.item_id.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {
                    if still_referenced(&queue, chat_id, &item_id, &path).await {
                        debug!("{path:?} is still referenced, keeping it");
                    } else {
                        remove_file_if_exists(&PathBuf::from(&path)).await;
                        queue
                            .clear_local_path(&item_id)
                            .await
                            .tap_err(|e| warn!("unable to clear local path: {e:?}"))
                            .ok();
                    }
                }
            }
            token.cancel();
        });
    }
}

/// True when an item other than the one being cleaned up points at the same
/// file, which happens when a finished item got re-queued under a loop mode.
/// A store error counts as referenced: keeping a stray file beats deleting
/// one that is in use.
async fn still_referenced(queue: &QueueStore, chat_id: i64, item_id: &str, path: &str) -> bool {
    let current = match queue.current(chat_id).await {
        Ok(current) => current,
        Err(e) => {
            warn!("unable to check current item for chat {chat_id}: {e:?}");
            return true;
        }
    };
    if current
        .is_some_and(|item| item.item_id != item_id && item.local_path.as_deref() == Some(path))
    {
        return true;
    }
    let pending = match queue.list_pending(chat_id).await {
        Ok(pending) => pending,
        Err(e) => {
            warn!("unable to check pending items for chat {chat_id}: {e:?}");
            return true;
        }
    };
    pending
        .iter()
        .any(|item| item.local_path.as_deref() == Some(path))
}

#[cfg(test)]
#[path = "./reactor_test.rs"]
mod reactor_test;
