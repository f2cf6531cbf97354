mod dto;
mod event_loop;
mod reactor;
mod session;

pub mod collaborator;
pub mod settings;

pub mod voxtune_player {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use libvoxtune_queue::NewQueueItem;
    pub use libvoxtune_queue::{DbError, ItemKind, QueueItem, QueueStore};
    use tap::TapFallible;
    use thiserror::Error;
    use tokio::sync::{Semaphore, broadcast, oneshot};
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{info, warn};

    pub use crate::collaborator::{
        Acquirer, Notifier, ResolveError, Resolver, TransportError, VoiceTransport, YtDlpProvider,
    };
    use crate::dto::command::Command;
    pub use crate::dto::loop_mode::LoopMode;
    pub use crate::dto::playback_state::{PlaybackStatus, SkipOutcome};
    pub use crate::dto::player_event::PlayerEvent;
    pub use crate::dto::stream_event::StreamEvent;
    use crate::event_loop::session_loop;
    use crate::reactor::StreamReactor;
    use crate::session::{ChatSession, SessionHandle};
    pub use crate::settings::Settings;

    #[derive(Debug, Clone, Error)]
    pub enum PlayerError {
        #[error("No active session for chat {0}")]
        NoActiveSession(i64),
        #[error("Could not fetch any queued track for chat {0}")]
        AcquisitionFailed(i64),
        #[error(transparent)]
        VoiceTransport(#[from] TransportError),
        #[error("Cannot seek within a live stream")]
        SeekUnsupported,
        #[error(transparent)]
        Store(#[from] DbError),
        #[error(transparent)]
        Resolve(#[from] ResolveError),
        #[error("Session closed before responding")]
        SessionClosed,
    }

    /// What callers get back after a successful enqueue.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct EnqueuedTrack {
        pub title: String,
        pub position: i64,
    }

    /// Entry point for the playback core. Owns one session actor per chat
    /// with active playback and a single reactor task for transport events.
    pub struct VoxtunePlayer {
        chat_sessions: Arc<Mutex<HashMap<i64, SessionHandle>>>,
        queue: QueueStore,
        resolver: Arc<dyn Resolver>,
        acquirer: Arc<dyn Acquirer>,
        transport: Arc<dyn VoiceTransport>,
        notifier: Arc<dyn Notifier>,
        event_tx: broadcast::Sender<PlayerEvent>,
        download_semaphore: Arc<Semaphore>,
        settings: Settings,
        reactor_shutdown: CancellationToken,
        reactor_handle: Option<JoinHandle<()>>,
    }

    impl VoxtunePlayer {
        pub fn new(
            queue: QueueStore,
            resolver: Arc<dyn Resolver>,
            acquirer: Arc<dyn Acquirer>,
            transport: Arc<dyn VoiceTransport>,
            notifier: Arc<dyn Notifier>,
            settings: Settings,
        ) -> Self {
            let (event_tx, _) = broadcast::channel(32);
            let chat_sessions = Arc::new(Mutex::new(HashMap::new()));
            let download_semaphore = Arc::new(Semaphore::new(settings.max_concurrent_downloads));
            let reactor_shutdown = CancellationToken::new();

            let reactor = StreamReactor::new(
                chat_sessions.clone(),
                queue.clone(),
                transport.clone(),
                settings.clone(),
            );
            let reactor_handle = Some(tokio::spawn(
                reactor.run(transport.subscribe(), reactor_shutdown.clone()),
            ));

            VoxtunePlayer {
                chat_sessions,
                queue,
                resolver,
                acquirer,
                transport,
                notifier,
                event_tx,
                download_semaphore,
                settings,
                reactor_shutdown,
                reactor_handle,
            }
        }

        pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
            self.event_tx.subscribe()
        }

        /// Resolves user input to track metadata and appends it to the chat's
        /// backlog. Does not start playback.
        pub async fn enqueue(
            &self,
            chat_id: i64,
            requester_id: i64,
            query: &str,
        ) -> Result<EnqueuedTrack, PlayerError> {
            let resolved = self.resolver.resolve(query).await?;
            let kind = if resolved.is_live {
                ItemKind::LiveStream
            } else if query.starts_with("http://") || query.starts_with("https://") {
                ItemKind::DirectLink
            } else {
                ItemKind::RemoteSearch
            };
            let mut new_item =
                NewQueueItem::new(chat_id, requester_id, kind, resolved.title.clone())
                    .source_locator(resolved.source_locator)
                    .live(resolved.is_live);
            if let Some(thumbnail) = resolved.thumbnail {
                new_item = new_item.thumbnail(thumbnail);
            }
            if let Some(duration) = resolved.duration_seconds {
                new_item = new_item.duration_seconds(duration);
            }
            let position = self.queue.enqueue(&new_item).await?;
            info!("enqueued {:?} for chat {chat_id}", new_item.title);
            Ok(EnqueuedTrack {
                title: new_item.title,
                position,
            })
        }

        /// Appends an already-local audio file. Local files are never deleted
        /// by playback cleanup.
        pub async fn enqueue_local(
            &self,
            chat_id: i64,
            requester_id: i64,
            title: String,
            path: String,
        ) -> Result<EnqueuedTrack, PlayerError> {
            let new_item = NewQueueItem::new(chat_id, requester_id, ItemKind::LocalFile, title)
                .local_path(path);
            let position = self.queue.enqueue(&new_item).await?;
            Ok(EnqueuedTrack {
                title: new_item.title,
                position,
            })
        }

        /// Advances to the next queued track, starting a session for the chat
        /// if none is running.
        pub async fn play_next(&self, chat_id: i64) -> Result<(), PlayerError> {
            let handle = self.ensure_session(chat_id);
            handle
                .cmd_tx
                .send_async(Command::Advance)
                .await
                .map_err(|_| PlayerError::SessionClosed)
        }

        pub async fn pause(&self, chat_id: i64) -> Result<(), PlayerError> {
            self.send_with_response(chat_id, Command::Pause).await
        }

        pub async fn resume(&self, chat_id: i64) -> Result<(), PlayerError> {
            self.send_with_response(chat_id, Command::Resume).await
        }

        /// Stops playback, clears the backlog, and leaves the voice call. The
        /// chat's session actor exits.
        pub async fn stop(&self, chat_id: i64) -> Result<(), PlayerError> {
            let handle = self.remove_session(chat_id);
            let Some(handle) = handle else {
                return Err(PlayerError::NoActiveSession(chat_id));
            };
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::Stop(tx))
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        /// Registers a skip vote and reports whether the threshold (half the
        /// participants, minimum one) was reached.
        pub async fn skip(
            &self,
            chat_id: i64,
            requester_id: i64,
        ) -> Result<SkipOutcome, PlayerError> {
            let handle = self
                .existing_session(chat_id)
                .ok_or(PlayerError::NoActiveSession(chat_id))?;
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::SkipVote {
                    requester_id,
                    respond_to: tx,
                })
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        pub async fn seek(&self, chat_id: i64, seconds: f64) -> Result<(), PlayerError> {
            let handle = self
                .existing_session(chat_id)
                .ok_or(PlayerError::NoActiveSession(chat_id))?;
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::Seek {
                    seconds,
                    respond_to: tx,
                })
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        pub async fn set_volume(&self, chat_id: i64, volume: u16) -> Result<(), PlayerError> {
            let handle = self.ensure_session(chat_id);
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::SetVolume {
                    volume,
                    respond_to: tx,
                })
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        pub async fn set_loop_mode(&self, chat_id: i64, mode: LoopMode) -> Result<(), PlayerError> {
            let handle = self.ensure_session(chat_id);
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::SetLoopMode {
                    mode,
                    respond_to: tx,
                })
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        pub async fn status(&self, chat_id: i64) -> Result<PlaybackStatus, PlayerError> {
            let handle = self
                .existing_session(chat_id)
                .ok_or(PlayerError::NoActiveSession(chat_id))?;
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(Command::GetStatus(tx))
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        pub async fn queue(&self, chat_id: i64) -> Result<Vec<QueueItem>, PlayerError> {
            Ok(self.queue.list_pending(chat_id).await?)
        }

        pub async fn history(&self, chat_id: i64, limit: i64) -> Result<Vec<QueueItem>, PlayerError> {
            Ok(self.queue.history(chat_id, limit).await?)
        }

        pub async fn remove(&self, chat_id: i64, position: i64) -> Result<bool, PlayerError> {
            Ok(self.queue.remove_at(chat_id, position).await?)
        }

        pub async fn move_track(
            &self,
            chat_id: i64,
            from_position: i64,
            to_position: i64,
        ) -> Result<bool, PlayerError> {
            Ok(self.queue.move_item(chat_id, from_position, to_position).await?)
        }

        pub async fn shuffle(&self, chat_id: i64) -> Result<bool, PlayerError> {
            Ok(self.queue.shuffle(chat_id).await?)
        }

        /// Shuts the reactor down and waits for it. Session actors end on
        /// their own once their mailboxes drop.
        pub async fn join(mut self) -> Result<(), PlayerError> {
            info!("Joining player instance");
            self.reactor_shutdown.cancel();
            if let Some(handle) = self.reactor_handle.take() {
                handle
                    .await
                    .tap_err(|e| warn!("Error joining reactor task: {e:?}"))
                    .ok();
            }
            Ok(())
        }

        async fn send_with_response(
            &self,
            chat_id: i64,
            command: fn(crate::dto::command::Responder<()>) -> Command,
        ) -> Result<(), PlayerError> {
            let handle = self
                .existing_session(chat_id)
                .ok_or(PlayerError::NoActiveSession(chat_id))?;
            let (tx, rx) = oneshot::channel();
            handle
                .cmd_tx
                .send_async(command(tx))
                .await
                .map_err(|_| PlayerError::SessionClosed)?;
            rx.await.map_err(|_| PlayerError::SessionClosed)?
        }

        fn ensure_session(&self, chat_id: i64) -> SessionHandle {
            let mut sessions = match self.chat_sessions.lock() {
                Ok(sessions) => sessions,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(handle) = sessions.get(&chat_id) {
                if !handle.is_closed() {
                    return handle.clone();
                }
            }
            let (cmd_tx, cmd_rx) = flume::unbounded();
            let session = ChatSession::new(
                chat_id,
                self.queue.clone(),
                self.acquirer.clone(),
                self.transport.clone(),
                self.notifier.clone(),
                self.event_tx.clone(),
                cmd_tx.clone(),
                self.download_semaphore.clone(),
                self.settings.clone(),
            );
            tokio::spawn(session_loop(session, cmd_rx));
            let handle = SessionHandle { cmd_tx };
            sessions.insert(chat_id, handle.clone());
            handle
        }

        fn existing_session(&self, chat_id: i64) -> Option<SessionHandle> {
            let sessions = match self.chat_sessions.lock() {
                Ok(sessions) => sessions,
                Err(poisoned) => poisoned.into_inner(),
            };
            sessions
                .get(&chat_id)
                .filter(|handle| !handle.is_closed())
                .cloned()
        }

        fn remove_session(&self, chat_id: i64) -> Option<SessionHandle> {
            let mut sessions = match self.chat_sessions.lock() {
                Ok(sessions) => sessions,
                Err(poisoned) => poisoned.into_inner(),
            };
            sessions.remove(&chat_id).filter(|handle| !handle.is_closed())
        }
    }
}
