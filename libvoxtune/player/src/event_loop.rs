use tracing::{debug, info};

use crate::dto::command::Command;
use crate::session::{AdvanceReason, ChatSession};

/// Drains a chat's mailbox until the session is torn down. One of these runs
/// per chat with an active session.
pub(crate) async fn session_loop(mut session: ChatSession, cmd_rx: flume::Receiver<Command>) {
    while let Ok(command) = cmd_rx.recv_async().await {
        debug!("received command {command:?}");
        match command {
            Command::Advance => {
                session.advance(AdvanceReason::Requested).await;
            }
            Command::Acquired {
                generation,
                item,
                result,
            } => {
                session.on_acquired(generation, item, result).await;
            }
            Command::StreamEnded => {
                session.advance(AdvanceReason::Ended).await;
            }
            Command::Pause(respond_to) => {
                respond_to.send(session.pause().await).ok();
            }
            Command::Resume(respond_to) => {
                respond_to.send(session.resume().await).ok();
            }
            Command::Stop(respond_to) => {
                respond_to.send(session.stop().await).ok();
                break;
            }
            Command::SkipVote {
                requester_id,
                respond_to,
            } => {
                respond_to.send(session.skip_vote(requester_id).await).ok();
            }
            Command::Seek {
                seconds,
                respond_to,
            } => {
                respond_to.send(session.seek(seconds).await).ok();
            }
            Command::SetVolume { volume, respond_to } => {
                respond_to.send(session.set_volume(volume).await).ok();
            }
            Command::SetLoopMode { mode, respond_to } => {
                session.set_loop_mode(mode);
                respond_to.send(Ok(())).ok();
            }
            Command::GetStatus(respond_to) => {
                respond_to.send(Ok(session.status().await)).ok();
            }
            Command::Cleanup => {
                session.cleanup().await;
                break;
            }
        }
    }
    info!("session loop ended");
}
