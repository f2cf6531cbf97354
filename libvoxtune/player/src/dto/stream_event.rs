use strum::Display;

/// Lifecycle notifications emitted by the voice transport and consumed by the
/// stream reactor.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
pub enum StreamEvent {
    PlaybackFinished { chat_id: i64 },
    ParticipantsChanged { chat_id: i64 },
    Disconnected { chat_id: i64 },
    Kicked { chat_id: i64 },
    Left { chat_id: i64 },
}

impl StreamEvent {
    pub fn chat_id(&self) -> i64 {
        match self {
            StreamEvent::PlaybackFinished { chat_id }
            | StreamEvent::ParticipantsChanged { chat_id }
            | StreamEvent::Disconnected { chat_id }
            | StreamEvent::Kicked { chat_id }
            | StreamEvent::Left { chat_id } => *chat_id,
        }
    }
}
