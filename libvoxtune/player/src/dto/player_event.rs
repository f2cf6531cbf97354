use libvoxtune_queue::QueueItem;
use strum::Display;

#[derive(Clone, Debug, Display)]
pub enum PlayerEvent {
    Started { chat_id: i64, item: QueueItem },
    Paused { chat_id: i64 },
    Resumed { chat_id: i64 },
    Stopped { chat_id: i64 },
    Ended { chat_id: i64 },
    Skipped { chat_id: i64 },
    QueueEnded { chat_id: i64 },
    AcquisitionFailed { chat_id: i64 },
    VolumeChanged { chat_id: i64, volume: u16 },
    Seeked { chat_id: i64, seconds: f64 },
}
