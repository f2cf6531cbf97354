pub(crate) mod command;
pub(crate) mod loop_mode;
pub(crate) mod playback_state;
pub(crate) mod player_event;
pub(crate) mod stream_event;
