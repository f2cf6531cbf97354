use strum::{Display, EnumString};

/// What happens to a finished item when the coordinator advances.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LoopMode {
    /// Finished items stay in history only.
    #[default]
    None,
    /// The finished item is re-queued at the front and plays again.
    Single,
    /// The finished item is appended to the back of the backlog.
    Queue,
}
