use strum::{Display, EnumString};

/// How a request was submitted and how its media should be obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString, sqlx::Type)]
#[strum(serialize_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ItemKind {
    RemoteSearch,
    DirectLink,
    LocalFile,
    LiveStream,
}

/// A single persisted request. `position` is the 1-based rank among unplayed
/// items in the same chat and is null once the item has been played.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct QueueItem {
    pub item_id: String,
    pub chat_id: i64,
    pub requester_id: i64,
    pub kind: ItemKind,
    pub title: String,
    pub source_locator: Option<String>,
    pub local_path: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub is_live: bool,
    pub played: bool,
    pub position: Option<i64>,
    pub requested_at: i64,
    pub started_at: Option<i64>,
}

/// Intake type for new requests. Identity, position, and timestamps are
/// assigned by the store on insertion.
#[derive(Clone, Debug)]
pub struct NewQueueItem {
    pub chat_id: i64,
    pub requester_id: i64,
    pub kind: ItemKind,
    pub title: String,
    pub source_locator: Option<String>,
    pub local_path: Option<String>,
    pub thumbnail: Option<String>,
    pub duration_seconds: Option<f64>,
    pub is_live: bool,
}

impl NewQueueItem {
    pub fn new(chat_id: i64, requester_id: i64, kind: ItemKind, title: impl Into<String>) -> Self {
        Self {
            chat_id,
            requester_id,
            kind,
            title: title.into(),
            source_locator: None,
            local_path: None,
            thumbnail: None,
            duration_seconds: None,
            is_live: false,
        }
    }

    pub fn source_locator(mut self, locator: impl Into<String>) -> Self {
        self.source_locator = Some(locator.into());
        self
    }

    pub fn local_path(mut self, path: impl Into<String>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    pub fn thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail = Some(url.into());
        self
    }

    pub fn duration_seconds(mut self, duration: f64) -> Self {
        self.duration_seconds = Some(duration);
        self
    }

    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }
}
