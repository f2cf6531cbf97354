pub mod database;
mod db_error;
mod queue_item;
mod queue_store;

pub use db_error::DbError;
pub use queue_item::{ItemKind, NewQueueItem, QueueItem};
pub use queue_store::{Placement, QueueStore};
