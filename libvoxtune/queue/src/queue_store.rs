use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use rand::seq::SliceRandom;
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::db_error::DbError;
use crate::queue_item::{NewQueueItem, QueueItem};

const MAX_TX_ATTEMPTS: u32 = 3;
const DEFAULT_TITLE: &str = "Unknown track";

/// Where a re-inserted item lands relative to the pending items.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

/// Durable ordered backlog of requests, partitioned by chat.
///
/// Unplayed items in a chat always occupy positions `1..=N` with no gaps.
/// Every mutating operation runs in a single transaction and is retried a
/// bounded number of times on write contention, so the positional invariant
/// holds under concurrent callers.
#[derive(Clone)]
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    pub fn new(db: &Database) -> Self {
        Self { db: db.clone() }
    }

    async fn run_tx<T, F>(&self, op: F) -> Result<T, DbError>
    where
        F: for<'a> Fn(
            &'a mut Transaction<'static, Sqlite>,
        ) -> BoxFuture<'a, Result<T, sqlx::Error>>,
    {
        let mut attempt = 1;
        loop {
            let res = async {
                let mut tx = self.db.begin_write().await?;
                let val = op(&mut tx).await?;
                tx.commit().await?;
                Ok::<_, sqlx::Error>(val)
            }
            .await;

            match res {
                Ok(val) => return Ok(val),
                Err(e) if attempt < MAX_TX_ATTEMPTS && is_contention(&e) => {
                    warn!("Transaction aborted on attempt {attempt}: {e}");
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Appends a request to the chat's backlog and returns its assigned
    /// 1-based position.
    pub async fn enqueue(&self, item: &NewQueueItem) -> Result<i64, DbError> {
        let item_id = Uuid::new_v4().to_string();
        let title = if item.title.trim().is_empty() {
            DEFAULT_TITLE.to_owned()
        } else {
            item.title.clone()
        };
        let requested_at = now_millis();

        let position = self
            .run_tx(|tx| {
                // cloned per attempt so the future borrows nothing but the
                // transaction
                let item = item.clone();
                let item_id = item_id.clone();
                let title = title.clone();
                Box::pin(async move {
                    let (count,): (i64,) = sqlx::query_as(
                        "SELECT COUNT(*) FROM queue_item WHERE chat_id = ? AND played = 0",
                    )
                    .bind(item.chat_id)
                    .fetch_one(&mut **tx)
                    .await?;
                    let position = count + 1;

                    sqlx::query(
                        "INSERT INTO queue_item
                         (item_id, chat_id, requester_id, kind, title, source_locator,
                          local_path, thumbnail, duration_seconds, is_live, played,
                          position, requested_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
                    )
                    .bind(item_id)
                    .bind(item.chat_id)
                    .bind(item.requester_id)
                    .bind(item.kind)
                    .bind(title)
                    .bind(item.source_locator.as_deref())
                    .bind(item.local_path.as_deref())
                    .bind(item.thumbnail.as_deref())
                    .bind(item.duration_seconds)
                    .bind(item.is_live)
                    .bind(position)
                    .bind(requested_at)
                    .execute(&mut **tx)
                    .await?;

                    Ok(position)
                })
            })
            .await?;

        info!(
            "Enqueued '{title}' at position {position} for chat {}",
            item.chat_id
        );
        Ok(position)
    }

    /// All unplayed items for the chat, ascending by position.
    pub async fn list_pending(&self, chat_id: i64) -> Result<Vec<QueueItem>, DbError> {
        let mut con = self.db.acquire().await?;
        let items = sqlx::query_as(
            "SELECT * FROM queue_item WHERE chat_id = ? AND played = 0 ORDER BY position",
        )
        .bind(chat_id)
        .fetch_all(&mut *con)
        .await?;
        Ok(items)
    }

    /// Atomically takes the unplayed item with the smallest position, marks it
    /// played, and renumbers the remaining items back to `1..=N`. Two
    /// concurrent calls for the same chat never return the same item.
    pub async fn pop_next(&self, chat_id: i64) -> Result<Option<QueueItem>, DbError> {
        let started_at = now_millis();
        self.run_tx(|tx| {
            Box::pin(async move {
                let next: Option<QueueItem> = sqlx::query_as(
                    "SELECT * FROM queue_item
                     WHERE chat_id = ? AND played = 0
                     ORDER BY position LIMIT 1",
                )
                .bind(chat_id)
                .fetch_optional(&mut **tx)
                .await?;

                let Some(mut item) = next else {
                    return Ok(None);
                };
                let old_position = item.position.take().unwrap_or(i64::MAX);

                sqlx::query(
                    "UPDATE queue_item SET played = 1, started_at = ?, position = NULL
                     WHERE item_id = ?",
                )
                .bind(started_at)
                .bind(item.item_id.as_str())
                .execute(&mut **tx)
                .await?;

                sqlx::query(
                    "UPDATE queue_item SET position = position - 1
                     WHERE chat_id = ? AND played = 0 AND position > ?",
                )
                .bind(chat_id)
                .bind(old_position)
                .execute(&mut **tx)
                .await?;

                item.played = true;
                item.started_at = Some(started_at);
                Ok(Some(item))
            })
        })
        .await
    }

    /// Deletes the unplayed item at `position`, shifting later items down by
    /// one. Returns false if nothing exists at that position.
    pub async fn remove_at(&self, chat_id: i64, position: i64) -> Result<bool, DbError> {
        self.run_tx(|tx| {
            Box::pin(async move {
                let res = sqlx::query(
                    "DELETE FROM queue_item
                     WHERE chat_id = ? AND played = 0 AND position = ?",
                )
                .bind(chat_id)
                .bind(position)
                .execute(&mut **tx)
                .await?;

                if res.rows_affected() == 0 {
                    return Ok(false);
                }

                sqlx::query(
                    "UPDATE queue_item SET position = position - 1
                     WHERE chat_id = ? AND played = 0 AND position > ?",
                )
                .bind(chat_id)
                .bind(position)
                .execute(&mut **tx)
                .await?;

                Ok(true)
            })
        })
        .await
    }

    /// Deletes all items for the chat, played or not. Returns the number
    /// removed.
    pub async fn clear(&self, chat_id: i64) -> Result<u64, DbError> {
        let mut con = self.db.acquire().await?;
        let res = sqlx::query("DELETE FROM queue_item WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *con)
            .await?;
        let removed = res.rows_affected();
        info!("Cleared queue for chat {chat_id}, removed {removed} items");
        Ok(removed)
    }

    /// The most recently played item for the chat, if any.
    pub async fn current(&self, chat_id: i64) -> Result<Option<QueueItem>, DbError> {
        let mut con = self.db.acquire().await?;
        let item = sqlx::query_as(
            "SELECT * FROM queue_item
             WHERE chat_id = ? AND played = 1
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .bind(chat_id)
        .fetch_optional(&mut *con)
        .await?;
        Ok(item)
    }

    /// Records where an item's acquired audio lives on disk. Set once
    /// acquisition completes so cleanup can find the file later.
    pub async fn set_local_path(&self, item_id: &str, local_path: &str) -> Result<(), DbError> {
        let mut con = self.db.acquire().await?;
        sqlx::query("UPDATE queue_item SET local_path = ? WHERE item_id = ?")
            .bind(local_path)
            .bind(item_id)
            .execute(&mut *con)
            .await?;
        Ok(())
    }

    /// Drops an item's recorded audio path after the file is deleted.
    pub async fn clear_local_path(&self, item_id: &str) -> Result<(), DbError> {
        let mut con = self.db.acquire().await?;
        sqlx::query("UPDATE queue_item SET local_path = NULL WHERE item_id = ?")
            .bind(item_id)
            .execute(&mut *con)
            .await?;
        Ok(())
    }

    /// Count of unplayed items for the chat.
    pub async fn length(&self, chat_id: i64) -> Result<i64, DbError> {
        let mut con = self.db.acquire().await?;
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM queue_item WHERE chat_id = ? AND played = 0")
                .bind(chat_id)
                .fetch_one(&mut *con)
                .await?;
        Ok(count)
    }

    /// Relocates the unplayed item at `from_position` to `to_position`,
    /// shifting the items in between by one. `to_position` is clamped to the
    /// backlog bounds. Returns false if `from_position` doesn't exist.
    pub async fn move_item(
        &self,
        chat_id: i64,
        from_position: i64,
        to_position: i64,
    ) -> Result<bool, DbError> {
        self.run_tx(|tx| {
            Box::pin(async move {
                let item: Option<(String,)> = sqlx::query_as(
                    "SELECT item_id FROM queue_item
                     WHERE chat_id = ? AND played = 0 AND position = ?",
                )
                .bind(chat_id)
                .bind(from_position)
                .fetch_optional(&mut **tx)
                .await?;

                let Some((item_id,)) = item else {
                    return Ok(false);
                };

                let (count,): (i64,) = sqlx::query_as(
                    "SELECT COUNT(*) FROM queue_item WHERE chat_id = ? AND played = 0",
                )
                .bind(chat_id)
                .fetch_one(&mut **tx)
                .await?;
                let to_position = to_position.clamp(1, count);

                if to_position > from_position {
                    sqlx::query(
                        "UPDATE queue_item SET position = position - 1
                         WHERE chat_id = ? AND played = 0 AND position > ? AND position <= ?",
                    )
                    .bind(chat_id)
                    .bind(from_position)
                    .bind(to_position)
                    .execute(&mut **tx)
                    .await?;
                } else if to_position < from_position {
                    sqlx::query(
                        "UPDATE queue_item SET position = position + 1
                         WHERE chat_id = ? AND played = 0 AND position >= ? AND position < ?",
                    )
                    .bind(chat_id)
                    .bind(to_position)
                    .bind(from_position)
                    .execute(&mut **tx)
                    .await?;
                }

                sqlx::query("UPDATE queue_item SET position = ? WHERE item_id = ?")
                    .bind(to_position)
                    .bind(item_id.as_str())
                    .execute(&mut **tx)
                    .await?;

                Ok(true)
            })
        })
        .await
    }

    /// Assigns a uniformly random permutation of `1..=N` to the unplayed
    /// items. Returns false if the backlog is empty.
    pub async fn shuffle(&self, chat_id: i64) -> Result<bool, DbError> {
        self.run_tx(|tx| {
            Box::pin(async move {
                let ids: Vec<(String,)> = sqlx::query_as(
                    "SELECT item_id FROM queue_item
                     WHERE chat_id = ? AND played = 0 ORDER BY position",
                )
                .bind(chat_id)
                .fetch_all(&mut **tx)
                .await?;

                if ids.is_empty() {
                    return Ok(false);
                }

                let mut positions: Vec<i64> = (1..=ids.len() as i64).collect();
                positions.shuffle(&mut rand::thread_rng());

                for ((item_id,), position) in ids.iter().zip(positions) {
                    sqlx::query("UPDATE queue_item SET position = ? WHERE item_id = ?")
                        .bind(position)
                        .bind(item_id.as_str())
                        .execute(&mut **tx)
                        .await?;
                }

                Ok(true)
            })
        })
        .await
    }

    /// Most recently played items, newest first, truncated to `limit`.
    pub async fn history(&self, chat_id: i64, limit: i64) -> Result<Vec<QueueItem>, DbError> {
        let mut con = self.db.acquire().await?;
        let items = sqlx::query_as(
            "SELECT * FROM queue_item
             WHERE chat_id = ? AND played = 1
             ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(chat_id)
        .bind(limit)
        .fetch_all(&mut *con)
        .await?;
        Ok(items)
    }

    /// Re-inserts a finished item as a fresh unplayed row at the front or
    /// back of the backlog. Used by the loop modes. Returns the assigned
    /// position.
    pub async fn requeue(&self, item: &QueueItem, placement: Placement) -> Result<i64, DbError> {
        let item_id = Uuid::new_v4().to_string();
        let requested_at = now_millis();

        self.run_tx(|tx| {
            let item = item.clone();
            let item_id = item_id.clone();
            Box::pin(async move {
                let position = match placement {
                    Placement::Front => {
                        sqlx::query(
                            "UPDATE queue_item SET position = position + 1
                             WHERE chat_id = ? AND played = 0",
                        )
                        .bind(item.chat_id)
                        .execute(&mut **tx)
                        .await?;
                        1
                    }
                    Placement::Back => {
                        let (count,): (i64,) = sqlx::query_as(
                            "SELECT COUNT(*) FROM queue_item WHERE chat_id = ? AND played = 0",
                        )
                        .bind(item.chat_id)
                        .fetch_one(&mut **tx)
                        .await?;
                        count + 1
                    }
                };

                sqlx::query(
                    "INSERT INTO queue_item
                     (item_id, chat_id, requester_id, kind, title, source_locator,
                      local_path, thumbnail, duration_seconds, is_live, played,
                      position, requested_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
                )
                .bind(item_id)
                .bind(item.chat_id)
                .bind(item.requester_id)
                .bind(item.kind)
                .bind(item.title.as_str())
                .bind(item.source_locator.as_deref())
                .bind(item.local_path.as_deref())
                .bind(item.thumbnail.as_deref())
                .bind(item.duration_seconds)
                .bind(item.is_live)
                .bind(position)
                .bind(requested_at)
                .execute(&mut **tx)
                .await?;

                Ok(position)
            })
        })
        .await
    }

    /// Current position of an unplayed item, if it is still pending.
    pub async fn position_of(&self, chat_id: i64, item_id: &str) -> Result<Option<i64>, DbError> {
        let mut con = self.db.acquire().await?;
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT position FROM queue_item
             WHERE chat_id = ? AND item_id = ? AND played = 0",
        )
        .bind(chat_id)
        .bind(item_id)
        .fetch_optional(&mut *con)
        .await?;
        Ok(row.map(|(p,)| p))
    }

    /// Maintenance sweep: deletes played rows whose `started_at` is older
    /// than `cutoff_millis`. Scheduling is up to the caller.
    pub async fn purge_played_before(&self, cutoff_millis: i64) -> Result<u64, DbError> {
        let mut con = self.db.acquire().await?;
        let res = sqlx::query("DELETE FROM queue_item WHERE played = 1 AND started_at < ?")
            .bind(cutoff_millis)
            .execute(&mut *con)
            .await?;
        Ok(res.rows_affected())
    }
}

fn is_contention(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if {
        let msg = db.message();
        msg.contains("locked") || msg.contains("busy")
    })
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
#[path = "./queue_store_test.rs"]
mod queue_store_test;
