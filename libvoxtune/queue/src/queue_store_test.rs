use std::collections::HashSet;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::{tempdir, TempDir};

use super::{Placement, QueueStore};
use crate::database::Database;
use crate::queue_item::{ItemKind, NewQueueItem};

#[ctor::ctor]
fn init() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();
}

async fn setup() -> (TempDir, QueueStore) {
    let temp = tempdir().unwrap();
    let db = Database::connect(temp.path().join("voxtune.db"), true)
        .await
        .unwrap();
    db.migrate().await.unwrap();
    (temp, QueueStore::new(&db))
}

fn item(chat_id: i64, title: &str) -> NewQueueItem {
    NewQueueItem::new(chat_id, 1, ItemKind::RemoteSearch, title)
        .source_locator(format!("https://example.com/{title}"))
}

async fn pending_titles(store: &QueueStore, chat_id: i64) -> Vec<String> {
    let items = store.list_pending(chat_id).await.unwrap();
    let positions: Vec<i64> = items.iter().map(|i| i.position.unwrap()).collect();
    let expected: Vec<i64> = (1..=items.len() as i64).collect();
    assert_eq!(expected, positions, "positional invariant violated");
    items.into_iter().map(|i| i.title).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_enqueue_assigns_contiguous_positions() {
    let (_temp, store) = setup().await;

    assert_eq!(1, store.enqueue(&item(1, "a")).await.unwrap());
    assert_eq!(2, store.enqueue(&item(1, "b")).await.unwrap());
    assert_eq!(3, store.enqueue(&item(1, "c")).await.unwrap());
    // a different chat gets its own numbering
    assert_eq!(1, store.enqueue(&item(2, "x")).await.unwrap());

    assert_eq!(vec!["a", "b", "c"], pending_titles(&store, 1).await);
    assert_eq!(3, store.length(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_enqueue_empty_title_gets_placeholder() {
    let (_temp, store) = setup().await;

    store.enqueue(&item(1, "  ")).await.unwrap();
    assert_eq!(vec!["Unknown track"], pending_titles(&store, 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_pop_next_fifo_and_renumbers() {
    let (_temp, store) = setup().await;

    for title in ["a", "b", "c"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }

    let first = store.pop_next(1).await.unwrap().unwrap();
    assert_eq!("a", first.title);
    assert!(first.played);
    assert!(first.started_at.is_some());
    assert_eq!(None, first.position);
    assert_eq!(vec!["b", "c"], pending_titles(&store, 1).await);

    let second = store.pop_next(1).await.unwrap().unwrap();
    assert_eq!("b", second.title);
    let third = store.pop_next(1).await.unwrap().unwrap();
    assert_eq!("c", third.title);
    assert_eq!(None, store.pop_next(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_pop_next_returns_unique_items() {
    let (_temp, store) = setup().await;

    for i in 0..8 {
        store.enqueue(&item(1, &format!("song{i}"))).await.unwrap();
    }

    let mut handles = vec![];
    for _ in 0..2 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let mut popped = vec![];
            while let Some(item) = store.pop_next(1).await.unwrap() {
                popped.push(item.item_id);
            }
            popped
        }));
    }

    let mut all = vec![];
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    let unique: HashSet<&String> = all.iter().collect();
    assert_eq!(8, all.len());
    assert_eq!(8, unique.len());
    assert_eq!(0, store.length(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_remove_at_renumbers() {
    let (_temp, store) = setup().await;

    for title in ["a", "b", "c"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }

    assert!(store.remove_at(1, 2).await.unwrap());
    assert_eq!(vec!["a", "c"], pending_titles(&store, 1).await);

    assert!(!store.remove_at(1, 5).await.unwrap());
    assert_eq!(vec!["a", "c"], pending_titles(&store, 1).await);
}

#[rstest]
#[case(1, 3, vec!["b", "c", "a"])]
#[case(3, 1, vec!["c", "a", "b"])]
#[case(2, 2, vec!["a", "b", "c"])]
#[case(1, 99, vec!["b", "c", "a"])]
#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_move_item(#[case] from: i64, #[case] to: i64, #[case] expected: Vec<&str>) {
    let (_temp, store) = setup().await;

    for title in ["a", "b", "c"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }

    assert!(store.move_item(1, from, to).await.unwrap());
    assert_eq!(expected, pending_titles(&store, 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_move_item_missing_position() {
    let (_temp, store) = setup().await;

    store.enqueue(&item(1, "a")).await.unwrap();
    assert!(!store.move_item(1, 2, 1).await.unwrap());
    assert_eq!(vec!["a"], pending_titles(&store, 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_shuffle_preserves_position_set() {
    let (_temp, store) = setup().await;

    assert!(!store.shuffle(1).await.unwrap());

    let mut ids = HashSet::new();
    for i in 0..5 {
        store.enqueue(&item(1, &format!("song{i}"))).await.unwrap();
    }
    for item in store.list_pending(1).await.unwrap() {
        ids.insert(item.item_id);
    }

    assert!(store.shuffle(1).await.unwrap());

    let shuffled = store.list_pending(1).await.unwrap();
    let positions: Vec<i64> = shuffled.iter().map(|i| i.position.unwrap()).collect();
    assert_eq!(vec![1, 2, 3, 4, 5], positions);
    let shuffled_ids: HashSet<String> = shuffled.into_iter().map(|i| i.item_id).collect();
    assert_eq!(ids, shuffled_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_requeue_front_and_back() {
    let (_temp, store) = setup().await;

    for title in ["a", "b"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }
    let played = store.pop_next(1).await.unwrap().unwrap();

    assert_eq!(1, store.requeue(&played, Placement::Front).await.unwrap());
    assert_eq!(vec!["a", "b"], pending_titles(&store, 1).await);

    let played = store.pop_next(1).await.unwrap().unwrap();
    assert_eq!(2, store.requeue(&played, Placement::Back).await.unwrap());
    assert_eq!(vec!["b", "a"], pending_titles(&store, 1).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_current_and_history() {
    let (_temp, store) = setup().await;

    assert_eq!(None, store.current(1).await.unwrap());

    for title in ["a", "b", "c"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }
    for _ in 0..3 {
        store.pop_next(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let current = store.current(1).await.unwrap().unwrap();
    assert_eq!("c", current.title);

    let history = store.history(1, 2).await.unwrap();
    let titles: Vec<&str> = history.iter().map(|i| i.title.as_str()).collect();
    assert_eq!(vec!["c", "b"], titles);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_clear_removes_played_and_unplayed() {
    let (_temp, store) = setup().await;

    for title in ["a", "b", "c"] {
        store.enqueue(&item(1, title)).await.unwrap();
    }
    store.pop_next(1).await.unwrap();

    assert_eq!(3, store.clear(1).await.unwrap());
    assert_eq!(0, store.length(1).await.unwrap());
    assert_eq!(None, store.current(1).await.unwrap());
    assert_eq!(0, store.clear(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_position_of() {
    let (_temp, store) = setup().await;

    store.enqueue(&item(1, "a")).await.unwrap();
    store.enqueue(&item(1, "b")).await.unwrap();

    let second = &store.list_pending(1).await.unwrap()[1];
    assert_eq!(
        Some(2),
        store.position_of(1, &second.item_id).await.unwrap()
    );
    assert_eq!(None, store.position_of(1, "missing").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_purge_played_before() {
    let (_temp, store) = setup().await;

    store.enqueue(&item(1, "a")).await.unwrap();
    store.enqueue(&item(1, "b")).await.unwrap();
    let played = store.pop_next(1).await.unwrap().unwrap();

    let cutoff = played.started_at.unwrap() + 1;
    assert_eq!(1, store.purge_played_before(cutoff).await.unwrap());
    // unplayed rows are untouched
    assert_eq!(1, store.length(1).await.unwrap());
    assert_eq!(None, store.current(1).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_set_and_clear_local_path() {
    let (_temp, store) = setup().await;

    store.enqueue(&item(1, "a")).await.unwrap();
    let played = store.pop_next(1).await.unwrap().unwrap();
    assert_eq!(None, played.local_path);

    store
        .set_local_path(&played.item_id, "/tmp/a.mp3")
        .await
        .unwrap();
    let current = store.current(1).await.unwrap().unwrap();
    assert_eq!(Some("/tmp/a.mp3".to_owned()), current.local_path);

    store.clear_local_path(&played.item_id).await.unwrap();
    let current = store.current(1).await.unwrap().unwrap();
    assert_eq!(None, current.local_path);
}
