mod common;

use eventbuf::{EventQueue, InMemoryQueue, QueueError};

#[tokio::test]
async fn peek_then_consume_scenario() {
    common::init_logging();
    let queue = InMemoryQueue::new(3);

    queue.add("A").await.unwrap();
    queue.add("B").await.unwrap();
    queue.add("C").await.unwrap();

    assert_eq!(queue.get(2).await.unwrap(), vec!["A", "B"]);
    assert_eq!(queue.size(), 3);

    let removed: Vec<&str> = queue
        .remove(1)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(removed, vec!["A"]);
    assert_eq!(queue.size(), 2);

    assert_eq!(queue.get(2).await.unwrap(), vec!["B", "C"]);
}

#[tokio::test]
async fn get_is_a_stable_peek() {
    common::init_logging();
    let queue = InMemoryQueue::new(8);
    for i in 0..4 {
        queue.add(i).await.unwrap();
    }

    let first = queue.get(3).await.unwrap();
    let second = queue.get(3).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(queue.size(), 4);
}

#[tokio::test]
async fn removed_entries_never_reappear() {
    common::init_logging();
    let queue = InMemoryQueue::new(8);
    for i in 0..6 {
        queue.add(i).await.unwrap();
    }

    let removed: Vec<i32> = queue
        .remove(2)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(removed, vec![0, 1]);
    assert_eq!(queue.size(), 4);
    assert_eq!(queue.get(6).await.unwrap(), vec![2, 3, 4, 5]);
}

#[tokio::test]
async fn add_beyond_capacity_is_rejected() {
    common::init_logging();
    let queue = InMemoryQueue::new(2);
    queue.add("a").await.unwrap();
    queue.add("b").await.unwrap();

    let err = queue.add("c").await.unwrap_err();
    assert!(matches!(err, QueueError::QueueFull));
    assert_eq!(queue.size(), 2);

    // Removing frees a slot again.
    queue.remove(1).await;
    queue.add("c").await.unwrap();
    assert_eq!(queue.get(2).await.unwrap(), vec!["b", "c"]);
}

#[tokio::test]
async fn remove_never_returns_more_than_present() {
    common::init_logging();
    let queue: InMemoryQueue<u8> = InMemoryQueue::new(4);
    queue.add(1).await.unwrap();
    assert_eq!(queue.remove(10).await.len(), 1);
    assert!(queue.remove(10).await.is_empty());
    assert_eq!(queue.size(), 0);
}
