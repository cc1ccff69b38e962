//! End-to-end lifecycle behavior on the in-memory backend: enqueue,
//! delivery, acknowledgement, requeue counting, bounded overflow.

use std::sync::Arc;

use baton_core::{InMemoryConfig, InMemoryQueue, ManualClock, Message, Queue};

fn queue() -> InMemoryQueue {
    InMemoryQueue::new(InMemoryConfig::default()).unwrap()
}

fn bounded(boundary: usize) -> InMemoryQueue {
    InMemoryQueue::new(InMemoryConfig {
        boundary: Some(boundary),
        ..InMemoryConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn basic_roundtrip_queue_take_finish() {
    let queue = queue();
    assert!(queue.queue(&Message::with_id(1, b"A".to_vec())).await.unwrap());

    let delivered = queue.take().await.unwrap().unwrap();
    assert_eq!(delivered.id, 1);
    assert_eq!(delivered.payload, b"A");
    assert_eq!(delivered.requeue_count, 0);

    queue.finish(&delivered).await.unwrap();
    assert!(queue.take().await.unwrap().is_none());
    assert_eq!(queue.queue_size().await, 0);
    assert_eq!(queue.ephemeral_size().await, 0);
}

#[tokio::test]
async fn delivery_preserves_identity_and_enqueue_time() {
    let clock = ManualClock::new(50_000);
    let queue =
        InMemoryQueue::with_clock(InMemoryConfig::default(), Arc::new(clock.clone())).unwrap();

    queue.queue(&Message::with_id(7, b"payload".to_vec())).await.unwrap();
    clock.advance(1_234);

    let delivered = queue.take().await.unwrap().unwrap();
    assert_eq!(delivered.id, 7);
    assert_eq!(delivered.payload, b"payload");
    assert_eq!(delivered.enqueued_at, 50_000, "first enqueue time sticks");
    assert_eq!(delivered.updated_at, 50_000);
}

#[tokio::test]
async fn visible_requeue_increments_counter() {
    let queue = queue();
    queue.queue(&Message::with_id(2, b"retry me".to_vec())).await.unwrap();

    let first = queue.take().await.unwrap().unwrap();
    assert_eq!(first.requeue_count, 0);
    assert!(queue.requeue(&first).await.unwrap());

    let second = queue.take().await.unwrap().unwrap();
    assert_eq!(second.requeue_count, 1);
    // The reference we requeued from is untouched.
    assert_eq!(first.requeue_count, 0);
}

#[tokio::test]
async fn silent_requeue_preserves_counter_and_timestamps() {
    let clock = ManualClock::new(10_000);
    let queue =
        InMemoryQueue::with_clock(InMemoryConfig::default(), Arc::new(clock.clone())).unwrap();
    queue.queue(&Message::with_id(2, vec![])).await.unwrap();

    let first = queue.take().await.unwrap().unwrap();
    queue.requeue(&first).await.unwrap();
    let second = queue.take().await.unwrap().unwrap();
    assert_eq!(second.requeue_count, 1);
    let requeued_at = second.updated_at;

    clock.advance(5_000);
    queue.requeue_silent(&second).await.unwrap();
    let third = queue.take().await.unwrap().unwrap();
    assert_eq!(third.requeue_count, 1, "silent requeue must not count");
    assert_eq!(third.updated_at, requeued_at, "silent requeue must not restamp");
}

#[tokio::test]
async fn counter_tracks_visible_requeues_exactly() {
    let queue = queue();
    queue.queue(&Message::with_id(5, vec![])).await.unwrap();

    for expected in 0..4u32 {
        let delivered = queue.take().await.unwrap().unwrap();
        assert_eq!(delivered.requeue_count, expected);
        queue.requeue(&delivered).await.unwrap();
    }
    let last = queue.take().await.unwrap().unwrap();
    assert_eq!(last.requeue_count, 4);
}

#[tokio::test]
async fn caller_mutations_after_queue_are_invisible() {
    let queue = queue();
    let mut msg = Message::with_id(3, b"original".to_vec());
    queue.queue(&msg).await.unwrap();

    msg.payload = b"tampered".to_vec();
    msg.requeue_count = 99;

    let delivered = queue.take().await.unwrap().unwrap();
    assert_eq!(delivered.payload, b"original");
    assert_eq!(delivered.requeue_count, 0);
}

#[tokio::test]
async fn finish_is_idempotent() {
    let queue = queue();
    queue.queue(&Message::with_id(4, vec![])).await.unwrap();
    let delivered = queue.take().await.unwrap().unwrap();

    queue.finish(&delivered).await.unwrap();
    queue.finish(&delivered).await.unwrap();

    // Finishing an id that was never taken is a no-op too.
    queue.finish(&Message::with_id(12_345, vec![])).await.unwrap();
    assert_eq!(queue.ephemeral_size().await, 0);
}

#[tokio::test]
async fn takes_follow_insertion_order() {
    let queue = queue();
    for id in 1..=5u64 {
        queue.queue(&Message::with_id(id, vec![])).await.unwrap();
    }
    for expected in 1..=5u64 {
        assert_eq!(queue.take().await.unwrap().unwrap().id, expected);
    }
}

#[tokio::test]
async fn takes_follow_insertion_order_when_bounded() {
    let queue = bounded(8);
    for id in 1..=8u64 {
        queue.queue(&Message::with_id(id, vec![])).await.unwrap();
    }
    for expected in 1..=8u64 {
        assert_eq!(queue.take().await.unwrap().unwrap().id, expected);
    }
}

#[tokio::test]
async fn bounded_queue_rejects_overflow() {
    let queue = bounded(2);
    assert!(queue.queue(&Message::with_id(1, b"a".to_vec())).await.unwrap());
    assert!(queue.queue(&Message::with_id(2, b"b".to_vec())).await.unwrap());
    assert!(!queue.queue(&Message::with_id(3, b"c".to_vec())).await.unwrap());
    assert_eq!(queue.queue_size().await, 2);

    // Draining one slot makes room again.
    let delivered = queue.take().await.unwrap().unwrap();
    queue.finish(&delivered).await.unwrap();
    assert!(queue.queue(&Message::with_id(3, b"c".to_vec())).await.unwrap());
}

#[tokio::test]
async fn requeue_via_dyn_queue_trait_object() {
    // The contract is object-safe; exercise it through Arc<dyn Queue>.
    let queue: Arc<dyn Queue> = Arc::new(queue());
    queue.queue(&Message::with_id(1, b"x".to_vec())).await.unwrap();
    let delivered = queue.take().await.unwrap().unwrap();
    queue.requeue(&delivered).await.unwrap();
    assert_eq!(queue.take().await.unwrap().unwrap().requeue_count, 1);
}
